//! Server-side conversation state and inactivity tracking

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use super::machine::{Lifecycle, StateMachine};

/// Brain-side view of the conversation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationState {
    /// Waiting for the client to signal activation
    #[default]
    Passive,
    /// Streaming user audio to the LLM
    Active,
    /// LLM is generating, microphone muted
    Processing,
    /// TTS is playing on the client, microphone muted
    Speaking,
}

impl Lifecycle for ConversationState {
    fn legal_next(self) -> &'static [Self] {
        use ConversationState::*;
        match self {
            Passive => &[Active],
            Active => &[Processing, Passive],
            Processing => &[Speaking, Active, Passive],
            Speaking => &[Active, Passive],
        }
    }

    fn all() -> &'static [Self] {
        use ConversationState::*;
        &[Passive, Active, Processing, Speaking]
    }
}

impl std::fmt::Display for ConversationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConversationState::Passive => write!(f, "passive"),
            ConversationState::Active => write!(f, "active"),
            ConversationState::Processing => write!(f, "processing"),
            ConversationState::Speaking => write!(f, "speaking"),
        }
    }
}

/// Conversation state plus the activity clock used for the inactivity timeout
pub struct ConversationManager {
    machine: StateMachine<ConversationState>,
    last_activity: Instant,
    timeout: Duration,
}

impl ConversationManager {
    pub fn new(timeout: Duration) -> Self {
        Self {
            machine: StateMachine::new(ConversationState::Passive),
            last_activity: Instant::now(),
            timeout,
        }
    }

    pub fn state(&self) -> ConversationState {
        self.machine.current()
    }

    /// Transition and, on success, refresh the activity clock
    pub fn transition_to(&mut self, target: ConversationState) -> bool {
        let moved = self.machine.transition_to(target);
        if moved {
            self.last_activity = Instant::now();
        }
        moved
    }

    /// Force the conversation back to `Passive` from wherever it is
    pub fn reset_to_passive(&mut self) -> bool {
        let moved = self.machine.walk_to(ConversationState::Passive);
        self.last_activity = Instant::now();
        moved
    }

    /// Record user speech or response progress
    pub fn update_activity(&mut self) {
        self.last_activity = Instant::now();
    }

    /// True once the conversation has been quiet for longer than the timeout
    pub fn is_timed_out(&self) -> bool {
        self.state() != ConversationState::Passive && self.last_activity.elapsed() > self.timeout
    }

    /// Only `Active` accepts user audio
    pub fn should_listen_for_speech(&self) -> bool {
        self.state() == ConversationState::Active
    }
}
