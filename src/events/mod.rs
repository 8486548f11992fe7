//! Events feeding the client orchestrator and the notifications it publishes
//!
//! Input threads (button, drain waiters) never touch session state directly.
//! They post a [`ClientEvent`] and the event loop applies it.

use serde::{Deserialize, Serialize};

use crate::state::ClientState;

/// What triggered an activation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivationSource {
    Hotword,
    Button,
}

/// Events posted into the client event loop
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    /// Wake phrase or button press
    Activation { source: ActivationSource },

    /// Response audio finished playing
    PlaybackDrained {
        /// Session the response belonged to
        session: u64,
    },

    /// Post-session audio finished playing
    SessionEndDrained { session: u64 },
}

impl std::fmt::Display for ClientEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientEvent::Activation { source } => write!(f, "ACTIVATION ({source:?})"),
            ClientEvent::PlaybackDrained { session } => {
                write!(f, "PLAYBACK_DRAINED (session {session})")
            }
            ClientEvent::SessionEndDrained { session } => {
                write!(f, "SESSION_END_DRAINED (session {session})")
            }
        }
    }
}

/// Published to observers on every client state change
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChanged {
    pub from: ClientState,
    pub to: ClientState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = ClientEvent::Activation {
            source: ActivationSource::Button,
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"activation\""));
        assert!(json.contains("button"));
    }

    #[test]
    fn test_state_change_uses_wire_names() {
        let change = StateChanged {
            from: ClientState::ListeningForHotword,
            to: ClientState::HotwordDetected,
        };
        let json = serde_json::to_string(&change).unwrap();
        assert!(json.contains("LISTENING_FOR_HOTWORD"));
        assert!(json.contains("HOTWORD_DETECTED"));
    }
}
