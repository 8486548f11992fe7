//! Device-side conversation states

use serde::{Deserialize, Serialize};

use super::machine::Lifecycle;
use crate::audio::RouteMode;

/// The lifecycle of one client instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClientState {
    /// No activity, startup default
    #[default]
    Idle,
    /// Microphone routed to the activation detector
    ListeningForHotword,
    /// Transient, immediately re-routed
    HotwordDetected,
    /// Session handshake in flight
    ConnectingToServer,
    /// Microphone streamed upstream
    ActiveSession,
    /// Microphone muted while the response plays
    ProcessingResponse,
}

impl ClientState {
    /// Where captured audio must go while in this state
    pub fn required_route(self) -> RouteMode {
        match self {
            ClientState::ListeningForHotword => RouteMode::Detector,
            ClientState::ActiveSession => RouteMode::Transport,
            ClientState::Idle
            | ClientState::HotwordDetected
            | ClientState::ConnectingToServer
            | ClientState::ProcessingResponse => RouteMode::Stopped,
        }
    }

    /// Whether a conversation is in progress
    pub fn in_session(self) -> bool {
        matches!(
            self,
            ClientState::ActiveSession | ClientState::ProcessingResponse
        )
    }
}

impl Lifecycle for ClientState {
    fn legal_next(self) -> &'static [Self] {
        use ClientState::*;
        match self {
            Idle => &[ListeningForHotword],
            ListeningForHotword => &[HotwordDetected, Idle],
            HotwordDetected => &[ConnectingToServer],
            ConnectingToServer => &[ActiveSession, ListeningForHotword],
            ActiveSession => &[ListeningForHotword, Idle, ProcessingResponse],
            ProcessingResponse => &[ActiveSession],
        }
    }

    fn all() -> &'static [Self] {
        use ClientState::*;
        &[
            Idle,
            ListeningForHotword,
            HotwordDetected,
            ConnectingToServer,
            ActiveSession,
            ProcessingResponse,
        ]
    }
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientState::Idle => write!(f, "IDLE"),
            ClientState::ListeningForHotword => write!(f, "LISTENING_FOR_HOTWORD"),
            ClientState::HotwordDetected => write!(f, "HOTWORD_DETECTED"),
            ClientState::ConnectingToServer => write!(f, "CONNECTING_TO_SERVER"),
            ClientState::ActiveSession => write!(f, "ACTIVE_SESSION"),
            ClientState::ProcessingResponse => write!(f, "PROCESSING_RESPONSE"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_idle() {
        assert_eq!(ClientState::default(), ClientState::Idle);
    }

    #[test]
    fn test_route_requirements() {
        assert_eq!(
            ClientState::ListeningForHotword.required_route(),
            RouteMode::Detector
        );
        assert_eq!(ClientState::ActiveSession.required_route(), RouteMode::Transport);
        assert_eq!(ClientState::ProcessingResponse.required_route(), RouteMode::Stopped);
        assert_eq!(ClientState::Idle.required_route(), RouteMode::Stopped);
    }

    #[test]
    fn test_processing_only_returns_to_active() {
        assert_eq!(
            ClientState::ProcessingResponse.legal_next(),
            &[ClientState::ActiveSession]
        );
    }
}
