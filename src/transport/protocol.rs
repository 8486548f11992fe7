//! Wire protocol between client and server
//!
//! Text frames carry JSON control messages tagged by `type`. Binary frames
//! carry raw 16 kHz s16le mono PCM in both directions.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Control messages exchanged over the duplex connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlMessage {
    /// Client → server: user activated, start a conversation
    HotwordDetected,

    /// Client → server: response audio fully played
    PlaybackComplete,

    /// Server → client: response audio follows, mute the microphone
    StartOfTtsStream,

    /// Server → client: last response audio frame has been sent
    TtsStreamEnd,

    /// Server → client: conversation over, return to wake-word listening
    SessionEnd,
}

impl ControlMessage {
    pub fn to_json(self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self)
    }

    /// Parse a text frame; unknown or malformed messages are logged and dropped
    pub fn parse(text: &str) -> Option<Self> {
        match serde_json::from_str(text) {
            Ok(message) => Some(message),
            Err(e) => {
                warn!(error = %e, payload = %truncate(text, 120), "dropping unrecognised control message");
                None
            }
        }
    }
}

impl std::fmt::Display for ControlMessage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlMessage::HotwordDetected => write!(f, "hotword_detected"),
            ControlMessage::PlaybackComplete => write!(f, "playback_complete"),
            ControlMessage::StartOfTtsStream => write!(f, "start_of_tts_stream"),
            ControlMessage::TtsStreamEnd => write!(f, "tts_stream_end"),
            ControlMessage::SessionEnd => write!(f, "session_end"),
        }
    }
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
