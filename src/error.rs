//! Error types shared across the client and server halves

use thiserror::Error;

/// Result type alias for library operations
pub type Result<T> = std::result::Result<T, Error>;

/// Failures opening, driving or closing the audio device
#[derive(Debug, Error)]
pub enum AudioError {
    #[error("no {0} device available")]
    NoDevice(&'static str),

    #[error("audio device '{0}' not found")]
    DeviceNotFound(String),

    #[error("failed to open {kind} stream: {reason}")]
    StreamOpen { kind: &'static str, reason: String },

    #[error("audio stream error: {0}")]
    Stream(String),

    #[error("audio backend unavailable: {0}")]
    Unavailable(String),
}

/// Failures on the duplex connection
///
/// These never escape the reconnection loop as fatal errors; callers of the
/// send methods get them back so they can decide whether to care.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection closed")]
    Closed,

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures loading, validating or persisting configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown configuration key: {0}")]
    UnknownKey(String),

    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },

    #[error("missing required setting: {0}")]
    Missing(&'static str),

    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed override file: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Failures reported by the LLM or TTS services
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("failed to open session: {0}")]
    Connect(String),

    #[error("session closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
}

/// Crate-level error
#[derive(Debug, Error)]
pub enum Error {
    #[error("audio error: {0}")]
    Audio(#[from] AudioError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
