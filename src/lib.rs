//! tars-link: session orchestration and persistent transport for a split
//! voice assistant
//!
//! The client half listens for a wake phrase (or a button press), streams
//! the user's speech upstream and plays the spoken reply. The server half
//! runs the conversation against a streaming language model and speech
//! synthesis service. Both share one duplex WebSocket that outlives any
//! number of conversation sessions.

pub mod assistant;
pub mod audio;
pub mod button;
pub mod config;
pub mod error;
pub mod events;
pub mod hotword;
pub mod lifecycle;
pub mod session;
pub mod sounds;
pub mod state;
pub mod transport;

pub use error::{Error, Result};
