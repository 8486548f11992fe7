//! State machine module for conversation lifecycles
//!
//! Provides one table-driven machine used by both halves:
//! - Client: Idle, ListeningForHotword, HotwordDetected, ConnectingToServer,
//!   ActiveSession, ProcessingResponse
//! - Server: Passive, Active, Processing, Speaking (plus the inactivity clock)

mod client;
mod conversation;
mod machine;

pub use client::ClientState;
pub use conversation::{ConversationManager, ConversationState};
pub use machine::{Lifecycle, StateMachine};
