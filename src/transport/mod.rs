//! Duplex WebSocket link between client and server
//!
//! - `client`: persistent connection with reconnect, backoff and heartbeat
//! - `server`: single-client listener
//! - `protocol`: JSON control messages; audio travels as binary frames

mod backoff;
mod client;
mod protocol;
mod server;

pub use backoff::Backoff;
pub use client::{ConnectionStatus, TransportClient, TransportEvent};
pub use protocol::ControlMessage;
pub use server::{LinkEvent, LinkHandle, LinkServer};

pub use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
