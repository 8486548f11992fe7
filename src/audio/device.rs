//! Device abstraction consumed by the router and the playback queue
//!
//! Driver callbacks run on a thread the OS owns. The only thing they may
//! touch is a [`FrameSink`], which hands frames to the event loop through a
//! bounded channel and never blocks the callback.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::AudioError;

/// Thread-safe hand-off from the capture callback into the event loop
#[derive(Clone)]
pub struct FrameSink {
    tx: mpsc::Sender<Vec<u8>>,
    dropped: Arc<AtomicU64>,
}

impl FrameSink {
    /// Create a sink and the receiver the loop reads from
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (
            Self {
                tx,
                dropped: Arc::new(AtomicU64::new(0)),
            },
            rx,
        )
    }

    /// Push one captured frame; drops it if the loop is behind
    ///
    /// Returns `false` once the receiving side is gone, which tells the
    /// driver its stream has been torn down.
    pub fn push(&self, frame: Vec<u8>) -> bool {
        match self.tx.try_send(frame) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                if dropped.is_power_of_two() {
                    warn!(dropped, "capture frames dropped, event loop is behind");
                }
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

/// A physical (or simulated) audio device
pub trait AudioDevice: Send + Sync {
    /// Start capturing; frames go to `sink` until the returned stream is closed
    fn open_input(&self, sink: FrameSink) -> Result<Box<dyn InputStream>, AudioError>;

    /// Open a playback stream
    fn open_output(&self) -> Result<Box<dyn OutputStream>, AudioError>;
}

/// A running capture stream
///
/// `Sync` so the router can be borrowed across awaits in a spawned loop.
pub trait InputStream: Send + Sync {
    /// Stop and close the stream; returns once the driver has released it
    fn close(self: Box<Self>);
}

/// A running playback stream
#[async_trait]
pub trait OutputStream: Send {
    /// Hand PCM bytes to the device, waiting if its buffer is full
    async fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError>;

    /// Wait until every buffered sample has been emitted
    async fn drain(&mut self) -> Result<(), AudioError>;
}
