//! In-memory audio device for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use super::device::{AudioDevice, FrameSink, InputStream, OutputStream};
use crate::error::AudioError;

#[derive(Default)]
struct Shared {
    open_inputs: AtomicUsize,
    max_concurrent: AtomicUsize,
    total_opens: AtomicUsize,
    fail_inputs: AtomicUsize,
    fail_output: AtomicBool,
    drain_calls: AtomicUsize,
    played: Mutex<Vec<Vec<u8>>>,
    sink: Mutex<Option<FrameSink>>,
}

/// Records every stream it hands out; frames are injected by the test
#[derive(Clone, Default)]
pub struct FakeDevice {
    shared: Arc<Shared>,
    write_delay: Duration,
    drain_delay: Duration,
}

impl FakeDevice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_write_delay(mut self, delay: Duration) -> Self {
        self.write_delay = delay;
        self
    }

    pub fn with_drain_delay(mut self, delay: Duration) -> Self {
        self.drain_delay = delay;
        self
    }

    pub fn fail_next_input(&self) {
        self.fail_inputs(1);
    }

    /// Fail the next `count` input opens
    pub fn fail_inputs(&self, count: usize) {
        self.shared.fail_inputs.store(count, Ordering::SeqCst);
    }

    pub fn fail_next_output(&self) {
        self.shared.fail_output.store(true, Ordering::SeqCst);
    }

    /// Deliver a frame to whichever input stream is open
    pub fn inject(&self, frame: Vec<u8>) -> bool {
        let sink = self.shared.sink.lock().ok().and_then(|s| s.clone());
        sink.is_some_and(|sink| sink.push(frame))
    }

    pub fn open_inputs(&self) -> usize {
        self.shared.open_inputs.load(Ordering::SeqCst)
    }

    pub fn max_concurrent_inputs(&self) -> usize {
        self.shared.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn total_opens(&self) -> usize {
        self.shared.total_opens.load(Ordering::SeqCst)
    }

    pub fn played(&self) -> Vec<Vec<u8>> {
        self.shared.played.lock().map(|p| p.clone()).unwrap_or_default()
    }

    pub fn drain_calls(&self) -> usize {
        self.shared.drain_calls.load(Ordering::SeqCst)
    }
}

impl AudioDevice for FakeDevice {
    fn open_input(&self, sink: FrameSink) -> Result<Box<dyn InputStream>, AudioError> {
        let failing = self
            .shared
            .fail_inputs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AudioError::StreamOpen {
                kind: "input",
                reason: "injected failure".to_string(),
            });
        }

        let open = self.shared.open_inputs.fetch_add(1, Ordering::SeqCst) + 1;
        self.shared.max_concurrent.fetch_max(open, Ordering::SeqCst);
        self.shared.total_opens.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut slot) = self.shared.sink.lock() {
            *slot = Some(sink);
        }

        Ok(Box::new(FakeInput {
            shared: Arc::clone(&self.shared),
        }))
    }

    fn open_output(&self) -> Result<Box<dyn OutputStream>, AudioError> {
        if self.shared.fail_output.swap(false, Ordering::SeqCst) {
            return Err(AudioError::StreamOpen {
                kind: "output",
                reason: "injected failure".to_string(),
            });
        }

        Ok(Box::new(FakeOutput {
            shared: Arc::clone(&self.shared),
            write_delay: self.write_delay,
            drain_delay: self.drain_delay,
        }))
    }
}

struct FakeInput {
    shared: Arc<Shared>,
}

impl InputStream for FakeInput {
    fn close(self: Box<Self>) {
        if let Ok(mut slot) = self.shared.sink.lock() {
            *slot = None;
        }
        self.shared.open_inputs.fetch_sub(1, Ordering::SeqCst);
    }
}

struct FakeOutput {
    shared: Arc<Shared>,
    write_delay: Duration,
    drain_delay: Duration,
}

#[async_trait]
impl OutputStream for FakeOutput {
    async fn write(&mut self, pcm: &[u8]) -> Result<(), AudioError> {
        if !self.write_delay.is_zero() {
            tokio::time::sleep(self.write_delay).await;
        }
        if let Ok(mut played) = self.shared.played.lock() {
            played.push(pcm.to_vec());
        }
        Ok(())
    }

    async fn drain(&mut self) -> Result<(), AudioError> {
        if !self.drain_delay.is_zero() {
            tokio::time::sleep(self.drain_delay).await;
        }
        self.shared.drain_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
