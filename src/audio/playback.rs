//! Playback queue with a lazily started consumer and true drain tracking
//!
//! A chunk counts as pending from the moment `put` is called until the
//! output stream reports it has been emitted. `wait_for_drain` therefore
//! resolves only after the speaker has gone quiet, not when the queue
//! happens to be empty.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::device::{AudioDevice, OutputStream};

/// How long an idle consumer keeps the output stream open
const CONSUMER_IDLE: Duration = Duration::from_secs(5);

/// Capacity policy for queued PCM chunks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePolicy {
    /// Never blocks the producer
    Unbounded,
    /// Producer waits once this many chunks are queued
    Bounded(usize),
}

enum ChunkTx {
    Unbounded(mpsc::UnboundedSender<Vec<u8>>),
    Bounded(mpsc::Sender<Vec<u8>>),
}

enum ChunkRx {
    Unbounded(mpsc::UnboundedReceiver<Vec<u8>>),
    Bounded(mpsc::Receiver<Vec<u8>>),
}

impl ChunkRx {
    async fn recv(&mut self) -> Option<Vec<u8>> {
        match self {
            ChunkRx::Unbounded(rx) => rx.recv().await,
            ChunkRx::Bounded(rx) => rx.recv().await,
        }
    }

    fn try_recv(&mut self) -> Option<Vec<u8>> {
        match self {
            ChunkRx::Unbounded(rx) => rx.try_recv().ok(),
            ChunkRx::Bounded(rx) => rx.try_recv().ok(),
        }
    }
}

/// FIFO of PCM chunks feeding the output device
pub struct PlaybackQueue {
    device: Arc<dyn AudioDevice>,
    tx: ChunkTx,
    rx: Arc<tokio::sync::Mutex<ChunkRx>>,
    pending: Arc<watch::Sender<usize>>,
    consumer: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl PlaybackQueue {
    /// Create an idle queue; no output stream is opened until the first `put`
    pub fn new(device: Arc<dyn AudioDevice>, policy: QueuePolicy) -> Self {
        let (tx, rx) = match policy {
            QueuePolicy::Unbounded => {
                let (tx, rx) = mpsc::unbounded_channel();
                (ChunkTx::Unbounded(tx), ChunkRx::Unbounded(rx))
            }
            QueuePolicy::Bounded(capacity) => {
                let (tx, rx) = mpsc::channel(capacity.max(1));
                (ChunkTx::Bounded(tx), ChunkRx::Bounded(rx))
            }
        };

        let (pending, _) = watch::channel(0usize);

        Self {
            device,
            tx,
            rx: Arc::new(tokio::sync::Mutex::new(rx)),
            pending: Arc::new(pending),
            consumer: Arc::new(Mutex::new(None)),
        }
    }

    /// Enqueue a chunk, starting the consumer if it is not running
    ///
    /// With a bounded policy a full queue is logged and then waited on.
    pub async fn put(&self, chunk: Vec<u8>) {
        if chunk.is_empty() {
            return;
        }

        self.pending.send_modify(|n| *n += 1);
        self.ensure_consumer();

        let sent = match &self.tx {
            ChunkTx::Unbounded(tx) => tx.send(chunk).is_ok(),
            ChunkTx::Bounded(tx) => match tx.try_send(chunk) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(chunk)) => {
                    warn!("playback queue full, waiting for space");
                    tx.send(chunk).await.is_ok()
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            },
        };

        if !sent {
            self.pending.send_modify(|n| *n = n.saturating_sub(1));
        }
    }

    /// Chunks accepted but not yet emitted by the device
    pub fn pending(&self) -> usize {
        *self.pending.borrow()
    }

    /// Resolve once everything queued so far has been played
    pub async fn wait_for_drain(&self) {
        let mut rx = self.pending.subscribe();
        // The sender lives as long as self, so this only fails during teardown
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// A future that resolves on drain, detached from the queue's lifetime
    pub fn drained(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.pending.subscribe();
        async move {
            let _ = rx.wait_for(|n| *n == 0).await;
        }
    }

    /// Stop the consumer and forget anything still queued
    pub async fn shutdown(&self) {
        let handle = match self.consumer.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };

        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }

        let mut rx = self.rx.lock().await;
        while rx.try_recv().is_some() {}
        self.pending.send_replace(0);
    }

    fn ensure_consumer(&self) {
        let Ok(mut slot) = self.consumer.lock() else {
            error!("playback consumer slot poisoned");
            return;
        };

        let running = slot.as_ref().is_some_and(|handle| !handle.is_finished());
        if running {
            return;
        }

        debug!("starting playback consumer");
        let task = Consumer {
            device: Arc::clone(&self.device),
            rx: Arc::clone(&self.rx),
            pending: Arc::clone(&self.pending),
            slot: Arc::clone(&self.consumer),
        };
        *slot = Some(tokio::spawn(task.run()));
    }
}

struct Consumer {
    device: Arc<dyn AudioDevice>,
    rx: Arc<tokio::sync::Mutex<ChunkRx>>,
    pending: Arc<watch::Sender<usize>>,
    slot: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Consumer {
    async fn run(self) {
        let mut rx = self.rx.lock().await;
        let mut output: Option<Box<dyn OutputStream>> = None;
        let mut written = 0usize;

        loop {
            let chunk = if written > 0 {
                match rx.try_recv() {
                    Some(chunk) => chunk,
                    None => {
                        if let Some(stream) = output.as_mut() {
                            if let Err(e) = stream.drain().await {
                                warn!(error = %e, "output drain failed");
                            }
                        }
                        self.release(written);
                        written = 0;
                        continue;
                    }
                }
            } else {
                match tokio::time::timeout(CONSUMER_IDLE, rx.recv()).await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => return,
                    Err(_) => {
                        if self.try_retire() {
                            debug!("playback consumer idle, exiting");
                            return;
                        }
                        continue;
                    }
                }
            };

            if output.is_none() {
                match self.device.open_output() {
                    Ok(stream) => output = Some(stream),
                    Err(e) => {
                        let mut discarded = 1;
                        while rx.try_recv().is_some() {
                            discarded += 1;
                        }
                        error!(error = %e, discarded, "cannot open output, dropping queued audio");
                        self.release(discarded);
                        continue;
                    }
                }
            }

            if let Some(stream) = output.as_mut() {
                if let Err(e) = stream.write(&chunk).await {
                    error!(error = %e, "playback write failed");
                    output = None;
                }
            }
            written += 1;
        }
    }

    fn release(&self, count: usize) {
        self.pending.send_modify(|n| *n = n.saturating_sub(count));
    }

    /// Clear our slot if nothing is pending; a producer racing with us will
    /// then see an empty slot and start a fresh consumer
    fn try_retire(&self) -> bool {
        let Ok(mut slot) = self.slot.lock() else {
            return false;
        };
        if *self.pending.borrow() == 0 {
            *slot = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakeDevice;
    use tokio_test::{assert_pending, assert_ready};

    #[tokio::test(start_paused = true)]
    async fn test_drain_pending_until_device_finishes() {
        let device = Arc::new(
            FakeDevice::new()
                .with_write_delay(Duration::from_millis(10))
                .with_drain_delay(Duration::from_millis(50)),
        );
        let queue = PlaybackQueue::new(device.clone(), QueuePolicy::Unbounded);
        for i in 0..3u8 {
            queue.put(vec![i, 0]).await;
        }

        let mut drain = tokio_test::task::spawn(queue.wait_for_drain());
        assert_pending!(drain.poll());

        // Every chunk handed over, the device is still playing them out
        tokio::time::sleep(Duration::from_millis(35)).await;
        assert_eq!(device.played().len(), 3);
        assert_pending!(drain.poll());

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert_ready!(drain.poll());
        assert_eq!(queue.pending(), 0);
        assert_eq!(device.drain_calls(), 1);
    }

    #[tokio::test]
    async fn test_drain_waits_for_device() {
        let device = Arc::new(FakeDevice::new().with_drain_delay(Duration::from_millis(50)));
        let queue = PlaybackQueue::new(device.clone(), QueuePolicy::Unbounded);

        queue.put(vec![1, 2]).await;
        queue.put(vec![3, 4]).await;
        assert!(queue.pending() > 0);

        queue.wait_for_drain().await;
        assert_eq!(queue.pending(), 0);
        assert_eq!(device.played(), vec![vec![1, 2], vec![3, 4]]);
        assert!(device.drain_calls() >= 1);
    }

    #[tokio::test]
    async fn test_drain_on_empty_queue_is_immediate() {
        let queue = PlaybackQueue::new(Arc::new(FakeDevice::new()), QueuePolicy::Unbounded);
        tokio::time::timeout(Duration::from_millis(100), queue.wait_for_drain())
            .await
            .expect("drain on an empty queue should not block");
    }

    #[tokio::test]
    async fn test_bounded_put_blocks_until_consumed() {
        let device = Arc::new(FakeDevice::new().with_write_delay(Duration::from_millis(10)));
        let queue = PlaybackQueue::new(device.clone(), QueuePolicy::Bounded(1));

        for i in 0..5u8 {
            queue.put(vec![i, i]).await;
        }
        queue.wait_for_drain().await;

        assert_eq!(device.played().len(), 5);
    }

    #[tokio::test]
    async fn test_output_failure_discards_and_recovers() {
        let device = Arc::new(FakeDevice::new());
        device.fail_next_output();
        let queue = PlaybackQueue::new(device.clone(), QueuePolicy::Unbounded);

        queue.put(vec![9, 9]).await;
        queue.wait_for_drain().await;
        assert!(device.played().is_empty());

        queue.put(vec![1, 1]).await;
        queue.wait_for_drain().await;
        assert_eq!(device.played(), vec![vec![1, 1]]);
    }

    #[tokio::test]
    async fn test_empty_chunk_ignored() {
        let queue = PlaybackQueue::new(Arc::new(FakeDevice::new()), QueuePolicy::Unbounded);
        queue.put(Vec::new()).await;
        assert_eq!(queue.pending(), 0);
    }
}
