//! Exclusive owner of the capture stream
//!
//! At most one input stream is open at any time. Switching modes closes the
//! previous stream before opening the next and replaces the frame channel,
//! so frames captured for the detector never reach the transport.

use std::fmt;
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::device::{AudioDevice, FrameSink, InputStream};
use super::playback::{PlaybackQueue, QueuePolicy};
use crate::error::AudioError;

/// Frames buffered between the driver callback and the event loop
const FRAME_BUFFER: usize = 64;

/// Who is consuming microphone frames
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RouteMode {
    /// No input stream open
    #[default]
    Stopped,
    /// Frames feed the activation detector
    Detector,
    /// Frames are streamed to the server
    Transport,
}

impl fmt::Display for RouteMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RouteMode::Stopped => write!(f, "stopped"),
            RouteMode::Detector => write!(f, "detector"),
            RouteMode::Transport => write!(f, "transport"),
        }
    }
}

/// Owns the microphone stream and the playback queue for one device
pub struct AudioRouter {
    device: Arc<dyn AudioDevice>,
    mode: RouteMode,
    input: Option<Box<dyn InputStream>>,
    frames: Option<mpsc::Receiver<Vec<u8>>>,
    playback: PlaybackQueue,
}

impl AudioRouter {
    /// Create a router with no input open
    pub fn new(device: Arc<dyn AudioDevice>, policy: QueuePolicy) -> Self {
        let playback = PlaybackQueue::new(Arc::clone(&device), policy);
        Self {
            device,
            mode: RouteMode::Stopped,
            input: None,
            frames: None,
            playback,
        }
    }

    /// Current route
    pub fn mode(&self) -> RouteMode {
        self.mode
    }

    /// Playback queue shared by clips and streamed speech
    pub fn playback(&self) -> &PlaybackQueue {
        &self.playback
    }

    /// Make `mode` the active route
    ///
    /// Returns `Ok(false)` when already in that mode. On an open failure the
    /// router is left `Stopped` with no stream held.
    pub fn ensure_mode(&mut self, mode: RouteMode) -> Result<bool, AudioError> {
        if self.mode == mode {
            return Ok(false);
        }

        let previous = self.mode;
        self.close_input();

        if mode == RouteMode::Stopped {
            info!(from = %previous, to = %mode, "audio route changed");
            return Ok(true);
        }

        let (sink, frames) = FrameSink::channel(FRAME_BUFFER);
        match self.device.open_input(sink) {
            Ok(stream) => {
                self.input = Some(stream);
                self.frames = Some(frames);
                self.mode = mode;
                info!(from = %previous, to = %mode, "audio route changed");
                Ok(true)
            }
            Err(e) => {
                error!(error = %e, requested = %mode, "failed to open input stream");
                Err(e)
            }
        }
    }

    /// Next captured frame for the current route
    ///
    /// Pends forever while stopped so it can sit in a `select!`. Returns
    /// `None` if the driver went away; the route is then `Stopped`.
    pub async fn next_frame(&mut self) -> Option<Vec<u8>> {
        let Some(frames) = self.frames.as_mut() else {
            return std::future::pending().await;
        };

        let frame = frames.recv().await;
        if frame.is_none() {
            error!(mode = %self.mode, "input stream ended unexpectedly");
            self.close_input();
        }
        frame
    }

    /// Enqueue PCM for playback
    pub async fn play(&self, pcm: Vec<u8>) {
        self.playback.put(pcm).await;
    }

    /// Close the input and stop playback
    pub async fn shutdown(&mut self) {
        self.close_input();
        self.playback.shutdown().await;
    }

    fn close_input(&mut self) {
        self.frames = None;
        if let Some(stream) = self.input.take() {
            stream.close();
            debug!(mode = %self.mode, "input stream closed");
        }
        self.mode = RouteMode::Stopped;
    }
}

impl Drop for AudioRouter {
    fn drop(&mut self) {
        self.close_input();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::testing::FakeDevice;

    fn router() -> (AudioRouter, FakeDevice) {
        let device = FakeDevice::new();
        let router = AudioRouter::new(Arc::new(device.clone()), QueuePolicy::Unbounded);
        (router, device)
    }

    #[test]
    fn test_router_can_be_shared_with_spawned_tasks() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<AudioRouter>();
    }

    #[tokio::test]
    async fn test_play_future_is_send() {
        let (router, device) = router();
        let router = Arc::new(router);
        let task = tokio::spawn({
            let router = Arc::clone(&router);
            async move { router.play(vec![4, 2]).await }
        });
        task.await.unwrap();
        router.playback().wait_for_drain().await;
        assert_eq!(device.played(), vec![vec![4, 2]]);
    }

    #[test]
    fn test_ensure_mode_is_idempotent() {
        let (mut router, device) = router();
        assert!(router.ensure_mode(RouteMode::Detector).unwrap());
        assert!(!router.ensure_mode(RouteMode::Detector).unwrap());
        assert_eq!(device.total_opens(), 1);
    }

    #[test]
    fn test_switching_never_overlaps_streams() {
        let (mut router, device) = router();
        for mode in [
            RouteMode::Detector,
            RouteMode::Transport,
            RouteMode::Detector,
            RouteMode::Stopped,
            RouteMode::Transport,
        ] {
            router.ensure_mode(mode).unwrap();
        }
        assert_eq!(device.max_concurrent_inputs(), 1);
        assert_eq!(device.open_inputs(), 1);

        router.ensure_mode(RouteMode::Stopped).unwrap();
        assert_eq!(device.open_inputs(), 0);
    }

    #[test]
    fn test_open_failure_leaves_router_stopped() {
        let (mut router, device) = router();
        router.ensure_mode(RouteMode::Detector).unwrap();

        device.fail_next_input();
        assert!(router.ensure_mode(RouteMode::Transport).is_err());
        assert_eq!(router.mode(), RouteMode::Stopped);
        assert_eq!(device.open_inputs(), 0);
    }

    #[tokio::test]
    async fn test_frames_do_not_leak_across_modes() {
        let (mut router, device) = router();
        router.ensure_mode(RouteMode::Detector).unwrap();
        assert!(device.inject(vec![1, 1]));

        router.ensure_mode(RouteMode::Transport).unwrap();
        assert!(device.inject(vec![2, 2]));

        assert_eq!(router.next_frame().await, Some(vec![2, 2]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_next_frame_pends_while_stopped() {
        let (mut router, _device) = router();
        let waited =
            tokio::time::timeout(std::time::Duration::from_secs(1), router.next_frame()).await;
        assert!(waited.is_err());
    }
}
