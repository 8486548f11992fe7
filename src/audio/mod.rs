//! Audio input/output for the client
//!
//! The router is the only thing that opens capture streams. Playback goes
//! through a queue whose drain means "the speaker is quiet".

#[cfg(feature = "hardware-audio")]
mod cpal_backend;
mod device;
pub mod pcm;
mod playback;
mod router;
#[cfg(test)]
pub mod testing;

use std::sync::Arc;

use tracing::info;

use crate::config::{AudioBackend, AudioSettings};
use crate::error::AudioError;

pub use device::{AudioDevice, FrameSink, InputStream, OutputStream};
pub use playback::{PlaybackQueue, QueuePolicy};
pub use router::{AudioRouter, RouteMode};

/// Pick the device implementation for this build and configuration
pub fn open_device(settings: &AudioSettings) -> Result<Arc<dyn AudioDevice>, AudioError> {
    info!(backend = ?settings.backend, "opening audio backend");

    #[cfg(feature = "hardware-audio")]
    {
        let device = cpal_backend::CpalDevice::new(settings)?;
        Ok(Arc::new(device))
    }

    #[cfg(not(feature = "hardware-audio"))]
    {
        let _ = settings;
        Err(AudioError::Unavailable(
            "built without the hardware-audio feature".to_string(),
        ))
    }
}

/// Unbounded on desktop, `playback_queue_size` chunks on embedded boards
pub fn playback_policy(settings: &AudioSettings) -> QueuePolicy {
    match settings.backend {
        AudioBackend::Desktop => QueuePolicy::Unbounded,
        AudioBackend::Embedded => QueuePolicy::Bounded(settings.playback_queue_size),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_follows_backend() {
        let mut settings = AudioSettings::default();
        assert_eq!(playback_policy(&settings), QueuePolicy::Unbounded);

        settings.backend = AudioBackend::Embedded;
        settings.playback_queue_size = 8;
        assert_eq!(playback_policy(&settings), QueuePolicy::Bounded(8));
    }
}
