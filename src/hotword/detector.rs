//! Threshold and cooldown logic on top of a wake-word model

use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::audio::pcm;

/// Produces per-phrase confidences for a frame of 16 kHz mono audio
pub trait WakeWordModel: Send {
    /// Feed one frame and return the newest score for each phrase
    fn predict(&mut self, samples: &[i16]) -> Vec<(String, f32)>;

    /// Forget the score history for `phrase`
    fn reset(&mut self, phrase: &str);
}

/// A wake phrase that crossed the threshold outside the cooldown window
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub phrase: String,
    pub confidence: f32,
}

pub struct ActivationDetector {
    model: Box<dyn WakeWordModel>,
    threshold: f32,
    cooldown: Duration,
    last_detection: Option<Instant>,
    debug_logging: bool,
}

impl ActivationDetector {
    pub fn new(model: Box<dyn WakeWordModel>, threshold: f32, cooldown: Duration) -> Self {
        Self {
            model,
            threshold,
            cooldown,
            last_detection: None,
            debug_logging: false,
        }
    }

    pub fn with_debug_logging(mut self, enabled: bool) -> Self {
        self.debug_logging = enabled;
        self
    }

    /// Score a frame of s16le PCM
    pub fn process_frame(&mut self, frame: &[u8]) -> Option<Detection> {
        self.process_frame_at(frame, Instant::now())
    }

    /// Score a frame as if it arrived at `now`
    ///
    /// A confidence equal to the threshold counts as a hit. Within the
    /// cooldown after a detection no further detections are produced.
    pub fn process_frame_at(&mut self, frame: &[u8], now: Instant) -> Option<Detection> {
        let samples = pcm::s16le_to_i16(frame);
        let scores = self.model.predict(&samples);

        let mut max_confidence = 0.0f32;
        let mut detection = None;

        for (phrase, confidence) in scores {
            max_confidence = max_confidence.max(confidence);
            if confidence < self.threshold {
                continue;
            }

            if let Some(last) = self.last_detection {
                if now.saturating_duration_since(last) < self.cooldown {
                    if self.debug_logging {
                        debug!(phrase, confidence, "hotword ignored during cooldown");
                    }
                    return None;
                }
            }

            self.last_detection = Some(now);
            self.model.reset(&phrase);
            info!(phrase, confidence = format!("{confidence:.2}"), "hotword detected");
            detection = Some(Detection { phrase, confidence });
            break;
        }

        if self.debug_logging && detection.is_none() && max_confidence > 0.05 {
            debug!(max_confidence, threshold = self.threshold, "hotword below threshold");
        }

        detection
    }
}
