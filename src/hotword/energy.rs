//! Energy gate wake model for development machines without a trained model
//!
//! Any sustained loud sound counts as the wake phrase. Confidence is the
//! mean RMS of the last few frames relative to `full_scale`.

use std::collections::VecDeque;

use super::detector::WakeWordModel;
use crate::audio::pcm;

/// Frames averaged into one score
const WINDOW: usize = 3;

pub struct EnergyGate {
    phrase: String,
    full_scale: f32,
    levels: VecDeque<f32>,
}

impl EnergyGate {
    pub fn new(phrase: impl Into<String>, full_scale: f32) -> Self {
        Self {
            phrase: phrase.into(),
            full_scale: full_scale.max(f32::EPSILON),
            levels: VecDeque::with_capacity(WINDOW),
        }
    }
}

impl WakeWordModel for EnergyGate {
    fn predict(&mut self, samples: &[i16]) -> Vec<(String, f32)> {
        if self.levels.len() == WINDOW {
            self.levels.pop_front();
        }
        self.levels.push_back(pcm::rms(samples));

        #[allow(clippy::cast_precision_loss)]
        let mean = self.levels.iter().sum::<f32>() / self.levels.len() as f32;
        let confidence = (mean / self.full_scale).min(1.0);

        tracing::trace!(level = mean, confidence, "energy gate");
        vec![(self.phrase.clone(), confidence)]
    }

    fn reset(&mut self, phrase: &str) {
        if phrase == self.phrase {
            self.levels.clear();
        }
    }
}
