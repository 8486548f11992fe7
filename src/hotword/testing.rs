//! Scripted wake-word model for tests

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use super::detector::WakeWordModel;

/// Replays queued scores, one per frame, and records resets
pub struct ScriptedModel {
    phrase: String,
    scores: Arc<Mutex<VecDeque<f32>>>,
    resets: Arc<Mutex<Vec<String>>>,
}

impl ScriptedModel {
    pub fn new(phrase: &str, scores: &[f32]) -> Self {
        Self {
            phrase: phrase.to_string(),
            scores: Arc::new(Mutex::new(scores.iter().copied().collect())),
            resets: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Handle for queueing more scores after the model has been boxed
    pub fn scores(&self) -> Arc<Mutex<VecDeque<f32>>> {
        Arc::clone(&self.scores)
    }

    pub fn resets(&self) -> Arc<Mutex<Vec<String>>> {
        Arc::clone(&self.resets)
    }
}

impl WakeWordModel for ScriptedModel {
    fn predict(&mut self, _samples: &[i16]) -> Vec<(String, f32)> {
        let score = self.scores.lock().unwrap().pop_front().unwrap_or(0.0);
        vec![(self.phrase.clone(), score)]
    }

    fn reset(&mut self, phrase: &str) {
        self.resets.lock().unwrap().push(phrase.to_string());
    }
}
