//! Exponential reconnect backoff with jitter

use std::time::Duration;

use rand::Rng;

/// `min(base * 2^attempts + jitter, max)` with jitter in `[0, 1)` seconds
#[derive(Debug, Clone)]
pub struct Backoff {
    base: f64,
    max: f64,
    attempts: u32,
}

impl Backoff {
    /// Create a backoff starting at `base_secs`, never exceeding `max_secs`
    pub fn new(base_secs: f64, max_secs: f64) -> Self {
        Self {
            base: base_secs.max(0.0),
            max: max_secs.max(0.0),
            attempts: 0,
        }
    }

    /// Count one more failed cycle and return how long to wait
    pub fn next_delay(&mut self) -> Duration {
        let jitter = rand::thread_rng().gen_range(0.0..1.0);
        self.next_delay_with_jitter(jitter)
    }

    pub fn next_delay_with_jitter(&mut self, jitter: f64) -> Duration {
        self.attempts = self.attempts.saturating_add(1);
        let exponent = i32::try_from(self.attempts).unwrap_or(i32::MAX).min(62);
        let delay = (self.base * 2f64.powi(exponent) + jitter).min(self.max);
        Duration::from_secs_f64(delay.max(0.0))
    }

    /// Forget past failures after a successful connect
    pub fn reset(&mut self) {
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}
