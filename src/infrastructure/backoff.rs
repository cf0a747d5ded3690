use std::time::Duration;

use crate::types::constants::{BACKOFF_MULTIPLIER, MAX_RECONNECT_DELAY};

/// Capped exponential backoff for reconnect scheduling.
///
/// Attempt `n` (1-based) waits `min(max, base * 1.5^(n-1))`. The delay grows
/// monotonically until the cap and resets to the base on a successful open.
#[derive(Debug, Clone)]
pub struct Backoff {
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
}

impl Backoff {
    pub fn new(base_ms: u64) -> Self {
        Self {
            base_ms,
            max_ms: MAX_RECONNECT_DELAY,
            attempt: 0,
        }
    }

    pub fn with_max(mut self, max_ms: u64) -> Self {
        self.max_ms = max_ms;
        self
    }

    /// Delay for a specific 1-based attempt number, independent of state.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let raw = self.base_ms as f64 * BACKOFF_MULTIPLIER.powi(exponent as i32);
        Duration::from_millis(raw.min(self.max_ms as f64) as u64)
    }

    /// Advances the attempt counter and returns the delay for it.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        self.delay_for(self.attempt)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
