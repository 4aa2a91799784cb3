//! Exponential backoff for submissions that never reached the node

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Retry strategy configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before the first retry
    pub base_delay_ms: u64,
    /// Cap on any single delay
    pub max_delay_ms: u64,
    /// Randomize each delay by up to ±20%
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 8000,
            jitter: true,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (zero-indexed), or `None` once
    /// retries are exhausted.
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_retries {
            debug!("Max retries ({}) exceeded, giving up", self.max_retries);
            return None;
        }

        let delay_ms = self
            .base_delay_ms
            .saturating_mul(2_u64.saturating_pow(attempt))
            .min(self.max_delay_ms);

        let delay_ms = if self.jitter && delay_ms > 0 {
            let jitter = delay_ms / 5;
            let mut rng = rand::thread_rng();
            let offset = rng.gen_range(0..=jitter);
            if rng.gen_bool(0.5) {
                delay_ms.saturating_add(offset)
            } else {
                delay_ms.saturating_sub(offset)
            }
        } else {
            delay_ms
        };

        debug!("Retry attempt {} - delay {} ms", attempt, delay_ms);
        Some(Duration::from_millis(delay_ms))
    }
}
