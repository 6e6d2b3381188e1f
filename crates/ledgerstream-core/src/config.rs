//! Pipeline configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunables for one ingestion pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    /// Blocks per concurrent fetch unit.
    pub stride_size: usize,
    /// Maximum strides in flight at once during bulk fetching.
    pub stride_concurrency: usize,
    /// Retry budget for a slot the node reports as not yet available.
    pub max_confirmation_attempts: u32,
    /// Pause between confirmation attempts (milliseconds).
    pub confirmation_pause_ms: u64,
    /// Throttle for head / finalized-head re-queries (milliseconds).
    pub head_poll_interval_ms: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            stride_size: 10,
            stride_concurrency: 5,
            max_confirmation_attempts: 20,
            confirmation_pause_ms: 400,
            head_poll_interval_ms: 2000,
        }
    }
}

impl IngestConfig {
    /// Set the number of blocks per concurrent fetch unit.
    pub fn stride_size(mut self, size: usize) -> Self {
        self.stride_size = size.max(1);
        self
    }

    /// Set the maximum number of strides in flight at once.
    pub fn stride_concurrency(mut self, n: usize) -> Self {
        self.stride_concurrency = n.max(1);
        self
    }

    /// Set the retry budget for not-yet-available slots.
    pub fn max_confirmation_attempts(mut self, attempts: u32) -> Self {
        self.max_confirmation_attempts = attempts.max(1);
        self
    }

    /// Set the pause between confirmation attempts.
    pub fn confirmation_pause_ms(mut self, ms: u64) -> Self {
        self.confirmation_pause_ms = ms;
        self
    }

    /// Set the head re-query throttle.
    pub fn head_poll_interval_ms(mut self, ms: u64) -> Self {
        self.head_poll_interval_ms = ms;
        self
    }

    pub fn confirmation_pause(&self) -> Duration {
        Duration::from_millis(self.confirmation_pause_ms)
    }

    pub fn head_poll_interval(&self) -> Duration {
        Duration::from_millis(self.head_poll_interval_ms)
    }
}
