use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Bounded exponential backoff used by reconnect loops and transient poll
/// failures.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    base_delay_ms: u64,
    max_delay_ms: u64,
    max_attempts: u32,
}

impl RetryPolicy {
    pub fn new(base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            base_delay_ms,
            max_delay_ms,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    /// Replace the attempt budget; zero disables reconnecting entirely.
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn base_delay_ms(&self) -> u64 {
        self.base_delay_ms
    }

    pub fn max_delay_ms(&self) -> u64 {
        self.max_delay_ms
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Whether attempt number `attempt` (zero-based) is still within budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u64 << shift;
        let bounded = self
            .base_delay_ms
            .saturating_mul(multiplier)
            .min(self.max_delay_ms);
        Duration::from_millis(bounded)
    }

    /// Upper bound on the total time spent sleeping across the whole budget.
    pub fn total_backoff_bound(&self) -> Duration {
        (0..self.max_attempts)
            .map(|attempt| self.delay_for_attempt(attempt))
            .sum()
    }
}

const DEFAULT_MAX_ATTEMPTS: u32 = 8;

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(500, 30_000)
    }
}
