//! Linear backoff between delivery attempts.
//!
//! The wait before attempt `k + 1` is `retry_delay * k`, capped by a
//! client-wide ceiling. There is no jitter and no exponential growth.

use std::time::Duration;

use crate::types::Endpoint;

/// Attempt budget and delay schedule for one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Policy for an endpoint whose defaults have been applied.
    pub fn for_endpoint(endpoint: &Endpoint, max_delay: Duration) -> Self {
        Self {
            max_attempts: endpoint.max_retries,
            base_delay: endpoint.retry_delay,
            max_delay,
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_after(&self, attempt: u32) -> Duration {
        backoff_delay(self.base_delay, attempt, self.max_delay)
    }

    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// `min(base_delay * attempt, max_delay)`.
pub fn backoff_delay(base_delay: Duration, attempt: u32, max_delay: Duration) -> Duration {
    base_delay.saturating_mul(attempt).min(max_delay)
}
