//! Exponential backoff for queue-server requests.

use std::time::Duration;

/// Retries after the first attempt.
pub const MAX_REQUEST_RETRIES: u32 = 6;

/// First backoff delay (500ms).
///
/// Exponential backoff: 500ms, 1s, 2s, 4s, 8s, 16s.
pub const REQUEST_RETRY_BACKOFF_BASE_MS: u64 = 500;

/// Upper bound on a single backoff delay.
///
/// Tiger Style: fixed ceiling, no unbounded growth.
pub const REQUEST_RETRY_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// Retry schedule applied to 5xx replies and connection failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: MAX_REQUEST_RETRIES,
            base_delay: Duration::from_millis(REQUEST_RETRY_BACKOFF_BASE_MS),
            max_delay: REQUEST_RETRY_BACKOFF_MAX,
        }
    }
}

impl RetryPolicy {
    /// No retries at all.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        self.base_delay.saturating_mul(1u32 << shift).min(self.max_delay)
    }
}
