//! Retry and backoff policy for failed step attempts.

use std::time::Duration;

/// Policy for retrying failed tasks.
///
/// `max_retries` bounds the number of attempts a step gets: the attempt that
/// fails for the `max_retries`-th time is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of failed attempts before a step is permanently failed.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub base_delay: Duration,
    /// Double the delay for every further retry.
    pub exponential_backoff: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { max_retries: 3, base_delay: Duration::from_secs(2), exponential_backoff: true }
    }
}

impl RetryPolicy {
    /// Creates a custom retry policy.
    #[must_use]
    pub fn with_config(max_retries: u32, base_delay: Duration, exponential_backoff: bool) -> Self {
        Self { max_retries, base_delay, exponential_backoff }
    }

    /// Returns whether a step that has now failed `failed_attempts` times gets another attempt.
    #[must_use]
    pub fn should_retry(&self, failed_attempts: u32) -> bool {
        failed_attempts < self.max_retries
    }

    /// Delay before re-running a task that has already been retried `retry_count` times.
    ///
    /// `base_delay * 2^retry_count` with exponential backoff, `base_delay` otherwise. No jitter.
    #[must_use]
    pub fn delay_for(&self, retry_count: u32) -> Duration {
        if !self.exponential_backoff {
            return self.base_delay;
        }
        2u32.checked_pow(retry_count)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}
