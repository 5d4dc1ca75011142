//! Retry policy for failed download attempts.
//!
//! Implements exponential backoff with configurable parameters.

use super::models::DownloadErrorKind;
use std::time::Duration;

/// Retry policy implementing exponential backoff.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries before the job fails permanently.
    pub max_retries: u32,
    /// Initial backoff duration in seconds.
    pub initial_backoff_secs: u64,
    /// Maximum backoff duration in seconds (cap for exponential growth).
    pub max_backoff_secs: u64,
    /// Multiplier applied to backoff after each retry.
    pub backoff_multiplier: f64,
}

impl RetryPolicy {
    /// Backoff before the next attempt, given how many retries already ran.
    ///
    /// Uses exponential backoff: `initial_backoff * multiplier^retry_count`,
    /// capped at `max_backoff_secs`.
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let backoff =
            self.initial_backoff_secs as f64 * self.backoff_multiplier.powi(retry_count as i32);
        Duration::from_secs(backoff.min(self.max_backoff_secs as f64) as u64)
    }

    /// Check if a failure should be retried given the current retry count.
    pub fn should_retry(&self, kind: DownloadErrorKind, retry_count: u32) -> bool {
        kind.is_retryable() && retry_count < self.max_retries
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff_secs: 5,
            max_backoff_secs: 300, // 5 minutes
            backoff_multiplier: 2.0,
        }
    }
}
