//! Retry policy and backoff schedule for node execution.

use std::collections::HashSet;
use std::time::Duration;

use super::node_error::{ErrorCategory, NodeError};

/// Retry policy applied around every node attempt.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1)
    pub max_attempts: u32,
    /// Base delay before the second attempt
    pub base_delay: Duration,
    /// Cap on any single backoff sleep
    pub max_delay: Duration,
    /// Double the delay per attempt; constant base delay when false
    pub exponential: bool,
    /// Categories eligible for retry
    pub retryable: HashSet<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            exponential: true,
            retryable: [
                ErrorCategory::Network,
                ErrorCategory::ApiLimit,
                ErrorCategory::ExternalService,
                ErrorCategory::Processing,
            ]
            .into_iter()
            .collect(),
        }
    }
}

impl RetryPolicy {
    /// Single-attempt policy: no retries, no sleeps.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub fn with_base_delay(mut self, base_delay: Duration) -> Self {
        self.base_delay = base_delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    /// Backoff before the attempt after `attempt` (0-based):
    /// `min(base * 2^attempt, max)`, or the constant base when not exponential.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        if !self.exponential {
            return self.base_delay.min(self.max_delay);
        }
        let millis = (self.base_delay.as_millis() as u64)
            .saturating_mul(2u64.saturating_pow(attempt));
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Whether one more attempt should run after a failure on `attempt` (0-based).
    pub fn should_retry(&self, attempt: u32, error: &NodeError) -> bool {
        attempt + 1 < self.max_attempts
            && error.recoverable
            && self.retryable.contains(&error.category)
    }
}
