//! Retry and Execution Policy
//!
//! The rules a worker follows while running a task, as plain data:
//! how long one provider call may take, how many providers a multi-mode task
//! may fan out to, and when a failed call is retried.
//!
//! Only transient failures (timeout, rate limit, 5xx-equivalent, transport)
//! are retried, and only after a jittered backoff. Permanent and auth
//! failures advance the fallback chain immediately.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::provider::ProviderError;

// ============================================================================
// Retry Policy
// ============================================================================

/// When and how a failed provider call is retried
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retries allowed for a transient failure (per provider, per task)
    pub max_transient_retries: u32,

    /// Initial backoff delay
    pub initial_backoff_ms: u64,

    /// Maximum backoff delay
    pub max_backoff_ms: u64,

    /// Backoff multiplier
    pub backoff_multiplier: f32,

    /// Add up to 25% jitter to backoff
    pub use_jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_transient_retries: 1,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            backoff_multiplier: 2.0,
            use_jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    #[must_use]
    pub fn no_retries() -> Self {
        Self {
            max_transient_retries: 0,
            ..Default::default()
        }
    }

    /// Calculate backoff duration for retry N (0-indexed)
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let base = self.initial_backoff_ms as f64 * f64::from(self.backoff_multiplier.powi(exponent));
        let capped = base.min(self.max_backoff_ms as f64);

        let duration_ms = if self.use_jitter {
            let jitter = rand::random::<f64>() * 0.25;
            (capped * (1.0 + jitter)) as u64
        } else {
            capped as u64
        };

        Duration::from_millis(duration_ms)
    }

    /// Whether a call that failed with `error` after `retries_so_far` retries
    /// should be retried
    #[must_use]
    pub fn should_retry(&self, error: &ProviderError, retries_so_far: u32) -> bool {
        error.is_transient() && retries_so_far < self.max_transient_retries
    }
}

// ============================================================================
// Execution Policy
// ============================================================================

/// Per-task execution rules consumed by the worker pool
#[derive(Clone, Debug, PartialEq)]
pub struct ExecutionPolicy {
    /// Budget for one provider call, distinct from the task deadline
    pub call_timeout: Duration,

    /// Maximum concurrent provider calls for one multi-mode task
    pub fan_out_limit: usize,

    /// Retry rules
    pub retry: RetryPolicy,
}

impl Default for ExecutionPolicy {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            fan_out_limit: 4,
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutionPolicy {
    /// Set the per-call timeout
    #[must_use]
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Set the fan-out limit
    #[must_use]
    pub fn with_fan_out_limit(mut self, limit: usize) -> Self {
        self.fan_out_limit = limit.max(1);
        self
    }

    /// Set the retry policy
    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Timeout for the next call, capped by whatever remains of the deadline
    ///
    /// Returns `None` once the deadline has passed.
    #[must_use]
    pub fn call_timeout_within(&self, deadline: Option<Instant>, now: Instant) -> Option<Duration> {
        match deadline {
            None => Some(self.call_timeout),
            Some(deadline) if now >= deadline => None,
            Some(deadline) => Some(self.call_timeout.min(deadline - now)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::FailureReason;

    #[test]
    fn test_backoff_for_attempt() {
        let retry = RetryPolicy {
            initial_backoff_ms: 100,
            max_backoff_ms: 1_000,
            backoff_multiplier: 2.0,
            use_jitter: false,
            ..Default::default()
        };

        assert_eq!(retry.backoff_for_attempt(0), Duration::from_millis(100));
        assert_eq!(retry.backoff_for_attempt(1), Duration::from_millis(200));
        assert_eq!(retry.backoff_for_attempt(2), Duration::from_millis(400));
        assert_eq!(retry.backoff_for_attempt(10), Duration::from_millis(1_000));
    }

    #[test]
    fn test_jitter_stays_within_quarter() {
        let retry = RetryPolicy {
            initial_backoff_ms: 1_000,
            use_jitter: true,
            ..Default::default()
        };

        for _ in 0..50 {
            let backoff = retry.backoff_for_attempt(0);
            assert!(backoff >= Duration::from_millis(1_000));
            assert!(backoff <= Duration::from_millis(1_250));
        }
    }

    #[test]
    fn test_only_transient_failures_retry_once() {
        let retry = RetryPolicy::default();
        let timeout = ProviderError::new(FailureReason::Timeout, "slow");
        let rate_limited = ProviderError::new(FailureReason::RateLimited, "429");
        let bad_request = ProviderError::new(FailureReason::InvalidRequest, "400");
        let auth = ProviderError::new(FailureReason::Unauthorized, "401");

        assert!(retry.should_retry(&timeout, 0));
        assert!(retry.should_retry(&rate_limited, 0));
        assert!(!retry.should_retry(&timeout, 1));
        assert!(!retry.should_retry(&bad_request, 0));
        assert!(!retry.should_retry(&auth, 0));
        assert!(!RetryPolicy::no_retries().should_retry(&timeout, 0));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_capped_by_deadline() {
        let policy = ExecutionPolicy::default().with_call_timeout(Duration::from_secs(10));
        let now = Instant::now();

        assert_eq!(
            policy.call_timeout_within(None, now),
            Some(Duration::from_secs(10))
        );
        assert_eq!(
            policy.call_timeout_within(Some(now + Duration::from_secs(3)), now),
            Some(Duration::from_secs(3))
        );
        assert_eq!(
            policy.call_timeout_within(Some(now + Duration::from_secs(60)), now),
            Some(Duration::from_secs(10))
        );
        assert_eq!(policy.call_timeout_within(Some(now), now), None);
    }
}
