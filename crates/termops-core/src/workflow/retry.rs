//! Retry handler for step command failures.
//!
//! Stateless: all logic lives in associated functions that take the step's
//! `RetryPolicy` as a parameter. A step without a policy runs exactly once.

use std::time::Duration;

use termops_types::workflow::{Backoff, RetryPolicy};

/// Upper bound on any single backoff delay.
pub const MAX_BACKOFF: Duration = Duration::from_secs(60);

/// Stateless retry handler for workflow step failures.
pub struct RetryHandler;

impl RetryHandler {
    /// Total attempts allowed for a step.
    pub fn max_attempts(policy: Option<&RetryPolicy>) -> u32 {
        policy.map_or(1, |p| p.max_attempts.max(1))
    }

    /// Determine whether another attempt should be made.
    ///
    /// `attempt` is 1-based (first execution is attempt 1). Returns `true`
    /// while `attempt < max_attempts`.
    pub fn should_retry(policy: Option<&RetryPolicy>, attempt: u32) -> bool {
        attempt < Self::max_attempts(policy)
    }

    /// Delay to wait after failed `attempt` before the next one.
    ///
    /// Fixed backoff always waits `delay_ms`; exponential doubles it after
    /// each failure. Both are capped at `MAX_BACKOFF`.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        let base = Duration::from_millis(policy.delay_ms);
        let delay = match policy.backoff {
            Backoff::Fixed => base,
            Backoff::Exponential => {
                let exp = attempt.saturating_sub(1).min(31);
                base.saturating_mul(1u32 << exp)
            }
        };
        delay.min(MAX_BACKOFF)
    }

    /// Sum of every backoff delay a step could incur.
    pub fn total_backoff(policy: Option<&RetryPolicy>) -> Duration {
        let Some(policy) = policy else {
            return Duration::ZERO;
        };
        (1..Self::max_attempts(Some(policy)))
            .map(|attempt| Self::backoff_delay(policy, attempt))
            .fold(Duration::ZERO, Duration::saturating_add)
    }
}
