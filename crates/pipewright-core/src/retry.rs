//! Retry decisions and backoff for recoverable stage failures.

use std::time::Duration;

use pipewright_types::stage::RetryPolicy;

/// Stateless retry handler; all inputs come from the stage's policy.
pub struct RetryHandler;

impl RetryHandler {
    /// Whether another attempt is allowed after `attempt` failed.
    ///
    /// `attempt` is 1-based (first execution is attempt 1).
    pub fn should_retry(policy: &RetryPolicy, attempt: u32) -> bool {
        attempt < policy.max_attempts
    }

    /// Delay before the attempt that follows failed attempt `attempt`.
    ///
    /// `backoff_seconds * backoff_factor^(attempt - 1)`, capped at one day.
    pub fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
        const MAX_DELAY_SECS: f64 = 86_400.0;

        let exponent = attempt.saturating_sub(1) as i32;
        let secs = policy.backoff_seconds as f64 * policy.backoff_factor.powi(exponent);
        if !secs.is_finite() || secs <= 0.0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(secs.min(MAX_DELAY_SECS))
    }
}
