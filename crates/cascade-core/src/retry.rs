use std::time::Duration;

/// Exponential backoff policy for transient step failures.
///
/// A failure retries only when the outcome marks it transient, the step
/// declares itself retryable, and the attempts budget is not exhausted.
/// Suspensions, successes, and cancellations never retry.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retries after the initial attempt.
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Backoff delay before retry number `retry` (zero-based):
    /// `min(max_delay, base_delay * 2^retry)`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.min(31));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether another attempt is allowed after `retries_so_far` retries.
    pub fn should_retry(&self, retries_so_far: u32, outcome_transient: bool, step_retryable: bool) -> bool {
        outcome_transient && step_retryable && retries_so_far < self.max_attempts
    }
}
