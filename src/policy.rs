use std::time::Duration;

/// Retry, backoff and lock-staleness configuration for one job type.
///
/// Every knob lives here; the queue core has no global retry settings.
/// Handlers pin a policy via [`JobHandler::RETRY`](crate::JobHandler::RETRY),
/// and the same struct is passed explicitly into [`fail_job`](crate::fail_job)
/// and the stale recovery sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Failures after which a job becomes terminally failed.
    pub max_retries: u32,
    /// Backoff delay unit; the first retry waits roughly twice this.
    pub base_delay: Duration,
    /// Upper bound on the backoff delay.
    pub cap_delay: Duration,
    /// Age after which a processing job's lock is considered abandoned.
    pub stale_after: Duration,
}

impl RetryPolicy {
    /// Three retries, 1s doubling backoff capped at 60s, 10 minute stale window.
    pub const DEFAULT: Self = Self {
        max_retries: 3,
        base_delay: Duration::from_secs(1),
        cap_delay: Duration::from_secs(60),
        stale_after: Duration::from_secs(600),
    };

    /// Delay before a job with the given retry count becomes eligible again:
    /// `min(base_delay * 2^retry_count, cap_delay)`.
    #[must_use]
    pub fn backoff_delay(&self, retry_count: u32) -> Duration {
        let factor = 2u32.saturating_pow(retry_count);
        self.base_delay.saturating_mul(factor).min(self.cap_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::DEFAULT
    }
}
