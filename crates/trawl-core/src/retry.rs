//! Retry-with-backoff for single fetch attempts.
//!
//! Delay before attempt `n + 1` is `base * 2^n`, capped at `max_delay`, with
//! optional jitter of up to half the base delay.

use std::future::Future;
use std::time::Duration;

use rand::RngExt;

use crate::error::AppError;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per request, including the first. Zero is treated as one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            ..Self::default()
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay after the given failed attempt (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        let capped = self
            .base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay);

        if !self.jitter {
            return capped;
        }

        let jitter_range_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX) / 2;
        let remaining_ms =
            u64::try_from(self.max_delay.saturating_sub(capped).as_millis()).unwrap_or(0);
        let limit_ms = jitter_range_ms.min(remaining_ms);
        if limit_ms == 0 {
            return capped;
        }

        let jitter_ms = rand::rng().random_range(0..limit_ms);
        (capped + Duration::from_millis(jitter_ms)).min(self.max_delay)
    }
}

/// Outcome of one attempt, as classified by the caller.
#[derive(Debug)]
pub enum RetryAction<T> {
    Success(T),
    /// Transient failure; try again if attempts remain.
    Retry(AppError),
    /// Permanent failure; surface immediately.
    Fail(AppError),
}

/// Run `operation` until it succeeds, fails permanently, or attempts run out.
///
/// `operation` receives the 0-indexed attempt number. When every attempt
/// failed with a retryable error, the last error is surfaced as
/// [`AppError::Network`] carrying its status code.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, operation: F) -> Result<T, AppError>
where
    F: Fn(u32) -> Fut,
    Fut: Future<Output = RetryAction<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation(attempt).await {
            RetryAction::Success(value) => return Ok(value),
            RetryAction::Fail(err) => return Err(err),
            RetryAction::Retry(err) => {
                if attempt + 1 >= attempts {
                    return Err(AppError::Network {
                        status: err.status_code(),
                        message: format!("gave up after {attempts} attempts: {err}"),
                    });
                }
                let delay = policy.delay_for_attempt(attempt);
                tracing::warn!(
                    attempt = attempt + 1,
                    max = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Retrying after transient error"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
