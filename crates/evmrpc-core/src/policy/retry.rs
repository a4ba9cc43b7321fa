//! Exponential backoff retry loop with per-attempt timeout.

use std::future::Future;
use std::time::Duration;

use crate::error::TransportError;

/// Stateless retry policy: computes delays and drives the attempt loop.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (not counting the first try).
    pub retry_count: u32,
    /// Base backoff delay, doubled on every retry.
    pub retry_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retry_count: 3,
            retry_delay: Duration::from_millis(150),
        }
    }
}

impl RetryPolicy {
    pub fn new(retry_count: u32, retry_delay: Duration) -> Self {
        Self {
            retry_count,
            retry_delay,
        }
    }

    /// Delay after the failed `attempt` (0-based).
    ///
    /// A `Retry-After` carried by the error replaces the computed value.
    pub fn delay_for(&self, attempt: u32, err: &TransportError) -> Duration {
        if let Some(after) = err.retry_after() {
            return after;
        }
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.retry_delay.saturating_mul(factor)
    }

    /// Returns `true` if another attempt may follow the failed `attempt`.
    pub fn should_retry(&self, attempt: u32, err: &TransportError) -> bool {
        attempt < self.retry_count && err.is_retryable()
    }

    /// Run `op` until it succeeds, fails terminally, or the retry budget is
    /// spent. Each attempt is bounded by `timeout`.
    ///
    /// Dropping the returned future cancels whatever is in flight, attempt
    /// or backoff sleep alike.
    pub async fn execute<F, Fut, T>(&self, timeout: Duration, mut op: F) -> Result<T, TransportError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, TransportError>>,
    {
        let mut attempt = 0u32;
        loop {
            let outcome = match tokio::time::timeout(timeout, op(attempt)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(TransportError::Timeout {
                    ms: timeout.as_millis() as u64,
                }),
            };

            let err = match outcome {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            if !self.should_retry(attempt, &err) {
                if err.is_retryable() {
                    tracing::error!(attempts = attempt + 1, error = %err, "max retries exceeded");
                }
                return Err(err);
            }

            let delay = self.delay_for(attempt, &err);
            tracing::warn!(
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying request"
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}
