//! Retry engine: exponential backoff for backend requests.
//!
//! The delay after failed attempt `i` (0-based) is `base_delay * 2^i`, so
//! `N` consecutive failures wait `sum(2^i * base_delay for i in 0..N-1)`
//! before the last error surfaces.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Retry policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total number of attempts, the first one included.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Maximum delay cap.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(1_000),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after failed attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    /// Whether another attempt may follow failed attempt `attempt` (0-based).
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt + 1 < self.max_attempts
    }

    /// Sum of all waits when every attempt fails.
    pub fn total_backoff(&self) -> Duration {
        (0..self.max_attempts.saturating_sub(1))
            .map(|i| self.delay_for(i))
            .sum()
    }
}

/// Final failure of a retried operation.
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts actually made.
    pub attempts: u32,
    pub error: E,
}

/// Run `operation` until it succeeds, returns a non-retryable error, or the
/// policy runs out of attempts.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, Exhausted<E>>
where
    E: Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    debug!(label, attempts = attempt + 1, "Request succeeded after retry");
                }
                return Ok(value);
            }
            Err(error) => {
                if !is_retryable(&error) || !policy.should_retry(attempt) {
                    warn!(
                        label,
                        attempts = attempt + 1,
                        error = %error,
                        "Request failed, giving up"
                    );
                    return Err(Exhausted {
                        attempts: attempt + 1,
                        error,
                    });
                }
                let delay = policy.delay_for(attempt);
                warn!(
                    label,
                    attempt = attempt + 1,
                    max = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Request failed, will retry"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
