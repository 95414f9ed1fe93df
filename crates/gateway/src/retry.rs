//! Classification-driven retry.
//!
//! Rate-limited calls retry after the server-supplied delay (default 5 s),
//! up to 3 attempts. Transient failures retry with exponential backoff
//! (base 30 s doubled per attempt), up to 5 attempts. Everything else
//! propagates immediately.

use std::future::Future;
use std::time::Duration;

use concierge_core::{ErrorClass, Result};
use tracing::{debug, warn};

/// Attempt limits and delays for the retry loop.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum rate-limited attempts.
    pub rate_limit_attempts: u32,
    /// Delay when the server sends none.
    pub rate_limit_default_delay: Duration,
    /// Maximum transient attempts.
    pub transient_attempts: u32,
    /// Backoff base, doubled per transient attempt.
    pub transient_base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            rate_limit_attempts: 3,
            rate_limit_default_delay: Duration::from_secs(5),
            transient_attempts: 5,
            transient_base_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Fast policy for tests.
    pub const fn immediate() -> Self {
        Self {
            rate_limit_attempts: 3,
            rate_limit_default_delay: Duration::from_millis(1),
            transient_attempts: 5,
            transient_base_delay: Duration::from_millis(1),
        }
    }

    /// Run `op` until it succeeds, exhausts its class's attempt budget, or
    /// fails non-retryably.
    pub async fn run<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut rate_limited = 0u32;
        let mut transient = 0u32;

        loop {
            let error = match op().await {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };

            match error.class() {
                ErrorClass::RateLimited => {
                    rate_limited += 1;
                    if rate_limited >= self.rate_limit_attempts {
                        return Err(error);
                    }
                    let delay = error
                        .retry_after_ms()
                        .map_or(self.rate_limit_default_delay, Duration::from_millis);
                    debug!(attempt = rate_limited, delay_ms = delay.as_millis() as u64,
                        "rate limited, retrying");
                    tokio::time::sleep(delay).await;
                }
                ErrorClass::Transient => {
                    transient += 1;
                    if transient >= self.transient_attempts {
                        return Err(error);
                    }
                    let delay = self.transient_base_delay * 2u32.saturating_pow(transient - 1);
                    warn!(attempt = transient, delay_ms = delay.as_millis() as u64,
                        error = %error, "transient failure, backing off");
                    tokio::time::sleep(delay).await;
                }
                ErrorClass::NotFound | ErrorClass::Fatal => return Err(error),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::atomic::{AtomicU32, Ordering};

    use concierge_core::Error;

    use super::*;

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::immediate();

        let result = policy
            .run(|| async {
                if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Error::transient("flaky"))
                } else {
                    Ok(42)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn transient_attempts_are_bounded() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::immediate();

        let result: Result<()> = policy
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::transient("always down"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn rate_limit_attempts_are_bounded() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::immediate();

        let result: Result<()> = policy
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::rate_limited(Some(1)))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fatal_errors_propagate_immediately() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::immediate();

        let result: Result<()> = policy
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::api(403, None, "forbidden"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn not_found_is_never_retried() {
        let attempts = AtomicU32::new(0);
        let policy = RetryPolicy::immediate();

        let result: Result<()> = policy
            .run(|| async {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(Error::not_found("#missing:x"))
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
