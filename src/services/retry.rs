//! Bounded retry for transient storage failures
//!
//! Only errors reporting `is_retryable()` are retried. The operation must
//! carry its idempotency key from before the first attempt, so a retry after
//! an ambiguous failure cannot apply points twice.

use std::future::Future;
use std::time::Duration;

use tracing::warn;

use crate::config::Config;
use crate::error::LedgerError;

/// Upper bound on a single backoff sleep
const MAX_DELAY: Duration = Duration::from_secs(30);

/// Retry schedule: `attempts` tries in total, exponential backoff from `base_delay`
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            attempts: config.retry_attempts.max(1),
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
        }
    }

    /// Policy that makes a single attempt
    pub fn none() -> Self {
        Self {
            attempts: 1,
            base_delay: Duration::ZERO,
        }
    }

    /// Delay before retry number `attempt` (1-based)
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay
            .checked_mul(2u32.saturating_pow(attempt.saturating_sub(1)))
            .map_or(MAX_DELAY, |delay| delay.min(MAX_DELAY))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(50),
        }
    }
}

/// Run `op` until it succeeds, fails permanently, or attempts run out
pub async fn with_retry<T, F, Fut>(policy: RetryPolicy, operation: &str, mut op: F) -> Result<T, LedgerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, LedgerError>>,
{
    let mut attempts = 0;

    loop {
        attempts += 1;

        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempts < policy.attempts => {
                let delay = policy.delay_for(attempts);
                warn!(
                    operation = %operation,
                    attempt = attempts,
                    max_attempts = policy.attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Transient storage failure, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                if e.is_retryable() {
                    warn!(operation = %operation, attempts, error = %e, "Giving up after retries");
                }
                return Err(e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            attempts,
            base_delay: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_delay_doubles_and_saturates() {
        let policy = fast(5);
        assert_eq!(policy.delay_for(1), Duration::from_millis(1));
        assert_eq!(policy.delay_for(3), Duration::from_millis(4));

        let extreme = RetryPolicy {
            attempts: u32::MAX,
            base_delay: Duration::from_millis(u64::MAX),
        };
        assert_eq!(extreme.delay_for(1), MAX_DELAY);
        assert_eq!(extreme.delay_for(u32::MAX), MAX_DELAY);
        assert_eq!(fast(64).delay_for(64), MAX_DELAY);
    }

    #[tokio::test]
    async fn test_retries_transient_failures() {
        let calls = AtomicU32::new(0);

        let result = with_retry(fast(3), "test", || async {
            if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(LedgerError::Storage("database is locked".into()))
            } else {
                Ok(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_business_errors_are_not_retried() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(fast(5), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::InsufficientPoints { balance: 0, required: 5 })
        })
        .await;

        assert!(matches!(result, Err(LedgerError::InsufficientPoints { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_attempts() {
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = with_retry(fast(2), "test", || async {
            calls.fetch_add(1, Ordering::SeqCst);
            Err(LedgerError::Storage("busy".into()))
        })
        .await;

        assert!(matches!(result, Err(LedgerError::Storage(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_backoff_doubles() {
        let policy = RetryPolicy {
            attempts: 4,
            base_delay: Duration::from_millis(50),
        };
        assert_eq!(policy.delay_for(1), Duration::from_millis(50));
        assert_eq!(policy.delay_for(3), Duration::from_millis(200));
    }
}
