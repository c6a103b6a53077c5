//! Retry with exponential backoff and jitter
//!
//! Wallet commits are optimistic: a commit that loses a version race is
//! re-read and re-attempted here, with a bounded number of attempts.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = only the initial attempt)
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Cap on the exponential growth
    pub max_delay: Duration,
    /// Backoff multiplier (2.0 doubles each time)
    pub multiplier: f64,
    /// Jitter factor in 0.0..=1.0; the delay varies by up to this fraction
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::conflicts()
    }
}

impl RetryConfig {
    /// Wallet version conflicts: short waits, a handful of attempts
    pub fn conflicts() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(200),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    /// Database connectivity (used by the admin tool on startup)
    pub fn database() -> Self {
        Self {
            max_retries: 5,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
        }
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(attempt as i32);
        let capped = base.min(self.max_delay.as_secs_f64());

        let delay = if self.jitter > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            (capped + offset).max(0.0)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// The final result (success or last error)
    pub result: Result<T, E>,
    /// Number of attempts made (1 = first try succeeded)
    pub attempts: u32,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Runs operations under a [`RetryConfig`]
#[derive(Debug, Clone)]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry only while `should_retry` accepts the error.
    pub async fn run_with_predicate<F, Fut, T, E, P>(
        &self,
        operation: F,
        should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    return RetryResult {
                        result: Ok(value),
                        attempts,
                    };
                }
                Err(e) => {
                    if attempts > self.config.max_retries || !should_retry(&e) {
                        return RetryResult {
                            result: Err(e),
                            attempts,
                        };
                    }

                    let delay = self.config.delay_for_attempt(attempts - 1);

                    tracing::debug!(
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis() as u64,
                        "Retrying operation after failure"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Transaction lost a serialization race (Postgres 40001/40P01, SQLite busy/locked).
pub fn is_serialization_failure(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            code == "40001" || code == "40P01" || code == "5" || code == "6" || code == "517"
        }
        _ => false,
    }
}

/// Connection-level failure that usually clears on its own.
pub fn is_transient_db_error(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        // Pool is intentionally closed
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // Connection exceptions, operator intervention
            code.starts_with("08") || code.starts_with("57")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Token;
    use crate::infra::LedgerError;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_wait() -> RetryConfig {
        RetryConfig::conflicts()
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(0.0)
    }

    fn conflict() -> LedgerError {
        LedgerError::VersionConflict {
            project_key: "p1".into(),
            user_id: "u1".into(),
            token: Token::tgem(),
            expected: 1,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let config = RetryConfig {
            max_retries: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            jitter: 0.0,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(400));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_in_range() {
        let config = RetryConfig::conflicts().with_jitter(0.5);
        for _ in 0..50 {
            let delay = config.delay_for_attempt(1);
            assert!(delay >= Duration::from_millis(5));
            assert!(delay <= Duration::from_millis(15));
        }
    }

    #[tokio::test]
    async fn test_conflict_retried_until_success() {
        let count = AtomicU32::new(0);
        let retry = Retry::new(no_wait());

        let result = retry
            .run_with_predicate(
                || async {
                    if count.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(conflict())
                    } else {
                        Ok(7)
                    }
                },
                LedgerError::is_conflict,
            )
            .await;

        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap(), 7);
    }

    #[tokio::test]
    async fn test_non_conflict_not_retried() {
        let retry = Retry::new(no_wait());

        let result: RetryResult<(), LedgerError> = retry
            .run_with_predicate(
                || async { Err(LedgerError::Internal("boom".into())) },
                LedgerError::is_conflict,
            )
            .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts, 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted_returns_last_error() {
        let retry = Retry::new(no_wait().with_max_retries(2));

        let result: RetryResult<(), LedgerError> = retry
            .run_with_predicate(|| async { Err(conflict()) }, LedgerError::is_conflict)
            .await;

        assert_eq!(result.attempts, 3);
        assert!(result.into_result().unwrap_err().is_conflict());
    }

    #[test]
    fn test_pool_timeout_is_transient() {
        assert!(is_transient_db_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_transient_db_error(&sqlx::Error::PoolClosed));
        assert!(!is_serialization_failure(&sqlx::Error::PoolTimedOut));
    }
}
