//! Retry utilities with exponential backoff and jitter
//!
//! Used by the committer to re-run a whole unit of work after a transient
//! failure, and by the pipeline loop to back off while the queue is empty.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries, just the initial attempt)
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries (caps exponential growth)
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 = double each time)
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0)
    pub jitter: f64,
    /// Whether to use decorrelated jitter
    pub decorrelated_jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: 0.5,
            decorrelated_jitter: true,
        }
    }
}

impl RetryConfig {
    /// Fast retries for in-memory stores and tests
    pub fn fast() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            jitter: 0.3,
            decorrelated_jitter: false,
        }
    }

    /// Retries for database transactions
    pub fn database() -> Self {
        Self {
            max_retries: 4,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(5),
            multiplier: 2.0,
            jitter: 0.5,
            decorrelated_jitter: true,
        }
    }

    /// Deterministic backoff for idle queue polling
    pub fn polling(initial: Duration, max: Duration) -> Self {
        Self {
            max_retries: u32::MAX,
            initial_delay: initial,
            max_delay: max.max(initial),
            multiplier: 2.0,
            jitter: 0.0,
            decorrelated_jitter: false,
        }
    }

    /// Set the maximum number of retries
    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.max_retries = max;
        self
    }

    /// Calculate delay for a given attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(64) as i32;
        let base_delay = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped_delay = base_delay.min(self.max_delay.as_secs_f64());

        let final_delay = if self.jitter > 0.0 {
            if self.decorrelated_jitter {
                // random(initial_delay, previous_delay * 3)
                let min_delay = self.initial_delay.as_secs_f64();
                let max_delay = (capped_delay * 3.0)
                    .min(self.max_delay.as_secs_f64())
                    .max(min_delay);
                let mut rng = rand::thread_rng();
                rng.gen_range(min_delay..=max_delay)
            } else {
                let jitter_range = capped_delay * self.jitter;
                let mut rng = rand::thread_rng();
                let jitter_offset = rng.gen_range(-jitter_range..=jitter_range);
                (capped_delay + jitter_offset).max(0.0)
            }
        } else {
            capped_delay
        };

        Duration::from_secs_f64(final_delay)
    }
}

/// Result of a retry operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    /// The final result (success or last error)
    pub result: Result<T, E>,
    /// Number of attempts made (1 = succeeded on first try)
    pub attempts: u32,
    /// Total time spent on retries (including delays)
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// A retry executor that can run operations with retry logic
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run an operation, retrying every error up to `max_retries` times
    pub async fn run<F, Fut, T, E>(&self, operation: F) -> RetryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.run_with_predicate(operation, |_| true).await
    }

    /// Run an operation with retry logic and a custom retry predicate
    ///
    /// The `should_retry` predicate receives the error and returns true if
    /// the operation should be retried. The last error is returned unchanged
    /// once the predicate refuses or the retry budget is spent.
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
        let start = std::time::Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    return RetryResult {
                        result: Ok(value),
                        attempts,
                        total_duration: start.elapsed(),
                    };
                }
                Err(e) => {
                    if attempts > self.config.max_retries || !should_retry(&e) {
                        return RetryResult {
                            result: Err(e),
                            attempts,
                            total_duration: start.elapsed(),
                        };
                    }

                    let delay = self.config.delay_for_attempt(attempts - 1);

                    tracing::debug!(
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        delay_ms = delay.as_millis(),
                        "Retrying operation after failure"
                    );

                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Check if an error is retryable (for database errors)
pub fn is_retryable_db_error(err: &sqlx::Error) -> bool {
    match err {
        // Connection errors are usually transient
        sqlx::Error::Io(_) => true,
        sqlx::Error::PoolTimedOut => true,
        sqlx::Error::PoolClosed => false,
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().unwrap_or_default();
            // serialization failure
            code == "40001"
                // deadlock detected
                || code == "40P01"
                // connection exceptions
                || code.starts_with("08")
                // operator intervention
                || code.starts_with("57")
        }
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_retry_config_delay_calculation() {
        let config = RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
            jitter: 0.0,
            decorrelated_jitter: false,
            max_retries: 5,
        };

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(800));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(10));
    }

    #[test]
    fn test_polling_backoff_caps() {
        let config = RetryConfig::polling(Duration::from_millis(100), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(4), Duration::from_millis(1600));
        assert_eq!(config.delay_for_attempt(5), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(u32::MAX - 1), Duration::from_secs(2));
    }

    #[test]
    fn test_decorrelated_jitter_stays_in_bounds() {
        let config = RetryConfig::database();
        for attempt in 0..10 {
            let delay = config.delay_for_attempt(attempt);
            assert!(delay >= config.initial_delay);
            assert!(delay <= config.max_delay);
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(RetryConfig::fast().with_max_retries(5));

        let count = attempt_count.clone();
        let result = retry
            .run(|| {
                let count = count.clone();
                async move {
                    let attempt = count.fetch_add(1, Ordering::SeqCst);
                    if attempt < 2 {
                        Err("not yet")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_exhausts_retries() {
        let retry = Retry::new(RetryConfig::fast().with_max_retries(4));

        let result = retry.run(|| async { Err::<i32, _>("always fails") }).await;

        assert_eq!(result.attempts, 5);
        assert_eq!(result.into_result().unwrap_err(), "always fails");
    }

    #[tokio::test]
    async fn test_retry_with_predicate_stops_on_permanent_error() {
        let attempt_count = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(RetryConfig::fast().with_max_retries(5));

        #[derive(Debug, PartialEq)]
        enum TestError {
            Retryable,
            Fatal,
        }

        let count = attempt_count.clone();
        let result: RetryResult<i32, TestError> = retry
            .run_with_predicate(
                || {
                    let count = count.clone();
                    async move {
                        let attempt = count.fetch_add(1, Ordering::SeqCst);
                        if attempt == 0 {
                            Err(TestError::Retryable)
                        } else {
                            Err(TestError::Fatal)
                        }
                    }
                },
                |e| *e == TestError::Retryable,
            )
            .await;

        assert_eq!(result.attempts, 2);
        assert_eq!(result.into_result().unwrap_err(), TestError::Fatal);
    }

    #[test]
    fn test_db_error_classification() {
        assert!(is_retryable_db_error(&sqlx::Error::PoolTimedOut));
        assert!(!is_retryable_db_error(&sqlx::Error::PoolClosed));
        assert!(!is_retryable_db_error(&sqlx::Error::RowNotFound));
    }
}
