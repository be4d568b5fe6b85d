//! Bounded retry with exponential backoff.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use agent_runner_core::config::ResilienceSettings;
use agent_runner_core::{Error, Result};

/// Decides whether a failure is worth another attempt.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Retry policy. Immutable once built; use the presets or `with_*` setters.
#[derive(Clone)]
pub struct RetryConfig {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    retryable: RetryPredicate,
}

impl std::fmt::Debug for RetryConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryConfig")
            .field("max_attempts", &self.max_attempts)
            .field("initial_delay", &self.initial_delay)
            .field("max_delay", &self.max_delay)
            .field("backoff_multiplier", &self.backoff_multiplier)
            .finish_non_exhaustive()
    }
}

impl Default for RetryConfig {
    /// 3 attempts, 1s doubling up to 30s, retrying [`Error::is_retryable`] failures.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            retryable: Arc::new(Error::is_retryable),
        }
    }
}

impl RetryConfig {
    /// A single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// 5 attempts, 100ms doubling up to 2s.
    pub fn quick() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            ..Default::default()
        }
    }

    /// 4 attempts, 2s doubling up to 60s.
    pub fn patient() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            ..Default::default()
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
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

    /// Multipliers below 1.0 are raised to 1.0 so delays never shrink.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = if multiplier.is_finite() {
            multiplier.max(1.0)
        } else {
            1.0
        };
        self
    }

    pub fn with_retryable<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retryable = Arc::new(predicate);
        self
    }

    pub fn is_retryable(&self, error: &Error) -> bool {
        (self.retryable)(error)
    }

    /// Delay slept after failed attempt `attempt` (1-based):
    /// `min(initial * multiplier^(attempt-1), max)`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let scaled = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped = scaled.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }
}

impl From<&ResilienceSettings> for RetryConfig {
    fn from(settings: &ResilienceSettings) -> Self {
        RetryConfig::default()
            .with_max_attempts(settings.max_attempts)
            .with_initial_delay(Duration::from_millis(settings.initial_delay_ms))
            .with_max_delay(Duration::from_millis(settings.max_delay_ms))
            .with_backoff_multiplier(settings.backoff_multiplier)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or runs out
/// of attempts.
///
/// Non-retryable errors are returned as-is. Exhaustion wraps the last error
/// in [`Error::RetryExhausted`]. No delay follows the final attempt.
pub async fn retry<F, Fut, T>(config: &RetryConfig, operation: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let max_attempts = config.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    tracing::debug!(operation = %operation, attempt, "Operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(e) if !config.is_retryable(&e) => {
                tracing::debug!(operation = %operation, attempt, error = %e, "Non-retryable failure");
                return Err(e);
            }
            Err(e) if attempt >= max_attempts => {
                tracing::warn!(
                    operation = %operation,
                    attempts = attempt,
                    layer = %e.layer(),
                    error = %e,
                    "Retries exhausted"
                );
                return Err(Error::RetryExhausted {
                    attempts: attempt,
                    source: Box::new(e),
                });
            }
            Err(e) => {
                let delay = config.delay_for_attempt(attempt);
                tracing::debug!(
                    operation = %operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                metrics::counter!("retry_attempts_total", "operation" => operation.to_string())
                    .increment(1);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
