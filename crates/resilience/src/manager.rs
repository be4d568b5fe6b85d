use dashmap::DashMap;
use futures::stream::{BoxStream, Stream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use agent_runner_core::config::ResilienceSettings;
use agent_runner_core::{Error, Result};

use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics};
use crate::deadline::DeadlineStream;
use crate::retry::{retry, RetryConfig};

/// Defaults applied by a [`ResilienceManager`].
#[derive(Debug, Clone, Default)]
pub struct ResilienceConfig {
    pub circuit: CircuitBreakerConfig,
    pub retry: RetryConfig,
    /// Budget for a whole resilient call, across all attempts.
    pub operation_timeout: Option<Duration>,
}

impl From<&ResilienceSettings> for ResilienceConfig {
    fn from(settings: &ResilienceSettings) -> Self {
        Self {
            circuit: CircuitBreakerConfig::from(settings),
            retry: RetryConfig::from(settings),
            operation_timeout: settings.operation_timeout_ms.map(Duration::from_millis),
        }
    }
}

/// Composes a per-operation circuit breaker, retry with backoff and an
/// overall timeout around single-shot operations.
///
/// Breakers are created lazily per operation name and live as long as the
/// manager.
#[derive(Debug, Default)]
pub struct ResilienceManager {
    config: ResilienceConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl ResilienceManager {
    pub fn new(config: ResilienceConfig) -> Self {
        Self {
            config,
            breakers: DashMap::new(),
        }
    }

    pub fn config(&self) -> &ResilienceConfig {
        &self.config
    }

    /// The breaker for `name`, created on first use.
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(existing) = self.breakers.get(name) {
            return existing.value().clone();
        }
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                tracing::debug!(operation = %name, "Creating circuit breaker");
                Arc::new(CircuitBreaker::new(name, self.config.circuit.clone()))
            })
            .value()
            .clone()
    }

    /// Run `op` with the default retry policy.
    pub async fn execute_resilient<F, Fut, T>(&self, name: &str, op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        self.execute_resilient_with(name, &self.config.retry, op).await
    }

    /// Run `op` through the breaker for `name`, retrying per `retry_config`.
    ///
    /// Each attempt passes the breaker, so an opening circuit stops the
    /// retries with [`Error::CircuitOpen`]. The configured operation timeout
    /// covers all attempts and backoff delays together.
    pub async fn execute_resilient_with<F, Fut, T>(
        &self,
        name: &str,
        retry_config: &RetryConfig,
        mut op: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let breaker = self.breaker(name);
        let breaker = breaker.as_ref();
        let attempts = retry(retry_config, name, || {
            let attempt = op();
            breaker.execute(move || attempt)
        });
        self.within_budget(name, Instant::now(), attempts).await
    }

    /// Open a stream resiliently and bound its whole lifetime.
    ///
    /// Opening the stream goes through the breaker and retries like
    /// [`execute_resilient`](Self::execute_resilient). The breaker also
    /// records how each opened stream ends: an `Err` item is a failure, a
    /// clean end a success. Items already delivered are never retried.
    ///
    /// The operation timeout, counted from the first attempt, bounds
    /// consumption too: once it passes the stream yields [`Error::Timeout`],
    /// which the breaker counts, and the inner stream is dropped.
    pub async fn execute_resilient_stream<F, Fut, S, T>(
        &self,
        name: &str,
        mut open: F,
    ) -> Result<BoxStream<'static, Result<T>>>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<S>>,
        S: Stream<Item = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let start = Instant::now();
        let limit = self.config.operation_timeout;
        let breaker = self.breaker(name);
        let breaker = &breaker;
        let attempts = retry(&self.config.retry, name, move || {
            let attempt = open();
            breaker.execute_stream(move || async move {
                let stream = attempt.await?.boxed();
                Ok::<_, Error>(match limit {
                    Some(limit) => DeadlineStream::with_budget(stream, limit, start).boxed(),
                    None => stream,
                })
            })
        });
        self.within_budget(name, start, attempts).await
    }

    /// Apply the operation timeout, if any, to `fut`.
    async fn within_budget<T>(
        &self,
        name: &str,
        start: Instant,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        let Some(limit) = self.config.operation_timeout else {
            return fut.await;
        };
        match tokio::time::timeout_at(start + limit, fut).await {
            Ok(result) => result,
            Err(_) => {
                let elapsed = start.elapsed();
                tracing::warn!(
                    operation = %name,
                    timeout = ?limit,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Resilient operation timed out"
                );
                Err(Error::Timeout {
                    timeout: limit,
                    elapsed,
                })
            }
        }
    }

    /// Snapshot of the breaker for `name`, if one exists.
    pub fn circuit_metrics(&self, name: &str) -> Option<CircuitBreakerMetrics> {
        self.breakers.get(name).map(|breaker| breaker.metrics())
    }

    /// Snapshots of all breakers, sorted by name.
    pub fn all_metrics(&self) -> Vec<CircuitBreakerMetrics> {
        let breakers: Vec<Arc<CircuitBreaker>> =
            self.breakers.iter().map(|e| e.value().clone()).collect();
        let mut metrics: Vec<_> = breakers.iter().map(|b| b.metrics()).collect();
        metrics.sort_by(|a, b| a.name.cmp(&b.name));
        metrics
    }

    /// Force the breaker for `name` closed. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.breakers.get(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }
}
