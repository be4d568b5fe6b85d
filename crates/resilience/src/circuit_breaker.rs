//! Per-operation circuit breaker.
//!
//! ```text
//!            N failures in window            recovery timeout elapsed
//!   CLOSED ─────────────────────────▶ OPEN ─────────────────────────▶ HALF_OPEN
//!     ▲                                 ▲                                 │
//!     │            trial success        │        trial failure            │
//!     └─────────────────────────────────┼─────────────────────────────────┤
//!                                       └─────────────────────────────────┘
//! ```
//!
//! While OPEN the guarded operation is never invoked. HALF_OPEN admits a
//! single trial call; concurrent callers are rejected until it completes.

use futures::stream::{BoxStream, Stream, StreamExt};
use std::collections::VecDeque;
use std::future::Future;
use std::ops::Deref;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::Instant;

use agent_runner_core::config::ResilienceSettings;
use agent_runner_core::{Error, Result};

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerConfig {
    /// Failures within the window that open the circuit.
    pub failure_threshold: u32,
    /// Time spent OPEN before a trial call is allowed.
    pub recovery_timeout: Duration,
    /// Outcomes older than this are forgotten.
    pub sliding_window: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(30),
            sliding_window: Duration::from_secs(60),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, sliding_window: Duration) -> Self {
        Self {
            failure_threshold: failure_threshold.max(1),
            recovery_timeout,
            sliding_window,
        }
    }
}

impl From<&ResilienceSettings> for CircuitBreakerConfig {
    fn from(settings: &ResilienceSettings) -> Self {
        Self::new(
            settings.failure_threshold,
            Duration::from_millis(settings.recovery_timeout_ms),
            Duration::from_millis(settings.sliding_window_ms),
        )
    }
}

/// Read-only snapshot of a breaker.
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub name: String,
    pub state: CircuitState,
    pub failures_in_window: u32,
    pub successes_in_window: u32,
    /// Calls admitted or rejected since creation or the last reset.
    pub total_calls: u64,
    pub total_rejections: u64,
    pub window: Duration,
    /// Age of the oldest outcome still in the window.
    pub oldest_outcome_age: Option<Duration>,
    pub newest_outcome_age: Option<Duration>,
    /// Remaining OPEN time; zero once a trial would be admitted.
    pub time_until_half_open: Option<Duration>,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    /// (timestamp, success)
    outcomes: VecDeque<(Instant, bool)>,
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    total_calls: u64,
    total_rejections: u64,
}

impl Inner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            outcomes: VecDeque::new(),
            opened_at: None,
            trial_in_flight: false,
            total_calls: 0,
            total_rejections: 0,
        }
    }

    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.outcomes.front() {
            if now.duration_since(*at) > window {
                self.outcomes.pop_front();
            } else {
                break;
            }
        }
    }

    fn failures(&self) -> u32 {
        self.outcomes.iter().filter(|(_, ok)| !ok).count() as u32
    }
}

/// A circuit breaker guarding one named operation.
///
/// Shared between concurrent callers; all state sits behind one mutex that
/// is never held across an await.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(Inner::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    pub fn state(&self) -> CircuitState {
        self.lock().state
    }

    /// Run `op` through the breaker.
    ///
    /// Fails with [`Error::CircuitOpen`] without calling `op` while the
    /// circuit is open or a half-open trial is already running.
    pub async fn execute<F, Fut, T>(&self, op: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = Permit::new(self, self.admit()?);
        let result = op().await;
        permit.complete(result.is_ok());
        result
    }

    /// Open a stream through the breaker and record how it ends.
    ///
    /// Admission works like [`execute`](Self::execute). A failed open counts
    /// as a failure. Once open, the first `Err` item counts as a failure and
    /// a clean end as a success. A stream dropped before either records
    /// nothing.
    pub async fn execute_stream<F, Fut, S, T>(
        self: &Arc<Self>,
        open: F,
    ) -> Result<BoxStream<'static, Result<T>>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<S>>,
        S: Stream<Item = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let mut permit = Permit::new(Arc::clone(self), self.admit()?);
        match open().await {
            Ok(stream) => Ok(OutcomeStream {
                inner: stream.boxed(),
                permit: Some(permit),
            }
            .boxed()),
            Err(e) => {
                permit.complete(false);
                Err(e)
            }
        }
    }

    /// Force CLOSED and forget all recorded outcomes.
    pub fn reset(&self) {
        let mut inner = self.lock();
        let previous = inner.state;
        *inner = Inner::new();
        drop(inner);
        if previous != CircuitState::Closed {
            self.record_transition(previous, CircuitState::Closed);
        }
        tracing::info!(operation = %self.name, "Circuit breaker reset");
    }

    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune(now, self.config.sliding_window);

        let failures = inner.failures();
        let time_until_half_open = match (inner.state, inner.opened_at) {
            (CircuitState::Open, Some(opened)) => Some(
                self.config
                    .recovery_timeout
                    .saturating_sub(now.duration_since(opened)),
            ),
            _ => None,
        };

        CircuitBreakerMetrics {
            name: self.name.clone(),
            state: inner.state,
            failures_in_window: failures,
            successes_in_window: inner.outcomes.len() as u32 - failures,
            total_calls: inner.total_calls,
            total_rejections: inner.total_rejections,
            window: self.config.sliding_window,
            oldest_outcome_age: inner.outcomes.front().map(|(at, _)| now.duration_since(*at)),
            newest_outcome_age: inner.outcomes.back().map(|(at, _)| now.duration_since(*at)),
            time_until_half_open,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Admit one call. `Ok(true)` marks the half-open trial.
    fn admit(&self) -> Result<bool> {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.total_calls += 1;

        match inner.state {
            CircuitState::Closed => Ok(false),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|opened| now.duration_since(opened))
                    .unwrap_or(self.config.recovery_timeout);
                if elapsed >= self.config.recovery_timeout {
                    inner.state = CircuitState::HalfOpen;
                    inner.trial_in_flight = true;
                    drop(inner);
                    self.record_transition(CircuitState::Open, CircuitState::HalfOpen);
                    Ok(true)
                } else {
                    inner.total_rejections += 1;
                    drop(inner);
                    Err(self.reject(self.config.recovery_timeout - elapsed))
                }
            }
            CircuitState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_rejections += 1;
                    drop(inner);
                    Err(self.reject(Duration::ZERO))
                } else {
                    inner.trial_in_flight = true;
                    Ok(true)
                }
            }
        }
    }

    fn reject(&self, retry_after: Duration) -> Error {
        metrics::counter!("circuit_breaker_rejections_total", "operation" => self.name.clone())
            .increment(1);
        tracing::debug!(operation = %self.name, retry_after = ?retry_after, "Circuit breaker rejected call");
        Error::CircuitOpen {
            operation: self.name.clone(),
            retry_after,
        }
    }

    fn record(&self, trial: bool, success: bool) {
        let now = Instant::now();
        let mut inner = self.lock();
        inner.prune(now, self.config.sliding_window);
        inner.outcomes.push_back((now, success));

        let transition = if trial {
            inner.trial_in_flight = false;
            if success {
                inner.outcomes.clear();
                inner.opened_at = None;
                inner.state = CircuitState::Closed;
                Some((CircuitState::HalfOpen, CircuitState::Closed))
            } else {
                inner.opened_at = Some(now);
                inner.state = CircuitState::Open;
                Some((CircuitState::HalfOpen, CircuitState::Open))
            }
        } else if !success
            && inner.state == CircuitState::Closed
            && inner.failures() >= self.config.failure_threshold
        {
            inner.opened_at = Some(now);
            inner.state = CircuitState::Open;
            Some((CircuitState::Closed, CircuitState::Open))
        } else {
            None
        };
        let failures = inner.failures();
        drop(inner);

        if let Some((from, to)) = transition {
            if to == CircuitState::Open {
                tracing::warn!(
                    operation = %self.name,
                    from = %from,
                    failures,
                    recovery_timeout = ?self.config.recovery_timeout,
                    "Circuit breaker OPENED"
                );
                metrics::counter!(
                    "circuit_breaker_transitions_total",
                    "operation" => self.name.clone(),
                    "to" => to.as_str()
                )
                .increment(1);
            } else {
                self.record_transition(from, to);
            }
        }
    }

    /// Abandoned trial (caller dropped the future): allow another trial.
    fn release_trial(&self) {
        self.lock().trial_in_flight = false;
    }

    fn record_transition(&self, from: CircuitState, to: CircuitState) {
        tracing::info!(operation = %self.name, from = %from, to = %to, "Circuit breaker state changed");
        metrics::counter!(
            "circuit_breaker_transitions_total",
            "operation" => self.name.clone(),
            "to" => to.as_str()
        )
        .increment(1);
    }
}

/// Admission for one call. Dropping it uncompleted frees a half-open trial slot.
struct Permit<B: Deref<Target = CircuitBreaker>> {
    breaker: B,
    trial: bool,
    completed: bool,
}

impl<B: Deref<Target = CircuitBreaker>> Permit<B> {
    fn new(breaker: B, trial: bool) -> Self {
        Self {
            breaker,
            trial,
            completed: false,
        }
    }

    fn complete(&mut self, success: bool) {
        self.completed = true;
        self.breaker.record(self.trial, success);
    }
}

impl<B: Deref<Target = CircuitBreaker>> Drop for Permit<B> {
    fn drop(&mut self) {
        if !self.completed && self.trial {
            self.breaker.release_trial();
        }
    }
}

/// Forwards items and completes the permit on the first error or the end.
struct OutcomeStream<T> {
    inner: BoxStream<'static, Result<T>>,
    permit: Option<Permit<Arc<CircuitBreaker>>>,
}

impl<T> Stream for OutcomeStream<T> {
    type Item = Result<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let item = match this.inner.as_mut().poll_next(cx) {
            Poll::Pending => return Poll::Pending,
            Poll::Ready(item) => item,
        };
        let outcome = match &item {
            Some(Ok(_)) => None,
            Some(Err(_)) => Some(false),
            None => Some(true),
        };
        if let Some(success) = outcome {
            if let Some(mut permit) = this.permit.take() {
                permit.complete(success);
            }
        }
        Poll::Ready(item)
    }
}
