#![deny(unused)]
//! Resilience decorators for agent calls.
//!
//! - [`CircuitBreaker`]: per-operation CLOSED / OPEN / HALF_OPEN guard
//! - [`retry`]: bounded retry with exponential backoff
//! - [`ResilienceManager`]: both composed per operation name, plus an
//!   overall timeout for calls and streams
//!
//! The decorators wrap any `FnMut() -> Future<Output = Result<T>>`, so they
//! can be tested and used independently of the transport.

pub mod circuit_breaker;
pub mod deadline;
pub mod manager;
pub mod retry;

pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerMetrics, CircuitState};
pub use deadline::DeadlineStream;
pub use manager::{ResilienceConfig, ResilienceManager};
pub use retry::{retry, RetryConfig, RetryPredicate};
