#![deny(unused)]
//! Agent runner
//!
//! Runs a coding-agent CLI inside a sandbox (a local process group or a
//! long-lived container), parses what it prints into typed messages, and
//! guards every query with a circuit breaker, retries and a deadline.
//!
//! ```text
//! stdin prompt ──► Runner ──► ResilienceManager ──► CliTransport ──► Sandbox
//!                    │          (breaker, retry,      (command,       (local /
//!                    ▼           deadline)             parsers)        container)
//!              JSON lines on stdout
//! ```

pub mod runner;
pub mod telemetry;

pub use runner::{validate_prompt, RunSummary, Runner, QUERY_OPERATION};
