//! Error types for the agent runner.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using the runner's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type shared by the sandbox, transport and resilience layers.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Sandbox Errors
    // =========================================================================
    #[error("Invalid exec spec: {0}")]
    InvalidSpec(String),

    #[error("Failed to launch `{command}`: {reason}")]
    Launch { command: String, reason: String },

    #[error("Timed out after {elapsed:?} (limit {timeout:?})")]
    Timeout { timeout: Duration, elapsed: Duration },

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Container engine unavailable: {0}")]
    EngineUnavailable(String),

    #[error("Container error: {0}")]
    Container(String),

    // =========================================================================
    // Transport Errors
    // =========================================================================
    #[error("Process exited with code {exit_code}: {output}")]
    ProcessFailed { exit_code: i64, output: String },

    #[error("Failed to parse output: {reason}")]
    Parse { reason: String, raw: String },

    #[error("Process succeeded but produced no output")]
    EmptyOutput,

    // =========================================================================
    // Resilience Errors
    // =========================================================================
    #[error("Circuit breaker open for '{operation}' (retry after {retry_after:?})")]
    CircuitOpen {
        operation: String,
        retry_after: Duration,
    },

    #[error("Retry exhausted after {attempts} attempts: {source}")]
    RetryExhausted {
        attempts: u32,
        #[source]
        source: Box<Error>,
    },

    // =========================================================================
    // Generic Errors
    // =========================================================================
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The layer an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorLayer {
    Sandbox,
    Transport,
    Resilience,
    Internal,
}

impl std::fmt::Display for ErrorLayer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorLayer::Sandbox => "sandbox",
            ErrorLayer::Transport => "transport",
            ErrorLayer::Resilience => "resilience",
            ErrorLayer::Internal => "internal",
        };
        f.write_str(name)
    }
}

impl Error {
    /// Create an invalid spec error.
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec(msg.into())
    }

    /// Create a launch error.
    pub fn launch(command: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::Launch {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    /// Create an invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Self::InvalidState(msg.into())
    }

    /// Create an engine unavailable error.
    pub fn engine_unavailable(msg: impl Into<String>) -> Self {
        Self::EngineUnavailable(msg.into())
    }

    /// Create a container error.
    pub fn container(msg: impl Into<String>) -> Self {
        Self::Container(msg.into())
    }

    /// Create a parse error, keeping the offending input.
    pub fn parse(reason: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Parse {
            reason: reason.into(),
            raw: raw.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Which layer raised this error.
    pub fn layer(&self) -> ErrorLayer {
        match self {
            Error::InvalidSpec(_)
            | Error::Launch { .. }
            | Error::Timeout { .. }
            | Error::InvalidState(_)
            | Error::EngineUnavailable(_)
            | Error::Container(_)
            | Error::Io(_) => ErrorLayer::Sandbox,
            Error::ProcessFailed { .. }
            | Error::Parse { .. }
            | Error::EmptyOutput
            | Error::Serialization(_) => ErrorLayer::Transport,
            Error::CircuitOpen { .. } | Error::RetryExhausted { .. } => ErrorLayer::Resilience,
            Error::Config(_) | Error::Internal(_) | Error::Other(_) => ErrorLayer::Internal,
        }
    }

    /// Default retry classification.
    ///
    /// Transient process and engine failures are retryable. Caller mistakes,
    /// malformed output and resilience verdicts are not.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Timeout { .. }
                | Error::ProcessFailed { .. }
                | Error::EmptyOutput
                | Error::Container(_)
                | Error::EngineUnavailable(_)
                | Error::Io(_)
        )
    }

    /// Whether this error is a circuit breaker fast-fail.
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, Error::CircuitOpen { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_display_carries_both_durations() {
        let err = Error::Timeout {
            timeout: Duration::from_secs(1),
            elapsed: Duration::from_millis(1003),
        };
        let msg = err.to_string();
        assert!(msg.contains("1s"));
        assert!(msg.contains("1.003s"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(Error::EmptyOutput.is_retryable());
        assert!(Error::ProcessFailed {
            exit_code: 1,
            output: "boom".into()
        }
        .is_retryable());
        assert!(!Error::parse("bad json", "{").is_retryable());
        assert!(!Error::invalid_spec("empty").is_retryable());
        assert!(!Error::CircuitOpen {
            operation: "q".into(),
            retry_after: Duration::from_secs(3)
        }
        .is_retryable());
    }

    #[test]
    fn test_layers() {
        assert_eq!(Error::launch("claude", "not found").layer(), ErrorLayer::Sandbox);
        assert_eq!(Error::EmptyOutput.layer(), ErrorLayer::Transport);
        let exhausted = Error::RetryExhausted {
            attempts: 3,
            source: Box::new(Error::EmptyOutput),
        };
        assert_eq!(exhausted.layer(), ErrorLayer::Resilience);
        assert_eq!(exhausted.layer().to_string(), "resilience");
    }

    #[test]
    fn test_retry_exhausted_exposes_source() {
        use std::error::Error as _;

        let err = Error::RetryExhausted {
            attempts: 2,
            source: Box::new(Error::ProcessFailed {
                exit_code: 2,
                output: "usage".into(),
            }),
        };
        let source = err.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(source.contains("code 2"));
    }
}
