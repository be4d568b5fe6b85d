//! One prompt, end to end: sandbox, transport and resilience wired together.

use futures::StreamExt;
use std::io::Write;
use std::sync::Arc;

use agent_runner_core::config::AppConfig;
use agent_runner_core::{Error, Message, Result, ResultMessage};
use agent_runner_resilience::{ResilienceConfig, ResilienceManager};
use agent_runner_sandbox::Sandbox;
use agent_runner_transport::{CliOptions, CliTransport, OutputFormat, TransportConfig};

/// Breaker name shared by every query the runner issues.
pub const QUERY_OPERATION: &str = "agent-query";

/// What a finished run produced.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub messages: usize,
    pub result: Option<ResultMessage>,
}

impl RunSummary {
    /// True when the agent reported an error result.
    pub fn is_error(&self) -> bool {
        self.result.as_ref().is_some_and(|r| r.is_error)
    }
}

pub struct Runner {
    transport: CliTransport,
    resilience: ResilienceManager,
    options: CliOptions,
}

impl Runner {
    pub fn new(transport: CliTransport, resilience: ResilienceManager, options: CliOptions) -> Self {
        Self {
            transport,
            resilience,
            options,
        }
    }

    /// Build a runner over `sandbox` from loaded configuration.
    pub fn from_config(config: &AppConfig, sandbox: Arc<dyn Sandbox>) -> Result<Self> {
        Ok(Self::new(
            CliTransport::new(sandbox, TransportConfig::from(&config.transport)),
            ResilienceManager::new(ResilienceConfig::from(&config.resilience)),
            CliOptions::from_settings(&config.transport)?,
        ))
    }

    pub fn transport(&self) -> &CliTransport {
        &self.transport
    }

    pub fn resilience(&self) -> &ResilienceManager {
        &self.resilience
    }

    pub fn options(&self) -> &CliOptions {
        &self.options
    }

    /// Run `prompt` and write every message to `out` as one JSON line.
    ///
    /// `stream-json` output is written as it arrives; other formats are
    /// written once the query completes. The first error ends the run.
    pub async fn run<W: Write>(&self, prompt: &str, out: &mut W) -> Result<RunSummary> {
        let mut summary = RunSummary::default();

        if self.options.output_format == OutputFormat::StreamJson {
            let mut stream = self
                .resilience
                .execute_resilient_stream(QUERY_OPERATION, || {
                    self.transport.execute_streaming_query(prompt, &self.options)
                })
                .await?;
            while let Some(message) = stream.next().await {
                emit(out, &message?, &mut summary)?;
            }
        } else {
            let messages = self
                .resilience
                .execute_resilient(QUERY_OPERATION, || {
                    self.transport.execute_query(prompt, &self.options)
                })
                .await?;
            for message in &messages {
                emit(out, message, &mut summary)?;
            }
        }

        out.flush()?;
        if summary.result.is_none() {
            tracing::warn!(messages = summary.messages, "Query ended without a result message");
        }
        Ok(summary)
    }
}

fn emit<W: Write>(out: &mut W, message: &Message, summary: &mut RunSummary) -> Result<()> {
    serde_json::to_writer(&mut *out, message)?;
    out.write_all(b"\n")?;
    summary.messages += 1;
    if let Some(result) = message.as_result() {
        summary.result = Some(result.clone());
    }
    Ok(())
}

impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("transport", &self.transport)
            .field("format", &self.options.output_format)
            .finish_non_exhaustive()
    }
}

/// Reject blank prompts before anything is spawned.
pub fn validate_prompt(prompt: &str) -> Result<&str> {
    let trimmed = prompt.trim();
    if trimmed.is_empty() {
        return Err(Error::invalid_spec("prompt is empty"));
    }
    Ok(trimmed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_prompt() {
        assert_eq!(validate_prompt("  hi \n").unwrap(), "hi");
        assert!(matches!(validate_prompt(" \n\t"), Err(Error::InvalidSpec(_))));
    }

    #[test]
    fn test_summary_error_flag() {
        let mut summary = RunSummary::default();
        assert!(!summary.is_error());
        summary.result = Some(ResultMessage {
            is_error: true,
            ..Default::default()
        });
        assert!(summary.is_error());
    }
}
