#![deny(unused)]
//! agent-runner: read a prompt on stdin, run it through the agent CLI in a
//! sandbox, print each message as a JSON line.

use anyhow::Context;
use tokio::io::AsyncReadExt;

use agent_runner::{telemetry, validate_prompt, Runner};
use agent_runner_core::config::AppConfig;
use agent_runner_sandbox::{open_sandbox, SandboxConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::load().context("Failed to load configuration")?;
    telemetry::configure_tracing(config.telemetry.json_logs)?;

    let metrics_handle = if config.telemetry.prometheus {
        Some(telemetry::setup_metrics_recorder()?)
    } else {
        None
    };

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting agent-runner");

    let mut input = String::new();
    tokio::io::stdin()
        .read_to_string(&mut input)
        .await
        .context("Failed to read prompt from stdin")?;
    let prompt = validate_prompt(&input)?;

    let sandbox = open_sandbox(&SandboxConfig::from(&config.sandbox)).await?;
    let runner = Runner::from_config(&config, sandbox.clone())?;

    if !runner.transport().is_available().await {
        tracing::warn!(
            binary = %runner.transport().config().binary,
            sandbox = sandbox.kind(),
            "Agent CLI did not answer --version; running anyway"
        );
    }

    let mut stdout = std::io::stdout();
    let outcome = runner.run(prompt, &mut stdout).await;

    if let Err(e) = sandbox.close().await {
        tracing::warn!(error = %e, "Failed to close sandbox");
    }

    for metrics in runner.resilience().all_metrics() {
        tracing::debug!(
            operation = %metrics.name,
            state = %metrics.state,
            total_calls = metrics.total_calls,
            total_rejections = metrics.total_rejections,
            "Circuit breaker summary"
        );
    }
    if let Some(handle) = metrics_handle {
        tracing::debug!(snapshot = %handle.render(), "Metrics snapshot");
    }

    let summary = outcome?;
    tracing::info!(
        messages = summary.messages,
        session_id = ?summary.result.as_ref().and_then(|r| r.session_id.clone()),
        "Query finished"
    );
    if summary.is_error() {
        anyhow::bail!("agent reported an error result");
    }
    Ok(())
}
