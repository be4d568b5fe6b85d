use futures::stream::{BoxStream, StreamExt};
use secrecy::{ExposeSecret, Secret};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use agent_runner_core::config::TransportSettings;
use agent_runner_core::{Error, ExecSpec, Message, Result};
use agent_runner_sandbox::{InteractiveProcess, Sandbox};

use crate::command::build_command;
use crate::options::{CliOptions, OutputFormat};
use crate::parser::StreamingParser;

/// Environment variable identifying the calling SDK to the agent CLI.
pub const ENTRYPOINT_ENV: &str = "CLAUDE_CODE_ENTRYPOINT";

/// Messages buffered between the reader task and a slow consumer.
const STREAM_CHANNEL_CAPACITY: usize = 64;

/// Ordered stream of messages from a running query.
pub type MessageStream = BoxStream<'static, Result<Message>>;

// =============================================================================
// Transport Config
// =============================================================================

#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Agent CLI executable.
    pub binary: String,
    /// Value of [`ENTRYPOINT_ENV`].
    pub entrypoint: String,
    /// Host variable holding the API key, passed through when set.
    pub api_key_env: String,
    /// Explicit API key; wins over the host variable.
    pub api_key: Option<Secret<String>>,
    /// Timeout for `--version` probes.
    pub probe_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            binary: "claude".to_string(),
            entrypoint: "sdk-rust".to_string(),
            api_key_env: "ANTHROPIC_API_KEY".to_string(),
            api_key: None,
            probe_timeout: Duration::from_secs(5),
        }
    }
}

impl From<&TransportSettings> for TransportConfig {
    fn from(settings: &TransportSettings) -> Self {
        Self {
            binary: settings.binary.clone(),
            entrypoint: settings.entrypoint.clone(),
            api_key_env: settings.api_key_env.clone(),
            api_key: settings.api_key.clone(),
            probe_timeout: Duration::from_secs(settings.probe_timeout_secs),
        }
    }
}

// =============================================================================
// CLI Transport
// =============================================================================

/// Runs the agent CLI inside a sandbox and turns its output into messages.
///
/// The transport never retries; wrap calls in a resilience manager for that.
pub struct CliTransport {
    sandbox: Arc<dyn Sandbox>,
    config: TransportConfig,
}

impl std::fmt::Debug for CliTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliTransport")
            .field("sandbox", &self.sandbox.kind())
            .field("binary", &self.config.binary)
            .finish()
    }
}

impl CliTransport {
    pub fn new(sandbox: Arc<dyn Sandbox>, config: TransportConfig) -> Self {
        Self { sandbox, config }
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }

    /// Argument vector for `prompt`, binary first.
    pub fn build_command(&self, prompt: &str, options: &CliOptions) -> Vec<String> {
        build_command(&self.config.binary, prompt, options)
    }

    /// Exec spec for a query: command line, environment, working dir and timeout.
    pub fn exec_spec(&self, prompt: &str, options: &CliOptions) -> Result<ExecSpec> {
        let mut builder = ExecSpec::builder()
            .args(self.build_command(prompt, options))
            .envs(self.environment(options))
            .timeout(options.timeout);
        if let Some(dir) = &options.working_dir {
            builder = builder.working_dir(dir.clone());
        }
        builder.build()
    }

    /// Subprocess environment: option overrides, the API key when
    /// available, and the entrypoint marker.
    fn environment(&self, options: &CliOptions) -> BTreeMap<String, String> {
        let mut env = options.env.clone();

        let api_key = match &self.config.api_key {
            Some(key) => Some(key.expose_secret().clone()),
            None => std::env::var(&self.config.api_key_env)
                .ok()
                .filter(|v| !v.is_empty()),
        };
        if let Some(key) = api_key {
            env.insert(self.config.api_key_env.clone(), key);
        }

        env.insert(ENTRYPOINT_ENV.to_string(), self.config.entrypoint.clone());
        env
    }

    /// Run a query to completion.
    ///
    /// A non-zero exit code is always [`Error::ProcessFailed`] carrying the
    /// captured output.
    pub async fn execute_query(&self, prompt: &str, options: &CliOptions) -> Result<Vec<Message>> {
        let spec = self.exec_spec(prompt, options)?;
        tracing::debug!(
            sandbox = self.sandbox.kind(),
            format = %options.output_format,
            command = %spec.display_command(),
            "Executing agent query"
        );

        let result = self.sandbox.exec(&spec).await?;
        if !result.success() {
            tracing::warn!(
                exit_code = result.exit_code,
                elapsed_ms = result.duration.as_millis() as u64,
                "Agent CLI exited with failure"
            );
            return Err(Error::ProcessFailed {
                exit_code: result.exit_code,
                output: result.log,
            });
        }

        let mut messages = Self::parse_output(&result.log, options.output_format)?;
        if options.output_format == OutputFormat::Text {
            for message in &mut messages {
                if let Message::Result(result_msg) = message {
                    result_msg.duration_ms = result.duration.as_millis() as u64;
                }
            }
        }

        tracing::debug!(
            messages = messages.len(),
            elapsed_ms = result.duration.as_millis() as u64,
            "Agent query completed"
        );
        Ok(messages)
    }

    /// Start a query and stream its messages as they are parsed.
    ///
    /// Messages arrive in output order. Dropping the stream kills the
    /// subprocess. `options.timeout` bounds the whole stream; when it fires
    /// the process is killed and the stream ends with [`Error::Timeout`].
    pub async fn execute_streaming_query(
        &self,
        prompt: &str,
        options: &CliOptions,
    ) -> Result<MessageStream> {
        let spec = self.exec_spec(prompt, options)?;
        tracing::debug!(
            sandbox = self.sandbox.kind(),
            format = %options.output_format,
            command = %spec.display_command(),
            "Starting streaming agent query"
        );

        let mut process = self.sandbox.start_interactive(&spec).await?;
        // The prompt is an argument; an open stdin would make the CLI wait for input.
        process.close_stdin().await?;

        let (tx, rx) = mpsc::channel(STREAM_CHANNEL_CAPACITY);
        tokio::spawn(pump_messages(
            process,
            StreamingParser::new(options.output_format),
            options.timeout,
            tx,
        ));

        Ok(ReceiverStream::new(rx).boxed())
    }

    /// Parse captured output for `format`.
    pub fn parse_output(output: &str, format: OutputFormat) -> Result<Vec<Message>> {
        StreamingParser::new(format).messages(output.lines()).collect()
    }

    /// Whether the agent CLI can be launched in the sandbox. Never fails.
    pub async fn is_available(&self) -> bool {
        match self.probe().await {
            Ok(Some(_)) => true,
            Ok(None) => false,
            Err(e) => {
                tracing::debug!(error = %e, binary = %self.config.binary, "Agent CLI probe failed");
                false
            }
        }
    }

    /// First line of `--version` output, if the CLI runs.
    pub async fn version(&self) -> Option<String> {
        self.probe().await.ok().flatten()
    }

    async fn probe(&self) -> Result<Option<String>> {
        let spec = ExecSpec::builder()
            .arg(self.config.binary.clone())
            .arg("--version")
            .timeout(self.config.probe_timeout)
            .build()?;
        let result = self.sandbox.exec(&spec).await?;
        if !result.success() {
            tracing::debug!(exit_code = result.exit_code, "Agent CLI probe exited non-zero");
            return Ok(None);
        }
        Ok(Some(
            result
                .log
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .unwrap_or_default()
                .to_string(),
        ))
    }
}

enum PumpOutcome {
    /// The process exited and every item was delivered.
    Finished,
    /// The consumer dropped the stream.
    Cancelled,
    /// Reading output failed; the error was delivered.
    Failed,
}

/// Raw output seen while streaming, for failure reports.
#[derive(Default)]
struct CapturedOutput {
    stdout: String,
}

impl CapturedOutput {
    fn push_line(&mut self, line: &str) {
        self.stdout.push_str(line);
        self.stdout.push('\n');
    }

    fn combined(&self, stderr: &str) -> String {
        let mut output = self.stdout.clone();
        output.push_str(stderr);
        output.trim_end().to_string()
    }
}

/// Read lines from `process`, parse them and forward messages until the
/// output ends, the consumer goes away, or the deadline passes.
///
/// The deadline covers reading, delivery to a slow consumer and the final
/// wait, so a stalled consumer cannot keep the process alive past `timeout`.
async fn pump_messages(
    mut process: InteractiveProcess,
    mut parser: StreamingParser,
    timeout: Duration,
    tx: mpsc::Sender<Result<Message>>,
) {
    let start = Instant::now();
    let mut captured = CapturedOutput::default();

    let outcome = tokio::select! {
        outcome = drive(&mut process, &mut parser, &tx, &mut captured) => Some(outcome),
        _ = tokio::time::sleep(timeout) => None,
    };

    match outcome {
        Some(PumpOutcome::Finished) => {}
        Some(PumpOutcome::Cancelled) => {
            tracing::debug!(command = %process.command(), "Stream consumer dropped, killing agent CLI");
            kill(&mut process).await;
        }
        Some(PumpOutcome::Failed) => kill(&mut process).await,
        None => {
            kill(&mut process).await;
            let elapsed = start.elapsed();
            tracing::warn!(
                timeout = ?timeout,
                elapsed_ms = elapsed.as_millis() as u64,
                "Streaming agent query timed out, process killed"
            );
            let _ = tx.send(Err(Error::Timeout { timeout, elapsed })).await;
        }
    }
}

async fn drive(
    process: &mut InteractiveProcess,
    parser: &mut StreamingParser,
    tx: &mpsc::Sender<Result<Message>>,
    captured: &mut CapturedOutput,
) -> PumpOutcome {
    loop {
        let line = tokio::select! {
            _ = tx.closed() => return PumpOutcome::Cancelled,
            line = process.next_line() => line,
        };
        match line {
            Ok(Some(line)) => {
                captured.push_line(&line);
                if let Some(message) = parser.feed(&line) {
                    if !deliver(tx, Ok(message)).await {
                        return PumpOutcome::Cancelled;
                    }
                }
            }
            Ok(None) => break,
            Err(e) => {
                deliver(tx, Err(e)).await;
                return PumpOutcome::Failed;
            }
        }
    }

    let items: Vec<Result<Message>> = match process.wait().await {
        Ok(0) => match parser.finish() {
            Ok(messages) => messages.into_iter().map(Ok).collect(),
            Err(e) => vec![Err(e)],
        },
        Ok(exit_code) => {
            tracing::warn!(exit_code, "Streaming agent CLI exited with failure");
            vec![Err(Error::ProcessFailed {
                exit_code,
                output: captured.combined(process.stderr()),
            })]
        }
        Err(e) => vec![Err(e)],
    };
    for item in items {
        // The process has exited; a departed consumer needs no kill.
        if !deliver(tx, item).await {
            break;
        }
    }
    PumpOutcome::Finished
}

/// Send once the consumer has room. False if the consumer is gone.
async fn deliver(tx: &mpsc::Sender<Result<Message>>, item: Result<Message>) -> bool {
    match tx.reserve().await {
        Ok(permit) => {
            permit.send(item);
            true
        }
        Err(_) => false,
    }
}

async fn kill(process: &mut InteractiveProcess) {
    if let Err(e) = process.kill().await {
        tracing::warn!(error = %e, command = %process.command(), "Failed to kill agent CLI");
    }
}
