use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use agent_runner_core::config::TransportSettings;
use agent_runner_core::{Error, Result};

/// Timeout for a whole query when none is configured.
pub const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(600);

// =============================================================================
// Output Format
// =============================================================================

/// Output protocol requested from the agent CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OutputFormat {
    /// One JSON document written when the run completes.
    #[default]
    Json,
    /// One JSON object per message, written as the run progresses.
    StreamJson,
    /// Plain text, no message boundaries.
    Text,
}

impl OutputFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutputFormat::Json => "json",
            OutputFormat::StreamJson => "stream-json",
            OutputFormat::Text => "text",
        }
    }
}

impl std::fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutputFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "json" => Ok(OutputFormat::Json),
            "stream-json" | "stream_json" => Ok(OutputFormat::StreamJson),
            "text" => Ok(OutputFormat::Text),
            other => Err(Error::invalid_spec(format!("unknown output format '{}'", other))),
        }
    }
}

// =============================================================================
// Permission Mode
// =============================================================================

/// Tool permission policy passed to the agent CLI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    Plan,
    BypassPermissions,
    /// Emitted as `--dangerously-skip-permissions` instead of `--permission-mode`.
    DangerouslySkipPermissions,
}

impl PermissionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::Plan => "plan",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::DangerouslySkipPermissions => "dangerouslySkipPermissions",
        }
    }
}

impl std::fmt::Display for PermissionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "default" => Ok(PermissionMode::Default),
            "acceptEdits" => Ok(PermissionMode::AcceptEdits),
            "plan" => Ok(PermissionMode::Plan),
            "bypassPermissions" => Ok(PermissionMode::BypassPermissions),
            "dangerouslySkipPermissions" => Ok(PermissionMode::DangerouslySkipPermissions),
            other => Err(Error::invalid_spec(format!(
                "unknown permission mode '{}'",
                other
            ))),
        }
    }
}

// =============================================================================
// CLI Options
// =============================================================================

/// Per-query options for the agent CLI.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CliOptions {
    pub model: Option<String>,
    /// Appended to the tool's built-in system prompt.
    pub append_system_prompt: Option<String>,
    pub allowed_tools: Vec<String>,
    pub disallowed_tools: Vec<String>,
    pub permission_mode: PermissionMode,
    pub output_format: OutputFormat,
    /// Bound on the whole query, including streaming.
    pub timeout: Duration,
    pub max_turns: Option<u32>,
    /// Working directory, relative to the sandbox work dir unless absolute.
    pub working_dir: Option<PathBuf>,
    /// Extra environment for the subprocess.
    pub env: BTreeMap<String, String>,
    /// Session id to resume.
    pub resume: Option<String>,
}

impl Default for CliOptions {
    fn default() -> Self {
        Self {
            model: None,
            append_system_prompt: None,
            allowed_tools: Vec::new(),
            disallowed_tools: Vec::new(),
            permission_mode: PermissionMode::Default,
            output_format: OutputFormat::Json,
            timeout: DEFAULT_QUERY_TIMEOUT,
            max_turns: None,
            working_dir: None,
            env: BTreeMap::new(),
            resume: None,
        }
    }
}

impl CliOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Options seeded from configuration.
    pub fn from_settings(settings: &TransportSettings) -> Result<Self> {
        Ok(Self {
            model: settings.default_model.clone(),
            output_format: settings.output_format.parse()?,
            permission_mode: settings.permission_mode.parse()?,
            timeout: Duration::from_secs(settings.timeout_secs),
            ..Default::default()
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.append_system_prompt = Some(prompt.into());
        self
    }

    pub fn with_allowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_disallowed_tools<I, S>(mut self, tools: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.disallowed_tools = tools.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_permission_mode(mut self, mode: PermissionMode) -> Self {
        self.permission_mode = mode;
        self
    }

    pub fn with_output_format(mut self, format: OutputFormat) -> Self {
        self.output_format = format;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_max_turns(mut self, turns: u32) -> Self {
        self.max_turns = Some(turns);
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_resume(mut self, session_id: impl Into<String>) -> Self {
        self.resume = Some(session_id.into());
        self
    }
}
