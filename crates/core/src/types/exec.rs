use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{Error, Result};

/// Timeout applied when an [`ExecSpec`] does not set one.
pub const DEFAULT_EXEC_TIMEOUT: Duration = Duration::from_secs(300);

// =============================================================================
// Exec Types
// =============================================================================

/// An immutable request to run one command inside a sandbox.
///
/// Built with [`ExecSpec::builder`] or [`ExecSpec::shell`]; an empty command is
/// rejected at build time. Deserialization goes through the same checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "ExecSpecBuilder")]
pub struct ExecSpec {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Duration,
}

impl ExecSpec {
    /// Start building a spec.
    pub fn builder() -> ExecSpecBuilder {
        ExecSpecBuilder::default()
    }

    /// Start building a spec that runs `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> ExecSpecBuilder {
        ExecSpecBuilder::default()
            .arg("sh")
            .arg("-c")
            .arg(script)
    }

    /// Program followed by its arguments.
    pub fn command(&self) -> &[String] {
        &self.command
    }

    /// The program to run.
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    /// Arguments after the program.
    pub fn args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// Requested working directory, possibly relative.
    pub fn working_dir(&self) -> Option<&Path> {
        self.working_dir.as_deref()
    }

    /// Environment overrides. These win over inherited variables.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Resolve the working directory against a sandbox root.
    ///
    /// Relative paths are joined onto `root`; absolute paths are kept.
    pub fn resolve_working_dir(&self, root: &Path) -> PathBuf {
        match &self.working_dir {
            Some(dir) if dir.is_absolute() => dir.clone(),
            Some(dir) => root.join(dir),
            None => root.to_path_buf(),
        }
    }

    /// Printable form of the command line, for logs and errors.
    pub fn display_command(&self) -> String {
        self.command.join(" ")
    }

    /// Derive a builder pre-filled with this spec.
    pub fn to_builder(&self) -> ExecSpecBuilder {
        ExecSpecBuilder {
            command: self.command.clone(),
            working_dir: self.working_dir.clone(),
            env: self.env.clone(),
            timeout: Some(self.timeout),
        }
    }
}

/// Builder for [`ExecSpec`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ExecSpecBuilder {
    command: Vec<String>,
    working_dir: Option<PathBuf>,
    env: BTreeMap<String, String>,
    timeout: Option<Duration>,
}

impl ExecSpecBuilder {
    /// Append one argument (the first one is the program).
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.command.push(arg.into());
        self
    }

    /// Append several arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set an environment variable. A later call with the same key replaces the value.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Finish the spec.
    pub fn build(self) -> Result<ExecSpec> {
        match self.command.first() {
            None => return Err(Error::invalid_spec("command must not be empty")),
            Some(program) if program.trim().is_empty() => {
                return Err(Error::invalid_spec("program name must not be blank"))
            }
            Some(_) => {}
        }
        if let Some(key) = self.env.keys().find(|k| k.is_empty() || k.contains('=')) {
            return Err(Error::invalid_spec(format!(
                "invalid environment variable name '{}'",
                key
            )));
        }
        let timeout = self.timeout.unwrap_or(DEFAULT_EXEC_TIMEOUT);
        if timeout.is_zero() {
            return Err(Error::invalid_spec("timeout must be greater than zero"));
        }

        Ok(ExecSpec {
            command: self.command,
            working_dir: self.working_dir,
            env: self.env,
            timeout,
        })
    }
}

impl TryFrom<ExecSpecBuilder> for ExecSpec {
    type Error = Error;

    fn try_from(builder: ExecSpecBuilder) -> Result<Self> {
        builder.build()
    }
}

/// Result of one completed command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    /// Exit code of the process. Signal deaths map to `128 + signal`.
    pub exit_code: i64,
    /// Combined stdout and stderr, in arrival order.
    pub log: String,
    /// Wall-clock time between launch and termination.
    pub duration: Duration,
}

impl ExecResult {
    /// Whether the execution was successful (exit code 0).
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_rejects_empty_command() {
        let err = ExecSpec::builder().build().unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));

        let err = ExecSpec::builder().arg("  ").build().unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }

    #[test]
    fn test_deserialize_validates_like_build() {
        let err = serde_json::from_str::<ExecSpec>(r#"{"command":[],"env":{}}"#).unwrap_err();
        assert!(err.to_string().contains("command must not be empty"));

        let spec = ExecSpec::shell("echo hi")
            .timeout(Duration::from_secs(9))
            .build()
            .unwrap();
        let json = serde_json::to_string(&spec).unwrap();
        assert_eq!(serde_json::from_str::<ExecSpec>(&json).unwrap(), spec);

        let defaulted: ExecSpec = serde_json::from_str(r#"{"command":["ls"]}"#).unwrap();
        assert_eq!(defaulted.program(), "ls");
        assert_eq!(defaulted.timeout(), DEFAULT_EXEC_TIMEOUT);
    }

    #[test]
    fn test_shell_form() {
        let spec = ExecSpec::shell("exit 3").build().unwrap();
        assert_eq!(spec.command(), ["sh", "-c", "exit 3"]);
        assert_eq!(spec.program(), "sh");
        assert_eq!(spec.timeout(), DEFAULT_EXEC_TIMEOUT);
    }

    #[test]
    fn test_env_keys_are_unique_last_wins() {
        let spec = ExecSpec::builder()
            .arg("env")
            .env("A", "1")
            .env("A", "2")
            .build()
            .unwrap();
        assert_eq!(spec.env().len(), 1);
        assert_eq!(spec.env()["A"], "2");
    }

    #[test]
    fn test_invalid_env_key_rejected() {
        let err = ExecSpec::builder()
            .arg("env")
            .env("A=B", "1")
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("A=B"));
    }

    #[test]
    fn test_working_dir_resolution() {
        let root = Path::new("/work");
        let relative = ExecSpec::builder()
            .arg("ls")
            .working_dir("src")
            .build()
            .unwrap();
        assert_eq!(relative.resolve_working_dir(root), PathBuf::from("/work/src"));

        let absolute = ExecSpec::builder()
            .arg("ls")
            .working_dir("/tmp")
            .build()
            .unwrap();
        assert_eq!(absolute.resolve_working_dir(root), PathBuf::from("/tmp"));

        let none = ExecSpec::builder().arg("ls").build().unwrap();
        assert_eq!(none.resolve_working_dir(root), PathBuf::from("/work"));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let err = ExecSpec::builder()
            .arg("true")
            .timeout(Duration::ZERO)
            .build()
            .unwrap_err();
        assert!(matches!(err, Error::InvalidSpec(_)));
    }
}
