//! Host-process sandbox.
//!
//! Commands run directly on the host through `tokio::process`. There is no
//! isolation boundary: the sandbox only pins a working directory and bounds
//! each command by its timeout. Every child is started in its own process
//! group so a timeout or kill takes down the whole tree.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::process::{Child, Command};

use agent_runner_core::{Error, ExecResult, ExecSpec, Result};

use crate::process::{exit_code_of, merge_output, InteractiveProcess, OutputChunk, ProcessControl};
use crate::Sandbox;

/// How long output may stay open after the command exits.
const OUTPUT_DRAIN_GRACE: Duration = Duration::from_millis(250);

/// Sandbox running commands as host processes.
#[derive(Debug)]
pub struct LocalSandbox {
    work_dir: PathBuf,
    /// Present only when the sandbox created its own directory.
    owned_dir: Mutex<Option<TempDir>>,
    closed: AtomicBool,
}

impl LocalSandbox {
    /// Use a caller-supplied directory. It is never deleted by the sandbox.
    pub fn new(work_dir: impl Into<PathBuf>) -> Result<Self> {
        let work_dir = work_dir.into();
        if !work_dir.is_dir() {
            return Err(Error::invalid_spec(format!(
                "working directory '{}' does not exist",
                work_dir.display()
            )));
        }
        Ok(Self {
            work_dir,
            owned_dir: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Create a fresh temporary directory owned by the sandbox and removed on close.
    pub fn temporary() -> Result<Self> {
        let dir = tempfile::Builder::new()
            .prefix("agent-runner-")
            .tempdir()?;
        tracing::debug!(work_dir = %dir.path().display(), "Created sandbox-owned work dir");
        Ok(Self {
            work_dir: dir.path().to_path_buf(),
            owned_dir: Mutex::new(Some(dir)),
            closed: AtomicBool::new(false),
        })
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_state("local sandbox is closed"));
        }
        Ok(())
    }

    fn command(&self, spec: &ExecSpec, stdin: Stdio) -> Command {
        let mut cmd = Command::new(spec.program());
        cmd.args(spec.args())
            .current_dir(spec.resolve_working_dir(&self.work_dir))
            // Inherited host env first, spec overrides win.
            .envs(spec.env())
            .stdin(stdin)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);
        cmd
    }

    fn spawn(&self, spec: &ExecSpec, stdin: Stdio) -> Result<Child> {
        self.command(spec, stdin)
            .spawn()
            .map_err(|e| Error::launch(spec.display_command(), e))
    }
}

#[async_trait]
impl Sandbox for LocalSandbox {
    async fn exec(&self, spec: &ExecSpec) -> Result<ExecResult> {
        self.ensure_open()?;

        let start = Instant::now();
        let mut child = self.spawn(spec, Stdio::null())?;
        tracing::debug!(command = %spec.display_command(), pid = ?child.id(), "Local exec started");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("stdout pipe not available"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal("stderr pipe not available"))?;
        let pid = child.id();
        let mut output = merge_output(stdout, stderr);
        let mut log = Vec::new();

        let run = async {
            let mut output_open = true;
            let status = loop {
                tokio::select! {
                    chunk = output.next(), if output_open => match chunk {
                        Some(chunk) => push_chunk(&mut log, chunk?),
                        None => output_open = false,
                    },
                    status = child.wait() => break status?,
                }
            };

            // Descendants may still hold the pipes after the command itself
            // exited. Take what is already written, then clear them out.
            if output_open {
                let drain = async {
                    while let Some(chunk) = output.next().await {
                        push_chunk(&mut log, chunk?);
                    }
                    Ok::<_, Error>(())
                };
                match tokio::time::timeout(OUTPUT_DRAIN_GRACE, drain).await {
                    Ok(drained) => drained?,
                    Err(_) => {
                        tracing::debug!(
                            command = %spec.display_command(),
                            "Output still open after exit, killing leftover processes"
                        );
                        kill_group(pid);
                    }
                }
            }
            Ok::<_, Error>(status)
        };
        let outcome = tokio::time::timeout(spec.timeout(), run).await;

        match outcome {
            Ok(status) => {
                let status = status?;
                let result = ExecResult {
                    exit_code: exit_code_of(status),
                    log: String::from_utf8_lossy(&log).into_owned(),
                    duration: start.elapsed(),
                };
                record_exec("local", &result);
                Ok(result)
            }
            Err(_) => {
                terminate(&mut child, pid).await;
                let elapsed = start.elapsed();
                tracing::warn!(
                    command = %spec.display_command(),
                    timeout = ?spec.timeout(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Local exec timed out, process killed"
                );
                metrics::counter!("sandbox_exec_total", "backend" => "local", "outcome" => "timeout")
                    .increment(1);
                Err(Error::Timeout {
                    timeout: spec.timeout(),
                    elapsed,
                })
            }
        }
    }

    async fn start_interactive(&self, spec: &ExecSpec) -> Result<InteractiveProcess> {
        self.ensure_open()?;

        let mut child = self.spawn(spec, Stdio::piped())?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::internal("stdin pipe not available"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("stdout pipe not available"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal("stderr pipe not available"))?;

        tracing::debug!(command = %spec.display_command(), pid = ?child.id(), "Local interactive process started");

        Ok(InteractiveProcess::new(
            spec.display_command(),
            Some(Box::pin(stdin)),
            merge_output(stdout, stderr),
            Box::new(LocalControl {
                pid: child.id(),
                child,
            }),
        ))
    }

    fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let owned = self
            .owned_dir
            .lock()
            .map(|mut guard| guard.take())
            .unwrap_or_else(|poisoned| poisoned.into_inner().take());
        if let Some(dir) = owned {
            let path = dir.path().to_path_buf();
            dir.close()?;
            tracing::debug!(work_dir = %path.display(), "Removed sandbox-owned work dir");
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn kind(&self) -> &'static str {
        "local"
    }
}

pub(crate) fn record_exec(backend: &'static str, result: &ExecResult) {
    let outcome = if result.success() { "success" } else { "failure" };
    metrics::counter!("sandbox_exec_total", "backend" => backend, "outcome" => outcome).increment(1);
    metrics::histogram!("sandbox_exec_duration_seconds", "backend" => backend)
        .record(result.duration.as_secs_f64());
}

fn push_chunk(log: &mut Vec<u8>, chunk: OutputChunk) {
    match chunk {
        OutputChunk::Stdout(bytes) | OutputChunk::Stderr(bytes) => log.extend_from_slice(&bytes),
    }
}

/// Kill the child's process group, then the child itself, and reap it.
///
/// `pid` is taken at spawn time: once the child is reaped its id is gone,
/// but the group may still have members.
async fn terminate(child: &mut Child, pid: Option<u32>) {
    kill_group(pid);
    if let Err(e) = child.kill().await {
        tracing::debug!(error = %e, "Child already gone");
    }
}

fn kill_group(pid: Option<u32>) {
    #[cfg(unix)]
    if let Some(pid) = pid {
        // SAFETY: killpg only sends a signal; the group id is the child's pid
        // because it was spawned with process_group(0).
        unsafe {
            libc::killpg(pid as libc::pid_t, libc::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = pid;
}

struct LocalControl {
    child: Child,
    pid: Option<u32>,
}

#[async_trait]
impl ProcessControl for LocalControl {
    async fn wait(&mut self) -> Result<i64> {
        let status = self.child.wait().await?;
        Ok(exit_code_of(status))
    }

    async fn kill(&mut self) -> Result<()> {
        terminate(&mut self.child, self.pid).await;
        Ok(())
    }

    fn kill_on_drop(&mut self) {
        kill_group(self.pid);
        let _ = self.child.start_kill();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(script: &str) -> ExecSpec {
        ExecSpec::shell(script)
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn test_exit_codes_are_reported() {
        let sandbox = LocalSandbox::temporary().unwrap();
        for code in [0, 1, 127] {
            let result = sandbox.exec(&spec(&format!("exit {}", code))).await.unwrap();
            assert_eq!(result.exit_code, code);
        }
        sandbox.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_combined_log_captures_both_streams() {
        let sandbox = LocalSandbox::temporary().unwrap();
        let result = sandbox
            .exec(&spec("echo out; echo err 1>&2"))
            .await
            .unwrap();
        assert!(result.success());
        assert!(result.log.contains("out"));
        assert!(result.log.contains("err"));
        assert!(result.duration > Duration::ZERO);
    }

    #[tokio::test]
    async fn test_background_descendant_does_not_mask_exit() {
        let sandbox = LocalSandbox::temporary().unwrap();
        let start = Instant::now();
        let result = sandbox
            .exec(&spec("sleep 30 & echo done; exit 3"))
            .await
            .unwrap();
        assert_eq!(result.exit_code, 3);
        assert!(result.log.contains("done"));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_spec_env_wins_over_host() {
        std::env::set_var("AGENT_RUNNER_LOCAL_TEST_VAR", "host");
        let sandbox = LocalSandbox::temporary().unwrap();
        let spec = ExecSpec::shell("printf %s \"$AGENT_RUNNER_LOCAL_TEST_VAR\"")
            .env("AGENT_RUNNER_LOCAL_TEST_VAR", "spec")
            .build()
            .unwrap();
        let result = sandbox.exec(&spec).await.unwrap();
        assert_eq!(result.log, "spec");
    }

    #[tokio::test]
    async fn test_relative_working_dir_resolves_against_sandbox() {
        let sandbox = LocalSandbox::temporary().unwrap();
        std::fs::create_dir(sandbox.work_dir().join("sub")).unwrap();
        let spec = ExecSpec::builder()
            .arg("pwd")
            .working_dir("sub")
            .build()
            .unwrap();
        let result = sandbox.exec(&spec).await.unwrap();
        assert!(result.log.trim_end().ends_with("/sub"));
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let sandbox = LocalSandbox::temporary().unwrap();
        let spec = ExecSpec::builder()
            .arg("definitely-not-a-real-binary-4242")
            .build()
            .unwrap();
        let err = sandbox.exec(&spec).await.unwrap_err();
        assert!(matches!(err, Error::Launch { .. }));
    }

    #[tokio::test]
    async fn test_owned_dir_removed_on_close_caller_dir_kept() {
        let owned = LocalSandbox::temporary().unwrap();
        let path = owned.work_dir().to_path_buf();
        owned.close().await.unwrap();
        assert!(!path.exists());

        let caller = tempfile::tempdir().unwrap();
        let borrowed = LocalSandbox::new(caller.path()).unwrap();
        borrowed.close().await.unwrap();
        assert!(caller.path().exists());
    }

    #[tokio::test]
    async fn test_interactive_echo_roundtrip() {
        let sandbox = LocalSandbox::temporary().unwrap();
        let spec = ExecSpec::builder().arg("cat").build().unwrap();
        let mut proc = sandbox.start_interactive(&spec).await.unwrap();

        proc.write_all(b"ping\n").await.unwrap();
        assert_eq!(proc.next_line().await.unwrap().as_deref(), Some("ping"));
        proc.close_stdin().await.unwrap();
        assert_eq!(proc.next_line().await.unwrap(), None);
        assert_eq!(proc.wait().await.unwrap(), 0);
    }
}
