//! Container sandbox driven through the Docker engine API (`bollard`).
//!
//! The sandbox owns one long-lived container kept alive by `sleep infinity`.
//! Every `exec` runs inside that container through the exec-in-container API,
//! so the filesystem and process namespace are shared between calls.
//!
//! Commands are launched through a small `sh` wrapper that records the
//! process id in a pid file before `exec`-ing the real program. Timeouts and
//! interactive kills use that pid to terminate the process tree inside the
//! container, since the engine has no API to kill an exec instance.

use async_trait::async_trait;
use base64::Engine;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, RemoveContainerOptions,
    StopContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::stream::{BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::AsyncWrite;

use agent_runner_core::{Error, ExecResult, ExecSpec, Result};

use crate::local::record_exec;
use crate::process::{InteractiveProcess, OutputChunk, OutputStream, ProcessControl};
use crate::Sandbox;

/// Label put on every container this crate creates.
pub const MANAGED_BY_LABEL: (&str, &str) = ("managed-by", "agent-runner");

/// Base64 payload size per exec when writing files.
const WRITE_CHUNK_SIZE: usize = 64 * 1024;

const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(25);
const HELPER_EXEC_TIMEOUT: Duration = Duration::from_secs(5);

/// Hook applied to the engine create-config before the container is created.
///
/// Use it for mounts, resource limits, network mode and similar settings.
pub trait ContainerCustomizer: Send + Sync {
    fn customize(&self, config: &mut Config<String>);
}

impl<F> ContainerCustomizer for F
where
    F: Fn(&mut Config<String>) + Send + Sync,
{
    fn customize(&self, config: &mut Config<String>) {
        self(config)
    }
}

/// Configuration for a [`ContainerSandbox`].
#[derive(Clone)]
pub struct ContainerConfig {
    /// Image to start (default: "agent-runner-sandbox:latest").
    pub image: String,
    /// Container name. A running container with this name is reused.
    pub name: Option<String>,
    /// Working directory inside the container.
    pub work_dir: String,
    /// Environment applied to every exec; spec entries override it.
    pub env: BTreeMap<String, String>,
    /// Leave the container running on close.
    pub keep_container: bool,
    pub customizers: Vec<Arc<dyn ContainerCustomizer>>,
}

impl std::fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("image", &self.image)
            .field("name", &self.name)
            .field("work_dir", &self.work_dir)
            .field("env_keys", &self.env.keys().collect::<Vec<_>>())
            .field("keep_container", &self.keep_container)
            .field("customizers", &self.customizers.len())
            .finish()
    }
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            image: "agent-runner-sandbox:latest".to_string(),
            name: None,
            work_dir: "/work".to_string(),
            env: BTreeMap::new(),
            keep_container: false,
            customizers: Vec::new(),
        }
    }
}

impl ContainerConfig {
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<String>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_customizer(mut self, customizer: impl ContainerCustomizer + 'static) -> Self {
        self.customizers.push(Arc::new(customizer));
        self
    }

    pub fn keep_container(mut self, keep: bool) -> Self {
        self.keep_container = keep;
        self
    }

    /// Engine create-config for this sandbox, customizers applied last.
    pub fn container_config(&self) -> Config<String> {
        let mut config = Config {
            image: Some(self.image.clone()),
            working_dir: Some(self.work_dir.clone()),
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env_list(&self.env)),
            labels: Some(HashMap::from([(
                MANAGED_BY_LABEL.0.to_string(),
                MANAGED_BY_LABEL.1.to_string(),
            )])),
            ..Default::default()
        };
        for customizer in &self.customizers {
            customizer.customize(&mut config);
        }
        config
    }
}

/// Sandbox backed by a long-lived container.
pub struct ContainerSandbox {
    docker: Docker,
    container_id: String,
    work_dir: PathBuf,
    env: BTreeMap<String, String>,
    keep_container: bool,
    closed: AtomicBool,
}

impl std::fmt::Debug for ContainerSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerSandbox")
            .field("container_id", &self.container_id)
            .field("work_dir", &self.work_dir)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ContainerSandbox {
    /// Connect to the local Docker daemon and start (or reuse) the container.
    ///
    /// An unreachable engine yields [`Error::EngineUnavailable`], which callers
    /// use to fall back to a local sandbox.
    pub async fn connect(config: ContainerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            Error::engine_unavailable(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Self::with_client(docker, config).await
    }

    /// Start (or reuse) the container using an existing client.
    pub async fn with_client(docker: Docker, config: ContainerConfig) -> Result<Self> {
        docker.ping().await.map_err(|e| {
            Error::engine_unavailable(format!("Docker daemon not reachable: {}", e))
        })?;

        let (container_id, created) = match &config.name {
            Some(name) => match find_container(&docker, name).await? {
                Some((id, true)) => {
                    tracing::info!(container = %name, "Reusing running sandbox container");
                    (id, false)
                }
                Some((id, false)) => {
                    docker
                        .start_container::<String>(&id, None)
                        .await
                        .map_err(|e| {
                            Error::container(format!("Failed to start sandbox container: {}", e))
                        })?;
                    tracing::info!(container = %name, "Restarted stopped sandbox container");
                    (id, false)
                }
                None => (create_container(&docker, &config, name).await?, true),
            },
            None => {
                let name = format!("agent-runner-{}", uuid::Uuid::new_v4());
                (create_container(&docker, &config, &name).await?, true)
            }
        };

        let sandbox = Self {
            docker,
            container_id,
            work_dir: PathBuf::from(&config.work_dir),
            env: config.env,
            keep_container: config.keep_container,
            closed: AtomicBool::new(false),
        };

        if let Err(e) = sandbox.prepare_work_dir(&config.work_dir).await {
            if created {
                if let Err(remove) = force_remove(&sandbox.docker, &sandbox.container_id).await {
                    tracing::warn!(container = %sandbox.container_id, error = %remove, "Failed to remove container after setup failure");
                }
            }
            return Err(e);
        }

        Ok(sandbox)
    }

    /// A reused container may predate the configured work dir.
    async fn prepare_work_dir(&self, work_dir: &str) -> Result<()> {
        let mkdir = ExecSpec::builder()
            .args(["mkdir", "-p", work_dir])
            .working_dir("/")
            .timeout(Duration::from_secs(30))
            .build()?;
        let result = self.exec(&mkdir).await?;
        if !result.success() {
            return Err(Error::container(format!(
                "Failed to prepare work dir {}: {}",
                work_dir, result.log
            )));
        }
        Ok(())
    }

    /// Engine id of the backing container.
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_state("container sandbox is closed"));
        }
        Ok(())
    }

    fn in_container_path(&self, path: &str) -> String {
        let path = Path::new(path);
        if path.is_absolute() {
            path.display().to_string()
        } else {
            self.work_dir.join(path).display().to_string()
        }
    }

    /// Write a file into the container, relative paths resolving against the work dir.
    ///
    /// Content is base64-encoded and appended in chunks to stay under the
    /// argument size limit.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        let target = self.in_container_path(path);
        let staging = format!("/tmp/.agent-runner-upload-{}", uuid::Uuid::new_v4());
        let b64 = base64::engine::general_purpose::STANDARD.encode(content);

        let mut first = true;
        for chunk in b64.as_bytes().chunks(WRITE_CHUNK_SIZE).chain(
            // An empty file still needs the staging file to exist.
            b64.is_empty().then_some(&[][..]),
        ) {
            let redirect = if first { ">" } else { ">>" };
            first = false;
            let script = format!(
                "printf '%s' \"$1\" {} {}",
                redirect, staging
            );
            let spec = ExecSpec::shell(script)
                .arg("sh")
                .arg(String::from_utf8_lossy(chunk).into_owned())
                .timeout(Duration::from_secs(30))
                .build()?;
            self.expect_success(&spec, "stage upload").await?;
        }

        let spec = ExecSpec::shell(
            "mkdir -p \"$(dirname \"$1\")\" && base64 -d \"$2\" > \"$1\"; rc=$?; rm -f \"$2\"; exit $rc",
        )
        .arg("sh")
        .arg(target.clone())
        .arg(staging)
        .timeout(Duration::from_secs(30))
        .build()?;
        self.expect_success(&spec, "write file").await?;

        tracing::debug!(container = %self.container_id, path = %target, bytes = content.len(), "Wrote file into sandbox");
        Ok(())
    }

    /// Read a file from the container, relative paths resolving against the work dir.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let target = self.in_container_path(path);
        let spec = ExecSpec::shell("base64 \"$1\"")
            .arg("sh")
            .arg(target)
            .timeout(Duration::from_secs(30))
            .build()?;
        let result = self.expect_success(&spec, "read file").await?;
        let cleaned: String = result.log.split_whitespace().collect();
        base64::engine::general_purpose::STANDARD
            .decode(cleaned)
            .map_err(|e| Error::container(format!("Failed to decode file '{}': {}", path, e)))
    }

    async fn expect_success(&self, spec: &ExecSpec, what: &str) -> Result<ExecResult> {
        let result = self.exec(spec).await?;
        if !result.success() {
            return Err(Error::container(format!(
                "Failed to {} in sandbox (exit code {}): {}",
                what, result.exit_code, result.log
            )));
        }
        Ok(result)
    }

    async fn start_exec(
        &self,
        spec: &ExecSpec,
        pid_file: &str,
        attach_stdin: bool,
    ) -> Result<StartedExec> {
        let mut env = self.env.clone();
        env.extend(spec.env().iter().map(|(k, v)| (k.clone(), v.clone())));

        let options = CreateExecOptions {
            cmd: Some(wrapped_command(spec, pid_file)),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            attach_stdin: Some(attach_stdin),
            working_dir: Some(spec.resolve_working_dir(&self.work_dir).display().to_string()),
            env: Some(env_list(&env)),
            ..Default::default()
        };

        let exec = self
            .docker
            .create_exec(&self.container_id, options)
            .await
            .map_err(|e| Error::launch(spec.display_command(), e))?;

        match self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::launch(spec.display_command(), e))?
        {
            StartExecResults::Attached { output, input } => Ok(StartedExec {
                exec_id: exec.id,
                output,
                input,
            }),
            StartExecResults::Detached => Err(Error::container("exec started detached")),
        }
    }
}

struct StartedExec {
    exec_id: String,
    output: BoxStream<'static, std::result::Result<LogOutput, bollard::errors::Error>>,
    input: Pin<Box<dyn AsyncWrite + Send>>,
}

#[async_trait]
impl Sandbox for ContainerSandbox {
    async fn exec(&self, spec: &ExecSpec) -> Result<ExecResult> {
        self.ensure_open()?;

        let start = Instant::now();
        let pid_file = pid_file_path();
        let run = async {
            let StartedExec {
                exec_id,
                mut output,
                input,
            } = self.start_exec(spec, &pid_file, false).await?;
            drop(input);

            let mut log = Vec::new();
            while let Some(msg) = output.next().await {
                match msg {
                    Ok(LogOutput::StdOut { message })
                    | Ok(LogOutput::StdErr { message })
                    | Ok(LogOutput::Console { message }) => log.extend_from_slice(&message),
                    Ok(LogOutput::StdIn { .. }) => {}
                    Err(e) => {
                        return Err(Error::container(format!("Exec output stream failed: {}", e)))
                    }
                }
            }
            let exit_code = wait_exec(&self.docker, &exec_id).await?;
            Ok::<_, Error>((exit_code, log))
        };

        let (exit_code, log) = match tokio::time::timeout(spec.timeout(), run).await {
            Ok(finished) => {
                remove_pid_file(&self.docker, &self.container_id, &pid_file).await;
                finished?
            }
            Err(_) => {
                if let Err(e) = kill_in_container(&self.docker, &self.container_id, &pid_file).await
                {
                    tracing::warn!(error = %e, "Failed to kill timed-out exec");
                }
                let elapsed = start.elapsed();
                tracing::warn!(
                    container = %self.container_id,
                    command = %spec.display_command(),
                    timeout = ?spec.timeout(),
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Container exec timed out, process killed"
                );
                metrics::counter!("sandbox_exec_total", "backend" => "container", "outcome" => "timeout")
                    .increment(1);
                return Err(Error::Timeout {
                    timeout: spec.timeout(),
                    elapsed,
                });
            }
        };

        let result = ExecResult {
            exit_code,
            log: String::from_utf8_lossy(&log).into_owned(),
            duration: start.elapsed(),
        };
        record_exec("container", &result);
        Ok(result)
    }

    async fn start_interactive(&self, spec: &ExecSpec) -> Result<InteractiveProcess> {
        self.ensure_open()?;

        let pid_file = pid_file_path();
        let started = self.start_exec(spec, &pid_file, true).await?;
        tracing::debug!(container = %self.container_id, command = %spec.display_command(), "Container interactive exec started");

        Ok(InteractiveProcess::new(
            spec.display_command(),
            Some(started.input),
            log_output_stream(started.output),
            Box::new(ContainerControl {
                docker: self.docker.clone(),
                container_id: self.container_id.clone(),
                exec_id: started.exec_id,
                pid_file,
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
        if self.keep_container {
            tracing::info!(container = %self.container_id, "Leaving sandbox container running");
            return Ok(());
        }

        // Stop the container (with 5s grace period)
        let _ = self
            .docker
            .stop_container(&self.container_id, Some(StopContainerOptions { t: 5 }))
            .await;

        force_remove(&self.docker, &self.container_id).await?;

        tracing::info!(container = %self.container_id, "Sandbox container destroyed");
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn kind(&self) -> &'static str {
        "container"
    }
}

struct ContainerControl {
    docker: Docker,
    container_id: String,
    exec_id: String,
    pid_file: String,
}

#[async_trait]
impl ProcessControl for ContainerControl {
    async fn wait(&mut self) -> Result<i64> {
        let exit_code = wait_exec(&self.docker, &self.exec_id).await?;
        remove_pid_file(&self.docker, &self.container_id, &self.pid_file).await;
        Ok(exit_code)
    }

    async fn kill(&mut self) -> Result<()> {
        kill_in_container(&self.docker, &self.container_id, &self.pid_file).await
    }

    fn kill_on_drop(&mut self) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(exec = %self.exec_id, "No runtime to kill dropped exec; process may linger");
            return;
        };
        let docker = self.docker.clone();
        let container_id = self.container_id.clone();
        let pid_file = self.pid_file.clone();
        handle.spawn(async move {
            if let Err(e) = kill_in_container(&docker, &container_id, &pid_file).await {
                tracing::debug!(error = %e, "Kill of dropped exec failed");
            }
        });
    }
}

fn pid_file_path() -> String {
    format!("/tmp/.agent-runner-{}.pid", uuid::Uuid::new_v4())
}

/// `sh -c 'echo $$ > PIDFILE; exec "$@"' sh <command...>`
fn wrapped_command(spec: &ExecSpec, pid_file: &str) -> Vec<String> {
    let mut cmd = vec![
        "sh".to_string(),
        "-c".to_string(),
        format!("echo $$ > {}; exec \"$@\"", pid_file),
        "sh".to_string(),
    ];
    cmd.extend(spec.command().iter().cloned());
    cmd
}

fn env_list(env: &BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn is_not_found(err: &bollard::errors::Error) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Look up a container by name: `Some((id, running))` or `None` when absent.
async fn find_container(docker: &Docker, name: &str) -> Result<Option<(String, bool)>> {
    match docker
        .inspect_container(name, None::<InspectContainerOptions>)
        .await
    {
        Ok(info) => {
            let running = info
                .state
                .as_ref()
                .and_then(|state| state.running)
                .unwrap_or(false);
            let id = info.id.unwrap_or_else(|| name.to_string());
            Ok(Some((id, running)))
        }
        Err(e) if is_not_found(&e) => Ok(None),
        Err(e) => Err(Error::container(format!(
            "Failed to inspect container {}: {}",
            name, e
        ))),
    }
}

async fn create_container(docker: &Docker, config: &ContainerConfig, name: &str) -> Result<String> {
    let options = CreateContainerOptions {
        name,
        platform: None,
    };

    let created = docker
        .create_container(Some(options), config.container_config())
        .await
        .map_err(|e| Error::container(format!("Failed to create sandbox container: {}", e)))?;

    if let Err(e) = docker.start_container::<String>(&created.id, None).await {
        if let Err(remove) = force_remove(docker, &created.id).await {
            tracing::warn!(container = %name, error = %remove, "Failed to remove container that did not start");
        }
        return Err(Error::container(format!(
            "Failed to start sandbox container: {}",
            e
        )));
    }

    tracing::info!(container = %name, id = %created.id, image = %config.image, "Sandbox container created and started");
    Ok(created.id)
}

/// Poll the engine until the exec instance has exited.
async fn wait_exec(docker: &Docker, exec_id: &str) -> Result<i64> {
    loop {
        let inspect = docker
            .inspect_exec(exec_id)
            .await
            .map_err(|e| Error::container(format!("Failed to inspect exec result: {}", e)))?;
        if inspect.running != Some(true) {
            return Ok(inspect.exit_code.unwrap_or(-1));
        }
        tokio::time::sleep(EXEC_POLL_INTERVAL).await;
    }
}

/// Force-remove a container; a container that is already gone counts as removed.
async fn force_remove(docker: &Docker, container_id: &str) -> Result<()> {
    match docker
        .remove_container(
            container_id,
            Some(RemoveContainerOptions {
                force: true,
                ..Default::default()
            }),
        )
        .await
    {
        Ok(()) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(Error::container(format!(
            "Failed to remove sandbox container: {}",
            e
        ))),
    }
}

/// Kill the process recorded in `pid_file` and all of its descendants.
async fn kill_in_container(docker: &Docker, container_id: &str, pid_file: &str) -> Result<()> {
    const KILL_TREE: &str = r#"kill_tree() {
  for child in $(cat /proc/$1/task/*/children 2>/dev/null); do kill_tree "$child"; done
  kill -9 "$1" 2>/dev/null
}
[ -f "$1" ] && kill_tree "$(cat "$1")"
rm -f "$1""#;

    run_pid_script(docker, container_id, KILL_TREE, pid_file).await?;
    tracing::debug!(container = %container_id, pid_file = %pid_file, "Killed exec process tree");
    Ok(())
}

async fn remove_pid_file(docker: &Docker, container_id: &str, pid_file: &str) {
    if let Err(e) = run_pid_script(docker, container_id, r#"rm -f "$1""#, pid_file).await {
        tracing::debug!(container = %container_id, pid_file = %pid_file, error = %e, "Failed to remove exec pid file");
    }
}

/// Run `script` in the container with the pid file path as `$1`.
async fn run_pid_script(
    docker: &Docker,
    container_id: &str,
    script: &str,
    pid_file: &str,
) -> Result<()> {
    let options = CreateExecOptions {
        cmd: Some(vec![
            "sh".to_string(),
            "-c".to_string(),
            script.to_string(),
            "sh".to_string(),
            pid_file.to_string(),
        ]),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        ..Default::default()
    };
    let exec = docker
        .create_exec(container_id, options)
        .await
        .map_err(|e| Error::container(format!("Failed to create helper exec: {}", e)))?;

    let drain = async {
        if let StartExecResults::Attached { mut output, .. } = docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| Error::container(format!("Failed to start helper exec: {}", e)))?
        {
            while output.next().await.is_some() {}
        }
        Ok::<_, Error>(())
    };
    tokio::time::timeout(HELPER_EXEC_TIMEOUT, drain)
        .await
        .map_err(|_| Error::container("Timed out running helper exec"))?
}

fn log_output_stream(
    output: BoxStream<'static, std::result::Result<LogOutput, bollard::errors::Error>>,
) -> OutputStream {
    output
        .filter_map(|item| async move {
            match item {
                Ok(LogOutput::StdOut { message }) | Ok(LogOutput::Console { message }) => {
                    Some(Ok(OutputChunk::Stdout(message.to_vec())))
                }
                Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message.to_vec()))),
                Ok(LogOutput::StdIn { .. }) => None,
                Err(e) => Some(Err(io::Error::other(e.to_string()))),
            }
        })
        .boxed()
}
