#![deny(unused)]
//! Execution sandboxes for agent CLI runs.
//!
//! Every external tool invocation is routed through a [`Sandbox`]: either a
//! host process ([`LocalSandbox`]) or an exec inside a long-lived container
//! ([`ContainerSandbox`]). Both backends speak the same [`ExecSpec`] /
//! [`ExecResult`] contract and hand out [`InteractiveProcess`] handles for
//! streaming use.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  CliTransport / ResilienceManager      │
//! │    ↓ ExecSpec                          │
//! ├────────────────────────────────────────┤
//! │  Sandbox (trait)                       │
//! │    LocalSandbox    ContainerSandbox    │
//! │    ↓ tokio::process  ↓ bollard exec    │
//! ├────────────────────────────────────────┤
//! │  Host process  |  Container (/work)    │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use agent_runner_sandbox::{open_sandbox, SandboxConfig};
//!
//! let sandbox = open_sandbox(&SandboxConfig::default()).await?;
//! let result = sandbox.exec(&ExecSpec::shell("echo hi").build()?).await?;
//! sandbox.close().await?;
//! ```

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use agent_runner_core::config::{SandboxBackend, SandboxSettings};
use agent_runner_core::{Error, ExecResult, ExecSpec, Result};

pub mod container;
pub mod local;
pub mod mock;
pub mod process;
pub mod registry;

pub use container::{ContainerConfig, ContainerCustomizer, ContainerSandbox};
pub use local::LocalSandbox;
pub use mock::MockSandbox;
pub use process::{InteractiveProcess, OutputChunk, OutputStream, ProcessControl};
pub use registry::SandboxRegistry;

// =============================================================================
// Sandbox Trait
// =============================================================================

/// An execution boundary for commands.
///
/// A sandbox is used sequentially; concurrent callers should open separate
/// instances. All operations fail with [`Error::InvalidState`] after `close`.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Run a command to completion, bounded by its `ExecSpec` timeout.
    ///
    /// A timed-out process is killed before [`Error::Timeout`] is returned.
    async fn exec(&self, spec: &ExecSpec) -> Result<ExecResult>;

    /// Start a command and return a live handle. The spec timeout is not
    /// enforced here; the caller owns the process lifetime.
    async fn start_interactive(&self, spec: &ExecSpec) -> Result<InteractiveProcess>;

    /// Directory relative working dirs resolve against.
    fn work_dir(&self) -> &Path;

    /// Release the sandbox. Idempotent.
    async fn close(&self) -> Result<()>;

    fn is_closed(&self) -> bool;

    /// Backend name used in logs and metrics.
    fn kind(&self) -> &'static str;
}

// =============================================================================
// Backend Selection
// =============================================================================

/// How to open a sandbox.
#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub backend: SandboxBackend,
    /// Host directory for the local backend; a temporary one is created when unset.
    pub local_work_dir: Option<PathBuf>,
    pub container: ContainerConfig,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: SandboxBackend::Auto,
            local_work_dir: None,
            container: ContainerConfig::default(),
        }
    }
}

impl From<&SandboxSettings> for SandboxConfig {
    fn from(settings: &SandboxSettings) -> Self {
        let mut container = ContainerConfig::new(settings.image.clone())
            .with_work_dir(settings.container_work_dir.clone())
            .keep_container(settings.keep_container);
        if let Some(name) = &settings.container_name {
            container = container.with_name(name.clone());
        }
        Self {
            backend: settings.backend,
            local_work_dir: settings.local_work_dir.as_ref().map(PathBuf::from),
            container,
        }
    }
}

/// Open a sandbox for the configured backend.
///
/// `Auto` prefers the container backend and falls back to a local sandbox
/// when the container engine is unreachable. Other container errors (bad
/// image, create failure) are not masked.
pub async fn open_sandbox(config: &SandboxConfig) -> Result<Arc<dyn Sandbox>> {
    let sandbox: Arc<dyn Sandbox> = match config.backend {
        SandboxBackend::Local => Arc::new(open_local(config)?),
        SandboxBackend::Container => {
            Arc::new(ContainerSandbox::connect(config.container.clone()).await?)
        }
        SandboxBackend::Auto => match try_container(config).await? {
            Some(sandbox) => sandbox,
            None => Arc::new(open_local(config)?),
        },
    };
    tracing::info!(kind = sandbox.kind(), work_dir = %sandbox.work_dir().display(), "Sandbox opened");
    Ok(sandbox)
}

/// Open the container backend if the engine is reachable.
///
/// Returns `Ok(None)` on [`Error::EngineUnavailable`] so the caller can pick
/// another backend.
pub async fn try_container(config: &SandboxConfig) -> Result<Option<Arc<dyn Sandbox>>> {
    match ContainerSandbox::connect(config.container.clone()).await {
        Ok(sandbox) => Ok(Some(Arc::new(sandbox))),
        Err(Error::EngineUnavailable(reason)) => {
            tracing::warn!(reason = %reason, "Container engine unavailable, falling back to local sandbox");
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

fn open_local(config: &SandboxConfig) -> Result<LocalSandbox> {
    match &config.local_work_dir {
        Some(dir) => LocalSandbox::new(dir),
        None => LocalSandbox::temporary(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_settings() {
        let settings = SandboxSettings {
            backend: SandboxBackend::Container,
            local_work_dir: Some("/tmp/x".into()),
            image: "img:1".into(),
            container_name: Some("shared".into()),
            container_work_dir: "/src".into(),
            keep_container: true,
        };
        let config = SandboxConfig::from(&settings);
        assert_eq!(config.backend, SandboxBackend::Container);
        assert_eq!(config.local_work_dir, Some(PathBuf::from("/tmp/x")));
        assert_eq!(config.container.image, "img:1");
        assert_eq!(config.container.name.as_deref(), Some("shared"));
        assert_eq!(config.container.work_dir, "/src");
        assert!(config.container.keep_container);
    }

    #[tokio::test]
    async fn test_open_local_backend() {
        let dir = tempfile::tempdir().unwrap();
        let config = SandboxConfig {
            backend: SandboxBackend::Local,
            local_work_dir: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        let sandbox = open_sandbox(&config).await.unwrap();
        assert_eq!(sandbox.kind(), "local");
        assert_eq!(sandbox.work_dir(), dir.path());
        sandbox.close().await.unwrap();
        assert!(dir.path().exists());
    }

    #[tokio::test]
    async fn test_auto_always_yields_a_sandbox() {
        // Either Docker is reachable or we fall back; a missing image on a
        // reachable engine is the only failure and is not masked.
        let config = SandboxConfig {
            container: ContainerConfig::new("agent-runner-test-image-that-does-not-exist:none"),
            ..Default::default()
        };
        match open_sandbox(&config).await {
            Ok(sandbox) => {
                assert_eq!(sandbox.kind(), "local");
                sandbox.close().await.unwrap();
            }
            Err(e) => assert!(matches!(e, Error::Container(_))),
        }
    }
}
