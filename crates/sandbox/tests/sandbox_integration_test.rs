//! Sandbox integration tests.
//!
//! Local-backend tests run real host processes (`sh`, `echo`, `sleep`).
//! Container tests skip when no Docker daemon is reachable.

use std::sync::Arc;
use std::time::{Duration, Instant};

use agent_runner_core::{Error, ExecSpec};
use agent_runner_sandbox::{
    ContainerConfig, ContainerSandbox, LocalSandbox, Sandbox, SandboxRegistry,
};

// =============================================================================
// Helpers
// =============================================================================

fn shell(script: &str, timeout: Duration) -> ExecSpec {
    ExecSpec::shell(script).timeout(timeout).build().unwrap()
}

fn process_alive(pid: &str) -> bool {
    std::process::Command::new("kill")
        .args(["-0", pid])
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

async fn docker_sandbox() -> Option<ContainerSandbox> {
    let config = ContainerConfig::new("alpine:3.20");
    match ContainerSandbox::connect(config).await {
        Ok(sandbox) => Some(sandbox),
        Err(e) => {
            eprintln!("skipping container test: {}", e);
            None
        }
    }
}

// =============================================================================
// Local Sandbox
// =============================================================================

#[tokio::test]
async fn test_echo_hi() {
    let sandbox = LocalSandbox::temporary().unwrap();
    let spec = ExecSpec::builder()
        .args(["echo", "hi"])
        .timeout(Duration::from_secs(5))
        .build()
        .unwrap();

    let result = sandbox.exec(&spec).await.unwrap();
    assert_eq!(result.exit_code, 0);
    assert!(result.log.contains("hi"));
    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_timeout_kills_process() {
    let sandbox = LocalSandbox::temporary().unwrap();
    let pid_file = sandbox.work_dir().join("pid");
    let script = format!("echo $$ > {}; sleep 5", pid_file.display());

    let start = Instant::now();
    let err = sandbox
        .exec(&shell(&script, Duration::from_secs(1)))
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    match err {
        Error::Timeout { timeout, elapsed } => {
            assert_eq!(timeout, Duration::from_secs(1));
            assert!(elapsed >= Duration::from_secs(1));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed < Duration::from_secs(4), "took {:?}", elapsed);

    let pid = std::fs::read_to_string(&pid_file).unwrap();
    // Give the kernel a moment to reap the killed group.
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!process_alive(pid.trim()));
}

#[tokio::test]
async fn test_close_twice_then_exec_fails() {
    let sandbox = LocalSandbox::temporary().unwrap();
    sandbox.close().await.unwrap();
    sandbox.close().await.unwrap();
    assert!(sandbox.is_closed());

    let err = sandbox
        .exec(&shell("true", Duration::from_secs(5)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidState(_)));
}

#[tokio::test]
async fn test_interactive_close_terminates_process() {
    let sandbox = LocalSandbox::temporary().unwrap();
    let pid_file = sandbox.work_dir().join("pid");
    let script = format!("echo $$ > {}; echo ready; sleep 30", pid_file.display());
    let mut proc = sandbox
        .start_interactive(&shell(&script, Duration::from_secs(60)))
        .await
        .unwrap();

    assert_eq!(proc.next_line().await.unwrap().as_deref(), Some("ready"));
    let pid = std::fs::read_to_string(&pid_file).unwrap();
    assert!(process_alive(pid.trim()));

    proc.close().await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!process_alive(pid.trim()));
}

#[tokio::test]
async fn test_registry_holds_local_sandboxes() {
    let registry = SandboxRegistry::new();
    let dir = tempfile::tempdir().unwrap();
    registry.register("host", Arc::new(LocalSandbox::new(dir.path()).unwrap()));
    registry.register("scratch", Arc::new(LocalSandbox::temporary().unwrap()));

    let host = registry.get("host").unwrap();
    std::fs::write(dir.path().join("marker"), "x").unwrap();
    let result = host
        .exec(&shell("ls", Duration::from_secs(5)))
        .await
        .unwrap();
    assert!(result.log.contains("marker"));

    registry.close_all().await.unwrap();
    assert!(registry.is_empty());
    assert!(dir.path().exists());
}

// =============================================================================
// Container Sandbox (requires Docker)
// =============================================================================

#[tokio::test]
async fn test_container_exec_and_files() {
    let Some(sandbox) = docker_sandbox().await else {
        return;
    };

    let result = sandbox
        .exec(&shell("echo hi; exit 3", Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(result.exit_code, 3);
    assert!(result.log.contains("hi"));

    sandbox.write_file("notes/a.txt", b"hello world").await.unwrap();
    assert_eq!(sandbox.read_file("notes/a.txt").await.unwrap(), b"hello world");

    let result = sandbox
        .exec(&shell("cat notes/a.txt", Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(result.log, "hello world");

    sandbox.close().await.unwrap();
    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_container_timeout_kills_process() {
    let Some(sandbox) = docker_sandbox().await else {
        return;
    };

    let err = sandbox
        .exec(&shell("sleep 30", Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));

    let result = sandbox
        .exec(&shell("pgrep -x sleep || true", Duration::from_secs(30)))
        .await
        .unwrap();
    // Only the keep-alive `sleep infinity` (pid 1) may remain.
    let pids: Vec<&str> = result.log.split_whitespace().filter(|p| *p != "1").collect();
    assert!(pids.is_empty(), "left over sleep processes: {:?}", pids);

    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_container_timeout_covers_exit_wait() {
    let Some(sandbox) = docker_sandbox().await else {
        return;
    };

    // Output closes immediately but the process keeps running.
    let started = Instant::now();
    let err = sandbox
        .exec(&shell("exec >/dev/null 2>&1; sleep 30", Duration::from_secs(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Timeout { .. }));
    assert!(started.elapsed() < Duration::from_secs(15));

    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_container_exec_leaves_no_pid_files() {
    let Some(sandbox) = docker_sandbox().await else {
        return;
    };

    for _ in 0..3 {
        sandbox
            .exec(&shell("true", Duration::from_secs(30)))
            .await
            .unwrap();
    }

    // Everything except the listing exec's own pid file.
    let list = r#"for f in /tmp/.agent-runner-*.pid; do
  [ -e "$f" ] || continue
  [ "$(cat "$f")" = "$$" ] || echo "$f"
done"#;
    let result = sandbox
        .exec(&shell(list, Duration::from_secs(30)))
        .await
        .unwrap();
    assert_eq!(result.log.trim(), "", "stale pid files: {}", result.log);

    sandbox.close().await.unwrap();
}

#[tokio::test]
async fn test_container_removed_when_setup_fails() {
    let Ok(docker) = bollard::Docker::connect_with_local_defaults() else {
        eprintln!("skipping container test: no Docker client");
        return;
    };
    if docker.ping().await.is_err() {
        eprintln!("skipping container test: Docker daemon not reachable");
        return;
    }

    let name = format!("agent-runner-setup-{}", uuid::Uuid::new_v4());
    // The work dir cannot be created under /proc.
    let config = ContainerConfig::new("alpine:3.20")
        .with_name(name.clone())
        .with_work_dir("/proc/agent-runner-work");
    let err = ContainerSandbox::with_client(docker.clone(), config)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Container(_)), "unexpected error: {}", err);

    let lookup = docker
        .inspect_container(&name, None::<bollard::container::InspectContainerOptions>)
        .await;
    assert!(lookup.is_err(), "container {} was left behind", name);
}
