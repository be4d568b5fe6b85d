//! Scripted sandbox for tests that must not touch Docker or spawn processes.

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use agent_runner_core::{Error, ExecResult, ExecSpec, Result};

use crate::process::{InteractiveProcess, OutputChunk, ProcessControl};
use crate::Sandbox;

// =============================================================================
// Mock Sandbox (for testing without Docker)
// =============================================================================

/// In-memory sandbox returning queued responses and recording every spec.
///
/// With an empty queue `exec` succeeds with exit code 0 and an empty log.
#[derive(Default)]
pub struct MockSandbox {
    responses: Arc<Mutex<VecDeque<Result<ExecResult>>>>,
    executed: Arc<Mutex<Vec<ExecSpec>>>,
    delay: Option<Duration>,
    hang_interactive: bool,
    kills: Arc<AtomicUsize>,
    closed: AtomicBool,
}

impl std::fmt::Debug for MockSandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockSandbox")
            .field("delay", &self.delay)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl MockSandbox {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a mock sandbox with predefined exec responses.
    pub fn with_responses(responses: Vec<ExecResult>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into_iter().map(Ok).collect())),
            ..Default::default()
        }
    }

    /// Shorthand for a single `exit_code` / `log` response.
    pub fn with_output(exit_code: i64, log: impl Into<String>) -> Self {
        Self::with_responses(vec![ExecResult {
            exit_code,
            log: log.into(),
            duration: Duration::from_millis(1),
        }])
    }

    /// Simulate a command taking `delay`. Specs with a shorter timeout fail
    /// with [`Error::Timeout`] once their timeout has elapsed.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Interactive processes keep their output open after the scripted
    /// lines until killed.
    pub fn hang_interactive(mut self) -> Self {
        self.hang_interactive = true;
        self
    }

    pub async fn push_response(&self, response: Result<ExecResult>) {
        self.responses.lock().await.push_back(response);
    }

    pub async fn push_output(&self, exit_code: i64, log: impl Into<String>) {
        self.push_response(Ok(ExecResult {
            exit_code,
            log: log.into(),
            duration: Duration::from_millis(1),
        }))
        .await;
    }

    pub async fn push_error(&self, error: Error) {
        self.push_response(Err(error)).await;
    }

    /// Specs seen so far, in call order.
    pub async fn executed(&self) -> Vec<ExecSpec> {
        self.executed.lock().await.clone()
    }

    pub async fn exec_count(&self) -> usize {
        self.executed.lock().await.len()
    }

    /// Number of interactive processes killed.
    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }

    async fn next_response(&self, spec: &ExecSpec) -> Result<ExecResult> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::invalid_state("mock sandbox is closed"));
        }
        self.executed.lock().await.push(spec.clone());
        self.responses.lock().await.pop_front().unwrap_or_else(|| {
            Ok(ExecResult {
                exit_code: 0,
                log: String::new(),
                duration: Duration::from_millis(1),
            })
        })
    }
}

#[async_trait]
impl Sandbox for MockSandbox {
    async fn exec(&self, spec: &ExecSpec) -> Result<ExecResult> {
        let response = self.next_response(spec).await?;
        if let Some(delay) = self.delay {
            if delay > spec.timeout() {
                tokio::time::sleep(spec.timeout()).await;
                return Err(Error::Timeout {
                    timeout: spec.timeout(),
                    elapsed: spec.timeout(),
                });
            }
            tokio::time::sleep(delay).await;
        }
        Ok(response)
    }

    async fn start_interactive(&self, spec: &ExecSpec) -> Result<InteractiveProcess> {
        let response = self.next_response(spec).await?;

        let chunks: Vec<std::io::Result<OutputChunk>> = response
            .log
            .split_inclusive('\n')
            .map(|line| Ok(OutputChunk::Stdout(line.as_bytes().to_vec())))
            .collect();
        let output = if self.hang_interactive {
            stream::iter(chunks).chain(stream::pending()).boxed()
        } else {
            stream::iter(chunks).boxed()
        };

        Ok(InteractiveProcess::new(
            spec.display_command(),
            None,
            output,
            Box::new(MockControl {
                exit_code: response.exit_code,
                kills: self.kills.clone(),
            }),
        ))
    }

    fn work_dir(&self) -> &Path {
        Path::new("/mock")
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn kind(&self) -> &'static str {
        "mock"
    }
}

struct MockControl {
    exit_code: i64,
    kills: Arc<AtomicUsize>,
}

#[async_trait]
impl ProcessControl for MockControl {
    async fn wait(&mut self) -> Result<i64> {
        Ok(self.exit_code)
    }

    async fn kill(&mut self) -> Result<()> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn kill_on_drop(&mut self) {
        self.kills.fetch_add(1, Ordering::SeqCst);
    }
}
