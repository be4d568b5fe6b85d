//! Live process handles returned by `Sandbox::start_interactive`.
//!
//! An [`InteractiveProcess`] is backend-agnostic: the local and container
//! backends both hand over a merged output stream, an optional stdin writer
//! and a [`ProcessControl`] that knows how to wait for and kill the process.
//! Dropping the handle kills a process that has not been waited on.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use std::io;
use std::pin::Pin;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use agent_runner_core::{Error, Result};

const READ_CHUNK_SIZE: usize = 8192;

/// A chunk of process output tagged with the stream it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
}

/// Merged stdout/stderr chunks in arrival order.
pub type OutputStream = BoxStream<'static, io::Result<OutputChunk>>;

/// Backend hooks for waiting on and terminating a running process.
#[async_trait]
pub trait ProcessControl: Send {
    /// Wait for the process to exit and return its exit code.
    async fn wait(&mut self) -> Result<i64>;

    /// Forcefully terminate the process and its descendants.
    async fn kill(&mut self) -> Result<()>;

    /// Best-effort termination from a synchronous context (used on drop).
    fn kill_on_drop(&mut self);
}

/// A running process with line-oriented access to its stdout.
pub struct InteractiveProcess {
    command: String,
    stdin: Option<Pin<Box<dyn AsyncWrite + Send>>>,
    output: Option<OutputStream>,
    pending: Vec<u8>,
    stderr: String,
    control: Box<dyn ProcessControl>,
    exit_code: Option<i64>,
}

impl std::fmt::Debug for InteractiveProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InteractiveProcess")
            .field("command", &self.command)
            .field("stdin_open", &self.stdin.is_some())
            .field("exit_code", &self.exit_code)
            .finish()
    }
}

impl InteractiveProcess {
    /// Assemble a handle from backend parts.
    pub fn new(
        command: impl Into<String>,
        stdin: Option<Pin<Box<dyn AsyncWrite + Send>>>,
        output: OutputStream,
        control: Box<dyn ProcessControl>,
    ) -> Self {
        Self {
            command: command.into(),
            stdin,
            output: Some(output),
            pending: Vec::new(),
            stderr: String::new(),
            control,
            exit_code: None,
        }
    }

    /// The command line this process was started with.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// Read the next stdout line, without its trailing newline.
    ///
    /// Stderr chunks seen while reading are captured (see [`Self::stderr`]).
    /// Returns `Ok(None)` once both output streams have closed; a final
    /// unterminated line is still returned before that.
    pub async fn next_line(&mut self) -> Result<Option<String>> {
        loop {
            if let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
                let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                return Ok(Some(String::from_utf8_lossy(&line).into_owned()));
            }

            let Some(output) = self.output.as_mut() else {
                if self.pending.is_empty() {
                    return Ok(None);
                }
                let rest = std::mem::take(&mut self.pending);
                return Ok(Some(String::from_utf8_lossy(&rest).into_owned()));
            };

            match output.next().await {
                Some(Ok(OutputChunk::Stdout(bytes))) => self.pending.extend_from_slice(&bytes),
                Some(Ok(OutputChunk::Stderr(bytes))) => {
                    self.stderr.push_str(&String::from_utf8_lossy(&bytes))
                }
                Some(Err(e)) => return Err(Error::Io(e)),
                None => self.output = None,
            }
        }
    }

    /// Stderr captured so far.
    pub fn stderr(&self) -> &str {
        &self.stderr
    }

    /// Write to the process stdin.
    pub async fn write_all(&mut self, data: &[u8]) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| Error::invalid_state("stdin is closed"))?;
        stdin.write_all(data).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Close stdin so the process sees end-of-input. Idempotent.
    pub async fn close_stdin(&mut self) -> Result<()> {
        if let Some(mut stdin) = self.stdin.take() {
            stdin.shutdown().await?;
        }
        Ok(())
    }

    /// Wait for the process to exit.
    pub async fn wait(&mut self) -> Result<i64> {
        if let Some(code) = self.exit_code {
            return Ok(code);
        }
        let code = self.control.wait().await?;
        self.exit_code = Some(code);
        Ok(code)
    }

    /// Kill the process now.
    pub async fn kill(&mut self) -> Result<()> {
        if self.exit_code.is_some() {
            return Ok(());
        }
        self.control.kill().await?;
        self.output = None;
        self.exit_code = Some(self.control.wait().await.unwrap_or(-1));
        Ok(())
    }

    /// Close the handle, terminating the process if it is still running.
    pub async fn close(mut self) -> Result<()> {
        let _ = self.close_stdin().await;
        self.kill().await
    }
}

impl Drop for InteractiveProcess {
    fn drop(&mut self) {
        if self.exit_code.is_none() {
            self.control.kill_on_drop();
        }
    }
}

/// Turn an async reader into a stream of tagged chunks.
pub fn read_chunks<R>(reader: R, tag: fn(Vec<u8>) -> OutputChunk) -> OutputStream
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; READ_CHUNK_SIZE];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(tag(buf)), Some(reader)))
            }
            Err(e) => Some((Err(e), None)),
        }
    })
    .boxed()
}

/// Merge stdout and stderr readers into one arrival-ordered stream.
pub fn merge_output<O, E>(stdout: O, stderr: E) -> OutputStream
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    stream::select(
        read_chunks(stdout, OutputChunk::Stdout),
        read_chunks(stderr, OutputChunk::Stderr),
    )
    .boxed()
}

/// Map a host exit status to a numeric code. Signal deaths become `128 + signal`.
pub(crate) fn exit_code_of(status: std::process::ExitStatus) -> i64 {
    if let Some(code) = status.code() {
        return code as i64;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal as i64;
        }
    }
    -1
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    struct FakeControl {
        code: i64,
        killed: Arc<AtomicBool>,
    }

    #[async_trait]
    impl ProcessControl for FakeControl {
        async fn wait(&mut self) -> Result<i64> {
            Ok(self.code)
        }
        async fn kill(&mut self) -> Result<()> {
            self.killed.store(true, Ordering::SeqCst);
            Ok(())
        }
        fn kill_on_drop(&mut self) {
            self.killed.store(true, Ordering::SeqCst);
        }
    }

    fn process(chunks: Vec<OutputChunk>, killed: Arc<AtomicBool>) -> InteractiveProcess {
        let output = stream::iter(chunks.into_iter().map(Ok)).boxed();
        InteractiveProcess::new(
            "fake",
            None,
            output,
            Box::new(FakeControl { code: 0, killed }),
        )
    }

    #[tokio::test]
    async fn test_lines_split_across_chunks() {
        let killed = Arc::new(AtomicBool::new(false));
        let mut proc = process(
            vec![
                OutputChunk::Stdout(b"hel".to_vec()),
                OutputChunk::Stderr(b"warn\n".to_vec()),
                OutputChunk::Stdout(b"lo\r\nwor".to_vec()),
                OutputChunk::Stdout(b"ld".to_vec()),
            ],
            killed,
        );

        assert_eq!(proc.next_line().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(proc.next_line().await.unwrap().as_deref(), Some("world"));
        assert_eq!(proc.next_line().await.unwrap(), None);
        assert_eq!(proc.stderr(), "warn\n");
        assert_eq!(proc.wait().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_drop_without_wait_kills() {
        let killed = Arc::new(AtomicBool::new(false));
        let proc = process(vec![], killed.clone());
        drop(proc);
        assert!(killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_drop_after_wait_does_not_kill() {
        let killed = Arc::new(AtomicBool::new(false));
        let mut proc = process(vec![], killed.clone());
        proc.wait().await.unwrap();
        drop(proc);
        assert!(!killed.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_write_after_stdin_closed_fails() {
        let killed = Arc::new(AtomicBool::new(false));
        let mut proc = process(vec![], killed);
        let err = proc.write_all(b"x").await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }
}
