//! Stream plumbing between supervised processes and their callers.
//!
//! Output relays copy a process pipe into a caller sink until EOF. A sink
//! that fails is dropped and the pipe keeps being drained, so a process
//! never blocks on a full pipe because its consumer went away.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::diagnostics::WorkerGuard;

const RELAY_BUFFER: usize = 16 * 1024;

/// Source of a process's standard input.
pub type InputSource = Box<dyn AsyncRead + Send + Unpin>;

/// Destination of a process's standard output or error.
pub type OutputSink = Box<dyn AsyncWrite + Send + Unpin>;

/// Caller-side ends of a process's standard streams. Absent streams are
/// connected to `/dev/null`.
#[derive(Default)]
pub struct ProcessIo {
    /// Fed to the process's stdin, which is closed at EOF.
    pub stdin: Option<InputSource>,
    /// Receives the process's stdout.
    pub stdout: Option<OutputSink>,
    /// Receives the process's stderr.
    pub stderr: Option<OutputSink>,
}

impl ProcessIo {
    /// No streams attached.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds `source` to stdin.
    #[must_use]
    pub fn with_stdin(mut self, source: impl AsyncRead + Send + Unpin + 'static) -> Self {
        self.stdin = Some(Box::new(source));
        self
    }

    /// Sends stdout to `sink`.
    #[must_use]
    pub fn with_stdout(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stdout = Some(Box::new(sink));
        self
    }

    /// Sends stderr to `sink`.
    #[must_use]
    pub fn with_stderr(mut self, sink: impl AsyncWrite + Send + Unpin + 'static) -> Self {
        self.stderr = Some(Box::new(sink));
        self
    }
}

impl fmt::Debug for ProcessIo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessIo")
            .field("stdin", &self.stdin.is_some())
            .field("stdout", &self.stdout.is_some())
            .field("stderr", &self.stderr.is_some())
            .finish()
    }
}

/// In-memory sink collecting everything written to it. Clones share the buffer.
#[derive(Debug, Clone, Default)]
pub struct OutputBuffer {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl OutputBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Bytes collected so far.
    #[must_use]
    pub fn contents(&self) -> Vec<u8> {
        self.bytes.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Collected bytes as text, with invalid UTF-8 replaced.
    #[must_use]
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl AsyncWrite for OutputBuffer {
    fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
        self.bytes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

/// Copies a process pipe into `sink` until EOF, then shuts the sink down.
pub(crate) fn relay_output<R>(mut pipe: R, sink: OutputSink, guard: WorkerGuard) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        let _guard = guard;
        let mut sink = Some(sink);
        let mut buf = vec![0u8; RELAY_BUFFER];
        loop {
            let n = match pipe.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) => {
                    tracing::debug!(error = %e, "process pipe read failed");
                    break;
                }
            };
            if let Some(writer) = sink.as_mut() {
                let written = match writer.write_all(&buf[..n]).await {
                    Ok(()) => writer.flush().await,
                    Err(e) => Err(e),
                };
                if let Err(e) = written {
                    tracing::debug!(error = %e, "output sink failed, discarding further output");
                    sink = None;
                }
            }
        }
        if let Some(mut writer) = sink {
            let _ = writer.shutdown().await;
        }
    })
}

/// Feeds `source` to a process's stdin until EOF or until the process exits.
pub(crate) fn relay_input<W>(
    mut source: InputSource,
    mut stdin: W,
    mut exited: watch::Receiver<Option<i32>>,
    guard: WorkerGuard,
) where
    W: AsyncWrite + Send + Unpin + 'static,
{
    drop(tokio::spawn(async move {
        let _guard = guard;
        let process_exit = async {
            let _ = exited.wait_for(Option::is_some).await;
        };
        let copied = tokio::select! {
            result = tokio::io::copy(&mut source, &mut stdin) => Some(result),
            () = process_exit => None,
        };
        if let Some(result) = copied {
            if let Err(e) = result {
                tracing::debug!(error = %e, "stdin relay stopped");
            }
            let _ = stdin.shutdown().await;
        }
    }));
}
