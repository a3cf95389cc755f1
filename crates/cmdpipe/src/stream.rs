//! Externally visible pipeline streams.
//!
//! [`PipeReader`] and [`PipeWriter`] wrap the child's stdout/stderr and
//! stdin. Both are tied to the pipeline's close token: a forced stop
//! cancels it, which drops the underlying pipe and makes every pending and
//! future read or write fail with `BrokenPipe`. That is what unblocks a
//! handler stuck on a stream whose writer end is held by a stray
//! descendant.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::process::{ChildStderr, ChildStdin, ChildStdout};
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};

fn stream_closed() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "stream closed")
}

/// Watches the close token from inside `poll_*`.
struct CloseSignal {
    token: CancellationToken,
    cancelled: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl CloseSignal {
    fn new(token: CancellationToken) -> Self {
        let cancelled = Box::pin(token.clone().cancelled_owned());
        Self { token, cancelled }
    }

    /// Ready once the pipeline force-closed its streams. Registers the
    /// waker otherwise.
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.token.is_cancelled() || self.cancelled.as_mut().poll(cx).is_ready()
    }
}

enum ReadSource {
    Stdout(ChildStdout),
    Stderr(ChildStderr),
}

/// Readable end of the last stage's stdout or stderr.
pub struct PipeReader {
    source: Option<ReadSource>,
    close: CloseSignal,
}

impl PipeReader {
    pub(crate) fn stdout(stream: ChildStdout, token: CancellationToken) -> Self {
        Self {
            source: Some(ReadSource::Stdout(stream)),
            close: CloseSignal::new(token),
        }
    }

    pub(crate) fn stderr(stream: ChildStderr, token: CancellationToken) -> Self {
        Self {
            source: Some(ReadSource::Stderr(stream)),
            close: CloseSignal::new(token),
        }
    }

    /// Whether the stream was force-closed.
    pub fn is_closed(&self) -> bool {
        self.source.is_none() || self.close.token.is_cancelled()
    }
}

impl AsyncRead for PipeReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.close.poll_closed(cx) {
            this.source = None;
            return Poll::Ready(Err(stream_closed()));
        }
        match &mut this.source {
            Some(ReadSource::Stdout(s)) => Pin::new(s).poll_read(cx, buf),
            Some(ReadSource::Stderr(s)) => Pin::new(s).poll_read(cx, buf),
            None => Poll::Ready(Err(stream_closed())),
        }
    }
}

impl std::fmt::Debug for PipeReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match &self.source {
            Some(ReadSource::Stdout(_)) => "stdout",
            Some(ReadSource::Stderr(_)) => "stderr",
            None => "closed",
        };
        f.debug_struct("PipeReader").field("source", &kind).finish()
    }
}

/// Writable end of the first stage's stdin.
///
/// Dropping the writer (or calling `shutdown`) closes the child's stdin.
pub struct PipeWriter {
    sink: Option<ChildStdin>,
    close: CloseSignal,
}

impl PipeWriter {
    pub(crate) fn new(stream: ChildStdin, token: CancellationToken) -> Self {
        Self {
            sink: Some(stream),
            close: CloseSignal::new(token),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sink.is_none() || self.close.token.is_cancelled()
    }

    fn poll_sink<T>(
        &mut self,
        cx: &mut Context<'_>,
        op: impl FnOnce(Pin<&mut ChildStdin>, &mut Context<'_>) -> Poll<io::Result<T>>,
    ) -> Poll<io::Result<T>> {
        if self.close.poll_closed(cx) {
            self.sink = None;
            return Poll::Ready(Err(stream_closed()));
        }
        match &mut self.sink {
            Some(sink) => op(Pin::new(sink), cx),
            None => Poll::Ready(Err(stream_closed())),
        }
    }
}

impl AsyncWrite for PipeWriter {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.get_mut().poll_sink(cx, |s, cx| s.poll_write(cx, buf))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        self.get_mut().poll_sink(cx, |s, cx| s.poll_flush(cx))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let result = this.poll_sink(cx, |s, cx| s.poll_shutdown(cx));
        if result.is_ready() {
            // Release the fd so the child sees EOF even if the writer lives on.
            this.sink = None;
        }
        result
    }
}

impl std::fmt::Debug for PipeWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipeWriter")
            .field("closed", &self.is_closed())
            .finish()
    }
}
