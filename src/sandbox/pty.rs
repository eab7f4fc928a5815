//! Interactive terminal sessions attached to a running sandbox.
//!
//! A [`Pty`] is a duplex byte stream (`AsyncRead + AsyncWrite`) plus the
//! control operations every backend provides through [`PtyControl`]. The
//! handle is cheap to clone, so one task can read while another writes and
//! a third forwards terminal resizes.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll, Waker};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

use super::{OpContext, SandboxError};

type BoxedReader = Pin<Box<dyn AsyncRead + Send>>;
type BoxedWriter = Pin<Box<dyn AsyncWrite + Send>>;

/// Backend side of a PTY session.
#[async_trait]
pub trait PtyControl: Send + Sync {
    /// Applies new terminal geometry.
    async fn resize(&self, rows: u16, cols: u16) -> Result<(), SandboxError>;

    /// Blocks until the attached process exits and returns its exit code.
    async fn wait(&self) -> Result<i64, SandboxError>;

    /// Releases backend resources held by the session.
    async fn terminate(&self);
}

struct Shared {
    reader: Mutex<Option<BoxedReader>>,
    writer: Mutex<Option<BoxedWriter>>,
    closed: AtomicBool,
    /// Tasks parked on the backend streams, woken by `close`.
    read_waker: Mutex<Option<Waker>>,
    write_waker: Mutex<Option<Waker>>,
    control: Arc<dyn PtyControl>,
}

/// A live interactive session. Owned by the caller that attached.
#[derive(Clone)]
pub struct Pty {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Pty {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pty")
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Pty {
    /// Wraps a backend's output stream, input sink and control handle.
    pub fn new<R, W, C>(reader: R, writer: W, control: C) -> Self
    where
        R: AsyncRead + Send + 'static,
        W: AsyncWrite + Send + 'static,
        C: PtyControl + 'static,
    {
        Self {
            shared: Arc::new(Shared {
                reader: Mutex::new(Some(Box::pin(reader))),
                writer: Mutex::new(Some(Box::pin(writer))),
                closed: AtomicBool::new(false),
                read_waker: Mutex::new(None),
                write_waker: Mutex::new(None),
                control: Arc::new(control),
            }),
        }
    }

    /// Informs the backend of new terminal geometry. A no-op once closed.
    pub async fn resize(&self, rows: u16, cols: u16) -> Result<(), SandboxError> {
        if self.is_closed() {
            return Ok(());
        }
        self.shared.control.resize(rows, cols).await
    }

    /// Waits for the attached process to exit, returning its exit code.
    pub async fn wait(&self, ctx: &OpContext) -> Result<i64, SandboxError> {
        ctx.run(self.shared.control.wait()).await
    }

    /// Terminates the session. Only the first call has any effect.
    pub async fn close(&self) -> Result<(), SandboxError> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Closing PTY session");
        let reader = lock(&self.shared.reader).take();
        let writer = lock(&self.shared.writer).take();
        drop(reader);
        drop(writer);
        // A parked reader sees end of stream, a parked writer a closed pipe.
        for waker in [
            lock(&self.shared.read_waker).take(),
            lock(&self.shared.write_waker).take(),
        ]
        .into_iter()
        .flatten()
        {
            waker.wake();
        }
        self.shared.control.terminate().await;
        Ok(())
    }

    /// Returns true once [`Pty::close`] has been called.
    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn park<T>(poll: Poll<T>, slot: &Mutex<Option<Waker>>, cx: &Context<'_>) -> Poll<T> {
    if poll.is_pending() {
        *lock(slot) = Some(cx.waker().clone());
    }
    poll
}

fn closed_pipe() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "PTY session is closed")
}

impl AsyncRead for Pty {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        // The waker is parked while the reader lock is held, so `close`
        // (which takes that lock first) always finds it.
        let mut reader = lock(&self.shared.reader);
        match reader.as_mut() {
            // Closed: end of stream.
            None => Poll::Ready(Ok(())),
            Some(inner) => park(inner.as_mut().poll_read(cx, buf), &self.shared.read_waker, cx),
        }
    }
}

impl AsyncWrite for Pty {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut writer = lock(&self.shared.writer);
        match writer.as_mut() {
            None => Poll::Ready(Err(closed_pipe())),
            Some(inner) => park(inner.as_mut().poll_write(cx, buf), &self.shared.write_waker, cx),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut writer = lock(&self.shared.writer);
        match writer.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(inner) => inner.as_mut().poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut writer = lock(&self.shared.writer);
        match writer.as_mut() {
            None => Poll::Ready(Ok(())),
            Some(inner) => inner.as_mut().poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[derive(Default)]
    struct CountingControl {
        terminations: Arc<AtomicUsize>,
        resizes: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl PtyControl for CountingControl {
        async fn resize(&self, _rows: u16, _cols: u16) -> Result<(), SandboxError> {
            self.resizes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn wait(&self) -> Result<i64, SandboxError> {
            Ok(3)
        }

        async fn terminate(&self) {
            self.terminations.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pty_over_duplex() -> (Pty, tokio::io::DuplexStream, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let (client, server) = tokio::io::duplex(1024);
        let (read_half, write_half) = tokio::io::split(client);
        let control = CountingControl::default();
        let terminations = Arc::clone(&control.terminations);
        let resizes = Arc::clone(&control.resizes);
        (
            Pty::new(read_half, write_half, control),
            server,
            terminations,
            resizes,
        )
    }

    #[tokio::test]
    async fn test_read_and_write_through_backend() {
        let (mut pty, mut server, _, _) = pty_over_duplex();

        pty.write_all(b"ls\n").await.unwrap();
        let mut buf = [0u8; 3];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ls\n");

        server.write_all(b"ok").await.unwrap();
        let mut out = [0u8; 2];
        pty.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, b"ok");
    }

    #[tokio::test]
    async fn test_read_after_backend_exit_is_eof() {
        let (mut pty, server, _, _) = pty_over_duplex();
        drop(server);
        let mut buf = Vec::new();
        let n = pty.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_write_after_close_is_broken_pipe() {
        let (mut pty, _server, _, _) = pty_over_duplex();
        pty.close().await.unwrap();
        let err = pty.write_all(b"x").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_close_ends_read_already_in_flight() {
        let (pty, _server, _, _) = pty_over_duplex();
        let mut reader = pty.clone();
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.read(&mut buf).await
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pending.is_finished());

        pty.close().await.unwrap();
        let n = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("read still blocked after close")
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_fails_write_already_in_flight() {
        let (client, _server) = tokio::io::duplex(4);
        let (read_half, write_half) = tokio::io::split(client);
        let pty = Pty::new(read_half, write_half, CountingControl::default());
        let mut writer = pty.clone();
        let pending = tokio::spawn(async move { writer.write_all(&[0u8; 64]).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        pty.close().await.unwrap();
        let err = tokio::time::timeout(Duration::from_secs(2), pending)
            .await
            .expect("write still blocked after close")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (pty, _server, terminations, _) = pty_over_duplex();
        pty.close().await.unwrap();
        pty.clone().close().await.unwrap();
        assert_eq!(terminations.load(Ordering::SeqCst), 1);
        assert!(pty.is_closed());
    }

    #[tokio::test]
    async fn test_resize_concurrent_with_io_and_noop_after_close() {
        let (pty, _server, _, resizes) = pty_over_duplex();
        let resizer = pty.clone();
        let mut writer = pty.clone();
        let (a, b) = tokio::join!(resizer.resize(40, 120), writer.write_all(b"echo\n"));
        a.unwrap();
        b.unwrap();
        assert_eq!(resizes.load(Ordering::SeqCst), 1);

        pty.close().await.unwrap();
        pty.resize(10, 10).await.unwrap();
        assert_eq!(resizes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_wait_returns_exit_code() {
        let (pty, _server, _, _) = pty_over_duplex();
        assert_eq!(pty.wait(&OpContext::background()).await.unwrap(), 3);
    }
}
