//! Byte-level plumbing for the listeners
//!
//! [`Prebuffered`] replays bytes that were already read off a socket (the
//! peeked ClientHello) before reading from the socket again. [`relay`] copies
//! bytes in both directions until both sides finish, with an idle deadline
//! covering the connection as a whole. [`Watched`] records when bytes last
//! moved on a served HTTP connection so it can be closed once idle.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};

const RELAY_BUFFER_SIZE: usize = 16 * 1024;

/// A stream whose first reads are served from an in-memory prefix
pub struct Prebuffered<S> {
    prefix: Vec<u8>,
    pos: usize,
    inner: S,
}

impl<S> Prebuffered<S> {
    pub fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            pos: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Prebuffered<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if out.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let this = &mut *self;
        if this.pos < this.prefix.len() {
            let n = (this.prefix.len() - this.pos).min(out.remaining());
            out.put_slice(&this.prefix[this.pos..this.pos + n]);
            this.pos += n;
            if this.pos == this.prefix.len() {
                this.prefix = Vec::new();
                this.pos = 0;
            }
            return Poll::Ready(Ok(()));
        }

        Pin::new(&mut this.inner).poll_read(cx, out)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Prebuffered<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.inner).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Bytes moved by a finished relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayStats {
    pub client_to_backend: u64,
    pub backend_to_client: u64,
}

/// Millisecond clock of the last byte moved on a connection
#[derive(Debug)]
pub struct Activity {
    start: Instant,
    last_ms: AtomicU64,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
            last_ms: AtomicU64::new(0),
        }
    }

    pub fn touch(&self) {
        let now = self.start.elapsed().as_millis() as u64;
        self.last_ms.store(now, Ordering::Relaxed);
    }

    pub fn idle_for(&self) -> Duration {
        let now = self.start.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_ms.load(Ordering::Relaxed)))
    }

    /// Resolves once no byte has moved for `idle`
    pub async fn expired(&self, idle: Duration) {
        loop {
            let idle_for = self.idle_for();
            if idle_for >= idle {
                return;
            }
            tokio::time::sleep(idle - idle_for).await;
        }
    }
}

/// Stream wrapper that touches an [`Activity`] whenever bytes move
pub struct Watched<S> {
    inner: S,
    activity: Arc<Activity>,
}

impl<S> Watched<S> {
    pub fn new(inner: S, activity: Arc<Activity>) -> Self {
        Self { inner, activity }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Watched<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        out: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = out.filled().len();
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_read(cx, out);
        if out.filled().len() > before {
            this.activity.touch();
        }
        result
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Watched<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = &mut *self;
        let result = Pin::new(&mut this.inner).poll_write(cx, buf);
        if matches!(result, Poll::Ready(Ok(n)) if n > 0) {
            this.activity.touch();
        }
        result
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

/// Copy bytes between `client` and `backend` until both directions reach EOF.
///
/// EOF on one side is forwarded as a write shutdown to the other. An error in
/// either direction ends the relay immediately, and so does `idle` elapsing
/// without a byte moving in either direction.
pub async fn relay<A, B>(client: &mut A, backend: &mut B, idle: Duration) -> io::Result<RelayStats>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let activity = Activity::new();
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut backend_read, mut backend_write) = tokio::io::split(backend);

    let upstream = copy_half(&mut client_read, &mut backend_write, idle, &activity);
    let downstream = copy_half(&mut backend_read, &mut client_write, idle, &activity);

    let (client_to_backend, backend_to_client) = tokio::try_join!(upstream, downstream)?;
    Ok(RelayStats {
        client_to_backend,
        backend_to_client,
    })
}

async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    idle: Duration,
    activity: &Activity,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER_SIZE];
    let mut total = 0u64;

    loop {
        let n = match tokio::time::timeout(idle, reader.read(&mut buf)).await {
            Ok(result) => result?,
            Err(_) => {
                // The other direction may still be busy
                if activity.idle_for() >= idle {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "relay idle timeout"));
                }
                continue;
            }
        };

        if n == 0 {
            break;
        }
        writer.write_all(&buf[..n]).await?;
        writer.flush().await?;
        activity.touch();
        total += n as u64;
    }

    // Half-close; the peer may already be gone
    let _ = writer.shutdown().await;
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[tokio::test]
    async fn test_prebuffered_replays_prefix_then_inner() {
        let mut stream = Prebuffered::new(b"hello ".to_vec(), Cursor::new(b"world".to_vec()));
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn test_prebuffered_partial_reads() {
        let mut stream = Prebuffered::new(b"abcd".to_vec(), Cursor::new(b"ef".to_vec()));

        let mut buf = [0u8; 3];
        let n = stream.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abc");

        let mut rest = Vec::new();
        stream.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"def");
    }

    #[tokio::test]
    async fn test_prebuffered_writes_pass_through() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut stream = Prebuffered::new(Vec::new(), a);
        stream.write_all(b"ping").await.unwrap();

        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test]
    async fn test_relay_both_directions() {
        let (mut client, mut client_side) = tokio::io::duplex(1024);
        let (mut backend_side, mut backend) = tokio::io::duplex(1024);

        let relay_task = tokio::spawn(async move {
            relay(&mut client_side, &mut backend_side, Duration::from_secs(5)).await
        });

        client.write_all(b"request").await.unwrap();
        let mut buf = [0u8; 7];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"request");

        backend.write_all(b"response!").await.unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"response!");

        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
        backend.shutdown().await.unwrap();

        let stats = relay_task.await.unwrap().unwrap();
        assert_eq!(stats.client_to_backend, 7);
        assert_eq!(stats.backend_to_client, 9);
    }

    #[tokio::test]
    async fn test_relay_idle_timeout() {
        let (_client, mut client_side) = tokio::io::duplex(64);
        let (mut backend_side, _backend) = tokio::io::duplex(64);

        let err = relay(&mut client_side, &mut backend_side, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[tokio::test]
    async fn test_watched_tracks_activity() {
        let activity = Arc::new(Activity::new());
        let (a, mut b) = tokio::io::duplex(64);
        let mut watched = Watched::new(a, Arc::clone(&activity));

        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(activity.idle_for() >= Duration::from_millis(50));

        b.write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        watched.read_exact(&mut buf).await.unwrap();
        assert!(activity.idle_for() < Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(60)).await;
        watched.write_all(b"ok").await.unwrap();
        assert!(activity.idle_for() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_activity_expires_after_idle() {
        let activity = Activity::new();
        tokio::time::timeout(Duration::from_secs(2), activity.expired(Duration::from_millis(50)))
            .await
            .unwrap();
    }
}
