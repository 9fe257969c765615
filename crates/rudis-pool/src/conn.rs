//! Connection and dialer types
//!
//! A [`Conn`] is one live TCP byte-stream to the backend. The pool shares it
//! as `Arc<Conn>`: the registry keeps a handle for shutdown and filtering
//! while the caller that checked it out performs I/O through `&self`. A
//! connection is only ever mutated by the caller currently holding it; the
//! pool itself touches nothing but the timestamps and flags, which are
//! atomic.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::{Buf, BytesMut};
use parking_lot::Mutex;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

use crate::error::{Error, Result};

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Produces new TCP streams for the pool on demand.
///
/// Supplied by the caller; TLS negotiation, authentication handshakes and
/// the like belong inside the dialer, not the pool.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial a new stream to the backend.
    async fn dial(&self) -> Result<TcpStream>;
}

/// Plain TCP dialer for a fixed address.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    addr: String,
}

impl TcpDialer {
    /// Create a dialer for `addr` (`host:port`).
    pub fn new(addr: impl Into<String>) -> Self {
        Self { addr: addr.into() }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> Result<TcpStream> {
        TcpStream::connect(&self.addr)
            .await
            .map_err(|err| Error::dial(format!("{}: {}", self.addr, err)))
    }
}

/// A single connection to the backend.
pub struct Conn {
    id: u64,
    stream: TcpStream,
    /// Read-ahead buffer. A protocol reader that pulled more bytes off the
    /// socket than it consumed parks the excess here; a connection returned
    /// to the pool with a non-empty buffer is discarded.
    rbuf: Mutex<BytesMut>,
    created_at: Instant,
    /// Milliseconds since `created_at`; an offset so the slot stays atomic.
    used_at_ms: AtomicU64,
    pooled: AtomicBool,
    closed: AtomicBool,
}

impl Conn {
    pub(crate) fn new(stream: TcpStream) -> Self {
        Self {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            stream,
            rbuf: Mutex::new(BytesMut::new()),
            created_at: Instant::now(),
            used_at_ms: AtomicU64::new(0),
            pooled: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// When the underlying socket was opened.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Last time this connection was returned to the pool or passed a
    /// health check.
    pub fn used_at(&self) -> Instant {
        self.created_at + Duration::from_millis(self.used_at_ms.load(Ordering::Relaxed))
    }

    pub(crate) fn set_used_at(&self, now: Instant) {
        let ms = now.saturating_duration_since(self.created_at).as_millis() as u64;
        self.used_at_ms.store(ms, Ordering::Relaxed);
    }

    /// Whether this connection counts against the pooled budget.
    pub fn is_pooled(&self) -> bool {
        self.pooled.load(Ordering::Relaxed)
    }

    pub(crate) fn set_pooled(&self, pooled: bool) {
        self.pooled.store(pooled, Ordering::Relaxed);
    }

    /// Whether the pool has retired this connection.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks the connection closed. Returns false if it already was, so
    /// every teardown path settles on a single winner.
    pub(crate) fn mark_closed(&self) -> bool {
        self.closed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Number of read-ahead bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.rbuf.lock().len()
    }

    /// Return over-read bytes to the connection. They are handed back, in
    /// order, before anything further is read off the socket.
    pub fn unread(&self, data: &[u8]) {
        let mut rbuf = self.rbuf.lock();
        if rbuf.is_empty() {
            rbuf.extend_from_slice(data);
            return;
        }
        let mut merged = BytesMut::with_capacity(data.len() + rbuf.len());
        merged.extend_from_slice(data);
        merged.extend_from_slice(&rbuf[..]);
        *rbuf = merged;
    }

    /// Read bytes into `dst`, draining the read-ahead buffer first.
    pub async fn read(&self, dst: &mut [u8]) -> io::Result<usize> {
        {
            let mut rbuf = self.rbuf.lock();
            if !rbuf.is_empty() {
                let n = dst.len().min(rbuf.len());
                dst[..n].copy_from_slice(&rbuf[..n]);
                rbuf.advance(n);
                return Ok(n);
            }
        }
        loop {
            self.stream.readable().await?;
            match self.stream.try_read(dst) {
                Ok(n) => return Ok(n),
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Write all of `src` to the socket.
    pub async fn write_all(&self, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            self.stream.writable().await?;
            match self.stream.try_write(src) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => src = &src[n..],
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => continue,
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Non-blocking socket probe.
    ///
    /// An idle connection must have nothing to read: `WouldBlock` is the
    /// healthy verdict. A zero-length read is the peer closing; readable
    /// bytes are out-of-protocol and condemn the connection, so consuming
    /// one is harmless.
    pub(crate) fn probe(&self) -> io::Result<()> {
        let mut buf = [0u8; 1];
        match self.stream.try_read(&mut buf) {
            Ok(0) => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "closed by peer",
            )),
            Ok(_) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unexpected data on idle connection",
            )),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(err),
        }
    }

    /// Gracefully shut the socket down. Only reachable once the pool holds
    /// the last handle; the fd is released on drop either way.
    pub(crate) async fn shutdown(mut self) -> io::Result<()> {
        self.stream.shutdown().await
    }
}

impl fmt::Debug for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("pooled", &self.is_pooled())
            .field("closed", &self.is_closed())
            .field("age", &self.created_at.elapsed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    async fn conn_pair() -> (Conn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (Conn::new(client), server)
    }

    #[tokio::test]
    async fn test_probe_idle_socket_is_healthy() {
        let (cn, _server) = conn_pair().await;
        assert!(cn.probe().is_ok());
    }

    #[tokio::test]
    async fn test_probe_detects_peer_close() {
        let (cn, server) = conn_pair().await;
        drop(server);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(cn.probe().is_err());
    }

    #[tokio::test]
    async fn test_probe_rejects_unexpected_data() {
        let (cn, mut server) = conn_pair().await;
        server.write_all(b"x").await.unwrap();
        server.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        let err = cn.probe().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_unread_is_drained_before_socket() {
        let (cn, mut server) = conn_pair().await;
        server.write_all(b"socket").await.unwrap();

        cn.unread(b"ahead");
        assert_eq!(cn.buffered(), 5);

        let mut buf = [0u8; 5];
        let n = cn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ahead");
        assert_eq!(cn.buffered(), 0);

        let n = cn.read(&mut buf).await.unwrap();
        assert!(n > 0);
        assert_eq!(&buf[..n], &b"socket"[..n]);
    }

    #[tokio::test]
    async fn test_unread_prepends_to_existing_buffer() {
        let (cn, _server) = conn_pair().await;
        cn.unread(b"cd");
        cn.unread(b"ab");

        let mut buf = [0u8; 4];
        let n = cn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"abcd");
    }

    #[tokio::test]
    async fn test_used_at_offset_tracks_touch() {
        let (cn, _server) = conn_pair().await;
        assert_eq!(cn.used_at(), cn.created_at());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let now = Instant::now();
        cn.set_used_at(now);
        assert!(cn.used_at() > cn.created_at());
        assert!(cn.used_at() <= now);
    }

    #[tokio::test]
    async fn test_mark_closed_once() {
        let (cn, _server) = conn_pair().await;
        assert!(cn.mark_closed());
        assert!(!cn.mark_closed());
        assert!(cn.is_closed());
    }
}
