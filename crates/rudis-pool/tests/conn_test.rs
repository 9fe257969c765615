//! Tests for the connection type through the public pool surface.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rudis_pool::prelude::*;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;

/// Backend that echoes every byte back to the client.
struct EchoServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl EchoServer {
    async fn spawn() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let handle = tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf).await {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if stream.write_all(&buf[..n]).await.is_err() {
                                    break;
                                }
                            }
                        }
                    }
                });
            }
        });
        Self { addr, handle }
    }

    fn pool(&self) -> ConnPool {
        ConnPool::new(
            PoolConfig::new(Arc::new(TcpDialer::new(self.addr.to_string()))).with_pool_size(2),
        )
    }
}

impl Drop for EchoServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[tokio::test]
async fn test_conn_round_trips_bytes() {
    let server = EchoServer::spawn().await;
    let pool = server.pool();

    let cn = pool.get().await.expect("get");
    cn.write_all(b"PING\r\n").await.expect("write");

    let mut buf = [0u8; 6];
    let mut read = 0;
    while read < buf.len() {
        let n = cn.read(&mut buf[read..]).await.expect("read");
        assert!(n > 0, "echo server closed early");
        read += n;
    }
    assert_eq!(&buf, b"PING\r\n");

    pool.put(cn).await;
    pool.close().await.expect("close");
}

#[tokio::test]
async fn test_unread_bytes_come_back_first() {
    let server = EchoServer::spawn().await;
    let pool = server.pool();

    let cn = pool.get().await.expect("get");
    cn.write_all(b"VALUE").await.expect("write");

    // A protocol reader that over-read hands the excess back.
    cn.unread(b"$5\r\n");
    assert_eq!(cn.buffered(), 4);

    let mut buf = [0u8; 4];
    let n = cn.read(&mut buf).await.expect("read");
    assert_eq!(&buf[..n], b"$5\r\n");
    assert_eq!(cn.buffered(), 0);

    // The socket payload follows.
    let n = cn.read(&mut buf).await.expect("read");
    assert!(n > 0);
    assert_eq!(&buf[..n], &b"VALUE"[..n]);

    // Draining everything makes the connection poolable again.
    let mut rest = [0u8; 8];
    let mut total = n;
    while total < 5 {
        total += cn.read(&mut rest).await.expect("read");
    }
    pool.put(cn).await;
    assert_eq!(pool.idle_len(), 1);

    pool.close().await.expect("close");
}

#[tokio::test]
async fn test_used_at_refreshed_on_reuse() {
    let server = EchoServer::spawn().await;
    let pool = server.pool();

    let cn = pool.get().await.expect("get");
    let id = cn.id();
    pool.put(cn).await;
    let used_after_put = {
        // Peek at the idle entry through a fresh checkout.
        let cn = pool.get().await.expect("get");
        assert_eq!(cn.id(), id);
        let at = cn.used_at();
        pool.put(cn).await;
        at
    };

    sleep(Duration::from_millis(30)).await;

    let cn = pool.get().await.expect("get");
    assert_eq!(cn.id(), id);
    assert!(
        cn.used_at() > used_after_put,
        "health check on acquire must refresh used_at"
    );
    assert!(cn.used_at() >= cn.created_at());

    pool.put(cn).await;
    pool.close().await.expect("close");
}

#[tokio::test]
async fn test_conn_debug_is_compact() {
    let server = EchoServer::spawn().await;
    let pool = server.pool();

    let cn = pool.get().await.expect("get");
    let repr = format!("{cn:?}");
    assert!(repr.contains("Conn"));
    assert!(repr.contains("pooled: true"));

    pool.put(cn).await;
    pool.close().await.expect("close");
}
