//! Shared utilities for integration testing.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use origin_pool::config::{OriginConfig, PoolConfig, ProxyConfig};

/// A TCP origin that accepts and holds connections without answering.
///
/// Counts accepted sockets and sockets the client side closed.
pub struct MockOrigin {
    pub addr: SocketAddr,
    accepted: Arc<AtomicUsize>,
    closed_by_peer: Arc<AtomicUsize>,
    hang_up: broadcast::Sender<()>,
    accept_loop: JoinHandle<()>,
}

impl MockOrigin {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accepted = Arc::new(AtomicUsize::new(0));
        let closed_by_peer = Arc::new(AtomicUsize::new(0));
        let (hang_up, _) = broadcast::channel(4);

        let accept_loop = {
            let accepted = accepted.clone();
            let closed_by_peer = closed_by_peer.clone();
            let hang_up = hang_up.clone();
            tokio::spawn(async move {
                while let Ok((mut socket, _)) = listener.accept().await {
                    accepted.fetch_add(1, Ordering::SeqCst);
                    let mut hang_up = hang_up.subscribe();
                    let closed_by_peer = closed_by_peer.clone();
                    tokio::spawn(async move {
                        let mut buf = [0u8; 1024];
                        loop {
                            tokio::select! {
                                read = socket.read(&mut buf) => match read {
                                    Ok(0) | Err(_) => {
                                        closed_by_peer.fetch_add(1, Ordering::SeqCst);
                                        break;
                                    }
                                    Ok(_) => {}
                                },
                                _ = hang_up.recv() => {
                                    let _ = socket.shutdown().await;
                                    break;
                                }
                            }
                        }
                    });
                }
            })
        };

        Self {
            addr,
            accepted,
            closed_by_peer,
            hang_up,
            accept_loop,
        }
    }

    pub fn accepted(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }

    /// Connections the pool side has closed.
    pub fn closed_by_peer(&self) -> usize {
        self.closed_by_peer.load(Ordering::SeqCst)
    }

    /// Close every connection currently held, from the origin side.
    pub fn hang_up_all(&self) {
        let _ = self.hang_up.send(());
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.accept_loop.abort();
    }
}

/// An address nothing listens on.
#[allow(dead_code)]
pub async fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}

#[allow(dead_code)]
pub fn origin(name: &str, servers: &[SocketAddr], pool: PoolConfig) -> OriginConfig {
    OriginConfig {
        name: name.to_string(),
        servers: servers.iter().map(|s| s.to_string()).collect(),
        load_balancing: Default::default(),
        pool,
    }
}

#[allow(dead_code)]
pub fn proxy_config(origins: Vec<OriginConfig>) -> ProxyConfig {
    ProxyConfig {
        origins,
        ..ProxyConfig::default()
    }
}

/// Poll `cond` until it holds or `timeout` passes.
#[allow(dead_code)]
pub async fn eventually<F: Fn() -> bool>(timeout: Duration, cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}
