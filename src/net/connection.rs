//! Origin socket abstraction and connection identity.
//!
//! # Responsibilities
//! - Generate stable, process-unique connection IDs
//! - Define what the pool needs from a live socket (liveness, reuse hooks, close)
//! - Provide the TCP implementation used in production

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::TcpStream;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough: only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an origin connection.
///
/// Used as the key wherever a connection has to be found again without
/// holding it (in-use registries, idle eviction timers, admin removal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn next() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "origin-conn-{}", self.0)
    }
}

/// A live transport to an origin server, as seen by the pool.
///
/// Implementations are owned by exactly one `PooledConnection` and only
/// touched from the worker the socket was opened on.
pub trait OriginSocket: Send + 'static {
    /// Whether the socket is still open and usable by its worker.
    ///
    /// Only called while the connection is idle (pooled or just released),
    /// so an implementation may consume stray bytes while probing.
    fn is_open(&self) -> bool;

    /// Resume reading after the connection leaves the idle queue.
    fn resume_reads(&mut self) {}

    /// Drop any per-request protocol state before the socket is pooled.
    fn reset_for_reuse(&mut self) {}

    /// Close the socket. Must be idempotent.
    fn close(&mut self);
}

/// TCP connection to an origin.
#[derive(Debug)]
pub struct TcpOriginStream {
    stream: Option<TcpStream>,
    peer: SocketAddr,
}

impl TcpOriginStream {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: Some(stream),
            peer,
        }
    }

    /// Address of the origin this stream is connected to.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// Borrow the underlying stream for request I/O. `None` once closed.
    pub fn get_mut(&mut self) -> Option<&mut TcpStream> {
        self.stream.as_mut()
    }

    pub fn get_ref(&self) -> Option<&TcpStream> {
        self.stream.as_ref()
    }
}

impl OriginSocket for TcpOriginStream {
    fn is_open(&self) -> bool {
        let Some(stream) = self.stream.as_ref() else {
            return false;
        };

        // An idle HTTP connection has nothing to read: EOF means the origin
        // hung up, unsolicited bytes mean the framing is unusable.
        let mut peek = [0u8; 1];
        match stream.try_read(&mut peek) {
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => true,
            Err(_) => false,
        }
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            tracing::trace!(peer = %self.peer, "Closing origin stream");
            drop(stream);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::next();
        let id2 = ConnectionId::next();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
    }

    #[tokio::test]
    async fn test_tcp_liveness_check() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        let (mut server_side, _) = listener.accept().await.unwrap();
        let mut stream = TcpOriginStream::new(client, addr);

        assert!(stream.is_open());

        // Origin hangs up: the read check sees EOF once it arrives.
        server_side.shutdown().await.unwrap();
        drop(server_side);
        let mut open = true;
        for _ in 0..50 {
            open = stream.is_open();
            if !open {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(!open);

        stream.close();
        stream.close();
        assert!(stream.get_mut().is_none());
    }
}
