//! Connection acquisition errors.

use std::io;
use std::net::SocketAddr;

/// Why a connection could not be acquired.
///
/// Failures are reported to the caller of `acquire`; the pool never retries.
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// The load balancer had no server to offer.
    #[error("no available servers for origin {origin}")]
    NoAvailableServers { origin: String },

    /// Open plus in-progress connections to the server hit the ceiling.
    #[error("max connections per host ({limit}) reached for {server}")]
    MaxConnsPerHostExceeded { server: SocketAddr, limit: usize },

    /// The socket could not be opened (refused, unreachable, timed out).
    #[error("failed to connect to {server}: {source}")]
    Connect {
        server: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// The pool is shutting down and accepts no new acquires.
    #[error("connection pool is shutting down")]
    ShuttingDown,
}

impl PoolError {
    /// Whether another attempt (possibly on another server) may succeed.
    ///
    /// Capacity and shutdown failures are not transient at this layer.
    pub fn is_retryable(&self) -> bool {
        matches!(self, PoolError::Connect { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, PoolError::Connect { source, .. } if source.kind() == io::ErrorKind::TimedOut)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connect_errors_are_retryable() {
        let server: SocketAddr = "127.0.0.1:3000".parse().unwrap();
        let timed_out = PoolError::Connect {
            server,
            source: io::Error::from(io::ErrorKind::TimedOut),
        };
        assert!(timed_out.is_retryable());
        assert!(timed_out.is_timeout());

        assert!(!PoolError::MaxConnsPerHostExceeded { server, limit: 1 }.is_retryable());
        assert!(!PoolError::ShuttingDown.is_retryable());
        assert!(!PoolError::NoAvailableServers { origin: "api".into() }.is_retryable());
    }

    #[test]
    fn test_display_names_server() {
        let err = PoolError::MaxConnsPerHostExceeded {
            server: "10.0.0.1:80".parse().unwrap(),
            limit: 50,
        };
        assert_eq!(err.to_string(), "max connections per host (50) reached for 10.0.0.1:80");
    }
}
