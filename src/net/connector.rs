//! Connection factory.
//!
//! # Responsibilities
//! - Open new sockets to origin servers on behalf of a worker
//! - Apply socket options from the current pool configuration
//! - Enforce the connect timeout at the socket layer

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::TcpSocket;

use crate::config::PoolConfig;
use crate::net::connection::{OriginSocket, TcpOriginStream};
use crate::net::worker::WorkerId;
use crate::resilience::timeouts::connect_with_timeout;

/// Socket-level options derived from a pool configuration snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SocketOptions {
    pub connect_timeout: Duration,
    pub tcp_keep_alive: bool,
    pub tcp_no_delay: bool,
    pub send_buffer_size: Option<u32>,
    pub receive_buffer_size: Option<u32>,
}

impl From<&PoolConfig> for SocketOptions {
    fn from(config: &PoolConfig) -> Self {
        Self {
            connect_timeout: config.connect_timeout(),
            tcp_keep_alive: config.tcp_keep_alive,
            tcp_no_delay: config.tcp_no_delay,
            send_buffer_size: config.send_buffer_size,
            receive_buffer_size: config.receive_buffer_size,
        }
    }
}

/// Opens sockets to origin servers.
///
/// `connect` is awaited on the requesting worker, so the returned socket
/// is registered with that worker's reactor.
pub trait ConnectionFactory: Send + Sync + 'static {
    type Socket: OriginSocket;

    fn connect(
        &self,
        worker: WorkerId,
        addr: SocketAddr,
        options: &SocketOptions,
    ) -> impl Future<Output = io::Result<Self::Socket>> + Send;
}

/// Plain TCP connection factory.
#[derive(Debug, Clone, Default)]
pub struct TcpConnector;

impl TcpConnector {
    pub fn new() -> Self {
        Self
    }

    fn socket_for(addr: SocketAddr, options: &SocketOptions) -> io::Result<TcpSocket> {
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_keepalive(options.tcp_keep_alive)?;
        socket.set_nodelay(options.tcp_no_delay)?;
        if let Some(size) = options.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        if let Some(size) = options.receive_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        Ok(socket)
    }
}

impl ConnectionFactory for TcpConnector {
    type Socket = TcpOriginStream;

    fn connect(
        &self,
        worker: WorkerId,
        addr: SocketAddr,
        options: &SocketOptions,
    ) -> impl Future<Output = io::Result<Self::Socket>> + Send {
        let options = options.clone();
        async move {
            let socket = Self::socket_for(addr, &options)?;
            let stream = connect_with_timeout(options.connect_timeout, socket.connect(addr)).await?;
            tracing::trace!(%worker, server = %addr, "TCP connection established");
            Ok(TcpOriginStream::new(stream, addr))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_tcp_connect_applies_options() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let options = SocketOptions::from(&PoolConfig {
            tcp_no_delay: true,
            ..PoolConfig::default()
        });
        let stream = TcpConnector::new()
            .connect(WorkerId::new(0), addr, &options)
            .await
            .unwrap();

        assert_eq!(stream.peer_addr(), addr);
        assert!(stream.get_ref().unwrap().nodelay().unwrap());
        assert!(stream.is_open());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = SocketOptions::from(&PoolConfig::default());
        let err = TcpConnector::new()
            .connect(WorkerId::new(0), addr, &options)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
