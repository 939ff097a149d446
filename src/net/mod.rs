//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Pool needs a new origin connection
//!     → worker.rs (the requesting worker's reactor drives the connect)
//!     → connector.rs (socket options, connect timeout)
//!     → connection.rs (OriginSocket wrapping the stream, ConnectionId)
//!     → Hand off to pool::record
//! ```
//!
//! # Design Decisions
//! - A socket is bound to the worker that opened it, for life
//! - Connect deadlines enforced at the socket layer
//! - The pool only sees the OriginSocket trait, so tests substitute mocks

pub mod connection;
pub mod connector;
pub mod worker;

pub use connection::{ConnectionId, OriginSocket, TcpOriginStream};
pub use connector::{ConnectionFactory, SocketOptions, TcpConnector};
pub use worker::{WorkerError, WorkerGroup, WorkerId};
