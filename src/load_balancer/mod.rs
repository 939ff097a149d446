//! Load balancing subsystem.
//!
//! # Data Flow
//! ```text
//! acquire(worker, routing_key)
//!     → LoadBalancer::choose_server
//!         - routing key present: rendezvous hash over healthy servers (affinity)
//!         - otherwise: strategy (round_robin.rs / least_conn.rs)
//!     → Backend (identity + stats sink)
//!
//! Discovery update (discovery.rs):
//!     new server list → diff against current
//!     → ServerListChange broadcast
//!     → pool manager tears down pools of removed servers
//! ```
//!
//! # Design Decisions
//! - Selection never blocks: the server list is an atomically swapped snapshot
//! - Surviving servers keep their Backend (and its stats) across updates
//! - Servers with a tripped circuit breaker are skipped

pub mod backend;
pub mod discovery;
pub mod least_conn;
pub mod round_robin;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::broadcast;

pub use backend::{Backend, BackendStats};
pub use discovery::DiscoveryLoadBalancer;
pub use least_conn::LeastConnections;
pub use round_robin::RoundRobin;

/// Picks one backend out of a candidate list.
pub trait SelectionStrategy: Send + Sync + std::fmt::Debug {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>>;
}

/// Server selection as seen by the connection pool.
pub trait LoadBalancer: Send + Sync {
    /// Choose a server, using `routing_key` for affinity when given.
    fn choose_server(&self, routing_key: Option<&str>) -> Option<Arc<Backend>>;

    /// Number of servers currently known.
    fn server_count(&self) -> usize;

    /// Every server currently known, healthy or not.
    fn backends(&self) -> Vec<Arc<Backend>>;

    /// Subscribe to server list changes.
    fn subscribe(&self) -> broadcast::Receiver<ServerListChange>;
}

/// A change in the set of servers behind an origin.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ServerListChange {
    pub added: Vec<SocketAddr>,
    pub removed: Vec<SocketAddr>,
}

impl ServerListChange {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}
