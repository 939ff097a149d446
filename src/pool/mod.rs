//! Origin connection pooling subsystem.
//!
//! # Data Flow
//! ```text
//! acquire(worker, routing_key)
//!     → manager.rs: shutting down? → load balancer picks a server
//!     → server_pool.rs: pop the worker's idle queue (LIFO, liveness checked)
//!         - hit: hand out without touching the network
//!         - miss: reserve under the per-host ceiling → factory connect
//!     → record.rs: PooledConnection (exclusively owned by the caller)
//!
//! release(conn)
//!     → manager.rs: eviction policy (flagged / worn out / breaker / dead)
//!     → server_pool.rs: waterline check → park + idle timer, or close
//! ```
//!
//! # Design Decisions
//! - Connections are values: checkout moves ownership to the caller and
//!   release moves it back, so a record is never in two places at once
//! - Cross-worker state is atomics and concurrent maps only
//! - Pools are created lazily per server and torn down on discovery removal

pub mod error;
pub mod manager;
pub mod record;
pub mod registry;
pub mod server_pool;

pub use error::PoolError;
pub use manager::{ConnectionPoolManager, OriginSnapshot};
pub use record::{ConnectionFlags, ConnectionRef, PoolLedger, PooledConnection, WriteState};
pub use registry::OriginRegistry;
pub use server_pool::{PerServerPool, ServerPoolStats};
