//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! Pool, close and expiry logic produce:
//!     → logging.rs (structured log events)
//!     → metrics.rs (per-origin event counters, connect latency)
//!
//! Consumers:
//!     → Log aggregation (stdout)
//!     → Metrics endpoint (Prometheus scrape)
//!     → Admin API (in-process counter snapshots)
//! ```

pub mod logging;
pub mod metrics;

pub use metrics::{PoolEvent, PoolMetrics};
