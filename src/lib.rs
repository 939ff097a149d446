//! Outbound connection layer of a reverse proxy.
//!
//! Establishes, pools, reuses and tears down connections to origin servers,
//! and decides when and how a connection is allowed to close.

// Core subsystems
pub mod close;
pub mod config;
pub mod net;
pub mod pool;

// Traffic management
pub mod load_balancer;

// Cross-cutting concerns
pub mod admin;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::schema::ProxyConfig;
pub use lifecycle::Shutdown;
pub use pool::{ConnectionPoolManager, OriginRegistry, PoolError, PooledConnection};
