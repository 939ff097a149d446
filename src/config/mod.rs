//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → per-origin PoolConfig published through live.rs
//!
//! On reload (file change or SIGHUP):
//!     watcher.rs detects change
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → registry swaps each origin's LiveConfig snapshot
//!     → pools observe new values on their next decision
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable; a reload swaps whole values
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks

pub mod live;
pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use live::LiveConfig;
pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    AdminConfig, CircuitBreakerConfig, CloseConfig, ExpiryConfig, LoadBalancing,
    ObservabilityConfig, OriginConfig, PoolConfig, ProxyConfig, WorkerConfig,
};
pub use validation::ValidationError;
