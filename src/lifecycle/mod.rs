//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Shutdown (shutdown.rs):
//!     Signal received → managers refuse acquires, close idle connections,
//!     flag in-use ones → wait for releases (bounded) → stop workers → exit
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → Trigger graceful shutdown
//!     SIGHUP → Trigger config reload
//! ```
//!
//! # Design Decisions
//! - Ordered shutdown: stop acquires, drain, stop reactors
//! - Shutdown has timeout: forced exit after deadline

pub mod shutdown;
pub mod signals;

pub use shutdown::{drain_origins, Shutdown};
pub use signals::{spawn_signal_handler, SignalEvent};
