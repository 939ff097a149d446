//! Resilience subsystem.
//!
//! # Data Flow
//! ```text
//! New origin connection:
//!     → timeouts.rs (enforce connect timeout)
//!     → On failure: circuit_breaker.rs (count failure, trip if threshold exceeded)
//!
//! Release of a pooled connection:
//!     → circuit_breaker.rs (tripped backend → connection is closed, not pooled)
//! ```
//!
//! # Design Decisions
//! - Timeouts are non-negotiable; every connect has a deadline
//! - The pool reports failures but never retries; retry policy lives upstream
//! - Circuit breaker state is lock-free so reactors never block on it

pub mod circuit_breaker;
pub mod timeouts;

pub use circuit_breaker::{CircuitBreaker, CircuitState};
