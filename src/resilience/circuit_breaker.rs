//! Circuit breaker for backend protection.
//!
//! # States
//! - Closed: normal operation, connections are pooled and reused
//! - Open: backend assumed down, released connections are discarded
//! - Half-Open: testing if backend recovered
//!
//! # State Transitions
//! ```text
//! Closed → Open: consecutive failures >= threshold
//! Open → Half-Open: after recovery timeout
//! Half-Open → Closed: trial connect succeeds
//! Half-Open → Open: trial connect fails
//! ```
//!
//! # Design Decisions
//! - Per-backend circuit breaker (not global)
//! - Atomics only: queried from every worker on the release path

use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    Closed = 0,
    Open = 1,
    HalfOpen = 2,
}

impl From<u8> for CircuitState {
    fn from(val: u8) -> Self {
        match val {
            1 => CircuitState::Open,
            2 => CircuitState::HalfOpen,
            _ => CircuitState::Closed,
        }
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    /// Millis since `epoch` at which the breaker last opened.
    opened_at_ms: AtomicU64,
    epoch: Instant,
    failure_threshold: AtomicU32,
    recovery_ms: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery: Duration) -> Self {
        Self {
            state: AtomicU8::new(CircuitState::Closed as u8),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
            epoch: Instant::now(),
            failure_threshold: AtomicU32::new(failure_threshold.max(1)),
            recovery_ms: AtomicU64::new(recovery.as_millis() as u64),
        }
    }

    /// Apply new thresholds. Current state and failure count are kept.
    pub fn reconfigure(&self, failure_threshold: u32, recovery: Duration) {
        self.failure_threshold
            .store(failure_threshold.max(1), Ordering::Relaxed);
        self.recovery_ms
            .store(recovery.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold.load(Ordering::Relaxed)
    }

    pub fn recovery(&self) -> Duration {
        Duration::from_millis(self.recovery_ms.load(Ordering::Relaxed))
    }

    pub fn state(&self) -> CircuitState {
        CircuitState::from(self.state.load(Ordering::Acquire))
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }

    /// True while the breaker is open and the recovery window has not passed.
    ///
    /// Once the window passes, the first caller moves the breaker to half-open
    /// and is told it is not tripped, letting one trial connect through.
    pub fn is_tripped(&self) -> bool {
        if self.state() != CircuitState::Open {
            return false;
        }

        let opened_at = Duration::from_millis(self.opened_at_ms.load(Ordering::Acquire));
        if self.epoch.elapsed().saturating_sub(opened_at) < self.recovery() {
            return true;
        }

        let _ = self.state.compare_exchange(
            CircuitState::Open as u8,
            CircuitState::HalfOpen as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
        false
    }

    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        let prev = self.state.swap(CircuitState::Closed as u8, Ordering::AcqRel);
        if prev != CircuitState::Closed as u8 {
            tracing::info!("Circuit breaker closed");
        }
    }

    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        match self.state() {
            CircuitState::HalfOpen => self.open(),
            CircuitState::Closed if failures >= self.failure_threshold() => self.open(),
            _ => {}
        }
    }

    fn open(&self) {
        let now_ms = self.epoch.elapsed().as_millis() as u64;
        self.opened_at_ms.store(now_ms, Ordering::Release);
        self.state.store(CircuitState::Open as u8, Ordering::Release);
        tracing::warn!(
            failures = self.consecutive_failures(),
            recovery_ms = self.recovery().as_millis() as u64,
            "Circuit breaker opened"
        );
    }
}
