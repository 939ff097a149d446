//! Backend abstraction.
//!
//! # Responsibilities
//! - Represent a single backend server of an origin
//! - Track active requests and open connections (for Least Connections LB)
//! - Track response latency (EWMA)
//! - Own the backend's circuit breaker

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use crate::config::CircuitBreakerConfig;
use crate::resilience::CircuitBreaker;

/// Weight of the newest sample in the response-time EWMA, in 1/8ths.
const EWMA_NEW_SAMPLE_EIGHTHS: u64 = 2;

/// A single backend server.
#[derive(Debug)]
pub struct Backend {
    /// The address of the backend. Also its identity.
    pub addr: SocketAddr,
    stats: BackendStats,
}

impl Backend {
    /// Create a new backend with a default circuit breaker.
    pub fn new(addr: SocketAddr) -> Self {
        Self::with_breaker(addr, &CircuitBreakerConfig::default())
    }

    pub fn with_breaker(addr: SocketAddr, breaker: &CircuitBreakerConfig) -> Self {
        Self {
            addr,
            stats: BackendStats::new(CircuitBreaker::new(
                breaker.failure_threshold,
                Duration::from_millis(breaker.recovery_ms),
            )),
        }
    }

    /// Apply reloaded breaker settings.
    pub fn apply_breaker(&self, breaker: &CircuitBreakerConfig) {
        self.stats.breaker.reconfigure(
            breaker.failure_threshold,
            Duration::from_millis(breaker.recovery_ms),
        );
    }

    pub fn stats(&self) -> &BackendStats {
        &self.stats
    }

    /// Return true if the backend should receive new traffic.
    pub fn is_healthy(&self) -> bool {
        !self.stats.is_circuit_breaker_tripped()
    }
}

/// Health and load statistics of one backend, shared across workers.
#[derive(Debug)]
pub struct BackendStats {
    active_requests: AtomicUsize,
    open_connections: AtomicUsize,
    /// Response time EWMA in microseconds. Zero until the first sample.
    response_time_micros: AtomicU64,
    breaker: CircuitBreaker,
}

impl BackendStats {
    fn new(breaker: CircuitBreaker) -> Self {
        Self {
            active_requests: AtomicUsize::new(0),
            open_connections: AtomicUsize::new(0),
            response_time_micros: AtomicU64::new(0),
            breaker,
        }
    }

    pub fn increment_active_requests(&self) {
        self.active_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_active_requests(&self) {
        saturating_dec(&self.active_requests);
    }

    pub fn active_requests(&self) -> usize {
        self.active_requests.load(Ordering::Relaxed)
    }

    pub fn increment_open_connections(&self) {
        self.open_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrement_open_connections(&self) {
        saturating_dec(&self.open_connections);
    }

    pub fn open_connections(&self) -> usize {
        self.open_connections.load(Ordering::Relaxed)
    }

    /// Fold one response time into the moving average.
    pub fn note_response_time(&self, elapsed: Duration) {
        let sample = elapsed.as_micros().min(u64::MAX as u128) as u64;
        let _ = self
            .response_time_micros
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |prev| {
                if prev == 0 {
                    Some(sample.max(1))
                } else {
                    Some(
                        (prev * (8 - EWMA_NEW_SAMPLE_EIGHTHS) + sample * EWMA_NEW_SAMPLE_EIGHTHS) / 8,
                    )
                }
            });
    }

    pub fn response_time(&self) -> Duration {
        Duration::from_micros(self.response_time_micros.load(Ordering::Relaxed))
    }

    /// Report a failed connect or request.
    pub fn record_failure(&self) {
        self.breaker.record_failure();
    }

    /// Report a successful connect or request.
    pub fn record_success(&self) {
        self.breaker.record_success();
    }

    pub fn is_circuit_breaker_tripped(&self) -> bool {
        self.breaker.is_tripped()
    }

    pub fn circuit_breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }
}

fn saturating_dec(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_never_underflow() {
        let b = Backend::new("127.0.0.1:8080".parse().unwrap());
        b.stats().decrement_open_connections();
        b.stats().increment_active_requests();
        b.stats().decrement_active_requests();
        b.stats().decrement_active_requests();
        assert_eq!(b.stats().open_connections(), 0);
        assert_eq!(b.stats().active_requests(), 0);
    }

    #[test]
    fn test_response_time_ewma() {
        let b = Backend::new("127.0.0.1:8080".parse().unwrap());
        b.stats().note_response_time(Duration::from_millis(100));
        assert_eq!(b.stats().response_time(), Duration::from_millis(100));

        b.stats().note_response_time(Duration::from_millis(500));
        // 100 * 6/8 + 500 * 2/8 = 200
        assert_eq!(b.stats().response_time(), Duration::from_millis(200));
    }

    #[test]
    fn test_breaker_marks_unhealthy() {
        let config = CircuitBreakerConfig {
            failure_threshold: 2,
            recovery_ms: 60_000,
        };
        let b = Backend::with_breaker("127.0.0.1:8080".parse().unwrap(), &config);
        assert!(b.is_healthy());
        b.stats().record_failure();
        b.stats().record_failure();
        assert!(!b.is_healthy());
        assert!(b.stats().is_circuit_breaker_tripped());
    }
}
