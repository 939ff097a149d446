//! Metrics collection and exposition.
//!
//! # Responsibilities
//! - Count connection-pool lifecycle events per origin
//! - Time origin connects
//! - Expose a Prometheus-compatible endpoint
//!
//! # Metrics
//! - `origin_pool_events_total{origin,event}` (counter)
//! - `origin_pool_connect_seconds{origin}` (histogram)
//! - `origin_pool_connections{origin,state}` (gauge, refreshed by the registry)
//!
//! # Design Decisions
//! - Every event is also kept in an in-process atomic, readable by the
//!   admin API and tests without a recorder installed
//! - Cheap updates: one relaxed atomic plus one facade call

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Connection-pool lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolEvent {
    Create,
    CreateSuccess,
    CreateFail,
    Close,
    Request,
    Reuse,
    Release,
    AlreadyClosed,
    StaleFromPool,
    MaxConnsExceeded,
    WaterlineClose,
    IdleTimeout,
    Teardown,
}

impl PoolEvent {
    pub const ALL: [PoolEvent; 13] = [
        PoolEvent::Create,
        PoolEvent::CreateSuccess,
        PoolEvent::CreateFail,
        PoolEvent::Close,
        PoolEvent::Request,
        PoolEvent::Reuse,
        PoolEvent::Release,
        PoolEvent::AlreadyClosed,
        PoolEvent::StaleFromPool,
        PoolEvent::MaxConnsExceeded,
        PoolEvent::WaterlineClose,
        PoolEvent::IdleTimeout,
        PoolEvent::Teardown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PoolEvent::Create => "create",
            PoolEvent::CreateSuccess => "create_success",
            PoolEvent::CreateFail => "create_fail",
            PoolEvent::Close => "close",
            PoolEvent::Request => "request",
            PoolEvent::Reuse => "reuse",
            PoolEvent::Release => "release",
            PoolEvent::AlreadyClosed => "already_closed",
            PoolEvent::StaleFromPool => "stale_from_pool",
            PoolEvent::MaxConnsExceeded => "max_conns_exceeded",
            PoolEvent::WaterlineClose => "waterline_close",
            PoolEvent::IdleTimeout => "idle_timeout",
            PoolEvent::Teardown => "teardown",
        }
    }

    fn index(&self) -> usize {
        *self as usize
    }
}

/// Per-origin pool metrics.
#[derive(Debug)]
pub struct PoolMetrics {
    origin: String,
    counts: [AtomicU64; 13],
}

impl PoolMetrics {
    pub fn new(origin: impl Into<String>) -> Self {
        Self {
            origin: origin.into(),
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn incr(&self, event: PoolEvent) {
        self.counts[event.index()].fetch_add(1, Ordering::Relaxed);
        counter!(
            "origin_pool_events_total",
            "origin" => self.origin.clone(),
            "event" => event.as_str()
        )
        .increment(1);
    }

    pub fn count(&self, event: PoolEvent) -> u64 {
        self.counts[event.index()].load(Ordering::Relaxed)
    }

    pub fn record_connect_latency(&self, elapsed: Duration) {
        histogram!("origin_pool_connect_seconds", "origin" => self.origin.clone())
            .record(elapsed.as_secs_f64());
    }

    /// Publish point-in-time connection counts.
    pub fn record_connections(&self, in_use: usize, in_pool: usize, in_progress: usize) {
        for (state, value) in [("in_use", in_use), ("in_pool", in_pool), ("in_progress", in_progress)] {
            gauge!(
                "origin_pool_connections",
                "origin" => self.origin.clone(),
                "state" => state
            )
            .set(value as f64);
        }
    }

    /// All counters as (name, value) pairs.
    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        PoolEvent::ALL
            .iter()
            .map(|e| (e.as_str(), self.count(*e)))
            .collect()
    }
}

/// Install the Prometheus exporter listening on `addr`.
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(addr: SocketAddr) {
    match PrometheusBuilder::new().with_http_listener(addr).install() {
        Ok(()) => tracing::info!(address = %addr, "Metrics exporter listening"),
        Err(e) => tracing::error!(error = %e, "Failed to install metrics exporter"),
    }
}
