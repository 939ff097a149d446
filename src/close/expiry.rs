//! Connection expiry policy.
//!
//! Every connection gets a request budget and an age budget. The age
//! budget carries a random jitter so connections opened together do not
//! all expire together.

use metrics::counter;
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::close::{ConnectionFlags, Protocol};
use crate::config::{ExpiryConfig, LiveConfig};

/// Process-wide degraded-capacity signal.
///
/// While active, connections expire after fewer requests.
#[derive(Debug, Clone, Default)]
pub struct Brownout(Arc<AtomicBool>);

impl Brownout {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, active: bool) {
        let was = self.0.swap(active, Ordering::AcqRel);
        if was != active {
            tracing::info!(active, "Brownout mode changed");
        }
    }

    pub fn is_active(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Why a connection was flagged for close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpiryReason {
    RequestCount,
    MaxAge,
}

impl ExpiryReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpiryReason::RequestCount => "request_count",
            ExpiryReason::MaxAge => "max_age",
        }
    }
}

/// Expiry state of one connection.
#[derive(Debug)]
pub struct ConnectionExpiry {
    protocol: Protocol,
    flags: Arc<ConnectionFlags>,
    config: LiveConfig<ExpiryConfig>,
    brownout: Brownout,
    created_at: Instant,
    deadline: Instant,
    requests: AtomicU64,
    expired: AtomicBool,
}

impl ConnectionExpiry {
    pub fn new(
        protocol: Protocol,
        flags: Arc<ConnectionFlags>,
        config: LiveConfig<ExpiryConfig>,
        brownout: Brownout,
    ) -> Self {
        Self::starting_at(protocol, flags, config, brownout, Instant::now())
    }

    /// Track a connection that was opened at `created_at`.
    pub fn starting_at(
        protocol: Protocol,
        flags: Arc<ConnectionFlags>,
        config: LiveConfig<ExpiryConfig>,
        brownout: Brownout,
        created_at: Instant,
    ) -> Self {
        let max_jitter_ms = config.current().max_jitter_ms;
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms));
        Self::with_start(protocol, flags, config, brownout, created_at, jitter)
    }

    pub(crate) fn with_start(
        protocol: Protocol,
        flags: Arc<ConnectionFlags>,
        config: LiveConfig<ExpiryConfig>,
        brownout: Brownout,
        created_at: Instant,
        jitter: Duration,
    ) -> Self {
        let max_age = Duration::from_millis(config.current().max_age_ms);
        Self {
            protocol,
            flags,
            config,
            brownout,
            created_at,
            deadline: created_at + max_age + jitter,
            requests: AtomicU64::new(0),
            expired: AtomicBool::new(false),
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Instant from which the connection is past its age budget.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn request_count(&self) -> u64 {
        self.requests.load(Ordering::Acquire)
    }

    /// Response headers for one request went out on this connection.
    pub fn on_response_headers_sent(&self) -> Option<ExpiryReason> {
        self.on_response_headers_sent_at(Instant::now())
    }

    /// Count a response and flag the connection if a budget is used up.
    ///
    /// Returns the reason only the first time the connection is flagged.
    pub fn on_response_headers_sent_at(&self, now: Instant) -> Option<ExpiryReason> {
        let count = self.requests.fetch_add(1, Ordering::AcqRel) + 1;
        let config = self.config.current();
        let max_requests = if self.brownout.is_active() {
            config.max_requests_brownout
        } else {
            config.max_requests
        };

        let reason = if count >= max_requests {
            ExpiryReason::RequestCount
        } else if now >= self.deadline {
            ExpiryReason::MaxAge
        } else {
            return None;
        };

        if self.expired.swap(true, Ordering::AcqRel) {
            return None;
        }

        let close_type = self.protocol.expiry_close_type();
        self.flags.flag_close(close_type);
        tracing::debug!(
            reason = reason.as_str(),
            requests = count,
            age_ms = now.saturating_duration_since(self.created_at).as_millis() as u64,
            ?close_type,
            "Connection expired"
        );
        counter!("origin_connection_expired_total", "reason" => reason.as_str()).increment(1);
        Some(reason)
    }
}
