//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the origin
//! connection layer. All types derive Serde traits for deserialization from
//! config files, and every field has a default.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Root configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default, PartialEq)]
#[serde(default)]
pub struct ProxyConfig {
    /// Worker reactor settings.
    pub workers: WorkerConfig,

    /// Origins (logical destinations) and their connection pools.
    pub origins: Vec<OriginConfig>,

    /// Connection close behaviour.
    pub close: CloseConfig,

    /// Connection expiry policy.
    pub expiry: ExpiryConfig,

    /// Per-backend circuit breaker.
    pub circuit_breaker: CircuitBreakerConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin surface.
    pub admin: AdminConfig,
}

impl ProxyConfig {
    pub fn origin(&self, name: &str) -> Option<&OriginConfig> {
        self.origins.iter().find(|o| o.name == name)
    }
}

/// Worker reactor configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Number of single-threaded reactors. Defaults to available parallelism.
    pub count: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            count: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        }
    }
}

/// A logical destination served by a set of backend servers.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct OriginConfig {
    /// Origin name used in logs, metrics and the admin API.
    pub name: String,

    /// Backend server addresses (e.g., "127.0.0.1:3000").
    #[serde(default)]
    pub servers: Vec<String>,

    /// Server selection strategy when no routing key is given.
    #[serde(default)]
    pub load_balancing: LoadBalancing,

    /// Connection pool settings for this origin.
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancing {
    #[default]
    RoundRobin,
    LeastConnections,
}

/// Per-origin connection pool configuration. Hot-reloadable.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct PoolConfig {
    /// Requests a single origin connection may serve before it is closed.
    pub max_requests_per_connection: u64,

    /// Idle connections a single worker keeps per server.
    pub per_server_waterline: usize,

    /// Connection establishment timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Idle connection timeout in milliseconds.
    pub idle_timeout_ms: u64,

    /// Ceiling on open + in-progress connections per backend server.
    pub max_connections_per_host: usize,

    pub tcp_keep_alive: bool,

    pub tcp_no_delay: bool,

    /// Pending-write bytes above which a connection stops accepting writes.
    pub write_buffer_high_water_mark: usize,

    /// Pending-write bytes below which writes resume.
    pub write_buffer_low_water_mark: usize,

    /// SO_SNDBUF override in bytes.
    pub send_buffer_size: Option<u32>,

    /// SO_RCVBUF override in bytes.
    pub receive_buffer_size: Option<u32>,

    /// Whether the origin is reached over a secure transport.
    pub secure: bool,

    /// Connections opened per worker per server at startup.
    pub prewarm_per_worker: usize,
}

impl PoolConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_requests_per_connection: 1000,
            per_server_waterline: 4,
            connect_timeout_ms: 500,
            idle_timeout_ms: 60_000,
            max_connections_per_host: 50,
            tcp_keep_alive: false,
            tcp_no_delay: false,
            write_buffer_high_water_mark: 32 * 1024,
            write_buffer_low_water_mark: 8 * 1024,
            send_buffer_size: None,
            receive_buffer_size: None,
            secure: false,
            prewarm_per_worker: 0,
        }
    }
}

/// Connection close configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CloseConfig {
    /// Allow the two-phase shutdown on multiplexed connections.
    /// When false, delayed-graceful closes fall back to immediate.
    pub allow_graceful_delayed: bool,

    /// Grace delay in seconds before a deferred close is forced.
    pub graceful_delay_secs: u64,
}

impl CloseConfig {
    pub fn graceful_delay(&self) -> Duration {
        Duration::from_secs(self.graceful_delay_secs)
    }
}

impl Default for CloseConfig {
    fn default() -> Self {
        Self {
            allow_graceful_delayed: true,
            graceful_delay_secs: 30,
        }
    }
}

/// Connection expiry configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ExpiryConfig {
    /// Requests per connection in normal operation.
    pub max_requests: u64,

    /// Requests per connection while in brownout.
    pub max_requests_brownout: u64,

    /// Base connection age budget in milliseconds.
    pub max_age_ms: u64,

    /// Upper bound of the random jitter added to the age budget.
    pub max_jitter_ms: u64,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            max_requests: 1000,
            max_requests_brownout: 20,
            max_age_ms: 15 * 60 * 1000,
            max_jitter_ms: 20_000,
        }
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,

    /// Time the breaker stays open before a trial connect is allowed.
    pub recovery_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_ms: 10_000,
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: true,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}
