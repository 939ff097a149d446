//! Connection-pool manager.
//!
//! # Responsibilities
//! - Entry point for the request layer: acquire, release, remove, shutdown
//! - Resolve a destination server through the load balancer
//! - Lazily create one `PerServerPool` per server, tear it down on removal
//! - Apply the release eviction policy and feed backend health stats
//! - Bind expiry tracking and close handlers to checked-out connections

use dashmap::DashMap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

use crate::close::{
    ClosePolicy, CloseType, ConnectionControl, ConnectionExpiry, Http1CloseHandler,
    Http2CloseHandler, MultiplexedControl, Protocol,
};
use crate::config::{LiveConfig, PoolConfig};
use crate::load_balancer::{Backend, LoadBalancer};
use crate::net::{ConnectionFactory, WorkerId};
use crate::observability::metrics::{PoolEvent, PoolMetrics};
use crate::pool::error::PoolError;
use crate::pool::record::{ConnectionRef, PooledConnection};
use crate::pool::server_pool::{PerServerPool, ServerPoolStats};

/// Point-in-time view of one origin's pools.
#[derive(Debug, Clone, Serialize)]
pub struct OriginSnapshot {
    pub origin: String,
    pub available: bool,
    pub cold: bool,
    pub shutting_down: bool,
    pub inflight_requests: usize,
    pub servers: Vec<ServerPoolStats>,
    pub events: BTreeMap<&'static str, u64>,
}

/// Pools of every server behind one origin.
pub struct ConnectionPoolManager<F: ConnectionFactory> {
    origin: String,
    balancer: Arc<dyn LoadBalancer>,
    factory: Arc<F>,
    config: LiveConfig<PoolConfig>,
    metrics: Arc<PoolMetrics>,
    policy: ClosePolicy,
    pools: DashMap<SocketAddr, Arc<PerServerPool<F>>>,
    workers: usize,
    shutting_down: AtomicBool,
}

impl<F: ConnectionFactory> ConnectionPoolManager<F> {
    /// `workers` is the number of reactors; each gets its own idle queues.
    pub fn new(
        origin: impl Into<String>,
        balancer: Arc<dyn LoadBalancer>,
        factory: Arc<F>,
        config: LiveConfig<PoolConfig>,
        workers: usize,
    ) -> Arc<Self> {
        Self::with_policy(origin, balancer, factory, config, ClosePolicy::default(), workers)
    }

    /// Like `new`, sharing `policy` with the rest of the process.
    pub fn with_policy(
        origin: impl Into<String>,
        balancer: Arc<dyn LoadBalancer>,
        factory: Arc<F>,
        config: LiveConfig<PoolConfig>,
        policy: ClosePolicy,
        workers: usize,
    ) -> Arc<Self> {
        let origin = origin.into();
        Arc::new(Self {
            metrics: Arc::new(PoolMetrics::new(origin.clone())),
            origin,
            balancer,
            factory,
            config,
            policy,
            pools: DashMap::new(),
            workers: workers.max(1),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Tear down pools of servers that leave the load balancer.
    ///
    /// Needs a runtime; returns `None` without one.
    pub fn watch_server_list(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        let handle = Handle::try_current().ok()?;
        let mut changes = self.balancer.subscribe();
        let manager: Weak<Self> = Arc::downgrade(self);

        Some(handle.spawn(async move {
            loop {
                let change = changes.recv().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                match change {
                    Ok(change) => {
                        for server in change.removed {
                            manager.teardown_server(server);
                        }
                    }
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(origin = %manager.origin, missed, "Server list changes lagged, reconciling");
                        manager.reconcile_pools();
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        }))
    }

    /// Tear down the pool of a server. False if there was none.
    pub fn teardown_server(&self, server: SocketAddr) -> bool {
        match self.pools.remove(&server) {
            Some((_, pool)) => {
                tracing::info!(origin = %self.origin, %server, "Server removed, tearing down its pool");
                pool.teardown();
                true
            }
            None => false,
        }
    }

    fn reconcile_pools(&self) {
        let known: Vec<SocketAddr> = self.balancer.backends().iter().map(|b| b.addr).collect();
        let gone: Vec<SocketAddr> = self
            .pools
            .iter()
            .map(|entry| *entry.key())
            .filter(|addr| !known.contains(addr))
            .collect();
        for server in gone {
            self.teardown_server(server);
        }
    }

    fn pool_for(&self, backend: &Arc<Backend>) -> Arc<PerServerPool<F>> {
        if let Some(pool) = self.pools.get(&backend.addr) {
            return Arc::clone(pool.value());
        }
        self.pools
            .entry(backend.addr)
            .or_insert_with(|| {
                tracing::debug!(origin = %self.origin, server = %backend.addr, "Creating server pool");
                PerServerPool::new(
                    Arc::clone(backend),
                    Arc::clone(&self.factory),
                    self.config.clone(),
                    Arc::clone(&self.metrics),
                    self.workers,
                )
            })
            .value()
            .clone()
    }

    /// Check out a connection for `worker`.
    ///
    /// `routing_key` pins the request to a stable server when given.
    pub async fn acquire(
        &self,
        worker: WorkerId,
        routing_key: Option<&str>,
    ) -> Result<PooledConnection<F::Socket>, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }

        let Some(backend) = self.balancer.choose_server(routing_key) else {
            return Err(PoolError::NoAvailableServers {
                origin: self.origin.clone(),
            });
        };

        let pool = self.pool_for(&backend);
        let conn = pool.acquire(worker).await?;
        backend.stats().increment_active_requests();

        // Shutdown began while connecting.
        if self.is_shutting_down() {
            conn.flag_close(CloseType::Graceful);
        }
        Ok(conn)
    }

    /// Hand a connection back after use.
    ///
    /// Returns true if it was pooled, false if it was closed.
    pub fn release(&self, mut conn: PooledConnection<F::Socket>) -> bool {
        if !conn.mark_released() {
            return false;
        }
        self.metrics.incr(PoolEvent::Release);

        let backend = Arc::clone(conn.backend());
        let stats = backend.stats();
        stats.decrement_active_requests();
        stats.note_response_time(conn.checked_out_for());

        let config = self.config.current();
        let discard = if conn.should_close() {
            Some("flagged")
        } else if conn.usage_count() >= config.max_requests_per_connection {
            Some("max_requests")
        } else if stats.is_circuit_breaker_tripped() {
            Some("circuit_breaker")
        } else if !conn.is_socket_open() {
            self.metrics.incr(PoolEvent::AlreadyClosed);
            Some("already_closed")
        } else if self.is_shutting_down() {
            Some("shutting_down")
        } else {
            None
        };

        if let Some(reason) = discard {
            tracing::debug!(
                origin = %self.origin,
                connection_id = %conn.id(),
                server = %conn.server(),
                usage = conn.usage_count(),
                reason,
                "Closing connection on release"
            );
            conn.close();
            return false;
        }

        conn.reset_for_reuse();
        let pool = self.pools.get(&conn.server()).map(|p| Arc::clone(p.value()));
        match pool {
            Some(pool) if conn.belongs_to(pool.ledger()) => pool.release(conn),
            pool => {
                tracing::debug!(
                    origin = %self.origin,
                    connection_id = %conn.id(),
                    server = %conn.server(),
                    reason = if pool.is_some() { "pool_replaced" } else { "pool_removed" },
                    "Closing connection on release"
                );
                conn.close();
                false
            }
        }
    }

    /// Start counting requests and age for `conn` against the expiry policy.
    ///
    /// Binding twice returns the tracker from the first call.
    pub fn bind_expiry(
        &self,
        conn: &mut PooledConnection<F::Socket>,
        protocol: Protocol,
    ) -> Arc<ConnectionExpiry> {
        if let Some(expiry) = conn.expiry() {
            return Arc::clone(expiry);
        }
        let expiry = Arc::new(ConnectionExpiry::starting_at(
            protocol,
            Arc::clone(conn.flags()),
            self.policy.expiry.clone(),
            self.policy.brownout.clone(),
            conn.created_at(),
        ));
        conn.set_expiry(Arc::clone(&expiry));
        expiry
    }

    /// Close procedure for a request/response connection.
    ///
    /// Must be created on the connection's worker.
    pub fn http1_close_handler<C: ConnectionControl>(
        &self,
        conn: &PooledConnection<F::Socket>,
        control: Arc<C>,
    ) -> Arc<Http1CloseHandler<C>> {
        Http1CloseHandler::new(control, Arc::clone(conn.flags()), self.policy.close.clone())
    }

    /// Close procedure for a multiplexed connection.
    ///
    /// Must be created on the connection's worker.
    pub fn http2_close_handler<C: MultiplexedControl>(
        &self,
        conn: &PooledConnection<F::Socket>,
        control: Arc<C>,
    ) -> Arc<Http2CloseHandler<C>> {
        Http2CloseHandler::new(control, Arc::clone(conn.flags()), self.policy.close.clone())
    }

    /// Close one idle connection out of band.
    pub fn remove(&self, conn: &ConnectionRef) -> bool {
        let pool = self.pools.get(&conn.server).map(|p| Arc::clone(p.value()));
        pool.is_some_and(|pool| pool.remove(conn))
    }

    /// Refuse new acquires, close idle connections and flag in-use ones.
    pub fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }

        let pools: Vec<_> = self.pools.iter().map(|p| Arc::clone(p.value())).collect();
        let (mut idle, mut in_use) = (0, 0);
        for pool in pools {
            let (closed, flagged) = pool.teardown();
            idle += closed;
            in_use += flagged;
        }
        tracing::info!(
            origin = %self.origin,
            idle_closed = idle,
            in_use_flagged = in_use,
            "Connection pool shut down"
        );
    }

    /// Open `per_server` idle connections to every known server on `worker`.
    ///
    /// Must run on `worker`'s reactor.
    pub async fn prewarm(&self, worker: WorkerId, per_server: usize) -> usize {
        let mut parked = 0;
        for backend in self.balancer.backends() {
            if self.is_shutting_down() {
                break;
            }
            parked += self.pool_for(&backend).prewarm(worker, per_server).await;
        }
        tracing::debug!(origin = %self.origin, %worker, parked, "Prewarm finished");
        parked
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Whether acquire can currently succeed at all.
    pub fn is_available(&self) -> bool {
        !self.is_shutting_down() && self.balancer.server_count() > 0
    }

    /// True while the origin has no live connection.
    pub fn is_cold(&self) -> bool {
        self.pools
            .iter()
            .all(|p| p.in_use() + p.in_pool() == 0)
    }

    /// Connections currently checked out across all servers.
    pub fn inflight_requests_count(&self) -> usize {
        self.pools.iter().map(|p| p.in_use()).sum()
    }

    pub fn pool(&self, server: SocketAddr) -> Option<Arc<PerServerPool<F>>> {
        self.pools.get(&server).map(|p| Arc::clone(p.value()))
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    pub fn config(&self) -> &LiveConfig<PoolConfig> {
        &self.config
    }

    pub fn close_policy(&self) -> &ClosePolicy {
        &self.policy
    }

    pub fn origin_name(&self) -> &str {
        &self.origin
    }

    pub fn max_requests_per_connection(&self) -> u64 {
        self.config.current().max_requests_per_connection
    }

    pub fn max_connections_per_host(&self) -> usize {
        self.config.current().max_connections_per_host
    }

    pub fn per_server_waterline(&self) -> usize {
        self.config.current().per_server_waterline
    }

    pub fn connect_timeout(&self) -> Duration {
        self.config.current().connect_timeout()
    }

    pub fn idle_timeout(&self) -> Duration {
        self.config.current().idle_timeout()
    }

    pub fn send_buffer_size(&self) -> Option<u32> {
        self.config.current().send_buffer_size
    }

    pub fn receive_buffer_size(&self) -> Option<u32> {
        self.config.current().receive_buffer_size
    }

    pub fn tcp_keep_alive(&self) -> bool {
        self.config.current().tcp_keep_alive
    }

    pub fn tcp_no_delay(&self) -> bool {
        self.config.current().tcp_no_delay
    }

    pub fn is_secure(&self) -> bool {
        self.config.current().secure
    }

    /// Push current connection counts to the metrics gauges.
    pub fn publish_gauges(&self) {
        let (mut in_use, mut in_pool, mut in_progress) = (0, 0, 0);
        for pool in self.pools.iter() {
            in_use += pool.in_use();
            in_pool += pool.in_pool();
            in_progress += pool.in_progress();
        }
        self.metrics.record_connections(in_use, in_pool, in_progress);
    }

    pub fn snapshot(&self) -> OriginSnapshot {
        let mut servers: Vec<ServerPoolStats> = self.pools.iter().map(|p| p.stats()).collect();
        servers.sort_by_key(|s| s.server);
        OriginSnapshot {
            origin: self.origin.clone(),
            available: self.is_available(),
            cold: self.is_cold(),
            shutting_down: self.is_shutting_down(),
            inflight_requests: self.inflight_requests_count(),
            servers,
            events: self.metrics.snapshot().into_iter().collect(),
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for ConnectionPoolManager<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPoolManager")
            .field("origin", &self.origin)
            .field("servers", &self.pools.len())
            .field("workers", &self.workers)
            .field("shutting_down", &self.is_shutting_down())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::close::test_support::RecordingControl;
    use crate::close::ExpiryReason;
    use crate::config::{CircuitBreakerConfig, ExpiryConfig, LoadBalancing};
    use crate::load_balancer::DiscoveryLoadBalancer;
    use crate::pool::test_support::MockFactory;

    struct Fixture {
        manager: Arc<ConnectionPoolManager<MockFactory>>,
        balancer: Arc<DiscoveryLoadBalancer>,
        factory: Arc<MockFactory>,
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn fixture(ports: &[u16], config: PoolConfig) -> Fixture {
        fixture_with(ports, config, MockFactory::new())
    }

    fn fixture_with(ports: &[u16], config: PoolConfig, factory: MockFactory) -> Fixture {
        let servers: Vec<SocketAddr> = ports.iter().map(|p| addr(*p)).collect();
        let balancer = Arc::new(DiscoveryLoadBalancer::new(
            "api",
            &servers,
            LoadBalancing::RoundRobin,
            CircuitBreakerConfig {
                failure_threshold: 2,
                recovery_ms: 60_000,
            },
        ));
        let factory = Arc::new(factory);
        let manager = ConnectionPoolManager::new(
            "api",
            balancer.clone(),
            factory.clone(),
            LiveConfig::new(config),
            2,
        );
        Fixture {
            manager,
            balancer,
            factory,
        }
    }

    fn w(i: usize) -> WorkerId {
        WorkerId::new(i)
    }

    #[tokio::test]
    async fn test_release_pools_and_reuses() {
        let f = fixture(&[8001], PoolConfig::default());
        let m = &f.manager;

        // Two connections already idle on worker 0.
        let a = m.acquire(w(0), None).await.unwrap();
        let b = m.acquire(w(0), None).await.unwrap();
        m.release(a);
        m.release(b);
        let pool = m.pool(addr(8001)).unwrap();
        assert_eq!(pool.idle_count(w(0)), 2);

        let a = m.acquire(w(0), None).await.unwrap();
        let c = m.acquire(w(0), None).await.unwrap();
        let d = m.acquire(w(0), None).await.unwrap();
        m.release(a);
        m.release(c);
        assert_eq!(pool.idle_count(w(0)), 2);

        let d_id = d.id();
        assert!(m.release(d));
        assert_eq!(pool.idle_count(w(0)), 3);
        assert_eq!(m.acquire(w(0), None).await.unwrap().id(), d_id);
        assert_eq!(f.factory.connect_count(), 3);
        // d was pooled once; a went back to the pool twice.
        assert_eq!(f.factory.sockets()[0].reset_count(), 2);
        assert_eq!(f.factory.sockets()[2].reset_count(), 1);
    }

    #[tokio::test]
    async fn test_connect_finishing_after_teardown_is_not_pooled_again() {
        let f = fixture_with(
            &[8001],
            PoolConfig {
                max_connections_per_host: 1,
                ..PoolConfig::default()
            },
            MockFactory::with_delay(Duration::from_millis(100)),
        );
        let _watcher = f.manager.watch_server_list().unwrap();

        let pending = tokio::spawn({
            let manager = Arc::clone(&f.manager);
            async move { manager.acquire(w(0), None).await }
        });
        tokio::task::yield_now().await;
        assert_eq!(f.manager.pool(addr(8001)).unwrap().in_progress(), 1);

        f.balancer.update_servers(&[]);
        for _ in 0..100 {
            if f.manager.pool(addr(8001)).is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(f.manager.pool(addr(8001)).is_none());

        f.balancer.update_servers(&[addr(8001)]);
        let fresh = f.manager.acquire(w(1), None).await.unwrap();
        let old = pending.await.unwrap().unwrap();
        assert!(old.should_close());
        assert!(!f.manager.release(old));

        let pool = f.manager.pool(addr(8001)).unwrap();
        assert_eq!(pool.idle_count(w(0)), 0);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.open_connections(), 1);
        assert_eq!(f.factory.sockets()[0].close_count(), 1);
        assert!(f.manager.release(fresh));
        assert_eq!(pool.idle_count(w(1)), 1);
    }

    #[tokio::test]
    async fn test_release_into_replaced_pool_closes() {
        let f = fixture(&[8001], PoolConfig::default());
        let old = f.manager.acquire(w(0), None).await.unwrap();
        f.manager.pools.remove(&addr(8001));
        let fresh = f.manager.acquire(w(0), None).await.unwrap();

        assert!(!f.manager.release(old));
        assert_eq!(f.factory.sockets()[0].close_count(), 1);
        let pool = f.manager.pool(addr(8001)).unwrap();
        assert_eq!(pool.idle_count(w(0)), 0);
        assert_eq!(pool.open_connections(), 1);
        assert!(f.manager.release(fresh));
    }

    #[tokio::test]
    async fn test_brownout_expiry_closes_connection_on_release() {
        let f = fixture(&[8001], PoolConfig::default());
        let policy = f.manager.close_policy();
        policy.expiry.store(ExpiryConfig {
            max_requests_brownout: 2,
            ..ExpiryConfig::default()
        });
        policy.brownout.set(true);

        let mut conn = f.manager.acquire(w(0), None).await.unwrap();
        let expiry = f.manager.bind_expiry(&mut conn, Protocol::Http1);
        assert_eq!(expiry.created_at(), conn.created_at());
        assert!(conn.on_response_headers_sent().is_none());
        assert!(f.manager.release(conn));

        let mut conn = f.manager.acquire(w(0), None).await.unwrap();
        let again = f.manager.bind_expiry(&mut conn, Protocol::Http1);
        assert!(Arc::ptr_eq(&expiry, &again));
        let handler = f.manager.http1_close_handler(&conn, RecordingControl::new());
        assert_eq!(conn.on_response_headers_sent(), Some(ExpiryReason::RequestCount));

        let mut headers = hyper::header::HeaderMap::new();
        assert!(handler.prepare_response_headers(&mut headers));
        assert_eq!(headers[hyper::header::CONNECTION], "close");
        assert!(!f.manager.release(conn));
        assert_eq!(f.factory.sockets()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_expiry_without_brownout_uses_normal_budget() {
        let f = fixture(&[8001], PoolConfig::default());
        f.manager.close_policy().expiry.store(ExpiryConfig {
            max_requests: 100,
            max_requests_brownout: 1,
            ..ExpiryConfig::default()
        });

        let mut conn = f.manager.acquire(w(0), None).await.unwrap();
        f.manager.bind_expiry(&mut conn, Protocol::Http2);
        let handler = f.manager.http2_close_handler(&conn, RecordingControl::new());
        assert!(conn.on_response_headers_sent().is_none());
        assert!(!handler.flags().should_close());
        assert!(f.manager.release(conn));
    }

    #[tokio::test]
    async fn test_no_servers() {
        let f = fixture(&[], PoolConfig::default());
        assert!(!f.manager.is_available());
        let err = f.manager.acquire(w(0), None).await.unwrap_err();
        assert!(matches!(err, PoolError::NoAvailableServers { ref origin } if origin == "api"));
    }

    #[tokio::test]
    async fn test_ceiling_scenario() {
        let f = fixture(
            &[8001],
            PoolConfig {
                max_connections_per_host: 1,
                ..PoolConfig::default()
            },
        );

        let first = f.manager.acquire(w(0), None).await.unwrap();
        let second = f.manager.acquire(w(1), None).await;
        assert!(matches!(second, Err(PoolError::MaxConnsPerHostExceeded { .. })));
        assert_eq!(f.factory.connect_count(), 1);
        assert!(f.manager.release(first));
    }

    #[tokio::test]
    async fn test_worn_out_connection_closed_on_release() {
        let f = fixture(&[8001], PoolConfig::default());
        let m = &f.manager;

        for round in 1..=1000u64 {
            let conn = m.acquire(w(0), None).await.unwrap();
            assert_eq!(conn.usage_count(), round);
            let pooled = m.release(conn);
            assert_eq!(pooled, round < 1000, "round {}", round);
        }
        assert_eq!(f.factory.connect_count(), 1);
        assert_eq!(f.factory.sockets()[0].close_count(), 1);
        assert!(m.is_cold());
    }

    #[tokio::test]
    async fn test_flagged_connection_closed_on_release() {
        let f = fixture(&[8001], PoolConfig::default());
        let conn = f.manager.acquire(w(0), None).await.unwrap();
        conn.flag_close(CloseType::Graceful);

        assert!(!f.manager.release(conn));
        assert_eq!(f.factory.sockets()[0].close_count(), 1);
    }

    #[tokio::test]
    async fn test_tripped_breaker_discards_on_release() {
        let f = fixture(&[8001], PoolConfig::default());
        let conn = f.manager.acquire(w(0), None).await.unwrap();
        conn.backend().stats().record_failure();
        conn.backend().stats().record_failure();

        assert!(!f.manager.release(conn));
        assert_eq!(f.factory.sockets()[0].close_count(), 1);
        assert!(f.manager.is_cold());
    }

    #[tokio::test]
    async fn test_dead_socket_counted_as_already_closed() {
        let f = fixture(&[8001], PoolConfig::default());
        let conn = f.manager.acquire(w(0), None).await.unwrap();
        f.factory.sockets()[0].kill();

        assert!(!f.manager.release(conn));
        assert_eq!(f.manager.metrics().count(PoolEvent::AlreadyClosed), 1);
    }

    #[tokio::test]
    async fn test_release_updates_backend_stats() {
        let f = fixture(&[8001], PoolConfig::default());
        let conn = f.manager.acquire(w(0), None).await.unwrap();
        let backend = Arc::clone(conn.backend());
        assert_eq!(backend.stats().active_requests(), 1);
        assert_eq!(f.manager.inflight_requests_count(), 1);
        assert!(!f.manager.is_cold());

        f.manager.release(conn);
        assert_eq!(backend.stats().active_requests(), 0);
        assert_eq!(f.manager.inflight_requests_count(), 0);
        assert!(backend.stats().response_time() > Duration::ZERO);
        // An idle connection keeps the origin warm.
        assert!(!f.manager.is_cold());
    }

    #[tokio::test]
    async fn test_shutdown_fails_fast_and_flags_in_use() {
        let f = fixture(&[8001], PoolConfig::default());
        let m = &f.manager;
        let idle = m.acquire(w(0), None).await.unwrap();
        let busy = m.acquire(w(0), None).await.unwrap();
        m.release(idle);

        m.shutdown();
        m.shutdown();
        assert!(!m.is_available());
        assert!(matches!(m.acquire(w(0), None).await, Err(PoolError::ShuttingDown)));

        busy.close_requested().await;
        assert!(busy.should_close());
        assert!(!m.release(busy));
        assert!(m.is_cold());
        assert_eq!(f.factory.sockets()[0].close_count(), 1);
        assert_eq!(f.factory.sockets()[1].close_count(), 1);
    }

    #[tokio::test]
    async fn test_remove_by_ref() {
        let f = fixture(&[8001], PoolConfig::default());
        let conn = f.manager.acquire(w(1), None).await.unwrap();
        let r = conn.connection_ref();
        f.manager.release(conn);

        assert!(f.manager.remove(&r));
        assert!(!f.manager.remove(&r));
        assert!(f.manager.is_cold());
    }

    #[tokio::test]
    async fn test_discovery_removal_tears_down_pool() {
        let f = fixture(&[8001, 8002], PoolConfig::default());
        let _watcher = f.manager.watch_server_list().unwrap();

        let a = f.manager.acquire(w(0), None).await.unwrap();
        let b = f.manager.acquire(w(0), None).await.unwrap();
        assert_ne!(a.server(), b.server());
        let removed = b.server();
        f.manager.release(a);
        f.manager.release(b);

        f.balancer.update_servers(&[if removed == addr(8001) { addr(8002) } else { addr(8001) }]);
        for _ in 0..100 {
            if f.manager.pool(removed).is_none() {
                break;
            }
            tokio::task::yield_now().await;
        }

        assert!(f.manager.pool(removed).is_none());
        assert_eq!(f.manager.metrics().count(PoolEvent::Teardown), 1);
        assert_eq!(f.manager.snapshot().servers.len(), 1);
    }

    #[tokio::test]
    async fn test_routing_key_affinity() {
        let f = fixture(&[8001, 8002, 8003], PoolConfig::default());
        let first = f.manager.acquire(w(0), Some("tenant-9")).await.unwrap();
        let server = first.server();
        f.manager.release(first);

        for _ in 0..5 {
            let conn = f.manager.acquire(w(0), Some("tenant-9")).await.unwrap();
            assert_eq!(conn.server(), server);
            f.manager.release(conn);
        }
        assert_eq!(f.factory.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_prewarm_and_snapshot() {
        let f = fixture(&[8001, 8002], PoolConfig::default());
        assert!(f.manager.is_cold());

        assert_eq!(f.manager.prewarm(w(1), 2).await, 4);
        assert!(!f.manager.is_cold());
        assert_eq!(f.factory.workers(), vec![w(1); 4]);

        let snapshot = f.manager.snapshot();
        assert_eq!(snapshot.origin, "api");
        assert_eq!(snapshot.servers.len(), 2);
        assert!(snapshot.servers.iter().all(|s| s.in_pool == 2));
        assert_eq!(snapshot.events["create_success"], 4);
    }

    #[test]
    fn test_config_accessors_follow_reload() {
        let f = fixture(&[8001], PoolConfig::default());
        assert_eq!(f.manager.origin_name(), "api");
        assert_eq!(f.manager.per_server_waterline(), 4);
        assert_eq!(f.manager.connect_timeout(), Duration::from_millis(500));

        f.manager.config().store(PoolConfig {
            per_server_waterline: 16,
            tcp_no_delay: true,
            ..PoolConfig::default()
        });
        assert_eq!(f.manager.per_server_waterline(), 16);
        assert!(f.manager.tcp_no_delay());
        assert!(!f.manager.is_secure());
    }
}
