//! Per-server connection pool.
//!
//! # Responsibilities
//! - Keep one LIFO idle queue per worker for a single backend server
//! - Open new connections through the factory under the per-host ceiling
//! - Bound idle connections per worker (waterline) and by age (idle timeout)
//!
//! # Design Decisions
//! - A connection only ever returns to the queue of the worker that opened
//!   it, so it is never handed to another reactor
//! - Each queue sits behind its own mutex. Only its worker touches it on
//!   the hot path, so the lock is uncontended and never held across await
//! - Reuse never touches the network; only a cache miss connects

use serde::Serialize;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Instant;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;

use crate::close::CloseType;
use crate::config::{LiveConfig, PoolConfig};
use crate::load_balancer::Backend;
use crate::net::{ConnectionFactory, ConnectionId, SocketOptions, WorkerId};
use crate::observability::metrics::{PoolEvent, PoolMetrics};
use crate::pool::error::PoolError;
use crate::pool::record::{ConnectionRef, PoolLedger, PooledConnection};

type IdleQueue<S> = Mutex<VecDeque<PooledConnection<S>>>;

/// Point-in-time view of one server's pool.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ServerPoolStats {
    pub server: SocketAddr,
    pub healthy: bool,
    pub in_use: usize,
    pub in_pool: usize,
    pub in_progress: usize,
    pub open: usize,
    pub idle_per_worker: Vec<usize>,
    pub active_requests: usize,
    pub response_time_ms: f64,
}

/// Reusable connections to one backend server.
pub struct PerServerPool<F: ConnectionFactory> {
    factory: Arc<F>,
    config: LiveConfig<PoolConfig>,
    ledger: Arc<PoolLedger>,
    queues: Box<[IdleQueue<F::Socket>]>,
    torn_down: AtomicBool,
}

impl<F: ConnectionFactory> PerServerPool<F> {
    pub fn new(
        backend: Arc<Backend>,
        factory: Arc<F>,
        config: LiveConfig<PoolConfig>,
        metrics: Arc<PoolMetrics>,
        workers: usize,
    ) -> Arc<Self> {
        let queues = (0..workers.max(1))
            .map(|_| Mutex::new(VecDeque::new()))
            .collect();
        Arc::new(Self {
            factory,
            config,
            ledger: Arc::new(PoolLedger::new(backend, metrics)),
            queues,
            torn_down: AtomicBool::new(false),
        })
    }

    pub fn server(&self) -> SocketAddr {
        self.ledger.server()
    }

    pub fn backend(&self) -> &Arc<Backend> {
        self.ledger.backend()
    }

    pub fn ledger(&self) -> &Arc<PoolLedger> {
        &self.ledger
    }

    pub fn in_use(&self) -> usize {
        self.ledger.in_use()
    }

    pub fn in_pool(&self) -> usize {
        self.ledger.in_pool()
    }

    pub fn in_progress(&self) -> usize {
        self.ledger.in_progress()
    }

    pub fn open_connections(&self) -> usize {
        self.ledger.open_connections()
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::Acquire)
    }

    /// Idle connections parked for `worker`.
    pub fn idle_count(&self, worker: WorkerId) -> usize {
        self.queue(worker).len()
    }

    fn metrics(&self) -> &PoolMetrics {
        self.ledger.metrics()
    }

    fn queue(&self, worker: WorkerId) -> MutexGuard<'_, VecDeque<PooledConnection<F::Socket>>> {
        let slot = &self.queues[worker.index() % self.queues.len()];
        slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Check out a connection for `worker`, reusing an idle one if possible.
    pub async fn acquire(&self, worker: WorkerId) -> Result<PooledConnection<F::Socket>, PoolError> {
        if self.is_torn_down() {
            return Err(PoolError::ShuttingDown);
        }

        if let Some(mut conn) = self.poll_idle(worker) {
            conn.unpark();
            self.metrics().incr(PoolEvent::Reuse);
            self.metrics().incr(PoolEvent::Request);
            tracing::trace!(
                connection_id = %conn.id(),
                server = %self.server(),
                %worker,
                usage = conn.usage_count(),
                "Reusing pooled connection"
            );
            return Ok(conn);
        }

        let mut conn = self.connect(worker).await?;
        conn.begin_use();
        self.metrics().incr(PoolEvent::Request);
        Ok(conn)
    }

    /// Pop the most recently parked live connection, discarding dead ones.
    fn poll_idle(&self, worker: WorkerId) -> Option<PooledConnection<F::Socket>> {
        let now = Instant::now();
        let mut stale = Vec::new();
        let found = {
            let mut queue = self.queue(worker);
            loop {
                match queue.pop_back() {
                    None => break None,
                    Some(conn) if conn.is_socket_open() && !conn.is_idle_expired(now) => {
                        break Some(conn)
                    }
                    Some(conn) => stale.push(conn),
                }
            }
        };

        for conn in stale {
            self.metrics().incr(PoolEvent::StaleFromPool);
            tracing::debug!(
                connection_id = %conn.id(),
                server = %self.server(),
                %worker,
                "Discarding stale pooled connection"
            );
            conn.close();
        }
        found
    }

    /// Open a new connection on `worker` under the per-host ceiling.
    async fn connect(&self, worker: WorkerId) -> Result<PooledConnection<F::Socket>, PoolError> {
        let config = self.config.current();
        let server = self.server();

        let Some(attempt) = self.ledger.try_reserve(config.max_connections_per_host) else {
            self.metrics().incr(PoolEvent::MaxConnsExceeded);
            tracing::debug!(
                %server,
                limit = config.max_connections_per_host,
                "Max connections per host reached"
            );
            return Err(PoolError::MaxConnsPerHostExceeded {
                server,
                limit: config.max_connections_per_host,
            });
        };

        self.metrics().incr(PoolEvent::Create);
        tracing::debug!(%server, %worker, "Opening origin connection");
        let started = Instant::now();
        let options = SocketOptions::from(&*config);

        match self.factory.connect(worker, server, &options).await {
            Ok(socket) => {
                let elapsed = started.elapsed();
                self.metrics().record_connect_latency(elapsed);
                self.metrics().incr(PoolEvent::CreateSuccess);
                self.backend().stats().record_success();
                let conn = attempt.succeed(socket, worker);
                // Torn down while connecting: the holder must not reuse it.
                if self.is_torn_down() {
                    conn.flag_close(CloseType::Graceful);
                }
                tracing::debug!(
                    connection_id = %conn.id(),
                    %server,
                    %worker,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Origin connection established"
                );
                Ok(conn)
            }
            Err(source) => {
                drop(attempt);
                self.metrics().incr(PoolEvent::CreateFail);
                self.backend().stats().record_failure();
                tracing::warn!(%server, %worker, error = %source, "Origin connect failed");
                Err(PoolError::Connect { server, source })
            }
        }
    }

    /// Return a connection to its worker's idle queue.
    ///
    /// Returns false when it was closed instead: the queue was at the
    /// waterline or the pool has been torn down.
    pub fn release(self: &Arc<Self>, mut conn: PooledConnection<F::Socket>) -> bool {
        if self.is_torn_down() {
            conn.close();
            return false;
        }

        let config = self.config.current();
        let worker = conn.worker();
        let idle_timeout = config.idle_timeout();
        let deadline = (!idle_timeout.is_zero()).then(|| Instant::now() + idle_timeout);

        let mut queue = self.queue(worker);
        if queue.len() >= config.per_server_waterline {
            drop(queue);
            self.metrics().incr(PoolEvent::WaterlineClose);
            tracing::debug!(
                connection_id = %conn.id(),
                server = %self.server(),
                %worker,
                waterline = config.per_server_waterline,
                "Idle queue at waterline, closing connection"
            );
            conn.close();
            return false;
        }

        let id = conn.id();
        let generation = conn.usage_count();
        conn.park(deadline);
        if deadline.is_some() {
            if let Some(timer) = self.arm_idle_timer(id, generation, worker, idle_timeout) {
                conn.set_idle_timer(timer);
            }
        }
        queue.push_back(conn);
        true
    }

    /// Evict the connection if it is still idle in the same checkout when
    /// the idle timeout elapses.
    ///
    /// The timer is cancelled when the connection leaves the queue.
    fn arm_idle_timer(
        self: &Arc<Self>,
        id: ConnectionId,
        generation: u64,
        worker: WorkerId,
        idle_timeout: std::time::Duration,
    ) -> Option<AbortHandle> {
        // No reactor to run a timer; acquire still checks the deadline.
        let handle = Handle::try_current().ok()?;
        let pool: Weak<Self> = Arc::downgrade(self);
        let timer = handle.spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let Some(pool) = pool.upgrade() else {
                return;
            };
            let evicted = {
                let mut queue = pool.queue(worker);
                queue
                    .iter()
                    .position(|c| c.id() == id && c.usage_count() == generation)
                    .and_then(|pos| queue.remove(pos))
            };
            if let Some(conn) = evicted {
                pool.metrics().incr(PoolEvent::IdleTimeout);
                tracing::debug!(
                    connection_id = %id,
                    server = %pool.server(),
                    %worker,
                    "Idle timeout, closing pooled connection"
                );
                conn.close();
            }
        });
        Some(timer.abort_handle())
    }

    /// Remove one idle connection and close it. False if it is not pooled.
    pub fn remove(&self, conn: &ConnectionRef) -> bool {
        let removed = {
            let mut queue = self.queue(conn.worker);
            queue
                .iter()
                .position(|c| c.id() == conn.id)
                .and_then(|pos| queue.remove(pos))
        };
        match removed {
            Some(conn) => {
                tracing::debug!(connection_id = %conn.id(), server = %self.server(), "Removed pooled connection");
                conn.close();
                true
            }
            None => false,
        }
    }

    /// Close every idle connection and flag checked-out ones for close.
    ///
    /// Returns (idle closed, in-use flagged).
    pub fn teardown(&self) -> (usize, usize) {
        self.torn_down.store(true, Ordering::Release);

        let mut closed = 0;
        for slot in self.queues.iter() {
            let drained: Vec<_> = {
                let mut queue = slot.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                queue.drain(..).collect()
            };
            for conn in drained {
                conn.close();
                closed += 1;
            }
        }
        let flagged = self.ledger.flag_checked_out(CloseType::Graceful);

        self.metrics().incr(PoolEvent::Teardown);
        tracing::info!(
            server = %self.server(),
            idle_closed = closed,
            in_use_flagged = flagged,
            "Server pool torn down"
        );
        (closed, flagged)
    }

    /// Open up to `count` connections on `worker` and park them.
    ///
    /// Must run on `worker`'s reactor. Returns how many were parked.
    pub async fn prewarm(self: &Arc<Self>, worker: WorkerId, count: usize) -> usize {
        let mut parked = 0;
        for _ in 0..count {
            let mut conn = match self.connect(worker).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(server = %self.server(), %worker, error = %e, "Prewarm stopped");
                    break;
                }
            };
            conn.mark_released();
            if !self.release(conn) {
                break;
            }
            parked += 1;
        }
        parked
    }

    pub fn stats(&self) -> ServerPoolStats {
        let stats = self.backend().stats();
        ServerPoolStats {
            server: self.server(),
            healthy: self.backend().is_healthy(),
            in_use: self.in_use(),
            in_pool: self.in_pool(),
            in_progress: self.in_progress(),
            open: self.open_connections(),
            idle_per_worker: (0..self.queues.len())
                .map(|i| self.idle_count(WorkerId::new(i)))
                .collect(),
            active_requests: stats.active_requests(),
            response_time_ms: stats.response_time().as_secs_f64() * 1000.0,
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for PerServerPool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerServerPool")
            .field("server", &self.server())
            .field("in_use", &self.in_use())
            .field("in_pool", &self.in_pool())
            .field("in_progress", &self.in_progress())
            .field("torn_down", &self.is_torn_down())
            .finish()
    }
}
