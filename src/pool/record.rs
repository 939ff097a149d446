//! Connection record and per-server accounting.
//!
//! # Responsibilities
//! - Own one live origin socket plus its pooling and usage metadata
//! - Keep the server's cross-worker counters consistent on every transition
//! - Close and un-count a connection that is dropped without being released

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::AbortHandle;

use crate::close::{CloseType, ConnectionExpiry, ExpiryReason};
use crate::load_balancer::Backend;
use crate::net::{ConnectionId, OriginSocket, WorkerId};
use crate::observability::metrics::{PoolEvent, PoolMetrics};

pub use crate::close::ConnectionFlags;

/// Whether a connection may be handed a new write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Ready,
    Busy,
}

/// Handle naming a connection without owning it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionRef {
    pub id: ConnectionId,
    pub server: SocketAddr,
    pub worker: WorkerId,
}

/// Shared counters of one server's connections.
///
/// `slots` counts open plus in-progress connections and is the value the
/// per-host ceiling is enforced on.
#[derive(Debug)]
pub struct PoolLedger {
    backend: Arc<Backend>,
    metrics: Arc<PoolMetrics>,
    slots: AtomicUsize,
    in_progress: AtomicUsize,
    in_use: AtomicUsize,
    in_pool: AtomicUsize,
    /// Close flags of every checked-out connection, keyed by id.
    checked_out: DashMap<ConnectionId, Arc<ConnectionFlags>>,
}

impl PoolLedger {
    pub fn new(backend: Arc<Backend>, metrics: Arc<PoolMetrics>) -> Self {
        Self {
            backend,
            metrics,
            slots: AtomicUsize::new(0),
            in_progress: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            in_pool: AtomicUsize::new(0),
            checked_out: DashMap::new(),
        }
    }

    pub fn server(&self) -> SocketAddr {
        self.backend.addr
    }

    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }

    pub fn metrics(&self) -> &Arc<PoolMetrics> {
        &self.metrics
    }

    pub fn in_use(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn in_pool(&self) -> usize {
        self.in_pool.load(Ordering::Acquire)
    }

    pub fn in_progress(&self) -> usize {
        self.in_progress.load(Ordering::Acquire)
    }

    /// Connections that finished connecting and are not closed yet.
    pub fn open_connections(&self) -> usize {
        self.slots
            .load(Ordering::Acquire)
            .saturating_sub(self.in_progress())
    }

    /// Reserve room for one more connection under `limit`.
    ///
    /// The reservation is given back when the returned attempt is dropped
    /// without succeeding, so a cancelled connect never leaks capacity.
    pub fn try_reserve(self: &Arc<Self>, limit: usize) -> Option<ConnectAttempt> {
        let mut prev = self.slots.load(Ordering::Relaxed);
        loop {
            if prev >= limit {
                return None;
            }
            match self.slots.compare_exchange_weak(
                prev,
                prev + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(x) => prev = x,
            }
        }
        self.in_progress.fetch_add(1, Ordering::AcqRel);
        Some(ConnectAttempt {
            ledger: Arc::clone(self),
            armed: true,
        })
    }

    /// Flag every checked-out connection for close. Returns how many.
    pub fn flag_checked_out(&self, close_type: CloseType) -> usize {
        let mut flagged = 0;
        for entry in self.checked_out.iter() {
            entry.value().flag_close(close_type);
            flagged += 1;
        }
        flagged
    }

    fn moved_to_pool(&self, id: ConnectionId) {
        self.checked_out.remove(&id);
        decrement(&self.in_use);
        self.in_pool.fetch_add(1, Ordering::AcqRel);
    }

    fn moved_to_use(&self, id: ConnectionId, flags: &Arc<ConnectionFlags>) {
        self.checked_out.insert(id, Arc::clone(flags));
        decrement(&self.in_pool);
        self.in_use.fetch_add(1, Ordering::AcqRel);
    }

    fn closed(&self, id: ConnectionId, was_pooled: bool) {
        if was_pooled {
            decrement(&self.in_pool);
        } else {
            self.checked_out.remove(&id);
            decrement(&self.in_use);
        }
        decrement(&self.slots);
        self.backend.stats().decrement_open_connections();
        self.metrics.incr(PoolEvent::Close);
    }
}

fn decrement(counter: &AtomicUsize) {
    let _ = counter.fetch_update(Ordering::AcqRel, Ordering::Acquire, |v| v.checked_sub(1));
}

/// A connect in progress, holding one slot under the per-host ceiling.
#[derive(Debug)]
pub struct ConnectAttempt {
    ledger: Arc<PoolLedger>,
    armed: bool,
}

impl ConnectAttempt {
    /// The socket connected: turn the reservation into a checked-out record.
    pub fn succeed<S: OriginSocket>(mut self, socket: S, worker: WorkerId) -> PooledConnection<S> {
        self.armed = false;
        let ledger = Arc::clone(&self.ledger);
        decrement(&ledger.in_progress);
        ledger.in_use.fetch_add(1, Ordering::AcqRel);
        ledger.backend.stats().increment_open_connections();
        PooledConnection::new(socket, worker, ledger)
    }
}

impl Drop for ConnectAttempt {
    fn drop(&mut self) {
        if self.armed {
            decrement(&self.ledger.in_progress);
            decrement(&self.ledger.slots);
        }
    }
}

/// One live origin connection.
///
/// While checked out the caller owns it exclusively; `release` hands it
/// back by value, so a checkout can be released only once.
pub struct PooledConnection<S: OriginSocket> {
    id: ConnectionId,
    worker: WorkerId,
    socket: S,
    created_at: Instant,
    usage_count: u64,
    write_state: WriteState,
    in_pool: bool,
    released: bool,
    closed: bool,
    checked_out_at: Instant,
    idle_deadline: Option<Instant>,
    idle_timer: Option<AbortHandle>,
    flags: Arc<ConnectionFlags>,
    expiry: Option<Arc<ConnectionExpiry>>,
    ledger: Arc<PoolLedger>,
}

impl<S: OriginSocket> PooledConnection<S> {
    fn new(socket: S, worker: WorkerId, ledger: Arc<PoolLedger>) -> Self {
        let id = ConnectionId::next();
        let flags = Arc::new(ConnectionFlags::new());
        ledger.checked_out.insert(id, Arc::clone(&flags));
        let now = Instant::now();
        Self {
            id,
            worker,
            socket,
            created_at: now,
            usage_count: 0,
            write_state: WriteState::Busy,
            in_pool: false,
            released: false,
            closed: false,
            checked_out_at: now,
            idle_deadline: None,
            idle_timer: None,
            flags,
            expiry: None,
            ledger,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The worker whose reactor owns the socket.
    pub fn worker(&self) -> WorkerId {
        self.worker
    }

    pub fn server(&self) -> SocketAddr {
        self.ledger.server()
    }

    pub fn backend(&self) -> &Arc<Backend> {
        self.ledger.backend()
    }

    pub fn connection_ref(&self) -> ConnectionRef {
        ConnectionRef {
            id: self.id,
            server: self.server(),
            worker: self.worker,
        }
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Number of times this connection has been checked out.
    pub fn usage_count(&self) -> u64 {
        self.usage_count
    }

    pub fn write_state(&self) -> WriteState {
        self.write_state
    }

    pub fn is_in_pool(&self) -> bool {
        self.in_pool
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Time since the current checkout began.
    pub fn checked_out_for(&self) -> Duration {
        self.checked_out_at.elapsed()
    }

    pub fn socket(&self) -> &S {
        &self.socket
    }

    pub fn socket_mut(&mut self) -> &mut S {
        &mut self.socket
    }

    pub fn flags(&self) -> &Arc<ConnectionFlags> {
        &self.flags
    }

    pub fn should_close(&self) -> bool {
        self.flags.should_close()
    }

    /// Mark the connection so its release closes it.
    pub fn flag_close(&self, close_type: CloseType) {
        self.flags.flag_close(close_type);
    }

    /// Expiry tracker bound to this connection, if any.
    pub fn expiry(&self) -> Option<&Arc<ConnectionExpiry>> {
        self.expiry.as_ref()
    }

    /// Response headers went out: count the request against the expiry
    /// tracker. Returns the reason the first time the connection expires.
    pub fn on_response_headers_sent(&self) -> Option<ExpiryReason> {
        self.expiry
            .as_ref()
            .and_then(|expiry| expiry.on_response_headers_sent())
    }

    /// Whether this record is accounted in `ledger`.
    pub fn belongs_to(&self, ledger: &Arc<PoolLedger>) -> bool {
        Arc::ptr_eq(&self.ledger, ledger)
    }

    /// Resolves once the connection is flagged for close, e.g. by shutdown.
    pub async fn close_requested(&self) {
        self.flags.close_requested().await;
    }

    pub(crate) fn set_expiry(&mut self, expiry: Arc<ConnectionExpiry>) {
        self.expiry = Some(expiry);
    }

    pub(crate) fn set_idle_timer(&mut self, timer: AbortHandle) {
        self.cancel_idle_timer();
        self.idle_timer = Some(timer);
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    pub(crate) fn begin_use(&mut self) {
        self.usage_count += 1;
        self.write_state = WriteState::Busy;
        self.released = false;
        self.checked_out_at = Instant::now();
    }

    /// Record the release of this checkout. False if already recorded.
    pub(crate) fn mark_released(&mut self) -> bool {
        if self.released {
            return false;
        }
        self.released = true;
        true
    }

    pub(crate) fn park(&mut self, idle_deadline: Option<Instant>) {
        self.write_state = WriteState::Ready;
        self.in_pool = true;
        self.idle_deadline = idle_deadline;
        self.ledger.moved_to_pool(self.id);
    }

    pub(crate) fn unpark(&mut self) {
        self.cancel_idle_timer();
        self.in_pool = false;
        self.idle_deadline = None;
        self.ledger.moved_to_use(self.id, &self.flags);
        self.socket.resume_reads();
        self.begin_use();
    }

    pub(crate) fn is_idle_expired(&self, now: Instant) -> bool {
        self.idle_deadline.is_some_and(|deadline| now >= deadline)
    }

    pub(crate) fn is_socket_open(&self) -> bool {
        !self.closed && self.socket.is_open()
    }

    pub(crate) fn reset_for_reuse(&mut self) {
        self.socket.reset_for_reuse();
    }

    /// Close the socket and drop it from the server's accounting.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.cancel_idle_timer();
        self.socket.close();
        self.ledger.closed(self.id, self.in_pool);
        tracing::trace!(
            connection_id = %self.id,
            server = %self.ledger.server(),
            worker = %self.worker,
            usage = self.usage_count,
            "Origin connection closed"
        );
    }
}

impl<S: OriginSocket> Drop for PooledConnection<S> {
    fn drop(&mut self) {
        if !self.closed && !self.in_pool && !self.released {
            tracing::debug!(
                connection_id = %self.id,
                server = %self.ledger.server(),
                "Checked-out connection dropped without release, closing"
            );
        }
        self.shutdown();
    }
}

impl<S: OriginSocket> std::fmt::Debug for PooledConnection<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("id", &self.id)
            .field("server", &self.ledger.server())
            .field("worker", &self.worker)
            .field("usage_count", &self.usage_count)
            .field("write_state", &self.write_state)
            .field("in_pool", &self.in_pool)
            .field("should_close", &self.should_close())
            .finish()
    }
}
