//! Discovery-fed load balancer.
//!
//! # Responsibilities
//! - Hold the current server list of one origin
//! - Apply the configured selection strategy
//! - Provide routing-key affinity
//! - Announce server list changes to subscribers

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;
use arc_swap::ArcSwap;
use tokio::sync::broadcast;

use crate::config::{CircuitBreakerConfig, LoadBalancing};
use crate::load_balancer::{
    Backend, LeastConnections, LoadBalancer, RoundRobin, SelectionStrategy, ServerListChange,
};

const CHANGE_CHANNEL_CAPACITY: usize = 16;

#[derive(Debug)]
pub struct DiscoveryLoadBalancer {
    origin: String,
    servers: ArcSwap<Vec<Arc<Backend>>>,
    strategy: Box<dyn SelectionStrategy>,
    breaker: ArcSwap<CircuitBreakerConfig>,
    changes: broadcast::Sender<ServerListChange>,
}

impl DiscoveryLoadBalancer {
    pub fn new(
        origin: impl Into<String>,
        servers: &[SocketAddr],
        load_balancing: LoadBalancing,
        breaker: CircuitBreakerConfig,
    ) -> Self {
        let strategy: Box<dyn SelectionStrategy> = match load_balancing {
            LoadBalancing::RoundRobin => Box::new(RoundRobin::new()),
            LoadBalancing::LeastConnections => Box::new(LeastConnections::new()),
        };
        let backends = dedup(servers)
            .into_iter()
            .map(|addr| Arc::new(Backend::with_breaker(addr, &breaker)))
            .collect();
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);

        Self {
            origin: origin.into(),
            servers: ArcSwap::from_pointee(backends),
            strategy,
            breaker: ArcSwap::from_pointee(breaker),
            changes,
        }
    }

    /// Current backends.
    pub fn servers(&self) -> Arc<Vec<Arc<Backend>>> {
        self.servers.load_full()
    }

    /// Replace the server list, keeping existing backends that survive.
    ///
    /// Returns the change that was broadcast (empty when nothing changed).
    pub fn update_servers(&self, addrs: &[SocketAddr]) -> ServerListChange {
        let wanted = dedup(addrs);
        let current = self.servers.load_full();
        let breaker = self.breaker.load();
        let existing: HashMap<SocketAddr, &Arc<Backend>> =
            current.iter().map(|b| (b.addr, b)).collect();

        let mut change = ServerListChange::default();
        let next: Vec<Arc<Backend>> = wanted
            .iter()
            .map(|addr| match existing.get(addr) {
                Some(b) => Arc::clone(b),
                None => {
                    change.added.push(*addr);
                    Arc::new(Backend::with_breaker(*addr, &breaker))
                }
            })
            .collect();
        change.removed = current
            .iter()
            .map(|b| b.addr)
            .filter(|addr| !wanted.contains(addr))
            .collect();

        if change.is_empty() {
            return change;
        }

        self.servers.store(Arc::new(next));
        tracing::info!(
            origin = %self.origin,
            added = ?change.added,
            removed = ?change.removed,
            "Server list changed"
        );
        // No subscribers is fine: nothing to tear down yet.
        let _ = self.changes.send(change.clone());
        change
    }

    /// Apply reloaded breaker settings to current and future backends.
    pub fn set_breaker_config(&self, breaker: CircuitBreakerConfig) {
        for backend in self.servers.load().iter() {
            backend.apply_breaker(&breaker);
        }
        self.breaker.store(Arc::new(breaker));
    }

    fn choose_by_affinity(&self, servers: &[Arc<Backend>], key: &str) -> Option<Arc<Backend>> {
        servers
            .iter()
            .filter(|b| b.is_healthy())
            .max_by_key(|b| affinity_score(key, b.addr))
            .cloned()
    }
}

impl LoadBalancer for DiscoveryLoadBalancer {
    fn choose_server(&self, routing_key: Option<&str>) -> Option<Arc<Backend>> {
        let servers = self.servers.load();
        let chosen = match routing_key {
            Some(key) => self.choose_by_affinity(&servers, key),
            None => self.strategy.next_server(&servers),
        };
        if chosen.is_none() {
            tracing::debug!(origin = %self.origin, servers = servers.len(), "No healthy server available");
        }
        chosen
    }

    fn server_count(&self) -> usize {
        self.servers.load().len()
    }

    fn backends(&self) -> Vec<Arc<Backend>> {
        self.servers.load().iter().cloned().collect()
    }

    fn subscribe(&self) -> broadcast::Receiver<ServerListChange> {
        self.changes.subscribe()
    }
}

/// Rendezvous (highest random weight) score of a server for a key.
fn affinity_score(key: &str, addr: SocketAddr) -> u64 {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    addr.hash(&mut hasher);
    hasher.finish()
}

fn dedup(addrs: &[SocketAddr]) -> Vec<SocketAddr> {
    let mut out = Vec::with_capacity(addrs.len());
    for addr in addrs {
        if !out.contains(addr) {
            out.push(*addr);
        }
    }
    out
}
