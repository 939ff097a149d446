//! Registry of per-origin pool managers.
//!
//! # Responsibilities
//! - Build one load balancer and pool manager per configured origin
//! - Apply config reloads: swap pool snapshots, push server lists into
//!   load balancers, add and retire origins
//! - Hold the process-wide close, expiry and brownout state

use dashmap::DashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::close::{Brownout, ClosePolicy};
use crate::config::{
    CircuitBreakerConfig, CloseConfig, ExpiryConfig, LiveConfig, LoadBalancing, OriginConfig,
    PoolConfig, ProxyConfig,
};
use crate::load_balancer::DiscoveryLoadBalancer;
use crate::net::{ConnectionFactory, TcpConnector, WorkerGroup};
use crate::pool::manager::{ConnectionPoolManager, OriginSnapshot};

struct OriginEntry<F: ConnectionFactory> {
    manager: Arc<ConnectionPoolManager<F>>,
    balancer: Arc<DiscoveryLoadBalancer>,
    config: LiveConfig<PoolConfig>,
    load_balancing: LoadBalancing,
    watcher: Option<JoinHandle<()>>,
}

impl<F: ConnectionFactory> OriginEntry<F> {
    fn retire(self) {
        self.manager.shutdown();
        if let Some(watcher) = self.watcher {
            watcher.abort();
        }
    }
}

/// Every origin's pools, keyed by origin name.
pub struct OriginRegistry<F: ConnectionFactory = TcpConnector> {
    factory: Arc<F>,
    workers: usize,
    origins: DashMap<String, OriginEntry<F>>,
    policy: ClosePolicy,
    breaker: LiveConfig<CircuitBreakerConfig>,
    started_at: Instant,
}

impl<F: ConnectionFactory> OriginRegistry<F> {
    /// Build managers for every origin in `config`.
    ///
    /// Server-list watchers are started when called inside a runtime.
    pub fn new(config: &ProxyConfig, factory: Arc<F>, workers: usize) -> Self {
        let registry = Self {
            factory,
            workers: workers.max(1),
            origins: DashMap::new(),
            policy: ClosePolicy::new(config.close.clone(), config.expiry.clone()),
            breaker: LiveConfig::new(config.circuit_breaker.clone()),
            started_at: Instant::now(),
        };
        for origin in &config.origins {
            registry.add_origin(origin);
        }
        tracing::info!(
            origins = registry.origins.len(),
            workers = registry.workers,
            "Origin registry ready"
        );
        registry
    }

    fn add_origin(&self, origin: &OriginConfig) {
        let servers = parse_servers(&origin.name, &origin.servers);
        let balancer = Arc::new(DiscoveryLoadBalancer::new(
            origin.name.clone(),
            &servers,
            origin.load_balancing,
            (*self.breaker.current()).clone(),
        ));
        let config = LiveConfig::new(origin.pool.clone());
        let manager = ConnectionPoolManager::with_policy(
            origin.name.clone(),
            balancer.clone(),
            Arc::clone(&self.factory),
            config.clone(),
            self.policy.clone(),
            self.workers,
        );
        let watcher = manager.watch_server_list();

        tracing::info!(origin = %origin.name, servers = servers.len(), "Origin added");
        let entry = OriginEntry {
            manager,
            balancer,
            config,
            load_balancing: origin.load_balancing,
            watcher,
        };
        if let Some(old) = self.origins.insert(origin.name.clone(), entry) {
            old.retire();
        }
    }

    pub fn get(&self, origin: &str) -> Option<Arc<ConnectionPoolManager<F>>> {
        self.origins.get(origin).map(|e| Arc::clone(&e.manager))
    }

    pub fn balancer(&self, origin: &str) -> Option<Arc<DiscoveryLoadBalancer>> {
        self.origins.get(origin).map(|e| Arc::clone(&e.balancer))
    }

    /// Origin names, sorted.
    pub fn origin_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.origins.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn managers(&self) -> Vec<Arc<ConnectionPoolManager<F>>> {
        self.origin_names()
            .iter()
            .filter_map(|name| self.get(name))
            .collect()
    }

    pub fn close_config(&self) -> &LiveConfig<CloseConfig> {
        &self.policy.close
    }

    pub fn expiry_config(&self) -> &LiveConfig<ExpiryConfig> {
        &self.policy.expiry
    }

    pub fn brownout(&self) -> &Brownout {
        &self.policy.brownout
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    /// Apply a validated configuration to the running pools.
    pub fn apply_reload(&self, config: &ProxyConfig) {
        self.policy.close.store(config.close.clone());
        self.policy.expiry.store(config.expiry.clone());
        self.breaker.store(config.circuit_breaker.clone());

        for origin in &config.origins {
            let updated = match self.origins.get(&origin.name) {
                Some(entry) if entry.load_balancing == origin.load_balancing => {
                    entry.config.store(origin.pool.clone());
                    let servers = parse_servers(&origin.name, &origin.servers);
                    entry.balancer.set_breaker_config(config.circuit_breaker.clone());
                    entry.balancer.update_servers(&servers);
                    true
                }
                _ => false,
            };
            if !updated {
                // New origin, or its strategy changed: rebuild it.
                self.add_origin(origin);
            }
        }

        let retired: Vec<String> = self
            .origin_names()
            .into_iter()
            .filter(|name| config.origin(name).is_none())
            .collect();
        for name in retired {
            if let Some((_, entry)) = self.origins.remove(&name) {
                tracing::info!(origin = %name, "Origin removed from configuration");
                entry.retire();
            }
        }

        tracing::info!(origins = self.origins.len(), "Configuration applied");
    }

    /// Fill every worker's idle queues up to each origin's prewarm count.
    pub fn prewarm(&self, workers: &WorkerGroup) -> Vec<JoinHandle<usize>> {
        let mut tasks = Vec::new();
        for manager in self.managers() {
            let per_server = manager.config().current().prewarm_per_worker;
            if per_server == 0 {
                continue;
            }
            for worker in workers.ids() {
                let manager = Arc::clone(&manager);
                let task = workers.spawn_on(worker, async move {
                    manager.prewarm(worker, per_server).await
                });
                tasks.extend(task);
            }
        }
        tasks
    }

    pub fn snapshots(&self) -> Vec<OriginSnapshot> {
        self.managers().iter().map(|m| m.snapshot()).collect()
    }

    pub fn publish_gauges(&self) {
        for manager in self.managers() {
            manager.publish_gauges();
        }
    }

    pub fn inflight_requests_count(&self) -> usize {
        self.managers()
            .iter()
            .map(|m| m.inflight_requests_count())
            .sum()
    }

    /// Shut down every origin's pools.
    pub fn shutdown_all(&self) {
        for manager in self.managers() {
            manager.shutdown();
        }
    }
}

impl<F: ConnectionFactory> std::fmt::Debug for OriginRegistry<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginRegistry")
            .field("origins", &self.origin_names())
            .field("workers", &self.workers)
            .finish()
    }
}

fn parse_servers(origin: &str, servers: &[String]) -> Vec<SocketAddr> {
    servers
        .iter()
        .filter_map(|s| match s.parse() {
            Ok(addr) => Some(addr),
            Err(_) => {
                tracing::warn!(origin, server = %s, "Ignoring invalid server address");
                None
            }
        })
        .collect()
}
