//! Shutdown coordination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;

use crate::net::ConnectionFactory;
use crate::pool::OriginRegistry;

/// How often draining checks for connections still checked out.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
    triggered: AtomicBool,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self {
            tx,
            triggered: AtomicBool::new(false),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Trigger the shutdown signal. Returns false if it was already triggered.
    pub fn trigger(&self) -> bool {
        if self.triggered.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.tx.send(());
        true
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered.load(Ordering::Acquire)
    }

    /// Resolves once shutdown has been triggered.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_triggered() {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Get the number of active subscribers (tasks still running).
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

/// Shut every origin down and wait for checked-out connections to come back.
///
/// Returns true if all were released before `timeout`.
pub async fn drain_origins<F: ConnectionFactory>(
    registry: &OriginRegistry<F>,
    timeout: Duration,
) -> bool {
    registry.shutdown_all();

    let drained = tokio::time::timeout(timeout, async {
        while registry.inflight_requests_count() > 0 {
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    })
    .await
    .is_ok();

    if drained {
        tracing::info!("All origin connections released");
    } else {
        tracing::warn!(
            remaining = registry.inflight_requests_count(),
            timeout_secs = timeout.as_secs(),
            "Drain deadline passed with connections still in use"
        );
    }
    drained
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{OriginConfig, ProxyConfig};
    use crate::net::WorkerId;
    use crate::pool::test_support::MockFactory;
    use std::sync::Arc;

    fn registry() -> OriginRegistry<MockFactory> {
        let config = ProxyConfig {
            origins: vec![OriginConfig {
                name: "api".into(),
                servers: vec!["127.0.0.1:9100".into()],
                load_balancing: Default::default(),
                pool: Default::default(),
            }],
            ..ProxyConfig::default()
        };
        OriginRegistry::new(&config, Arc::new(MockFactory::new()), 1)
    }

    #[tokio::test]
    async fn test_trigger_once_and_wait() {
        let shutdown = Arc::new(Shutdown::new());
        let waiter = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { shutdown.wait().await })
        };
        tokio::task::yield_now().await;

        assert!(shutdown.trigger());
        assert!(!shutdown.trigger());
        waiter.await.unwrap();
        shutdown.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_waits_for_release() {
        let registry = Arc::new(registry());
        let api = registry.get("api").unwrap();
        let conn = api.acquire(WorkerId::new(0), None).await.unwrap();

        let holder = tokio::spawn(async move {
            conn.close_requested().await;
            tokio::time::sleep(Duration::from_millis(200)).await;
            api.release(conn);
        });

        assert!(drain_origins(&registry, Duration::from_secs(5)).await);
        holder.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_times_out() {
        let registry = registry();
        let api = registry.get("api").unwrap();
        let _held = api.acquire(WorkerId::new(0), None).await.unwrap();

        assert!(!drain_origins(&registry, Duration::from_secs(1)).await);
    }
}
