//! Hot-reloadable configuration snapshots.
//!
//! Readers call `current()` on every decision and get an immutable
//! snapshot; the reload path swaps in a new one atomically.

use arc_swap::ArcSwap;
use std::sync::Arc;

/// A configuration value that can change at runtime.
#[derive(Debug)]
pub struct LiveConfig<T> {
    inner: Arc<ArcSwap<T>>,
}

impl<T> LiveConfig<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: Arc::new(ArcSwap::from_pointee(value)),
        }
    }

    /// The current snapshot.
    pub fn current(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the snapshot. Readers holding the old one keep it.
    pub fn store(&self, value: T) {
        self.inner.store(Arc::new(value));
    }
}

impl<T> Clone for LiveConfig<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Default> Default for LiveConfig<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;

    #[test]
    fn test_clones_share_updates() {
        let live = LiveConfig::new(PoolConfig::default());
        let reader = live.clone();
        let before = reader.current();

        live.store(PoolConfig {
            per_server_waterline: 9,
            ..PoolConfig::default()
        });

        assert_eq!(before.per_server_waterline, 4);
        assert_eq!(reader.current().per_server_waterline, 9);
    }
}
