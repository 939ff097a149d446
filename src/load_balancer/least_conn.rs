//! Least Connections load balancing strategy.

use std::sync::Arc;
use crate::load_balancer::{SelectionStrategy, backend::Backend};

/// Least connections selector.
/// Selects the healthy backend with the fewest active requests.
#[derive(Debug, Default)]
pub struct LeastConnections;

impl LeastConnections {
    pub fn new() -> Self {
        Self
    }
}

impl SelectionStrategy for LeastConnections {
    fn next_server(&self, backends: &[Arc<Backend>]) -> Option<Arc<Backend>> {
        // In case of tie, the first one is selected (stability)
        backends
            .iter()
            .filter(|b| b.is_healthy())
            .min_by_key(|b| b.stats().active_requests())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_least_conn() {
        let lb = LeastConnections::new();
        let b1 = Arc::new(Backend::new("127.0.0.1:8080".parse().unwrap()));
        let b2 = Arc::new(Backend::new("127.0.0.1:8081".parse().unwrap()));

        b1.stats().increment_active_requests();
        let backends = vec![b1.clone(), b2.clone()];

        assert_eq!(lb.next_server(&backends).unwrap().addr, b2.addr);

        b2.stats().increment_active_requests();
        b2.stats().increment_active_requests();

        assert_eq!(lb.next_server(&backends).unwrap().addr, b1.addr);
        assert!(lb.next_server(&[]).is_none());
    }
}
