//! BreakerRegistry — explicit owner of per-node circuit breakers
//!
//! An ordinary object handed by reference into each runtime rather than a
//! hidden module-level singleton. Breakers are created lazily on first use
//! and live for the process lifetime; state is intentionally not shared
//! across processes.

use std::sync::Arc;

use dashmap::DashMap;

use super::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerStats};

/// Lazily-populated map of node name -> circuit breaker.
pub struct BreakerRegistry {
    default_config: CircuitBreakerConfig,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(default_config: CircuitBreakerConfig) -> Self {
        Self {
            default_config,
            breakers: DashMap::new(),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }

    /// Get the breaker for a node, creating it with the registry default.
    pub fn get(&self, node_name: &str) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(node_name.to_string())
            .or_insert_with(|| {
                Arc::new(CircuitBreaker::new(node_name, self.default_config.clone()))
            })
            .clone()
    }

    /// Register a breaker with a node-specific configuration, replacing any
    /// existing one for that name.
    pub fn register(&self, node_name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let breaker = Arc::new(CircuitBreaker::new(node_name, config));
        self.breakers.insert(node_name.to_string(), breaker.clone());
        breaker
    }

    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    /// Snapshot of every breaker, for health endpoints and diagnostics.
    pub async fn all_stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats = Vec::with_capacity(self.breakers.len());
        for entry in self.breakers.iter() {
            stats.push(entry.value().stats().await);
        }
        stats
    }
}

impl Default for BreakerRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::CircuitState;

    #[tokio::test]
    async fn test_get_creates_lazily_and_reuses() {
        let registry = BreakerRegistry::with_defaults();
        assert!(registry.is_empty());

        let a = registry.get("scorer");
        let b = registry.get("scorer");
        assert_eq!(registry.len(), 1);
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[tokio::test]
    async fn test_register_overrides_config() {
        let registry = BreakerRegistry::with_defaults();
        let breaker = registry.register(
            "flaky",
            CircuitBreakerConfig {
                failure_threshold: 1,
                ..Default::default()
            },
        );

        breaker.record_failure("one strike").await;
        assert_eq!(breaker.state().await, CircuitState::Open);

        // Default-config breakers are unaffected.
        let other = registry.get("steady");
        other.record_failure("one strike").await;
        assert_eq!(other.state().await, CircuitState::Closed);
    }
}
