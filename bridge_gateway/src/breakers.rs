//! Per-instance Circuit Breaker set (C3, spec.md §4.3), keyed by
//! `instance_id`. `bridge_resilience::Breaker` is a standalone per-
//! instance state machine; this is the map the Orchestrator looks
//! breakers up in, sharded via `dashmap::DashMap` like the Registry
//! and the Pool.

use bridge_resilience::{Breaker, BreakerConfig};
use dashmap::DashMap;
use std::sync::Arc;

pub struct BreakerSet {
    breakers: DashMap<String, Arc<Breaker>>,
    config: BreakerConfig,
}

impl BreakerSet {
    pub fn new(config: BreakerConfig) -> Self {
        Self { breakers: DashMap::new(), config }
    }

    pub fn get(&self, instance_id: &str) -> Arc<Breaker> {
        self.breakers
            .entry(instance_id.to_string())
            .or_insert_with(|| Arc::new(Breaker::new(self.config)))
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_instance_id_returns_same_breaker() {
        let set = BreakerSet::new(BreakerConfig::default());
        let a = set.get("inst-1");
        let b = set.get("inst-1");
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn different_instance_ids_get_independent_breakers() {
        let set = BreakerSet::new(BreakerConfig::default());
        let a = set.get("inst-1");
        let b = set.get("inst-2");
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
