//! Health Prober (C2, spec.md §4.2): one task per registry shard,
//! ticking on an interval, issuing a probe call through the same
//! gRPC path real traffic takes. Mirrors `fechatter_gateway::health`
//! driving checks through the same `UpstreamManager` the proxy uses,
//! rather than a separate bespoke health-check client.

use crate::registry::Registry;
use async_trait::async_trait;
use bridge_core::model::ServiceInstance;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// Issues the actual probe call. Implemented by whatever crate owns the
/// gRPC client engine (the Invoker); the registry only needs the
/// success/failure outcome.
#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn check(&self, instance: &ServiceInstance) -> bool;
}

/// Drives periodic health checks for every instance in the registry.
pub struct HealthProber {
    registry: Arc<Registry>,
    checker: Arc<dyn HealthCheck>,
    interval: Duration,
    /// Instances with a long failure streak get probed less often, up
    /// to this many ticks between probes, instead of hammering a
    /// clearly-dead backend at the same cadence as healthy ones.
    max_backoff_ticks: u32,
}

impl HealthProber {
    pub fn new(
        registry: Arc<Registry>,
        checker: Arc<dyn HealthCheck>,
        interval: Duration,
        backoff_cap: Duration,
    ) -> Self {
        let max_backoff_ticks = (backoff_cap.as_millis() / interval.as_millis().max(1))
            .max(1) as u32;
        Self {
            registry,
            checker,
            interval,
            max_backoff_ticks,
        }
    }

    /// Spawn one task per shard (`shard_count` callers must match the
    /// registry's own shard count; each task owns a disjoint slice of
    /// services so probes never contend with each other).
    pub fn spawn(self: Arc<Self>, shard_count: usize) -> Vec<JoinHandle<()>> {
        (0..shard_count)
            .map(|shard_idx| {
                let prober = self.clone();
                tokio::spawn(async move { prober.run_shard(shard_idx, shard_count).await })
            })
            .collect()
    }

    async fn run_shard(&self, shard_idx: usize, shard_count: usize) {
        let mut ticker = tokio::time::interval(self.interval);
        let mut tick_count: u64 = 0;
        loop {
            ticker.tick().await;
            tick_count += 1;
            for name in self.registry.list_names() {
                if crate::registry::shard_index_for(&name, shard_count) != shard_idx {
                    continue;
                }
                let Ok(snapshot) = self.registry.lookup(&name) else {
                    continue;
                };
                for entry in snapshot.instances.iter() {
                    let streak = entry.runtime.fail_streak().min(self.max_backoff_ticks);
                    if streak > 0 && !tick_count.is_multiple_of(streak as u64 + 1) {
                        continue;
                    }
                    let ok = self.checker.check(&entry.instance).await;
                    entry.runtime.record_probe(ok);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::Registry;
    use bridge_core::model::{Health, ServiceDescriptor};
    use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
    use std::time::Duration;

    struct AlwaysFails;

    #[async_trait]
    impl HealthCheck for AlwaysFails {
        async fn check(&self, _instance: &ServiceInstance) -> bool {
            false
        }
    }

    struct FlipFlop(Arc<AtomicBool>);

    #[async_trait]
    impl HealthCheck for FlipFlop {
        async fn check(&self, _instance: &ServiceInstance) -> bool {
            self.0.load(AtomicOrdering::Relaxed)
        }
    }

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            methods: vec![],
        }
    }

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            instance_id: id.to_string(),
            endpoint: "127.0.0.1:1".to_string(),
            weight: 1.0,
            tls_config: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_failures_stage_down_to_unhealthy() {
        let registry = Arc::new(Registry::new(2, Duration::from_secs(60)));
        registry
            .register(descriptor("echo"), vec![instance("a")], false)
            .unwrap();
        let prober = Arc::new(HealthProber::new(
            registry.clone(),
            Arc::new(AlwaysFails),
            Duration::from_millis(10),
            Duration::from_millis(100),
        ));
        let handles = prober.clone().spawn(2);
        for _ in 0..5 {
            tokio::time::advance(Duration::from_millis(10)).await;
            tokio::task::yield_now().await;
        }
        let snap = registry.lookup("echo").unwrap();
        assert_eq!(snap.instances[0].runtime.health(), Health::Unhealthy);
        for h in handles {
            h.abort();
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_recovers_to_healthy() {
        let registry = Arc::new(Registry::new(1, Duration::from_secs(60)));
        registry
            .register(descriptor("echo"), vec![instance("a")], false)
            .unwrap();
        let flag = Arc::new(AtomicBool::new(true));
        let prober = Arc::new(HealthProber::new(
            registry.clone(),
            Arc::new(FlipFlop(flag)),
            Duration::from_millis(10),
            Duration::from_millis(100),
        ));
        let handles = prober.clone().spawn(1);
        tokio::time::advance(Duration::from_millis(10)).await;
        tokio::task::yield_now().await;
        let snap = registry.lookup("echo").unwrap();
        assert_eq!(snap.instances[0].runtime.health(), Health::Healthy);
        for h in handles {
            h.abort();
        }
    }
}
