//! Service Registry (C1, spec.md §4.1): store, index, and look up
//! backend service instances by logical name.
//!
//! Two-level sharded mapping keyed by `hash(name) mod N_shards`, each
//! shard a `DashMap` (teacher's concurrency primitive of choice
//! throughout `fechatter_server`). Readers take an `ArcSwap` snapshot of
//! the instance list (copy-on-write pointer swap); writers rebuild the
//! slice, matching spec.md §4.1's design note.

use arc_swap::ArcSwap;
use bridge_core::model::{Health, ServiceDescriptor, ServiceInstance};
use bridge_core::BridgeError;
use dashmap::DashMap;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Runtime stats the Load Balancer and Breaker read; owned by the
/// registry, updated by the Prober and the Invoker after each call
/// (spec.md §3 ServiceInstance: "rtt_ewma, inflight, err_rate_ewma").
#[derive(Debug)]
pub struct InstanceRuntime {
    health: AtomicU8,
    /// EWMA RTT in microseconds, stored as bits of an f64 for atomicity.
    rtt_ewma_bits: AtomicU64,
    inflight: AtomicI64,
    /// EWMA error rate in [0,1], stored as bits of an f64.
    err_rate_ewma_bits: AtomicU64,
    /// Consecutive probe failures; drives both the Healthy->Degraded->
    /// Unhealthy staging and the Prober's backoff skip count.
    fail_streak: AtomicU32,
}

fn health_to_u8(h: Health) -> u8 {
    match h {
        Health::Unknown => 0,
        Health::Healthy => 1,
        Health::Degraded => 2,
        Health::Unhealthy => 3,
    }
}

fn u8_to_health(v: u8) -> Health {
    match v {
        1 => Health::Healthy,
        2 => Health::Degraded,
        3 => Health::Unhealthy,
        _ => Health::Unknown,
    }
}

impl Default for InstanceRuntime {
    fn default() -> Self {
        Self {
            health: AtomicU8::new(health_to_u8(Health::Unknown)),
            rtt_ewma_bits: AtomicU64::new(0f64.to_bits()),
            inflight: AtomicI64::new(0),
            err_rate_ewma_bits: AtomicU64::new(0f64.to_bits()),
            fail_streak: AtomicU32::new(0),
        }
    }
}

impl InstanceRuntime {
    pub fn health(&self) -> Health {
        u8_to_health(self.health.load(Ordering::Relaxed))
    }

    pub fn set_health(&self, health: Health) {
        self.health.store(health_to_u8(health), Ordering::Relaxed);
    }

    pub fn rtt_ewma(&self) -> f64 {
        f64::from_bits(self.rtt_ewma_bits.load(Ordering::Relaxed))
    }

    pub fn err_rate_ewma(&self) -> f64 {
        f64::from_bits(self.err_rate_ewma_bits.load(Ordering::Relaxed))
    }

    pub fn inflight(&self) -> i64 {
        self.inflight.load(Ordering::Relaxed)
    }

    pub fn inc_inflight(&self) {
        self.inflight.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_inflight(&self) {
        self.inflight.fetch_sub(1, Ordering::Relaxed);
    }

    /// EWMA update with smoothing constant alpha (spec.md §4.3 "The
    /// smoothing constant α = 0.3"; reused here for RTT/err-rate too,
    /// since the spec gives one alpha for the whole runtime-stats family).
    pub fn observe(&self, rtt_micros: f64, failed: bool, alpha: f64) {
        let prev_rtt = self.rtt_ewma();
        let next_rtt = if prev_rtt == 0.0 {
            rtt_micros
        } else {
            alpha * rtt_micros + (1.0 - alpha) * prev_rtt
        };
        self.rtt_ewma_bits
            .store(next_rtt.to_bits(), Ordering::Relaxed);

        let prev_err = self.err_rate_ewma();
        let sample = if failed { 1.0 } else { 0.0 };
        let next_err = alpha * sample + (1.0 - alpha) * prev_err;
        self.err_rate_ewma_bits
            .store(next_err.to_bits(), Ordering::Relaxed);
    }

    pub fn fail_streak(&self) -> u32 {
        self.fail_streak.load(Ordering::Relaxed)
    }

    /// Apply one probe outcome: success clears the streak and marks
    /// Healthy; failure increments the streak, staging Healthy ->
    /// Degraded -> Unhealthy rather than flapping straight to Unhealthy
    /// on a single missed probe.
    pub fn record_probe(&self, success: bool) {
        if success {
            self.fail_streak.store(0, Ordering::Relaxed);
            self.set_health(Health::Healthy);
        } else {
            let streak = self.fail_streak.fetch_add(1, Ordering::Relaxed) + 1;
            let next = if streak >= 2 {
                Health::Unhealthy
            } else {
                Health::Degraded
            };
            self.set_health(next);
        }
    }
}

/// An instance's identity plus its live stats, shared between the
/// Registry, LB, Breaker, and Pool.
#[derive(Debug)]
pub struct InstanceEntry {
    pub instance: ServiceInstance,
    pub runtime: InstanceRuntime,
}

struct ServiceEntry {
    descriptor: ServiceDescriptor,
    instances: ArcSwap<Vec<Arc<InstanceEntry>>>,
    /// Set when a soft-deregister grace period is in progress
    /// (spec.md §4.1: "new dispatches fail fast but in-flight calls
    /// complete").
    tombstoned_at: Option<Instant>,
}

/// A point-in-time view of a service returned by `lookup`.
pub struct ServiceSnapshot {
    pub descriptor: ServiceDescriptor,
    pub instances: Arc<Vec<Arc<InstanceEntry>>>,
}

impl ServiceSnapshot {
    /// Instances eligible for LB selection (spec.md §4.4: Healthy or
    /// Degraded).
    pub fn eligible(&self) -> Vec<Arc<InstanceEntry>> {
        self.instances
            .iter()
            .filter(|i| matches!(i.runtime.health(), Health::Healthy | Health::Degraded))
            .cloned()
            .collect()
    }
}

fn shard_index(name: &str, shard_count: usize) -> usize {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    name.hash(&mut hasher);
    (hasher.finish() as usize) % shard_count.max(1)
}

/// Exposed so the Prober can partition service names across its
/// per-shard tasks using the same hash the Registry itself uses.
pub fn shard_index_for(name: &str, shard_count: usize) -> usize {
    shard_index(name, shard_count)
}

/// The Service Registry (spec.md §4.1). `N_shards` defaults to 32.
pub struct Registry {
    shards: Vec<DashMap<String, Arc<ServiceEntry>>>,
    shard_count: usize,
    service_grace: Duration,
}

impl Registry {
    pub fn new(shard_count: usize, service_grace: Duration) -> Self {
        let shards = (0..shard_count.max(1)).map(|_| DashMap::new()).collect();
        Self {
            shards,
            shard_count: shard_count.max(1),
            service_grace,
        }
    }

    fn shard(&self, name: &str) -> &DashMap<String, Arc<ServiceEntry>> {
        &self.shards[shard_index(name, self.shard_count)]
    }

    /// Register a new service. Fails with `Conflict` if the name exists
    /// and `replace` is false (spec.md §4.1).
    pub fn register(
        &self,
        descriptor: ServiceDescriptor,
        instances: Vec<ServiceInstance>,
        replace: bool,
    ) -> Result<(), BridgeError> {
        let shard = self.shard(&descriptor.name);
        if !replace {
            if let Some(existing) = shard.get(&descriptor.name) {
                if existing.tombstoned_at.is_none() {
                    return Err(BridgeError::Conflict(format!(
                        "service '{}' already registered",
                        descriptor.name
                    )));
                }
            }
        }
        let entries: Vec<Arc<InstanceEntry>> = instances
            .into_iter()
            .map(|instance| {
                Arc::new(InstanceEntry {
                    instance,
                    runtime: InstanceRuntime::default(),
                })
            })
            .collect();
        let entry = Arc::new(ServiceEntry {
            descriptor,
            instances: ArcSwap::from_pointee(entries),
            tombstoned_at: None,
        });
        shard.insert(entry.descriptor.name.clone(), entry);
        Ok(())
    }

    /// Soft-deregister: mark tombstoned, remove for real after the
    /// grace period so in-flight dispatches bound to this descriptor can
    /// finish (spec.md §4.1).
    pub fn deregister(&self, name: &str) -> Result<(), BridgeError> {
        let shard = self.shard(name);
        let Some(mut entry_ref) = shard.get_mut(name) else {
            return Err(BridgeError::NotFound(format!("service '{name}' not found")));
        };
        let entry = entry_ref.value_mut();
        let tombstoned = Arc::new(ServiceEntry {
            descriptor: entry.descriptor.clone(),
            instances: ArcSwap::new(entry.instances.load_full()),
            tombstoned_at: Some(Instant::now()),
        });
        *entry = tombstoned;
        Ok(())
    }

    /// Physically remove tombstoned entries whose grace period elapsed.
    /// Intended to be called periodically by a background sweeper.
    pub fn sweep_tombstones(&self) {
        for shard in &self.shards {
            shard.retain(|_, entry| match entry.tombstoned_at {
                Some(at) => at.elapsed() < self.service_grace,
                None => true,
            });
        }
    }

    pub fn add_instance(&self, name: &str, instance: ServiceInstance) -> Result<(), BridgeError> {
        let shard = self.shard(name);
        let entry = shard
            .get(name)
            .ok_or_else(|| BridgeError::NotFound(format!("service '{name}' not found")))?;
        let mut list = (*entry.instances.load_full()).clone();
        if list.iter().any(|i| i.instance.endpoint == instance.endpoint) {
            return Err(BridgeError::Conflict(format!(
                "endpoint '{}' already registered under '{name}'",
                instance.endpoint
            )));
        }
        list.push(Arc::new(InstanceEntry {
            instance,
            runtime: InstanceRuntime::default(),
        }));
        entry.instances.store(Arc::new(list));
        Ok(())
    }

    pub fn remove_instance(&self, name: &str, instance_id: &str) -> Result<(), BridgeError> {
        let shard = self.shard(name);
        let entry = shard
            .get(name)
            .ok_or_else(|| BridgeError::NotFound(format!("service '{name}' not found")))?;
        let list = entry.instances.load_full();
        let filtered: Vec<_> = list
            .iter()
            .filter(|i| i.instance.instance_id != instance_id)
            .cloned()
            .collect();
        if filtered.len() == list.len() {
            return Err(BridgeError::NotFound(format!(
                "instance '{instance_id}' not found under '{name}'"
            )));
        }
        entry.instances.store(Arc::new(filtered));
        Ok(())
    }

    /// Look up a service by name. Returns `NotFound` for tombstoned or
    /// absent services (spec.md §4.1: "new dispatches fail fast").
    pub fn lookup(&self, name: &str) -> Result<ServiceSnapshot, BridgeError> {
        let shard = self.shard(name);
        let entry = shard
            .get(name)
            .ok_or_else(|| BridgeError::NotFound(format!("service '{name}' not found")))?;
        if entry.tombstoned_at.is_some() {
            return Err(BridgeError::NotFound(format!(
                "service '{name}' is being deregistered"
            )));
        }
        Ok(ServiceSnapshot {
            descriptor: entry.descriptor.clone(),
            instances: entry.instances.load_full(),
        })
    }

    pub fn list_names(&self) -> Vec<String> {
        self.shards
            .iter()
            .flat_map(|s| s.iter().map(|e| e.key().clone()).collect::<Vec<_>>())
            .collect()
    }

    /// `{total, healthy, unhealthy}` rollup for the `/health` endpoint
    /// (spec.md §6).
    pub fn health_rollup(&self) -> (usize, usize, usize) {
        let mut total = 0;
        let mut healthy = 0;
        let mut unhealthy = 0;
        for shard in &self.shards {
            for entry in shard.iter() {
                for inst in entry.instances.load().iter() {
                    total += 1;
                    match inst.runtime.health() {
                        Health::Healthy | Health::Degraded => healthy += 1,
                        Health::Unhealthy => unhealthy += 1,
                        Health::Unknown => {}
                    }
                }
            }
        }
        (total, healthy, unhealthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_core::model::CallKind;

    fn descriptor(name: &str) -> ServiceDescriptor {
        ServiceDescriptor {
            name: name.to_string(),
            version: "1.0.0".to_string(),
            methods: vec![],
        }
    }

    fn instance(id: &str, endpoint: &str) -> ServiceInstance {
        ServiceInstance {
            instance_id: id.to_string(),
            endpoint: endpoint.to_string(),
            weight: 1.0,
            tls_config: None,
        }
    }

    #[test]
    fn register_then_lookup_round_trips() {
        let registry = Registry::new(4, Duration::from_millis(100));
        registry
            .register(descriptor("echo"), vec![instance("a", "127.0.0.1:1")], false)
            .unwrap();
        let snap = registry.lookup("echo").unwrap();
        assert_eq!(snap.descriptor.name, "echo");
        assert_eq!(snap.instances.len(), 1);
    }

    #[test]
    fn register_conflict_without_replace() {
        let registry = Registry::new(4, Duration::from_millis(100));
        registry.register(descriptor("echo"), vec![], false).unwrap();
        let err = registry.register(descriptor("echo"), vec![], false).unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
    }

    #[test]
    fn replace_allowed_when_opted_in() {
        let registry = Registry::new(4, Duration::from_millis(100));
        registry.register(descriptor("echo"), vec![], false).unwrap();
        registry.register(descriptor("echo"), vec![], true).unwrap();
    }

    #[test]
    fn deregister_then_lookup_fails_fast() {
        let registry = Registry::new(4, Duration::from_secs(5));
        registry.register(descriptor("echo"), vec![], false).unwrap();
        registry.deregister("echo").unwrap();
        assert!(matches!(
            registry.lookup("echo"),
            Err(BridgeError::NotFound(_))
        ));
    }

    #[test]
    fn sweep_removes_expired_tombstones_only() {
        let registry = Registry::new(4, Duration::from_millis(1));
        registry.register(descriptor("echo"), vec![], false).unwrap();
        registry.deregister("echo").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        registry.sweep_tombstones();
        assert!(registry.list_names().is_empty());
    }

    #[test]
    fn add_and_remove_instance() {
        let registry = Registry::new(4, Duration::from_millis(100));
        registry.register(descriptor("echo"), vec![], false).unwrap();
        registry
            .add_instance("echo", instance("a", "127.0.0.1:1"))
            .unwrap();
        assert_eq!(registry.lookup("echo").unwrap().instances.len(), 1);
        registry.remove_instance("echo", "a").unwrap();
        assert_eq!(registry.lookup("echo").unwrap().instances.len(), 0);
    }

    #[test]
    fn duplicate_endpoint_rejected() {
        let registry = Registry::new(4, Duration::from_millis(100));
        registry.register(descriptor("echo"), vec![], false).unwrap();
        registry
            .add_instance("echo", instance("a", "127.0.0.1:1"))
            .unwrap();
        let err = registry
            .add_instance("echo", instance("b", "127.0.0.1:1"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::Conflict(_)));
    }

    #[test]
    fn health_rollup_counts_by_bucket() {
        let registry = Registry::new(4, Duration::from_millis(100));
        registry
            .register(
                descriptor("echo"),
                vec![instance("a", "127.0.0.1:1"), instance("b", "127.0.0.1:2")],
                false,
            )
            .unwrap();
        let snap = registry.lookup("echo").unwrap();
        snap.instances[0].runtime.set_health(Health::Healthy);
        snap.instances[1].runtime.set_health(Health::Unhealthy);
        let (total, healthy, unhealthy) = registry.health_rollup();
        assert_eq!((total, healthy, unhealthy), (2, 1, 1));
    }

    #[allow(dead_code)]
    fn _uses_call_kind(_: CallKind) {}
}
