//! Shared state injected into every request handler — constructed once
//! at startup (spec.md §9: "construct explicitly at startup, inject
//! into the Orchestrator" rather than reach for global singletons).

use crate::admission::{AdmissionControl, RateLimitConfig};
use crate::breakers::BreakerSet;
use crate::cache::ResponseCache;
use bridge_core::config::LbPolicy;
use bridge_core::telemetry::TelemetrySink;
use bridge_core::BridgeConfig;
use bridge_pool::{ChannelPool, ChannelPoolConfig, Invoker};
use bridge_registry::Registry;
use bridge_resilience::{BreakerConfig, ConsistentHashRing, LoadBalancer, WeightedP2c};
use std::sync::Arc;
use std::time::Duration;

#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<BridgeConfig>,
    pub registry: Arc<Registry>,
    pub pool: Arc<ChannelPool>,
    pub invoker: Arc<Invoker>,
    pub lb: Arc<dyn LoadBalancer>,
    pub breakers: Arc<BreakerSet>,
    pub cache: Arc<ResponseCache>,
    pub admission: Arc<AdmissionControl>,
    pub telemetry: TelemetrySink,
}

impl GatewayState {
    pub fn new(config: BridgeConfig) -> (Self, tokio::sync::mpsc::Receiver<bridge_core::telemetry::ObservationEvent>) {
        let registry = Arc::new(Registry::new(
            config.registry_shards,
            Duration::from_millis(config.service_grace_ms),
        ));

        let pool = Arc::new(ChannelPool::new(ChannelPoolConfig {
            min_channels: config.pool_channels_per_instance,
            max_channels: config.pool_channel_max,
            max_concurrent_streams: config.pool_max_concurrent_streams as u32,
            idle_timeout: Duration::from_millis(config.pool_idle_timeout_ms),
            drain_timeout: Duration::from_millis(config.pool_drain_timeout_ms),
            keepalive_interval: Duration::from_millis(config.pool_keepalive_ms),
        }));

        let invoker = Arc::new(Invoker::new(pool.clone()));

        let lb: Arc<dyn LoadBalancer> = match config.lb_policy {
            LbPolicy::P2c => Arc::new(WeightedP2c {
                rtt_coefficient: config.lb_p2c_alpha,
                err_rate_coefficient: config.lb_p2c_beta,
            }),
            LbPolicy::ConsistentHash => Arc::new(ConsistentHashRing {
                virtual_nodes: config.lb_ch_replicas as u32,
                overload_factor: config.lb_ch_overload_factor,
            }),
        };

        let breakers = Arc::new(BreakerSet::new(BreakerConfig {
            alpha: 0.3,
            min_samples: config.breaker_min_samples as u32,
            observation_period: Duration::from_secs(30),
            failure_threshold: config.breaker_failure_threshold,
            base_cooldown: Duration::from_millis(config.breaker_open_cooldown_ms),
            max_cooldown: Duration::from_millis(config.breaker_max_cooldown_ms),
            half_open_successes_to_close: 1,
            half_open_max_probes: config.breaker_halfopen_probes as u32,
        }));

        let cache = Arc::new(ResponseCache::new(config.cache_capacity, config.cache_shards));

        let admission = Arc::new(AdmissionControl::new(
            config.admission_queue_size,
            config.ratelimit_buckets_lru_size,
            RateLimitConfig::default(),
        ));

        let (telemetry, rx) = TelemetrySink::new(4096);

        let state = Self {
            config: Arc::new(config),
            registry,
            pool,
            invoker,
            lb,
            breakers,
            cache,
            admission,
            telemetry,
        };
        (state, rx)
    }
}
