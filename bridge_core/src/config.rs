//! Bridge-wide configuration (spec.md §6 "Configuration options").
//!
//! Loading follows `fechatter_gateway::config::GatewayConfig::load()`:
//! try an explicit path, then an env var override, then a small set of
//! conventional locations, then fall back to defaults.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub listen_addr: String,
    pub base_prefix: String,
    pub max_inflight_requests: usize,
    pub default_request_deadline_ms: u64,
    pub egress_budget_ms: u64,

    pub registry_shards: usize,
    pub service_grace_ms: u64,

    pub health_probe_interval_ms: u64,
    pub health_probe_timeout_ms: u64,
    pub health_backoff_max_ms: u64,

    pub breaker_failure_threshold: f64,
    pub breaker_min_samples: usize,
    pub breaker_open_cooldown_ms: u64,
    pub breaker_max_cooldown_ms: u64,
    pub breaker_halfopen_probes: usize,

    pub lb_policy: LbPolicy,
    pub lb_p2c_alpha: f64,
    pub lb_p2c_beta: f64,
    pub lb_ch_replicas: usize,
    pub lb_ch_overload_factor: f64,

    pub pool_channels_per_instance: usize,
    pub pool_channel_max: usize,
    pub pool_max_concurrent_streams: usize,
    pub pool_idle_timeout_ms: u64,
    pub pool_drain_timeout_ms: u64,
    pub pool_keepalive_ms: u64,

    pub retry_max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_mult: f64,
    pub retry_cap_ms: u64,
    pub retry_jitter_pct: f64,
    pub hedge_delay_ms: u64,

    pub compression_min_bytes: usize,

    pub cache_capacity: usize,
    pub cache_shards: usize,
    pub cache_negative_ttl_ms: u64,

    pub admission_queue_size: usize,
    pub ratelimit_buckets_lru_size: usize,

    pub control_plane_enabled: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LbPolicy {
    P2c,
    ConsistentHash,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            base_prefix: "/api".to_string(),
            max_inflight_requests: 50_000,
            default_request_deadline_ms: 30_000,
            egress_budget_ms: 50,

            registry_shards: 32,
            service_grace_ms: 5_000,

            health_probe_interval_ms: 5_000,
            health_probe_timeout_ms: 2_000,
            health_backoff_max_ms: 60_000,

            breaker_failure_threshold: 0.5,
            breaker_min_samples: 10,
            breaker_open_cooldown_ms: 1_000,
            breaker_max_cooldown_ms: 60_000,
            breaker_halfopen_probes: 1,

            lb_policy: LbPolicy::P2c,
            lb_p2c_alpha: 0.5,
            lb_p2c_beta: 2.0,
            lb_ch_replicas: 160,
            lb_ch_overload_factor: 1.25,

            pool_channels_per_instance: 2,
            pool_channel_max: 4,
            pool_max_concurrent_streams: 100,
            pool_idle_timeout_ms: 5 * 60_000,
            pool_drain_timeout_ms: 15_000,
            pool_keepalive_ms: 30_000,

            retry_max_attempts: 3,
            retry_base_ms: 100,
            retry_mult: 2.0,
            retry_cap_ms: 10_000,
            retry_jitter_pct: 0.10,
            hedge_delay_ms: 50,

            compression_min_bytes: 1024,

            cache_capacity: 10_000,
            cache_shards: 16,
            cache_negative_ttl_ms: 0,

            admission_queue_size: 50_000,
            ratelimit_buckets_lru_size: 100_000,

            control_plane_enabled: true,
        }
    }
}

impl BridgeConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let cfg: Self = serde_yaml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Enhanced loading: explicit env var override, then conventional
    /// locations, then defaults — mirrors `GatewayConfig::load()`.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("BRIDGE_CONFIG") {
            return Self::from_file(&path)
                .with_context(|| format!("loading BRIDGE_CONFIG={path}"));
        }

        for candidate in [
            "config/bridge.yml",
            "config/bridge.yaml",
            "bridge.yml",
            "bridge.yaml",
            "/etc/bridge/bridge.yml",
        ] {
            if Path::new(candidate).exists() {
                return Self::from_file(candidate);
            }
        }

        tracing::warn!("no bridge config file found, falling back to defaults");
        let cfg = Self::default();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.registry_shards > 0, "registry_shards must be > 0");
        anyhow::ensure!(self.cache_shards > 0, "cache_shards must be > 0");
        anyhow::ensure!(
            self.pool_channel_max >= self.pool_channels_per_instance,
            "pool_channel_max must be >= pool_channels_per_instance"
        );
        anyhow::ensure!(
            (0.0..=1.0).contains(&self.breaker_failure_threshold),
            "breaker_failure_threshold must be in [0,1]"
        );
        Ok(())
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn for_testing() -> Self {
        Self { listen_addr: "127.0.0.1:0".to_string(), health_probe_interval_ms: 50, ..Self::default() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        BridgeConfig::default().validate().unwrap();
    }

    #[test]
    fn round_trips_through_yaml() {
        let cfg = BridgeConfig::default();
        let yaml = serde_yaml::to_string(&cfg).unwrap();
        let back: BridgeConfig = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.listen_addr, cfg.listen_addr);
        assert_eq!(back.registry_shards, cfg.registry_shards);
    }

    #[test]
    fn rejects_bad_pool_config() {
        let cfg = BridgeConfig { pool_channel_max: 1, pool_channels_per_instance: 4, ..BridgeConfig::default() };
        assert!(cfg.validate().is_err());
    }
}
