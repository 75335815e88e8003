//! gRPC Channel Pool (C5, spec.md §4.5): a small pool of multiplexed
//! channels per `ServiceInstance`. Least-outstanding channel selection,
//! lazy creation, draining on instance removal.
//!
//! Keyed `dashmap::DashMap<InstanceId, PoolEntry>` is the teacher's
//! sharded-map primitive again (as in the Registry); channels
//! themselves are `tonic::transport::Channel`, cheap to clone since
//! they're backed by a multiplexed HTTP/2 connection.

use bridge_core::model::{ServiceInstance, TlsConfig};
use bridge_core::BridgeError;
use dashmap::DashMap;
use parking_lot_compat::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::transport::{Channel, Endpoint};

/// Re-exported under a local name so this module doesn't pull in the
/// `parking_lot` crate just for one `Mutex` (std's is fine here since
/// the critical sections never cross an await point).
mod parking_lot_compat {
    pub use std::sync::Mutex;
}

#[derive(Debug, Clone)]
pub struct ChannelPoolConfig {
    pub min_channels: usize,
    pub max_channels: usize,
    pub max_concurrent_streams: u32,
    pub idle_timeout: Duration,
    pub drain_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for ChannelPoolConfig {
    fn default() -> Self {
        Self {
            min_channels: 2,
            max_channels: 4,
            max_concurrent_streams: 100,
            idle_timeout: Duration::from_secs(5 * 60),
            drain_timeout: Duration::from_secs(15),
            keepalive_interval: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct ChannelHandle {
    channel: Channel,
    inflight: AtomicU32,
    last_used: AtomicU64,
}

impl ChannelHandle {
    fn touch(&self, base: Instant) {
        self.last_used
            .store(base.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self, base: Instant) -> Duration {
        let last_ms = self.last_used.load(Ordering::Relaxed);
        let now_ms = base.elapsed().as_millis() as u64;
        Duration::from_millis(now_ms.saturating_sub(last_ms))
    }
}

struct PoolEntryState {
    channels: Vec<Arc<ChannelHandle>>,
    draining_since: Option<Instant>,
}

struct PoolEntry {
    endpoint_base: String,
    tls_config: Option<TlsConfig>,
    state: Mutex<PoolEntryState>,
}

/// A borrowed channel. Non-owning: dropping it releases the inflight
/// slot back to the pool without closing the underlying connection.
#[derive(Debug)]
pub struct PooledChannel {
    channel: Channel,
    handle: Arc<ChannelHandle>,
}

impl PooledChannel {
    pub fn channel(&self) -> Channel {
        self.channel.clone()
    }
}

impl Drop for PooledChannel {
    fn drop(&mut self) {
        self.handle.inflight.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Per-instance pool of multiplexed gRPC channels.
pub struct ChannelPool {
    entries: DashMap<String, Arc<PoolEntry>>,
    config: ChannelPoolConfig,
    base: Instant,
}

impl ChannelPool {
    pub fn new(config: ChannelPoolConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
            base: Instant::now(),
        }
    }

    fn build_endpoint(&self, endpoint_base: &str, tls: &Option<TlsConfig>) -> Result<Endpoint, BridgeError> {
        let uri = if endpoint_base.starts_with("http://") || endpoint_base.starts_with("https://") {
            endpoint_base.to_string()
        } else {
            format!("http://{endpoint_base}")
        };
        let mut endpoint = Endpoint::from_shared(uri)
            .map_err(|e| BridgeError::Internal(format!("invalid endpoint: {e}")))?
            .keep_alive_timeout(self.config.keepalive_interval)
            .http2_keep_alive_interval(self.config.keepalive_interval);

        if let Some(tls) = tls {
            let mut tls_config = tonic::transport::ClientTlsConfig::new();
            if let Some(domain) = &tls.domain_name {
                tls_config = tls_config.domain_name(domain.clone());
            }
            if let Some(ca_pem) = &tls.ca_cert_pem {
                tls_config = tls_config.ca_certificate(tonic::transport::Certificate::from_pem(ca_pem));
            }
            endpoint = endpoint
                .tls_config(tls_config)
                .map_err(|e| BridgeError::Internal(format!("invalid tls config: {e}")))?;
        }
        Ok(endpoint)
    }

    fn entry_for(&self, instance: &ServiceInstance) -> Arc<PoolEntry> {
        self.entries
            .entry(instance.instance_id.clone())
            .or_insert_with(|| {
                Arc::new(PoolEntry {
                    endpoint_base: instance.endpoint.clone(),
                    tls_config: instance.tls_config.clone(),
                    state: Mutex::new(PoolEntryState {
                        channels: Vec::new(),
                        draining_since: None,
                    }),
                })
            })
            .clone()
    }

    /// Acquire a channel for `instance` via least-outstanding selection.
    /// Creates a new channel lazily if below `max_channels` and every
    /// existing channel is at cap; fails fast with `Overloaded` if the
    /// pool is at `max_channels` and all are saturated.
    pub fn acquire(&self, instance: &ServiceInstance) -> Result<PooledChannel, BridgeError> {
        let entry = self.entry_for(instance);
        let mut state = entry.state.lock().unwrap();
        if state.draining_since.is_some() {
            return Err(BridgeError::Unavailable(format!(
                "instance '{}' is draining",
                instance.instance_id
            )));
        }

        if let Some(handle) = state
            .channels
            .iter()
            .filter(|h| h.inflight.load(Ordering::Relaxed) < self.config.max_concurrent_streams)
            .min_by_key(|h| h.inflight.load(Ordering::Relaxed))
        {
            handle.inflight.fetch_add(1, Ordering::AcqRel);
            handle.touch(self.base);
            return Ok(PooledChannel {
                channel: handle.channel.clone(),
                handle: handle.clone(),
            });
        }

        if state.channels.len() >= self.config.max_channels {
            return Err(BridgeError::Overloaded);
        }

        let endpoint = self.build_endpoint(&entry.endpoint_base, &entry.tls_config)?;
        let channel = endpoint.connect_lazy();
        let handle = Arc::new(ChannelHandle {
            channel: channel.clone(),
            inflight: AtomicU32::new(1),
            last_used: AtomicU64::new(self.base.elapsed().as_millis() as u64),
        });
        state.channels.push(handle.clone());
        Ok(PooledChannel { channel, handle })
    }

    /// Begin draining an instance: refuse new acquisitions immediately;
    /// `sweep` force-closes it once in-flight calls finish or
    /// `drain_timeout` elapses, whichever first.
    pub fn begin_drain(&self, instance_id: &str) {
        if let Some(entry) = self.entries.get(instance_id) {
            let mut state = entry.state.lock().unwrap();
            if state.draining_since.is_none() {
                state.draining_since = Some(Instant::now());
            }
        }
    }

    /// Periodic maintenance: finish draining instances, and trim idle
    /// channels back down to `min_channels`. Intended to be called from
    /// a background ticker.
    pub fn sweep(&self) {
        let mut to_remove = Vec::new();
        for entry_ref in self.entries.iter() {
            let mut state = entry_ref.state.lock().unwrap();
            if let Some(since) = state.draining_since {
                let all_idle = state.channels.iter().all(|h| h.inflight.load(Ordering::Relaxed) == 0);
                if all_idle || since.elapsed() >= self.config.drain_timeout {
                    to_remove.push(entry_ref.key().clone());
                    continue;
                }
            }
            if state.channels.len() > self.config.min_channels {
                let base = self.base;
                let idle_timeout = self.config.idle_timeout;
                let min_channels = self.config.min_channels;
                state.channels.retain(|h| {
                    h.inflight.load(Ordering::Relaxed) > 0
                        || h.idle_for(base) < idle_timeout
                });
                while state.channels.len() > min_channels {
                    if let Some(pos) = state
                        .channels
                        .iter()
                        .position(|h| h.inflight.load(Ordering::Relaxed) == 0)
                    {
                        state.channels.remove(pos);
                    } else {
                        break;
                    }
                }
            }
        }
        for instance_id in to_remove {
            self.entries.remove(&instance_id);
        }
    }

    pub fn channel_count(&self, instance_id: &str) -> usize {
        self.entries
            .get(instance_id)
            .map(|e| e.state.lock().unwrap().channels.len())
            .unwrap_or(0)
    }

    pub fn is_draining(&self, instance_id: &str) -> bool {
        self.entries
            .get(instance_id)
            .map(|e| e.state.lock().unwrap().draining_since.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> ServiceInstance {
        ServiceInstance {
            instance_id: id.to_string(),
            endpoint: "127.0.0.1:50051".to_string(),
            weight: 1.0,
            tls_config: None,
        }
    }

    #[tokio::test]
    async fn acquire_creates_lazily_up_to_min_demand() {
        let pool = ChannelPool::new(ChannelPoolConfig::default());
        let inst = instance("a");
        let guard = pool.acquire(&inst).unwrap();
        assert_eq!(pool.channel_count("a"), 1);
        drop(guard);
    }

    #[tokio::test]
    async fn acquire_reuses_least_outstanding_channel() {
        let pool = ChannelPool::new(ChannelPoolConfig {
            max_concurrent_streams: 2,
            ..Default::default()
        });
        let inst = instance("a");
        let g1 = pool.acquire(&inst).unwrap();
        let g2 = pool.acquire(&inst).unwrap();
        // both acquisitions should land on the single lazily-created channel
        // since its inflight count (2) is still under max_concurrent_streams...
        // actually second acquire sees first at inflight=1 < cap=2, reuses it.
        assert_eq!(pool.channel_count("a"), 1);
        drop(g1);
        drop(g2);
    }

    #[tokio::test]
    async fn acquire_creates_new_channel_when_existing_saturated() {
        let pool = ChannelPool::new(ChannelPoolConfig {
            max_concurrent_streams: 1,
            max_channels: 4,
            ..Default::default()
        });
        let inst = instance("a");
        let _g1 = pool.acquire(&inst).unwrap();
        let _g2 = pool.acquire(&inst).unwrap();
        assert_eq!(pool.channel_count("a"), 2);
    }

    #[tokio::test]
    async fn acquire_fails_fast_when_pool_saturated_at_max() {
        let pool = ChannelPool::new(ChannelPoolConfig {
            max_concurrent_streams: 1,
            max_channels: 1,
            ..Default::default()
        });
        let inst = instance("a");
        let _g1 = pool.acquire(&inst).unwrap();
        let err = pool.acquire(&inst).unwrap_err();
        assert!(matches!(err, BridgeError::Overloaded));
    }

    #[tokio::test]
    async fn draining_instance_refuses_new_acquisitions() {
        let pool = ChannelPool::new(ChannelPoolConfig::default());
        let inst = instance("a");
        let _g = pool.acquire(&inst).unwrap();
        pool.begin_drain("a");
        let err = pool.acquire(&inst).unwrap_err();
        assert!(matches!(err, BridgeError::Unavailable(_)));
    }

    #[tokio::test]
    async fn sweep_removes_drained_instance_once_idle() {
        let pool = ChannelPool::new(ChannelPoolConfig::default());
        let inst = instance("a");
        let guard = pool.acquire(&inst).unwrap();
        pool.begin_drain("a");
        drop(guard);
        pool.sweep();
        assert_eq!(pool.channel_count("a"), 0);
        assert!(!pool.is_draining("a"));
    }

    #[tokio::test]
    async fn sweep_force_closes_after_drain_timeout_even_if_busy() {
        let pool = ChannelPool::new(ChannelPoolConfig {
            drain_timeout: Duration::from_millis(1),
            ..Default::default()
        });
        let inst = instance("a");
        let _guard = pool.acquire(&inst).unwrap();
        pool.begin_drain("a");
        std::thread::sleep(Duration::from_millis(5));
        pool.sweep();
        assert_eq!(pool.channel_count("a"), 0);
    }
}
