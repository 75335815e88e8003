//! Response Cache (C9, spec.md §4.9): Adaptive Replacement Cache with
//! single-flight coalescing, sharded by the low bits of the cache
//! fingerprint so unrelated keys never contend on the same lock.
//!
//! Generalized from `fechatter_server`'s `UnifiedCacheService` get-or-
//! compute pattern (`services/infrastructure/cache/mod.rs`), replacing
//! its plain TTL map with ARC's four-list eviction (T1/T2 recency/
//! frequency, B1/B2 ghost lists) and a `tokio::sync::broadcast`-based
//! single-flight leader per in-flight fingerprint instead of a bare
//! mutex-guarded HashMap.

use serde_json::Value;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Mutex as AsyncMutex};

/// A cached response plus the bookkeeping needed for TTL/SWR and
/// mirroring (spec.md §3 CacheEntry). `error` is set only for negative
/// entries (spec.md §4.9 "negative caching is explicit per-method").
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub payload: Value,
    pub encoded_at: Instant,
    pub ttl: Duration,
    pub stale_after: Option<Duration>,
    pub error: Option<String>,
}

impl CacheEntry {
    fn is_fresh(&self) -> bool {
        let fresh_window = self.stale_after.unwrap_or(self.ttl);
        self.encoded_at.elapsed() < fresh_window
    }

    fn is_stale_but_servable(&self) -> bool {
        match self.stale_after {
            Some(stale_after) => {
                let age = self.encoded_at.elapsed();
                age >= stale_after && age < self.ttl
            }
            None => false,
        }
    }

    fn is_negative(&self) -> bool {
        self.error.is_some()
    }
}

/// Optional mirror of cache writes to an external KV store (spec.md §6
/// "Persisted state layout"); the core functions without one.
pub trait KvMirror: Send + Sync {
    fn mirror(&self, fingerprint: u128, entry: &CacheEntry);
}

/// Classic ARC: two real lists (T1 recency, T2 frequency) and two ghost
/// lists (B1, B2) of evicted keys only, with an adaptive split point
/// `p` between T1 and T2 capacity.
struct ArcShard {
    capacity: usize,
    p: usize,
    t1: VecDeque<u128>,
    t2: VecDeque<u128>,
    b1: VecDeque<u128>,
    b2: VecDeque<u128>,
    values: std::collections::HashMap<u128, CacheEntry>,
}

impl ArcShard {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            p: 0,
            t1: VecDeque::new(),
            t2: VecDeque::new(),
            b1: VecDeque::new(),
            b2: VecDeque::new(),
            values: std::collections::HashMap::new(),
        }
    }

    fn remove_from(list: &mut VecDeque<u128>, key: u128) -> bool {
        if let Some(pos) = list.iter().position(|k| *k == key) {
            list.remove(pos);
            true
        } else {
            false
        }
    }

    fn replace(&mut self, key: u128) {
        let t1_nonempty = !self.t1.is_empty();
        let evict_from_t1 = t1_nonempty
            && (self.t1.len() > self.p || (self.b2.contains(&key) && self.t1.len() == self.p));
        if evict_from_t1 {
            if let Some(lru) = self.t1.pop_back() {
                self.values.remove(&lru);
                self.b1.push_front(lru);
            }
        } else if let Some(lru) = self.t2.pop_back() {
            self.values.remove(&lru);
            self.b2.push_front(lru);
        }
    }

    fn get(&mut self, key: u128) -> Option<CacheEntry> {
        if Self::remove_from(&mut self.t1, key) {
            self.t2.push_front(key);
            return self.values.get(&key).cloned();
        }
        if Self::remove_from(&mut self.t2, key) {
            self.t2.push_front(key);
            return self.values.get(&key).cloned();
        }
        None
    }

    fn insert(&mut self, key: u128, entry: CacheEntry) {
        if let std::collections::hash_map::Entry::Occupied(mut e) = self.values.entry(key) {
            e.insert(entry);
            Self::remove_from(&mut self.t1, key);
            Self::remove_from(&mut self.t2, key);
            self.t2.push_front(key);
            return;
        }

        if let Some(pos) = self.b1.iter().position(|k| *k == key) {
            self.b1.remove(pos);
            let b1_len = self.b1.len().max(1);
            let delta = (self.b2.len() / b1_len).max(1);
            self.p = (self.p + delta).min(self.capacity);
            if self.t1.len() + self.t2.len() >= self.capacity {
                self.replace(key);
            }
            self.values.insert(key, entry);
            self.t2.push_front(key);
            return;
        }

        if let Some(pos) = self.b2.iter().position(|k| *k == key) {
            self.b2.remove(pos);
            let b2_len = self.b2.len().max(1);
            let delta = (self.b1.len() / b2_len).max(1);
            self.p = self.p.saturating_sub(delta);
            if self.t1.len() + self.t2.len() >= self.capacity {
                self.replace(key);
            }
            self.values.insert(key, entry);
            self.t2.push_front(key);
            return;
        }

        let total = self.t1.len() + self.t2.len();
        if total >= self.capacity {
            if self.t1.len() + self.b1.len() == self.capacity {
                if self.t1.len() < self.capacity {
                    if let Some(lru) = self.b1.pop_back() {
                        let _ = lru;
                    }
                    self.replace(key);
                } else if let Some(lru) = self.t1.pop_back() {
                    self.values.remove(&lru);
                }
            } else {
                self.replace(key);
            }
        }
        while self.b1.len() + self.b2.len() > self.capacity.saturating_sub(self.t1.len() + self.t2.len()).max(1)
            && self.capacity > 0
        {
            if !self.b1.is_empty() && self.b1.len() > self.capacity {
                self.b1.pop_back();
            } else if !self.b2.is_empty() {
                self.b2.pop_back();
            } else {
                break;
            }
        }

        self.values.insert(key, entry);
        self.t1.push_front(key);
    }

    fn len(&self) -> usize {
        self.values.len()
    }
}

struct CacheShard {
    arc: AsyncMutex<ArcShard>,
    /// Synchronous so the leadership slot can be released from `Drop` --
    /// an `await` can't run there. A canceled leader's task drop thus
    /// promptly closes the channel instead of leaving a forgotten sender
    /// no one will ever close.
    inflight: parking_lot::Mutex<std::collections::HashMap<u128, broadcast::Sender<Result<CacheEntry, String>>>>,
}

/// RAII single-flight leadership slot for one fingerprint. `send` is the
/// only way to resolve it with an actual result; if the guard is dropped
/// without calling `send` (the leader's future was canceled), the slot
/// is vacated so the next follower to observe a closed channel can retry
/// `fetch` itself instead of all of them failing (spec.md §5
/// "Cancellation": "A canceled leader hands leadership to any waiting
/// follower rather than failing all of them.").
struct LeaderGuard<'a> {
    shard: &'a CacheShard,
    fingerprint: u128,
    resolved: bool,
}

impl LeaderGuard<'_> {
    fn send(mut self, result: Result<CacheEntry, String>) {
        self.resolved = true;
        if let Some(tx) = self.shard.inflight.lock().remove(&self.fingerprint) {
            let _ = tx.send(result);
        }
    }
}

impl Drop for LeaderGuard<'_> {
    fn drop(&mut self) {
        if !self.resolved {
            self.shard.inflight.lock().remove(&self.fingerprint);
        }
    }
}

/// Sharded ARC response cache with fingerprint-keyed single-flight.
pub struct ResponseCache {
    shards: Vec<CacheShard>,
    shard_count: usize,
    mirror: Option<Arc<dyn KvMirror>>,
}

#[derive(Debug)]
pub enum Lookup {
    Hit,
    Stale,
    Miss,
}

impl ResponseCache {
    pub fn new(capacity: usize, shard_count: usize) -> Self {
        let per_shard = (capacity / shard_count.max(1)).max(1);
        let shards = (0..shard_count.max(1))
            .map(|_| CacheShard {
                arc: AsyncMutex::new(ArcShard::new(per_shard)),
                inflight: parking_lot::Mutex::new(std::collections::HashMap::new()),
            })
            .collect();
        Self { shards, shard_count: shard_count.max(1), mirror: None }
    }

    pub fn with_mirror(mut self, mirror: Arc<dyn KvMirror>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    fn shard_for(&self, fingerprint: u128) -> &CacheShard {
        &self.shards[(fingerprint % self.shard_count as u128) as usize]
    }

    /// Returns a cached value if fresh or servable-stale, otherwise
    /// coalesces concurrent misses into a single call to `fetch` and
    /// broadcasts the result to every waiter (spec.md §8 property 2).
    /// `negative_cache` controls whether a failed `fetch` is itself
    /// cached (spec.md §4.9, `MethodSpec.negative_cache`).
    pub async fn get_or_fetch<F, Fut>(
        &self,
        fingerprint: u128,
        ttl: Duration,
        stale_after: Option<Duration>,
        negative_cache: bool,
        fetch: F,
    ) -> Result<(Value, Lookup), String>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Value, String>>,
    {
        let shard = self.shard_for(fingerprint);

        loop {
            {
                let mut arc = shard.arc.lock().await;
                if let Some(entry) = arc.get(fingerprint) {
                    if entry.is_fresh() {
                        if let Some(message) = &entry.error {
                            return Err(message.clone());
                        }
                        return Ok((entry.payload.clone(), Lookup::Hit));
                    }
                    if !entry.is_negative() && entry.is_stale_but_servable() {
                        return Ok((entry.payload.clone(), Lookup::Stale));
                    }
                }
            }

            let mut rx_existing = None;
            {
                let mut inflight = shard.inflight.lock();
                if let Some(tx) = inflight.get(&fingerprint) {
                    rx_existing = Some(tx.subscribe());
                } else {
                    let (tx, _rx) = broadcast::channel(16);
                    inflight.insert(fingerprint, tx);
                }
            }

            let Some(mut rx) = rx_existing else {
                // We hold leadership: run the fetch ourselves.
                let guard = LeaderGuard { shard, fingerprint, resolved: false };
                let result = fetch().await;
                return match result {
                    Ok(payload) => {
                        let entry = CacheEntry {
                            payload: payload.clone(),
                            encoded_at: Instant::now(),
                            ttl,
                            stale_after,
                            error: None,
                        };
                        {
                            let mut arc = shard.arc.lock().await;
                            arc.insert(fingerprint, entry.clone());
                        }
                        if let Some(mirror) = &self.mirror {
                            mirror.mirror(fingerprint, &entry);
                        }
                        guard.send(Ok(entry));
                        Ok((payload, Lookup::Miss))
                    }
                    Err(e) => {
                        if negative_cache {
                            let entry = CacheEntry {
                                payload: Value::Null,
                                encoded_at: Instant::now(),
                                ttl,
                                stale_after: None,
                                error: Some(e.clone()),
                            };
                            let mut arc = shard.arc.lock().await;
                            arc.insert(fingerprint, entry);
                        }
                        guard.send(Err(e.clone()));
                        Err(e)
                    }
                };
            };

            match rx.recv().await {
                Ok(Ok(entry)) => return Ok((entry.payload, Lookup::Miss)),
                Ok(Err(e)) => return Err(e),
                // Leader was canceled without resolving the slot: try
                // again, either as the new leader or a new follower.
                Err(_) => continue,
            }
        }
    }

    pub async fn len(&self, fingerprint: u128) -> usize {
        self.shard_for(fingerprint).arc.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn miss_then_hit_calls_backend_once() {
        let cache = ResponseCache::new(100, 4);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            let (value, _) = cache
                .get_or_fetch(42, Duration::from_secs(60), None, false, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::String("hi".to_string()))
                })
                .await
                .unwrap();
            assert_eq!(value, Value::String("hi".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn expired_entry_is_refetched() {
        let cache = ResponseCache::new(100, 4);
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        cache
            .get_or_fetch(7, Duration::from_millis(10), None, false, || async move {
                c1.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Bool(true))
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let c2 = calls.clone();
        cache
            .get_or_fetch(7, Duration::from_millis(10), None, false, || async move {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Bool(true))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn concurrent_misses_single_flight_to_one_backend_call() {
        let cache = Arc::new(ResponseCache::new(100, 4));
        let calls = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();
        for _ in 0..50 {
            let cache = cache.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_fetch(99, Duration::from_secs(60), None, false, || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok(Value::String("shared".to_string()))
                    })
                    .await
                    .unwrap()
            }));
        }
        for h in handles {
            let (value, _) = h.await.unwrap();
            assert_eq!(value, Value::String("shared".to_string()));
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_fetch_is_not_cached() {
        let cache = ResponseCache::new(100, 4);
        let err = cache
            .get_or_fetch(1, Duration::from_secs(60), None, false, || async { Err("backend down".to_string()) })
            .await;
        assert!(err.is_err());
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        cache
            .get_or_fetch(1, Duration::from_secs(60), None, false, || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Bool(true))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_after_serves_stale_without_refetch() {
        let cache = ResponseCache::new(100, 4);
        let calls = Arc::new(AtomicUsize::new(0));
        let c1 = calls.clone();
        cache
            .get_or_fetch(5, Duration::from_millis(200), Some(Duration::from_millis(10)), false, || async move {
                c1.fetch_add(1, Ordering::SeqCst);
                Ok(Value::String("v1".to_string()))
            })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        let c2 = calls.clone();
        let (value, lookup) = cache
            .get_or_fetch(5, Duration::from_millis(200), Some(Duration::from_millis(10)), false, || async move {
                c2.fetch_add(1, Ordering::SeqCst);
                Ok(Value::String("v2".to_string()))
            })
            .await
            .unwrap();
        assert_eq!(value, Value::String("v1".to_string()));
        assert!(matches!(lookup, Lookup::Stale));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn evicts_beyond_capacity() {
        let cache = ResponseCache::new(4, 1);
        for i in 0..10u128 {
            cache
                .get_or_fetch(i, Duration::from_secs(60), None, false, || async move { Ok(Value::from(i as u64)) })
                .await
                .unwrap();
        }
        assert!(cache.len(0).await <= 4);
    }

    #[tokio::test]
    async fn canceled_leader_hands_off_to_a_follower() {
        let cache = Arc::new(ResponseCache::new(100, 4));
        let calls = Arc::new(AtomicUsize::new(0));

        let leader_calls = calls.clone();
        let leader_cache = cache.clone();
        let leader = tokio::spawn(async move {
            leader_cache
                .get_or_fetch(11, Duration::from_secs(60), None, false, || async move {
                    leader_calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    Ok(Value::String("never".to_string()))
                })
                .await
        });

        // Give the leader time to register its single-flight slot, then
        // cancel it before it ever resolves.
        tokio::time::sleep(Duration::from_millis(20)).await;
        leader.abort();
        let _ = leader.await;

        let follower_calls = calls.clone();
        let (value, lookup) = cache
            .get_or_fetch(11, Duration::from_secs(60), None, false, || async move {
                follower_calls.fetch_add(1, Ordering::SeqCst);
                Ok(Value::String("recovered".to_string()))
            })
            .await
            .unwrap();

        assert_eq!(value, Value::String("recovered".to_string()));
        assert!(matches!(lookup, Lookup::Miss));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn negative_cache_short_circuits_when_enabled() {
        let cache = ResponseCache::new(100, 4);
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            let err = cache
                .get_or_fetch(21, Duration::from_secs(60), None, true, || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("backend down".to_string())
                })
                .await;
            assert_eq!(err.unwrap_err(), "backend down");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
