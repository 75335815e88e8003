//! Admission / Rate Limiter (C10, spec.md §4.10): a bounded global queue
//! plus a per-(tenant, route) token bucket.
//!
//! Generalized from `fechatter_gateway::proxy::mod::RateLimit`'s
//! sliding-window request-timestamp tracker (`proxy/mod.rs`), replaced
//! here with a refill-rate/burst token bucket since spec.md §4.10 wants
//! a bucket, not a fixed window counter; the LRU-eviction-of-idle-keys
//! idea comes from the same source, reimplemented with `lru::LruCache`
//! instead of a raw `HashMap`.

use bridge_core::BridgeError;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::time::Instant;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub refill_per_sec: f64,
    pub burst: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { refill_per_sec: 50.0, burst: 100.0 }
    }
}

/// Snapshot of a token bucket's state for the `X-RateLimit-*` response
/// headers (spec.md §6): `limit` is the burst capacity, `remaining` the
/// tokens left after this request's admission decision, `reset_ms` the
/// time until at least one token is available again, `window_ms` the
/// refill window the rate is expressed over.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub limit: u64,
    pub remaining: u64,
    pub reset_ms: u64,
    pub window_ms: u64,
}

struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(burst: f64) -> Self {
        Self { tokens: burst, last_refill: Instant::now() }
    }

    fn refill(&mut self, cfg: &RateLimitConfig) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * cfg.refill_per_sec).min(cfg.burst);
        self.last_refill = now;
    }

    fn try_consume(&mut self, cfg: &RateLimitConfig) -> bool {
        self.refill(cfg);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    fn status(&self, cfg: &RateLimitConfig) -> RateLimitStatus {
        let reset_ms = if self.tokens >= 1.0 || cfg.refill_per_sec <= 0.0 {
            0
        } else {
            (((1.0 - self.tokens) / cfg.refill_per_sec) * 1000.0).ceil() as u64
        };
        RateLimitStatus {
            limit: cfg.burst as u64,
            remaining: self.tokens.max(0.0) as u64,
            reset_ms,
            window_ms: 1000,
        }
    }
}

/// Holds the global admission permit for the duration of a request; drop
/// releases the slot back to the queue.
pub struct AdmissionPermit {
    _permit: OwnedSemaphorePermit,
}

/// Global bounded queue plus per-(tenant, route) token buckets (spec.md
/// §4.10). Consulted before the cache so a cache hit still counts
/// against admission, per the same section's "predictable load
/// shedding" requirement.
pub struct AdmissionControl {
    global: std::sync::Arc<Semaphore>,
    buckets: Mutex<lru::LruCache<String, TokenBucket>>,
    rate_config: RateLimitConfig,
}

impl AdmissionControl {
    pub fn new(queue_size: usize, bucket_lru_size: usize, rate_config: RateLimitConfig) -> Self {
        Self {
            global: std::sync::Arc::new(Semaphore::new(queue_size.max(1))),
            buckets: Mutex::new(lru::LruCache::new(
                NonZeroUsize::new(bucket_lru_size.max(1)).unwrap(),
            )),
            rate_config,
        }
    }

    /// Global admission: fails fast with `Overloaded` rather than
    /// queuing indefinitely when the bounded queue is full.
    pub fn admit_global(&self) -> Result<AdmissionPermit, BridgeError> {
        match self.global.clone().try_acquire_owned() {
            Ok(permit) => Ok(AdmissionPermit { _permit: permit }),
            Err(_) => Err(BridgeError::Overloaded),
        }
    }

    /// Per-route/per-tenant token bucket: consumes one token or fails
    /// with `Throttled` carrying a retry hint. Always returns the bucket's
    /// resulting state alongside the admission decision, since `rest.rs`
    /// needs it for the `X-RateLimit-*` headers on both success and
    /// 429 responses.
    pub fn admit_route(&self, tenant: Option<&str>, route: &str) -> (Result<(), BridgeError>, RateLimitStatus) {
        let key = format!("{}:{route}", tenant.unwrap_or("-"));
        let mut buckets = self.buckets.lock();
        let bucket = buckets.get_or_insert_mut(key, || TokenBucket::new(self.rate_config.burst));
        let admitted = bucket.try_consume(&self.rate_config);
        let status = bucket.status(&self.rate_config);
        if admitted {
            (Ok(()), status)
        } else {
            let retry_after_ms = ((1.0 / self.rate_config.refill_per_sec) * 1000.0).ceil() as u64;
            (Err(BridgeError::Throttled { retry_after_ms }), status)
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.global.available_permits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn global_admission_rejects_past_capacity() {
        let control = AdmissionControl::new(2, 100, RateLimitConfig::default());
        let _p1 = control.admit_global().unwrap();
        let _p2 = control.admit_global().unwrap();
        assert!(control.admit_global().is_err());
    }

    #[test]
    fn releasing_a_permit_frees_a_slot() {
        let control = AdmissionControl::new(1, 100, RateLimitConfig::default());
        {
            let _p = control.admit_global().unwrap();
            assert!(control.admit_global().is_err());
        }
        assert!(control.admit_global().is_ok());
    }

    #[test]
    fn token_bucket_throttles_past_burst() {
        let control = AdmissionControl::new(100, 100, RateLimitConfig { refill_per_sec: 1.0, burst: 2.0 });
        assert!(control.admit_route(Some("t1"), "svc/get").0.is_ok());
        assert!(control.admit_route(Some("t1"), "svc/get").0.is_ok());
        let (err, _) = control.admit_route(Some("t1"), "svc/get");
        assert!(matches!(err, Err(BridgeError::Throttled { .. })));
    }

    #[test]
    fn separate_tenants_have_independent_buckets() {
        let control = AdmissionControl::new(100, 100, RateLimitConfig { refill_per_sec: 1.0, burst: 1.0 });
        assert!(control.admit_route(Some("a"), "r").0.is_ok());
        assert!(control.admit_route(Some("b"), "r").0.is_ok());
        assert!(control.admit_route(Some("a"), "r").0.is_err());
    }

    #[test]
    fn bucket_refills_over_time() {
        let control = AdmissionControl::new(100, 100, RateLimitConfig { refill_per_sec: 1000.0, burst: 1.0 });
        assert!(control.admit_route(None, "r").0.is_ok());
        assert!(control.admit_route(None, "r").0.is_err());
        std::thread::sleep(Duration::from_millis(5));
        assert!(control.admit_route(None, "r").0.is_ok());
    }

    #[test]
    fn status_reports_remaining_and_reset() {
        let control = AdmissionControl::new(100, 100, RateLimitConfig { refill_per_sec: 10.0, burst: 2.0 });
        let (ok, status) = control.admit_route(Some("t1"), "svc/get");
        assert!(ok.is_ok());
        assert_eq!(status.limit, 2);
        assert_eq!(status.remaining, 1);
        assert_eq!(status.reset_ms, 0);

        let (ok, status) = control.admit_route(Some("t1"), "svc/get");
        assert!(ok.is_ok());
        assert_eq!(status.remaining, 0);

        let (err, status) = control.admit_route(Some("t1"), "svc/get");
        assert!(err.is_err());
        assert!(status.reset_ms > 0);
    }
}
