//! Exponential backoff with jitter, shared by the Invoker's retry loop
//! (spec.md §4.6) and the Breaker's cooldown (spec.md §4.3).
//!
//! Generalized from `fechatter_core::services::retry::ExponentialBackoffRetry::calculate_delay`,
//! which only capped a multiplicative backoff; this adds the `±pct`
//! full-jitter term the spec's formula requires.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub mult: f64,
    pub cap: Duration,
    /// Fraction of the computed delay to jitter by, e.g. 0.10 for ±10%.
    pub jitter_pct: f64,
}

impl BackoffPolicy {
    pub fn retry_default() -> Self {
        Self {
            base: Duration::from_millis(100),
            mult: 2.0,
            cap: Duration::from_secs(10),
            jitter_pct: 0.10,
        }
    }

    /// `delay = base * mult^attempt + jitter`, jitter = ±jitter_pct of
    /// delay, capped at `cap` (spec.md §4.6).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let raw_ms = self.base.as_millis() as f64 * self.mult.powi(attempt as i32);
        let capped_ms = raw_ms.min(self.cap.as_millis() as f64);
        let jitter_span = capped_ms * self.jitter_pct;
        let jitter = rand::thread_rng().gen_range(-jitter_span..=jitter_span);
        let final_ms = (capped_ms + jitter).max(0.0);
        Duration::from_millis(final_ms.min(self.cap.as_millis() as f64) as u64)
    }

    /// Deterministic (no jitter) variant, used by the breaker cooldown
    /// doubling sequence (spec.md §4.3: "double cooldown up to cap").
    pub fn doubled(base: Duration, attempt: u32, cap: Duration) -> Duration {
        let raw_ms = base.as_millis() as f64 * 2f64.powi(attempt as i32);
        Duration::from_millis(raw_ms.min(cap.as_millis() as f64) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_within_jitter_band() {
        let policy = BackoffPolicy::retry_default();
        for attempt in 0..5 {
            let d = policy.delay_for_attempt(attempt);
            let expected = 100f64 * 2f64.powi(attempt as i32);
            let band = expected * 0.10;
            assert!(
                (d.as_millis() as f64) <= expected + band + 1.0,
                "attempt {attempt}: {d:?} exceeds jitter band around {expected}"
            );
        }
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy::retry_default();
        let d = policy.delay_for_attempt(20);
        assert!(d <= Duration::from_secs(10) + Duration::from_millis(1));
    }

    #[test]
    fn doubled_cooldown_caps() {
        let d = BackoffPolicy::doubled(Duration::from_secs(1), 10, Duration::from_secs(60));
        assert_eq!(d, Duration::from_secs(60));
    }
}
