//! Circuit Breaker (C3, spec.md §4.3): per-instance state machine
//! gating calls. Atomics for counters (the failure-rate EWMA and
//! sample count) with a `parking_lot::Mutex` held only for the
//! duration of the state-transition decision — adapted from
//! `flyingrobots-ninelives::circuit_breaker`'s fully lock-free design,
//! which this tightens to "lock only during transition" per spec.md §5.

use bridge_core::BridgeError;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl From<u8> for BreakerState {
    fn from(v: u8) -> Self {
        match v {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    /// Failure-rate EWMA smoothing constant (spec.md §4.3: α = 0.3).
    pub alpha: f64,
    /// Minimum samples observed in the current window before a
    /// failure rate is trusted enough to open the circuit.
    pub min_samples: u32,
    /// Reset the sample counter after this much wall-clock time so a
    /// quiet instance isn't judged on ancient samples.
    pub observation_period: Duration,
    pub failure_threshold: f64,
    pub base_cooldown: Duration,
    pub max_cooldown: Duration,
    /// K: consecutive half-open successes required to close.
    pub half_open_successes_to_close: u32,
    pub half_open_max_probes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            alpha: 0.3,
            min_samples: 10,
            observation_period: Duration::from_secs(30),
            failure_threshold: 0.5,
            base_cooldown: Duration::from_secs(1),
            max_cooldown: Duration::from_secs(60),
            half_open_successes_to_close: 1,
            half_open_max_probes: 1,
        }
    }
}

struct Inner {
    state: AtomicU8,
    failure_rate_bits: AtomicU64,
    sample_count: AtomicU32,
    opened_at: Mutex<Option<Instant>>,
    window_started_at: Mutex<Instant>,
    cooldown_attempt: AtomicU32,
    half_open_probes_in_flight: AtomicU32,
    half_open_consecutive_successes: AtomicU32,
}

/// One breaker per `ServiceInstance`, owned by whoever dispatches calls
/// to it (the Orchestrator, keyed by `instance_id`).
pub struct Breaker {
    inner: Inner,
    config: BreakerConfig,
}

/// Outcome of asking the breaker for permission to call.
pub enum Admission {
    /// Proceed; report the result back via `on_success`/`on_failure`.
    Allowed,
    Denied(BridgeError),
}

impl Breaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Inner {
                state: AtomicU8::new(CLOSED),
                failure_rate_bits: AtomicU64::new(0f64.to_bits()),
                sample_count: AtomicU32::new(0),
                opened_at: Mutex::new(None),
                window_started_at: Mutex::new(Instant::now()),
                cooldown_attempt: AtomicU32::new(0),
                half_open_probes_in_flight: AtomicU32::new(0),
                half_open_consecutive_successes: AtomicU32::new(0),
            },
            config,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.state.load(Ordering::Acquire).into()
    }

    fn current_cooldown(&self) -> Duration {
        let attempt = self.inner.cooldown_attempt.load(Ordering::Relaxed);
        bridge_core::backoff::BackoffPolicy::doubled(
            self.config.base_cooldown,
            attempt,
            self.config.max_cooldown,
        )
    }

    /// Ask whether a call may proceed right now. Closed always allows;
    /// Open allows once the cooldown elapses (transitioning to
    /// HalfOpen); HalfOpen allows up to `half_open_max_probes`
    /// concurrent calls.
    pub fn admit(&self) -> Admission {
        match self.state() {
            BreakerState::Closed => Admission::Allowed,
            BreakerState::Open => {
                let elapsed = {
                    let opened_at = self.inner.opened_at.lock();
                    opened_at.map(|t| t.elapsed())
                };
                match elapsed {
                    Some(elapsed) if elapsed >= self.current_cooldown() => {
                        let mut opened_at = self.inner.opened_at.lock();
                        if self
                            .inner
                            .state
                            .compare_exchange(
                                OPEN,
                                HALF_OPEN,
                                Ordering::AcqRel,
                                Ordering::Acquire,
                            )
                            .is_ok()
                        {
                            *opened_at = None;
                            self.inner.half_open_probes_in_flight.store(1, Ordering::Release);
                            self.inner
                                .half_open_consecutive_successes
                                .store(0, Ordering::Release);
                            tracing::info!("circuit breaker: open -> half-open");
                            Admission::Allowed
                        } else {
                            // Lost the race to another caller's CAS; fall through as denied,
                            // the winner is already probing.
                            Admission::Denied(BridgeError::CircuitOpen(String::new()))
                        }
                    }
                    _ => Admission::Denied(BridgeError::CircuitOpen(String::new())),
                }
            }
            BreakerState::HalfOpen => {
                let inflight = self
                    .inner
                    .half_open_probes_in_flight
                    .fetch_add(1, Ordering::AcqRel);
                if inflight >= self.config.half_open_max_probes {
                    self.inner
                        .half_open_probes_in_flight
                        .fetch_sub(1, Ordering::Release);
                    Admission::Denied(BridgeError::CircuitOpen(String::new()))
                } else {
                    Admission::Allowed
                }
            }
        }
    }

    fn maybe_reset_window(&self) {
        let mut started = self.inner.window_started_at.lock();
        if started.elapsed() >= self.config.observation_period {
            *started = Instant::now();
            self.inner.sample_count.store(0, Ordering::Relaxed);
            self.inner
                .failure_rate_bits
                .store(0f64.to_bits(), Ordering::Relaxed);
        }
    }

    pub fn on_success(&self) {
        match self.state() {
            BreakerState::HalfOpen => {
                self.inner
                    .half_open_probes_in_flight
                    .fetch_sub(1, Ordering::AcqRel);
                let successes = self
                    .inner
                    .half_open_consecutive_successes
                    .fetch_add(1, Ordering::AcqRel)
                    + 1;
                if successes >= self.config.half_open_successes_to_close
                    && self
                        .inner
                        .state
                        .compare_exchange(HALF_OPEN, CLOSED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                {
                    self.inner.sample_count.store(0, Ordering::Relaxed);
                    self.inner
                        .failure_rate_bits
                        .store(0f64.to_bits(), Ordering::Relaxed);
                    self.inner.cooldown_attempt.store(0, Ordering::Relaxed);
                    tracing::info!("circuit breaker: half-open -> closed");
                }
            }
            BreakerState::Closed => {
                self.maybe_reset_window();
                self.record_sample(false);
            }
            BreakerState::Open => {}
        }
    }

    pub fn on_failure(&self) {
        match self.state() {
            BreakerState::HalfOpen => {
                self.inner
                    .half_open_probes_in_flight
                    .fetch_sub(1, Ordering::AcqRel);
                if self
                    .inner
                    .state
                    .compare_exchange(HALF_OPEN, OPEN, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    self.inner.cooldown_attempt.fetch_add(1, Ordering::Relaxed);
                    *self.inner.opened_at.lock() = Some(Instant::now());
                    tracing::warn!("circuit breaker: half-open probe failed -> open");
                }
            }
            BreakerState::Closed => {
                self.maybe_reset_window();
                self.record_sample(true);
                let rate = f64::from_bits(self.inner.failure_rate_bits.load(Ordering::Relaxed));
                let samples = self.inner.sample_count.load(Ordering::Relaxed);
                if samples >= self.config.min_samples && rate >= self.config.failure_threshold {
                    let mut opened_at = self.inner.opened_at.lock();
                    if self
                        .inner
                        .state
                        .compare_exchange(CLOSED, OPEN, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.inner.cooldown_attempt.store(0, Ordering::Relaxed);
                        *opened_at = Some(Instant::now());
                        tracing::error!(rate, samples, "circuit breaker: closed -> open");
                    }
                }
            }
            BreakerState::Open => {}
        }
    }

    fn record_sample(&self, failed: bool) {
        self.inner.sample_count.fetch_add(1, Ordering::Relaxed);
        let prev = f64::from_bits(self.inner.failure_rate_bits.load(Ordering::Relaxed));
        let sample = if failed { 1.0 } else { 0.0 };
        let next = self.config.alpha * sample + (1.0 - self.config.alpha) * prev;
        self.inner
            .failure_rate_bits
            .store(next.to_bits(), Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn saturate_failures(breaker: &Breaker, n: u32) {
        for _ in 0..n {
            assert!(matches!(breaker.admit(), Admission::Allowed));
            breaker.on_failure();
        }
    }

    #[test]
    fn closed_allows_until_threshold_breached() {
        let breaker = Breaker::new(BreakerConfig {
            min_samples: 5,
            failure_threshold: 0.5,
            ..Default::default()
        });
        saturate_failures(&breaker, 5);
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[test]
    fn below_min_samples_never_opens() {
        let breaker = Breaker::new(BreakerConfig {
            min_samples: 10,
            failure_threshold: 0.1,
            ..Default::default()
        });
        saturate_failures(&breaker, 5);
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn open_denies_before_cooldown_elapses() {
        let breaker = Breaker::new(BreakerConfig {
            min_samples: 1,
            failure_threshold: 0.1,
            base_cooldown: Duration::from_secs(60),
            ..Default::default()
        });
        saturate_failures(&breaker, 1);
        assert!(matches!(breaker.admit(), Admission::Denied(_)));
    }

    #[test]
    fn open_transitions_to_half_open_after_cooldown() {
        let breaker = Breaker::new(BreakerConfig {
            min_samples: 1,
            failure_threshold: 0.1,
            base_cooldown: Duration::from_millis(20),
            ..Default::default()
        });
        saturate_failures(&breaker, 1);
        std::thread::sleep(Duration::from_millis(30));
        assert!(matches!(breaker.admit(), Admission::Allowed));
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
    }

    #[test]
    fn half_open_success_closes_circuit() {
        let breaker = Breaker::new(BreakerConfig {
            min_samples: 1,
            failure_threshold: 0.1,
            base_cooldown: Duration::from_millis(10),
            half_open_successes_to_close: 1,
            ..Default::default()
        });
        saturate_failures(&breaker, 1);
        std::thread::sleep(Duration::from_millis(15));
        breaker.admit();
        breaker.on_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[test]
    fn half_open_failure_reopens_and_doubles_cooldown() {
        let breaker = Breaker::new(BreakerConfig {
            min_samples: 1,
            failure_threshold: 0.1,
            base_cooldown: Duration::from_millis(10),
            max_cooldown: Duration::from_secs(60),
            ..Default::default()
        });
        saturate_failures(&breaker, 1);
        std::thread::sleep(Duration::from_millis(15));
        breaker.admit();
        breaker.on_failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        // cooldown doubled: 10ms -> 20ms, so 15ms isn't enough yet
        std::thread::sleep(Duration::from_millis(15));
        assert!(matches!(breaker.admit(), Admission::Denied(_)));
    }

    #[test]
    fn half_open_limits_concurrent_probes() {
        let breaker = Breaker::new(BreakerConfig {
            min_samples: 1,
            failure_threshold: 0.1,
            base_cooldown: Duration::from_millis(10),
            half_open_max_probes: 1,
            ..Default::default()
        });
        saturate_failures(&breaker, 1);
        std::thread::sleep(Duration::from_millis(15));
        assert!(matches!(breaker.admit(), Admission::Allowed));
        assert!(matches!(breaker.admit(), Admission::Denied(_)));
    }

    #[test]
    fn success_in_closed_state_pulls_rate_down() {
        let breaker = Breaker::new(BreakerConfig {
            min_samples: 100,
            failure_threshold: 0.2,
            ..Default::default()
        });
        for _ in 0..20 {
            breaker.on_success();
        }
        assert_eq!(breaker.state(), BreakerState::Closed);
    }
}
