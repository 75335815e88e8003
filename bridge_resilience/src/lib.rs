//! Circuit Breaker Set (C3) and Load Balancer (C4), spec.md §4.3–4.4.

pub mod breaker;
pub mod lb;

pub use breaker::{Admission, Breaker, BreakerConfig, BreakerState};
pub use lb::{ConsistentHashRing, LoadBalancer, WeightedP2c};
