//! Service Registry (C1) and Health Prober (C2), spec.md §4.1–4.2.

pub mod prober;
pub mod registry;

pub use prober::{HealthCheck, HealthProber};
pub use registry::{InstanceEntry, InstanceRuntime, Registry, ServiceSnapshot};

