//! Shared types for the REST-to-gRPC bridge: the data model (spec.md
//! §3), the error taxonomy (spec.md §7), configuration (spec.md §6),
//! backoff math, and telemetry event shape. Downstream crates
//! (`bridge_registry`, `bridge_resilience`, `bridge_pool`,
//! `bridge_translate`, `bridge_gateway`) depend on this one, never the
//! other way around.

pub mod backoff;
pub mod config;
pub mod error;
pub mod model;
pub mod telemetry;

pub use config::BridgeConfig;
pub use error::BridgeError;
pub use model::{
    CallKind, FieldSpec, FieldType, Health, MessageShape, MethodSpec, Principal,
    RequestEnvelope, RestPattern, ServiceDescriptor, ServiceInstance, TlsConfig,
};
