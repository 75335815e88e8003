//! Wires the Health Prober (C2, `bridge_registry::prober::HealthCheck`)
//! through the same `bridge_pool::Invoker` path real traffic takes
//! (SPEC_FULL.md's C2 implementation note), instead of a bespoke
//! health-check client, mirroring `fechatter_gateway::health` driving
//! checks through the same `UpstreamManager` the proxy uses.

use async_trait::async_trait;
use bridge_core::model::{CallKind, CallMetadata, MessageShape, MethodSpec, ServiceInstance};
use bridge_pool::Invoker;
use bridge_registry::HealthCheck;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Standard gRPC health-checking protocol method
/// (`grpc.health.v1.Health/Check`), empty request/response.
fn health_check_method(timeout: Duration) -> MethodSpec {
    MethodSpec {
        name: "health.check".to_string(),
        grpc_service: "grpc.health.v1.Health".to_string(),
        grpc_method: "Check".to_string(),
        call_kind: CallKind::Unary,
        request_shape: MessageShape { fields: vec![] },
        response_shape: MessageShape { fields: vec![] },
        idempotent: true,
        timeout_default: timeout,
        rest_patterns: vec![],
        cache_ttl: Duration::ZERO,
        stale_after: None,
        negative_cache: false,
        hedge_delay: None,
    }
}

pub struct GrpcHealthCheck {
    invoker: Arc<Invoker>,
    method: MethodSpec,
}

impl GrpcHealthCheck {
    pub fn new(invoker: Arc<Invoker>, timeout: Duration) -> Self {
        Self { invoker, method: health_check_method(timeout) }
    }
}

#[async_trait]
impl HealthCheck for GrpcHealthCheck {
    async fn check(&self, instance: &ServiceInstance) -> bool {
        let deadline = Instant::now() + self.method.timeout_default;
        self.invoker
            .invoke(instance, &self.method, Vec::new(), deadline, &CallMetadata::default())
            .await
            .is_ok()
    }
}
