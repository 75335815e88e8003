//! Health, liveness and readiness endpoints (C8, spec.md §6), grounded
//! on `fechatter_gateway::health`'s `health_router` shape but reporting
//! real counts from the Registry instead of placeholder numbers.

use crate::state::GatewayState;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

#[derive(Clone)]
pub struct HealthState {
    pub gateway: GatewayState,
    pub started_at: Instant,
}

#[derive(Serialize)]
struct ServiceCounts {
    total: usize,
    healthy: usize,
    unhealthy: usize,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: u64,
    uptime_s: u64,
    services: ServiceCounts,
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .with_state(state)
}

async fn health(State(state): State<HealthState>) -> impl IntoResponse {
    let (total, healthy, unhealthy) = state.gateway.registry.health_rollup();
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
    Json(HealthResponse {
        status: "ok",
        timestamp,
        uptime_s: state.started_at.elapsed().as_secs(),
        services: ServiceCounts { total, healthy, unhealthy },
    })
}

/// Kubernetes liveness probe: the process is up and responding.
async fn live() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "alive" })))
}

/// Kubernetes readiness probe: at least one registered service has a
/// healthy instance, or no services are registered yet.
async fn ready(State(state): State<HealthState>) -> impl IntoResponse {
    let (total, healthy, _) = state.gateway.registry.health_rollup();
    if total > 0 && healthy == 0 {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(serde_json::json!({ "status": "not_ready", "reason": "no_healthy_instances" })),
        );
    }
    (StatusCode::OK, Json(serde_json::json!({ "status": "ready" })))
}
