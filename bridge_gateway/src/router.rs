//! Composes the full `axum::Router`: health endpoints, the
//! `/api/services` listing, optionally the control-plane admin routes,
//! and a fallback that resolves every other path against the
//! data-driven REST pattern catalog (C8, spec.md §4.8/§6).

use crate::health::{self, HealthState};
use crate::state::GatewayState;
use axum::extract::{Path, State};
use axum::response::{IntoResponse, Json};
use axum::routing::{delete, get, post};
use axum::Router;
use bridge_core::model::{ServiceDescriptor, ServiceInstance};
use serde::Deserialize;
use serde_json::json;
use std::time::Instant;

pub fn build(state: GatewayState) -> Router {
    let health_routes = health::router(HealthState { gateway: state.clone(), started_at: Instant::now() });

    let services_router =
        Router::new().route("/api/services", get(list_services)).with_state(state.clone());

    let mut router = health_routes.merge(services_router);

    if state.config.control_plane_enabled {
        router = router.merge(admin_routes(state.clone()));
    }

    let fallback_router = Router::new().fallback(crate::rest::handle).with_state(state);
    router.merge(fallback_router)
}

async fn list_services(State(state): State<GatewayState>) -> impl IntoResponse {
    Json(json!({ "services": state.registry.list_names() }))
}

fn admin_routes(state: GatewayState) -> Router {
    Router::new()
        .route("/admin/services", post(register_service))
        .route("/admin/services/{name}", delete(deregister_service))
        .route("/admin/services/{name}/instances", post(add_instance))
        .route("/admin/services/{name}/instances/{instance_id}", delete(remove_instance))
        .with_state(state)
}

#[derive(Deserialize)]
struct RegisterServiceRequest {
    descriptor: ServiceDescriptor,
    #[serde(default)]
    instances: Vec<ServiceInstance>,
    #[serde(default)]
    replace: bool,
}

async fn register_service(
    State(state): State<GatewayState>,
    Json(req): Json<RegisterServiceRequest>,
) -> axum::response::Response {
    match state.registry.register(req.descriptor, req.instances, req.replace) {
        Ok(()) => (axum::http::StatusCode::CREATED, Json(json!({ "success": true }))).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn deregister_service(State(state): State<GatewayState>, Path(name): Path<String>) -> axum::response::Response {
    match state.registry.deregister(&name) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn add_instance(
    State(state): State<GatewayState>,
    Path(name): Path<String>,
    Json(instance): Json<ServiceInstance>,
) -> axum::response::Response {
    match state.registry.add_instance(&name, instance) {
        Ok(()) => (axum::http::StatusCode::CREATED, Json(json!({ "success": true }))).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn remove_instance(
    State(state): State<GatewayState>,
    Path((name, instance_id)): Path<(String, String)>,
) -> axum::response::Response {
    match state.registry.remove_instance(&name, &instance_id) {
        Ok(()) => Json(json!({ "success": true })).into_response(),
        Err(err) => err.into_response(),
    }
}

