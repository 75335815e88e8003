//! REST Gateway (C8, spec.md §4.8): match an inbound HTTP request
//! against every registered service's `rest_patterns`, fold path/query/
//! body into a canonical request, call the Orchestrator, and shape the
//! response envelope.

use crate::admission::RateLimitStatus;
use crate::dispatch::{dispatch, CacheState, DispatchFailure};
use crate::state::GatewayState;
use axum::body::Bytes;
use axum::extract::{OriginalUri, Query, State};
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use bridge_core::model::{MethodSpec, Principal, RequestEnvelope};
use bridge_core::BridgeError;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

struct Match {
    service: String,
    method: MethodSpec,
    params: Vec<(String, String)>,
    score: usize,
}

/// Longest-match over the union of every registered service's
/// `rest_patterns` (spec.md §4.8). A pattern's score is its count of
/// literal (non-`{param}`) segments, so `/users/{id}` loses to
/// `/users/active` for the same path.
fn find_match(state: &GatewayState, http_method: &Method, path: &str) -> Option<Match> {
    let request_segments: Vec<&str> = path.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
    let mut best: Option<Match> = None;

    for name in state.registry.list_names() {
        let Ok(snapshot) = state.registry.lookup(&name) else { continue };
        for method in &snapshot.descriptor.methods {
            for pattern in &method.rest_patterns {
                if pattern.http_method != *http_method {
                    continue;
                }
                let pattern_segments: Vec<&str> =
                    pattern.pattern.trim_matches('/').split('/').filter(|s| !s.is_empty()).collect();
                if pattern_segments.len() != request_segments.len() {
                    continue;
                }
                let mut params = Vec::new();
                let mut literal_count = 0;
                let mut ok = true;
                for (p, r) in pattern_segments.iter().zip(request_segments.iter()) {
                    if let Some(param_name) = p.strip_prefix('{').and_then(|s| s.strip_suffix('}')) {
                        params.push((param_name.to_string(), r.to_string()));
                    } else if p == r {
                        literal_count += 1;
                    } else {
                        ok = false;
                        break;
                    }
                }
                if !ok {
                    continue;
                }
                if best.as_ref().map(|b| literal_count > b.score).unwrap_or(true) {
                    best = Some(Match {
                        service: name.clone(),
                        method: method.clone(),
                        params,
                        score: literal_count,
                    });
                }
            }
        }
    }
    best
}

fn extract_deadline(headers: &HeaderMap, default_ms: u64) -> Instant {
    let ms = headers
        .get("x-deadline-ms")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_ms);
    Instant::now() + Duration::from_millis(ms)
}

fn request_id(headers: &HeaderMap) -> String {
    headers
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string())
}

fn tenant_of(headers: &HeaderMap) -> Option<String> {
    headers.get("x-tenant-id").and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn authorization_of(headers: &HeaderMap) -> Option<String> {
    headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok()).map(str::to_string)
}

fn accept_language_of(headers: &HeaderMap) -> Option<String> {
    headers.get(axum::http::header::ACCEPT_LANGUAGE).and_then(|v| v.to_str().ok()).map(str::to_string)
}

/// Folds path params (lowest precedence after query), query params, and
/// JSON body (highest precedence) into one canonical request object per
/// spec.md §4.8.
fn build_body(query: &HashMap<String, String>, path_params: &[(String, String)], raw_body: &[u8]) -> Value {
    let mut fields = Map::new();
    for (k, v) in path_params {
        fields.insert(k.clone(), Value::String(v.clone()));
    }
    for (k, v) in query {
        fields.insert(k.clone(), Value::String(v.clone()));
    }
    if !raw_body.is_empty() {
        if let Ok(Value::Object(obj)) = serde_json::from_slice::<Value>(raw_body) {
            for (k, v) in obj {
                fields.insert(k, v);
            }
        }
    }
    Value::Object(fields)
}

#[derive(serde::Serialize)]
struct ResponseMetadata {
    service: String,
    method: String,
    latency_ms: u64,
    cached: bool,
    request_id: String,
}

#[derive(serde::Serialize)]
struct SuccessEnvelope {
    success: bool,
    data: Value,
    metadata: ResponseMetadata,
}

/// Stamps `X-Request-Id`, `X-Cache`, and `X-RateLimit-{Limit,Remaining,
/// Reset,Window}` onto the response (spec.md §6). Malformed header
/// values are never produced here (request_id is a UUID or caller-
/// supplied ASCII token, cache_state/numbers are all ASCII), so
/// insertion failures are not expected; they're skipped rather than
/// panicking if they ever occur.
fn apply_response_headers(response: &mut Response, request_id: &str, cache_state: CacheState, rate_limit: RateLimitStatus) {
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(request_id) {
        headers.insert("x-request-id", value);
    }
    headers.insert("x-cache", HeaderValue::from_static(cache_state.as_str()));
    headers.insert("x-ratelimit-limit", HeaderValue::from(rate_limit.limit));
    headers.insert("x-ratelimit-remaining", HeaderValue::from(rate_limit.remaining));
    headers.insert("x-ratelimit-reset", HeaderValue::from(rate_limit.reset_ms));
    headers.insert("x-ratelimit-window", HeaderValue::from(rate_limit.window_ms));
}

pub async fn handle(
    State(state): State<GatewayState>,
    method: Method,
    OriginalUri(uri): OriginalUri,
    Query(query): Query<HashMap<String, String>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let path = uri.path();

    let Some(matched) = find_match(&state, &method, path) else {
        return BridgeError::NotFound(format!("no route for {method} {path}")).into_response();
    };

    let req_id = request_id(&headers);
    let tenant = tenant_of(&headers);
    let deadline = extract_deadline(&headers, state.config.default_request_deadline_ms);
    let request_body = build_body(&query, &matched.params, &body);

    let principal =
        Principal { subject: None, tenant: tenant.clone(), raw_authorization: authorization_of(&headers) };
    let envelope = RequestEnvelope {
        principal,
        tenant,
        service: matched.service.clone(),
        method: matched.method.name.clone(),
        deadline,
        body: request_body,
        stream: matched.method.call_kind != bridge_core::model::CallKind::Unary,
        request_id: req_id.clone(),
        accept_language: accept_language_of(&headers),
    };

    let start = Instant::now();
    let result = dispatch(&state, &matched.service, &matched.method, &envelope).await;
    let latency_ms = start.elapsed().as_millis() as u64;

    match result {
        Ok(outcome) => {
            let envelope_body = SuccessEnvelope {
                success: true,
                data: outcome.data,
                metadata: ResponseMetadata {
                    service: matched.service,
                    method: matched.method.name,
                    latency_ms,
                    cached: matches!(outcome.cache_state, CacheState::Hit | CacheState::Stale),
                    request_id: req_id.clone(),
                },
            };
            let mut response = (StatusCode::OK, Json(envelope_body)).into_response();
            apply_response_headers(&mut response, &req_id, outcome.cache_state, outcome.rate_limit);
            response
        }
        Err(DispatchFailure { error, cache_state, rate_limit }) => {
            let mut response = error.into_response();
            apply_response_headers(&mut response, &req_id, cache_state, rate_limit);
            response
        }
    }
}
