//! MCP Orchestrator (C11, spec.md §4.11): the `Dispatch` algorithm
//! composing every other component in the stated order and lock tier
//! (Registry -> Pool -> Breaker -> Cache, spec.md §5).

use crate::admission::RateLimitStatus;
use crate::cache::Lookup;
use crate::state::GatewayState;
use bridge_core::model::{MethodSpec, RequestEnvelope, ServiceInstance};
use bridge_core::telemetry::ObservationEvent;
use bridge_core::BridgeError;
use bridge_resilience::Admission;
use parking_lot::Mutex;
use serde_json::Value;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub struct DispatchOutcome {
    pub data: Value,
    pub cache_state: CacheState,
    pub instance: Option<String>,
    pub rate_limit: RateLimitStatus,
}

/// Everything `rest.rs` needs to set response headers even when dispatch
/// fails, since the spec's `X-Cache`/`X-RateLimit-*` headers apply on
/// error responses too (spec.md §6).
pub struct DispatchFailure {
    pub error: BridgeError,
    pub cache_state: CacheState,
    pub rate_limit: RateLimitStatus,
}

/// The four `X-Cache` values spec.md §6 requires. `Bypass` covers
/// non-cacheable methods and any failure before the cache is consulted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheState {
    Hit,
    Stale,
    Miss,
    Bypass,
}

impl CacheState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheState::Hit => "hit",
            CacheState::Stale => "stale",
            CacheState::Miss => "miss",
            CacheState::Bypass => "bypass",
        }
    }
}

impl From<Lookup> for CacheState {
    fn from(lookup: Lookup) -> Self {
        match lookup {
            Lookup::Hit => CacheState::Hit,
            Lookup::Stale => CacheState::Stale,
            Lookup::Miss => CacheState::Miss,
        }
    }
}

fn now_ms() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as u64).unwrap_or(0)
}

/// `Dispatch(request) -> response`, spec.md §4.11 steps 1-8 (steps 2/6
/// — REST<->canonical translation — are performed by the caller via
/// `bridge_translate`, since the `MethodSpec` and JSON body are already
/// resolved by the time the Gateway calls this).
pub async fn dispatch(
    state: &GatewayState,
    service: &str,
    method: &MethodSpec,
    envelope: &RequestEnvelope,
) -> Result<DispatchOutcome, DispatchFailure> {
    let dispatch_start = Instant::now();
    let tenant = envelope.tenant.as_deref();

    // 1. Admission.
    let route = format!("{service}/{}", method.name);
    let (route_admission, rate_limit) = state.admission.admit_route(tenant, &route);
    let bypass = |error: BridgeError, cache_state: CacheState| DispatchFailure { error, cache_state, rate_limit };

    let _permit = match state.admission.admit_global() {
        Ok(permit) => permit,
        Err(err) => return Err(bypass(err, CacheState::Bypass)),
    };
    if let Err(err) = route_admission {
        return Err(bypass(err, CacheState::Bypass));
    }

    let request_bytes = match bridge_translate::encode_message(&method.request_shape, &envelope.body) {
        Ok(bytes) => bytes,
        Err(err) => return Err(bypass(err, CacheState::Bypass)),
    };

    let call_metadata = envelope.call_metadata();
    let deadline = envelope.deadline;

    // 3. Cache lookup / single-flight, 4-6 inline in the closure so a
    // cache miss and a cache hit share the exact same call path.
    if method.cacheable() {
        let fingerprint = bridge_translate::fingerprint(
            service,
            &method.name,
            &request_bytes,
            tenant,
            envelope.accept_language.as_deref(),
        );
        let served_instance: Mutex<Option<String>> = Mutex::new(None);
        let result = state
            .cache
            .get_or_fetch(fingerprint, method.cache_ttl, method.stale_after, method.negative_cache, || async {
                let (bytes, instance) = call_backend(state, service, method, &request_bytes, deadline, &call_metadata)
                    .await
                    .map_err(|e| e.to_string())?;
                *served_instance.lock() = Some(instance);
                bridge_translate::decode_message(&method.response_shape, &bytes).map_err(|e| e.to_string())
            })
            .await;

        let latency_ms = dispatch_start.elapsed().as_millis() as u64;
        let instance = served_instance.lock().clone();

        return match result {
            Ok((payload, lookup)) => {
                let cache_state = CacheState::from(lookup);
                state.telemetry.emit(ObservationEvent {
                    ts_ms: now_ms(),
                    request_id: envelope.request_id.clone(),
                    tenant: tenant.map(str::to_string),
                    service: service.to_string(),
                    method: method.name.clone(),
                    instance: instance.clone(),
                    latency_ms,
                    bytes_in: request_bytes.len() as u64,
                    bytes_out: 0,
                    status: "ok".to_string(),
                    cache_state: cache_state.as_str().to_string(),
                    breaker_state: "closed".to_string(),
                });
                Ok(DispatchOutcome { data: payload, cache_state, instance, rate_limit })
            }
            Err(message) => {
                let err = BridgeError::Unavailable(message);
                state.telemetry.emit(ObservationEvent {
                    ts_ms: now_ms(),
                    request_id: envelope.request_id.clone(),
                    tenant: tenant.map(str::to_string),
                    service: service.to_string(),
                    method: method.name.clone(),
                    instance,
                    latency_ms,
                    bytes_in: request_bytes.len() as u64,
                    bytes_out: 0,
                    status: err.code().to_string(),
                    cache_state: CacheState::Miss.as_str().to_string(),
                    breaker_state: "closed".to_string(),
                });
                Err(bypass(err, CacheState::Miss))
            }
        };
    }

    let (response_bytes, instance) =
        match call_backend(state, service, method, &request_bytes, deadline, &call_metadata).await {
            Ok(ok) => ok,
            Err(err) => return Err(bypass(err, CacheState::Bypass)),
        };
    let data = match bridge_translate::decode_message(&method.response_shape, &response_bytes) {
        Ok(data) => data,
        Err(err) => return Err(bypass(err, CacheState::Bypass)),
    };

    state.telemetry.emit(ObservationEvent {
        ts_ms: now_ms(),
        request_id: envelope.request_id.clone(),
        tenant: tenant.map(str::to_string),
        service: service.to_string(),
        method: method.name.clone(),
        instance: Some(instance.clone()),
        latency_ms: dispatch_start.elapsed().as_millis() as u64,
        bytes_in: request_bytes.len() as u64,
        bytes_out: response_bytes.len() as u64,
        status: "ok".to_string(),
        cache_state: CacheState::Bypass.as_str().to_string(),
        breaker_state: "closed".to_string(),
    });

    Ok(DispatchOutcome { data, cache_state: CacheState::Bypass, instance: Some(instance), rate_limit })
}

/// Steps 4-5 of spec.md §4.11: resolve the service, loop over
/// LB-selected instances asking the breaker first, until one succeeds
/// or the instance list is exhausted. Returns the raw response bytes
/// together with the `instance_id` that served the call.
async fn call_backend(
    state: &GatewayState,
    service: &str,
    method: &MethodSpec,
    request_bytes: &[u8],
    deadline: Instant,
    call_metadata: &bridge_core::model::CallMetadata,
) -> Result<(Vec<u8>, String), BridgeError> {
    let snapshot = state.registry.lookup(service)?;
    let mut candidates = snapshot.eligible();
    if candidates.is_empty() {
        return Err(BridgeError::Unavailable(format!("no healthy instances for '{service}'")));
    }

    let mut last_err = BridgeError::Unavailable(format!("no instance accepted the call for '{service}'"));

    while !candidates.is_empty() {
        let Some(picked) = state.lb.pick(&candidates, None) else {
            break;
        };
        let entry = picked.clone();
        let instance: ServiceInstance = entry.instance.clone();
        let runtime = &entry.runtime;
        let breaker = state.breakers.get(&instance.instance_id);

        match breaker.admit() {
            Admission::Denied(err) => {
                last_err = err;
                candidates.retain(|c| c.instance.instance_id != instance.instance_id);
                continue;
            }
            Admission::Allowed => {}
        }

        runtime.inc_inflight();
        let start = Instant::now();
        let result = state.invoker.invoke(&instance, method, request_bytes.to_vec(), deadline, call_metadata).await;
        let rtt_micros = start.elapsed().as_micros() as f64;
        runtime.dec_inflight();

        match result {
            Ok(bytes) => {
                runtime.observe(rtt_micros, false, 0.3);
                runtime.record_probe(true);
                breaker.on_success();
                return Ok((bytes, instance.instance_id));
            }
            Err(err) => {
                runtime.observe(rtt_micros, true, 0.3);
                runtime.record_probe(false);
                if err.is_breaker_failure() {
                    breaker.on_failure();
                }
                last_err = err;
                candidates.retain(|c| c.instance.instance_id != instance.instance_id);
            }
        }
    }

    Err(last_err)
}
