//! Shared data model for the bridge: service descriptors, method specs,
//! instances, and the request envelope the gateway hands to the
//! orchestrator. See spec.md §3.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Identity of a logical backend service (spec.md §3 ServiceDescriptor).
///
/// Immutable between register and deregister; updates replace the whole
/// descriptor rather than mutating fields in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceDescriptor {
    pub name: String,
    pub version: String,
    pub methods: Vec<MethodSpec>,
}

impl ServiceDescriptor {
    /// Build the REST-pattern -> MethodSpec lookup the Gateway matches
    /// against, keyed by (http method, pattern).
    pub fn method_catalog(&self) -> HashMap<(http::Method, String), &MethodSpec> {
        let mut catalog = HashMap::new();
        for method in &self.methods {
            for pattern in &method.rest_patterns {
                catalog.insert((pattern.http_method.clone(), pattern.pattern.clone()), method);
            }
        }
        catalog
    }
}

/// A single HTTP method + path template a `MethodSpec` answers to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestPattern {
    #[serde(with = "http_method_serde")]
    pub http_method: http::Method,
    /// e.g. "/users/{id}/messages/{sub}"
    pub pattern: String,
}

mod http_method_serde {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(m: &http::Method, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(m.as_str())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<http::Method, D::Error> {
        let raw = String::deserialize(d)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// How a method's RPC is shaped (spec.md §3 MethodSpec.call_kind).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallKind {
    Unary,
    ServerStream,
    ClientStream,
    BidiStream,
}

/// Declarative description of a callable backend method (spec.md §3
/// MethodSpec). Carries everything the Translator, Invoker, and Cache
/// need without ever contacting the backend to discover it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MethodSpec {
    pub name: String,
    pub grpc_service: String,
    pub grpc_method: String,
    pub call_kind: CallKind,
    pub request_shape: MessageShape,
    pub response_shape: MessageShape,
    pub idempotent: bool,
    #[serde(with = "duration_ms")]
    pub timeout_default: Duration,
    pub rest_patterns: Vec<RestPattern>,
    /// 0 = no cache (spec.md §4.9 TTL default).
    #[serde(default, with = "duration_ms")]
    pub cache_ttl: Duration,
    /// SWR window; must stay < cache_ttl when set.
    #[serde(default, with = "duration_ms_opt")]
    pub stale_after: Option<Duration>,
    /// Negative caching is explicit per-method, default off (spec.md §4.9).
    #[serde(default)]
    pub negative_cache: bool,
    /// Fire a second attempt after this delay if enabled (spec.md §4.6).
    #[serde(default, with = "duration_ms_opt")]
    pub hedge_delay: Option<Duration>,
}

impl MethodSpec {
    pub fn cacheable(&self) -> bool {
        self.idempotent && !self.cache_ttl.is_zero()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod duration_ms_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

/// A scalar/composite field type a declarative schema can hold
/// (spec.md §3 MethodSpec.request_shape/response_shape).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int32,
    Int64,
    Uint64,
    Float32,
    Float64,
    String,
    Bytes,
    Message(MessageShape),
    Repeated(Box<FieldType>),
    /// Protobuf maps are keyed by string here; value may be any type.
    Map(Box<FieldType>),
}

/// One field of a `MessageShape`, carrying the protobuf field number the
/// wire encoder needs (spec.md §3: "field name, type, required, default").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub number: u32,
    #[serde(flatten)]
    pub ty: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// A nested message's full field set — the recursive unit of
/// `request_shape`/`response_shape`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageShape {
    pub fields: Vec<FieldSpec>,
}

impl MessageShape {
    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }
}

/// TLS configuration for a single backend instance (spec.md §3
/// ServiceInstance.tls_config, and REDESIGN FLAG #4: verification is
/// opt-out per instance, never a core-wide default).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    pub domain_name: Option<String>,
    #[serde(default)]
    pub ca_cert_pem: Option<String>,
    /// Disabling verification is an explicit per-instance operator choice.
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
}

/// Health label owned by the Prober/Breaker (spec.md §3 ServiceInstance.health).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Health {
    Unknown,
    Healthy,
    Degraded,
    Unhealthy,
}

/// A concrete address backing a logical service name (spec.md §3
/// ServiceInstance). Runtime stats (rtt_ewma, inflight, err_rate_ewma)
/// live alongside this in the registry's `InstanceRuntime`, not here,
/// since this type is the immutable identity the registry stores and
/// `InstanceRuntime` is the interior-mutable half owned per-shard.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceInstance {
    pub instance_id: String,
    pub endpoint: String,
    #[serde(default = "default_weight")]
    pub weight: f64,
    #[serde(default)]
    pub tls_config: Option<TlsConfig>,
}

fn default_weight() -> f64 {
    1.0
}

/// A pre-verified principal the gateway passes down; the core never
/// validates it (spec.md §1 Non-goals, §9 typed-context redesign flag).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Principal {
    pub subject: Option<String>,
    pub tenant: Option<String>,
    pub raw_authorization: Option<String>,
}

/// Internal form of a request after the Gateway decodes HTTP
/// (spec.md §3 "Request envelope").
#[derive(Debug, Clone)]
pub struct RequestEnvelope {
    pub principal: Principal,
    pub tenant: Option<String>,
    pub service: String,
    pub method: String,
    pub deadline: std::time::Instant,
    pub body: serde_json::Value,
    pub stream: bool,
    pub request_id: String,
    pub accept_language: Option<String>,
}

impl RequestEnvelope {
    /// The slice of the envelope the Invoker needs to stamp onto
    /// outgoing gRPC metadata (spec.md §6 "Southbound gRPC").
    pub fn call_metadata(&self) -> CallMetadata {
        CallMetadata {
            request_id: self.request_id.clone(),
            tenant: self.tenant.clone(),
            authorization: self.principal.raw_authorization.clone(),
        }
    }
}

/// Southbound gRPC metadata carried on every outgoing call (spec.md §6):
/// `x-request-id`, `x-tenant` if present, and `authorization` passed
/// through verbatim if the inbound request carried one. The core never
/// inspects or validates `authorization`, only forwards it.
#[derive(Debug, Clone, Default)]
pub struct CallMetadata {
    pub request_id: String,
    pub tenant: Option<String>,
    pub authorization: Option<String>,
}
