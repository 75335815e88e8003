//! gRPC Invoker (C6, spec.md §4.6): executes unary/streaming calls against
//! a pooled channel with deadlines, retries, hedging, and compression.
//!
//! Drives `tonic::client::Grpc<Channel>` with a raw passthrough codec
//! instead of codegen'd stubs, since `MethodSpec`s are registered at
//! runtime rather than compiled from `.proto` — the same pattern
//! `other_examples/...grpcurl-rs...invoke.rs` uses (`Grpc::unary` plus a
//! custom `Codec`) to invoke methods it only knows about via reflection.

use crate::pool::ChannelPool;
use bridge_core::backoff::BackoffPolicy;
use bridge_core::error::from_grpc_status;
use bridge_core::error::tonic_status::{Code, Status};
use bridge_core::model::{CallKind, CallMetadata, MethodSpec, ServiceInstance};
use bridge_core::BridgeError;
use bytes::{Buf, BufMut};
use futures::{Stream, StreamExt};
use http::uri::PathAndQuery;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tonic::client::Grpc;
use tonic::codec::{Codec, CompressionEncoding, DecodeBuf, Decoder, EncodeBuf, Encoder};
use tonic::metadata::MetadataValue;
use tonic::transport::Channel;
use tonic::Request;

/// Fixed egress budget subtracted from the caller's deadline before it is
/// handed to the backend as a gRPC timeout (spec.md §4.6).
const EGRESS_BUDGET: Duration = Duration::from_millis(50);

/// Gzip payloads at or above this size, per spec.md §4.6.
const COMPRESSION_THRESHOLD: usize = 1024;

/// Passes already wire-encoded protobuf bytes straight through tonic's gRPC
/// framing, since the Translator (C7) has already produced canonical bytes
/// and there is no generated message type to decode into here.
#[derive(Debug, Clone, Default)]
struct RawCodec;

impl Codec for RawCodec {
    type Encode = Vec<u8>;
    type Decode = Vec<u8>;
    type Encoder = RawCodec;
    type Decoder = RawCodec;

    fn encoder(&mut self) -> Self::Encoder {
        RawCodec
    }

    fn decoder(&mut self) -> Self::Decoder {
        RawCodec
    }
}

impl Encoder for RawCodec {
    type Item = Vec<u8>;
    type Error = Status;

    fn encode(&mut self, item: Self::Item, dst: &mut EncodeBuf<'_>) -> Result<(), Self::Error> {
        dst.reserve(item.len());
        dst.put_slice(&item);
        Ok(())
    }
}

impl Decoder for RawCodec {
    type Item = Vec<u8>;
    type Error = Status;

    fn decode(&mut self, src: &mut DecodeBuf<'_>) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.remaining();
        Ok(Some(src.copy_to_bytes(len).to_vec()))
    }
}

fn method_path(method: &MethodSpec) -> Result<PathAndQuery, Box<Status>> {
    PathAndQuery::try_from(format!("/{}/{}", method.grpc_service, method.grpc_method))
        .map_err(|e| Box::new(Status::internal(format!("invalid method path: {e}"))))
}

/// Stamps `x-request-id`, `x-tenant` (if present), `authorization`
/// (passthrough, if present), and `x-deadline-ms` onto the outgoing
/// gRPC metadata (spec.md §6 "Southbound gRPC"). Malformed values
/// (non-ASCII) are dropped rather than failing the call — the metadata
/// is advisory, not load-bearing for correctness.
fn apply_metadata<T>(request: &mut Request<T>, ctx: &CallMetadata, remaining: Duration) {
    let metadata = request.metadata_mut();
    if let Ok(value) = MetadataValue::try_from(ctx.request_id.as_str()) {
        metadata.insert("x-request-id", value);
    }
    if let Some(tenant) = &ctx.tenant {
        if let Ok(value) = MetadataValue::try_from(tenant.as_str()) {
            metadata.insert("x-tenant", value);
        }
    }
    if let Some(authorization) = &ctx.authorization {
        if let Ok(value) = MetadataValue::try_from(authorization.as_str()) {
            metadata.insert("authorization", value);
        }
    }
    if let Ok(value) = MetadataValue::try_from(remaining.as_millis().to_string().as_str()) {
        metadata.insert("x-deadline-ms", value);
    }
}

fn grpc_client(channel: Channel, payload_len: usize) -> Grpc<Channel> {
    let grpc = Grpc::new(channel).accept_compressed(CompressionEncoding::Gzip);
    if payload_len >= COMPRESSION_THRESHOLD {
        grpc.send_compressed(CompressionEncoding::Gzip)
    } else {
        grpc
    }
}

/// Unavailable, DeadlineExceeded (if there's still time left for another
/// attempt), and Aborted are retriable; everything else is not (spec.md
/// §4.6's explicit retriable/non-retriable lists).
fn is_retriable(status: &Status, remaining_after: Duration) -> bool {
    match status.code() {
        Code::Unavailable | Code::Aborted => true,
        Code::DeadlineExceeded => !remaining_after.is_zero(),
        _ => false,
    }
}

/// Executes calls against pooled channels, owning the retry/hedge/deadline
/// machinery so neither the Gateway nor the Orchestrator has to.
pub struct Invoker {
    pool: Arc<ChannelPool>,
    retry_policy: BackoffPolicy,
    max_attempts: u32,
}

impl Invoker {
    pub fn new(pool: Arc<ChannelPool>) -> Self {
        Self {
            pool,
            retry_policy: BackoffPolicy::retry_default(),
            max_attempts: 3,
        }
    }

    #[cfg(test)]
    fn with_retry_policy(pool: Arc<ChannelPool>, retry_policy: BackoffPolicy, max_attempts: u32) -> Self {
        Self { pool, retry_policy, max_attempts }
    }

    /// Unary invocation with retry (only if `method.idempotent`) and
    /// optional hedging. `deadline` is the caller's absolute deadline;
    /// the egress budget is subtracted before it reaches the backend.
    pub async fn invoke(
        &self,
        instance: &ServiceInstance,
        method: &MethodSpec,
        payload: Vec<u8>,
        deadline: Instant,
        ctx: &CallMetadata,
    ) -> Result<Vec<u8>, BridgeError> {
        let budgeted_deadline = deadline.checked_sub(EGRESS_BUDGET).unwrap_or(deadline);
        let max_attempts = if method.idempotent { self.max_attempts } else { 1 };
        let mut attempt = 0u32;

        loop {
            let remaining = budgeted_deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(BridgeError::Timeout);
            }

            let guard = self.pool.acquire(instance)?;
            let channel = guard.channel();
            let outcome = match method.hedge_delay {
                Some(hedge_delay) if method.call_kind == CallKind::Unary => {
                    self.call_hedged(channel, method, payload.clone(), remaining, hedge_delay, ctx).await
                }
                _ => self.call_once(channel, method, payload.clone(), remaining, ctx).await,
            };
            drop(guard);

            match outcome {
                Ok(bytes) => return Ok(bytes),
                Err(status) => {
                    attempt += 1;
                    let exhausted = attempt >= max_attempts;
                    let remaining_after = budgeted_deadline.saturating_duration_since(Instant::now());
                    if !method.idempotent || exhausted || !is_retriable(&status, remaining_after) {
                        return Err(from_grpc_status(&status, exhausted));
                    }
                    let delay = self.retry_policy.delay_for_attempt(attempt - 1).min(remaining_after);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn call_once(
        &self,
        channel: Channel,
        method: &MethodSpec,
        payload: Vec<u8>,
        remaining: Duration,
        ctx: &CallMetadata,
    ) -> Result<Vec<u8>, Status> {
        let mut grpc = grpc_client(channel, payload.len());
        grpc.ready().await.map_err(|e| Status::unavailable(e.to_string()))?;
        let path = method_path(method).map_err(|e| *e)?;
        let mut request = Request::new(payload);
        request.set_timeout(remaining);
        apply_metadata(&mut request, ctx, remaining);
        let response = grpc.unary(request, path, RawCodec).await?;
        Ok(response.into_inner())
    }

    /// Fires a second attempt after `hedge_delay` if the first hasn't
    /// returned yet; whichever resolves first wins and the other is
    /// dropped, which cancels its in-flight gRPC stream.
    async fn call_hedged(
        &self,
        channel: Channel,
        method: &MethodSpec,
        payload: Vec<u8>,
        remaining: Duration,
        hedge_delay: Duration,
        ctx: &CallMetadata,
    ) -> Result<Vec<u8>, Status> {
        let primary = self.call_once(channel.clone(), method, payload.clone(), remaining, ctx);
        tokio::pin!(primary);
        tokio::select! {
            res = &mut primary => res,
            _ = tokio::time::sleep(hedge_delay.min(remaining)) => {
                let secondary_remaining = remaining.saturating_sub(hedge_delay);
                let secondary = self.call_once(channel, method, payload, secondary_remaining, ctx);
                tokio::pin!(secondary);
                tokio::select! {
                    res = &mut primary => res,
                    res2 = &mut secondary => res2,
                }
            }
        }
    }

    /// Server-streaming invocation: one request, a stream of responses.
    /// Each yielded item carries the deadline/compression treatment of the
    /// originating call; no per-message retry, per spec.md §4.6's "each
    /// stream owns its lifecycle".
    pub async fn invoke_server_stream(
        &self,
        instance: &ServiceInstance,
        method: &MethodSpec,
        payload: Vec<u8>,
        deadline: Instant,
        ctx: &CallMetadata,
    ) -> Result<impl Stream<Item = Result<Vec<u8>, BridgeError>>, BridgeError> {
        let budgeted_deadline = deadline.checked_sub(EGRESS_BUDGET).unwrap_or(deadline);
        let remaining = budgeted_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BridgeError::Timeout);
        }
        let guard = self.pool.acquire(instance)?;
        let channel = guard.channel();
        let mut grpc = grpc_client(channel, payload.len());
        grpc.ready().await.map_err(|e| BridgeError::Unavailable(e.to_string()))?;
        let path = method_path(method).map_err(|e| from_grpc_status(&e, true))?;
        let mut request = Request::new(payload);
        request.set_timeout(remaining);
        apply_metadata(&mut request, ctx, remaining);
        let response = grpc
            .server_streaming(request, path, RawCodec)
            .await
            .map_err(|e| from_grpc_status(&e, true))?;
        let stream = response
            .into_inner()
            .map(move |item| item.map_err(|status| from_grpc_status(&status, true)));
        // keep the channel guard (and its inflight accounting) alive for
        // the lifetime of the stream.
        Ok(GuardedStream { inner: stream, _guard: guard })
    }

    /// Client-streaming invocation: a stream of requests, one response.
    pub async fn invoke_client_stream(
        &self,
        instance: &ServiceInstance,
        method: &MethodSpec,
        requests: impl Stream<Item = Vec<u8>> + Send + 'static,
        deadline: Instant,
        ctx: &CallMetadata,
    ) -> Result<Vec<u8>, BridgeError> {
        let budgeted_deadline = deadline.checked_sub(EGRESS_BUDGET).unwrap_or(deadline);
        let remaining = budgeted_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BridgeError::Timeout);
        }
        let guard = self.pool.acquire(instance)?;
        let channel = guard.channel();
        let mut grpc = Grpc::new(channel).accept_compressed(CompressionEncoding::Gzip);
        grpc.ready().await.map_err(|e| BridgeError::Unavailable(e.to_string()))?;
        let path = method_path(method).map_err(|e| from_grpc_status(&e, true))?;
        let mut request = Request::new(requests);
        request.set_timeout(remaining);
        apply_metadata(&mut request, ctx, remaining);
        let response = grpc
            .client_streaming(request, path, RawCodec)
            .await
            .map_err(|e| from_grpc_status(&e, true))?;
        drop(guard);
        Ok(response.into_inner())
    }

    /// Bidirectional streaming invocation.
    pub async fn invoke_bidi_stream(
        &self,
        instance: &ServiceInstance,
        method: &MethodSpec,
        requests: impl Stream<Item = Vec<u8>> + Send + 'static,
        deadline: Instant,
        ctx: &CallMetadata,
    ) -> Result<impl Stream<Item = Result<Vec<u8>, BridgeError>>, BridgeError> {
        let budgeted_deadline = deadline.checked_sub(EGRESS_BUDGET).unwrap_or(deadline);
        let remaining = budgeted_deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(BridgeError::Timeout);
        }
        let guard = self.pool.acquire(instance)?;
        let channel = guard.channel();
        let mut grpc = Grpc::new(channel).accept_compressed(CompressionEncoding::Gzip);
        grpc.ready().await.map_err(|e| BridgeError::Unavailable(e.to_string()))?;
        let path = method_path(method).map_err(|e| from_grpc_status(&e, true))?;
        let mut request = Request::new(requests);
        request.set_timeout(remaining);
        apply_metadata(&mut request, ctx, remaining);
        let response = grpc
            .streaming(request, path, RawCodec)
            .await
            .map_err(|e| from_grpc_status(&e, true))?;
        let stream = response
            .into_inner()
            .map(move |item| item.map_err(|status| from_grpc_status(&status, true)));
        Ok(GuardedStream { inner: stream, _guard: guard })
    }
}

/// Wraps a response stream together with the pooled-channel guard backing
/// it, so the inflight slot is only released once the caller drops (or
/// fully drains) the stream.
struct GuardedStream<S> {
    inner: S,
    _guard: crate::pool::PooledChannel,
}

impl<S: Stream + Unpin> Stream for GuardedStream<S> {
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        std::pin::Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::ChannelPoolConfig;
    use bridge_core::model::MessageShape;
    use std::time::Duration;

    fn method(idempotent: bool, hedge_delay: Option<Duration>) -> MethodSpec {
        MethodSpec {
            name: "Get".to_string(),
            grpc_service: "svc.Echo".to_string(),
            grpc_method: "Get".to_string(),
            call_kind: CallKind::Unary,
            request_shape: MessageShape::default(),
            response_shape: MessageShape::default(),
            idempotent,
            timeout_default: Duration::from_secs(1),
            rest_patterns: Vec::new(),
            cache_ttl: Duration::ZERO,
            stale_after: None,
            negative_cache: false,
            hedge_delay,
        }
    }

    fn instance() -> ServiceInstance {
        ServiceInstance {
            instance_id: "a".to_string(),
            endpoint: "127.0.0.1:1".to_string(),
            weight: 1.0,
            tls_config: None,
        }
    }

    #[tokio::test]
    async fn unary_call_against_unreachable_backend_reports_unavailable() {
        let pool = Arc::new(ChannelPool::new(ChannelPoolConfig::default()));
        let invoker = Invoker::with_retry_policy(
            pool,
            BackoffPolicy { base: Duration::from_millis(1), mult: 1.0, cap: Duration::from_millis(5), jitter_pct: 0.0 },
            1,
        );
        let deadline = Instant::now() + Duration::from_millis(200);
        let result = invoker
            .invoke(&instance(), &method(false, None), vec![1, 2, 3], deadline, &CallMetadata::default())
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn non_idempotent_method_never_retries() {
        let pool = Arc::new(ChannelPool::new(ChannelPoolConfig::default()));
        let invoker = Invoker::with_retry_policy(
            pool,
            BackoffPolicy { base: Duration::from_millis(1), mult: 1.0, cap: Duration::from_millis(5), jitter_pct: 0.0 },
            5,
        );
        let deadline = Instant::now() + Duration::from_millis(500);
        let start = Instant::now();
        let _ = invoker.invoke(&instance(), &method(false, None), vec![], deadline, &CallMetadata::default()).await;
        // a single failed attempt against a closed port resolves almost
        // immediately; if this were retrying 5x it would take much longer.
        assert!(start.elapsed() < Duration::from_millis(450));
    }

    #[tokio::test]
    async fn deadline_already_elapsed_fails_without_dialing() {
        let pool = Arc::new(ChannelPool::new(ChannelPoolConfig::default()));
        let invoker = Invoker::new(pool);
        let deadline = Instant::now();
        let result = invoker.invoke(&instance(), &method(true, None), vec![], deadline, &CallMetadata::default()).await;
        assert!(matches!(result, Err(BridgeError::Timeout)));
    }
}
