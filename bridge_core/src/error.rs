//! Error taxonomy (spec.md §7) and its HTTP/gRPC status mapping.
//!
//! Mirrors the teacher's `AppError -> impl IntoResponse` shape
//! (fechatter_server/src/error.rs): a `thiserror` enum matched once to
//! produce a status code, rendered as the same JSON envelope everywhere.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Stable taxonomy from spec.md §7. `code()` is the string identifier
/// clients key off of; never changes across releases.
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
#[non_exhaustive]
pub enum BridgeError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unauthenticated")]
    Unauthenticated,

    #[error("forbidden")]
    Forbidden,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("precondition failed: {0}")]
    Precondition(String),

    #[error("throttled, retry after {retry_after_ms}ms")]
    Throttled { retry_after_ms: u64 },

    #[error("deadline exceeded")]
    Timeout,

    #[error("upstream unavailable: {0}")]
    Unavailable(String),

    #[error("circuit open for instance {0}")]
    CircuitOpen(String),

    #[error("overloaded")]
    Overloaded,

    #[error("internal error: {0}")]
    Internal(String),

    #[error("canceled")]
    Canceled,
}

impl BridgeError {
    /// Stable string identifier from the taxonomy (spec.md §7 `code`).
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::InvalidRequest(_) => "InvalidRequest",
            BridgeError::Unauthenticated => "Unauthenticated",
            BridgeError::Forbidden => "Forbidden",
            BridgeError::NotFound(_) => "NotFound",
            BridgeError::Conflict(_) => "Conflict",
            BridgeError::Precondition(_) => "Precondition",
            BridgeError::Throttled { .. } => "Throttled",
            BridgeError::Timeout => "Timeout",
            BridgeError::Unavailable(_) => "Unavailable",
            BridgeError::CircuitOpen(_) => "CircuitOpen",
            BridgeError::Overloaded => "Overloaded",
            BridgeError::Internal(_) => "Internal",
            BridgeError::Canceled => "Canceled",
        }
    }

    pub fn http_status(&self) -> StatusCode {
        match self {
            BridgeError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            BridgeError::Unauthenticated => StatusCode::UNAUTHORIZED,
            BridgeError::Forbidden => StatusCode::FORBIDDEN,
            BridgeError::NotFound(_) => StatusCode::NOT_FOUND,
            BridgeError::Conflict(_) => StatusCode::CONFLICT,
            BridgeError::Precondition(_) => StatusCode::PRECONDITION_FAILED,
            BridgeError::Throttled { .. } => StatusCode::TOO_MANY_REQUESTS,
            BridgeError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            BridgeError::Unavailable(_) | BridgeError::CircuitOpen(_) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            BridgeError::Overloaded => StatusCode::SERVICE_UNAVAILABLE,
            BridgeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BridgeError::Canceled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether local recovery (retry/failover) should even be attempted
    /// (spec.md §7 "Recovery" column); idempotency of the call site is
    /// still required on top of this.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            BridgeError::Timeout | BridgeError::Unavailable(_) | BridgeError::CircuitOpen(_)
        )
    }

    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            BridgeError::Throttled { retry_after_ms } => Some(*retry_after_ms),
            _ => None,
        }
    }

    /// Whether this outcome counts toward the circuit breaker's failure
    /// rate (spec.md §4.3): backend/transport health problems only,
    /// never a client-request error the backend would reject from any
    /// instance. `from_grpc_status` already folds `retries_exhausted`
    /// into the `Overloaded` vs. plain `Unavailable` split, so the
    /// mapping here only needs to read the taxonomy, not the original
    /// gRPC code.
    pub fn is_breaker_failure(&self) -> bool {
        matches!(
            self,
            BridgeError::Unavailable(_) | BridgeError::Timeout | BridgeError::Internal(_) | BridgeError::Overloaded
        )
    }
}

/// Client-facing error body (spec.md §7): `message` is human-readable
/// and MUST NOT leak internals; `details.retry_after_ms` only set when
/// applicable.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    pub success: bool,
    pub error: ErrorBody,
}

impl IntoResponse for BridgeError {
    fn into_response(self) -> Response {
        let status = self.http_status();
        let details = self
            .retry_after_ms()
            .map(|retry_after_ms| ErrorDetails {
                retry_after_ms: Some(retry_after_ms),
            });
        let body = ErrorEnvelope {
            success: false,
            error: ErrorBody {
                code: self.code().to_string(),
                message: self.to_string(),
                details,
            },
        };
        (status, Json(body)).into_response()
    }
}

/// Maps a gRPC status code observed from the backend into the taxonomy.
/// `retries_exhausted` distinguishes `ResourceExhausted` pre/post retry
/// budget per spec.md §4.3's failure definition.
pub fn from_grpc_status(status: &tonic_status::Status, retries_exhausted: bool) -> BridgeError {
    use tonic_status::Code;
    match status.code() {
        Code::InvalidArgument | Code::OutOfRange => {
            BridgeError::InvalidRequest(status.message().to_string())
        }
        Code::Unauthenticated => BridgeError::Unauthenticated,
        Code::PermissionDenied => BridgeError::Forbidden,
        Code::NotFound | Code::Unimplemented => {
            BridgeError::NotFound(status.message().to_string())
        }
        Code::AlreadyExists => BridgeError::Conflict(status.message().to_string()),
        Code::FailedPrecondition => BridgeError::Precondition(status.message().to_string()),
        Code::ResourceExhausted if retries_exhausted => BridgeError::Overloaded,
        Code::ResourceExhausted => BridgeError::Unavailable(status.message().to_string()),
        Code::DeadlineExceeded => BridgeError::Timeout,
        Code::Unavailable => BridgeError::Unavailable(status.message().to_string()),
        Code::Aborted => BridgeError::Unavailable(status.message().to_string()),
        Code::Cancelled => BridgeError::Canceled,
        _ => BridgeError::Internal(status.message().to_string()),
    }
}

/// Re-export surface so downstream crates depend on `tonic::Status`
/// without this crate depending on the full `tonic` transport stack.
pub mod tonic_status {
    pub use tonic::{Code, Status};
}
