//! API error types and HTTP response mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde_json::json;
use vellum_meter_core::QuotaError;
use vellum_meter_store::StoreError;

/// Errors returned by API handlers, each mapping to an HTTP status and
/// a stable machine-readable error code.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Missing or invalid credentials for a protected endpoint.
    #[error("unauthorized")]
    Unauthorized,

    /// Requested entity does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed request.
    #[error("bad request: {0}")]
    BadRequest(String),

    /// The caller's quota allowance is exhausted.
    #[error("quota exceeded: {used}/{limit}")]
    QuotaExceeded {
        /// Allowance for the current window.
        limit: i64,
        /// Units already consumed.
        used: i64,
        /// When the allowance replenishes, if it ever does.
        reset_at: Option<DateTime<Utc>>,
    },

    /// Write against a session that has already been closed.
    #[error("session ended: {0}")]
    SessionEnded(String),

    /// The storage backend could not serve the request.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),

    /// Unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::QuotaExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::SessionEnded(_) => StatusCode::CONFLICT,
            Self::StorageUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "unauthorized",
            Self::NotFound(_) => "not_found",
            Self::BadRequest(_) => "bad_request",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::SessionEnded(_) => "session_ended",
            Self::StorageUnavailable(_) => "storage_unavailable",
            Self::Internal(_) => "internal_error",
        }
    }

    fn details(&self) -> Option<serde_json::Value> {
        match self {
            Self::QuotaExceeded {
                limit,
                used,
                reset_at,
            } => Some(json!({
                "limit": limit,
                "used": used,
                "reset_at": reset_at,
            })),
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match &self {
            Self::StorageUnavailable(msg) => {
                tracing::warn!(error = %msg, "storage backend unavailable");
            }
            Self::Internal(msg) => {
                tracing::error!(error = %msg, "internal error");
            }
            _ => {}
        }

        let mut error = json!({
            "code": self.code(),
            "message": self.to_string(),
        });
        if let Some(details) = self.details() {
            error["details"] = details;
        }
        (self.status(), Json(json!({ "error": error }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, id } => Self::NotFound(format!("{entity} {id}")),
            StoreError::QuotaExceeded {
                limit,
                used,
                reset_at,
            } => Self::QuotaExceeded {
                limit,
                used,
                reset_at,
            },
            StoreError::SessionEnded { session_id } => Self::SessionEnded(session_id),
            StoreError::Database(msg) => Self::StorageUnavailable(msg),
            StoreError::Serialization(msg) => Self::Internal(msg),
        }
    }
}

impl From<QuotaError> for ApiError {
    fn from(err: QuotaError) -> Self {
        match err {
            QuotaError::Exceeded {
                limit,
                used,
                reset_at,
            } => Self::QuotaExceeded {
                limit,
                used,
                reset_at,
            },
            QuotaError::IdentityInvalid => {
                tracing::error!("ledger was handed an unresolvable identity");
                Self::BadRequest("invalid identity".to_string())
            }
            QuotaError::InvalidCost { cost } => {
                tracing::error!(cost, "non-positive amount reached the ledger");
                Self::BadRequest(format!("amount must be positive, got {cost}"))
            }
            QuotaError::AccountMissing(key) => Self::NotFound(format!("quota account {key}")),
            QuotaError::StorageUnavailable(msg) => Self::StorageUnavailable(msg),
        }
    }
}

/// Convenience alias for handler return types.
pub type ApiResult<T> = Result<T, ApiError>;
