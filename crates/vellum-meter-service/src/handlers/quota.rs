//! Quota handlers: consume, status, refund, and limit changes.

use std::sync::Arc;

use axum::extract::State;
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use vellum_meter_core::{Identity, QuotaStatus};

use crate::error::ApiError;
use crate::identity::{AdminAuth, ResolvedIdentity, ServiceAuth};
use crate::state::AppState;

/// Consume request body.
#[derive(Debug, Deserialize)]
pub struct ConsumeRequest {
    /// Units to consume. Defaults to one.
    #[serde(default = "default_cost")]
    pub cost: i64,
}

const fn default_cost() -> i64 {
    1
}

/// Quota standing returned by consume and status endpoints.
#[derive(Debug, Serialize)]
pub struct QuotaStatusResponse {
    /// Allowance for the current window.
    pub limit: i64,
    /// Units consumed so far.
    pub used: i64,
    /// Units still available.
    pub remaining: i64,
    /// When the allowance replenishes; absent for anonymous visitors.
    pub reset_at: Option<DateTime<Utc>>,
    /// Whether the caller was authenticated.
    pub authenticated: bool,
    /// The anonymous session the allowance is keyed on. A caller without
    /// a session cookie gets a freshly minted id here; replaying it keeps
    /// the caller on one account. Absent for authenticated callers.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl QuotaStatusResponse {
    fn from_status(status: QuotaStatus, identity: &Identity) -> Self {
        Self {
            limit: status.limit,
            used: status.used,
            remaining: status.remaining,
            reset_at: status.reset_at,
            authenticated: identity.is_authenticated(),
            session_id: identity.session_id().map(|id| id.to_string()),
        }
    }
}

/// Atomically check and consume quota for the calling identity.
pub async fn consume(
    State(state): State<Arc<AppState>>,
    ResolvedIdentity(identity): ResolvedIdentity,
    body: Option<Json<ConsumeRequest>>,
) -> Result<Json<QuotaStatusResponse>, ApiError> {
    let cost = body.map_or(1, |Json(b)| b.cost);
    if cost <= 0 {
        return Err(ApiError::BadRequest("cost must be positive".into()));
    }

    let status = state.ledger.check_and_consume(&identity, cost).await?;
    Ok(Json(QuotaStatusResponse::from_status(status, &identity)))
}

/// Read the calling identity's quota standing without consuming.
pub async fn status(
    State(state): State<Arc<AppState>>,
    ResolvedIdentity(identity): ResolvedIdentity,
) -> Result<Json<QuotaStatusResponse>, ApiError> {
    let status = state.ledger.quota_status(&identity).await?;
    Ok(Json(QuotaStatusResponse::from_status(status, &identity)))
}

/// Refund request from a backend service.
#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    /// Authenticated account to credit.
    pub user_id: Option<String>,
    /// Anonymous account to credit.
    pub session_id: Option<String>,
    /// Units to return.
    pub amount: i64,
}

/// Return consumed units to an account after a downstream failure.
pub async fn refund(
    State(state): State<Arc<AppState>>,
    auth: ServiceAuth,
    Json(body): Json<RefundRequest>,
) -> Result<Json<QuotaStatusResponse>, ApiError> {
    tracing::debug!(service = %auth.service_name, amount = body.amount, "processing refund");

    if body.amount <= 0 {
        return Err(ApiError::BadRequest("amount must be positive".into()));
    }

    let identity = match (&body.user_id, &body.session_id) {
        (Some(user_id), None) => Identity::Authenticated {
            user_id: user_id
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid user id".into()))?,
        },
        (None, Some(session_id)) => Identity::Anonymous {
            session_id: session_id
                .parse()
                .map_err(|_| ApiError::BadRequest("invalid session id".into()))?,
            ip_address: None,
        },
        _ => {
            return Err(ApiError::BadRequest(
                "exactly one of user_id or session_id is required".into(),
            ));
        }
    };

    let status = state.ledger.refund(&identity, body.amount).await?;
    Ok(Json(QuotaStatusResponse::from_status(status, &identity)))
}

/// Limit change request.
#[derive(Debug, Deserialize)]
pub struct SetLimitRequest {
    /// Account to update.
    pub user_id: String,
    /// New per-window allowance.
    pub limit: i64,
}

/// Limit change response.
#[derive(Debug, Serialize)]
pub struct SetLimitResponse {
    /// Updated account.
    pub user_id: String,
    /// Allowance now in effect.
    pub limit: i64,
}

/// Change an authenticated account's allowance (tier change).
pub async fn set_limit(
    State(state): State<Arc<AppState>>,
    auth: AdminAuth,
    Json(body): Json<SetLimitRequest>,
) -> Result<Json<SetLimitResponse>, ApiError> {
    let user_id = body
        .user_id
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid user id".into()))?;

    if body.limit < 0 {
        return Err(ApiError::BadRequest("limit must not be negative".into()));
    }

    tracing::info!(
        admin_id = %auth.admin_id,
        user_id = %user_id,
        limit = body.limit,
        "changing account limit"
    );
    state.ledger.set_limit(&user_id, body.limit).await?;

    Ok(Json(SetLimitResponse {
        user_id: user_id.to_string(),
        limit: body.limit,
    }))
}
