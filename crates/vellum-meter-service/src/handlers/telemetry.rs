//! Telemetry ingestion handler.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};

use vellum_meter_core::{SessionId, TelemetryKind};

use crate::aggregator::RecordRequest;
use crate::error::ApiError;
use crate::identity::ResolvedIdentity;
use crate::state::AppState;

/// Telemetry submission body.
#[derive(Debug, Deserialize)]
pub struct TelemetryRequest {
    /// Session to attribute the interaction to. Falls back to the
    /// caller's session cookie, then to a freshly opened session.
    pub session_id: Option<String>,
    /// Interaction kind.
    pub kind: TelemetryKind,
    /// Conversation id; required for chat turns.
    pub conversation_id: Option<String>,
    /// Free-form interaction detail.
    #[serde(default)]
    pub payload: serde_json::Value,
}

/// Telemetry submission response.
#[derive(Debug, Serialize)]
pub struct TelemetryResponse {
    /// Session the record was attributed to.
    pub session_id: String,
    /// Identifier of the appended record.
    pub record_id: String,
    /// Whether a new session was opened.
    pub new_session: bool,
}

/// Record one interaction.
pub async fn record(
    State(state): State<Arc<AppState>>,
    ResolvedIdentity(identity): ResolvedIdentity,
    Json(body): Json<TelemetryRequest>,
) -> Result<(StatusCode, Json<TelemetryResponse>), ApiError> {
    let claimed = match &body.session_id {
        Some(raw) => Some(
            raw.parse::<SessionId>()
                .map_err(|_| ApiError::BadRequest("invalid session id".into()))?,
        ),
        None => identity.session_id(),
    };

    let conversation_id = match &body.conversation_id {
        Some(raw) => Some(
            raw.parse()
                .map_err(|_| ApiError::BadRequest("invalid conversation id".into()))?,
        ),
        None => None,
    };
    if body.kind == TelemetryKind::ChatTurn && conversation_id.is_none() {
        return Err(ApiError::BadRequest(
            "conversation_id is required for chat turns".into(),
        ));
    }

    let recorded = state
        .aggregator
        .record(RecordRequest {
            session_id: claimed,
            user_id: identity.user_id(),
            kind: body.kind,
            conversation_id,
            payload: body.payload,
        })
        .await?;

    Ok((
        StatusCode::ACCEPTED,
        Json(TelemetryResponse {
            session_id: recorded.session_id.to_string(),
            record_id: recorded.record_id.to_string(),
            new_session: recorded.opened_new_session,
        }),
    ))
}
