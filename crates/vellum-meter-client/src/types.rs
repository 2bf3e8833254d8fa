//! Request and response types for the vellum-meter API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub use vellum_meter_core::TelemetryKind;

/// Quota standing returned by consume and status calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
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
    /// The anonymous session the allowance is keyed on; replay it as the
    /// session cookie to stay on one account. Absent when authenticated.
    #[serde(default)]
    pub session_id: Option<String>,
}

/// Consume request body.
#[derive(Debug, Clone, Serialize)]
pub struct ConsumeRequest {
    /// Units to consume.
    pub cost: i64,
}

/// Refund request body.
#[derive(Debug, Clone, Serialize)]
pub struct RefundRequest {
    /// Authenticated account to credit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Anonymous account to credit.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Units to return.
    pub amount: i64,
}

/// Telemetry submission body.
#[derive(Debug, Clone, Serialize)]
pub struct TelemetryRequest {
    /// Session to attribute the interaction to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    /// Interaction kind.
    pub kind: TelemetryKind,
    /// Conversation id; required for chat turns.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Free-form interaction detail.
    pub payload: serde_json::Value,
}

/// Telemetry submission response.
#[derive(Debug, Clone, Deserialize)]
pub struct TelemetryResponse {
    /// Session the record was attributed to.
    pub session_id: String,
    /// Identifier of the appended record.
    pub record_id: String,
    /// Whether a new session was opened.
    pub new_session: bool,
}

/// Session rollup snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionResponse {
    /// Session id.
    pub id: String,
    /// Owning user, if the visitor was logged in.
    pub user_id: Option<String>,
    /// When the session opened.
    pub started_at: DateTime<Utc>,
    /// Most recent interaction.
    pub last_active_at: DateTime<Utc>,
    /// When the session closed, if it has.
    pub ended_at: Option<DateTime<Utc>>,
    /// Page views folded into this session.
    pub page_views: i64,
    /// Non-page-view events folded into this session.
    pub events_count: i64,
    /// Single page view and nothing else.
    pub bounce: bool,
    /// Whether the session is still open.
    pub active: bool,
}

/// Conversation aggregate snapshot.
#[derive(Debug, Clone, Deserialize)]
pub struct ConversationResponse {
    /// Conversation id.
    pub conversation_id: String,
    /// Chat turns recorded against the conversation.
    pub turns: i64,
    /// Most recent turn.
    pub last_turn_at: DateTime<Utc>,
}

/// Error envelope returned by the API.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorResponse {
    /// The error payload.
    pub error: ApiErrorBody,
}

/// Error payload inside the envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct ApiErrorBody {
    /// Stable machine-readable code.
    pub code: String,
    /// Human-readable message.
    pub message: String,
    /// Code-specific detail fields.
    pub details: Option<serde_json::Value>,
}
