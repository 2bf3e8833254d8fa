//! Session and conversation read/lifecycle handlers.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::Serialize;

use vellum_meter_core::{ConversationId, Session, SessionId};

use crate::error::ApiError;
use crate::state::AppState;

/// Session rollup snapshot.
#[derive(Debug, Serialize)]
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

impl From<Session> for SessionResponse {
    fn from(session: Session) -> Self {
        Self {
            id: session.id.to_string(),
            user_id: session.user_id.map(|id| id.to_string()),
            started_at: session.started_at,
            last_active_at: session.last_active_at,
            ended_at: session.ended_at,
            page_views: session.page_views,
            events_count: session.events_count,
            bounce: session.bounce,
            active: session.is_active(),
        }
    }
}

fn parse_session_id(raw: &str) -> Result<SessionId, ApiError> {
    raw.parse()
        .map_err(|_| ApiError::BadRequest("invalid session id".into()))
}

/// Read a session's rollup state.
pub async fn get_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let session = state
        .aggregator
        .session_summary(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("session {id}")))?;
    Ok(Json(session.into()))
}

/// Close a session. Closing an already-closed session returns its
/// stored state unchanged.
pub async fn end_session(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<SessionResponse>, ApiError> {
    let id = parse_session_id(&id)?;
    let session = state.aggregator.end(&id).await?;
    Ok(Json(session.into()))
}

/// Conversation aggregate snapshot.
#[derive(Debug, Serialize)]
pub struct ConversationResponse {
    /// Conversation id.
    pub conversation_id: String,
    /// Chat turns recorded against the conversation.
    pub turns: i64,
    /// Most recent turn.
    pub last_turn_at: DateTime<Utc>,
}

/// Read a conversation's chat aggregate.
pub async fn get_conversation(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, ApiError> {
    let id: ConversationId = id
        .parse()
        .map_err(|_| ApiError::BadRequest("invalid conversation id".into()))?;
    let aggregate = state
        .aggregator
        .chat_aggregate(&id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("conversation {id}")))?;
    Ok(Json(ConversationResponse {
        conversation_id: aggregate.conversation_id.to_string(),
        turns: aggregate.turns,
        last_turn_at: aggregate.last_turn_at,
    }))
}
