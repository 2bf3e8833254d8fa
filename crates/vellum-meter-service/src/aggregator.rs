//! Session telemetry ingestion and rollup maintenance.
//!
//! Every interaction lands in the append-only record log first; the
//! per-session counters (`page_views`, `events_count`, `bounce`) are a
//! derived cache over that log. A record append that succeeds while
//! the rollup update fails is therefore not a lost write, only a
//! drifted counter, and the session is queued for the next
//! reconciliation pass instead of failing the caller's request.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use vellum_meter_core::{
    ChatAggregate, ConversationId, RecordId, Session, SessionId, TelemetryKind, TelemetryRecord,
    UserId,
};
use vellum_meter_store::{Store, StoreError};

/// One telemetry submission, after handler-level validation.
#[derive(Debug, Clone)]
pub struct RecordRequest {
    /// Session the interaction belongs to, when the client knows it.
    pub session_id: Option<SessionId>,
    /// Authenticated owner, if any.
    pub user_id: Option<UserId>,
    /// Interaction kind.
    pub kind: TelemetryKind,
    /// Conversation for chat turns.
    pub conversation_id: Option<ConversationId>,
    /// Free-form interaction detail.
    pub payload: serde_json::Value,
}

/// Outcome of a recorded interaction.
#[derive(Debug, Clone)]
pub struct Recorded {
    /// Session the record was attributed to.
    pub session_id: SessionId,
    /// Identifier of the appended record.
    pub record_id: RecordId,
    /// Whether a new session was opened for this interaction.
    pub opened_new_session: bool,
}

/// Maintains session lifecycle and per-session rollups over the
/// telemetry record log.
pub struct SessionAggregator {
    store: Arc<dyn Store>,
    idle_timeout: Duration,
    /// Sessions whose cached counters may disagree with the record log.
    drift: Mutex<HashSet<SessionId>>,
}

impl SessionAggregator {
    /// Build an aggregator over a storage backend.
    pub fn new(store: Arc<dyn Store>, idle_timeout_seconds: i64) -> Self {
        Self {
            store,
            idle_timeout: Duration::seconds(idle_timeout_seconds),
            drift: Mutex::new(HashSet::new()),
        }
    }

    /// Record one interaction: append it to the log, then fold it into
    /// the owning session's rollup.
    ///
    /// # Errors
    ///
    /// Fails only when the record itself cannot be appended; a failed
    /// rollup update is absorbed and queued for reconciliation.
    pub async fn record(&self, request: RecordRequest) -> Result<Recorded, StoreError> {
        self.record_at(request, Utc::now()).await
    }

    /// Clock-explicit variant of [`record`](Self::record).
    pub async fn record_at(
        &self,
        request: RecordRequest,
        now: DateTime<Utc>,
    ) -> Result<Recorded, StoreError> {
        let (session_id, opened_new_session) = self
            .resolve_session(request.session_id, request.user_id, now)
            .await?;

        let record = TelemetryRecord::new(
            request.kind,
            session_id,
            request.user_id,
            request.payload,
            now,
        );
        // The log is the source of truth; only this append can fail the call.
        self.store.append_record(&record).await?;
        let record_id = record.id;

        if request.kind == TelemetryKind::ChatTurn {
            if let Some(conversation_id) = request.conversation_id {
                if let Err(err) = self.store.increment_chat_turns(&conversation_id, now).await {
                    tracing::warn!(
                        conversation_id = %conversation_id,
                        error = %err,
                        "chat aggregate update failed"
                    );
                }
            }
        }

        match self
            .store
            .apply_rollup(&session_id, request.kind, now, record_id)
            .await
        {
            Ok(outcome) => {
                if let Some(previous) = outcome.superseded_page_view {
                    if let Err(err) = self.store.clear_exit_page(&previous).await {
                        self.note_drift(session_id, &err);
                    }
                }
            }
            Err(err) => self.note_drift(session_id, &err),
        }

        Ok(Recorded {
            session_id,
            record_id,
            opened_new_session,
        })
    }

    /// Attribute an interaction to a session, opening one when needed.
    ///
    /// A claimed session that has gone idle is closed at the moment its
    /// idle window expired and a fresh session takes over. A claimed
    /// session that was already ended stays ended.
    async fn resolve_session(
        &self,
        claimed: Option<SessionId>,
        user_id: Option<UserId>,
        now: DateTime<Utc>,
    ) -> Result<(SessionId, bool), StoreError> {
        if let Some(id) = claimed {
            match self.store.get_session(&id).await? {
                Some(session) if session.is_active() && !session.is_idle(now, self.idle_timeout) => {
                    return Ok((id, false));
                }
                Some(session) if session.is_active() => {
                    let expired_at = session.last_active_at + self.idle_timeout;
                    self.store.end_session(&id, expired_at).await?;
                    tracing::debug!(session_id = %id, "closed idle session");
                }
                Some(_) => {
                    // Ended sessions are never resurrected.
                    tracing::debug!(session_id = %id, "claimed session already ended");
                }
                None => {
                    // First interaction under a client-minted id.
                    let session = Session::new(id, user_id, now);
                    self.store.put_session(&session).await?;
                    return Ok((id, true));
                }
            }
        }

        let fresh = Session::new(SessionId::generate(), user_id, now);
        self.store.put_session(&fresh).await?;
        Ok((fresh.id, true))
    }

    /// Close a session now. Closing an already-closed session is a no-op.
    ///
    /// # Errors
    ///
    /// Fails if the session does not exist or the backend fails.
    pub async fn end(&self, id: &SessionId) -> Result<Session, StoreError> {
        self.store.end_session(id, Utc::now()).await
    }

    /// Read a session's current rollup state.
    ///
    /// # Errors
    ///
    /// Fails if the backend fails.
    pub async fn session_summary(&self, id: &SessionId) -> Result<Option<Session>, StoreError> {
        self.store.get_session(id).await
    }

    /// Read a conversation's chat aggregate.
    ///
    /// # Errors
    ///
    /// Fails if the backend fails.
    pub async fn chat_aggregate(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ChatAggregate>, StoreError> {
        self.store.get_chat_aggregate(conversation_id).await
    }

    /// Drain the set of sessions flagged for reconciliation.
    pub fn take_drift_queue(&self) -> Vec<SessionId> {
        match self.drift.lock() {
            Ok(mut queue) => queue.drain().collect(),
            Err(_) => Vec::new(),
        }
    }

    fn note_drift(&self, session_id: SessionId, err: &StoreError) {
        tracing::warn!(
            session_id = %session_id,
            error = %err,
            "rollup update failed, session queued for reconciliation"
        );
        if let Ok(mut queue) = self.drift.lock() {
            queue.insert(session_id);
        }
    }
}
