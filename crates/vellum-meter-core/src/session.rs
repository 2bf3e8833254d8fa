//! Sessions and the telemetry record log.
//!
//! A session represents one continuous visit. Its `page_views` and
//! `events_count` fields are rollup counters derived from the append-only
//! telemetry log; the log is the source of truth and the counters are a
//! cache (reconciled when they drift).

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{RecordId, SessionId, UserId};

/// One continuous visit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Session ID, minted client-side and carried in the session cookie.
    pub id: SessionId,

    /// Owning user, if the visitor was logged in.
    pub user_id: Option<UserId>,

    /// When the session started.
    pub started_at: DateTime<Utc>,

    /// Updated on every recorded event.
    pub last_active_at: DateTime<Utc>,

    /// Set exactly once when the session ends; immutable thereafter.
    pub ended_at: Option<DateTime<Utc>>,

    /// Rollup counter mirroring the count of `PageView` records.
    pub page_views: i64,

    /// Rollup counter mirroring the count of `Event` records.
    pub events_count: i64,

    /// Whether the session currently qualifies as a bounce: exactly one
    /// page view and zero analytics events.
    pub bounce: bool,

    /// The newest page view, i.e. the current exit-page candidate. Kept on
    /// the session row so the retroactive exit-page clear is O(1).
    pub last_page_view: Option<RecordId>,
}

impl Session {
    /// Open a new session.
    #[must_use]
    pub const fn new(id: SessionId, user_id: Option<UserId>, now: DateTime<Utc>) -> Self {
        Self {
            id,
            user_id,
            started_at: now,
            last_active_at: now,
            ended_at: None,
            page_views: 0,
            events_count: 0,
            bounce: false,
            last_page_view: None,
        }
    }

    /// Whether the session is still open.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.ended_at.is_none()
    }

    /// Whether the session has gone stale: no activity for longer than the
    /// idle timeout. Stale sessions are closed, never resurrected.
    #[must_use]
    pub fn is_idle(&self, now: DateTime<Utc>, idle_timeout: Duration) -> bool {
        now - self.last_active_at > idle_timeout
    }
}

/// What kind of interaction a telemetry record captures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TelemetryKind {
    /// A page load. Increments the session's `page_views` rollup.
    PageView,
    /// An interaction event (click, scroll, ...). Increments `events_count`.
    Event,
    /// One turn of an AI chat. Aggregates per conversation, not per session.
    ChatTurn,
}

impl TelemetryKind {
    /// Get the kind name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PageView => "page_view",
            Self::Event => "event",
            Self::ChatTurn => "chat_turn",
        }
    }
}

/// One immutable entry in the telemetry log.
///
/// Records belong to exactly one session and optionally to a user. Once
/// written they never change, with a single exception: a page view's
/// `exit_page` flag is cleared when a newer page view supersedes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryRecord {
    /// Time-ordered record ID.
    pub id: RecordId,

    /// The session this record belongs to.
    pub session_id: SessionId,

    /// The user, if the visitor was logged in.
    pub user_id: Option<UserId>,

    /// What happened.
    pub kind: TelemetryKind,

    /// Client-supplied detail (page path, event name, ...).
    pub payload: serde_json::Value,

    /// When the record was written.
    pub recorded_at: DateTime<Utc>,

    /// For page views: whether this is currently the session's exit page.
    /// The newest page view starts as the candidate. `None` for other kinds.
    pub exit_page: Option<bool>,
}

impl TelemetryRecord {
    /// Create a new record. Page views start as the exit-page candidate.
    #[must_use]
    pub fn new(
        kind: TelemetryKind,
        session_id: SessionId,
        user_id: Option<UserId>,
        payload: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: RecordId::generate(),
            session_id,
            user_id,
            kind,
            payload,
            recorded_at: now,
            exit_page: matches!(kind, TelemetryKind::PageView).then_some(true),
        }
    }
}

/// Per-conversation chat rollup.
///
/// Chat turns increment this aggregate instead of the session counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatAggregate {
    /// The conversation this aggregate counts for.
    pub conversation_id: crate::ids::ConversationId,

    /// Number of chat turns recorded.
    pub turns: i64,

    /// When the last turn was recorded.
    pub last_turn_at: DateTime<Utc>,
}
