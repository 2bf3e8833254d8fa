//! Storage layer for the Vellum metering subsystem.
//!
//! This crate abstracts the transactional store behind the [`Store`] trait.
//! Every compound operation is atomic per row with respect to concurrent
//! callers on the same key — the row is the serialization point, so no
//! application-level lock spans identities or sessions.
//!
//! Two backends are provided:
//!
//! - [`MemoryStore`]: an in-process backend whose per-row mutex supplies the
//!   row-level atomicity. Used by tests and single-node deployments.
//! - `PostgresStore` (behind the `postgres-backend` feature): row locking
//!   via `SELECT ... FOR UPDATE` and conditional `UPDATE` statements.
//!
//! # Example
//!
//! ```
//! use vellum_meter_store::{MemoryStore, Store};
//! use vellum_meter_core::{LedgerKey, SessionId};
//! use chrono::Utc;
//!
//! # async fn example() -> vellum_meter_store::Result<()> {
//! let store = MemoryStore::new();
//! let key = LedgerKey::Visitor(SessionId::generate());
//!
//! let now = Utc::now();
//! let status = store.consume(&key, 1, 10, now, now).await?;
//! assert_eq!(status.remaining, 9);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod memory;
#[cfg(feature = "postgres-backend")]
pub mod postgres;
#[cfg(feature = "postgres-backend")]
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "postgres-backend")]
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use vellum_meter_core::{
    ChatAggregate, ConversationId, LedgerKey, QuotaAccount, QuotaStatus, RecordId, Session,
    SessionId, TelemetryKind, TelemetryRecord, UserId,
};

/// Result of applying a rollup update to a session row.
#[derive(Debug, Clone)]
pub struct RollupOutcome {
    /// The session after the update.
    pub session: Session,

    /// The page view that was the exit-page candidate before this update,
    /// when a new page view displaced it. The caller clears its flag.
    pub superseded_page_view: Option<RecordId>,
}

/// The storage trait defining all database operations.
///
/// This trait abstracts the storage layer, allowing different backends
/// (in-memory, `PostgreSQL`). The quota account row and the session row are
/// each mutated by exactly one logical writer path; the compound operations
/// below are the only mutations either row sees.
#[async_trait]
pub trait Store: Send + Sync {
    // =========================================================================
    // Quota Operations
    // =========================================================================

    /// Get a quota account by ledger key.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_quota_account(&self, key: &LedgerKey) -> Result<Option<QuotaAccount>>;

    /// Set an authenticated account's per-window limit (tier change).
    ///
    /// Creates the account if it does not exist yet. Never touches `used`;
    /// an account left above a lowered limit simply denies until its next
    /// roll.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn set_account_limit(&self, user_id: &UserId, limit: i64) -> Result<()>;

    /// Atomically check and consume quota for one identity.
    ///
    /// Load-or-creates the account row; for authenticated accounts, rolls
    /// the window first when `now` has reached `reset_at` (or no window is
    /// open yet), then checks `used + cost <= limit` and increments. The
    /// whole read-check-increment sequence, window roll included, is
    /// indivisible with respect to concurrent callers on the same key: two
    /// simultaneous requests never both succeed when only one unit remains.
    ///
    /// `limit` is the account's initial limit on creation (authenticated)
    /// or the global anonymous cap; existing authenticated rows keep their
    /// stored limit. `next_reset` is the precomputed start of the next
    /// period, used only when the window rolls. Anonymous accounts never
    /// roll.
    ///
    /// # Errors
    ///
    /// - `StoreError::QuotaExceeded` if the check fails; nothing is mutated.
    /// - `StoreError::Database` if the storage operation fails.
    async fn consume(
        &self,
        key: &LedgerKey,
        cost: i64,
        limit: i64,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<QuotaStatus>;

    /// Return previously consumed units to an account (compensating call).
    ///
    /// `used` is decremented by `amount`, clamped at zero. `limit` supplies
    /// the global cap for anonymous accounts, as in [`Store::consume`].
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the account does not exist.
    async fn refund(&self, key: &LedgerKey, amount: i64, limit: i64) -> Result<QuotaStatus>;

    /// Roll an authenticated account's window if it is due, else no-op.
    ///
    /// The reset sweep uses this instead of its own logic so a race between
    /// the sweep and a live consume can neither double-roll nor lose an
    /// increment. Returns whether a roll happened.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn roll_window_if_due(
        &self,
        user_id: &UserId,
        now: DateTime<Utc>,
        next_reset: DateTime<Utc>,
    ) -> Result<bool>;

    /// List authenticated accounts whose window boundary has passed.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_due_accounts(&self, now: DateTime<Utc>) -> Result<Vec<UserId>>;

    // =========================================================================
    // Session Operations
    // =========================================================================

    /// Insert a new session row.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn put_session(&self, session: &Session) -> Result<()>;

    /// Get a session by ID.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_session(&self, id: &SessionId) -> Result<Option<Session>>;

    /// End a session. Set-once: if `ended_at` is already set the call is a
    /// no-op and the stored session is returned unchanged.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the session does not exist.
    async fn end_session(&self, id: &SessionId, ended_at: DateTime<Utc>) -> Result<Session>;

    /// List sessions that are still open (for the reconciliation sweep).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_active_sessions(&self) -> Result<Vec<SessionId>>;

    // =========================================================================
    // Telemetry Operations
    // =========================================================================

    /// Append one immutable telemetry record. The record log is the source
    /// of truth for the rollup counters.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn append_record(&self, record: &TelemetryRecord) -> Result<()>;

    /// Apply one record's rollup to its session row, atomically:
    /// `last_active_at = now`, the matching counter incremented by exactly
    /// one (chat turns increment neither), bounce recomputed, and for page
    /// views the exit-page candidate pointer swapped to `record_id`.
    ///
    /// Uses the same atomic increment discipline as the quota counter so
    /// rapid duplicate telemetry cannot lose updates.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the session does not exist.
    /// - `StoreError::SessionEnded` if the session has already ended.
    async fn apply_rollup(
        &self,
        id: &SessionId,
        kind: TelemetryKind,
        now: DateTime<Utc>,
        record_id: RecordId,
    ) -> Result<RollupOutcome>;

    /// Clear a superseded page view's exit-page flag.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the record does not exist.
    async fn clear_exit_page(&self, record_id: &RecordId) -> Result<()>;

    /// Repair a session's exit-page state from the record log.
    ///
    /// The newest page view keeps `exit_page = Some(true)`, every older
    /// page view is cleared to `Some(false)`, and the session's candidate
    /// pointer is re-aimed at the newest page view (or cleared when the
    /// session has none). Idempotent; returns whether anything changed.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the session does not exist.
    async fn repair_exit_page(&self, id: &SessionId) -> Result<bool>;

    /// Count a session's records of one kind (reconciliation source).
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn count_records(&self, id: &SessionId, kind: TelemetryKind) -> Result<i64>;

    /// List a session's records in time order, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn list_records(&self, id: &SessionId, limit: usize) -> Result<Vec<TelemetryRecord>>;

    /// Overwrite a session's rollup counters (reconciliation fix).
    ///
    /// Also recomputes `bounce` from the corrected counts.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the session does not exist.
    async fn set_rollup_counts(
        &self,
        id: &SessionId,
        page_views: i64,
        events_count: i64,
    ) -> Result<()>;

    // =========================================================================
    // Chat Aggregates
    // =========================================================================

    /// Increment a conversation's turn counter, creating the aggregate on
    /// first use. Returns the new turn count.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn increment_chat_turns(
        &self,
        conversation_id: &ConversationId,
        now: DateTime<Utc>,
    ) -> Result<i64>;

    /// Get a conversation's chat aggregate.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    async fn get_chat_aggregate(
        &self,
        conversation_id: &ConversationId,
    ) -> Result<Option<ChatAggregate>>;
}
