//! Database schema definitions for the `PostgreSQL` backend.
//!
//! Authenticated and anonymous quota accounts are physically different
//! tables sharing one logical contract, mirroring the tagged
//! `QuotaAccount` variant.

/// Table and index DDL, applied idempotently at startup.
pub mod ddl {
    /// Authenticated quota accounts, keyed by `user_id`.
    /// `reset_at IS NULL` means the account has never opened a window.
    pub const USER_QUOTAS: &str = "\
CREATE TABLE IF NOT EXISTS user_quotas (
    user_id UUID PRIMARY KEY,
    quota_limit BIGINT NOT NULL,
    used BIGINT NOT NULL DEFAULT 0,
    reset_at TIMESTAMPTZ
)";

    /// Sweep index over due windows.
    pub const USER_QUOTAS_RESET_IDX: &str =
        "CREATE INDEX IF NOT EXISTS user_quotas_reset_idx ON user_quotas (reset_at)";

    /// Anonymous quota accounts, keyed by `session_id`. A lifetime cap, no
    /// window; `last_used_at` drives external inactivity pruning.
    pub const VISITOR_QUOTAS: &str = "\
CREATE TABLE IF NOT EXISTS visitor_quotas (
    session_id UUID PRIMARY KEY,
    used BIGINT NOT NULL DEFAULT 0,
    created_at TIMESTAMPTZ NOT NULL,
    last_used_at TIMESTAMPTZ NOT NULL
)";

    /// Session rows with their denormalized rollup counters.
    pub const SESSIONS: &str = "\
CREATE TABLE IF NOT EXISTS sessions (
    id UUID PRIMARY KEY,
    user_id UUID,
    started_at TIMESTAMPTZ NOT NULL,
    last_active_at TIMESTAMPTZ NOT NULL,
    ended_at TIMESTAMPTZ,
    page_views BIGINT NOT NULL DEFAULT 0,
    events_count BIGINT NOT NULL DEFAULT 0,
    bounce BOOLEAN NOT NULL DEFAULT FALSE,
    last_page_view TEXT
)";

    /// The append-only telemetry log, keyed by ULID (time-ordered).
    pub const TELEMETRY_RECORDS: &str = "\
CREATE TABLE IF NOT EXISTS telemetry_records (
    id TEXT PRIMARY KEY,
    session_id UUID NOT NULL,
    user_id UUID,
    kind TEXT NOT NULL,
    payload JSONB NOT NULL,
    recorded_at TIMESTAMPTZ NOT NULL,
    exit_page BOOLEAN
)";

    /// Reconciliation counts by session and kind.
    pub const TELEMETRY_RECORDS_SESSION_IDX: &str = "\
CREATE INDEX IF NOT EXISTS telemetry_records_session_idx
    ON telemetry_records (session_id, kind)";

    /// Per-conversation chat rollups.
    pub const CHAT_AGGREGATES: &str = "\
CREATE TABLE IF NOT EXISTS chat_aggregates (
    conversation_id UUID PRIMARY KEY,
    turns BIGINT NOT NULL DEFAULT 0,
    last_turn_at TIMESTAMPTZ NOT NULL
)";
}

/// All DDL statements in application order.
#[must_use]
pub fn all_statements() -> Vec<&'static str> {
    vec![
        ddl::USER_QUOTAS,
        ddl::USER_QUOTAS_RESET_IDX,
        ddl::VISITOR_QUOTAS,
        ddl::SESSIONS,
        ddl::TELEMETRY_RECORDS,
        ddl::TELEMETRY_RECORDS_SESSION_IDX,
        ddl::CHAT_AGGREGATES,
    ]
}
