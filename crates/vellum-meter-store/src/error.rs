//! Error types for metering storage.

use chrono::{DateTime, Utc};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The entity kind (session, account, record).
        entity: &'static str,
        /// The identifier that was not found.
        id: String,
    },

    /// The account has no quota left for the requested cost.
    ///
    /// Carries the account snapshot so the caller can render limit, usage,
    /// and the reset boundary. The account was not mutated.
    #[error("quota exceeded: limit={limit}, used={used}")]
    QuotaExceeded {
        /// The account's limit.
        limit: i64,
        /// Units already consumed.
        used: i64,
        /// When the window resets; `None` for anonymous accounts.
        reset_at: Option<DateTime<Utc>>,
    },

    /// A write was attempted against a session that has already ended.
    /// Ended sessions are never resurrected.
    #[error("session already ended: {session_id}")]
    SessionEnded {
        /// The ended session.
        session_id: String,
    },
}
