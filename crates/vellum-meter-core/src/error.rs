//! Error taxonomy for metering operations.

use chrono::{DateTime, Utc};

/// Result type for quota operations.
pub type Result<T> = std::result::Result<T, QuotaError>;

/// Errors a quota check can surface.
///
/// `Exceeded` is a normal business outcome — it is returned, never thrown
/// past the request boundary, and carries enough detail for the caller to
/// render an accurate message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    /// The identity's quota is spent. Recoverable; the caller shows an
    /// upgrade or wait prompt.
    #[error("quota exceeded: limit={limit}, used={used}")]
    Exceeded {
        /// The account's limit.
        limit: i64,
        /// Units consumed.
        used: i64,
        /// When the window resets; `None` for anonymous lifetime caps.
        reset_at: Option<DateTime<Utc>>,
    },

    /// Malformed identity reached the ledger. Programmer error; should not
    /// occur past identity resolution.
    #[error("invalid identity for quota accounting")]
    IdentityInvalid,

    /// A non-positive cost or amount reached the ledger. Programmer error;
    /// the request surface validates before calling.
    #[error("invalid cost: {cost}")]
    InvalidCost {
        /// The offending value.
        cost: i64,
    },

    /// The target account does not exist (refunds only; consumption
    /// creates accounts on first use).
    #[error("quota account not found: {0}")]
    AccountMissing(String),

    /// The storage layer failed. Callers retry with backoff; consumption is
    /// never silently allowed.
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
}

/// Errors from identity resolution.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    /// An auth token was present but could not be validated. Callers must
    /// treat this as anonymous, never as a hard failure, so a flaky auth
    /// provider cannot deny service.
    #[error("ambiguous identity: auth token present but not validatable")]
    Ambiguous,
}
