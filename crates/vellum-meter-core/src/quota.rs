//! Quota accounts and status.
//!
//! A quota account is a counter plus a reset boundary per identity. The two
//! identity kinds carry physically different records that share one logical
//! contract, so each variant's invariants (monthly window vs. fixed lifetime
//! cap) stay locally enforceable.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};

/// A quota account, one per identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum QuotaAccount {
    /// An authenticated user's monthly-windowed account.
    Authenticated {
        /// Owning user.
        user_id: UserId,
        /// Units per window. Admin-configurable per subscription tier.
        limit: i64,
        /// Units consumed in the current window. Monotonic within a window;
        /// `used <= limit` holds after every successful consume.
        used: i64,
        /// Start of the next window. `None` means never used, no window yet.
        reset_at: Option<DateTime<Utc>>,
    },

    /// An anonymous visitor's account: a fixed lifetime cap, no window.
    ///
    /// The limit for anonymous identities is a single global constant and is
    /// deliberately not stored per account.
    Anonymous {
        /// Owning session.
        session_id: SessionId,
        /// Units consumed over the account's lifetime.
        used: i64,
        /// When the account was created (first consume attempt).
        created_at: DateTime<Utc>,
        /// When the account last consumed a unit. Drives inactivity pruning.
        last_used_at: DateTime<Utc>,
    },
}

impl QuotaAccount {
    /// Create a fresh authenticated account with nothing consumed yet.
    #[must_use]
    pub const fn new_authenticated(user_id: UserId, limit: i64) -> Self {
        Self::Authenticated {
            user_id,
            limit,
            used: 0,
            reset_at: None,
        }
    }

    /// Create a fresh anonymous account.
    #[must_use]
    pub const fn new_anonymous(session_id: SessionId, now: DateTime<Utc>) -> Self {
        Self::Anonymous {
            session_id,
            used: 0,
            created_at: now,
            last_used_at: now,
        }
    }

    /// Units consumed so far.
    #[must_use]
    pub const fn used(&self) -> i64 {
        match self {
            Self::Authenticated { used, .. } | Self::Anonymous { used, .. } => *used,
        }
    }

    /// The reset boundary, for windowed accounts.
    #[must_use]
    pub const fn reset_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Authenticated { reset_at, .. } => *reset_at,
            Self::Anonymous { .. } => None,
        }
    }

    /// Snapshot this account as a [`QuotaStatus`].
    ///
    /// `anonymous_limit` supplies the global cap for anonymous accounts; the
    /// authenticated variant carries its own limit.
    #[must_use]
    pub fn status(&self, anonymous_limit: i64) -> QuotaStatus {
        match self {
            Self::Authenticated {
                limit,
                used,
                reset_at,
                ..
            } => QuotaStatus {
                limit: *limit,
                used: *used,
                remaining: (*limit - *used).max(0),
                reset_at: *reset_at,
            },
            Self::Anonymous { used, .. } => QuotaStatus {
                limit: anonymous_limit,
                used: *used,
                remaining: (anonymous_limit - *used).max(0),
                reset_at: None,
            },
        }
    }
}

/// A read-only snapshot of a quota account.
///
/// Always carries `limit`, `used`, and `reset_at` so a caller can render an
/// accurate message; never a bare boolean.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaStatus {
    /// Units per window (or lifetime, for anonymous accounts).
    pub limit: i64,
    /// Units consumed.
    pub used: i64,
    /// Units left before the limit. Never negative.
    pub remaining: i64,
    /// Start of the next window, if one has been opened.
    pub reset_at: Option<DateTime<Utc>>,
}
