//! Resolved request identity.
//!
//! Every metered request resolves to exactly one [`Identity`]: an
//! authenticated user id, or a session/IP pair for anonymous traffic.
//! Downstream components never branch on "is this user logged in"
//! directly; they consume only the resolved key.

use std::fmt;
use std::net::IpAddr;

use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};

/// The identity a request was attributed to.
///
/// Exactly one variant resolves per request, never both. Anonymous visitors
/// have no durable account; their ledger entry is keyed by session id alone.
/// The IP address is auxiliary (abuse heuristics only) and never part of the
/// key, since it is not stable across NATs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Identity {
    /// A validated, logged-in user.
    Authenticated {
        /// The user ID from the auth provider.
        user_id: UserId,
    },

    /// An anonymous visitor identified by their session cookie.
    Anonymous {
        /// The visitor's session ID.
        session_id: SessionId,
        /// Client IP, if known. Auxiliary only.
        ip_address: Option<IpAddr>,
    },
}

impl Identity {
    /// The ledger key this identity's quota is accounted under.
    #[must_use]
    pub fn ledger_key(&self) -> LedgerKey {
        match self {
            Self::Authenticated { user_id } => LedgerKey::User(*user_id),
            Self::Anonymous { session_id, .. } => LedgerKey::Visitor(*session_id),
        }
    }

    /// Whether this identity belongs to a logged-in user.
    #[must_use]
    pub const fn is_authenticated(&self) -> bool {
        matches!(self, Self::Authenticated { .. })
    }

    /// The user id, for authenticated identities.
    #[must_use]
    pub const fn user_id(&self) -> Option<UserId> {
        match self {
            Self::Authenticated { user_id } => Some(*user_id),
            Self::Anonymous { .. } => None,
        }
    }

    /// The session id, for anonymous identities.
    #[must_use]
    pub const fn session_id(&self) -> Option<SessionId> {
        match self {
            Self::Anonymous { session_id, .. } => Some(*session_id),
            Self::Authenticated { .. } => None,
        }
    }
}

/// The key a quota account is stored under.
///
/// User and visitor keys live in disjoint key spaces: consuming quota for an
/// anonymous session never touches any authenticated user's account, even if
/// the underlying UUIDs happen to coincide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LedgerKey {
    /// An authenticated user's account.
    User(UserId),
    /// An anonymous visitor's account.
    Visitor(SessionId),
}

impl fmt::Display for LedgerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::User(id) => write!(f, "user:{id}"),
            Self::Visitor(id) => write!(f, "visitor:{id}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ledger_keys_never_collide_across_kinds() {
        // Same underlying UUID, different identity kinds.
        let raw = uuid::Uuid::new_v4();
        let user = LedgerKey::User(UserId::from_uuid(raw));
        let visitor = LedgerKey::Visitor(SessionId::from_uuid(raw));
        assert_ne!(user, visitor);
        assert_ne!(user.to_string(), visitor.to_string());
    }

    #[test]
    fn identity_key_selection() {
        let user_id = UserId::generate();
        let auth = Identity::Authenticated { user_id };
        assert_eq!(auth.ledger_key(), LedgerKey::User(user_id));
        assert!(auth.is_authenticated());
        assert!(auth.session_id().is_none());

        let session_id = SessionId::generate();
        let anon = Identity::Anonymous {
            session_id,
            ip_address: None,
        };
        assert_eq!(anon.ledger_key(), LedgerKey::Visitor(session_id));
        assert_eq!(anon.session_id(), Some(session_id));
    }
}
