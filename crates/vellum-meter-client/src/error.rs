//! Client error types.

use chrono::{DateTime, Utc};

/// Errors that can occur when using the vellum-meter client.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server returned an error response.
    #[error("API error: {code} - {message}")]
    Api {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
        /// HTTP status code.
        status: u16,
    },

    /// The caller's quota allowance is exhausted.
    #[error("quota exceeded: {used}/{limit}")]
    QuotaExceeded {
        /// Allowance for the current window.
        limit: i64,
        /// Units already consumed.
        used: i64,
        /// When the allowance replenishes, if it ever does.
        reset_at: Option<DateTime<Utc>>,
    },

    /// Session not found.
    #[error("session not found: {session_id}")]
    SessionNotFound {
        /// The session ID.
        session_id: String,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Configuration(String),
}
