//! Identity resolution and authentication extractors.
//!
//! This module provides extractors for:
//! - `ResolvedIdentity` - classifies every request as an authenticated
//!   user or an anonymous visitor; never rejects
//! - `ServiceAuth` - service-to-service authentication via API key
//! - `AdminAuth` - admin authentication for privileged endpoints
//!
//! Identity resolution fails open: a malformed or expired bearer token
//! downgrades the caller to anonymous instead of producing a 401. Quota
//! enforcement downstream fails closed, so the downgrade only ever
//! moves a caller to the stricter anonymous allowance.

use std::net::IpAddr;
use std::sync::Arc;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use vellum_meter_core::{Identity, IdentityError, SessionId, UserId};

use crate::config::ServiceConfig;
use crate::error::ApiError;
use crate::state::AppState;

/// Cookie carrying the visitor session id.
pub const SESSION_COOKIE: &str = "vm_session";

/// The raw credential material extracted from a request, before
/// classification.
#[derive(Debug, Clone, Default)]
pub struct RequestCredentials<'a> {
    /// Bearer token from the `Authorization` header, if present.
    pub bearer: Option<&'a str>,
    /// Value of the session cookie, if present.
    pub session_cookie: Option<&'a str>,
    /// Client address from `X-Forwarded-For`, if parseable.
    pub client_ip: Option<IpAddr>,
}

/// Classify a request as authenticated or anonymous.
///
/// A present, valid bearer token yields `Identity::Authenticated`. An
/// absent token yields `Identity::Anonymous` keyed by the session
/// cookie (or a freshly minted session id when no cookie was sent). A
/// present but invalid token is an error; callers decide whether to
/// reject or downgrade.
pub fn resolve(
    credentials: &RequestCredentials<'_>,
    config: &ServiceConfig,
) -> Result<Identity, IdentityError> {
    let Some(token) = credentials.bearer else {
        return Ok(anonymous_identity(credentials));
    };

    // Allow test tokens in testing only.
    // This bypass is gated behind #[cfg(test)] or the "test-auth" feature
    // to ensure it is never active in production builds.
    #[cfg(any(test, feature = "test-auth"))]
    if let Some(user_id_str) = token.strip_prefix("test-token:") {
        let user_id = user_id_str
            .parse::<UserId>()
            .map_err(|_| IdentityError::Ambiguous)?;
        return Ok(Identity::Authenticated { user_id });
    }

    let Some(secret) = config.auth_secret.as_deref() else {
        tracing::debug!("bearer token presented but no auth secret configured");
        return Err(IdentityError::Ambiguous);
    };

    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[&config.auth_audience]);

    let key = DecodingKey::from_secret(secret.as_bytes());
    let token_data = decode::<JwtClaims>(token, &key, &validation).map_err(|e| {
        tracing::debug!(error = %e, "bearer token validation failed");
        IdentityError::Ambiguous
    })?;

    let user_id = token_data
        .claims
        .sub
        .parse::<UserId>()
        .map_err(|_| IdentityError::Ambiguous)?;

    Ok(Identity::Authenticated { user_id })
}

/// Build the anonymous identity for a request: reuse the session cookie
/// when one is present and well formed, otherwise mint a fresh session
/// id for this visitor.
fn anonymous_identity(credentials: &RequestCredentials<'_>) -> Identity {
    let session_id = credentials
        .session_cookie
        .and_then(|v| v.parse::<SessionId>().ok())
        .unwrap_or_else(SessionId::generate);

    Identity::Anonymous {
        session_id,
        ip_address: credentials.client_ip,
    }
}

/// The classified caller attached to every metered request.
#[derive(Debug, Clone)]
pub struct ResolvedIdentity(pub Identity);

impl FromRequestParts<Arc<AppState>> for ResolvedIdentity {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let credentials = credentials_from_parts(parts);

            let identity = match resolve(&credentials, &state.config) {
                Ok(identity) => identity,
                Err(IdentityError::Ambiguous) => {
                    // Fail open: an unverifiable token gets the anonymous
                    // allowance rather than a rejection.
                    tracing::debug!("unverifiable credentials, treating request as anonymous");
                    anonymous_identity(&credentials)
                }
            };

            Ok(ResolvedIdentity(identity))
        })
    }
}

/// Pull bearer token, session cookie, and client address out of the
/// request headers.
fn credentials_from_parts(parts: &Parts) -> RequestCredentials<'_> {
    let bearer = parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let session_cookie = parts
        .headers
        .get("cookie")
        .and_then(|v| v.to_str().ok())
        .and_then(extract_session_cookie);

    let client_ip = parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|v| v.trim().parse::<IpAddr>().ok());

    RequestCredentials {
        bearer,
        session_cookie,
        client_ip,
    }
}

/// Find the session cookie value in a `Cookie` header.
fn extract_session_cookie(header: &str) -> Option<&str> {
    header.split(';').find_map(|pair| {
        let (name, value) = pair.trim().split_once('=')?;
        (name == SESSION_COOKIE).then_some(value)
    })
}

/// Service authentication via API key.
///
/// Used for service-to-service requests (e.g., refunds issued by a
/// backend that failed mid-operation).
#[derive(Debug, Clone)]
pub struct ServiceAuth {
    /// The service name or identifier.
    pub service_name: String,
}

impl FromRequestParts<Arc<AppState>> for ServiceAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let api_key = parts
                .headers
                .get("x-api-key")
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;

            let expected_key = state
                .config
                .service_api_key
                .as_ref()
                .ok_or(ApiError::Unauthorized)?;

            if api_key != expected_key {
                return Err(ApiError::Unauthorized);
            }

            let service_name = parts
                .headers
                .get("x-service-name")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("unknown")
                .to_string();

            Ok(ServiceAuth { service_name })
        })
    }
}

/// Admin authentication via API key with admin scope.
///
/// Used for admin-only endpoints like changing an account's allowance.
/// Requires the `X-Admin-Key` header to match the configured admin key.
#[derive(Debug, Clone)]
pub struct AdminAuth {
    /// Admin identifier (for audit logging).
    pub admin_id: String,
}

impl FromRequestParts<Arc<AppState>> for AdminAuth {
    type Rejection = ApiError;

    fn from_request_parts<'life0, 'life1, 'async_trait>(
        parts: &'life0 mut Parts,
        state: &'life1 Arc<AppState>,
    ) -> ::core::pin::Pin<
        Box<
            dyn ::core::future::Future<Output = Result<Self, Self::Rejection>>
                + ::core::marker::Send
                + 'async_trait,
        >,
    >
    where
        'life0: 'async_trait,
        'life1: 'async_trait,
        Self: 'async_trait,
    {
        Box::pin(async move {
            let admin_key = parts
                .headers
                .get("x-admin-key")
                .and_then(|v| v.to_str().ok())
                .ok_or(ApiError::Unauthorized)?;

            let expected_key = state
                .config
                .admin_api_key
                .as_ref()
                .ok_or(ApiError::Unauthorized)?;

            if admin_key != expected_key {
                return Err(ApiError::Unauthorized);
            }

            let admin_id = parts
                .headers
                .get("x-admin-id")
                .and_then(|v| v.to_str().ok())
                .unwrap_or("admin")
                .to_string();

            tracing::info!(admin_id = %admin_id, "admin authenticated");

            Ok(AdminAuth { admin_id })
        })
    }
}

/// JWT claims carried by bearer tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID).
    pub sub: String,
    /// Audience.
    #[serde(default)]
    pub aud: Option<serde_json::Value>,
    /// Expiration time.
    pub exp: i64,
    /// Issued at.
    #[serde(default)]
    pub iat: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};

    fn test_config(secret: Option<&str>) -> ServiceConfig {
        ServiceConfig {
            auth_secret: secret.map(String::from),
            ..ServiceConfig::default()
        }
    }

    fn mint_token(secret: &str, sub: &str, aud: &str, exp: i64) -> String {
        let claims = serde_json::json!({
            "sub": sub,
            "aud": aud,
            "exp": exp,
            "iat": chrono::Utc::now().timestamp(),
        });
        encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap()
    }

    #[test]
    fn valid_token_resolves_authenticated() {
        let config = test_config(Some("s3cret"));
        let user_id = UserId::generate();
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = mint_token("s3cret", &user_id.to_string(), "vellum-meter", exp);

        let credentials = RequestCredentials {
            bearer: Some(&token),
            ..RequestCredentials::default()
        };
        let identity = resolve(&credentials, &config).unwrap();
        assert_eq!(identity.user_id(), Some(user_id));
    }

    #[test]
    fn expired_token_is_ambiguous() {
        let config = test_config(Some("s3cret"));
        let user_id = UserId::generate();
        let exp = chrono::Utc::now().timestamp() - 3600;
        let token = mint_token("s3cret", &user_id.to_string(), "vellum-meter", exp);

        let credentials = RequestCredentials {
            bearer: Some(&token),
            ..RequestCredentials::default()
        };
        assert!(resolve(&credentials, &config).is_err());
    }

    #[test]
    fn wrong_audience_is_ambiguous() {
        let config = test_config(Some("s3cret"));
        let user_id = UserId::generate();
        let exp = chrono::Utc::now().timestamp() + 3600;
        let token = mint_token("s3cret", &user_id.to_string(), "other-service", exp);

        let credentials = RequestCredentials {
            bearer: Some(&token),
            ..RequestCredentials::default()
        };
        assert!(resolve(&credentials, &config).is_err());
    }

    #[test]
    fn no_token_resolves_anonymous_from_cookie() {
        let config = test_config(None);
        let session_id = SessionId::generate();
        let cookie = session_id.to_string();

        let credentials = RequestCredentials {
            session_cookie: Some(&cookie),
            ..RequestCredentials::default()
        };
        let identity = resolve(&credentials, &config).unwrap();
        assert!(!identity.is_authenticated());
        assert_eq!(identity.session_id(), Some(session_id));
    }

    #[test]
    fn no_cookie_mints_fresh_session() {
        let config = test_config(None);
        let identity = resolve(&RequestCredentials::default(), &config).unwrap();
        assert!(!identity.is_authenticated());
        assert!(identity.session_id().is_some());
    }

    #[test]
    fn cookie_header_parsing() {
        let header = "theme=dark; vm_session=0191a2b3-0000-7000-8000-000000000000; lang=en";
        assert_eq!(
            extract_session_cookie(header),
            Some("0191a2b3-0000-7000-8000-000000000000")
        );
        assert_eq!(extract_session_cookie("theme=dark"), None);
    }
}
