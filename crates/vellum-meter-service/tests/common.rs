//! Common test utilities for vellum-meter integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::Arc;

use axum::Router;
use axum_test::TestServer;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};

use vellum_meter_core::{SessionId, UserId};
use vellum_meter_service::{create_router, AppState, ServiceConfig};
use vellum_meter_store::MemoryStore;

/// HMAC secret shared between the harness and the service under test.
pub const TEST_AUTH_SECRET: &str = "test-secret";

/// Test harness containing everything needed for integration tests.
pub struct TestHarness {
    /// The test server for making HTTP requests.
    pub server: TestServer,
    /// A test user ID for authenticated requests.
    pub test_user_id: UserId,
    /// The service API key for service-to-service requests.
    pub service_api_key: String,
    /// The admin API key for privileged requests.
    pub admin_api_key: String,
}

impl TestHarness {
    /// Create a new test harness with a fresh in-memory store.
    pub fn new() -> Self {
        Self::with_config_tweak(|_| {})
    }

    /// Create a harness with the default test configuration adjusted.
    pub fn with_config_tweak(tweak: impl FnOnce(&mut ServiceConfig)) -> Self {
        let service_api_key = "test-service-key".to_string();
        let admin_api_key = "test-admin-key".to_string();

        let mut config = ServiceConfig {
            listen_addr: "127.0.0.1:0".into(),
            auth_secret: Some(TEST_AUTH_SECRET.into()),
            service_api_key: Some(service_api_key.clone()),
            admin_api_key: Some(admin_api_key.clone()),
            default_user_limit: 10,
            anonymous_limit: 3,
            cors_origins: vec!["*".into()],
            ..ServiceConfig::default()
        };
        tweak(&mut config);

        let state = AppState::new(Arc::new(MemoryStore::new()), config);
        let router: Router = create_router(state);

        let server = TestServer::new(router).expect("Failed to create test server");
        let test_user_id = UserId::generate();

        Self {
            server,
            test_user_id,
            service_api_key,
            admin_api_key,
        }
    }

    /// Get the authorization header for the harness's test user.
    pub fn user_auth_header(&self) -> String {
        Self::auth_header_for(self.test_user_id)
    }

    /// Get an authorization header for an arbitrary user (for testing
    /// isolation).
    pub fn auth_header_for(user_id: UserId) -> String {
        format!("Bearer {}", mint_token(user_id))
    }

    /// Get a cookie header pinning the visitor session.
    pub fn session_cookie_header(session_id: SessionId) -> String {
        format!("vm_session={session_id}")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Mint a valid HS256 bearer token for a user.
pub fn mint_token(user_id: UserId) -> String {
    let now = chrono::Utc::now().timestamp();
    let claims = serde_json::json!({
        "sub": user_id.to_string(),
        "aud": "vellum-meter",
        "iat": now,
        "exp": now + 3600,
    });
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(TEST_AUTH_SECRET.as_bytes()),
    )
    .expect("Failed to mint test token")
}
