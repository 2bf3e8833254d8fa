//! Router configuration.
//!
//! This module sets up the Axum router with all routes and middleware.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::{get, post};
use axum::Router;
use tower::limit::ConcurrencyLimitLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{health, quota, sessions, telemetry};
use crate::state::AppState;

/// Maximum concurrent requests for telemetry ingestion.
/// Beacon traffic is high volume; give it headroom but keep the
/// backend protected from overload.
const TELEMETRY_MAX_CONCURRENT_REQUESTS: usize = 100;

/// Maximum concurrent requests for general API endpoints.
const API_MAX_CONCURRENT_REQUESTS: usize = 50;

/// Create the service router with all routes and middleware.
///
/// # Routes
///
/// ## Public
/// - `GET /health` - Health check
///
/// ## Quota (identity resolved per request)
/// - `POST /v1/quota/consume` - Check and consume quota atomically
/// - `GET /v1/quota/status` - Read quota standing without consuming
/// - `POST /v1/quota/refund` - Return units (Service API Key auth)
/// - `POST /v1/quota/limit` - Change an account's allowance (Admin Key auth)
///
/// ## Telemetry (identity resolved per request, high volume)
/// - `POST /v1/telemetry` - Record one interaction
///
/// ## Sessions and conversations (read/lifecycle)
/// - `GET /v1/sessions/:id` - Session rollup snapshot
/// - `POST /v1/sessions/:id/end` - Close a session
/// - `GET /v1/conversations/:id` - Conversation chat aggregate
pub fn create_router(state: AppState) -> Router {
    // Extract config values before moving state
    let cors_origins = state.config.cors_origins.clone();
    let max_body_bytes = state.config.max_body_bytes;
    let request_timeout_seconds = state.config.request_timeout_seconds;

    let cors = build_cors_layer(&cors_origins);

    let state = Arc::new(state);

    // Telemetry carries beacon-level volume, so it is nested beside the
    // general API and gets its own concurrency budget. Nesting it inside
    // api_routes would cap it at the smaller API limit.
    let telemetry_routes = Router::new()
        .route("/", post(telemetry::record))
        .layer(ConcurrencyLimitLayer::new(TELEMETRY_MAX_CONCURRENT_REQUESTS));

    let api_routes = Router::new()
        // Quota
        .route("/quota/consume", post(quota::consume))
        .route("/quota/status", get(quota::status))
        .route("/quota/refund", post(quota::refund))
        .route("/quota/limit", post(quota::set_limit))
        // Sessions
        .route("/sessions/:id", get(sessions::get_session))
        .route("/sessions/:id/end", post(sessions::end_session))
        // Conversations
        .route("/conversations/:id", get(sessions::get_conversation))
        .layer(ConcurrencyLimitLayer::new(API_MAX_CONCURRENT_REQUESTS));

    Router::new()
        // Health (public, no rate limit)
        .route("/health", get(health::health))
        // API v1 routes (rate limited)
        .nest("/v1", api_routes)
        .nest("/v1/telemetry", telemetry_routes)
        // Global middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(RequestBodyLimitLayer::new(max_body_bytes))
        .layer(TimeoutLayer::new(Duration::from_secs(
            request_timeout_seconds,
        )))
        .with_state(state)
}

/// Build the CORS layer from configured origins.
fn build_cors_layer(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<_> = origins.iter().filter_map(|o| o.parse().ok()).collect();

        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
