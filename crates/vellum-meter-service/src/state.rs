//! Shared application state.

use std::sync::Arc;

use vellum_meter_store::Store;

use crate::aggregator::SessionAggregator;
use crate::config::ServiceConfig;
use crate::ledger::QuotaLedger;

/// Application state shared across all request handlers.
pub struct AppState {
    /// Storage backend.
    pub store: Arc<dyn Store>,
    /// Runtime configuration.
    pub config: ServiceConfig,
    /// Quota enforcement.
    pub ledger: QuotaLedger,
    /// Session telemetry ingestion and rollups.
    pub aggregator: Arc<SessionAggregator>,
}

impl AppState {
    /// Assemble the state from a storage backend and configuration.
    pub fn new(store: Arc<dyn Store>, config: ServiceConfig) -> Self {
        tracing::info!(
            window_policy = ?config.window_policy,
            default_user_limit = config.default_user_limit,
            anonymous_limit = config.anonymous_limit,
            idle_timeout_seconds = config.idle_timeout_seconds,
            "metering state initialized"
        );
        if config.auth_secret.is_none() {
            tracing::warn!("AUTH_SECRET not configured, all requests will be treated as anonymous");
        }
        if config.service_api_key.is_none() {
            tracing::warn!("SERVICE_API_KEY not configured, refund endpoint is disabled");
        }

        let ledger = QuotaLedger::new(Arc::clone(&store), &config);
        let aggregator = Arc::new(SessionAggregator::new(
            Arc::clone(&store),
            config.idle_timeout_seconds,
        ));

        Self {
            store,
            config,
            ledger,
            aggregator,
        }
    }
}
