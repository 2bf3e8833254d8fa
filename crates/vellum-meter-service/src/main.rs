//! Vellum Meter Service - HTTP API for usage metering and session analytics
//!
//! This is the main entry point for the vellum-meter service.

use std::sync::Arc;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use vellum_meter_service::{create_router, AppState, ResetScheduler, ServiceConfig};
use vellum_meter_store::Store;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,vellum_meter=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Vellum Meter Service");

    // Load configuration from environment
    let config = ServiceConfig::from_env();

    tracing::info!(
        listen_addr = %config.listen_addr,
        auth_configured = %config.auth_secret.is_some(),
        window_policy = ?config.window_policy,
        sweep_interval_seconds = config.sweep_interval_seconds,
        "Service configuration loaded"
    );

    let store = build_store().await?;

    // Build app state
    let state = AppState::new(Arc::clone(&store), config.clone());

    // Start the background sweep (window resets + reconciliation)
    let scheduler = ResetScheduler::new(store, Arc::clone(&state.aggregator), &config);
    let sweep_handle = scheduler.spawn();
    tracing::info!("Background sweep started");

    // Create the router
    let app = create_router(state);
    tracing::info!("Router configured with all API endpoints");

    // Start HTTP server
    tracing::info!(listen_addr = %config.listen_addr, "Starting HTTP server");
    let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
    axum::serve(listener, app).await?;

    sweep_handle.abort();
    Ok(())
}

/// Pick the storage backend: PostgreSQL when compiled in and
/// `DATABASE_URL` is set, otherwise the in-memory store.
#[cfg(feature = "postgres-backend")]
async fn build_store() -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    if let Ok(url) = std::env::var("DATABASE_URL") {
        tracing::info!("Connecting to PostgreSQL store");
        let store = vellum_meter_store::PostgresStore::connect(&url).await?;
        store.migrate().await?;
        return Ok(Arc::new(store));
    }
    tracing::warn!("DATABASE_URL not set, using in-memory store (state is not durable)");
    Ok(Arc::new(vellum_meter_store::MemoryStore::new()))
}

/// In-memory store only; the PostgreSQL backend is not compiled in.
#[cfg(not(feature = "postgres-backend"))]
async fn build_store() -> Result<Arc<dyn Store>, Box<dyn std::error::Error>> {
    tracing::warn!("Using in-memory store (state is not durable)");
    Ok(Arc::new(vellum_meter_store::MemoryStore::new()))
}
