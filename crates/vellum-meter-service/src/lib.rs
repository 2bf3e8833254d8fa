//! Vellum Meter HTTP API Service.
//!
//! This crate provides the HTTP API for usage metering and session
//! analytics, including:
//!
//! - Atomic quota check-and-consume per identity
//! - Telemetry ingestion with per-session rollups
//! - Session lifecycle (idle close, explicit end)
//! - Background window resets and rollup reconciliation
//!
//! # Identity
//!
//! Every metered request is classified exactly once:
//!
//! 1. **Bearer tokens** - authenticated users, monthly windowed quota
//! 2. **Session cookie** - anonymous visitors, lifetime capped quota
//!
//! Classification fails open (an unverifiable token downgrades to
//! anonymous); quota enforcement fails closed.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
// Allow some pedantic lints that are noisy for Axum handler functions
#![allow(clippy::missing_errors_doc)] // Axum handlers all return Result
#![allow(clippy::unused_async)] // Handlers need async for consistency

pub mod aggregator;
pub mod config;
pub mod error;
pub mod handlers;
pub mod identity;
pub mod ledger;
pub mod reconcile;
pub mod routes;
pub mod scheduler;
pub mod state;

pub use aggregator::SessionAggregator;
pub use config::ServiceConfig;
pub use error::ApiError;
pub use ledger::QuotaLedger;
pub use routes::create_router;
pub use scheduler::ResetScheduler;
pub use state::AppState;
