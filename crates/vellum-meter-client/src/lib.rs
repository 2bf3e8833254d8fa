//! Vellum Meter Client SDK.
//!
//! This crate provides a client library for services to interact with
//! the vellum-meter API.
//!
//! # Example
//!
//! ```no_run
//! use vellum_meter_client::{MeterClient, TelemetryKind, TelemetryRequest};
//!
//! # async fn example() -> Result<(), vellum_meter_client::ClientError> {
//! let client = MeterClient::new("http://vellum-meter.metering.svc:8080");
//!
//! // Gate a chat turn on the caller's remaining quota
//! let status = client.consume_as_user("user-jwt", 1).await?;
//! println!("{} of {} units left", status.remaining, status.limit);
//!
//! // Forward the interaction to the analytics pipeline
//! client.record_telemetry(TelemetryRequest {
//!     session_id: None,
//!     kind: TelemetryKind::ChatTurn,
//!     conversation_id: Some("conversation-uuid".to_string()),
//!     payload: serde_json::json!({ "tokens": 420 }),
//! }).await?;
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

mod client;
mod error;
mod types;

pub use client::{ClientOptions, MeterClient};
pub use error::ClientError;
pub use types::*;
