//! HTTP request handlers.

pub mod health;
pub mod quota;
pub mod sessions;
pub mod telemetry;
