//! Core types for the Vellum usage metering subsystem.
//!
//! This crate provides the foundational types shared by the quota ledger,
//! session aggregator, and their storage layer:
//!
//! - **Identifiers**: [`UserId`], [`SessionId`], [`ConversationId`], [`RecordId`]
//! - **Identity**: [`Identity`], [`LedgerKey`]
//! - **Quota**: [`QuotaAccount`], [`QuotaStatus`], [`WindowPolicy`]
//! - **Analytics**: [`Session`], [`TelemetryRecord`], [`ChatAggregate`]
//! - **Errors**: [`QuotaError`], [`IdentityError`]
//!
//! # Units
//!
//! Quota is counted in whole generation units stored as `i64`. One unit is
//! one AI-generation operation; batched operations may charge more than one
//! unit atomically via the `cost` argument.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod identity;
pub mod ids;
pub mod quota;
pub mod session;
pub mod window;

pub use error::{IdentityError, QuotaError, Result};
pub use identity::{Identity, LedgerKey};
pub use ids::{ConversationId, IdError, RecordId, SessionId, UserId};
pub use quota::{QuotaAccount, QuotaStatus};
pub use session::{ChatAggregate, Session, TelemetryKind, TelemetryRecord};
pub use window::{next_reset, WindowPolicy};
