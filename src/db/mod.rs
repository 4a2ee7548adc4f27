//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: row types and view models returned by repositories.
//! - `repo`: SQL-only functions over `scheduled_events` and `delivery_attempts`.
//!
//! The repository API is re-exported at `care_reminders::db::*`.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{DeliveryState, DueBatch, FailedEvent, RecordOutcome, UpsertOutcome};
