#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Plume Shared Types
//!
//! Types and helpers used by every Plume crate: the subscription plan and
//! status enums, database pool construction, and the migrations runner.

mod db;
mod types;

pub use db::{create_migration_pool, create_pool, run_migrations};
pub use types::{Plan, SubscriptionStatus};
