// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Shared domain types for Submeter
//!
//! Types used by both the billing engine and the background worker.
//! This crate is pure data: serde/sqlx derives only, no I/O.

pub mod types;

pub use types::{
    Allowance, EntityRef, FeatureKind, ParseAllowanceError, SubscriptionStatus, UNLIMITED_VALUE,
};
