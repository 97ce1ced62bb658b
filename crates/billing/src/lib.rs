// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Submeter Billing Engine
//!
//! Entitlement and usage accounting for versioned subscription plans.
//!
//! ## Features
//!
//! - **Plan Catalog**: Resolve the current published version of a plan and
//!   its feature allowances
//! - **Usage Metering**: Append-only consumption log with rolling reset
//!   windows
//! - **Extra Credits**: Expiring bonus grants, consumed oldest-first before
//!   the plan allowance
//! - **Entitlement Checks**: remaining / can-use / use with
//!   check-then-act atomicity per (subscription, feature)
//! - **Lifecycle**: activate, cancel, resume, renew, extend with derived
//!   (never stored) status
//! - **Invariants**: Runnable read-only consistency checks

pub mod credits;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod invariants;
pub mod period;
pub mod plans;
pub mod subscriptions;
pub mod usage;

#[cfg(test)]
mod edge_case_tests;

// Credits
pub use credits::{CreditLedger, FeatureCredit, GrantOptions};

// Entitlement
pub use entitlement::{CreditUsageStats, EntitlementEngine, Remaining};

// Error
pub use error::{BillingError, BillingResult, ErrorKind};

// Events
pub use events::{BillingEvent, BillingEventBuilder, BillingEventLogger, BillingEventType};

// Invariants
pub use invariants::{
    InvariantCheckSummary, InvariantChecker, InvariantViolation, ViolationSeverity,
};

// Period
pub use period::{plan_end_at, Period, ResetPeriod};

// Plans
pub use plans::{Feature, FeatureAllowance, FeatureOrder, Plan, PlanVersion, PlanVersionAccessor};

// Subscriptions
pub use subscriptions::{
    status_at, SubscribeOptions, Subscription, SubscriptionLifecycle, SubscriptionOrder,
};

// Usage
pub use usage::{FeatureUsage, NextAvailability, UsageLedger};

use sqlx::PgPool;

/// Main billing service that combines all billing functionality
pub struct BillingService {
    pub plans: PlanVersionAccessor,
    pub usage: UsageLedger,
    pub credits: CreditLedger,
    pub entitlement: EntitlementEngine,
    pub subscriptions: SubscriptionLifecycle,
    pub invariants: InvariantChecker,
    pub events: BillingEventLogger,
}

impl BillingService {
    /// Create a new billing service over a connection pool
    pub fn new(pool: PgPool) -> Self {
        Self {
            plans: PlanVersionAccessor::new(pool.clone()),
            usage: UsageLedger::new(pool.clone()),
            credits: CreditLedger::new(pool.clone()),
            entitlement: EntitlementEngine::new(pool.clone()),
            subscriptions: SubscriptionLifecycle::new(pool.clone()),
            invariants: InvariantChecker::new(pool.clone()),
            events: BillingEventLogger::new(pool),
        }
    }
}
