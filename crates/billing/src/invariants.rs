//! Billing Invariants Module
//!
//! Provides runnable consistency checks for the entitlement data.
//! These invariants can be run after any mutation or batch job to ensure
//! the system is in a valid state.
//!
//! ## Design Principles
//!
//! 1. **Executable**: Each invariant is a real SQL query that can be run
//! 2. **Explanatory**: Violations include enough context to debug
//! 3. **Non-destructive**: Checks only read, never write

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// Result of running a single invariant check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated
    pub invariant: String,
    /// Row(s) affected
    pub affected_ids: Vec<Uuid>,
    /// Human-readable description of the violation
    pub description: String,
    /// Additional context for debugging
    pub context: serde_json::Value,
    /// Severity level
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Critical - balances may be computed incorrectly
    Critical,
    /// High - data inconsistency that needs attention
    High,
    /// Medium - potential issue, should investigate
    Medium,
    /// Low - minor inconsistency, informational
    Low,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
            ViolationSeverity::Low => write!(f, "LOW"),
        }
    }
}

/// Summary of all invariant checks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    /// When the check was run
    pub checked_at: OffsetDateTime,
    /// Total number of checks run
    pub checks_run: usize,
    /// Number of checks that passed
    pub checks_passed: usize,
    /// Number of checks that failed
    pub checks_failed: usize,
    /// List of all violations found
    pub violations: Vec<InvariantViolation>,
    /// Overall health status
    pub healthy: bool,
}

/// Row type for negative credit violation
#[derive(Debug, sqlx::FromRow)]
struct NegativeCreditRow {
    credit_id: Uuid,
    subscription_id: Uuid,
    credits: f64,
}

/// Row type for duplicate renewal violation
#[derive(Debug, sqlx::FromRow)]
struct DuplicateRenewalRow {
    renewed_from_id: Uuid,
    renewal_count: i64,
}

/// Row type for cancelled-without-end-date violation
#[derive(Debug, sqlx::FromRow)]
struct CancelledNoEndRow {
    subscription_id: Uuid,
    cancelled_at: Option<OffsetDateTime>,
}

/// Row type for valueless consumable violation
#[derive(Debug, sqlx::FromRow)]
struct ValuelessConsumableRow {
    plan_feature_id: Uuid,
    feature_slug: String,
    plan_version_id: Uuid,
}

/// Row type for unpublished version reference violation
#[derive(Debug, sqlx::FromRow)]
struct UnpublishedVersionRow {
    subscription_id: Uuid,
    plan_version_id: Uuid,
}

/// Row type for out-of-plan usage violation
#[derive(Debug, sqlx::FromRow)]
struct StrayUsageRow {
    usage_id: Uuid,
    subscription_id: Uuid,
    feature_id: Uuid,
}

/// Service for running billing invariant checks
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return summary
    pub async fn run_all_checks(&self) -> BillingResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_credits_non_negative().await?);
        violations.extend(self.check_single_forward_renewal().await?);
        violations.extend(self.check_cancelled_has_end_date().await?);
        violations.extend(self.check_consumables_have_values().await?);
        violations.extend(self.check_versions_published().await?);
        violations.extend(self.check_usage_within_plan().await?);

        let checks_run = 6;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: No credit row ever holds a negative balance
    ///
    /// Consumption decrements rows by at most their own balance and deletes
    /// exhausted rows; a negative balance means over-consumption happened.
    async fn check_credits_non_negative(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<NegativeCreditRow> = sqlx::query_as(
            r#"
            SELECT id as credit_id, subscription_id, credits
            FROM subscription_feature_credits
            WHERE credits < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "credits_non_negative".to_string(),
                affected_ids: vec![row.credit_id],
                description: format!(
                    "Credit row holds negative balance {} (subscription {})",
                    row.credits, row.subscription_id
                ),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "credits": row.credits,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: At most one forward renewal per subscription
    ///
    /// Two subscriptions pointing at the same `renewed_from_id` means the
    /// renewal guard was bypassed and the subscriber is double-subscribed.
    async fn check_single_forward_renewal(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<DuplicateRenewalRow> = sqlx::query_as(
            r#"
            SELECT renewed_from_id, COUNT(*) as renewal_count
            FROM subscriptions
            WHERE renewed_from_id IS NOT NULL
            GROUP BY renewed_from_id
            HAVING COUNT(*) > 1
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "single_forward_renewal".to_string(),
                affected_ids: vec![row.renewed_from_id],
                description: format!(
                    "Subscription has {} forward renewals (expected at most 1)",
                    row.renewal_count
                ),
                context: serde_json::json!({
                    "renewal_count": row.renewal_count,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 3: Cancelled subscriptions carry an end date
    ///
    /// `cancel` always fills `end_at`; a cancelled row without one would
    /// never expire.
    async fn check_cancelled_has_end_date(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<CancelledNoEndRow> = sqlx::query_as(
            r#"
            SELECT id as subscription_id, cancelled_at
            FROM subscriptions
            WHERE cancelled_at IS NOT NULL
              AND end_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "cancelled_has_end_date".to_string(),
                affected_ids: vec![row.subscription_id],
                description: "Cancelled subscription has no end date".to_string(),
                context: serde_json::json!({
                    "cancelled_at": row.cancelled_at.map(|t| t.to_string()),
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: Consumable plan features carry a value
    ///
    /// A consumable allowance without a value cannot be balance-checked.
    async fn check_consumables_have_values(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<ValuelessConsumableRow> = sqlx::query_as(
            r#"
            SELECT
                pf.id as plan_feature_id,
                f.slug as feature_slug,
                pf.plan_version_id
            FROM plan_features pf
            JOIN features f ON f.id = pf.feature_id
            WHERE f.kind = 'consumable'
              AND pf.value IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "consumables_have_values".to_string(),
                affected_ids: vec![row.plan_feature_id],
                description: format!(
                    "Consumable feature '{}' has no allowance value in version {}",
                    row.feature_slug, row.plan_version_id
                ),
                context: serde_json::json!({
                    "feature_slug": row.feature_slug,
                    "plan_version_id": row.plan_version_id,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: Subscriptions reference published plan versions
    async fn check_versions_published(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<UnpublishedVersionRow> = sqlx::query_as(
            r#"
            SELECT s.id as subscription_id, s.plan_version_id
            FROM subscriptions s
            JOIN plan_versions v ON v.id = s.plan_version_id
            WHERE v.published_at IS NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "versions_published".to_string(),
                affected_ids: vec![row.subscription_id],
                description: format!(
                    "Subscription references unpublished plan version {}",
                    row.plan_version_id
                ),
                context: serde_json::json!({
                    "plan_version_id": row.plan_version_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 6: Usage rows reference features present in the
    /// subscription's plan version
    async fn check_usage_within_plan(&self) -> BillingResult<Vec<InvariantViolation>> {
        let rows: Vec<StrayUsageRow> = sqlx::query_as(
            r#"
            SELECT u.id as usage_id, u.subscription_id, u.feature_id
            FROM subscription_feature_usage u
            JOIN subscriptions s ON s.id = u.subscription_id
            WHERE NOT EXISTS (
                SELECT 1 FROM plan_features pf
                WHERE pf.plan_version_id = s.plan_version_id
                  AND pf.feature_id = u.feature_id
            )
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "usage_within_plan".to_string(),
                affected_ids: vec![row.usage_id],
                description: "Usage event references a feature outside the plan version"
                    .to_string(),
                context: serde_json::json!({
                    "subscription_id": row.subscription_id,
                    "feature_id": row.feature_id,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Run a single invariant check by name
    pub async fn run_check(&self, name: &str) -> BillingResult<Vec<InvariantViolation>> {
        match name {
            "credits_non_negative" => self.check_credits_non_negative().await,
            "single_forward_renewal" => self.check_single_forward_renewal().await,
            "cancelled_has_end_date" => self.check_cancelled_has_end_date().await,
            "consumables_have_values" => self.check_consumables_have_values().await,
            "versions_published" => self.check_versions_published().await,
            "usage_within_plan" => self.check_usage_within_plan().await,
            _ => Ok(vec![]),
        }
    }

    /// Get list of all available invariant checks
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "credits_non_negative",
            "single_forward_renewal",
            "cancelled_has_end_date",
            "consumables_have_values",
            "versions_published",
            "usage_within_plan",
        ]
    }
}
