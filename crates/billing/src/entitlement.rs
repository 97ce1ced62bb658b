//! Entitlement engine
//!
//! Answers "how much remains", "can this be used", and "use it" for a
//! subscription and feature, applying the credits-first consumption policy.
//! The engine holds no state of its own: it orchestrates the plan catalog,
//! the usage ledger, and the credit ledger.
//!
//! ## Design Principles
//!
//! 1. **Deterministic**: the balance arithmetic is a pure function over
//!    (allowance, credit balance, usage sum)
//! 2. **Atomic**: `use_feature` re-checks and mutates inside one
//!    transaction under a per-(subscription, feature) lock, so two
//!    concurrent requests cannot both pass the check
//! 3. **Gross usage log**: credits offset the computed balance, never the
//!    usage history

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use submeter_shared::Allowance;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::credits::{consume_in, credit_balance, lock_pair};
use crate::error::{BillingError, BillingResult};
use crate::plans::{fetch_allowance, FeatureAllowance};
use crate::subscriptions::{fetch_subscription, Subscription};
use crate::usage::{
    insert_usage, next_available_from, oldest_usage_at, usage_total, window_cutoff, FeatureUsage,
    NextAvailability,
};

/// Remaining quantity of a consumable feature
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remaining {
    Unlimited,
    Amount(f64),
}

impl Remaining {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// Whether this balance covers `amount`
    pub fn allows(&self, amount: f64) -> bool {
        match self {
            Remaining::Unlimited => true,
            Remaining::Amount(remaining) => *remaining >= amount,
        }
    }
}

/// Pure balance arithmetic: allowance plus credits minus usage.
pub(crate) fn compute_remaining(allowance: Allowance, extra_credits: f64, used: f64) -> Remaining {
    match allowance {
        Allowance::Unlimited => Remaining::Unlimited,
        Allowance::Limited(limit) => Remaining::Amount(limit + extra_credits - used),
    }
}

/// Credit/usage breakdown for one feature
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreditUsageStats {
    pub plan_limit: Allowance,
    pub extra_credits: f64,
    pub total_available: Allowance,
    pub used: f64,
    /// Floored at 0
    pub remaining: Allowance,
}

impl CreditUsageStats {
    fn zeroed() -> Self {
        Self {
            plan_limit: Allowance::Limited(0.0),
            extra_credits: 0.0,
            total_available: Allowance::Limited(0.0),
            used: 0.0,
            remaining: Allowance::Limited(0.0),
        }
    }
}

/// Pure stats assembly; `remaining` floors at 0.
pub(crate) fn compute_stats(plan_limit: Allowance, extra_credits: f64, used: f64) -> CreditUsageStats {
    match plan_limit {
        Allowance::Unlimited => CreditUsageStats {
            plan_limit: Allowance::Unlimited,
            extra_credits,
            total_available: Allowance::Unlimited,
            used,
            remaining: Allowance::Unlimited,
        },
        Allowance::Limited(limit) => {
            let total = limit + extra_credits;
            CreditUsageStats {
                plan_limit: Allowance::Limited(limit),
                extra_credits,
                total_available: Allowance::Limited(total),
                used,
                remaining: Allowance::Limited((total - used).max(0.0)),
            }
        }
    }
}

/// State-free entitlement orchestrator
pub struct EntitlementEngine {
    pool: PgPool,
}

impl EntitlementEngine {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Remaining usable quantity for a feature.
    ///
    /// Unlimited allowances stay unlimited regardless of credits or usage
    /// history. Errors when the feature is absent from the plan version or
    /// not consumable.
    pub async fn remaining(
        &self,
        subscription_id: Uuid,
        feature_slug: &str,
        include_credits: bool,
    ) -> BillingResult<Remaining> {
        let mut conn = self.pool.acquire().await?;
        let (subscription, allowance) =
            load_context(&mut conn, subscription_id, feature_slug).await?;

        remaining_in(&mut conn, &subscription, &allowance, include_credits).await
    }

    /// Whether `amount` can be drawn from the feature right now.
    ///
    /// False for inactive subscriptions and non-consumable features; errors
    /// on non-positive amounts and features absent from the plan.
    pub async fn can_use(
        &self,
        subscription_id: Uuid,
        feature_slug: &str,
        amount: f64,
        include_credits: bool,
    ) -> BillingResult<bool> {
        if amount <= 0.0 {
            return Err(BillingError::InvalidAmount(amount));
        }

        let mut conn = self.pool.acquire().await?;
        let (subscription, allowance) =
            load_context(&mut conn, subscription_id, feature_slug).await?;

        if !subscription.is_active_at(OffsetDateTime::now_utc()) {
            return Ok(false);
        }

        // Non-consumables are binary access gates, never amount-checked
        if !allowance.is_consumable() {
            return Ok(false);
        }

        let remaining = remaining_in(&mut conn, &subscription, &allowance, include_credits).await?;

        Ok(remaining.allows(amount))
    }

    /// Consume `amount` of the feature.
    ///
    /// Check-then-act runs inside one transaction holding the
    /// per-(subscription, feature) advisory lock. With `use_credits`, extra
    /// credits are depleted oldest-first before the plan allowance; the
    /// usage ledger records the gross amount either way.
    pub async fn use_feature(
        &self,
        subscription_id: Uuid,
        feature_slug: &str,
        amount: f64,
        use_credits: bool,
    ) -> BillingResult<FeatureUsage> {
        if amount <= 0.0 {
            return Err(BillingError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;

        let (subscription, allowance) = load_context(&mut tx, subscription_id, feature_slug).await?;
        lock_pair(&mut tx, subscription_id, allowance.feature_id).await?;

        if !subscription.is_active_at(OffsetDateTime::now_utc()) || !allowance.is_consumable() {
            return Err(BillingError::CannotUseFeature(feature_slug.to_string()));
        }

        let remaining = remaining_in(&mut tx, &subscription, &allowance, use_credits).await?;
        if !remaining.allows(amount) {
            return Err(BillingError::CannotUseFeature(feature_slug.to_string()));
        }

        if use_credits {
            consume_in(&mut tx, subscription_id, allowance.feature_id, amount).await?;
        }

        let usage = insert_usage(&mut tx, subscription_id, allowance.feature_id, amount).await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            feature = %feature_slug,
            amount = amount,
            use_credits = use_credits,
            "Used feature"
        );

        Ok(usage)
    }

    /// Whether the subscription's plan version carries the feature at all.
    pub async fn has_feature(
        &self,
        subscription_id: Uuid,
        feature_slug: &str,
    ) -> BillingResult<bool> {
        let mut conn = self.pool.acquire().await?;

        let subscription = fetch_subscription(&mut conn, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        let allowance =
            fetch_allowance(&mut conn, subscription.plan_version_id, feature_slug).await?;

        Ok(allowance.is_some())
    }

    /// Credit/usage breakdown. Zeroed stats for features that are missing
    /// from the plan or non-consumable.
    pub async fn credit_usage_stats(
        &self,
        subscription_id: Uuid,
        feature_slug: &str,
    ) -> BillingResult<CreditUsageStats> {
        let mut conn = self.pool.acquire().await?;

        let subscription = fetch_subscription(&mut conn, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        let allowance =
            fetch_allowance(&mut conn, subscription.plan_version_id, feature_slug).await?;

        let Some(allowance) = allowance else {
            return Ok(CreditUsageStats::zeroed());
        };
        if !allowance.is_consumable() {
            return Ok(CreditUsageStats::zeroed());
        }

        let extra =
            credit_balance(&mut conn, subscription_id, allowance.feature_id).await?;
        let used = usage_total(
            &mut conn,
            subscription_id,
            allowance.feature_id,
            allowance.reset(),
        )
        .await?;

        Ok(compute_stats(allowance.allowance_or_zero(), extra, used))
    }

    /// When the feature next becomes usable for this subscription.
    pub async fn next_available_at(
        &self,
        subscription_id: Uuid,
        feature_slug: &str,
    ) -> BillingResult<NextAvailability> {
        let mut conn = self.pool.acquire().await?;
        let (_, allowance) = load_context(&mut conn, subscription_id, feature_slug).await?;

        let unlimited = allowance.is_unlimited();
        let reset = allowance.reset();
        let now = OffsetDateTime::now_utc();

        if unlimited || reset.is_none() {
            return Ok(next_available_from(unlimited, reset, None, now));
        }

        let oldest = oldest_usage_at(
            &mut conn,
            subscription_id,
            allowance.feature_id,
            window_cutoff(reset, now),
        )
        .await?;

        Ok(next_available_from(unlimited, reset, oldest, now))
    }
}

/// Resolve the subscription and the feature's allowance in its plan version.
async fn load_context(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    feature_slug: &str,
) -> BillingResult<(Subscription, FeatureAllowance)> {
    let subscription = fetch_subscription(conn, subscription_id)
        .await?
        .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

    let allowance = fetch_allowance(conn, subscription.plan_version_id, feature_slug)
        .await?
        .ok_or_else(|| BillingError::FeatureNotInPlan(feature_slug.to_string()))?;

    Ok((subscription, allowance))
}

/// Remaining balance inside an existing connection/transaction.
async fn remaining_in(
    conn: &mut PgConnection,
    subscription: &Subscription,
    allowance: &FeatureAllowance,
    include_credits: bool,
) -> BillingResult<Remaining> {
    let parsed = allowance.allowance()?;

    if parsed.is_unlimited() {
        return Ok(Remaining::Unlimited);
    }

    let extra = if include_credits {
        credit_balance(conn, subscription.id, allowance.feature_id).await?
    } else {
        0.0
    };

    let used = usage_total(
        conn,
        subscription.id,
        allowance.feature_id,
        allowance.reset(),
    )
    .await?;

    Ok(compute_remaining(parsed, extra, used))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_ignores_credits_and_usage() {
        assert_eq!(
            compute_remaining(Allowance::Unlimited, 1000.0, 999_999.0),
            Remaining::Unlimited
        );
    }

    #[test]
    fn test_remaining_subtracts_usage() {
        assert_eq!(
            compute_remaining(Allowance::Limited(50.0), 0.0, 20.0),
            Remaining::Amount(30.0)
        );
    }

    #[test]
    fn test_credits_extend_the_allowance() {
        // allowance 50 + credits 10 - usage 55 = 5 left, funded by credits
        assert_eq!(
            compute_remaining(Allowance::Limited(50.0), 10.0, 55.0),
            Remaining::Amount(5.0)
        );
    }

    #[test]
    fn test_allows_boundary() {
        let remaining = Remaining::Amount(30.0);
        assert!(remaining.allows(30.0));
        assert!(!remaining.allows(31.0));
        assert!(Remaining::Unlimited.allows(f64::MAX));
    }

    #[test]
    fn test_stats_floor_remaining_at_zero() {
        let stats = compute_stats(Allowance::Limited(50.0), 0.0, 80.0);
        assert_eq!(stats.remaining, Allowance::Limited(0.0));
        assert_eq!(stats.used, 80.0);
        assert_eq!(stats.total_available, Allowance::Limited(50.0));
    }

    #[test]
    fn test_stats_unlimited_are_unlimited_throughout() {
        let stats = compute_stats(Allowance::Unlimited, 25.0, 10.0);
        assert_eq!(stats.plan_limit, Allowance::Unlimited);
        assert_eq!(stats.total_available, Allowance::Unlimited);
        assert_eq!(stats.remaining, Allowance::Unlimited);
        assert_eq!(stats.extra_credits, 25.0);
        assert_eq!(stats.used, 10.0);
    }

    #[test]
    fn test_stats_total_includes_credits() {
        let stats = compute_stats(Allowance::Limited(50.0), 10.0, 55.0);
        assert_eq!(stats.total_available, Allowance::Limited(60.0));
        assert_eq!(stats.remaining, Allowance::Limited(5.0));
    }
}
