//! Usage ledger
//!
//! Append-only log of consumption events per (subscription, feature).
//! Events record gross consumption: credits offset the computed balance,
//! never the log, so period reporting always reflects what was actually
//! used. Events are never updated; retention cleanup is the only deleter.

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::period::ResetPeriod;
use crate::plans::{fetch_allowance, FeatureAllowance};
use crate::subscriptions::fetch_subscription;

/// One consumption event
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeatureUsage {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub feature_id: Uuid,
    pub value: f64,
    pub created_at: OffsetDateTime,
}

/// When a feature next becomes usable again
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NextAvailability {
    /// No usage restriction at all
    Unlimited,
    /// One-time allowance, no reset period configured
    Never,
    /// The window rolls over at this instant
    At(OffsetDateTime),
}

/// Pure core of `next_available_at`: the oldest event in the current window
/// plus the reset period, or now when the window is empty.
pub(crate) fn next_available_from(
    unlimited: bool,
    reset: Option<ResetPeriod>,
    oldest_in_window: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> NextAvailability {
    if unlimited {
        return NextAvailability::Unlimited;
    }
    let Some(reset) = reset else {
        return NextAvailability::Never;
    };
    match oldest_in_window {
        Some(oldest) => NextAvailability::At(oldest + reset.duration()),
        None => NextAvailability::At(now),
    }
}

/// Append-only usage log per (subscription, feature)
pub struct UsageLedger {
    pool: PgPool,
}

impl UsageLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Append one immutable event.
    ///
    /// This is the raw, unchecked append; the balance-aware path is
    /// `EntitlementEngine::use_feature`. Still refuses features that are
    /// absent from the subscription's plan version or non-consumable.
    pub async fn record_usage(
        &self,
        subscription_id: Uuid,
        feature_slug: &str,
        amount: f64,
    ) -> BillingResult<FeatureUsage> {
        if amount <= 0.0 {
            return Err(BillingError::InvalidAmount(amount));
        }

        let mut conn = self.pool.acquire().await?;

        let subscription = fetch_subscription(&mut conn, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        let allowance = fetch_allowance(&mut conn, subscription.plan_version_id, feature_slug)
            .await?
            .ok_or_else(|| BillingError::FeatureNotInPlan(feature_slug.to_string()))?;

        if !allowance.is_consumable() {
            return Err(BillingError::NotConsumable(feature_slug.to_string()));
        }

        let usage = insert_usage(&mut conn, subscription_id, allowance.feature_id, amount).await?;

        tracing::debug!(
            subscription_id = %subscription_id,
            feature = %feature_slug,
            amount = amount,
            "Recorded feature usage"
        );

        Ok(usage)
    }

    /// Events inside the reset window; all history when no window is set.
    pub async fn usage_in_period(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
        reset: Option<ResetPeriod>,
    ) -> BillingResult<Vec<FeatureUsage>> {
        let cutoff = window_cutoff(reset, OffsetDateTime::now_utc());

        let events: Vec<FeatureUsage> = sqlx::query_as(
            "SELECT id, subscription_id, feature_id, value, created_at
             FROM subscription_feature_usage
             WHERE subscription_id = $1
               AND feature_id = $2
               AND ($3::timestamptz IS NULL OR created_at >= $3)
             ORDER BY created_at ASC",
        )
        .bind(subscription_id)
        .bind(feature_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    /// Sum of event values in the window, 0 when empty.
    pub async fn total_usage_in_period(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
        reset: Option<ResetPeriod>,
    ) -> BillingResult<f64> {
        let mut conn = self.pool.acquire().await?;
        usage_total(&mut conn, subscription_id, feature_id, reset).await
    }

    /// When the feature next becomes usable for this subscription.
    pub async fn next_available_at(
        &self,
        subscription_id: Uuid,
        allowance: &FeatureAllowance,
    ) -> BillingResult<NextAvailability> {
        let unlimited = allowance.is_unlimited();
        let reset = allowance.reset();

        if unlimited || reset.is_none() {
            return Ok(next_available_from(unlimited, reset, None, OffsetDateTime::now_utc()));
        }

        let now = OffsetDateTime::now_utc();
        let mut conn = self.pool.acquire().await?;
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

/// Lower bound of the current window, None for lifetime usage.
pub(crate) fn window_cutoff(
    reset: Option<ResetPeriod>,
    now: OffsetDateTime,
) -> Option<OffsetDateTime> {
    reset.map(|period| now - period.duration())
}

pub(crate) async fn insert_usage(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    feature_id: Uuid,
    value: f64,
) -> BillingResult<FeatureUsage> {
    let usage: FeatureUsage = sqlx::query_as(
        "INSERT INTO subscription_feature_usage (subscription_id, feature_id, value)
         VALUES ($1, $2, $3)
         RETURNING id, subscription_id, feature_id, value, created_at",
    )
    .bind(subscription_id)
    .bind(feature_id)
    .bind(value)
    .fetch_one(&mut *conn)
    .await?;

    Ok(usage)
}

pub(crate) async fn usage_total(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    feature_id: Uuid,
    reset: Option<ResetPeriod>,
) -> BillingResult<f64> {
    let cutoff = window_cutoff(reset, OffsetDateTime::now_utc());

    let (total,): (f64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(value), 0)::DOUBLE PRECISION
         FROM subscription_feature_usage
         WHERE subscription_id = $1
           AND feature_id = $2
           AND ($3::timestamptz IS NULL OR created_at >= $3)",
    )
    .bind(subscription_id)
    .bind(feature_id)
    .bind(cutoff)
    .fetch_one(&mut *conn)
    .await?;

    Ok(total)
}

pub(crate) async fn oldest_usage_at(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    feature_id: Uuid,
    cutoff: Option<OffsetDateTime>,
) -> BillingResult<Option<OffsetDateTime>> {
    let (oldest,): (Option<OffsetDateTime>,) = sqlx::query_as(
        "SELECT MIN(created_at)
         FROM subscription_feature_usage
         WHERE subscription_id = $1
           AND feature_id = $2
           AND ($3::timestamptz IS NULL OR created_at >= $3)",
    )
    .bind(subscription_id)
    .bind(feature_id)
    .bind(cutoff)
    .fetch_one(&mut *conn)
    .await?;

    Ok(oldest)
}
