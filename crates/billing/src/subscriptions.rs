//! Subscription lifecycle
//!
//! Status is never stored: it is a pure function of
//! `(start_at, end_at, cancelled_at, now)`, recomputed on every query.
//! Transitions each run in one transaction holding `FOR UPDATE` on the
//! subscription row, so concurrent lifecycle calls serialize per
//! subscription.

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use submeter_shared::{EntityRef, SubscriptionStatus};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::period::plan_end_at;
use crate::plans::fetch_version;

/// A subscriber's hold on a plan version
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Subscription {
    pub id: Uuid,
    pub subscriber_kind: String,
    pub subscriber_id: Uuid,
    pub plan_version_id: Uuid,
    pub start_at: Option<OffsetDateTime>,
    pub end_at: Option<OffsetDateTime>,
    pub cancelled_at: Option<OffsetDateTime>,
    pub renewed_from_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl Subscription {
    pub fn subscriber(&self) -> EntityRef {
        EntityRef::new(self.subscriber_kind.clone(), self.subscriber_id)
    }

    pub fn status_at(&self, now: OffsetDateTime) -> SubscriptionStatus {
        status_at(self.start_at, self.end_at, self.cancelled_at, now)
    }

    pub fn status(&self) -> SubscriptionStatus {
        self.status_at(OffsetDateTime::now_utc())
    }

    pub fn is_active_at(&self, now: OffsetDateTime) -> bool {
        self.status_at(now) == SubscriptionStatus::Active
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled_at.is_some()
    }

    /// True when this subscription was created by renewing another.
    pub fn is_renewal(&self) -> bool {
        self.renewed_from_id.is_some()
    }
}

/// Derive the status from the timestamp columns.
///
/// Precedence: cancelled, then expired, then pending, then future. Active
/// requires being non-cancelled AND inside the `[start_at, end_at]` window.
pub fn status_at(
    start_at: Option<OffsetDateTime>,
    end_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> SubscriptionStatus {
    if cancelled_at.is_some() {
        return SubscriptionStatus::Cancelled;
    }
    if end_at.is_some_and(|end| end < now) {
        return SubscriptionStatus::Expired;
    }
    match start_at {
        None => SubscriptionStatus::Pending,
        Some(start) if start > now => SubscriptionStatus::Future,
        Some(_) => SubscriptionStatus::Active,
    }
}

/// Pure core of `cancel`: the new `(cancelled_at, end_at)` pair.
///
/// Immediate cancellation (or a subscription with no end date) terminates
/// at the cancellation instant; otherwise the existing end date stands and
/// cancellation takes effect at period end.
pub(crate) fn cancel_window(
    now: OffsetDateTime,
    end_at: Option<OffsetDateTime>,
    immediately: bool,
) -> (OffsetDateTime, Option<OffsetDateTime>) {
    if immediately || end_at.is_none() {
        (now, Some(now))
    } else {
        (now, end_at)
    }
}

/// Options for creating a subscription
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    pub start_at: Option<OffsetDateTime>,
    pub end_at: Option<OffsetDateTime>,
    /// Leave `start_at` unset; the subscription waits for `activate`
    pub pending: bool,
}

/// Explicit ordering for subscription listings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionOrder {
    NewestFirst,
    OldestFirst,
}

impl SubscriptionOrder {
    fn sql(&self) -> &'static str {
        match self {
            SubscriptionOrder::NewestFirst => "created_at DESC",
            SubscriptionOrder::OldestFirst => "created_at ASC",
        }
    }
}

const SUBSCRIPTION_COLUMNS: &str = "id, subscriber_kind, subscriber_id, plan_version_id, \
     start_at, end_at, cancelled_at, renewed_from_id, created_at, updated_at";

/// Lifecycle transitions and subscription reads
pub struct SubscriptionLifecycle {
    pool: PgPool,
    events: BillingEventLogger,
}

impl SubscriptionLifecycle {
    pub fn new(pool: PgPool) -> Self {
        let events = BillingEventLogger::new(pool.clone());
        Self { pool, events }
    }

    pub async fn find(&self, subscription_id: Uuid) -> BillingResult<Subscription> {
        let mut conn = self.pool.acquire().await?;
        fetch_subscription(&mut conn, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))
    }

    /// All subscriptions of a subscriber in an explicitly requested order.
    pub async fn for_subscriber(
        &self,
        subscriber: &EntityRef,
        order: SubscriptionOrder,
    ) -> BillingResult<Vec<Subscription>> {
        let subscriptions: Vec<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS}
             FROM subscriptions
             WHERE subscriber_kind = $1 AND subscriber_id = $2
             ORDER BY {}",
            order.sql()
        ))
        .bind(&subscriber.kind)
        .bind(subscriber.id)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    /// The subscriber's currently active subscription, if any.
    pub async fn active_for_subscriber(
        &self,
        subscriber: &EntityRef,
    ) -> BillingResult<Option<Subscription>> {
        let subscription: Option<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS}
             FROM subscriptions
             WHERE subscriber_kind = $1
               AND subscriber_id = $2
               AND cancelled_at IS NULL
               AND start_at IS NOT NULL AND start_at <= NOW()
               AND (end_at IS NULL OR end_at >= NOW())
             ORDER BY start_at DESC
             LIMIT 1"
        ))
        .bind(&subscriber.kind)
        .bind(subscriber.id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(subscription)
    }

    /// Create a subscription to a plan version.
    ///
    /// Start defaults to now (or stays unset for pending subscriptions);
    /// the end date falls out of the plan version's reset period when not
    /// given explicitly.
    pub async fn subscribe(
        &self,
        subscriber: &EntityRef,
        plan_version_id: Uuid,
        options: SubscribeOptions,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let version = fetch_version(&mut tx, plan_version_id)
            .await?
            .ok_or(BillingError::PlanVersionNotFound(plan_version_id))?;

        let start_at = if options.pending {
            None
        } else {
            Some(options.start_at.unwrap_or_else(OffsetDateTime::now_utc))
        };
        let end_at = options
            .end_at
            .or_else(|| start_at.and_then(|start| plan_end_at(version.reset(), start)));

        let subscription: Subscription = sqlx::query_as(&format!(
            "INSERT INTO subscriptions
                 (subscriber_kind, subscriber_id, plan_version_id, start_at, end_at)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(&subscriber.kind)
        .bind(subscriber.id)
        .bind(plan_version_id)
        .bind(start_at)
        .bind(end_at)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription.id,
            subscriber = %subscriber,
            plan_version_id = %plan_version_id,
            start_at = ?start_at,
            end_at = ?end_at,
            "Created subscription"
        );

        self.log_transition(
            subscription.id,
            BillingEventType::SubscriptionCreated,
            serde_json::json!({
                "plan_version_id": plan_version_id,
                "pending": options.pending,
            }),
        )
        .await;

        Ok(subscription)
    }

    /// Start a pending subscription.
    pub async fn activate(
        &self,
        subscription_id: Uuid,
        start_at: Option<OffsetDateTime>,
        end_at: Option<OffsetDateTime>,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_subscription_for_update(&mut tx, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        let now = OffsetDateTime::now_utc();
        if current.status_at(now) != SubscriptionStatus::Pending {
            return Err(BillingError::NotPending);
        }

        let version = fetch_version(&mut tx, current.plan_version_id)
            .await?
            .ok_or(BillingError::PlanVersionNotFound(current.plan_version_id))?;

        let start = start_at.unwrap_or(now);
        let end = end_at.or_else(|| plan_end_at(version.reset(), start));

        let subscription = update_window(&mut tx, subscription_id, Some(start), end, None).await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            start_at = %start,
            end_at = ?end,
            "Activated subscription"
        );

        self.log_transition(
            subscription_id,
            BillingEventType::SubscriptionActivated,
            serde_json::json!({ "start_at": start.to_string() }),
        )
        .await;

        Ok(subscription)
    }

    /// Cancel the subscription.
    ///
    /// `immediately` terminates the window now; otherwise the subscription
    /// runs to its existing end date (which is set to now when absent).
    pub async fn cancel(
        &self,
        subscription_id: Uuid,
        immediately: bool,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_subscription_for_update(&mut tx, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        let now = OffsetDateTime::now_utc();
        let (cancelled_at, end_at) = cancel_window(now, current.end_at, immediately);

        let subscription = update_window(
            &mut tx,
            subscription_id,
            current.start_at,
            end_at,
            Some(cancelled_at),
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            immediately = immediately,
            end_at = ?end_at,
            "Cancelled subscription"
        );

        self.log_transition(
            subscription_id,
            BillingEventType::SubscriptionCancelled,
            serde_json::json!({
                "immediately": immediately,
                "end_at": end_at.map(|t| t.to_string()),
            }),
        )
        .await;

        Ok(subscription)
    }

    /// Resume a cancelled subscription.
    ///
    /// Clears the cancellation, fills in `start_at` when unset, and
    /// recomputes the end date from the plan version's period unless one is
    /// given.
    pub async fn resume(
        &self,
        subscription_id: Uuid,
        start_at: Option<OffsetDateTime>,
        end_at: Option<OffsetDateTime>,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_subscription_for_update(&mut tx, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        let version = fetch_version(&mut tx, current.plan_version_id)
            .await?
            .ok_or(BillingError::PlanVersionNotFound(current.plan_version_id))?;

        let start = current
            .start_at
            .or(start_at)
            .unwrap_or_else(OffsetDateTime::now_utc);
        let end = end_at.or_else(|| plan_end_at(version.reset(), start));

        let subscription = update_window(&mut tx, subscription_id, Some(start), end, None).await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            start_at = %start,
            end_at = ?end,
            "Resumed subscription"
        );

        self.log_transition(
            subscription_id,
            BillingEventType::SubscriptionResumed,
            serde_json::json!({ "end_at": end.map(|t| t.to_string()) }),
        )
        .await;

        Ok(subscription)
    }

    /// Renew into a fresh subscription for the same subscriber and plan
    /// version, linked via `renewed_from_id`. At most one forward renewal
    /// per subscription, checked under the row lock.
    pub async fn renew(
        &self,
        subscription_id: Uuid,
        start_at: Option<OffsetDateTime>,
    ) -> BillingResult<Subscription> {
        let mut tx = self.pool.begin().await?;

        let current = fetch_subscription_for_update(&mut tx, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        let (already_renewed,): (bool,) = sqlx::query_as(
            "SELECT EXISTS(SELECT 1 FROM subscriptions WHERE renewed_from_id = $1)",
        )
        .bind(subscription_id)
        .fetch_one(&mut *tx)
        .await?;

        if already_renewed {
            return Err(BillingError::AlreadyRenewed);
        }

        let version = fetch_version(&mut tx, current.plan_version_id)
            .await?
            .ok_or(BillingError::PlanVersionNotFound(current.plan_version_id))?;

        let start = start_at
            .or(current.end_at)
            .unwrap_or_else(OffsetDateTime::now_utc);
        let end = plan_end_at(version.reset(), start);

        let renewal: Subscription = sqlx::query_as(&format!(
            "INSERT INTO subscriptions
                 (subscriber_kind, subscriber_id, plan_version_id, start_at, end_at, renewed_from_id)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {SUBSCRIPTION_COLUMNS}"
        ))
        .bind(&current.subscriber_kind)
        .bind(current.subscriber_id)
        .bind(current.plan_version_id)
        .bind(start)
        .bind(end)
        .bind(subscription_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %renewal.id,
            renewed_from = %subscription_id,
            start_at = %start,
            end_at = ?end,
            "Renewed subscription"
        );

        self.log_transition(
            renewal.id,
            BillingEventType::SubscriptionRenewed,
            serde_json::json!({ "renewed_from": subscription_id }),
        )
        .await;

        Ok(renewal)
    }

    /// Push the end date out by `days`.
    pub async fn extend(&self, subscription_id: Uuid, days: i64) -> BillingResult<Subscription> {
        if days <= 0 {
            return Err(BillingError::InvalidAmount(days as f64));
        }

        let mut tx = self.pool.begin().await?;

        let current = fetch_subscription_for_update(&mut tx, subscription_id)
            .await?
            .ok_or(BillingError::SubscriptionNotFound(subscription_id))?;

        let end = current.end_at.ok_or(BillingError::NothingToExtend)?;
        let new_end = end + Duration::days(days);

        let subscription = update_window(
            &mut tx,
            subscription_id,
            current.start_at,
            Some(new_end),
            current.cancelled_at,
        )
        .await?;

        tx.commit().await?;

        tracing::info!(
            subscription_id = %subscription_id,
            days = days,
            end_at = %new_end,
            "Extended subscription"
        );

        self.log_transition(
            subscription_id,
            BillingEventType::SubscriptionExtended,
            serde_json::json!({ "days": days, "end_at": new_end.to_string() }),
        )
        .await;

        Ok(subscription)
    }

    /// Active, not-yet-renewed subscriptions ending within the horizon.
    /// Feeds the worker's renewal-reminder sweep.
    pub async fn due_for_renewal(
        &self,
        within_days: i64,
        limit: i64,
    ) -> BillingResult<Vec<Subscription>> {
        let horizon = OffsetDateTime::now_utc() + Duration::days(within_days);

        let subscriptions: Vec<Subscription> = sqlx::query_as(&format!(
            "SELECT {SUBSCRIPTION_COLUMNS}
             FROM subscriptions s
             WHERE s.cancelled_at IS NULL
               AND s.start_at IS NOT NULL AND s.start_at <= NOW()
               AND s.end_at IS NOT NULL
               AND s.end_at >= NOW()
               AND s.end_at <= $1
               AND NOT EXISTS (SELECT 1 FROM subscriptions r WHERE r.renewed_from_id = s.id)
             ORDER BY s.end_at ASC
             LIMIT $2"
        ))
        .bind(horizon)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(subscriptions)
    }

    async fn log_transition(
        &self,
        subscription_id: Uuid,
        event_type: BillingEventType,
        data: serde_json::Value,
    ) {
        if let Err(e) = self
            .events
            .log_event(BillingEventBuilder::new(subscription_id, event_type).data(data))
            .await
        {
            tracing::warn!(error = %e, event = %event_type, "Failed to log lifecycle event");
        }
    }
}

pub(crate) async fn fetch_subscription(
    conn: &mut PgConnection,
    subscription_id: Uuid,
) -> BillingResult<Option<Subscription>> {
    let subscription: Option<Subscription> = sqlx::query_as(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1"
    ))
    .bind(subscription_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(subscription)
}

pub(crate) async fn fetch_subscription_for_update(
    conn: &mut PgConnection,
    subscription_id: Uuid,
) -> BillingResult<Option<Subscription>> {
    let subscription: Option<Subscription> = sqlx::query_as(&format!(
        "SELECT {SUBSCRIPTION_COLUMNS} FROM subscriptions WHERE id = $1 FOR UPDATE"
    ))
    .bind(subscription_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(subscription)
}

async fn update_window(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    start_at: Option<OffsetDateTime>,
    end_at: Option<OffsetDateTime>,
    cancelled_at: Option<OffsetDateTime>,
) -> BillingResult<Subscription> {
    let subscription: Subscription = sqlx::query_as(&format!(
        "UPDATE subscriptions
         SET start_at = $2, end_at = $3, cancelled_at = $4, updated_at = NOW()
         WHERE id = $1
         RETURNING {SUBSCRIPTION_COLUMNS}"
    ))
    .bind(subscription_id)
    .bind(start_at)
    .bind(end_at)
    .bind(cancelled_at)
    .fetch_one(&mut *conn)
    .await?;

    Ok(subscription)
}
