//! Extra-credit ledger
//!
//! FIFO-ordered pool of expiring/non-expiring bonus credits per
//! (subscription, feature). Credits are always depleted before plan
//! allowance, oldest grant first; a row is decremented in place and deleted
//! the moment it reaches zero, so no row ever holds a negative balance.

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use submeter_shared::EntityRef;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::events::{BillingEventBuilder, BillingEventLogger, BillingEventType};

/// One credit grant
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeatureCredit {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub feature_id: Uuid,
    pub credits: f64,
    pub reason: Option<String>,
    pub granted_by_kind: Option<String>,
    pub granted_by_id: Option<Uuid>,
    pub expires_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl FeatureCredit {
    pub fn granted_by(&self) -> Option<EntityRef> {
        match (&self.granted_by_kind, self.granted_by_id) {
            (Some(kind), Some(id)) => Some(EntityRef::new(kind.clone(), id)),
            _ => None,
        }
    }

    pub fn is_expired_at(&self, now: OffsetDateTime) -> bool {
        self.expires_at.is_some_and(|expires| expires <= now)
    }
}

/// Options for a credit grant
#[derive(Debug, Clone, Default)]
pub struct GrantOptions {
    pub reason: Option<String>,
    pub granted_by: Option<EntityRef>,
    pub expires_at: Option<OffsetDateTime>,
}

/// One row's share of a consumption, produced by `plan_consumption`
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct CreditDraw {
    pub id: Uuid,
    pub amount: f64,
    pub exhausted: bool,
}

/// Pure FIFO planner: given active credit rows ordered oldest-first, decide
/// how much to draw from each and what remains uncovered. Never plans a
/// draw beyond a row's balance.
pub(crate) fn plan_consumption(rows: &[FeatureCredit], amount: f64) -> (Vec<CreditDraw>, f64) {
    let mut remaining = amount;
    let mut draws = Vec::new();

    for row in rows {
        if remaining <= 0.0 {
            break;
        }
        let draw = row.credits.min(remaining);
        remaining -= draw;
        draws.push(CreditDraw {
            id: row.id,
            amount: draw,
            exhausted: draw >= row.credits,
        });
    }

    (draws, remaining.max(0.0))
}

const CREDIT_COLUMNS: &str = "id, subscription_id, feature_id, credits, reason, \
     granted_by_kind, granted_by_id, expires_at, created_at, updated_at";

/// FIFO credit pool per (subscription, feature)
pub struct CreditLedger {
    pool: PgPool,
    events: BillingEventLogger,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        let events = BillingEventLogger::new(pool.clone());
        Self { pool, events }
    }

    /// Grant extra credits for a consumable feature.
    pub async fn grant(
        &self,
        subscription_id: Uuid,
        feature_slug: &str,
        credits: f64,
        options: GrantOptions,
    ) -> BillingResult<FeatureCredit> {
        if credits <= 0.0 {
            return Err(BillingError::InvalidAmount(credits));
        }

        let feature: Option<(Uuid, submeter_shared::FeatureKind)> = sqlx::query_as(
            "SELECT id, kind FROM features WHERE slug = $1 AND deleted_at IS NULL",
        )
        .bind(feature_slug)
        .fetch_optional(&self.pool)
        .await?;

        let (feature_id, kind) =
            feature.ok_or_else(|| BillingError::FeatureNotFound(feature_slug.to_string()))?;

        if !kind.is_consumable() {
            return Err(BillingError::NotConsumable(feature_slug.to_string()));
        }

        let (granted_by_kind, granted_by_id) = match &options.granted_by {
            Some(entity) => (Some(entity.kind.clone()), Some(entity.id)),
            None => (None, None),
        };

        let credit: FeatureCredit = sqlx::query_as(&format!(
            "INSERT INTO subscription_feature_credits
                 (subscription_id, feature_id, credits, reason, granted_by_kind, granted_by_id, expires_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {CREDIT_COLUMNS}"
        ))
        .bind(subscription_id)
        .bind(feature_id)
        .bind(credits)
        .bind(&options.reason)
        .bind(&granted_by_kind)
        .bind(granted_by_id)
        .bind(options.expires_at)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            subscription_id = %subscription_id,
            feature = %feature_slug,
            credits = credits,
            expires_at = ?options.expires_at,
            "Granted extra credits"
        );

        if let Err(e) = self
            .events
            .log_event(
                BillingEventBuilder::new(subscription_id, BillingEventType::CreditsGranted).data(
                    serde_json::json!({
                        "feature": feature_slug,
                        "credits": credits,
                        "reason": options.reason,
                        "expires_at": options.expires_at.map(|t| t.to_string()),
                    }),
                ),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log credit grant event");
        }

        Ok(credit)
    }

    /// Sum of unexpired credits for the pair.
    pub async fn active_balance(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
    ) -> BillingResult<f64> {
        let mut conn = self.pool.acquire().await?;
        credit_balance(&mut conn, subscription_id, feature_id).await
    }

    /// Active credit rows oldest-first (read-only listing).
    pub async fn active_credits(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
    ) -> BillingResult<Vec<FeatureCredit>> {
        let rows: Vec<FeatureCredit> = sqlx::query_as(&format!(
            "SELECT {CREDIT_COLUMNS}
             FROM subscription_feature_credits
             WHERE subscription_id = $1
               AND feature_id = $2
               AND (expires_at IS NULL OR expires_at > NOW())
             ORDER BY created_at ASC"
        ))
        .bind(subscription_id)
        .bind(feature_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Consume credits oldest-first; returns the amount not covered by
    /// credits (the caller then draws it from the plan allowance).
    pub async fn consume(
        &self,
        subscription_id: Uuid,
        feature_id: Uuid,
        amount: f64,
    ) -> BillingResult<f64> {
        if amount <= 0.0 {
            return Err(BillingError::InvalidAmount(amount));
        }

        let mut tx = self.pool.begin().await?;
        lock_pair(&mut tx, subscription_id, feature_id).await?;
        let uncovered = consume_in(&mut tx, subscription_id, feature_id, amount).await?;
        tx.commit().await?;

        Ok(uncovered)
    }

    /// Delete credits whose expiry is strictly in the past, in batches.
    ///
    /// The scheduler-facing purge entry point. `SKIP LOCKED` keeps the batch
    /// from contending with an in-flight consume on the same rows; dry-run
    /// only counts.
    pub async fn purge_expired(&self, batch_size: i64, dry_run: bool) -> BillingResult<u64> {
        if dry_run {
            let (count,): (i64,) = sqlx::query_as(
                "SELECT COUNT(*) FROM subscription_feature_credits WHERE expires_at < NOW()",
            )
            .fetch_one(&self.pool)
            .await?;

            tracing::info!(expired = count, "Dry run: expired credits eligible for purge");
            return Ok(count as u64);
        }

        let mut deleted: u64 = 0;

        loop {
            let mut tx = self.pool.begin().await?;

            let ids: Vec<(Uuid,)> = sqlx::query_as(
                "SELECT id FROM subscription_feature_credits
                 WHERE expires_at < NOW()
                 ORDER BY expires_at ASC
                 LIMIT $1
                 FOR UPDATE SKIP LOCKED",
            )
            .bind(batch_size)
            .fetch_all(&mut *tx)
            .await?;

            if ids.is_empty() {
                tx.commit().await?;
                break;
            }

            let ids: Vec<Uuid> = ids.into_iter().map(|(id,)| id).collect();
            let batch = sqlx::query("DELETE FROM subscription_feature_credits WHERE id = ANY($1)")
                .bind(&ids)
                .execute(&mut *tx)
                .await?
                .rows_affected();

            tx.commit().await?;
            deleted += batch;

            if (batch as i64) < batch_size {
                break;
            }
        }

        tracing::info!(deleted = deleted, "Purged expired credits");

        Ok(deleted)
    }
}

/// Serialize check-then-act per (subscription, feature) for the duration of
/// the surrounding transaction.
pub(crate) async fn lock_pair(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    feature_id: Uuid,
) -> BillingResult<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1), hashtext($2))")
        .bind(subscription_id.to_string())
        .bind(feature_id.to_string())
        .execute(&mut *conn)
        .await?;

    Ok(())
}

pub(crate) async fn credit_balance(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    feature_id: Uuid,
) -> BillingResult<f64> {
    let (balance,): (f64,) = sqlx::query_as(
        "SELECT COALESCE(SUM(credits), 0)::DOUBLE PRECISION
         FROM subscription_feature_credits
         WHERE subscription_id = $1
           AND feature_id = $2
           AND (expires_at IS NULL OR expires_at > NOW())",
    )
    .bind(subscription_id)
    .bind(feature_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(balance)
}

/// FIFO consumption inside an existing transaction. Locks the active rows,
/// plans the draws in memory, then applies them row by row.
pub(crate) async fn consume_in(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    feature_id: Uuid,
    amount: f64,
) -> BillingResult<f64> {
    let rows: Vec<FeatureCredit> = sqlx::query_as(&format!(
        "SELECT {CREDIT_COLUMNS}
         FROM subscription_feature_credits
         WHERE subscription_id = $1
           AND feature_id = $2
           AND (expires_at IS NULL OR expires_at > NOW())
         ORDER BY created_at ASC
         FOR UPDATE"
    ))
    .bind(subscription_id)
    .bind(feature_id)
    .fetch_all(&mut *conn)
    .await?;

    let (draws, uncovered) = plan_consumption(&rows, amount);

    for draw in &draws {
        if draw.exhausted {
            sqlx::query("DELETE FROM subscription_feature_credits WHERE id = $1")
                .bind(draw.id)
                .execute(&mut *conn)
                .await?;
        } else {
            sqlx::query(
                "UPDATE subscription_feature_credits
                 SET credits = credits - $2, updated_at = NOW()
                 WHERE id = $1",
            )
            .bind(draw.id)
            .bind(draw.amount)
            .execute(&mut *conn)
            .await?;
        }
    }

    if !draws.is_empty() {
        tracing::debug!(
            subscription_id = %subscription_id,
            feature_id = %feature_id,
            requested = amount,
            covered = amount - uncovered,
            rows_touched = draws.len(),
            "Consumed extra credits"
        );
    }

    Ok(uncovered)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credit_row(credits: f64, created_offset_secs: i64) -> FeatureCredit {
        FeatureCredit {
            id: Uuid::new_v4(),
            subscription_id: Uuid::nil(),
            feature_id: Uuid::nil(),
            credits,
            reason: None,
            granted_by_kind: None,
            granted_by_id: None,
            expires_at: None,
            created_at: OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(created_offset_secs),
            updated_at: OffsetDateTime::UNIX_EPOCH + time::Duration::seconds(created_offset_secs),
        }
    }

    #[test]
    fn test_consumes_oldest_first() {
        let first = credit_row(10.0, 0);
        let second = credit_row(20.0, 100);
        let rows = vec![first.clone(), second.clone()];

        // Amount within the first row's balance must not touch the second
        let (draws, uncovered) = plan_consumption(&rows, 8.0);
        assert_eq!(uncovered, 0.0);
        assert_eq!(draws.len(), 1);
        assert_eq!(draws[0].id, first.id);
        assert_eq!(draws[0].amount, 8.0);
        assert!(!draws[0].exhausted);
    }

    #[test]
    fn test_spills_into_newer_rows() {
        let first = credit_row(10.0, 0);
        let second = credit_row(20.0, 100);
        let rows = vec![first.clone(), second.clone()];

        let (draws, uncovered) = plan_consumption(&rows, 15.0);
        assert_eq!(uncovered, 0.0);
        assert_eq!(draws.len(), 2);
        assert_eq!(draws[0].amount, 10.0);
        assert!(draws[0].exhausted);
        assert_eq!(draws[1].amount, 5.0);
        assert!(!draws[1].exhausted);
    }

    #[test]
    fn test_returns_uncovered_remainder() {
        let rows = vec![credit_row(10.0, 0)];
        let (draws, uncovered) = plan_consumption(&rows, 25.0);
        assert_eq!(draws.len(), 1);
        assert!(draws[0].exhausted);
        assert_eq!(uncovered, 15.0);
    }

    #[test]
    fn test_conservation_and_no_negative_rows() {
        let rows = vec![credit_row(3.5, 0), credit_row(1.5, 10), credit_row(5.0, 20)];
        let total: f64 = rows.iter().map(|r| r.credits).sum();

        for amount in [0.5, 3.5, 4.0, 9.0, 10.0, 12.0] {
            let (draws, uncovered) = plan_consumption(&rows, amount);
            let drawn: f64 = draws.iter().map(|d| d.amount).sum();
            // Conservation: drawn + uncovered == requested
            assert!((drawn + uncovered - amount).abs() < 1e-9);
            // Never draws more than the pool holds
            assert!(drawn <= total + 1e-9);
            // No draw exceeds its row
            for (draw, row) in draws.iter().zip(rows.iter()) {
                assert!(draw.amount <= row.credits + 1e-9);
            }
        }
    }

    #[test]
    fn test_empty_pool_covers_nothing() {
        let (draws, uncovered) = plan_consumption(&[], 5.0);
        assert!(draws.is_empty());
        assert_eq!(uncovered, 5.0);
    }

    #[test]
    fn test_exact_exhaustion_deletes_row() {
        let rows = vec![credit_row(5.0, 0)];
        let (draws, uncovered) = plan_consumption(&rows, 5.0);
        assert_eq!(uncovered, 0.0);
        assert!(draws[0].exhausted);
    }

    #[test]
    fn test_expiry_check() {
        let mut row = credit_row(5.0, 0);
        let now = OffsetDateTime::UNIX_EPOCH + time::Duration::days(10);
        assert!(!row.is_expired_at(now));

        row.expires_at = Some(OffsetDateTime::UNIX_EPOCH + time::Duration::days(5));
        assert!(row.is_expired_at(now));

        row.expires_at = Some(OffsetDateTime::UNIX_EPOCH + time::Duration::days(15));
        assert!(!row.is_expired_at(now));
    }
}
