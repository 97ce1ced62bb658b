//! Plan catalog reads
//!
//! Read-only projection over plans, their published versions, and the
//! per-version feature allowances. Plan CRUD itself lives with the host
//! application; the engine only ever resolves what is already published.

use std::str::FromStr;

use serde::Serialize;
use sqlx::{PgConnection, PgPool};
use submeter_shared::{Allowance, FeatureKind, UNLIMITED_VALUE};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{BillingError, BillingResult};
use crate::period::{Period, ResetPeriod};

/// A subscribable offering, versioned over time
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Plan {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub sort_order: i32,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

/// An immutable-once-published snapshot of a plan's price and terms
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct PlanVersion {
    pub id: Uuid,
    pub plan_id: Uuid,
    pub version_number: i32,
    pub version_label: Option<String>,
    pub price: f64,
    pub currency: Option<String>,
    pub reset_period: Option<i32>,
    pub reset_period_unit: Option<Period>,
    pub is_active: bool,
    pub published_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl PlanVersion {
    pub fn reset(&self) -> Option<ResetPeriod> {
        ResetPeriod::from_columns(self.reset_period, self.reset_period_unit)
    }

    pub fn is_published(&self) -> bool {
        self.published_at.is_some()
    }

    pub fn is_free(&self) -> bool {
        self.price == 0.0
    }

    /// "v3" when no label was set
    pub fn display_label(&self) -> String {
        self.version_label
            .clone()
            .unwrap_or_else(|| format!("v{}", self.version_number))
    }
}

/// A capability gated by subscription
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Feature {
    pub id: Uuid,
    pub slug: String,
    pub name: String,
    pub description: Option<String>,
    pub kind: FeatureKind,
    pub sort_order: i32,
}

/// A plan version's allowance for one feature (plan_features joined with
/// the feature row it points at)
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FeatureAllowance {
    pub id: Uuid,
    pub plan_version_id: Uuid,
    pub feature_id: Uuid,
    pub feature_slug: String,
    pub feature_kind: FeatureKind,
    pub value: Option<String>,
    pub display_value: Option<String>,
    pub reset_period: Option<i32>,
    pub reset_period_unit: Option<Period>,
    pub is_hidden: bool,
    pub sort_order: i32,
}

impl FeatureAllowance {
    pub fn reset(&self) -> Option<ResetPeriod> {
        ResetPeriod::from_columns(self.reset_period, self.reset_period_unit)
    }

    pub fn is_unlimited(&self) -> bool {
        self.value.as_deref() == Some(UNLIMITED_VALUE)
    }

    pub fn is_consumable(&self) -> bool {
        self.feature_kind.is_consumable()
    }

    /// Parse the stored value into an allowance.
    ///
    /// Errors when the feature is non-consumable, carries no value, or the
    /// stored text is neither a number nor the unlimited sentinel.
    pub fn allowance(&self) -> BillingResult<Allowance> {
        if !self.is_consumable() {
            return Err(BillingError::NotConsumable(self.feature_slug.clone()));
        }
        let raw = self
            .value
            .as_deref()
            .ok_or_else(|| BillingError::NotConsumable(self.feature_slug.clone()))?;
        Allowance::from_str(raw).map_err(|_| BillingError::InvalidAllowanceValue {
            feature: self.feature_slug.clone(),
            value: raw.to_string(),
        })
    }

    /// Lenient variant for reporting paths: anything unparseable counts as 0.
    pub fn allowance_or_zero(&self) -> Allowance {
        match self.value.as_deref() {
            Some(raw) => Allowance::from_str(raw).unwrap_or(Allowance::Limited(0.0)),
            None => Allowance::Limited(0.0),
        }
    }
}

/// Explicit ordering for allowance listings (no implicit global sort scope)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeatureOrder {
    /// By the configured sort_order, then slug
    Position,
    /// Alphabetical by feature slug
    Slug,
}

impl FeatureOrder {
    fn sql(&self) -> &'static str {
        match self {
            FeatureOrder::Position => "pf.sort_order ASC, f.slug ASC",
            FeatureOrder::Slug => "f.slug ASC",
        }
    }
}

const VERSION_COLUMNS: &str = "id, plan_id, version_number, version_label, price, currency, \
     reset_period, reset_period_unit, is_active, published_at, created_at, updated_at";

const ALLOWANCE_COLUMNS: &str = "pf.id, pf.plan_version_id, pf.feature_id, \
     f.slug AS feature_slug, f.kind AS feature_kind, pf.value, pf.display_value, \
     pf.reset_period, pf.reset_period_unit, pf.is_hidden, pf.sort_order";

/// Read-only accessor for the plan catalog
pub struct PlanVersionAccessor {
    pool: PgPool,
}

impl PlanVersionAccessor {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn plan_by_slug(&self, slug: &str) -> BillingResult<Option<Plan>> {
        let plan: Option<Plan> = sqlx::query_as(
            "SELECT id, slug, name, description, is_active, sort_order, created_at, updated_at
             FROM plans
             WHERE slug = $1 AND deleted_at IS NULL",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(plan)
    }

    /// The plan's current version: highest version_number among versions
    /// that are both active and published.
    pub async fn current_version(&self, plan_id: Uuid) -> BillingResult<Option<PlanVersion>> {
        let version: Option<PlanVersion> = sqlx::query_as(&format!(
            "SELECT {VERSION_COLUMNS}
             FROM plan_versions
             WHERE plan_id = $1
               AND is_active = true
               AND published_at IS NOT NULL
               AND deleted_at IS NULL
             ORDER BY version_number DESC
             LIMIT 1"
        ))
        .bind(plan_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(version)
    }

    /// Resolve a plan slug straight to its current version.
    pub async fn current_version_by_slug(&self, plan_slug: &str) -> BillingResult<PlanVersion> {
        let plan = self
            .plan_by_slug(plan_slug)
            .await?
            .ok_or_else(|| BillingError::PlanNotFound(plan_slug.to_string()))?;

        self.current_version(plan.id)
            .await?
            .ok_or_else(|| BillingError::NoPublishedVersion(plan_slug.to_string()))
    }

    pub async fn version(&self, plan_version_id: Uuid) -> BillingResult<Option<PlanVersion>> {
        let mut conn = self.pool.acquire().await?;
        fetch_version(&mut conn, plan_version_id).await
    }

    pub async fn feature_by_slug(&self, slug: &str) -> BillingResult<Option<Feature>> {
        let feature: Option<Feature> = sqlx::query_as(
            "SELECT id, slug, name, description, kind, sort_order
             FROM features
             WHERE slug = $1 AND deleted_at IS NULL",
        )
        .bind(slug)
        .fetch_optional(&self.pool)
        .await?;

        Ok(feature)
    }

    /// Exact-match allowance lookup; None when the feature is not attached
    /// to the version.
    pub async fn feature_allowance(
        &self,
        plan_version_id: Uuid,
        feature_slug: &str,
    ) -> BillingResult<Option<FeatureAllowance>> {
        let mut conn = self.pool.acquire().await?;
        fetch_allowance(&mut conn, plan_version_id, feature_slug).await
    }

    /// All allowances of a version in an explicitly requested order.
    pub async fn feature_allowances(
        &self,
        plan_version_id: Uuid,
        order: FeatureOrder,
    ) -> BillingResult<Vec<FeatureAllowance>> {
        let allowances: Vec<FeatureAllowance> = sqlx::query_as(&format!(
            "SELECT {ALLOWANCE_COLUMNS}
             FROM plan_features pf
             JOIN features f ON f.id = pf.feature_id
             WHERE pf.plan_version_id = $1
             ORDER BY {}",
            order.sql()
        ))
        .bind(plan_version_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(allowances)
    }
}

pub(crate) async fn fetch_version(
    conn: &mut PgConnection,
    plan_version_id: Uuid,
) -> BillingResult<Option<PlanVersion>> {
    let version: Option<PlanVersion> = sqlx::query_as(&format!(
        "SELECT {VERSION_COLUMNS}
         FROM plan_versions
         WHERE id = $1 AND deleted_at IS NULL"
    ))
    .bind(plan_version_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(version)
}

pub(crate) async fn fetch_allowance(
    conn: &mut PgConnection,
    plan_version_id: Uuid,
    feature_slug: &str,
) -> BillingResult<Option<FeatureAllowance>> {
    let allowance: Option<FeatureAllowance> = sqlx::query_as(&format!(
        "SELECT {ALLOWANCE_COLUMNS}
         FROM plan_features pf
         JOIN features f ON f.id = pf.feature_id
         WHERE pf.plan_version_id = $1 AND f.slug = $2"
    ))
    .bind(plan_version_id)
    .bind(feature_slug)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(allowance)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowance_row(kind: FeatureKind, value: Option<&str>) -> FeatureAllowance {
        FeatureAllowance {
            id: Uuid::new_v4(),
            plan_version_id: Uuid::new_v4(),
            feature_id: Uuid::new_v4(),
            feature_slug: "api-calls".into(),
            feature_kind: kind,
            value: value.map(String::from),
            display_value: None,
            reset_period: None,
            reset_period_unit: None,
            is_hidden: false,
            sort_order: 0,
        }
    }

    #[test]
    fn test_allowance_parses_number_and_sentinel() {
        let limited = allowance_row(FeatureKind::Consumable, Some("50"));
        assert_eq!(limited.allowance().unwrap(), Allowance::Limited(50.0));
        assert!(!limited.is_unlimited());

        let unlimited = allowance_row(FeatureKind::Consumable, Some("unlimited"));
        assert!(unlimited.is_unlimited());
        assert!(unlimited.allowance().unwrap().is_unlimited());
    }

    #[test]
    fn test_allowance_rejects_non_consumable() {
        let gate = allowance_row(FeatureKind::NonConsumable, None);
        assert!(matches!(
            gate.allowance(),
            Err(BillingError::NotConsumable(slug)) if slug == "api-calls"
        ));
    }

    #[test]
    fn test_allowance_rejects_missing_value() {
        let missing = allowance_row(FeatureKind::Consumable, None);
        assert!(matches!(
            missing.allowance(),
            Err(BillingError::NotConsumable(_))
        ));
    }

    #[test]
    fn test_allowance_rejects_garbage_value() {
        let garbage = allowance_row(FeatureKind::Consumable, Some("many"));
        assert!(matches!(
            garbage.allowance(),
            Err(BillingError::InvalidAllowanceValue { value, .. }) if value == "many"
        ));
        assert_eq!(garbage.allowance_or_zero(), Allowance::Limited(0.0));
    }

    #[test]
    fn test_version_display_label() {
        let version = PlanVersion {
            id: Uuid::new_v4(),
            plan_id: Uuid::new_v4(),
            version_number: 3,
            version_label: None,
            price: 0.0,
            currency: None,
            reset_period: Some(1),
            reset_period_unit: Some(Period::Month),
            is_active: true,
            published_at: None,
            created_at: OffsetDateTime::UNIX_EPOCH,
            updated_at: OffsetDateTime::UNIX_EPOCH,
        };
        assert_eq!(version.display_label(), "v3");
        assert_eq!(version.reset(), Some(ResetPeriod::new(1, Period::Month)));
        assert!(version.is_free());
    }
}
