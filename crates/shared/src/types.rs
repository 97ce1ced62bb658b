//! Common types used across Submeter

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Enums
// =============================================================================

/// How a feature is metered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FeatureKind {
    /// Metered: carries a numeric allowance consumed by usage events
    Consumable,
    /// Boolean access gate: no quantity, no usage events
    NonConsumable,
}

impl FeatureKind {
    pub fn is_consumable(&self) -> bool {
        matches!(self, Self::Consumable)
    }
}

/// Derived subscription status
///
/// Never stored. Always recomputed from `(start_at, end_at, cancelled_at, now)`;
/// see `submeter_billing::subscriptions::status_at`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    /// Not yet started (`start_at` null, not cancelled)
    Pending,
    /// Within the subscription window and not cancelled
    Active,
    /// `cancelled_at` set
    Cancelled,
    /// `end_at` in the past
    Expired,
    /// `start_at` in the future
    Future,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Pending => "pending",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
            SubscriptionStatus::Future => "future",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Allowance
// =============================================================================

/// Sentinel stored in `plan_features.value` for uncapped features
pub const UNLIMITED_VALUE: &str = "unlimited";

/// A plan feature's per-period quantity, stored as text to carry the
/// `"unlimited"` sentinel alongside plain numbers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allowance {
    Unlimited,
    Limited(f64),
}

impl Allowance {
    pub fn is_unlimited(&self) -> bool {
        matches!(self, Self::Unlimited)
    }

    /// The numeric quantity, or None for unlimited
    pub fn quantity(&self) -> Option<f64> {
        match self {
            Allowance::Unlimited => None,
            Allowance::Limited(value) => Some(*value),
        }
    }
}

/// Error parsing a stored allowance value
#[derive(Debug, Clone, thiserror::Error)]
#[error("invalid allowance value: '{0}'")]
pub struct ParseAllowanceError(pub String);

impl FromStr for Allowance {
    type Err = ParseAllowanceError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        if raw == UNLIMITED_VALUE {
            return Ok(Allowance::Unlimited);
        }
        raw.parse::<f64>()
            .map(Allowance::Limited)
            .map_err(|_| ParseAllowanceError(raw.to_string()))
    }
}

impl std::fmt::Display for Allowance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Allowance::Unlimited => write!(f, "{}", UNLIMITED_VALUE),
            Allowance::Limited(value) => write!(f, "{}", value),
        }
    }
}

// =============================================================================
// Typed entity reference
// =============================================================================

/// Typed reference to an entity owned by the host application.
///
/// Replaces reflection-based polymorphic associations: the engine never
/// needs the referenced entity's behavior, only its identity for joining.
/// Used for subscription owners and credit grantors.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntityRef {
    /// Application-defined kind tag, e.g. "user" or "team"
    pub kind: String,
    pub id: Uuid,
}

impl EntityRef {
    pub fn new(kind: impl Into<String>, id: Uuid) -> Self {
        Self {
            kind: kind.into(),
            id,
        }
    }
}

impl std::fmt::Display for EntityRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}
