//! Billing error types
//!
//! Every error is synchronous and caller-visible; nothing is retried
//! internally. `ErrorKind` groups the variants so callers can pick a retry
//! policy without matching on every variant.

use thiserror::Error;
use uuid::Uuid;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, Error)]
pub enum BillingError {
    #[error("amount must be greater than 0, got {0}")]
    InvalidAmount(f64),

    #[error("invalid period unit: '{0}'")]
    InvalidPeriodUnit(String),

    #[error("plan '{0}' not found")]
    PlanNotFound(String),

    #[error("plan '{0}' has no active published version")]
    NoPublishedVersion(String),

    #[error("plan version {0} not found")]
    PlanVersionNotFound(Uuid),

    #[error("feature '{0}' not found")]
    FeatureNotFound(String),

    #[error("the feature '{0}' is not part of the plan")]
    FeatureNotInPlan(String),

    #[error("subscription {0} not found")]
    SubscriptionNotFound(Uuid),

    #[error("the feature '{0}' is not consumable or has no value")]
    NotConsumable(String),

    #[error("invalid allowance value '{value}' for feature '{feature}'")]
    InvalidAllowanceValue { feature: String, value: String },

    #[error("subscription has already been renewed")]
    AlreadyRenewed,

    #[error("subscription has no end date to extend")]
    NothingToExtend,

    #[error("subscription is not pending")]
    NotPending,

    #[error("the feature '{0}' cannot be used")]
    CannotUseFeature(String),

    #[error("concurrent modification: {0}")]
    ConcurrencyConflict(String),

    #[error("database error: {0}")]
    Database(String),
}

/// Coarse error taxonomy for caller-side retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    NotFound,
    InvalidState,
    ConcurrencyConflict,
    Storage,
}

impl BillingError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            BillingError::InvalidAmount(_) | BillingError::InvalidPeriodUnit(_) => {
                ErrorKind::InvalidArgument
            }
            BillingError::PlanNotFound(_)
            | BillingError::NoPublishedVersion(_)
            | BillingError::PlanVersionNotFound(_)
            | BillingError::FeatureNotFound(_)
            | BillingError::FeatureNotInPlan(_)
            | BillingError::SubscriptionNotFound(_) => ErrorKind::NotFound,
            BillingError::NotConsumable(_)
            | BillingError::InvalidAllowanceValue { .. }
            | BillingError::AlreadyRenewed
            | BillingError::NothingToExtend
            | BillingError::NotPending
            | BillingError::CannotUseFeature(_) => ErrorKind::InvalidState,
            BillingError::ConcurrencyConflict(_) => ErrorKind::ConcurrencyConflict,
            BillingError::Database(_) => ErrorKind::Storage,
        }
    }
}

impl From<sqlx::Error> for BillingError {
    fn from(err: sqlx::Error) -> Self {
        // Lock contention and serialization failures surface as their own
        // kind so callers can retry them without retrying real failures.
        if let sqlx::Error::Database(db) = &err {
            if let Some(code) = db.code() {
                if matches!(code.as_ref(), "55P03" | "40001" | "40P01") {
                    return BillingError::ConcurrencyConflict(db.message().to_string());
                }
            }
        }
        BillingError::Database(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(
            BillingError::InvalidAmount(0.0).kind(),
            ErrorKind::InvalidArgument
        );
        assert_eq!(
            BillingError::FeatureNotInPlan("api-calls".into()).kind(),
            ErrorKind::NotFound
        );
        assert_eq!(BillingError::AlreadyRenewed.kind(), ErrorKind::InvalidState);
        assert_eq!(
            BillingError::ConcurrencyConflict("lock".into()).kind(),
            ErrorKind::ConcurrencyConflict
        );
        assert_eq!(
            BillingError::Database("down".into()).kind(),
            ErrorKind::Storage
        );
    }

    #[test]
    fn test_display_includes_context() {
        let err = BillingError::FeatureNotInPlan("exports".into());
        assert_eq!(err.to_string(), "the feature 'exports' is not part of the plan");
    }
}
