//! Billing event log
//!
//! Best-effort audit trail for lifecycle transitions and credit grants.
//! Writers log and swallow failures: an event insert must never fail the
//! operation it describes.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::BillingResult;

/// What happened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingEventType {
    SubscriptionCreated,
    SubscriptionActivated,
    SubscriptionCancelled,
    SubscriptionResumed,
    SubscriptionRenewed,
    SubscriptionExtended,
    CreditsGranted,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::SubscriptionCreated => "subscription_created",
            BillingEventType::SubscriptionActivated => "subscription_activated",
            BillingEventType::SubscriptionCancelled => "subscription_cancelled",
            BillingEventType::SubscriptionResumed => "subscription_resumed",
            BillingEventType::SubscriptionRenewed => "subscription_renewed",
            BillingEventType::SubscriptionExtended => "subscription_extended",
            BillingEventType::CreditsGranted => "credits_granted",
        }
    }
}

impl std::fmt::Display for BillingEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A stored event
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct BillingEvent {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub event_type: String,
    pub data: serde_json::Value,
    pub created_at: OffsetDateTime,
}

/// Builder for one event
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    subscription_id: Uuid,
    event_type: BillingEventType,
    data: serde_json::Value,
}

impl BillingEventBuilder {
    pub fn new(subscription_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            subscription_id,
            event_type,
            data: serde_json::json!({}),
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Writes billing events
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, event: BillingEventBuilder) -> BillingResult<()> {
        sqlx::query(
            "INSERT INTO billing_events (subscription_id, event_type, data) VALUES ($1, $2, $3)",
        )
        .bind(event.subscription_id)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Recent events for a subscription, newest first.
    pub async fn events_for(
        &self,
        subscription_id: Uuid,
        limit: i64,
    ) -> BillingResult<Vec<BillingEvent>> {
        let events: Vec<BillingEvent> = sqlx::query_as(
            "SELECT id, subscription_id, event_type, data, created_at
             FROM billing_events
             WHERE subscription_id = $1
             ORDER BY created_at DESC
             LIMIT $2",
        )
        .bind(subscription_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_type_display() {
        assert_eq!(
            BillingEventType::SubscriptionRenewed.to_string(),
            "subscription_renewed"
        );
        assert_eq!(BillingEventType::CreditsGranted.to_string(), "credits_granted");
    }

    #[test]
    fn test_builder_defaults_to_empty_data() {
        let event = BillingEventBuilder::new(Uuid::nil(), BillingEventType::SubscriptionCreated);
        assert_eq!(event.data, serde_json::json!({}));
    }
}
