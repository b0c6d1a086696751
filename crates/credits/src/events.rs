//! Billing event audit log
//!
//! Append-only record of significant billing transitions. Logging failures
//! are reported to the caller but must never fail the operation that
//! triggered them; call sites log a warning and continue.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CreditsResult;

/// Who triggered a billing event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorType {
    User,
    System,
    Stripe,
}

impl ActorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActorType::User => "user",
            ActorType::System => "system",
            ActorType::Stripe => "stripe",
        }
    }
}

/// Billing event types written to the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BillingEventType {
    TrialStarted,
    CheckoutCompleted,
    SubscriptionUpdated,
    SubscriptionCanceled,
    PlanChanged,
    CreditsRefilled,
    RefundIssued,
}

impl BillingEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingEventType::TrialStarted => "trial_started",
            BillingEventType::CheckoutCompleted => "checkout_completed",
            BillingEventType::SubscriptionUpdated => "subscription_updated",
            BillingEventType::SubscriptionCanceled => "subscription_canceled",
            BillingEventType::PlanChanged => "plan_changed",
            BillingEventType::CreditsRefilled => "credits_refilled",
            BillingEventType::RefundIssued => "refund_issued",
        }
    }
}

/// Builder for a billing event row.
#[derive(Debug, Clone)]
pub struct BillingEventBuilder {
    user_id: Uuid,
    event_type: BillingEventType,
    data: serde_json::Value,
    actor_type: ActorType,
    provider_event_id: Option<String>,
    stripe_subscription_id: Option<String>,
}

impl BillingEventBuilder {
    pub fn new(user_id: Uuid, event_type: BillingEventType) -> Self {
        Self {
            user_id,
            event_type,
            data: serde_json::Value::Null,
            actor_type: ActorType::System,
            provider_event_id: None,
            stripe_subscription_id: None,
        }
    }

    pub fn data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn actor_type(mut self, actor: ActorType) -> Self {
        self.actor_type = actor;
        self
    }

    pub fn provider_event(mut self, event_id: &str) -> Self {
        self.provider_event_id = Some(event_id.to_string());
        self
    }

    pub fn stripe_subscription(mut self, subscription_id: impl Into<String>) -> Self {
        self.stripe_subscription_id = Some(subscription_id.into());
        self
    }
}

/// Writes billing events to the `billing_events` table.
#[derive(Clone)]
pub struct BillingEventLogger {
    pool: PgPool,
}

impl BillingEventLogger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn log_event(&self, event: BillingEventBuilder) -> CreditsResult<()> {
        sqlx::query(
            r#"
            INSERT INTO billing_events
                (user_id, event_type, data, actor_type, provider_event_id, stripe_subscription_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.user_id)
        .bind(event.event_type.as_str())
        .bind(&event.data)
        .bind(event.actor_type.as_str())
        .bind(&event.provider_event_id)
        .bind(&event.stripe_subscription_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
