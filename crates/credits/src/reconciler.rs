//! Subscription reconciler
//!
//! Keeps the per-user subscription record in sync with payment-provider
//! lifecycle events. The subscription table is mutated exclusively through
//! this module; the credit ledger and the validation gate read it to decide
//! entitlements and refill allotments.
//!
//! Events for the same subscription may arrive out of order; the reconciler
//! applies the last-received event's data as-is (last-write-wins).

use plume_shared::{Plan, SubscriptionStatus};
use serde::Serialize;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CreditsError, CreditsResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::ledger::CreditLedger;

/// Per-user subscription record.
#[derive(Debug, Clone, Serialize)]
pub struct SubscriptionRecord {
    pub user_id: Uuid,
    pub plan: Plan,
    pub status: SubscriptionStatus,
    pub current_period_start: Option<OffsetDateTime>,
    pub current_period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    pub stripe_subscription_id: Option<String>,
    pub stripe_price_id: Option<String>,
    pub updated_at: OffsetDateTime,
}

impl SubscriptionRecord {
    /// Whether the subscription currently grants its plan's entitlements.
    ///
    /// An `active` status with an expired period is a stale read (a missed
    /// or delayed provider event) and must be treated as inactive.
    pub fn is_effectively_active(&self) -> bool {
        let status_ok = matches!(
            self.status,
            SubscriptionStatus::Active | SubscriptionStatus::Trial
        );
        if !status_ok {
            return false;
        }
        match self.current_period_end {
            Some(end) => end > OffsetDateTime::now_utc(),
            // Trials created before first checkout have no period.
            None => true,
        }
    }

    /// Plan whose entitlements apply right now (free when inactive).
    pub fn effective_plan(&self) -> Plan {
        if self.is_effectively_active() {
            self.plan
        } else {
            Plan::Free
        }
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubscriptionRow {
    user_id: Uuid,
    plan: String,
    status: String,
    current_period_start: Option<OffsetDateTime>,
    current_period_end: Option<OffsetDateTime>,
    cancel_at_period_end: bool,
    stripe_subscription_id: Option<String>,
    stripe_price_id: Option<String>,
    updated_at: OffsetDateTime,
}

impl SubscriptionRow {
    /// Unknown plan or status strings in old rows degrade to free/canceled
    /// with a warning instead of failing the read.
    fn into_record(self) -> SubscriptionRecord {
        let plan = Plan::parse(&self.plan).unwrap_or_else(|| {
            tracing::warn!(user_id = %self.user_id, plan = %self.plan, "Unknown plan in subscription row, treating as free");
            Plan::Free
        });
        let status = SubscriptionStatus::parse(&self.status).unwrap_or_else(|| {
            tracing::warn!(user_id = %self.user_id, status = %self.status, "Unknown status in subscription row, treating as canceled");
            SubscriptionStatus::Canceled
        });
        SubscriptionRecord {
            user_id: self.user_id,
            plan,
            status,
            current_period_start: self.current_period_start,
            current_period_end: self.current_period_end,
            cancel_at_period_end: self.cancel_at_period_end,
            stripe_subscription_id: self.stripe_subscription_id,
            stripe_price_id: self.stripe_price_id,
            updated_at: self.updated_at,
        }
    }
}

/// Provider status vocabulary -> internal status, for `updated` events.
///
/// `active` and `trialing` map directly; everything else (`past_due`,
/// `incomplete`, `unpaid`, ...) defaults to `past_due` so entitlements are
/// withheld until the provider reports the subscription healthy again.
pub fn map_updated_status(provider_status: &str) -> SubscriptionStatus {
    match provider_status {
        "active" => SubscriptionStatus::Active,
        "trialing" => SubscriptionStatus::Trial,
        _ => SubscriptionStatus::PastDue,
    }
}

/// Fields consumed from a completed checkout event.
#[derive(Debug, Clone)]
pub struct CheckoutApplication {
    pub user_id: Uuid,
    pub plan: Plan,
    pub provider_subscription_id: String,
    pub price_id: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
    /// Provider reported a trialing state at checkout.
    pub trialing: bool,
}

/// Fields consumed from a subscription-updated event.
#[derive(Debug, Clone)]
pub struct SubscriptionUpdate {
    pub provider_customer_id: String,
    pub provider_subscription_id: String,
    pub plan: Option<Plan>,
    pub provider_status: String,
    pub price_id: Option<String>,
    pub period_start: Option<OffsetDateTime>,
    pub period_end: Option<OffsetDateTime>,
    pub cancel_at_period_end: bool,
}

/// Subscription reconciliation service.
#[derive(Clone)]
pub struct SubscriptionReconciler {
    pool: PgPool,
    ledger: CreditLedger,
    event_logger: BillingEventLogger,
}

impl SubscriptionReconciler {
    pub fn new(pool: PgPool) -> Self {
        let ledger = CreditLedger::new(pool.clone());
        let event_logger = BillingEventLogger::new(pool.clone());
        Self {
            pool,
            ledger,
            event_logger,
        }
    }

    pub async fn get_subscription(
        &self,
        user_id: Uuid,
    ) -> CreditsResult<Option<SubscriptionRecord>> {
        let row: Option<SubscriptionRow> = sqlx::query_as(
            r#"
            SELECT user_id, plan, status, current_period_start, current_period_end,
                   cancel_at_period_end, stripe_subscription_id, stripe_price_id, updated_at
            FROM subscriptions
            WHERE user_id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(SubscriptionRow::into_record))
    }

    /// Resolve a payment-provider customer id to a user id.
    ///
    /// A missing mapping is definitive (`CustomerNotFound`), not retryable;
    /// transient store failures surface as `Database` errors so the caller
    /// can let the provider retry the webhook.
    pub async fn resolve_customer(&self, provider_customer_id: &str) -> CreditsResult<Uuid> {
        let row: Option<(Uuid,)> =
            sqlx::query_as("SELECT id FROM users WHERE stripe_customer_id = $1")
                .bind(provider_customer_id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(|(id,)| id)
            .ok_or_else(|| CreditsError::CustomerNotFound(provider_customer_id.to_string()))
    }

    /// Apply a completed checkout: activate the subscription and grant the
    /// new plan's credit allotment.
    ///
    /// Idempotent under replay: if the stored record already reflects this
    /// subscription, plan, and period, nothing changes and the credit reset
    /// is skipped.
    pub async fn apply_checkout_completed(
        &self,
        checkout: CheckoutApplication,
    ) -> CreditsResult<SubscriptionRecord> {
        if let Some(existing) = self.get_subscription(checkout.user_id).await? {
            let same_subscription = existing.stripe_subscription_id.as_deref()
                == Some(checkout.provider_subscription_id.as_str());
            if same_subscription
                && existing.plan == checkout.plan
                && existing.current_period_end == checkout.period_end
            {
                tracing::info!(
                    user_id = %checkout.user_id,
                    subscription_id = %checkout.provider_subscription_id,
                    "Checkout event already applied, skipping"
                );
                return Ok(existing);
            }
        }

        let status = if checkout.trialing {
            SubscriptionStatus::Trial
        } else {
            SubscriptionStatus::Active
        };

        let record = self
            .upsert_subscription(
                checkout.user_id,
                checkout.plan,
                status,
                checkout.period_start,
                checkout.period_end,
                checkout.cancel_at_period_end,
                Some(&checkout.provider_subscription_id),
                checkout.price_id.as_deref(),
            )
            .await?;

        self.ledger
            .reset_for_plan(checkout.user_id, checkout.plan)
            .await?;

        tracing::info!(
            user_id = %checkout.user_id,
            plan = %checkout.plan,
            status = %status,
            subscription_id = %checkout.provider_subscription_id,
            "Checkout completed"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(checkout.user_id, BillingEventType::CheckoutCompleted)
                    .data(serde_json::json!({
                        "plan": checkout.plan.as_str(),
                        "status": status.as_str(),
                    }))
                    .stripe_subscription(checkout.provider_subscription_id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log checkout event");
        }

        Ok(record)
    }

    /// Apply a subscription-updated event.
    ///
    /// Resolves the provider customer to a user, maps the provider status,
    /// and upserts. A plan change resets the credit allotment immediately.
    pub async fn apply_subscription_updated(
        &self,
        update: SubscriptionUpdate,
    ) -> CreditsResult<SubscriptionRecord> {
        let user_id = self.resolve_customer(&update.provider_customer_id).await?;
        let status = map_updated_status(&update.provider_status);

        let existing = self.get_subscription(user_id).await?;
        let previous_plan = existing.as_ref().map(|s| s.plan);
        let plan = update
            .plan
            .or(previous_plan)
            .unwrap_or(Plan::Free);

        let record = self
            .upsert_subscription(
                user_id,
                plan,
                status,
                update.period_start,
                update.period_end,
                update.cancel_at_period_end,
                Some(&update.provider_subscription_id),
                update.price_id.as_deref(),
            )
            .await?;

        let plan_changed = previous_plan.is_some_and(|p| p != plan);
        if plan_changed {
            self.ledger.reset_for_plan(user_id, plan).await?;
        }

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            status = %status,
            plan_changed = plan_changed,
            subscription_id = %update.provider_subscription_id,
            "Subscription updated"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionUpdated)
                    .data(serde_json::json!({
                        "plan": plan.as_str(),
                        "status": status.as_str(),
                        "cancel_at_period_end": update.cancel_at_period_end,
                    }))
                    .stripe_subscription(update.provider_subscription_id.clone())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription update event");
        }

        Ok(record)
    }

    /// Apply a subscription-deleted event: downgrade to free, mark canceled.
    ///
    /// The canceled record is kept as history; remaining credits are not
    /// clawed back, but entitlement checks fall back to the free plan once
    /// the period lapses.
    pub async fn apply_subscription_deleted(
        &self,
        provider_customer_id: &str,
        provider_subscription_id: &str,
        period_end: Option<OffsetDateTime>,
    ) -> CreditsResult<SubscriptionRecord> {
        let user_id = self.resolve_customer(provider_customer_id).await?;

        let existing = self.get_subscription(user_id).await?;
        let period_end = period_end.or(existing.and_then(|s| s.current_period_end));

        let record = self
            .upsert_subscription(
                user_id,
                Plan::Free,
                SubscriptionStatus::Canceled,
                None,
                period_end,
                true,
                Some(provider_subscription_id),
                None,
            )
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %provider_subscription_id,
            period_end = ?period_end,
            "Subscription deleted"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::SubscriptionCanceled)
                    .stripe_subscription(provider_subscription_id.to_string())
                    .actor_type(ActorType::Stripe),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log subscription canceled event");
        }

        Ok(record)
    }

    /// Trial signup: create the subscription record and the credit account.
    ///
    /// If the account creation fails after the subscription row was created,
    /// the row is rolled back best-effort so a retry starts clean.
    pub async fn start_trial(&self, user_id: Uuid) -> CreditsResult<SubscriptionRecord> {
        let created = sqlx::query(
            r#"
            INSERT INTO subscriptions (user_id, plan, status)
            VALUES ($1, 'free', 'trial')
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if let Err(e) = self.ledger.ensure_account(user_id, Plan::Free).await {
            if created > 0 {
                if let Err(cleanup) = sqlx::query("DELETE FROM subscriptions WHERE user_id = $1")
                    .bind(user_id)
                    .execute(&self.pool)
                    .await
                {
                    tracing::error!(
                        user_id = %user_id,
                        error = %cleanup,
                        "Failed to roll back trial subscription after account creation failure"
                    );
                }
            }
            return Err(e);
        }

        if created > 0 {
            tracing::info!(user_id = %user_id, "Trial started");
            if let Err(e) = self
                .event_logger
                .log_event(
                    BillingEventBuilder::new(user_id, BillingEventType::TrialStarted)
                        .actor_type(ActorType::User),
                )
                .await
            {
                tracing::warn!(error = %e, "Failed to log trial started event");
            }
        }

        self.get_subscription(user_id)
            .await?
            .ok_or(CreditsError::AccountNotFound(user_id))
    }

    /// Direct plan change (the `POST /subscription` surface): set the plan
    /// and reset the credit allotment.
    pub async fn change_plan(&self, user_id: Uuid, plan: Plan) -> CreditsResult<SubscriptionRecord> {
        let existing = self.get_subscription(user_id).await?;
        let status = existing
            .as_ref()
            .map(|s| s.status)
            .unwrap_or(SubscriptionStatus::Active);

        let record = self
            .upsert_subscription(
                user_id,
                plan,
                status,
                existing.as_ref().and_then(|s| s.current_period_start),
                existing.as_ref().and_then(|s| s.current_period_end),
                existing.as_ref().map(|s| s.cancel_at_period_end).unwrap_or(false),
                existing
                    .as_ref()
                    .and_then(|s| s.stripe_subscription_id.as_deref()),
                existing.as_ref().and_then(|s| s.stripe_price_id.as_deref()),
            )
            .await?;

        self.ledger.reset_for_plan(user_id, plan).await?;

        tracing::info!(user_id = %user_id, plan = %plan, "Plan changed");

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::PlanChanged)
                    .data(serde_json::json!({
                        "from_plan": existing.map(|s| s.plan.as_str()),
                        "to_plan": plan.as_str(),
                    }))
                    .actor_type(ActorType::User),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log plan change event");
        }

        Ok(record)
    }

    #[allow(clippy::too_many_arguments)]
    async fn upsert_subscription(
        &self,
        user_id: Uuid,
        plan: Plan,
        status: SubscriptionStatus,
        period_start: Option<OffsetDateTime>,
        period_end: Option<OffsetDateTime>,
        cancel_at_period_end: bool,
        stripe_subscription_id: Option<&str>,
        stripe_price_id: Option<&str>,
    ) -> CreditsResult<SubscriptionRecord> {
        let row: SubscriptionRow = sqlx::query_as(
            r#"
            INSERT INTO subscriptions
                (user_id, plan, status, current_period_start, current_period_end,
                 cancel_at_period_end, stripe_subscription_id, stripe_price_id, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, NOW())
            ON CONFLICT (user_id) DO UPDATE SET
                plan = EXCLUDED.plan,
                status = EXCLUDED.status,
                current_period_start = EXCLUDED.current_period_start,
                current_period_end = EXCLUDED.current_period_end,
                cancel_at_period_end = EXCLUDED.cancel_at_period_end,
                stripe_subscription_id = EXCLUDED.stripe_subscription_id,
                stripe_price_id = EXCLUDED.stripe_price_id,
                updated_at = NOW()
            RETURNING user_id, plan, status, current_period_start, current_period_end,
                      cancel_at_period_end, stripe_subscription_id, stripe_price_id, updated_at
            "#,
        )
        .bind(user_id)
        .bind(plan.as_str())
        .bind(status.as_str())
        .bind(period_start)
        .bind(period_end)
        .bind(cancel_at_period_end)
        .bind(stripe_subscription_id)
        .bind(stripe_price_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.into_record())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn record(status: SubscriptionStatus, period_end: Option<OffsetDateTime>) -> SubscriptionRecord {
        SubscriptionRecord {
            user_id: Uuid::new_v4(),
            plan: Plan::Solo,
            status,
            current_period_start: None,
            current_period_end: period_end,
            cancel_at_period_end: false,
            stripe_subscription_id: Some("sub_123".to_string()),
            stripe_price_id: None,
            updated_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_status_mapping_for_updated_events() {
        assert_eq!(map_updated_status("active"), SubscriptionStatus::Active);
        assert_eq!(map_updated_status("trialing"), SubscriptionStatus::Trial);
        assert_eq!(map_updated_status("past_due"), SubscriptionStatus::PastDue);
        assert_eq!(map_updated_status("incomplete"), SubscriptionStatus::PastDue);
        assert_eq!(map_updated_status("unpaid"), SubscriptionStatus::PastDue);
        assert_eq!(map_updated_status("garbage"), SubscriptionStatus::PastDue);
    }

    #[test]
    fn test_active_with_future_period_is_effective() {
        let sub = record(
            SubscriptionStatus::Active,
            Some(OffsetDateTime::now_utc() + Duration::days(10)),
        );
        assert!(sub.is_effectively_active());
        assert_eq!(sub.effective_plan(), Plan::Solo);
    }

    #[test]
    fn test_stale_active_treated_as_inactive() {
        // Status still says active but the period lapsed: a stale read.
        let sub = record(
            SubscriptionStatus::Active,
            Some(OffsetDateTime::now_utc() - Duration::days(1)),
        );
        assert!(!sub.is_effectively_active());
        assert_eq!(sub.effective_plan(), Plan::Free);
    }

    #[test]
    fn test_trial_without_period_is_effective() {
        let sub = record(SubscriptionStatus::Trial, None);
        assert!(sub.is_effectively_active());
    }

    #[test]
    fn test_canceled_and_past_due_are_inactive() {
        for status in [
            SubscriptionStatus::Canceled,
            SubscriptionStatus::PastDue,
            SubscriptionStatus::Unpaid,
        ] {
            let sub = record(status, Some(OffsetDateTime::now_utc() + Duration::days(10)));
            assert!(!sub.is_effectively_active(), "{status} should be inactive");
            assert_eq!(sub.effective_plan(), Plan::Free);
        }
    }

    #[test]
    fn test_row_conversion_degrades_unknown_values() {
        let row = SubscriptionRow {
            user_id: Uuid::new_v4(),
            plan: "platinum".to_string(),
            status: "paused".to_string(),
            current_period_start: None,
            current_period_end: None,
            cancel_at_period_end: false,
            stripe_subscription_id: None,
            stripe_price_id: None,
            updated_at: OffsetDateTime::now_utc(),
        };
        let record = row.into_record();
        assert_eq!(record.plan, Plan::Free);
        assert_eq!(record.status, SubscriptionStatus::Canceled);
    }
}
