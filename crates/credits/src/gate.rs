//! Credit validation gate
//!
//! Advisory request-time guard. Computes the credit cost of a requested
//! action, checks plan ceilings and the (non-transactional) balance, and
//! authorizes or rejects before expensive downstream work starts. It never
//! mutates the ledger; the authoritative balance check happens inside
//! `CreditLedger::debit`.

use plume_shared::Plan;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CreditsResult;
use crate::plans::{credit_cost, ActionKind, PlanEntitlements};
use crate::reconciler::SubscriptionReconciler;

/// Machine-readable rejection reason.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DenyReason {
    InsufficientCredits,
    PlanLimitExceeded,
    FeatureUnavailable,
    InvalidRequest,
}

/// Outcome of an authorization check.
#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub authorized: bool,
    pub credit_cost: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<DenyReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// HTTP status the route layer should surface (402/403/400).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_hint: Option<u16>,
}

impl GateDecision {
    fn allow(credit_cost: i64) -> Self {
        Self {
            authorized: true,
            credit_cost,
            reason: None,
            message: None,
            status_hint: None,
        }
    }

    fn deny(credit_cost: i64, reason: DenyReason, message: String, status: u16) -> Self {
        Self {
            authorized: false,
            credit_cost,
            reason: Some(reason),
            message: Some(message),
            status_hint: Some(status),
        }
    }
}

/// Inputs to the pure authorization decision, pre-fetched by the service.
#[derive(Debug, Clone, Copy)]
pub struct GateInputs {
    pub entitlements: PlanEntitlements,
    /// Spendable balance from the advisory account read; 0 if no account yet.
    pub available: i64,
    /// Tweet/thread generation requests already made today.
    pub posts_today: i64,
    /// Storage currently charged against the account, in GB.
    pub storage_used_gb: i64,
}

/// Pure authorization decision over pre-fetched inputs.
///
/// Check order: cost validity, capability flags, plan ceilings, then the
/// advisory balance. Ceiling rejections are independent of balance.
pub fn evaluate(inputs: &GateInputs, action: ActionKind, quantity: i64) -> GateDecision {
    let Some(cost) = credit_cost(action, quantity) else {
        return GateDecision::deny(
            0,
            DenyReason::InvalidRequest,
            format!("action {action} with quantity {quantity} has no credit cost"),
            400,
        );
    };

    let ents = &inputs.entitlements;

    match action {
        ActionKind::AiImage if !ents.can_generate_images => {
            return GateDecision::deny(
                cost,
                DenyReason::FeatureUnavailable,
                format!("image generation is not included in the {} plan", ents.plan),
                403,
            );
        }
        ActionKind::AiVideo if !ents.can_generate_videos => {
            return GateDecision::deny(
                cost,
                DenyReason::FeatureUnavailable,
                format!("video generation is not included in the {} plan", ents.plan),
                403,
            );
        }
        _ => {}
    }

    if action.counts_as_post() {
        let projected = inputs.posts_today.saturating_add(quantity);
        if projected > ents.max_posts_per_day {
            return GateDecision::deny(
                cost,
                DenyReason::PlanLimitExceeded,
                format!(
                    "daily post limit reached: {} of {} used today",
                    inputs.posts_today, ents.max_posts_per_day
                ),
                403,
            );
        }
    }

    if action == ActionKind::Storage {
        let projected = inputs.storage_used_gb.saturating_add(quantity);
        if projected > ents.max_storage_gb {
            return GateDecision::deny(
                cost,
                DenyReason::PlanLimitExceeded,
                format!(
                    "storage quota exceeded: {} GB used of {} GB",
                    inputs.storage_used_gb, ents.max_storage_gb
                ),
                403,
            );
        }
    }

    if inputs.available < cost {
        return GateDecision::deny(
            cost,
            DenyReason::InsufficientCredits,
            format!(
                "insufficient credits: {} available, {} required",
                inputs.available, cost
            ),
            402,
        );
    }

    GateDecision::allow(cost)
}

/// Gate service: fetches the decision inputs and delegates to `evaluate`.
#[derive(Clone)]
pub struct CreditGate {
    pool: PgPool,
    reconciler: SubscriptionReconciler,
}

impl CreditGate {
    pub fn new(pool: PgPool) -> Self {
        let reconciler = SubscriptionReconciler::new(pool.clone());
        Self { pool, reconciler }
    }

    /// Authorize `quantity` units of `action` for a user.
    ///
    /// A missing or effectively-inactive subscription falls back to free-plan
    /// entitlements; a missing account reads as zero available credits.
    pub async fn authorize(
        &self,
        user_id: Uuid,
        action: ActionKind,
        quantity: i64,
    ) -> CreditsResult<GateDecision> {
        let plan = self
            .reconciler
            .get_subscription(user_id)
            .await?
            .map(|sub| sub.effective_plan())
            .unwrap_or(Plan::Free);

        let entitlements = PlanEntitlements::for_plan(plan);

        let available: Option<(i64,)> =
            sqlx::query_as("SELECT available FROM credit_accounts WHERE user_id = $1")
                .bind(user_id)
                .fetch_optional(&self.pool)
                .await?;

        let posts_today = if action.counts_as_post() {
            self.posts_today(user_id).await?
        } else {
            0
        };

        let storage_used_gb = if action == ActionKind::Storage {
            self.storage_used_gb(user_id).await?
        } else {
            0
        };

        let inputs = GateInputs {
            entitlements,
            available: available.map(|(a,)| a).unwrap_or(0),
            posts_today,
            storage_used_gb,
        };

        let decision = evaluate(&inputs, action, quantity);
        if !decision.authorized {
            tracing::info!(
                user_id = %user_id,
                action = %action,
                quantity = quantity,
                reason = ?decision.reason,
                "Authorization denied"
            );
        }
        Ok(decision)
    }

    /// Generation requests since midnight UTC, counted from the day's debit
    /// log. The daily cap limits requests, matching the one-unit quantity
    /// the debit path charges per tweet/thread generation.
    async fn posts_today(&self, user_id: Uuid) -> CreditsResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM credit_transactions
            WHERE user_id = $1
              AND action IN ('tweet_generation', 'thread_generation')
              AND NOT refunded
              AND created_at >= date_trunc('day', NOW())
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Storage charged to the account in GB (storage debits net of refunds;
    /// the storage unit cost is 2 credits per GB).
    async fn storage_used_gb(&self, user_id: Uuid) -> CreditsResult<i64> {
        let (credits,): (i64,) = sqlx::query_as(
            r#"
            SELECT COALESCE(SUM(amount - COALESCE(refund_amount, 0)), 0)
            FROM credit_transactions
            WHERE user_id = $1 AND action = 'storage'
            "#,
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(credits / 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solo_inputs() -> GateInputs {
        GateInputs {
            entitlements: PlanEntitlements::solo(),
            available: 500,
            posts_today: 0,
            storage_used_gb: 0,
        }
    }

    #[test]
    fn test_authorizes_with_cost() {
        let decision = evaluate(&solo_inputs(), ActionKind::TweetGeneration, 3);
        assert!(decision.authorized);
        assert_eq!(decision.credit_cost, 30);
        assert!(decision.reason.is_none());
    }

    #[test]
    fn test_insufficient_credits() {
        // Images are permitted on solo, so only the balance check can fire.
        let inputs = GateInputs {
            available: 15,
            ..solo_inputs()
        };
        let decision = evaluate(&inputs, ActionKind::AiImage, 10);
        assert!(!decision.authorized);
        assert_eq!(decision.credit_cost, 20);
        assert_eq!(decision.reason, Some(DenyReason::InsufficientCredits));
        assert_eq!(decision.status_hint, Some(402));
    }

    #[test]
    fn test_feature_flag_checked_before_balance() {
        // Plenty of credits, but free plan cannot generate images.
        let inputs = GateInputs {
            entitlements: PlanEntitlements::free(),
            available: 1_000,
            posts_today: 0,
            storage_used_gb: 0,
        };
        let decision = evaluate(&inputs, ActionKind::AiImage, 1);
        assert!(!decision.authorized);
        assert_eq!(decision.reason, Some(DenyReason::FeatureUnavailable));
        assert_eq!(decision.status_hint, Some(403));
    }

    #[test]
    fn test_video_requires_team_plan() {
        let decision = evaluate(&solo_inputs(), ActionKind::AiVideo, 1);
        assert!(!decision.authorized);
        assert_eq!(decision.reason, Some(DenyReason::FeatureUnavailable));

        let team = GateInputs {
            entitlements: PlanEntitlements::team(),
            available: 2_000,
            posts_today: 0,
            storage_used_gb: 0,
        };
        assert!(evaluate(&team, ActionKind::AiVideo, 1).authorized);
    }

    #[test]
    fn test_daily_post_cap() {
        let inputs = GateInputs {
            posts_today: 29,
            ..solo_inputs()
        };
        // Solo allows 30/day: one more fits, two do not.
        assert!(evaluate(&inputs, ActionKind::TweetGeneration, 1).authorized);

        let denied = evaluate(&inputs, ActionKind::TweetGeneration, 2);
        assert!(!denied.authorized);
        assert_eq!(denied.reason, Some(DenyReason::PlanLimitExceeded));
        assert_eq!(denied.status_hint, Some(403));
    }

    #[test]
    fn test_post_cap_independent_of_balance() {
        // Cap rejection fires even though the balance could cover the cost.
        let inputs = GateInputs {
            posts_today: 30,
            available: 500,
            ..solo_inputs()
        };
        let decision = evaluate(&inputs, ActionKind::ThreadGeneration, 1);
        assert_eq!(decision.reason, Some(DenyReason::PlanLimitExceeded));
    }

    #[test]
    fn test_storage_quota() {
        let inputs = GateInputs {
            storage_used_gb: 9,
            ..solo_inputs()
        };
        assert!(evaluate(&inputs, ActionKind::Storage, 1).authorized);

        let denied = evaluate(&inputs, ActionKind::Storage, 2);
        assert!(!denied.authorized);
        assert_eq!(denied.reason, Some(DenyReason::PlanLimitExceeded));
    }

    #[test]
    fn test_refund_is_not_authorizable() {
        let decision = evaluate(&solo_inputs(), ActionKind::Refund, 1);
        assert!(!decision.authorized);
        assert_eq!(decision.reason, Some(DenyReason::InvalidRequest));
        assert_eq!(decision.status_hint, Some(400));
    }

    #[test]
    fn test_zero_quantity_rejected() {
        let decision = evaluate(&solo_inputs(), ActionKind::AiImage, 0);
        assert!(!decision.authorized);
        assert_eq!(decision.reason, Some(DenyReason::InvalidRequest));
    }
}
