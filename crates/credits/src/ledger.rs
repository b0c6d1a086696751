//! Credit ledger
//!
//! Owns the per-user balance record and the append-only transaction log.
//! Every balance mutation runs inside a single SQL transaction with a
//! `FOR UPDATE` row lock on the account, so concurrent debits on the same
//! account serialize and can never overdraw it. Account creation is a
//! conditional insert keyed by user id, which makes `ensure_account` safe
//! under concurrent first-use races across any number of server instances.

use plume_shared::Plan;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{CreditsError, CreditsResult};
use crate::events::{ActorType, BillingEventBuilder, BillingEventLogger, BillingEventType};
use crate::plans::{ActionKind, PlanEntitlements};

/// Per-user credit balance record.
///
/// Conservation invariant: `available + used == total` after every mutation.
/// A refund applied after a refill can push `total` above the plan allotment
/// until the next refill resets the counters.
#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct CreditAccount {
    pub user_id: Uuid,
    pub available: i64,
    pub used: i64,
    pub total: i64,
    pub last_refill_at: OffsetDateTime,
    pub next_refill_at: OffsetDateTime,
    pub can_purchase_credits: bool,
}

/// Action-specific transaction metadata.
///
/// Modeled as a closed variant per action kind so each action's required
/// fields are enforced at compile time rather than carried in a loose bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionDetails {
    TweetGeneration {
        count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        success: bool,
    },
    ThreadGeneration {
        count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        success: bool,
    },
    AiVideo {
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        duration_seconds: Option<u32>,
        success: bool,
    },
    AiImage {
        count: u32,
        #[serde(skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        success: bool,
    },
    TweetRewrite {
        success: bool,
    },
    Storage {
        size_gb: u32,
    },
    Refund {
        original_transaction_id: Uuid,
        reason: String,
    },
}

impl ActionDetails {
    /// The action kind this metadata belongs to.
    pub fn action(&self) -> ActionKind {
        match self {
            ActionDetails::TweetGeneration { .. } => ActionKind::TweetGeneration,
            ActionDetails::ThreadGeneration { .. } => ActionKind::ThreadGeneration,
            ActionDetails::AiVideo { .. } => ActionKind::AiVideo,
            ActionDetails::AiImage { .. } => ActionKind::AiImage,
            ActionDetails::TweetRewrite { .. } => ActionKind::TweetRewrite,
            ActionDetails::Storage { .. } => ActionKind::Storage,
            ActionDetails::Refund { .. } => ActionKind::Refund,
        }
    }
}

/// One row of the append-only usage/refund log.
///
/// Immutable once written, except for the refund annotation fields on the
/// original debit.
#[derive(Debug, Clone, Serialize)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Positive for debits, negative for refunds.
    pub amount: i64,
    pub action: ActionKind,
    pub details: ActionDetails,
    pub refunded: bool,
    pub refunded_at: Option<OffsetDateTime>,
    pub refund_amount: Option<i64>,
    pub refund_reason: Option<String>,
    pub original_transaction_id: Option<Uuid>,
    pub created_at: OffsetDateTime,
}

/// Loosely-typed row used by the history query so one malformed historical
/// record cannot abort the whole read.
#[derive(Debug, sqlx::FromRow)]
struct HistoryRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    action: String,
    details: serde_json::Value,
    refunded: bool,
    refunded_at: Option<OffsetDateTime>,
    refund_amount: Option<i64>,
    refund_reason: Option<String>,
    original_transaction_id: Option<Uuid>,
    created_at: OffsetDateTime,
}

fn decode_history_row(row: HistoryRow) -> Option<CreditTransaction> {
    let action = ActionKind::parse(&row.action)?;
    let details: ActionDetails = serde_json::from_value(row.details).ok()?;
    Some(CreditTransaction {
        id: row.id,
        user_id: row.user_id,
        amount: row.amount,
        action,
        details,
        refunded: row.refunded,
        refunded_at: row.refunded_at,
        refund_amount: row.refund_amount,
        refund_reason: row.refund_reason,
        original_transaction_id: row.original_transaction_id,
        created_at: row.created_at,
    })
}

/// Midnight UTC on the first day of the month after `now`.
pub fn first_of_next_month(now: OffsetDateTime) -> OffsetDateTime {
    let date = now.date();
    let (year, month) = if date.month() == time::Month::December {
        (date.year() + 1, time::Month::January)
    } else {
        (date.year(), date.month().next())
    };
    // Day 1 always exists; fall back to the input date to satisfy the
    // no-panic lint.
    time::Date::from_calendar_date(year, month, 1)
        .unwrap_or(date)
        .midnight()
        .assume_utc()
}

const ACCOUNT_COLUMNS: &str =
    "user_id, available, used, total, last_refill_at, next_refill_at, can_purchase_credits";

fn retry_strategy() -> impl Iterator<Item = std::time::Duration> {
    ExponentialBackoff::from_millis(50).map(jitter).take(3)
}

/// Transactional credit ledger service.
#[derive(Clone)]
pub struct CreditLedger {
    pool: PgPool,
    event_logger: BillingEventLogger,
}

impl CreditLedger {
    pub fn new(pool: PgPool) -> Self {
        let event_logger = BillingEventLogger::new(pool.clone());
        Self { pool, event_logger }
    }

    /// Idempotent account initializer.
    ///
    /// Creates the account with the plan's full monthly allotment if it does
    /// not exist; returns the existing account unchanged otherwise. Safe to
    /// retry blindly, so transient store conflicts are retried with backoff.
    pub async fn ensure_account(&self, user_id: Uuid, plan: Plan) -> CreditsResult<CreditAccount> {
        RetryIf::spawn(
            retry_strategy(),
            || self.ensure_account_once(user_id, plan),
            |e: &CreditsError| e.is_retryable(),
        )
        .await
    }

    async fn ensure_account_once(&self, user_id: Uuid, plan: Plan) -> CreditsResult<CreditAccount> {
        let entitlements = PlanEntitlements::for_plan(plan);
        let next_refill = first_of_next_month(OffsetDateTime::now_utc());

        let created = sqlx::query(
            r#"
            INSERT INTO credit_accounts
                (user_id, available, used, total, next_refill_at, can_purchase_credits)
            VALUES ($1, $2, 0, $2, $3, $4)
            ON CONFLICT (user_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(entitlements.ai_credits_per_month)
        .bind(next_refill)
        .bind(entitlements.can_buy_credits)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if created > 0 {
            tracing::info!(
                user_id = %user_id,
                plan = %plan,
                allotment = entitlements.ai_credits_per_month,
                "Created credit account"
            );
        }

        let account: Option<CreditAccount> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        account.ok_or(CreditsError::AccountNotFound(user_id))
    }

    /// Fetch an account without locking it. Advisory read only; the
    /// authoritative balance check happens inside `debit`.
    pub async fn get_account(&self, user_id: Uuid) -> CreditsResult<Option<CreditAccount>> {
        let account = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE user_id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(account)
    }

    /// Atomic debit.
    ///
    /// The balance check and deduction happen under a row lock, so two
    /// concurrent debits that would together overdraw the account cannot
    /// both succeed. On rejection nothing is written, including the
    /// transaction log entry.
    pub async fn debit(
        &self,
        user_id: Uuid,
        amount: i64,
        details: ActionDetails,
    ) -> CreditsResult<CreditTransaction> {
        if amount <= 0 {
            return Err(CreditsError::InvalidAmount(format!(
                "debit amount must be positive, got {amount}"
            )));
        }
        let action = details.action();
        if action == ActionKind::Refund {
            return Err(CreditsError::InvalidAmount(
                "refunds must go through refund(), not debit()".to_string(),
            ));
        }

        let mut tx = self.pool.begin().await?;

        let account: Option<CreditAccount> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let account = account.ok_or(CreditsError::AccountNotFound(user_id))?;

        if account.available < amount {
            // Dropping the transaction rolls back; no partial writes.
            return Err(CreditsError::InsufficientCredits {
                available: account.available,
                required: amount,
            });
        }

        sqlx::query(
            r#"
            UPDATE credit_accounts
            SET available = available - $1, used = used + $1, updated_at = NOW()
            WHERE user_id = $2
            "#,
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut *tx)
        .await?;

        let details_json = serde_json::to_value(&details)
            .map_err(|e| CreditsError::Database(format!("failed to encode details: {e}")))?;

        let (id, created_at): (Uuid, OffsetDateTime) = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions (user_id, amount, action, details)
            VALUES ($1, $2, $3, $4)
            RETURNING id, created_at
            "#,
        )
        .bind(user_id)
        .bind(amount)
        .bind(action.as_str())
        .bind(&details_json)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            transaction_id = %id,
            amount = amount,
            action = %action,
            remaining = account.available - amount,
            "Debited credits"
        );

        Ok(CreditTransaction {
            id,
            user_id,
            amount,
            action,
            details,
            refunded: false,
            refunded_at: None,
            refund_amount: None,
            refund_reason: None,
            original_transaction_id: None,
            created_at,
        })
    }

    /// Reverse a prior debit.
    ///
    /// Records a new negative-amount transaction and annotates the original.
    /// A transaction can be refunded at most once; partial refunds up to the
    /// original amount are allowed.
    pub async fn refund(
        &self,
        user_id: Uuid,
        original_transaction_id: Uuid,
        amount: i64,
        reason: &str,
    ) -> CreditsResult<CreditTransaction> {
        if amount <= 0 {
            return Err(CreditsError::InvalidAmount(format!(
                "refund amount must be positive, got {amount}"
            )));
        }

        let mut tx = self.pool.begin().await?;

        let original: Option<HistoryRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, action, details, refunded, refunded_at,
                   refund_amount, refund_reason, original_transaction_id, created_at
            FROM credit_transactions
            WHERE id = $1
            FOR UPDATE
            "#,
        )
        .bind(original_transaction_id)
        .fetch_optional(&mut *tx)
        .await?;

        let original =
            original.ok_or(CreditsError::TransactionNotFound(original_transaction_id))?;

        if original.user_id != user_id {
            return Err(CreditsError::OwnershipMismatch);
        }
        if original.action == ActionKind::Refund.as_str() || original.amount <= 0 {
            return Err(CreditsError::InvalidAmount(
                "only debit transactions can be refunded".to_string(),
            ));
        }
        if original.refunded {
            return Err(CreditsError::AlreadyRefunded(original_transaction_id));
        }
        if amount > original.amount {
            return Err(CreditsError::RefundExceedsOriginal {
                refund: amount,
                original: original.amount,
            });
        }

        // A refill between the debit and the refund resets `used` to 0, so
        // the decrement is clamped and `total` recomputed to preserve the
        // conservation constraint.
        let updated = sqlx::query(
            r#"
            UPDATE credit_accounts
            SET available = available + $1,
                used = GREATEST(used - $1, 0),
                total = available + $1 + GREATEST(used - $1, 0),
                updated_at = NOW()
            WHERE user_id = $2
            "#,
        )
        .bind(amount)
        .bind(user_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            return Err(CreditsError::AccountNotFound(user_id));
        }

        sqlx::query(
            r#"
            UPDATE credit_transactions
            SET refunded = TRUE, refunded_at = NOW(), refund_amount = $1, refund_reason = $2
            WHERE id = $3
            "#,
        )
        .bind(amount)
        .bind(reason)
        .bind(original_transaction_id)
        .execute(&mut *tx)
        .await?;

        let details = ActionDetails::Refund {
            original_transaction_id,
            reason: reason.to_string(),
        };
        let details_json = serde_json::to_value(&details)
            .map_err(|e| CreditsError::Database(format!("failed to encode details: {e}")))?;

        let (id, created_at): (Uuid, OffsetDateTime) = sqlx::query_as(
            r#"
            INSERT INTO credit_transactions
                (user_id, amount, action, details, original_transaction_id)
            VALUES ($1, $2, 'refund', $3, $4)
            RETURNING id, created_at
            "#,
        )
        .bind(user_id)
        .bind(-amount)
        .bind(&details_json)
        .bind(original_transaction_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            original_transaction_id = %original_transaction_id,
            refund_transaction_id = %id,
            amount = amount,
            reason = %reason,
            "Refunded credits"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::RefundIssued)
                    .data(serde_json::json!({
                        "original_transaction_id": original_transaction_id,
                        "amount": amount,
                        "reason": reason,
                    }))
                    .actor_type(ActorType::System),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log refund event");
        }

        Ok(CreditTransaction {
            id,
            user_id,
            amount: -amount,
            action: ActionKind::Refund,
            details,
            refunded: false,
            refunded_at: None,
            refund_amount: None,
            refund_reason: None,
            original_transaction_id: Some(original_transaction_id),
            created_at,
        })
    }

    /// Most recent `limit` transactions, newest first.
    ///
    /// Rows that no longer decode (legacy action names, malformed details)
    /// are skipped with a warning rather than failing the query. A backing
    /// index that is still building surfaces as `IndexingInProgress`, which
    /// is retryable and distinct from an empty history.
    pub async fn get_history(
        &self,
        user_id: Uuid,
        limit: i64,
    ) -> CreditsResult<Vec<CreditTransaction>> {
        let limit = limit.clamp(1, 100);

        let rows: Vec<HistoryRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, action, details, refunded, refunded_at,
                   refund_amount, refund_reason, original_transaction_id, created_at
            FROM credit_transactions
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        let mut transactions = Vec::with_capacity(rows.len());
        for row in rows {
            let row_id = row.id;
            match decode_history_row(row) {
                Some(txn) => transactions.push(txn),
                None => {
                    tracing::warn!(
                        user_id = %user_id,
                        transaction_id = %row_id,
                        "Skipping malformed transaction record in history"
                    );
                }
            }
        }
        Ok(transactions)
    }

    /// Lazy monthly refill, invoked before any debit or entitlement check.
    ///
    /// Resets the counters to the plan's allotment once the refill boundary
    /// has passed. Idempotent per boundary, safe to retry blindly.
    pub async fn refill_if_due(
        &self,
        user_id: Uuid,
        plan: Plan,
    ) -> CreditsResult<Option<CreditAccount>> {
        RetryIf::spawn(
            retry_strategy(),
            || self.refill_if_due_once(user_id, plan),
            |e: &CreditsError| e.is_retryable(),
        )
        .await
    }

    async fn refill_if_due_once(
        &self,
        user_id: Uuid,
        plan: Plan,
    ) -> CreditsResult<Option<CreditAccount>> {
        let mut tx = self.pool.begin().await?;

        let account: Option<CreditAccount> = sqlx::query_as(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM credit_accounts WHERE user_id = $1 FOR UPDATE"
        ))
        .bind(user_id)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(account) = account else {
            return Ok(None);
        };

        let now = OffsetDateTime::now_utc();
        if now < account.next_refill_at {
            return Ok(None);
        }

        let entitlements = PlanEntitlements::for_plan(plan);
        let next_refill = first_of_next_month(now);

        let refreshed: CreditAccount = sqlx::query_as(&format!(
            r#"
            UPDATE credit_accounts
            SET available = $1, used = 0, total = $1,
                last_refill_at = $2, next_refill_at = $3,
                can_purchase_credits = $4, updated_at = NOW()
            WHERE user_id = $5
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(entitlements.ai_credits_per_month)
        .bind(now)
        .bind(next_refill)
        .bind(entitlements.can_buy_credits)
        .bind(user_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            allotment = entitlements.ai_credits_per_month,
            next_refill_at = %next_refill,
            "Refilled credits"
        );

        if let Err(e) = self
            .event_logger
            .log_event(
                BillingEventBuilder::new(user_id, BillingEventType::CreditsRefilled)
                    .data(serde_json::json!({
                        "plan": plan.as_str(),
                        "allotment": entitlements.ai_credits_per_month,
                    })),
            )
            .await
        {
            tracing::warn!(error = %e, "Failed to log refill event");
        }

        Ok(Some(refreshed))
    }

    /// Reset the account to a plan's allotment immediately.
    ///
    /// Used on plan changes and completed checkouts: the new plan's credits
    /// take effect at once rather than waiting for the monthly boundary.
    pub async fn reset_for_plan(&self, user_id: Uuid, plan: Plan) -> CreditsResult<CreditAccount> {
        let entitlements = PlanEntitlements::for_plan(plan);
        let now = OffsetDateTime::now_utc();
        let next_refill = first_of_next_month(now);

        let account: CreditAccount = sqlx::query_as(&format!(
            r#"
            INSERT INTO credit_accounts
                (user_id, available, used, total, last_refill_at, next_refill_at, can_purchase_credits)
            VALUES ($1, $2, 0, $2, $3, $4, $5)
            ON CONFLICT (user_id) DO UPDATE SET
                available = EXCLUDED.available,
                used = 0,
                total = EXCLUDED.total,
                last_refill_at = EXCLUDED.last_refill_at,
                next_refill_at = EXCLUDED.next_refill_at,
                can_purchase_credits = EXCLUDED.can_purchase_credits,
                updated_at = NOW()
            RETURNING {ACCOUNT_COLUMNS}
            "#
        ))
        .bind(user_id)
        .bind(entitlements.ai_credits_per_month)
        .bind(now)
        .bind(next_refill)
        .bind(entitlements.can_buy_credits)
        .fetch_one(&self.pool)
        .await?;

        tracing::info!(
            user_id = %user_id,
            plan = %plan,
            allotment = entitlements.ai_credits_per_month,
            "Reset credit account for plan"
        );

        Ok(account)
    }

    /// Accounts whose refill boundary has passed (worker sweep input).
    pub async fn accounts_due_for_refill(&self, batch: i64) -> CreditsResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT user_id FROM credit_accounts
            WHERE next_refill_at <= NOW()
            ORDER BY next_refill_at
            LIMIT $1
            "#,
        )
        .bind(batch)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn test_first_of_next_month_mid_month() {
        let now = datetime!(2026-03-14 09:26:00 UTC);
        assert_eq!(first_of_next_month(now), datetime!(2026-04-01 00:00:00 UTC));
    }

    #[test]
    fn test_first_of_next_month_december_rollover() {
        let now = datetime!(2025-12-31 23:59:59 UTC);
        assert_eq!(first_of_next_month(now), datetime!(2026-01-01 00:00:00 UTC));
    }

    #[test]
    fn test_first_of_next_month_on_boundary() {
        // Already the first: next refill is still a full month away.
        let now = datetime!(2026-05-01 00:00:00 UTC);
        assert_eq!(first_of_next_month(now), datetime!(2026-06-01 00:00:00 UTC));
    }

    #[test]
    fn test_details_action_mapping() {
        let details = ActionDetails::TweetGeneration {
            count: 10,
            model: None,
            success: true,
        };
        assert_eq!(details.action(), ActionKind::TweetGeneration);

        let details = ActionDetails::Storage { size_gb: 3 };
        assert_eq!(details.action(), ActionKind::Storage);

        let details = ActionDetails::Refund {
            original_transaction_id: Uuid::new_v4(),
            reason: "generation failed".to_string(),
        };
        assert_eq!(details.action(), ActionKind::Refund);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_details_wire_format() {
        let details = ActionDetails::AiImage {
            count: 2,
            model: Some("flux-pro".to_string()),
            success: true,
        };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["kind"], "ai_image");
        assert_eq!(json["count"], 2);
        assert_eq!(json["model"], "flux-pro");

        let back: ActionDetails = serde_json::from_value(json).unwrap();
        assert_eq!(back, details);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_details_omits_absent_model() {
        let details = ActionDetails::TweetRewrite { success: false };
        let json = serde_json::to_value(&details).unwrap();
        assert_eq!(json["kind"], "tweet_rewrite");
        assert!(json.get("model").is_none());
    }

    fn history_row(action: &str, details: serde_json::Value) -> HistoryRow {
        HistoryRow {
            id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
            amount: 10,
            action: action.to_string(),
            details,
            refunded: false,
            refunded_at: None,
            refund_amount: None,
            refund_reason: None,
            original_transaction_id: None,
            created_at: OffsetDateTime::now_utc(),
        }
    }

    #[test]
    fn test_decode_history_row_valid() {
        let row = history_row(
            "tweet_generation",
            serde_json::json!({ "kind": "tweet_generation", "count": 1, "success": true }),
        );
        let txn = decode_history_row(row);
        assert!(txn.is_some());
        #[allow(clippy::unwrap_used)]
        let txn = txn.unwrap();
        assert_eq!(txn.action, ActionKind::TweetGeneration);
    }

    #[test]
    fn test_decode_history_row_skips_unknown_action() {
        let row = history_row("legacy_bulk_post", serde_json::json!({}));
        assert!(decode_history_row(row).is_none());
    }

    #[test]
    fn test_decode_history_row_skips_malformed_details() {
        let row = history_row(
            "ai_image",
            serde_json::json!({ "kind": "ai_image", "count": "not-a-number" }),
        );
        assert!(decode_history_row(row).is_none());
    }
}
