//! Credit system invariants
//!
//! Runnable consistency checks over the ledger and subscription tables.
//! Each check is a plain SQL query that only reads; violations carry enough
//! context to debug. The worker runs the full suite daily, and the suite is
//! cheap enough to run after a webhook replay or a support investigation.

use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::CreditsResult;

/// A single invariant violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    /// Which invariant was violated.
    pub invariant: String,
    /// Affected user(s).
    pub user_ids: Vec<Uuid>,
    /// Human-readable description.
    pub description: String,
    /// Additional context for debugging.
    pub context: serde_json::Value,
    pub severity: ViolationSeverity,
}

/// Severity of an invariant violation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ViolationSeverity {
    /// Balances may be wrong; users could be over- or under-charged.
    Critical,
    /// Data inconsistency that needs attention.
    High,
    /// Potential issue, investigate.
    Medium,
}

impl std::fmt::Display for ViolationSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ViolationSeverity::Critical => write!(f, "CRITICAL"),
            ViolationSeverity::High => write!(f, "HIGH"),
            ViolationSeverity::Medium => write!(f, "MEDIUM"),
        }
    }
}

/// Summary of a full invariant run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantCheckSummary {
    pub checked_at: OffsetDateTime,
    pub checks_run: usize,
    pub checks_passed: usize,
    pub checks_failed: usize,
    pub violations: Vec<InvariantViolation>,
    pub healthy: bool,
}

#[derive(Debug, sqlx::FromRow)]
struct ConservationRow {
    user_id: Uuid,
    available: i64,
    used: i64,
    total: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct LedgerMismatchRow {
    user_id: Uuid,
    used: i64,
    ledger_sum: i64,
}

#[derive(Debug, sqlx::FromRow)]
struct StaleActiveRow {
    user_id: Uuid,
    current_period_end: Option<OffsetDateTime>,
}

#[derive(Debug, sqlx::FromRow)]
struct CanceledNoPeriodEndRow {
    user_id: Uuid,
}

#[derive(Debug, sqlx::FromRow)]
struct BadRefundAnnotationRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    refund_amount: Option<i64>,
}

/// Service for running credit invariant checks.
#[derive(Clone)]
pub struct InvariantChecker {
    pool: PgPool,
}

impl InvariantChecker {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run all invariant checks and return a summary.
    pub async fn run_all_checks(&self) -> CreditsResult<InvariantCheckSummary> {
        let now = OffsetDateTime::now_utc();
        let mut violations = Vec::new();

        violations.extend(self.check_conservation().await?);
        violations.extend(self.check_ledger_matches_used().await?);
        violations.extend(self.check_active_not_expired().await?);
        violations.extend(self.check_canceled_has_period_end().await?);
        violations.extend(self.check_refund_annotations().await?);

        let checks_run = 5;
        let checks_failed = violations
            .iter()
            .map(|v| &v.invariant)
            .collect::<std::collections::HashSet<_>>()
            .len();
        let checks_passed = checks_run - checks_failed;

        Ok(InvariantCheckSummary {
            checked_at: now,
            checks_run,
            checks_passed,
            checks_failed,
            healthy: violations.is_empty(),
            violations,
        })
    }

    /// Invariant 1: `available + used == total` for every account.
    ///
    /// The schema enforces this with a CHECK constraint, so a violation here
    /// means the constraint was dropped or bypassed.
    async fn check_conservation(&self) -> CreditsResult<Vec<InvariantViolation>> {
        let rows: Vec<ConservationRow> = sqlx::query_as(
            r#"
            SELECT user_id, available, used, total
            FROM credit_accounts
            WHERE available + used != total
               OR available < 0
               OR used < 0
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "credit_conservation".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Account balance {} + {} used != {} total",
                    row.available, row.used, row.total
                ),
                context: serde_json::json!({
                    "available": row.available,
                    "used": row.used,
                    "total": row.total,
                }),
                severity: ViolationSeverity::Critical,
            })
            .collect())
    }

    /// Invariant 2: the transaction log since the last refill sums to `used`.
    ///
    /// Scoped to the current refill window because `used` resets monthly
    /// while the log is append-only. A refund of a pre-refill debit lands
    /// outside the window, so this is Medium rather than Critical.
    async fn check_ledger_matches_used(&self) -> CreditsResult<Vec<InvariantViolation>> {
        let rows: Vec<LedgerMismatchRow> = sqlx::query_as(
            r#"
            SELECT a.user_id, a.used, x.ledger_sum
            FROM credit_accounts a
            CROSS JOIN LATERAL (
                SELECT COALESCE(SUM(t.amount), 0) AS ledger_sum
                FROM credit_transactions t
                WHERE t.user_id = a.user_id
                  AND t.created_at >= a.last_refill_at
            ) x
            WHERE x.ledger_sum != a.used
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "ledger_matches_used".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Transaction log sums to {} but account shows {} used",
                    row.ledger_sum, row.used
                ),
                context: serde_json::json!({
                    "ledger_sum": row.ledger_sum,
                    "used": row.used,
                }),
                severity: ViolationSeverity::Medium,
            })
            .collect())
    }

    /// Invariant 3: no `active` subscription with an expired period.
    ///
    /// Consumers already treat these as inactive, but the stale row means a
    /// provider event was missed or a renewal never came through.
    async fn check_active_not_expired(&self) -> CreditsResult<Vec<InvariantViolation>> {
        let rows: Vec<StaleActiveRow> = sqlx::query_as(
            r#"
            SELECT user_id, current_period_end
            FROM subscriptions
            WHERE status = 'active'
              AND current_period_end IS NOT NULL
              AND current_period_end < NOW()
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "active_not_expired".to_string(),
                user_ids: vec![row.user_id],
                description: "Subscription is active but its period has lapsed".to_string(),
                context: serde_json::json!({
                    "current_period_end": row.current_period_end,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 4: canceled subscriptions keep a period end, so access
    /// revocation has a defined point in time.
    async fn check_canceled_has_period_end(&self) -> CreditsResult<Vec<InvariantViolation>> {
        let rows: Vec<CanceledNoPeriodEndRow> = sqlx::query_as(
            r#"
            SELECT user_id
            FROM subscriptions
            WHERE status = 'canceled'
              AND current_period_end IS NULL
              AND stripe_subscription_id IS NOT NULL
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "canceled_has_period_end".to_string(),
                user_ids: vec![row.user_id],
                description: "Canceled subscription has no period_end date".to_string(),
                context: serde_json::Value::Null,
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Invariant 5: refund annotations are self-consistent — a refunded
    /// debit carries a refund amount no larger than the original.
    async fn check_refund_annotations(&self) -> CreditsResult<Vec<InvariantViolation>> {
        let rows: Vec<BadRefundAnnotationRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, refund_amount
            FROM credit_transactions
            WHERE refunded = TRUE
              AND (refund_amount IS NULL OR refund_amount <= 0 OR refund_amount > amount)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|row| InvariantViolation {
                invariant: "refund_annotation_consistent".to_string(),
                user_ids: vec![row.user_id],
                description: format!(
                    "Refunded transaction {} has refund amount {:?} against original {}",
                    row.id, row.refund_amount, row.amount
                ),
                context: serde_json::json!({
                    "transaction_id": row.id,
                    "amount": row.amount,
                    "refund_amount": row.refund_amount,
                }),
                severity: ViolationSeverity::High,
            })
            .collect())
    }

    /// Run a single invariant check by name.
    pub async fn run_check(&self, name: &str) -> CreditsResult<Vec<InvariantViolation>> {
        match name {
            "credit_conservation" => self.check_conservation().await,
            "ledger_matches_used" => self.check_ledger_matches_used().await,
            "active_not_expired" => self.check_active_not_expired().await,
            "canceled_has_period_end" => self.check_canceled_has_period_end().await,
            "refund_annotation_consistent" => self.check_refund_annotations().await,
            _ => Ok(vec![]),
        }
    }

    /// All available invariant check names.
    pub fn available_checks() -> Vec<&'static str> {
        vec![
            "credit_conservation",
            "ledger_matches_used",
            "active_not_expired",
            "canceled_has_period_end",
            "refund_annotation_consistent",
        ]
    }
}
