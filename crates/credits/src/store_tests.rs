//! Persistence tests for the ledger and the webhook idempotency store,
//! run against a real Postgres schema via `sqlx::test`.
//!
//! These cover the transactional guarantees the unit tests cannot:
//! debit and its log entry commit together, a rejected debit writes
//! nothing, refunds restore the conservation constraint, concurrent
//! debits cannot overdraw, lazy refill fires once per boundary, and
//! webhook claims deduplicate while failed attempts stay retryable.

use sqlx::PgPool;
use uuid::Uuid;

use crate::error::CreditsError;
use crate::ledger::{ActionDetails, CreditLedger};
use crate::plans::ActionKind;
use crate::webhooks::{decode_event, PriceCatalog, WebhookHandler};
use plume_shared::Plan;

async fn seed_user(pool: &PgPool) -> Uuid {
    let row: (Uuid,) = sqlx::query_as("INSERT INTO users (email) VALUES ($1) RETURNING id")
        .bind(format!("{}@plume.test", Uuid::new_v4()))
        .fetch_one(pool)
        .await
        .unwrap();
    row.0
}

fn tweet_details() -> ActionDetails {
    ActionDetails::TweetGeneration {
        count: 1,
        model: None,
        success: true,
    }
}

// ---------------------------------------------------------------------------
// Debit
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn debit_commits_balance_and_log_together(pool: PgPool) {
    let ledger = CreditLedger::new(pool.clone());
    let user = seed_user(&pool).await;
    ledger.ensure_account(user, Plan::Solo).await.unwrap();

    let txn = ledger.debit(user, 10, tweet_details()).await.unwrap();
    assert_eq!(txn.amount, 10);
    assert_eq!(txn.action, ActionKind::TweetGeneration);

    let account = ledger.get_account(user).await.unwrap().unwrap();
    assert_eq!(account.available, 490);
    assert_eq!(account.used, 10);
    assert_eq!(account.total, 500);

    let history = ledger.get_history(user, 10).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].id, txn.id);
}

#[sqlx::test(migrations = "../../migrations")]
async fn rejected_debit_writes_nothing(pool: PgPool) {
    let ledger = CreditLedger::new(pool.clone());
    let user = seed_user(&pool).await;
    ledger.ensure_account(user, Plan::Free).await.unwrap();

    let err = ledger.debit(user, 30, tweet_details()).await.unwrap_err();
    assert!(matches!(
        err,
        CreditsError::InsufficientCredits {
            available: 25,
            required: 30,
        }
    ));

    // The rollback must leave no transaction row and an untouched balance.
    let history = ledger.get_history(user, 10).await.unwrap();
    assert!(history.is_empty());

    let account = ledger.get_account(user).await.unwrap().unwrap();
    assert_eq!(account.available, 25);
    assert_eq!(account.used, 0);
}

#[sqlx::test(migrations = "../../migrations")]
async fn concurrent_debits_cannot_overdraw(pool: PgPool) {
    let ledger = CreditLedger::new(pool.clone());
    let user = seed_user(&pool).await;
    ledger.ensure_account(user, Plan::Free).await.unwrap();

    // 25 available, two debits of 20: the row lock serializes them and
    // exactly one can win.
    let (a, b) = tokio::join!(
        ledger.debit(user, 20, tweet_details()),
        ledger.debit(user, 20, tweet_details()),
    );
    assert_eq!(a.is_ok() as u8 + b.is_ok() as u8, 1);

    let account = ledger.get_account(user).await.unwrap().unwrap();
    assert_eq!(account.available, 5);
    assert_eq!(account.used, 20);
    assert_eq!(account.total, 25);
}

// ---------------------------------------------------------------------------
// Refund
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn refund_restores_balance_and_annotates_original(pool: PgPool) {
    let ledger = CreditLedger::new(pool.clone());
    let user = seed_user(&pool).await;
    ledger.ensure_account(user, Plan::Solo).await.unwrap();

    let txn = ledger.debit(user, 20, tweet_details()).await.unwrap();
    let refund = ledger
        .refund(user, txn.id, 20, "generation failed")
        .await
        .unwrap();
    assert_eq!(refund.amount, -20);
    assert_eq!(refund.action, ActionKind::Refund);
    assert_eq!(refund.original_transaction_id, Some(txn.id));

    let account = ledger.get_account(user).await.unwrap().unwrap();
    assert_eq!(account.available, 500);
    assert_eq!(account.used, 0);
    assert_eq!(account.total, 500);

    let history = ledger.get_history(user, 10).await.unwrap();
    assert_eq!(history.len(), 2);
    let original = history.iter().find(|t| t.id == txn.id).unwrap();
    assert!(original.refunded);
    assert_eq!(original.refund_amount, Some(20));
    assert_eq!(original.refund_reason.as_deref(), Some("generation failed"));
}

#[sqlx::test(migrations = "../../migrations")]
async fn transaction_refunds_at_most_once(pool: PgPool) {
    let ledger = CreditLedger::new(pool.clone());
    let user = seed_user(&pool).await;
    ledger.ensure_account(user, Plan::Solo).await.unwrap();

    let txn = ledger.debit(user, 20, tweet_details()).await.unwrap();
    ledger.refund(user, txn.id, 10, "partial").await.unwrap();

    let err = ledger.refund(user, txn.id, 10, "again").await.unwrap_err();
    assert!(matches!(err, CreditsError::AlreadyRefunded(id) if id == txn.id));
}

#[sqlx::test(migrations = "../../migrations")]
async fn refund_cannot_exceed_original(pool: PgPool) {
    let ledger = CreditLedger::new(pool.clone());
    let user = seed_user(&pool).await;
    ledger.ensure_account(user, Plan::Solo).await.unwrap();

    let txn = ledger.debit(user, 10, tweet_details()).await.unwrap();
    let err = ledger
        .refund(user, txn.id, 50, "too much")
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CreditsError::RefundExceedsOriginal {
            refund: 50,
            original: 10,
        }
    ));
}

#[sqlx::test(migrations = "../../migrations")]
async fn refund_requires_owning_the_transaction(pool: PgPool) {
    let ledger = CreditLedger::new(pool.clone());
    let owner = seed_user(&pool).await;
    let other = seed_user(&pool).await;
    ledger.ensure_account(owner, Plan::Solo).await.unwrap();
    ledger.ensure_account(other, Plan::Solo).await.unwrap();

    let txn = ledger.debit(owner, 10, tweet_details()).await.unwrap();
    let err = ledger
        .refund(other, txn.id, 10, "not yours")
        .await
        .unwrap_err();
    assert!(matches!(err, CreditsError::OwnershipMismatch));
}

// ---------------------------------------------------------------------------
// Refill
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn refill_fires_once_per_boundary(pool: PgPool) {
    let ledger = CreditLedger::new(pool.clone());
    let user = seed_user(&pool).await;
    ledger.ensure_account(user, Plan::Free).await.unwrap();
    ledger.debit(user, 10, tweet_details()).await.unwrap();

    sqlx::query(
        "UPDATE credit_accounts SET next_refill_at = NOW() - INTERVAL '1 day' WHERE user_id = $1",
    )
    .bind(user)
    .execute(&pool)
    .await
    .unwrap();

    let refreshed = ledger
        .refill_if_due(user, Plan::Free)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(refreshed.available, 25);
    assert_eq!(refreshed.used, 0);
    assert!(refreshed.next_refill_at > time::OffsetDateTime::now_utc());

    // Same boundary, second call is a no-op.
    let again = ledger.refill_if_due(user, Plan::Free).await.unwrap();
    assert!(again.is_none());
}

// ---------------------------------------------------------------------------
// Webhook idempotency
// ---------------------------------------------------------------------------

#[sqlx::test(migrations = "../../migrations")]
async fn webhook_claim_deduplicates_but_failed_attempts_stay_retryable(pool: PgPool) {
    let prices = PriceCatalog::new(vec![], vec![], vec![]);
    let handler = WebhookHandler::new(pool.clone(), "whsec_test".to_string(), prices.clone());

    let payload =
        r#"{"id":"evt_retry_1","type":"invoice.created","created":1756500000,"data":{"object":{}}}"#;
    let decoded = decode_event(payload, &prices).unwrap();

    assert!(handler.claim_event(&decoded).await.unwrap());
    // While the first delivery is in flight, a duplicate loses the claim.
    assert!(!handler.claim_event(&decoded).await.unwrap());

    // A transient failure must not swallow the event: the provider's
    // redelivery claims it again.
    handler
        .record_result("evt_retry_1", "error", Some("store unavailable"))
        .await;
    assert!(handler.claim_event(&decoded).await.unwrap());

    // Once processed successfully, redeliveries deduplicate for good.
    handler.record_result("evt_retry_1", "success", None).await;
    assert!(!handler.claim_event(&decoded).await.unwrap());
}
