//! Plume Background Worker
//!
//! Handles scheduled jobs:
//! - Monthly credit refill sweep for due accounts (hourly batches)
//! - Ledger invariant checks (daily at 3:00 AM UTC)
//! - Health check heartbeat (every 5 minutes)

use std::time::Duration;

use plume_credits::{CreditLedger, InvariantChecker, SubscriptionReconciler, ViolationSeverity};
use plume_shared::Plan;
use sqlx::postgres::PgPoolOptions;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

/// Create a database connection pool
async fn create_db_pool() -> anyhow::Result<sqlx::PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&database_url)
        .await?;

    info!("Database pool created");
    Ok(pool)
}

/// Accounts swept per refill cycle. Anything left over is picked up by the
/// next hourly run.
const REFILL_BATCH_SIZE: i64 = 500;

/// Apply due refills across one batch of accounts.
async fn run_refill_sweep(ledger: &CreditLedger, reconciler: &SubscriptionReconciler) {
    let due = match ledger.accounts_due_for_refill(REFILL_BATCH_SIZE).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "Failed to list accounts due for refill");
            return;
        }
    };

    let total = due.len();
    let mut refilled = 0;
    let mut errors = 0;

    for user_id in due {
        let plan = match reconciler.get_subscription(user_id).await {
            Ok(sub) => sub.map(|s| s.effective_plan()).unwrap_or(Plan::Free),
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Subscription lookup failed, refilling as free");
                Plan::Free
            }
        };

        match ledger.refill_if_due(user_id, plan).await {
            Ok(Some(account)) => {
                refilled += 1;
                info!(
                    user_id = %user_id,
                    plan = %plan,
                    available = account.available,
                    "Account refilled"
                );
            }
            // Refilled by a concurrent lazy path since being listed.
            Ok(None) => {}
            Err(e) => {
                errors += 1;
                error!(user_id = %user_id, error = %e, "Refill failed");
            }
        }
    }

    info!(
        total = total,
        refilled = refilled,
        errors = errors,
        "Refill sweep complete"
    );
}

/// Run all ledger invariant checks and log violations by severity.
async fn run_invariant_sweep(checker: &InvariantChecker) {
    let summary = match checker.run_all_checks().await {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Invariant check run failed");
            return;
        }
    };

    if summary.healthy {
        info!(
            checks_run = summary.checks_run,
            "All ledger invariants hold"
        );
        return;
    }

    for violation in &summary.violations {
        match violation.severity {
            ViolationSeverity::Critical => error!(
                invariant = %violation.invariant,
                affected_users = violation.user_ids.len(),
                context = %violation.context,
                "CRITICAL invariant violation: {}",
                violation.description
            ),
            ViolationSeverity::High => error!(
                invariant = %violation.invariant,
                affected_users = violation.user_ids.len(),
                "Invariant violation: {}",
                violation.description
            ),
            ViolationSeverity::Medium => warn!(
                invariant = %violation.invariant,
                affected_users = violation.user_ids.len(),
                "Invariant violation: {}",
                violation.description
            ),
        }
    }

    warn!(
        checks_failed = summary.checks_failed,
        violations = summary.violations.len(),
        "Ledger invariant sweep found violations"
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Load environment
    dotenvy::dotenv().ok();

    info!("Starting Plume Worker");

    let pool = create_db_pool().await?;

    let ledger = CreditLedger::new(pool.clone());
    let reconciler = SubscriptionReconciler::new(pool.clone());
    let checker = InvariantChecker::new(pool);

    let scheduler = JobScheduler::new().await?;

    // Job 1: Credit refill sweep (hourly at :15)
    // Catches accounts whose refill boundary passed without a lazy refill.
    let sweep_ledger = ledger.clone();
    let sweep_reconciler = reconciler.clone();
    scheduler
        .add(Job::new_async("0 15 * * * *", move |_uuid, _l| {
            let ledger = sweep_ledger.clone();
            let reconciler = sweep_reconciler.clone();
            Box::pin(async move {
                info!("Running scheduled credit refill sweep");
                run_refill_sweep(&ledger, &reconciler).await;
            })
        })?)
        .await?;
    info!("Scheduled: Credit refill sweep (hourly)");

    // Job 2: Ledger invariant checks (daily at 3:00 AM UTC)
    let invariant_checker = checker.clone();
    scheduler
        .add(Job::new_async("0 0 3 * * *", move |_uuid, _l| {
            let checker = invariant_checker.clone();
            Box::pin(async move {
                info!("Running scheduled ledger invariant checks");
                run_invariant_sweep(&checker).await;
            })
        })?)
        .await?;
    info!("Scheduled: Ledger invariant checks (daily at 3:00 UTC)");

    // Job 3: Health check heartbeat (every 5 minutes)
    scheduler
        .add(Job::new_async("0 */5 * * * *", |_uuid, _l| {
            Box::pin(async move {
                info!("Worker heartbeat - all systems operational");
            })
        })?)
        .await?;
    info!("Scheduled: Health check heartbeat (every 5 minutes)");

    scheduler.start().await?;
    info!("Worker started, all jobs scheduled");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping worker");

    Ok(())
}
