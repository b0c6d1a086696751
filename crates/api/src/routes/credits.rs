//! Credit ledger routes
//!
//! Debit, history, and refund. Every handler authenticates via `AuthUser`
//! and goes through the validation gate before touching the ledger.

use axum::{
    extract::{Query, State},
    Json,
};
use plume_credits::{ActionDetails, CreditTransaction, GateDecision};
use plume_shared::Plan;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

#[derive(Debug, Deserialize)]
pub struct DebitRequest {
    pub details: ActionDetails,
}

#[derive(Debug, Serialize)]
pub struct DebitResponse {
    pub transaction: CreditTransaction,
    /// Balance remaining after the debit.
    pub available: i64,
}

/// Units the gate should price for a given action's metadata.
///
/// Tweet/thread generation is priced per request: `count` is metadata about
/// how many posts the request produced, not a cost multiplier. Images and
/// storage are priced per unit.
fn quantity_of(details: &ActionDetails) -> i64 {
    match details {
        ActionDetails::AiImage { count, .. } => i64::from(*count),
        ActionDetails::Storage { size_gb } => i64::from(*size_gb),
        ActionDetails::TweetGeneration { .. }
        | ActionDetails::ThreadGeneration { .. }
        | ActionDetails::AiVideo { .. }
        | ActionDetails::TweetRewrite { .. } => 1,
        ActionDetails::Refund { .. } => 0,
    }
}

/// POST /v1/credits/debit
///
/// Authorizes the action through the gate, then performs the atomic debit.
/// The gate's cost is the debit amount; a denial surfaces the decision body
/// with its status hint (402/403/400).
pub async fn debit(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<DebitRequest>,
) -> Result<Json<DebitResponse>, ApiError> {
    let quantity = quantity_of(&request.details);
    let action = request.details.action();

    let plan = state
        .credits
        .reconciler
        .get_subscription(user.user_id)
        .await?
        .map(|sub| sub.effective_plan())
        .unwrap_or(Plan::Free);

    state
        .credits
        .ledger
        .ensure_account(user.user_id, plan)
        .await?;
    // Lazy refill before the balance is consulted.
    state
        .credits
        .ledger
        .refill_if_due(user.user_id, plan)
        .await?;

    let decision: GateDecision = state
        .credits
        .gate
        .authorize(user.user_id, action, quantity)
        .await?;
    if !decision.authorized {
        return Err(ApiError::Denied(decision));
    }

    let transaction = state
        .credits
        .ledger
        .debit(user.user_id, decision.credit_cost, request.details)
        .await?;

    let available = state
        .credits
        .ledger
        .get_account(user.user_id)
        .await?
        .map(|a| a.available)
        .unwrap_or(0);

    Ok(Json(DebitResponse {
        transaction,
        available,
    }))
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    pub limit: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct HistoryResponse {
    pub transactions: Vec<CreditTransaction>,
}

/// GET /v1/credits/history?limit=N
///
/// Newest first, limit clamped by the ledger. A still-building index
/// surfaces as 503 with `is_indexing: true`.
pub async fn history(
    State(state): State<AppState>,
    user: AuthUser,
    Query(params): Query<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let transactions = state
        .credits
        .ledger
        .get_history(user.user_id, params.limit.unwrap_or(50))
        .await?;
    Ok(Json(HistoryResponse { transactions }))
}

#[derive(Debug, Deserialize)]
pub struct RefundRequest {
    pub transaction_id: Uuid,
    pub amount: i64,
    pub reason: String,
}

/// PUT /v1/credits/refund
///
/// Reverses a prior debit owned by the caller. Partial amounts up to the
/// original are allowed; a second refund of the same transaction is 409.
pub async fn refund(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<RefundRequest>,
) -> Result<Json<CreditTransaction>, ApiError> {
    let transaction = state
        .credits
        .ledger
        .refund(
            user.user_id,
            request.transaction_id,
            request.amount,
            &request.reason,
        )
        .await?;
    Ok(Json(transaction))
}
