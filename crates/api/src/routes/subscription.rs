//! Subscription routes

use axum::{extract::State, Json};
use plume_credits::{CreditsError, SubscriptionRecord};
use plume_shared::Plan;
use serde::Deserialize;

use crate::{auth::AuthUser, error::ApiError, state::AppState};

/// GET /v1/subscription
pub async fn get_subscription(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<SubscriptionRecord>, ApiError> {
    let record = state
        .credits
        .reconciler
        .get_subscription(user.user_id)
        .await?
        .ok_or(CreditsError::AccountNotFound(user.user_id))?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub plan: String,
}

/// POST /v1/subscription
///
/// Direct plan change: sets the plan and resets the credit allotment.
pub async fn change_plan(
    State(state): State<AppState>,
    user: AuthUser,
    Json(request): Json<ChangePlanRequest>,
) -> Result<Json<SubscriptionRecord>, ApiError> {
    let plan = Plan::parse(&request.plan)
        .ok_or_else(|| CreditsError::InvalidPlan(request.plan.clone()))?;

    let record = state.credits.reconciler.change_plan(user.user_id, plan).await?;
    Ok(Json(record))
}

/// POST /v1/subscription/trial
///
/// Trial signup: creates the subscription record and the credit account.
/// Idempotent for an existing subscriber.
pub async fn start_trial(
    State(state): State<AppState>,
    user: AuthUser,
) -> Result<Json<SubscriptionRecord>, ApiError> {
    let record = state.credits.reconciler.start_trial(user.user_id).await?;
    Ok(Json(record))
}
