//! Route definitions

pub mod credits;
pub mod subscription;
pub mod webhooks;

use axum::{
    routing::{get, post, put},
    Json, Router,
};
use serde_json::json;

use crate::state::AppState;

/// Build the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/credits/debit", post(credits::debit))
        .route("/v1/credits/history", get(credits::history))
        .route("/v1/credits/refund", put(credits::refund))
        .route(
            "/v1/subscription",
            get(subscription::get_subscription).post(subscription::change_plan),
        )
        .route("/v1/subscription/trial", post(subscription::start_trial))
        .route("/v1/webhooks/stripe", post(webhooks::stripe))
        .with_state(state)
}

/// Liveness check.
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
