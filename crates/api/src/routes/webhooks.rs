//! Payment-provider webhook route
//!
//! Unauthenticated by design; the request is trusted only after its
//! `Stripe-Signature` header verifies against the shared secret. The raw
//! body bytes are verified before any JSON parsing.

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    Json,
};
use plume_credits::{CreditsError, WebhookOutcome};
use serde_json::json;

use crate::{error::ApiError, state::AppState};

/// POST /v1/webhooks/stripe
///
/// 200 acknowledges the event (the provider stops retrying); 400 is a
/// signature or payload rejection; 5xx asks the provider to redeliver.
pub async fn stripe(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<(StatusCode, Json<serde_json::Value>), ApiError> {
    let signature = headers
        .get("Stripe-Signature")
        .and_then(|h| h.to_str().ok())
        .ok_or(CreditsError::WebhookSignatureInvalid)?;

    let outcome = state.credits.webhooks.handle(&body, signature).await?;

    let label = match &outcome {
        WebhookOutcome::Processed => "processed",
        WebhookOutcome::Duplicate => "duplicate",
        WebhookOutcome::Ignored => "ignored",
        WebhookOutcome::Skipped(_) => "skipped",
    };

    Ok((StatusCode::OK, Json(json!({ "received": true, "outcome": label }))))
}
