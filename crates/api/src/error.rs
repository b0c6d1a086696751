//! HTTP error envelope
//!
//! Maps the core `CreditsError` taxonomy and gate denials onto HTTP
//! responses with a machine-readable JSON body:
//! `{"error": "...", "code": "...", ...context}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use plume_credits::{CreditsError, GateDecision};
use serde_json::json;

/// Error type returned by every route handler.
#[derive(Debug)]
pub enum ApiError {
    Credits(CreditsError),
    /// Gate rejection: carries the decision so the response can surface the
    /// computed cost and the reason verbatim.
    Denied(GateDecision),
}

impl From<CreditsError> for ApiError {
    fn from(e: CreditsError) -> Self {
        ApiError::Credits(e)
    }
}

/// HTTP status for a core error.
pub fn status_for(error: &CreditsError) -> StatusCode {
    match error {
        CreditsError::Unauthenticated => StatusCode::UNAUTHORIZED,
        CreditsError::AccountNotFound(_)
        | CreditsError::TransactionNotFound(_)
        | CreditsError::CustomerNotFound(_) => StatusCode::NOT_FOUND,
        CreditsError::InsufficientCredits { .. } => StatusCode::PAYMENT_REQUIRED,
        CreditsError::PlanLimitExceeded(_)
        | CreditsError::FeatureUnavailable(_)
        | CreditsError::OwnershipMismatch => StatusCode::FORBIDDEN,
        CreditsError::AlreadyRefunded(_) | CreditsError::ConcurrentModification(_) => {
            StatusCode::CONFLICT
        }
        CreditsError::RefundExceedsOriginal { .. }
        | CreditsError::WebhookSignatureInvalid
        | CreditsError::InvalidEvent(_)
        | CreditsError::InvalidPlan(_)
        | CreditsError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
        CreditsError::IndexingInProgress => StatusCode::SERVICE_UNAVAILABLE,
        CreditsError::Config(_) | CreditsError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Credits(error) => {
                let status = status_for(&error);
                let mut body = json!({
                    "error": error.to_string(),
                    "code": error.code(),
                });

                match &error {
                    CreditsError::InsufficientCredits {
                        available,
                        required,
                    } => {
                        body["available"] = json!(available);
                        body["required"] = json!(required);
                    }
                    CreditsError::IndexingInProgress => {
                        body["is_indexing"] = json!(true);
                    }
                    // Internal details stay in the logs, not the response.
                    CreditsError::Database(detail) | CreditsError::Config(detail) => {
                        tracing::error!(error = %detail, "Internal error");
                        body["error"] = json!("internal server error");
                    }
                    _ => {}
                }

                (status, Json(body)).into_response()
            }
            ApiError::Denied(decision) => {
                let status = decision
                    .status_hint
                    .and_then(|s| StatusCode::from_u16(s).ok())
                    .unwrap_or(StatusCode::FORBIDDEN);
                (status, Json(decision)).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_status_mapping() {
        assert_eq!(
            status_for(&CreditsError::Unauthenticated),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            status_for(&CreditsError::AccountNotFound(Uuid::new_v4())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            status_for(&CreditsError::InsufficientCredits {
                available: 5,
                required: 10
            }),
            StatusCode::PAYMENT_REQUIRED
        );
        assert_eq!(
            status_for(&CreditsError::OwnershipMismatch),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            status_for(&CreditsError::AlreadyRefunded(Uuid::new_v4())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            status_for(&CreditsError::IndexingInProgress),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&CreditsError::Database("boom".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_signature_failures_are_bad_request() {
        // The provider boundary rejects with 400, never 401, so the provider
        // does not treat the endpoint as misconfigured auth.
        assert_eq!(
            status_for(&CreditsError::WebhookSignatureInvalid),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_for(&CreditsError::InvalidEvent("bad".into())),
            StatusCode::BAD_REQUEST
        );
    }
}
