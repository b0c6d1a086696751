//! Error types for the credits crate

use uuid::Uuid;

/// Errors produced by the credit ledger, validation gate, and reconciler.
#[derive(Debug, thiserror::Error)]
pub enum CreditsError {
    #[error("no valid caller identity")]
    Unauthenticated,

    #[error("no credit account for user {0}")]
    AccountNotFound(Uuid),

    #[error("credit transaction {0} not found")]
    TransactionNotFound(Uuid),

    #[error("no user matches payment provider customer {0}")]
    CustomerNotFound(String),

    #[error("insufficient credits: {available} available, {required} required")]
    InsufficientCredits { available: i64, required: i64 },

    #[error("plan limit exceeded: {0}")]
    PlanLimitExceeded(String),

    #[error("feature not available on current plan: {0}")]
    FeatureUnavailable(String),

    #[error("resource does not belong to the caller")]
    OwnershipMismatch,

    #[error("transaction {0} was already refunded")]
    AlreadyRefunded(Uuid),

    #[error("refund amount {refund} exceeds original debit {original}")]
    RefundExceedsOriginal { refund: i64, original: i64 },

    #[error("history index is still building, retry shortly")]
    IndexingInProgress,

    #[error("webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("malformed provider event: {0}")]
    InvalidEvent(String),

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    #[error("concurrent modification: {0}")]
    ConcurrentModification(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(String),
}

pub type CreditsResult<T> = Result<T, CreditsError>;

impl From<sqlx::Error> for CreditsError {
    fn from(e: sqlx::Error) -> Self {
        classify_store_error(&e)
    }
}

/// Map a store error onto the taxonomy.
///
/// Serialization conflicts and deadlocks become `ConcurrentModification`
/// (retryable for idempotent operations). Lock-unavailable and
/// statement-cancelled states on read paths surface as `IndexingInProgress`
/// so callers can return a retry-shortly signal instead of a hard failure.
pub(crate) fn classify_store_error(e: &sqlx::Error) -> CreditsError {
    if let sqlx::Error::Database(db) = e {
        match db.code().as_deref() {
            Some("40001") | Some("40P01") => {
                return CreditsError::ConcurrentModification(db.message().to_string());
            }
            Some("55P03") | Some("57014") | Some("54000") => {
                return CreditsError::IndexingInProgress;
            }
            _ => {}
        }
    }
    CreditsError::Database(e.to_string())
}

impl CreditsError {
    /// Whether a caller may blindly retry the failed operation.
    ///
    /// Only transient store conditions qualify; business-rule rejections and
    /// missing entities never do. `Debit` callers must additionally confirm
    /// no prior success before retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CreditsError::IndexingInProgress | CreditsError::ConcurrentModification(_)
        )
    }

    /// Machine-readable error code for the HTTP envelope.
    pub fn code(&self) -> &'static str {
        match self {
            CreditsError::Unauthenticated => "unauthenticated",
            CreditsError::AccountNotFound(_) => "account_not_found",
            CreditsError::TransactionNotFound(_) => "transaction_not_found",
            CreditsError::CustomerNotFound(_) => "customer_not_found",
            CreditsError::InsufficientCredits { .. } => "insufficient_credits",
            CreditsError::PlanLimitExceeded(_) => "plan_limit_exceeded",
            CreditsError::FeatureUnavailable(_) => "feature_unavailable",
            CreditsError::OwnershipMismatch => "ownership_mismatch",
            CreditsError::AlreadyRefunded(_) => "already_refunded",
            CreditsError::RefundExceedsOriginal { .. } => "refund_exceeds_original",
            CreditsError::IndexingInProgress => "indexing_in_progress",
            CreditsError::WebhookSignatureInvalid => "webhook_signature_invalid",
            CreditsError::InvalidEvent(_) => "invalid_event",
            CreditsError::InvalidPlan(_) => "invalid_plan",
            CreditsError::InvalidAmount(_) => "invalid_amount",
            CreditsError::ConcurrentModification(_) => "concurrent_modification",
            CreditsError::Config(_) => "config",
            CreditsError::Database(_) => "internal",
        }
    }
}
