//! Payment-provider webhook boundary
//!
//! Verifies the provider's signature header, decodes the payload into a
//! strict tagged union, claims atomic idempotency rights per event id, and
//! dispatches to the reconciler. Unsigned or tampered payloads are rejected
//! before any of that happens.

use hmac::{Hmac, Mac};
use plume_shared::Plan;
use sha2::Sha256;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{CreditsError, CreditsResult};
use crate::reconciler::{CheckoutApplication, SubscriptionReconciler, SubscriptionUpdate};

type HmacSha256 = Hmac<Sha256>;

/// Signature timestamp tolerance (5 minutes).
const TIMESTAMP_TOLERANCE_SECS: i64 = 300;

/// Events stuck in `processing` longer than this may be re-claimed.
const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

/// Price-id to plan mapping for the provider's catalog.
///
/// Exact ids come from configuration; as a fallback the tier name embedded
/// in the price id (e.g. `price_plume_solo_monthly`) is matched.
#[derive(Debug, Clone, Default)]
pub struct PriceCatalog {
    solo: Vec<String>,
    team: Vec<String>,
    agency: Vec<String>,
}

impl PriceCatalog {
    pub fn new(solo: Vec<String>, team: Vec<String>, agency: Vec<String>) -> Self {
        Self { solo, team, agency }
    }

    /// Read price ids from `PLUME_PRICE_IDS_{SOLO,TEAM,AGENCY}` (comma
    /// separated). Missing variables leave the exact-match lists empty and
    /// the name heuristic still applies.
    pub fn from_env() -> Self {
        let read = |key: &str| -> Vec<String> {
            std::env::var(key)
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default()
        };
        Self {
            solo: read("PLUME_PRICE_IDS_SOLO"),
            team: read("PLUME_PRICE_IDS_TEAM"),
            agency: read("PLUME_PRICE_IDS_AGENCY"),
        }
    }

    pub fn plan_for_price(&self, price_id: &str) -> Option<Plan> {
        if self.solo.iter().any(|p| p == price_id) {
            return Some(Plan::Solo);
        }
        if self.team.iter().any(|p| p == price_id) {
            return Some(Plan::Team);
        }
        if self.agency.iter().any(|p| p == price_id) {
            return Some(Plan::Agency);
        }
        let lower = price_id.to_lowercase();
        if lower.contains("solo") {
            Some(Plan::Solo)
        } else if lower.contains("team") {
            Some(Plan::Team)
        } else if lower.contains("agency") {
            Some(Plan::Agency)
        } else if lower.contains("enterprise") {
            Some(Plan::Enterprise)
        } else {
            None
        }
    }
}

/// A decoded, strictly-typed provider event.
#[derive(Debug, Clone)]
pub enum ProviderEvent {
    CheckoutCompleted(CheckoutApplication),
    SubscriptionUpdated(SubscriptionUpdate),
    SubscriptionDeleted {
        provider_customer_id: String,
        provider_subscription_id: String,
        period_end: Option<OffsetDateTime>,
    },
    /// Recognized envelope, event type we do not consume.
    Unhandled { event_type: String },
}

/// Parsed event envelope plus its decoded body.
#[derive(Debug, Clone)]
pub struct DecodedEvent {
    pub provider_event_id: String,
    pub event_type: String,
    pub created: OffsetDateTime,
    pub event: ProviderEvent,
}

/// Terminal outcome of handling one webhook delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Same event id already handled (or in flight elsewhere).
    Duplicate,
    /// Event type we do not consume; acknowledged so the provider stops.
    Ignored,
    /// Permanently unprocessable (unknown customer, malformed body);
    /// acknowledged and logged so the provider does not retry forever.
    Skipped(String),
}

/// Verify the `t=...,v1=...` signature header against the shared secret.
///
/// Exposed with an explicit clock so the tolerance window is testable.
pub fn verify_signature_at(
    secret: &str,
    payload: &str,
    signature_header: &str,
    now_unix: i64,
) -> CreditsResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature_header.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0].trim() {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or(CreditsError::WebhookSignatureInvalid)?;
    let v1_signature = v1_signature.ok_or(CreditsError::WebhookSignatureInvalid)?;

    if (now_unix - timestamp).abs() > TIMESTAMP_TOLERANCE_SECS {
        tracing::warn!(
            timestamp = timestamp,
            now = now_unix,
            "Webhook timestamp outside tolerance"
        );
        return Err(CreditsError::WebhookSignatureInvalid);
    }

    // The secret's "whsec_" prefix is not part of the key material.
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| CreditsError::WebhookSignatureInvalid)?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::warn!("Webhook signature mismatch");
        return Err(CreditsError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Build a valid signature header for `payload` (test fixtures).
#[cfg(test)]
pub(crate) fn sign_payload(secret: &str, payload: &str, timestamp: i64) -> String {
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");
    #[allow(clippy::unwrap_used)]
    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).unwrap();
    mac.update(signed_payload.as_bytes());
    format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
}

/// A string field that may arrive inline or as an expandable `{"id": ...}`.
fn ref_field(object: &serde_json::Value, key: &str) -> Option<String> {
    match object.get(key)? {
        serde_json::Value::String(s) => Some(s.clone()),
        serde_json::Value::Object(map) => map
            .get("id")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()),
        _ => None,
    }
}

fn unix_field(object: &serde_json::Value, key: &str) -> Option<OffsetDateTime> {
    object
        .get(key)
        .and_then(|v| v.as_i64())
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
}

/// First subscription item's price id; accepts both `items.data[0]` and the
/// flattened `items[0]` shape.
fn price_id_field(object: &serde_json::Value) -> Option<String> {
    let items = object.get("items")?;
    let first = items
        .get("data")
        .and_then(|d| d.get(0))
        .or_else(|| items.get(0))?;
    first
        .get("price")
        .and_then(|p| p.get("id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

/// Decode a verified payload into a `DecodedEvent`.
///
/// The envelope (`id`, `type`, `created`, `data.object`) is required.
/// Known event types with missing required fields are `InvalidEvent`;
/// unknown event types decode to `Unhandled`.
pub fn decode_event(payload: &str, prices: &PriceCatalog) -> CreditsResult<DecodedEvent> {
    let value: serde_json::Value = serde_json::from_str(payload)
        .map_err(|e| CreditsError::InvalidEvent(format!("invalid JSON: {e}")))?;

    let provider_event_id = value
        .get("id")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CreditsError::InvalidEvent("missing event id".to_string()))?
        .to_string();
    let event_type = value
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| CreditsError::InvalidEvent("missing event type".to_string()))?
        .to_string();
    let created = value
        .get("created")
        .and_then(|v| v.as_i64())
        .and_then(|ts| OffsetDateTime::from_unix_timestamp(ts).ok())
        .unwrap_or_else(OffsetDateTime::now_utc);
    let object = value
        .get("data")
        .and_then(|d| d.get("object"))
        .ok_or_else(|| CreditsError::InvalidEvent("missing data.object".to_string()))?;

    let event = match event_type.as_str() {
        "checkout.session.completed" => {
            let user_id = object
                .get("metadata")
                .and_then(|m| m.get("userId"))
                .and_then(|v| v.as_str())
                .and_then(|s| Uuid::parse_str(s).ok())
                .ok_or_else(|| {
                    CreditsError::InvalidEvent("checkout session missing metadata.userId".into())
                })?;
            let provider_subscription_id = ref_field(object, "subscription").ok_or_else(|| {
                CreditsError::InvalidEvent("checkout session missing subscription".into())
            })?;
            let price_id = price_id_field(object);
            let plan = price_id
                .as_deref()
                .and_then(|p| prices.plan_for_price(p))
                .or_else(|| {
                    object
                        .get("metadata")
                        .and_then(|m| m.get("plan"))
                        .and_then(|v| v.as_str())
                        .and_then(Plan::parse)
                })
                .ok_or_else(|| {
                    CreditsError::InvalidEvent("cannot determine plan from checkout session".into())
                })?;
            let trialing = object
                .get("status")
                .and_then(|v| v.as_str())
                .is_some_and(|s| s == "trialing");

            ProviderEvent::CheckoutCompleted(CheckoutApplication {
                user_id,
                plan,
                provider_subscription_id,
                price_id,
                period_start: unix_field(object, "current_period_start"),
                period_end: unix_field(object, "current_period_end"),
                cancel_at_period_end: object
                    .get("cancel_at_period_end")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                trialing,
            })
        }
        "customer.subscription.updated" => {
            let provider_customer_id = ref_field(object, "customer").ok_or_else(|| {
                CreditsError::InvalidEvent("subscription event missing customer".into())
            })?;
            let provider_subscription_id = object
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    CreditsError::InvalidEvent("subscription event missing id".into())
                })?;
            let provider_status = object
                .get("status")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    CreditsError::InvalidEvent("subscription event missing status".into())
                })?;
            let price_id = price_id_field(object);
            let plan = price_id.as_deref().and_then(|p| prices.plan_for_price(p));

            ProviderEvent::SubscriptionUpdated(SubscriptionUpdate {
                provider_customer_id,
                provider_subscription_id,
                plan,
                provider_status,
                price_id,
                period_start: unix_field(object, "current_period_start"),
                period_end: unix_field(object, "current_period_end"),
                cancel_at_period_end: object
                    .get("cancel_at_period_end")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
            })
        }
        "customer.subscription.deleted" => {
            let provider_customer_id = ref_field(object, "customer").ok_or_else(|| {
                CreditsError::InvalidEvent("subscription event missing customer".into())
            })?;
            let provider_subscription_id = object
                .get("id")
                .and_then(|v| v.as_str())
                .map(|s| s.to_string())
                .ok_or_else(|| {
                    CreditsError::InvalidEvent("subscription event missing id".into())
                })?;

            ProviderEvent::SubscriptionDeleted {
                provider_customer_id,
                provider_subscription_id,
                period_end: unix_field(object, "current_period_end"),
            }
        }
        _ => ProviderEvent::Unhandled {
            event_type: event_type.clone(),
        },
    };

    Ok(DecodedEvent {
        provider_event_id,
        event_type,
        created,
        event,
    })
}

/// Webhook handler: verification, idempotency, dispatch.
#[derive(Clone)]
pub struct WebhookHandler {
    pool: PgPool,
    webhook_secret: String,
    prices: PriceCatalog,
    reconciler: SubscriptionReconciler,
}

impl WebhookHandler {
    pub fn new(pool: PgPool, webhook_secret: String, prices: PriceCatalog) -> Self {
        let reconciler = SubscriptionReconciler::new(pool.clone());
        Self {
            pool,
            webhook_secret,
            prices,
            reconciler,
        }
    }

    /// Verify the signature header against the shared secret.
    pub fn verify(&self, payload: &str, signature_header: &str) -> CreditsResult<()> {
        verify_signature_at(
            &self.webhook_secret,
            payload,
            signature_header,
            OffsetDateTime::now_utc().unix_timestamp(),
        )
    }

    /// Handle one webhook delivery end to end.
    ///
    /// Returns `Err` only for signature failures, envelope-level garbage,
    /// and transient store errors (the provider retries the latter).
    /// Permanently unprocessable events are acknowledged as `Skipped`.
    pub async fn handle(&self, payload: &str, signature_header: &str) -> CreditsResult<WebhookOutcome> {
        self.verify(payload, signature_header)?;
        let decoded = decode_event(payload, &self.prices)?;

        if !self.claim_event(&decoded).await? {
            tracing::info!(
                event_id = %decoded.provider_event_id,
                event_type = %decoded.event_type,
                "Duplicate webhook event, skipping"
            );
            return Ok(WebhookOutcome::Duplicate);
        }

        tracing::info!(
            event_id = %decoded.provider_event_id,
            event_type = %decoded.event_type,
            "Processing webhook event"
        );

        let outcome = self.process(&decoded.event).await;

        let (result_label, error_message, outcome) = match outcome {
            Ok(o) => {
                let label = match &o {
                    WebhookOutcome::Ignored => "ignored",
                    WebhookOutcome::Skipped(_) => "skipped",
                    _ => "success",
                };
                let msg = match &o {
                    WebhookOutcome::Skipped(reason) => Some(reason.clone()),
                    _ => None,
                };
                (label, msg, Ok(o))
            }
            Err(e) => ("error", Some(e.to_string()), Err(e)),
        };

        self.record_result(&decoded.provider_event_id, result_label, error_message.as_deref())
            .await;

        outcome
    }

    async fn process(&self, event: &ProviderEvent) -> CreditsResult<WebhookOutcome> {
        let result = match event {
            ProviderEvent::CheckoutCompleted(checkout) => self
                .reconciler
                .apply_checkout_completed(checkout.clone())
                .await
                .map(|_| WebhookOutcome::Processed),
            ProviderEvent::SubscriptionUpdated(update) => self
                .reconciler
                .apply_subscription_updated(update.clone())
                .await
                .map(|_| WebhookOutcome::Processed),
            ProviderEvent::SubscriptionDeleted {
                provider_customer_id,
                provider_subscription_id,
                period_end,
            } => self
                .reconciler
                .apply_subscription_deleted(
                    provider_customer_id,
                    provider_subscription_id,
                    *period_end,
                )
                .await
                .map(|_| WebhookOutcome::Processed),
            ProviderEvent::Unhandled { event_type } => {
                tracing::info!(event_type = %event_type, "Unhandled provider event type");
                return Ok(WebhookOutcome::Ignored);
            }
        };

        match result {
            Ok(outcome) => Ok(outcome),
            // No matching user is permanently unprocessable; acknowledge so
            // the provider stops retrying, but keep the record.
            Err(CreditsError::CustomerNotFound(customer)) => {
                tracing::warn!(customer = %customer, "Webhook references unknown customer");
                Ok(WebhookOutcome::Skipped(format!(
                    "unknown customer {customer}"
                )))
            }
            Err(e) => Err(e),
        }
    }

    /// Atomically claim exclusive processing rights for an event id.
    ///
    /// The conditional insert guarantees only one concurrent delivery wins.
    /// Events whose previous attempt ended in `error` are re-claimed
    /// immediately, so a provider redelivery after a transient failure
    /// reprocesses instead of deduplicating; events stuck in `processing`
    /// past the timeout may also be re-claimed.
    pub(crate) async fn claim_event(&self, decoded: &DecodedEvent) -> CreditsResult<bool> {
        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO webhook_events
                (provider_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, 'processing', NOW())
            ON CONFLICT (provider_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW()
            WHERE webhook_events.processing_result = 'error'
               OR (webhook_events.processing_result = 'processing'
                   AND webhook_events.processing_started_at < NOW() - make_interval(mins => $4))
            RETURNING id
            "#,
        )
        .bind(&decoded.provider_event_id)
        .bind(&decoded.event_type)
        .bind(decoded.created)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await?;

        Ok(claimed.is_some())
    }

    /// Write the processing result back to the idempotency record.
    ///
    /// Retried once; losing the audit record leaves the event looking stuck
    /// until the re-claim timeout, so a persistent failure is logged loudly.
    pub(crate) async fn record_result(
        &self,
        event_id: &str,
        result: &str,
        error_message: Option<&str>,
    ) {
        for attempt in 0..2 {
            let update = sqlx::query(
                r#"
                UPDATE webhook_events
                SET processing_result = $1, error_message = $2
                WHERE provider_event_id = $3
                "#,
            )
            .bind(result)
            .bind(error_message)
            .bind(event_id)
            .execute(&self.pool)
            .await;

            match update {
                Ok(_) => return,
                Err(e) if attempt == 0 => {
                    tracing::warn!(
                        event_id = %event_id,
                        error = %e,
                        "Failed to update webhook event record, retrying"
                    );
                }
                Err(e) => {
                    tracing::error!(
                        event_id = %event_id,
                        result = %result,
                        error = %e,
                        "Failed to update webhook event record after retry; \
                         event will look stuck until the re-claim timeout"
                    );
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret_key";

    #[test]
    fn test_signature_round_trip() {
        let payload = r#"{"id":"evt_1","type":"x","created":1700000000}"#;
        let now = 1_700_000_000;
        let header = sign_payload(SECRET, payload, now);
        assert!(verify_signature_at(SECRET, payload, &header, now).is_ok());
    }

    #[test]
    fn test_signature_rejects_tampered_payload() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign_payload(SECRET, payload, now);
        let err = verify_signature_at(SECRET, r#"{"id":"evt_2"}"#, &header, now);
        assert!(matches!(err, Err(CreditsError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_signature_rejects_wrong_secret() {
        let payload = r#"{"id":"evt_1"}"#;
        let now = 1_700_000_000;
        let header = sign_payload("whsec_other", payload, now);
        let err = verify_signature_at(SECRET, payload, &header, now);
        assert!(matches!(err, Err(CreditsError::WebhookSignatureInvalid)));
    }

    #[test]
    fn test_signature_rejects_stale_timestamp() {
        let payload = r#"{"id":"evt_1"}"#;
        let signed_at = 1_700_000_000;
        let header = sign_payload(SECRET, payload, signed_at);
        let err = verify_signature_at(SECRET, payload, &header, signed_at + 301);
        assert!(matches!(err, Err(CreditsError::WebhookSignatureInvalid)));
        // Within tolerance is fine.
        assert!(verify_signature_at(SECRET, payload, &header, signed_at + 299).is_ok());
    }

    #[test]
    fn test_signature_rejects_missing_parts() {
        let err = verify_signature_at(SECRET, "{}", "v1=abc", 1_700_000_000);
        assert!(matches!(err, Err(CreditsError::WebhookSignatureInvalid)));
        let err = verify_signature_at(SECRET, "{}", "t=1700000000", 1_700_000_000);
        assert!(matches!(err, Err(CreditsError::WebhookSignatureInvalid)));
    }

    fn catalog() -> PriceCatalog {
        PriceCatalog::new(
            vec!["price_solo_1".to_string()],
            vec!["price_team_1".to_string()],
            vec!["price_agency_1".to_string()],
        )
    }

    #[test]
    fn test_plan_for_price_exact_and_heuristic() {
        let prices = catalog();
        assert_eq!(prices.plan_for_price("price_solo_1"), Some(Plan::Solo));
        assert_eq!(prices.plan_for_price("price_team_1"), Some(Plan::Team));
        // Unknown id with a tier name embedded falls back to the heuristic.
        assert_eq!(
            prices.plan_for_price("price_plume_agency_annual"),
            Some(Plan::Agency)
        );
        assert_eq!(prices.plan_for_price("price_mystery"), None);
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_decode_checkout_completed() {
        let user_id = Uuid::new_v4();
        let payload = serde_json::json!({
            "id": "evt_checkout_1",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": {
                "customer": "cus_1",
                "subscription": "sub_1",
                "status": "complete",
                "metadata": { "userId": user_id.to_string() },
                "items": { "data": [ { "price": { "id": "price_solo_1" } } ] },
                "current_period_start": 1_700_000_000,
                "current_period_end": 1_702_600_000,
                "cancel_at_period_end": false
            }}
        })
        .to_string();

        let decoded = decode_event(&payload, &catalog()).unwrap();
        assert_eq!(decoded.provider_event_id, "evt_checkout_1");
        match decoded.event {
            ProviderEvent::CheckoutCompleted(checkout) => {
                assert_eq!(checkout.user_id, user_id);
                assert_eq!(checkout.plan, Plan::Solo);
                assert_eq!(checkout.provider_subscription_id, "sub_1");
                assert!(!checkout.trialing);
                assert!(checkout.period_end.is_some());
            }
            other => panic!("expected CheckoutCompleted, got {other:?}"),
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_decode_subscription_updated_expandable_customer() {
        let payload = serde_json::json!({
            "id": "evt_upd_1",
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "sub_1",
                "customer": { "id": "cus_1" },
                "status": "past_due",
                "items": { "data": [ { "price": { "id": "price_team_1" } } ] },
                "cancel_at_period_end": true
            }}
        })
        .to_string();

        let decoded = decode_event(&payload, &catalog()).unwrap();
        match decoded.event {
            ProviderEvent::SubscriptionUpdated(update) => {
                assert_eq!(update.provider_customer_id, "cus_1");
                assert_eq!(update.provider_subscription_id, "sub_1");
                assert_eq!(update.provider_status, "past_due");
                assert_eq!(update.plan, Some(Plan::Team));
                assert!(update.cancel_at_period_end);
            }
            other => panic!("expected SubscriptionUpdated, got {other:?}"),
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_decode_subscription_deleted() {
        let payload = serde_json::json!({
            "id": "evt_del_1",
            "type": "customer.subscription.deleted",
            "created": 1_700_000_000,
            "data": { "object": {
                "id": "sub_1",
                "customer": "cus_1",
                "current_period_end": 1_702_600_000
            }}
        })
        .to_string();

        let decoded = decode_event(&payload, &catalog()).unwrap();
        match decoded.event {
            ProviderEvent::SubscriptionDeleted {
                provider_customer_id,
                provider_subscription_id,
                period_end,
            } => {
                assert_eq!(provider_customer_id, "cus_1");
                assert_eq!(provider_subscription_id, "sub_1");
                assert!(period_end.is_some());
            }
            other => panic!("expected SubscriptionDeleted, got {other:?}"),
        }
    }

    #[test]
    #[allow(clippy::unwrap_used)]
    fn test_decode_unknown_type_is_unhandled() {
        let payload = serde_json::json!({
            "id": "evt_x",
            "type": "invoice.paid",
            "created": 1_700_000_000,
            "data": { "object": {} }
        })
        .to_string();

        let decoded = decode_event(&payload, &catalog()).unwrap();
        assert!(matches!(decoded.event, ProviderEvent::Unhandled { .. }));
    }

    #[test]
    fn test_decode_rejects_missing_required_fields() {
        // Checkout without metadata.userId.
        let payload = serde_json::json!({
            "id": "evt_bad",
            "type": "checkout.session.completed",
            "created": 1_700_000_000,
            "data": { "object": { "subscription": "sub_1" } }
        })
        .to_string();
        assert!(matches!(
            decode_event(&payload, &catalog()),
            Err(CreditsError::InvalidEvent(_))
        ));

        // Updated without status.
        let payload = serde_json::json!({
            "id": "evt_bad2",
            "type": "customer.subscription.updated",
            "created": 1_700_000_000,
            "data": { "object": { "id": "sub_1", "customer": "cus_1" } }
        })
        .to_string();
        assert!(matches!(
            decode_event(&payload, &catalog()),
            Err(CreditsError::InvalidEvent(_))
        ));

        // Not even an envelope.
        assert!(matches!(
            decode_event("{\"hello\":1}", &catalog()),
            Err(CreditsError::InvalidEvent(_))
        ));
        assert!(matches!(
            decode_event("not json", &catalog()),
            Err(CreditsError::InvalidEvent(_))
        ));
    }
}
