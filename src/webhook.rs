//! Outbound webhook notifications for settlement and claim events.
//!
//! Delivery is fire-and-forget from the caller's perspective: the payment
//! path spawns a task and moves on. Each delivery is signed with
//! `X-Webhook-Signature: hex(hmac_sha256(secret, body))` and retried with
//! exponential backoff; a delivery that never lands is logged and dropped,
//! never surfaced to the payer.

use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;

use crate::poller::BackoffPolicy;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

const DELIVERY_TIMEOUT: Duration = Duration::from_secs(5);

/// Webhook event body, camelCase on the wire.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookEvent {
    pub event: String,
    pub facilitator_id: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub claim: Option<Value>,
}

impl WebhookEvent {
    pub fn payment_settled(facilitator_id: impl Into<String>, payment: Value) -> Self {
        WebhookEvent {
            event: "payment.settled".to_string(),
            facilitator_id: facilitator_id.into(),
            timestamp: Utc::now().timestamp(),
            payment: Some(payment),
            claim: None,
        }
    }

    pub fn claim_paid(facilitator_id: impl Into<String>, claim: Value) -> Self {
        WebhookEvent {
            event: "claim.paid".to_string(),
            facilitator_id: facilitator_id.into(),
            timestamp: Utc::now().timestamp(),
            payment: None,
            claim: Some(claim),
        }
    }
}

/// One configured webhook sink.
#[derive(Debug, Clone)]
pub struct WebhookTarget {
    pub url: String,
    pub secret: String,
}

/// Delivers events to the configured targets off the critical path.
#[derive(Clone)]
pub struct WebhookDispatcher {
    client: reqwest::Client,
    targets: Arc<Vec<WebhookTarget>>,
    backoff: BackoffPolicy,
}

impl WebhookDispatcher {
    pub fn new(targets: Vec<WebhookTarget>) -> Self {
        for target in &targets {
            if !target.url.starts_with("https://") {
                tracing::warn!(url = %target.url, "webhook URL does not use HTTPS");
            }
        }
        Self {
            client: reqwest::Client::new(),
            targets: Arc::new(targets),
            backoff: BackoffPolicy::new(5, Duration::from_secs(1), Duration::from_secs(60)),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }

    /// Spawn delivery to every target and return immediately.
    pub fn dispatch(&self, event: WebhookEvent) {
        if self.targets.is_empty() {
            return;
        }
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(error = %e, "failed to serialize webhook event");
                return;
            }
        };
        for target in self.targets.iter() {
            let client = self.client.clone();
            let target = target.clone();
            let body = body.clone();
            let backoff = self.backoff;
            let event_name = event.event.clone();
            tokio::spawn(async move {
                deliver(client, target, body, backoff, event_name).await;
            });
        }
    }
}

async fn deliver(
    client: reqwest::Client,
    target: WebhookTarget,
    body: Vec<u8>,
    backoff: BackoffPolicy,
    event_name: String,
) {
    let signature = sign(target.secret.as_bytes(), &body);
    for attempt in 1..=backoff.max_attempts {
        let result = client
            .post(&target.url)
            .header("content-type", "application/json")
            .header(SIGNATURE_HEADER, &signature)
            .timeout(DELIVERY_TIMEOUT)
            .body(body.clone())
            .send()
            .await;
        match result {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(url = %target.url, event = %event_name, "webhook delivered");
                return;
            }
            Ok(response) => {
                tracing::warn!(url = %target.url, status = %response.status(), attempt, "webhook rejected");
            }
            Err(e) => {
                tracing::warn!(url = %target.url, error = %e, attempt, "webhook delivery failed");
            }
        }
        if attempt < backoff.max_attempts {
            tokio::time::sleep(backoff.delay(attempt)).await;
        }
    }
    tracing::error!(url = %target.url, event = %event_name, "webhook delivery abandoned");
}

/// Hex HMAC-SHA256 of the request body.
pub fn sign(secret: &[u8], body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret).expect("hmac accepts keys of any length");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_rfc4231_vector() {
        // RFC 4231 test case 2.
        let signature = sign(b"Jefe", b"what do ya want for nothing?");
        assert_eq!(
            signature,
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn signature_depends_on_secret_and_body() {
        let body = br#"{"event":"payment.settled"}"#;
        assert_ne!(sign(b"one", body), sign(b"two", body));
        assert_ne!(sign(b"one", body), sign(b"one", b"{}"));
    }

    #[test]
    fn event_serializes_camel_case() {
        let event = WebhookEvent::payment_settled("fac-1", serde_json::json!({"payer": "0xabc"}));
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "payment.settled");
        assert_eq!(json["facilitatorId"], "fac-1");
        assert!(json["payment"]["payer"].is_string());
        assert!(json.get("claim").is_none());
    }
}
