//! Payment-provider integration: outbound checkout/portal calls behind a
//! small trait seam, and inbound webhook signature verification.
//!
//! The payment provider is treated as an opaque HTTP API plus a signed
//! webhook, reached only through the `BillingProvider` trait, so the relay's
//! own logic never depends on a concrete payment SDK. Webhook verification
//! needs no outbound client — it is pure HMAC computation, independent of
//! whichever `BillingProvider` is wired in.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::config::StripeConfig;
use crate::crypto;
use crate::error::RelayError;

type HmacSha256 = Hmac<Sha256>;

/// Verify a provider webhook signature header of the form
/// `t=<unix_ts>,v1=<hex_hmac>` against `HMAC(secret, "t=<ts>.<body>")`.
/// Constant-time compared, independent of signature case.
pub fn verify_webhook_signature(secret: &str, header: &str, body: &[u8]) -> Result<(), RelayError> {
    let mut timestamp = None;
    let mut signature = None;
    for part in header.split(',') {
        let mut kv = part.splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some("t"), Some(v)) => timestamp = Some(v),
            (Some("v1"), Some(v)) => signature = Some(v),
            _ => {}
        }
    }
    let (timestamp, signature) = match (timestamp, signature) {
        (Some(t), Some(s)) => (t, s),
        _ => return Err(RelayError::Unauthorized),
    };

    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| RelayError::Internal(format!("invalid webhook secret: {e}")))?;
    mac.update(format!("t={timestamp}.").as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_hex = expected.iter().fold(String::with_capacity(64), |mut s, b| {
        use std::fmt::Write;
        write!(s, "{b:02x}").unwrap();
        s
    });

    if crypto::constant_time_eq(expected_hex.as_bytes(), signature.as_bytes()) {
        Ok(())
    } else {
        Err(RelayError::Unauthorized)
    }
}

/// A verified billing-provider webhook event, already decoded from the
/// provider's own JSON shape into the subset this relay cares about.
#[derive(Debug, Clone)]
pub enum BillingEvent {
    CheckoutCompleted {
        customer_id: String,
        subscription_id: String,
        /// `client_reference_id` set when the checkout session was created,
        /// carrying our own account id so the first webhook for an account
        /// can be matched before it has a `stripe_customer_id` on file.
        account_id: Option<String>,
    },
    SubscriptionUpdated {
        customer_id: String,
        subscription_id: String,
        status: String,
    },
    SubscriptionDeleted {
        customer_id: String,
    },
}

/// Parse a provider webhook body into the events this relay acts on.
/// Event types this relay does not care about parse to `None` rather than
/// erroring — an unrecognized event is simply ignored; only two event
/// families drive plan transitions here.
pub fn parse_webhook_event(body: &[u8]) -> Result<Option<BillingEvent>, RelayError> {
    let value: serde_json::Value = serde_json::from_slice(body)
        .map_err(|e| RelayError::InvalidMessage(format!("invalid webhook body: {e}")))?;

    let event_type = value.get("type").and_then(|v| v.as_str()).unwrap_or("");
    let data = value.pointer("/data/object").cloned().unwrap_or_default();

    let event = match event_type {
        "checkout.session.completed" => {
            let customer_id = data.get("customer").and_then(|v| v.as_str()).unwrap_or_default();
            let subscription_id = data.get("subscription").and_then(|v| v.as_str()).unwrap_or_default();
            let account_id = data
                .get("client_reference_id")
                .and_then(|v| v.as_str())
                .map(str::to_string);
            Some(BillingEvent::CheckoutCompleted {
                customer_id: customer_id.to_string(),
                subscription_id: subscription_id.to_string(),
                account_id,
            })
        }
        "customer.subscription.updated" => {
            let customer_id = data.get("customer").and_then(|v| v.as_str()).unwrap_or_default();
            let subscription_id = data.get("id").and_then(|v| v.as_str()).unwrap_or_default();
            let status = data.get("status").and_then(|v| v.as_str()).unwrap_or_default();
            Some(BillingEvent::SubscriptionUpdated {
                customer_id: customer_id.to_string(),
                subscription_id: subscription_id.to_string(),
                status: status.to_string(),
            })
        }
        "customer.subscription.deleted" => {
            let customer_id = data.get("customer").and_then(|v| v.as_str()).unwrap_or_default();
            Some(BillingEvent::SubscriptionDeleted {
                customer_id: customer_id.to_string(),
            })
        }
        _ => None,
    };

    Ok(event)
}

/// Does this subscription status keep a pro plan active?
pub fn status_is_unlimited(status: &str) -> bool {
    matches!(status, "active" | "trialing" | "past_due")
}

/// Outcome of applying a webhook event, for the caller to persist.
pub struct PlanTransition {
    pub account_id: Option<String>,
    pub customer_id: String,
    pub subscription_id: Option<String>,
    pub plan: &'static str,
    pub status: &'static str,
}

/// Deterministic plan-transition mapping from a verified webhook event.
pub fn plan_transition_for(event: &BillingEvent) -> PlanTransition {
    match event {
        BillingEvent::CheckoutCompleted {
            customer_id,
            subscription_id,
            account_id,
        } => PlanTransition {
            account_id: account_id.clone(),
            customer_id: customer_id.clone(),
            subscription_id: Some(subscription_id.clone()),
            plan: "pro",
            status: "active",
        },
        BillingEvent::SubscriptionUpdated {
            customer_id,
            subscription_id,
            status,
        } => PlanTransition {
            account_id: None,
            customer_id: customer_id.clone(),
            subscription_id: Some(subscription_id.clone()),
            plan: if status_is_unlimited(status) { "pro" } else { "free" },
            status: if status_is_unlimited(status) { "active" } else { "canceled" },
        },
        BillingEvent::SubscriptionDeleted { customer_id } => PlanTransition {
            account_id: None,
            customer_id: customer_id.clone(),
            subscription_id: None,
            plan: "free",
            status: "canceled",
        },
    }
}

/// Checkout/portal session creation, the relay's only outbound calls to the
/// payment provider. Behind a trait so tests never touch the network.
#[async_trait::async_trait]
pub trait BillingProvider: Send + Sync {
    async fn create_checkout_session(&self, account_id: &str, email: &str) -> Result<String, RelayError>;
    async fn create_portal_session(&self, customer_id: &str) -> Result<String, RelayError>;
}

pub struct StripeBillingProvider {
    client: reqwest::Client,
    config: StripeConfig,
}

impl StripeBillingProvider {
    pub fn new(config: StripeConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[async_trait::async_trait]
impl BillingProvider for StripeBillingProvider {
    async fn create_checkout_session(&self, account_id: &str, email: &str) -> Result<String, RelayError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| RelayError::Internal("stripe.api_key not configured".into()))?;
        let price_id = self
            .config
            .price_id_pro
            .as_deref()
            .ok_or_else(|| RelayError::Internal("stripe.price_id_pro not configured".into()))?;

        let params = [
            ("mode", "subscription"),
            ("line_items[0][price]", price_id),
            ("line_items[0][quantity]", "1"),
            ("customer_email", email),
            ("client_reference_id", account_id),
            (
                "success_url",
                self.config.checkout_success_url.as_deref().unwrap_or("https://example.com/success"),
            ),
            (
                "cancel_url",
                self.config.checkout_cancel_url.as_deref().unwrap_or("https://example.com/cancel"),
            ),
        ];

        let resp = self
            .client
            .post("https://api.stripe.com/v1/checkout/sessions")
            .basic_auth(api_key, Some(""))
            .form(&params)
            .send()
            .await
            .map_err(|e| RelayError::Internal(format!("checkout session request failed: {e}")))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Internal(format!("checkout session response invalid: {e}")))?;

        body.get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| RelayError::Internal("checkout session response missing url".into()))
    }

    async fn create_portal_session(&self, customer_id: &str) -> Result<String, RelayError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| RelayError::Internal("stripe.api_key not configured".into()))?;

        let params = [
            ("customer", customer_id),
            (
                "return_url",
                self.config.portal_return_url.as_deref().unwrap_or("https://example.com/account"),
            ),
        ];

        let resp = self
            .client
            .post("https://api.stripe.com/v1/billing_portal/sessions")
            .basic_auth(api_key, Some(""))
            .form(&params)
            .send()
            .await
            .map_err(|e| RelayError::Internal(format!("portal session request failed: {e}")))?;

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Internal(format!("portal session response invalid: {e}")))?;

        body.get("url")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| RelayError::Internal("portal session response missing url".into()))
    }
}

/// Stub Google-token verification seam: in production this would call
/// Google's tokeninfo endpoint; here it is behind the same kind of trait
/// seam as `BillingProvider` so callers never depend on a concrete OAuth
/// client. Tests substitute a fixed mapping.
#[async_trait::async_trait]
pub trait GoogleTokenVerifier: Send + Sync {
    async fn verify(&self, access_token: &str) -> Result<String, RelayError>;
}

pub struct HttpGoogleTokenVerifier {
    client: reqwest::Client,
}

impl HttpGoogleTokenVerifier {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }
}

impl Default for HttpGoogleTokenVerifier {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl GoogleTokenVerifier for HttpGoogleTokenVerifier {
    async fn verify(&self, access_token: &str) -> Result<String, RelayError> {
        let resp = self
            .client
            .get("https://www.googleapis.com/oauth2/v3/tokeninfo")
            .query(&[("access_token", access_token)])
            .send()
            .await
            .map_err(|e| RelayError::Internal(format!("google tokeninfo request failed: {e}")))?;

        if !resp.status().is_success() {
            return Err(RelayError::InvalidCredentials);
        }

        let body: serde_json::Value = resp
            .json()
            .await
            .map_err(|e| RelayError::Internal(format!("google tokeninfo response invalid: {e}")))?;

        body.get("email")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or(RelayError::InvalidCredentials)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, ts: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(format!("t={ts}.").as_bytes());
        mac.update(body);
        let digest = mac.finalize().into_bytes();
        digest.iter().map(|b| format!("{b:02x}")).collect()
    }

    #[test]
    fn webhook_signature_accepts_valid_hmac() {
        let secret = "whsec_test";
        let body = br#"{"type":"checkout.session.completed"}"#;
        let sig = sign(secret, "1700000000", body);
        let header = format!("t=1700000000,v1={sig}");
        assert!(verify_webhook_signature(secret, &header, body).is_ok());
    }

    #[test]
    fn webhook_signature_rejects_tampered_body() {
        let secret = "whsec_test";
        let body = br#"{"type":"checkout.session.completed"}"#;
        let sig = sign(secret, "1700000000", body);
        let header = format!("t=1700000000,v1={sig}");
        let tampered = br#"{"type":"customer.subscription.deleted"}"#;
        assert!(verify_webhook_signature(secret, &header, tampered).is_err());
    }

    #[test]
    fn webhook_signature_rejects_missing_fields() {
        assert!(verify_webhook_signature("secret", "garbage", b"{}").is_err());
    }

    #[test]
    fn checkout_completed_maps_to_pro_active() {
        let event = BillingEvent::CheckoutCompleted {
            customer_id: "cus_1".into(),
            subscription_id: "sub_1".into(),
            account_id: Some("acc_1".into()),
        };
        let t = plan_transition_for(&event);
        assert_eq!(t.plan, "pro");
        assert_eq!(t.status, "active");
    }

    #[test]
    fn subscription_updated_past_due_stays_pro() {
        let event = BillingEvent::SubscriptionUpdated {
            customer_id: "cus_1".into(),
            subscription_id: "sub_1".into(),
            status: "past_due".into(),
        };
        assert_eq!(plan_transition_for(&event).plan, "pro");
    }

    #[test]
    fn subscription_updated_canceled_falls_back_to_free() {
        let event = BillingEvent::SubscriptionUpdated {
            customer_id: "cus_1".into(),
            subscription_id: "sub_1".into(),
            status: "canceled".into(),
        };
        assert_eq!(plan_transition_for(&event).plan, "free");
    }

    #[test]
    fn subscription_deleted_maps_to_free() {
        let event = BillingEvent::SubscriptionDeleted {
            customer_id: "cus_1".into(),
        };
        assert_eq!(plan_transition_for(&event).plan, "free");
    }

    #[test]
    fn parses_checkout_completed_event() {
        let body = br#"{"type":"checkout.session.completed","data":{"object":{"customer":"cus_1","subscription":"sub_1"}}}"#;
        let event = parse_webhook_event(body).unwrap().unwrap();
        assert!(matches!(event, BillingEvent::CheckoutCompleted { .. }));
    }

    #[test]
    fn unrecognized_event_type_parses_to_none() {
        let body = br#"{"type":"invoice.paid","data":{"object":{}}}"#;
        assert!(parse_webhook_event(body).unwrap().is_none());
    }
}
