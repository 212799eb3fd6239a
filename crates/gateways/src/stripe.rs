//! Stripe adapter (Payment Intents API).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, instrument};

use electa_core::error::{GatewayError, GatewayResult};
use electa_core::models::Gateway;
use electa_core::ports::{
    CheckoutRequest, CheckoutSession, GatewayEvent, GatewayEventKind, PaymentGateway,
    PaymentLookup, PaymentStatus,
};

use crate::signature::{DEFAULT_TOLERANCE, verify_stripe};
use crate::utils::{
    extract_field, parse_body, parse_cents, parse_metadata, parse_string, read_json,
    require_field, transport_error,
};

/// Configuration for the Stripe adapter.
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Secret API key (`sk_...`).
    pub api_key: String,
    /// Endpoint signing secret (`whsec_...`).
    pub webhook_secret: String,
    pub api_base: String,
    pub currency: String,
    pub timeout: Duration,
    /// Replay window for webhook timestamps.
    pub tolerance: Duration,
}

impl StripeConfig {
    pub fn new(api_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            webhook_secret: webhook_secret.into(),
            api_base: "https://api.stripe.com".to_string(),
            currency: "usd".to_string(),
            timeout: Duration::from_secs(15),
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Stripe adapter implementing the PaymentGateway port.
pub struct StripeGateway {
    config: StripeConfig,
    http: reqwest::Client,
}

impl StripeGateway {
    pub fn new(config: StripeConfig) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/v1/{path}", self.config.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn kind(&self) -> Gateway {
        Gateway::Stripe
    }

    #[instrument(skip_all, fields(amount = %request.amount))]
    async fn create_checkout(&self, request: CheckoutRequest) -> GatewayResult<CheckoutSession> {
        let mut form: Vec<(String, String)> = vec![
            ("amount".into(), request.amount.cents().to_string()),
            ("currency".into(), self.config.currency.clone()),
            ("description".into(), request.description),
            ("automatic_payment_methods[enabled]".into(), "true".into()),
            ("metadata[account_id]".into(), request.customer.to_string()),
        ];
        for (key, value) in request.purpose.to_metadata() {
            form.push((format!("metadata[{key}]"), value));
        }

        let response = self
            .http
            .post(self.url("payment_intents"))
            .bearer_auth(&self.config.api_key)
            .form(&form)
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_json(Gateway::Stripe, response, "/error/message").await?;

        let reference = require_field(&body, &["/id"], parse_string)?;
        debug!(reference = %reference, "Payment intent created");
        Ok(CheckoutSession {
            gateway: Gateway::Stripe,
            reference,
            client_secret: extract_field(&body, &["/client_secret"], parse_string),
            checkout_url: None,
        })
    }

    async fn payment_status(&self, reference: &str) -> GatewayResult<PaymentLookup> {
        let response = self
            .http
            .get(self.url(&format!("payment_intents/{reference}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_json(Gateway::Stripe, response, "/error/message").await?;
        intent_lookup(&body)
    }

    async fn resume_checkout(&self, reference: &str) -> GatewayResult<CheckoutSession> {
        let response = self
            .http
            .get(self.url(&format!("payment_intents/{reference}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_json(Gateway::Stripe, response, "/error/message").await?;
        Ok(CheckoutSession {
            gateway: Gateway::Stripe,
            reference: require_field(&body, &["/id"], parse_string)?,
            client_secret: extract_field(&body, &["/client_secret"], parse_string),
            checkout_url: None,
        })
    }

    /// Stripe refuses to cancel an intent that already succeeded.
    async fn cancel_payment(&self, reference: &str) -> GatewayResult<()> {
        let response = self
            .http
            .post(self.url(&format!("payment_intents/{reference}/cancel")))
            .bearer_auth(&self.config.api_key)
            .form(&[("cancellation_reason", "abandoned")])
            .send()
            .await
            .map_err(transport_error)?;
        read_json(Gateway::Stripe, response, "/error/message").await?;
        debug!(reference = %reference, "Payment intent cancelled");
        Ok(())
    }

    fn parse_webhook(&self, payload: &[u8], signature: Option<&str>) -> GatewayResult<GatewayEvent> {
        let header = signature.ok_or(GatewayError::InvalidSignature)?;
        verify_stripe(
            payload,
            header,
            &self.config.webhook_secret,
            self.config.tolerance,
            Utc::now(),
        )?;
        webhook_event(&parse_body(payload)?)
    }
}

// =============================================================================
// Payload mapping
// =============================================================================

/// Map a PaymentIntent object to a lookup.
fn intent_lookup(intent: &serde_json::Value) -> GatewayResult<PaymentLookup> {
    let status = require_field(intent, &["/status"], parse_string)?;
    let status = match status.as_str() {
        "succeeded" => PaymentStatus::Succeeded,
        "canceled" => PaymentStatus::Expired,
        "requires_payment_method" if intent.pointer("/last_payment_error").is_some_and(|e| !e.is_null()) => {
            PaymentStatus::Failed
        }
        _ => PaymentStatus::Pending,
    };
    Ok(PaymentLookup {
        reference: require_field(intent, &["/id"], parse_string)?,
        status,
        amount: require_field(intent, &["/amount_received", "/amount"], parse_cents)?,
        metadata: extract_field(intent, &["/metadata"], parse_metadata).unwrap_or_default(),
    })
}

/// Map a webhook event envelope.
fn webhook_event(body: &serde_json::Value) -> GatewayResult<GatewayEvent> {
    let event_type = require_field(body, &["/type"], parse_string)?;
    let kind = match event_type.as_str() {
        "payment_intent.succeeded" => GatewayEventKind::PaymentSucceeded,
        "payment_intent.payment_failed" | "payment_intent.canceled" => {
            GatewayEventKind::PaymentFailed
        }
        _ => GatewayEventKind::Ignored(event_type),
    };
    let object = body
        .pointer("/data/object")
        .ok_or_else(|| GatewayError::MalformedPayload("missing data.object".to_string()))?;

    Ok(GatewayEvent {
        gateway: Gateway::Stripe,
        event_id: extract_field(body, &["/id"], parse_string),
        kind,
        payment_id: require_field(object, &["/id"], parse_string)?,
        amount: extract_field(object, &["/amount_received", "/amount"], parse_cents)
            .unwrap_or_default(),
        metadata: extract_field(object, &["/metadata"], parse_metadata).unwrap_or_default(),
    })
}
