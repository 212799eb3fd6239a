//! Paddle Billing adapter (transactions API, hosted checkout).

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{debug, instrument};

use electa_core::error::{GatewayError, GatewayResult};
use electa_core::models::Gateway;
use electa_core::ports::{
    CheckoutRequest, CheckoutSession, GatewayEvent, GatewayEventKind, PaymentGateway,
    PaymentLookup, PaymentStatus,
};

use crate::signature::{DEFAULT_TOLERANCE, verify_paddle};
use crate::utils::{
    extract_field, parse_body, parse_cents, parse_metadata, parse_string, read_json,
    require_field, transport_error,
};

/// Configuration for the Paddle adapter.
#[derive(Debug, Clone)]
pub struct PaddleConfig {
    pub api_key: String,
    /// Notification destination secret key.
    pub webhook_secret: String,
    pub api_base: String,
    pub currency: String,
    pub timeout: Duration,
    pub tolerance: Duration,
}

impl PaddleConfig {
    pub fn new(api_key: impl Into<String>, webhook_secret: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            webhook_secret: webhook_secret.into(),
            api_base: "https://api.paddle.com".to_string(),
            currency: "USD".to_string(),
            timeout: Duration::from_secs(15),
            tolerance: DEFAULT_TOLERANCE,
        }
    }
}

/// Paddle adapter implementing the PaymentGateway port.
pub struct PaddleGateway {
    config: PaddleConfig,
    http: reqwest::Client,
}

impl PaddleGateway {
    pub fn new(config: PaddleConfig) -> GatewayResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::ConnectionFailed(e.to_string()))?;
        Ok(Self { config, http })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{path}", self.config.api_base.trim_end_matches('/'))
    }
}

#[async_trait]
impl PaymentGateway for PaddleGateway {
    fn kind(&self) -> Gateway {
        Gateway::Paddle
    }

    #[instrument(skip_all, fields(amount = %request.amount))]
    async fn create_checkout(&self, request: CheckoutRequest) -> GatewayResult<CheckoutSession> {
        let mut custom_data = request.purpose.to_metadata();
        custom_data.insert("account_id".to_string(), request.customer.to_string());

        let body = json!({
            "items": [{
                "quantity": 1,
                "price": {
                    "description": request.description,
                    "unit_price": {
                        "amount": request.amount.cents().to_string(),
                        "currency_code": self.config.currency,
                    },
                    "product": {
                        "name": request.description,
                        "tax_category": "standard",
                    },
                },
            }],
            "custom_data": custom_data,
            "collection_mode": "automatic",
        });

        let response = self
            .http
            .post(self.url("transactions"))
            .bearer_auth(&self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_json(Gateway::Paddle, response, "/error/detail").await?;

        let reference = require_field(&body, &["/data/id"], parse_string)?;
        debug!(reference = %reference, "Paddle transaction created");
        Ok(CheckoutSession {
            gateway: Gateway::Paddle,
            reference,
            client_secret: None,
            checkout_url: extract_field(&body, &["/data/checkout/url"], parse_string),
        })
    }

    async fn payment_status(&self, reference: &str) -> GatewayResult<PaymentLookup> {
        let response = self
            .http
            .get(self.url(&format!("transactions/{reference}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_json(Gateway::Paddle, response, "/error/detail").await?;
        let transaction = body
            .pointer("/data")
            .ok_or_else(|| GatewayError::MalformedPayload("missing data".to_string()))?;
        transaction_lookup(transaction)
    }

    async fn resume_checkout(&self, reference: &str) -> GatewayResult<CheckoutSession> {
        let response = self
            .http
            .get(self.url(&format!("transactions/{reference}")))
            .bearer_auth(&self.config.api_key)
            .send()
            .await
            .map_err(transport_error)?;
        let body = read_json(Gateway::Paddle, response, "/error/detail").await?;
        Ok(CheckoutSession {
            gateway: Gateway::Paddle,
            reference: require_field(&body, &["/data/id"], parse_string)?,
            client_secret: None,
            checkout_url: extract_field(&body, &["/data/checkout/url"], parse_string),
        })
    }

    /// Only `draft` and `ready` transactions can be canceled.
    async fn cancel_payment(&self, reference: &str) -> GatewayResult<()> {
        let response = self
            .http
            .patch(self.url(&format!("transactions/{reference}")))
            .bearer_auth(&self.config.api_key)
            .json(&json!({ "status": "canceled" }))
            .send()
            .await
            .map_err(transport_error)?;
        read_json(Gateway::Paddle, response, "/error/detail").await?;
        debug!(reference = %reference, "Paddle transaction canceled");
        Ok(())
    }

    fn parse_webhook(&self, payload: &[u8], signature: Option<&str>) -> GatewayResult<GatewayEvent> {
        let header = signature.ok_or(GatewayError::InvalidSignature)?;
        verify_paddle(
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

const TOTAL_POINTERS: &[&str] = &["/details/totals/grand_total", "/details/totals/total"];

fn transaction_lookup(transaction: &serde_json::Value) -> GatewayResult<PaymentLookup> {
    let status = require_field(transaction, &["/status"], parse_string)?;
    let status = match status.as_str() {
        "completed" | "paid" => PaymentStatus::Succeeded,
        "canceled" => PaymentStatus::Expired,
        "past_due" => PaymentStatus::Failed,
        _ => PaymentStatus::Pending,
    };
    Ok(PaymentLookup {
        reference: require_field(transaction, &["/id"], parse_string)?,
        status,
        amount: extract_field(transaction, TOTAL_POINTERS, parse_cents).unwrap_or_default(),
        metadata: extract_field(transaction, &["/custom_data"], parse_metadata).unwrap_or_default(),
    })
}

fn webhook_event(body: &serde_json::Value) -> GatewayResult<GatewayEvent> {
    let event_type = require_field(body, &["/event_type"], parse_string)?;
    // transaction.paid precedes transaction.completed; only the latter settles.
    let kind = match event_type.as_str() {
        "transaction.completed" => GatewayEventKind::PaymentSucceeded,
        "transaction.payment_failed" | "transaction.canceled" => GatewayEventKind::PaymentFailed,
        _ => GatewayEventKind::Ignored(event_type),
    };
    let data = body
        .pointer("/data")
        .ok_or_else(|| GatewayError::MalformedPayload("missing data".to_string()))?;

    Ok(GatewayEvent {
        gateway: Gateway::Paddle,
        event_id: extract_field(body, &["/event_id", "/notification_id"], parse_string),
        kind,
        payment_id: require_field(data, &["/id"], parse_string)?,
        amount: extract_field(data, TOTAL_POINTERS, parse_cents).unwrap_or_default(),
        metadata: extract_field(data, &["/custom_data"], parse_metadata).unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::paddle_header;
    use electa_core::models::Money;

    fn gateway() -> PaddleGateway {
        PaddleGateway::new(PaddleConfig::new("pdl_key", "pdl_ntfset_secret")).unwrap()
    }

    fn event(event_type: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "event_id": "evt_01h",
            "event_type": event_type,
            "data": {
                "id": "txn_01h",
                "status": "completed",
                "custom_data": { "purpose": "wallet_deposit", "account_id": "alice" },
                "details": { "totals": { "grand_total": "2500", "total": "2500" } },
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_parse_completed_transaction() {
        let body = event("transaction.completed");
        let header = paddle_header(&body, "pdl_ntfset_secret", Utc::now().timestamp()).unwrap();

        let parsed = gateway().parse_webhook(&body, Some(&header)).unwrap();
        assert_eq!(parsed.kind, GatewayEventKind::PaymentSucceeded);
        assert_eq!(parsed.event_id.as_deref(), Some("evt_01h"));
        assert_eq!(parsed.payment_id, "txn_01h");
        assert_eq!(parsed.amount, Money::from_cents(2500));
        assert_eq!(parsed.metadata.get("account_id").map(String::as_str), Some("alice"));
    }

    #[test]
    fn test_paid_event_is_ignored() {
        let body = event("transaction.paid");
        let header = paddle_header(&body, "pdl_ntfset_secret", Utc::now().timestamp()).unwrap();
        let parsed = gateway().parse_webhook(&body, Some(&header)).unwrap();
        assert!(matches!(parsed.kind, GatewayEventKind::Ignored(_)));
    }

    // Test critique: horodatage trop ancien => signature refusée
    #[test]
    fn test_stale_signature_rejected() {
        let body = event("transaction.completed");
        let header = paddle_header(&body, "pdl_ntfset_secret", Utc::now().timestamp() - 3600).unwrap();
        assert!(matches!(
            gateway().parse_webhook(&body, Some(&header)),
            Err(GatewayError::InvalidSignature)
        ));
    }

    #[test]
    fn test_transaction_status_mapping() {
        let status = |s: &str| {
            transaction_lookup(&json!({ "id": "txn_1", "status": s }))
                .unwrap()
                .status
        };
        assert_eq!(status("completed"), PaymentStatus::Succeeded);
        assert_eq!(status("ready"), PaymentStatus::Pending);
        assert_eq!(status("past_due"), PaymentStatus::Failed);
        assert_eq!(status("canceled"), PaymentStatus::Expired);
    }
}
