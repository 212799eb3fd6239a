//! In-process payment processor for demo mode and tests.
//!
//! Checkouts are kept in memory. With `auto_succeed` every checkout reports
//! `Succeeded` as soon as it is created, so client confirmations go through
//! without a real card flow. Otherwise payments stay pending until
//! [`SandboxGateway::complete`] or [`SandboxGateway::fail`] is called.
//!
//! Webhooks are JSON bodies signed with a hex HMAC of the raw payload in the
//! `x-sandbox-signature` header.

use std::collections::{BTreeMap, HashMap};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};
use uuid::Uuid;

use electa_core::error::{GatewayError, GatewayResult};
use electa_core::models::{Gateway, Money};
use electa_core::ports::{
    CheckoutRequest, CheckoutSession, GatewayEvent, GatewayEventKind, PaymentGateway,
    PaymentLookup, PaymentStatus,
};

use crate::signature::{sign, verify_plain};
use crate::utils::{extract_field, parse_body, parse_cents, parse_metadata, parse_string, require_field};

/// Header carrying the sandbox webhook signature.
pub const SANDBOX_SIGNATURE_HEADER: &str = "x-sandbox-signature";

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub webhook_secret: String,
    pub auto_succeed: bool,
}

impl SandboxConfig {
    pub fn new(webhook_secret: impl Into<String>) -> Self {
        Self {
            webhook_secret: webhook_secret.into(),
            auto_succeed: false,
        }
    }

    pub fn auto_succeed(mut self, enabled: bool) -> Self {
        self.auto_succeed = enabled;
        self
    }
}

#[derive(Debug, Clone)]
struct SandboxPayment {
    amount: Money,
    status: PaymentStatus,
    metadata: BTreeMap<String, String>,
}

pub struct SandboxGateway {
    config: SandboxConfig,
    payments: RwLock<HashMap<String, SandboxPayment>>,
}

impl SandboxGateway {
    pub fn new(config: SandboxConfig) -> Self {
        Self {
            config,
            payments: RwLock::new(HashMap::new()),
        }
    }

    /// Mark a payment as paid and return the matching signed webhook.
    pub fn complete(&self, reference: &str) -> GatewayResult<(Vec<u8>, String)> {
        self.transition(reference, PaymentStatus::Succeeded)
    }

    /// Mark a payment as declined and return the matching signed webhook.
    pub fn fail(&self, reference: &str) -> GatewayResult<(Vec<u8>, String)> {
        self.transition(reference, PaymentStatus::Failed)
    }

    fn transition(
        &self,
        reference: &str,
        status: PaymentStatus,
    ) -> GatewayResult<(Vec<u8>, String)> {
        let mut payments = self.payments.write().unwrap_or_else(PoisonError::into_inner);
        let payment = payments
            .get_mut(reference)
            .ok_or_else(|| unknown_payment(reference))?;
        payment.status = status.clone();

        let event_type = match status {
            PaymentStatus::Succeeded => "payment.succeeded",
            _ => "payment.failed",
        };
        let payload = serde_json::to_vec(&json!({
            "id": format!("evt_{}", Uuid::new_v4().simple()),
            "type": event_type,
            "payment_id": reference,
            "amount": payment.amount.cents(),
            "metadata": payment.metadata,
        }))
        .map_err(|e| GatewayError::MalformedPayload(e.to_string()))?;
        let signature = sign(&self.config.webhook_secret, &[&payload])?;

        info!(reference = %reference, event_type, "🧪 Sandbox payment updated");
        Ok((payload, signature))
    }
}

fn session(reference: String) -> CheckoutSession {
    CheckoutSession {
        gateway: Gateway::Sandbox,
        client_secret: Some(format!("{reference}_secret")),
        checkout_url: Some(format!("sandbox://checkout/{reference}")),
        reference,
    }
}

fn unknown_payment(reference: &str) -> GatewayError {
    GatewayError::Api {
        gateway: Gateway::Sandbox,
        status: 404,
        message: format!("no such payment: {reference}"),
    }
}

#[async_trait]
impl PaymentGateway for SandboxGateway {
    fn kind(&self) -> Gateway {
        Gateway::Sandbox
    }

    async fn create_checkout(&self, request: CheckoutRequest) -> GatewayResult<CheckoutSession> {
        let reference = format!("sbx_{}", Uuid::new_v4().simple());
        let mut metadata = request.purpose.to_metadata();
        metadata.insert("account_id".to_string(), request.customer.to_string());

        let status = if self.config.auto_succeed {
            PaymentStatus::Succeeded
        } else {
            PaymentStatus::Pending
        };
        self.payments
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(
                reference.clone(),
                SandboxPayment {
                    amount: request.amount,
                    status,
                    metadata,
                },
            );

        debug!(reference = %reference, amount = %request.amount, "Sandbox checkout created");
        Ok(session(reference))
    }

    async fn payment_status(&self, reference: &str) -> GatewayResult<PaymentLookup> {
        let payments = self.payments.read().unwrap_or_else(PoisonError::into_inner);
        let payment = payments
            .get(reference)
            .ok_or_else(|| unknown_payment(reference))?;
        Ok(PaymentLookup {
            reference: reference.to_string(),
            status: payment.status.clone(),
            amount: payment.amount,
            metadata: payment.metadata.clone(),
        })
    }

    async fn resume_checkout(&self, reference: &str) -> GatewayResult<CheckoutSession> {
        let payments = self.payments.read().unwrap_or_else(PoisonError::into_inner);
        if !payments.contains_key(reference) {
            return Err(unknown_payment(reference));
        }
        Ok(session(reference.to_string()))
    }

    async fn cancel_payment(&self, reference: &str) -> GatewayResult<()> {
        let mut payments = self.payments.write().unwrap_or_else(PoisonError::into_inner);
        let payment = payments
            .get_mut(reference)
            .ok_or_else(|| unknown_payment(reference))?;
        if payment.status != PaymentStatus::Pending {
            return Err(GatewayError::Api {
                gateway: Gateway::Sandbox,
                status: 409,
                message: format!("payment {reference} is no longer open"),
            });
        }
        payment.status = PaymentStatus::Expired;
        debug!(reference = %reference, "Sandbox checkout cancelled");
        Ok(())
    }

    fn parse_webhook(&self, payload: &[u8], signature: Option<&str>) -> GatewayResult<GatewayEvent> {
        let signature = signature.ok_or(GatewayError::InvalidSignature)?;
        verify_plain(payload, signature, &self.config.webhook_secret)?;

        let body = parse_body(payload)?;
        let event_type = require_field(&body, &["/type"], parse_string)?;
        let kind = match event_type.as_str() {
            "payment.succeeded" => GatewayEventKind::PaymentSucceeded,
            "payment.failed" => GatewayEventKind::PaymentFailed,
            _ => GatewayEventKind::Ignored(event_type),
        };
        Ok(GatewayEvent {
            gateway: Gateway::Sandbox,
            event_id: extract_field(&body, &["/id"], parse_string),
            kind,
            payment_id: require_field(&body, &["/payment_id"], parse_string)?,
            amount: extract_field(&body, &["/amount"], parse_cents).unwrap_or_default(),
            metadata: extract_field(&body, &["/metadata"], parse_metadata).unwrap_or_default(),
        })
    }
}
