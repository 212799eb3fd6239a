//! Port trait for payment processors.
//!
//! Implementations live in the infrastructure layer (`electa-gateways`).
//! A processor creates checkouts, reports the status of a payment, and turns
//! signed webhook deliveries into [`GatewayEvent`]s.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::{GatewayError, GatewayResult};
use crate::models::{AccountId, CheckoutPurpose, Gateway, Money};

/// Request to open a checkout for a payment.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub amount: Money,
    pub description: String,
    pub customer: AccountId,
    /// Routed back through webhook metadata.
    pub purpose: CheckoutPurpose,
}

/// Checkout opened at a processor.
///
/// Stripe-style processors return a client secret for an embedded form,
/// Paddle-style processors a hosted checkout URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSession {
    pub gateway: Gateway,
    /// Processor identifier of the payment; also its payment id once paid.
    pub reference: String,
    pub client_secret: Option<String>,
    pub checkout_url: Option<String>,
}

/// Processor-side status of a payment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentStatus {
    Succeeded,
    Pending,
    Failed,
    /// Abandoned or expired checkout.
    Expired,
}

/// Payment as reported by the processor's API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentLookup {
    pub reference: String,
    pub status: PaymentStatus,
    pub amount: Money,
    pub metadata: BTreeMap<String, String>,
}

/// What a webhook delivery reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEventKind {
    PaymentSucceeded,
    PaymentFailed,
    /// Event type the wallet does not act on.
    Ignored(String),
}

/// Normalized payment notification, from a webhook or a status poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayEvent {
    pub gateway: Gateway,
    /// Processor event id, `None` for synthesized events (client confirm, sweeper).
    pub event_id: Option<String>,
    pub kind: GatewayEventKind,
    pub payment_id: String,
    pub amount: Money,
    pub metadata: BTreeMap<String, String>,
}

impl GatewayEvent {
    /// Event synthesized from a status lookup.
    pub fn from_lookup(gateway: Gateway, lookup: PaymentLookup) -> Self {
        let kind = match lookup.status {
            PaymentStatus::Succeeded => GatewayEventKind::PaymentSucceeded,
            PaymentStatus::Failed | PaymentStatus::Expired => GatewayEventKind::PaymentFailed,
            PaymentStatus::Pending => GatewayEventKind::Ignored("pending".to_string()),
        };
        Self {
            gateway,
            event_id: None,
            kind,
            payment_id: lookup.reference,
            amount: lookup.amount,
            metadata: lookup.metadata,
        }
    }

    pub fn purpose(&self) -> Option<CheckoutPurpose> {
        CheckoutPurpose::from_metadata(&self.metadata)
    }
}

/// Port trait for a payment processor.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Which processor this adapter talks to.
    fn kind(&self) -> Gateway;

    /// Open a checkout carrying `request.purpose` as metadata.
    async fn create_checkout(&self, request: CheckoutRequest) -> GatewayResult<CheckoutSession>;

    /// Fetch the current status of a payment.
    async fn payment_status(&self, reference: &str) -> GatewayResult<PaymentLookup>;

    /// Checkout details of an open payment, for a customer who lost them.
    async fn resume_checkout(&self, reference: &str) -> GatewayResult<CheckoutSession>;

    /// Close an unpaid checkout so it can no longer be paid.
    async fn cancel_payment(&self, reference: &str) -> GatewayResult<()>;

    /// Verify a webhook delivery and normalize it.
    ///
    /// Fails with [`GatewayError::InvalidSignature`] before looking at the
    /// payload when the signature does not match.
    fn parse_webhook(&self, payload: &[u8], signature: Option<&str>) -> GatewayResult<GatewayEvent>;
}

/// Registry of configured payment processors.
pub struct GatewayRegistry {
    gateways: HashMap<Gateway, Arc<dyn PaymentGateway>>,
    default: Option<Gateway>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self {
            gateways: HashMap::new(),
            default: None,
        }
    }

    /// Register a processor. The first one registered becomes the default.
    pub fn register(&mut self, gateway: Arc<dyn PaymentGateway>) {
        let kind = gateway.kind();
        self.default.get_or_insert(kind);
        self.gateways.insert(kind, gateway);
    }

    /// Override the processor used when a client does not choose one.
    pub fn set_default(&mut self, kind: Gateway) {
        self.default = Some(kind);
    }

    /// Get the adapter for a processor.
    pub fn get(&self, kind: Gateway) -> GatewayResult<&Arc<dyn PaymentGateway>> {
        self.gateways
            .get(&kind)
            .ok_or(GatewayError::NotConfigured(kind))
    }

    /// Resolve the client's choice, falling back to the default processor.
    pub fn choose(&self, requested: Option<Gateway>) -> GatewayResult<&Arc<dyn PaymentGateway>> {
        match requested.or(self.default) {
            Some(kind) => self.get(kind),
            None => Err(GatewayError::NotConfigured(Gateway::Stripe)),
        }
    }

    /// List registered processors.
    pub fn registered(&self) -> Vec<Gateway> {
        let mut kinds: Vec<Gateway> = self.gateways.keys().copied().collect();
        kinds.sort();
        kinds
    }
}

impl Default for GatewayRegistry {
    fn default() -> Self {
        Self::new()
    }
}
