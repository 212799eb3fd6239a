//! Payment processor adapters for the Electa wallet.
//!
//! Each adapter implements [`electa_core::ports::PaymentGateway`]:
//!
//! - [`StripeGateway`] - Payment Intents, `Stripe-Signature` webhooks
//! - [`PaddleGateway`] - Billing transactions, `Paddle-Signature` webhooks
//! - [`SandboxGateway`] - in-process processor for demo mode and tests
//!
//! Adapters only translate. They never touch the ledger; the reconciler in
//! `electa-core` decides what a confirmed payment means.
//!
//! # Usage
//!
//! ```ignore
//! use electa_gateways::{StripeConfig, StripeGateway};
//!
//! let mut registry = GatewayRegistry::new();
//! registry.register(Arc::new(StripeGateway::new(StripeConfig::new(key, secret))?));
//! ```

pub mod paddle;
pub mod sandbox;
pub mod signature;
pub mod stripe;
mod utils;

pub use paddle::{PaddleConfig, PaddleGateway};
pub use sandbox::{SANDBOX_SIGNATURE_HEADER, SandboxConfig, SandboxGateway};
pub use stripe::{StripeConfig, StripeGateway};
