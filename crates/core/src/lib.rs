//! Core domain layer for the Electa wallet.
//!
//! This crate contains the domain models, port traits (interfaces), and
//! business services for the creator wallet, prize-pool escrow and
//! fee-settlement backend. It is the innermost layer with no dependencies
//! on infrastructure.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      electa (binary)                        │
//! ├─────────────────────────────────────────────────────────────┤
//! │    electa-api     │  electa-gateways   │  electa-upstream   │
//! │     (REST)        │ (Stripe / Paddle)  │ (elections, auth)  │
//! ├───────────────────┴────────────────────┴────────────────────┤
//! │                     electa-storage                          │
//! │                      (PostgreSQL)                           │
//! ├─────────────────────────────────────────────────────────────┤
//! │                     electa-core  ← YOU ARE HERE             │
//! │           (models, ports, services, memory store)           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`models`] - Domain models (Money, Balance, Transaction, EscrowDeposit, ...)
//! - [`ports`] - Interface traits for adapters to implement
//! - [`services`] - Ledger, fees, escrow, settlement, reconciliation, wallet
//! - [`memory`] - In-memory [`ports::Repositories`] used in demo mode and tests
//! - [`error`] - Error taxonomy
//! - [`metrics`] - Prometheus metrics definitions
//!
//! # Key Concepts
//!
//! ## Ledger entries
//!
//! Every balance change is one [`models::Transaction`] row. Services build a
//! [`ports::LedgerEntry`] (new rows, pending resolutions, an escrow
//! transition, settlement marker, webhook receipt) and commit it atomically.
//! Idempotency guards live in the same entry as the movement they protect,
//! so a duplicate delivery fails the whole entry instead of double-crediting.
//!
//! ## Locking
//!
//! Mutations on an account serialize through [`services::AccountLocks`];
//! storage adapters additionally take row locks inside the commit.

pub mod error;
pub mod memory;
pub mod metrics;
pub mod models;
pub mod ports;
pub mod services;
