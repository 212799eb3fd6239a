//! REST API for the Electa wallet.
//!
//! JSON over HTTP with axum. Amounts are dollars on the wire and cents in the
//! ledger; [`types`] does the conversion.
//!
//! # Routes
//!
//! | Caller | Routes |
//! |--------|--------|
//! | wallet owner (bearer session) | `/wallet/*`, `/wallet/sponsor/*` |
//! | admin (bearer session, admin role) | `/admin/withdrawals/*` |
//! | election service (`x-service-token`) | `/internal/elections/*` |
//! | payment processors (signed) | `/webhooks/{gateway}` |
//!
//! # Usage
//!
//! ```ignore
//! use electa_api::{ApiState, ServerConfig, serve_with_shutdown};
//!
//! serve_with_shutdown(state, ServerConfig::default(), async move {
//!     let _ = shutdown_rx.changed().await;
//! })
//! .await?;
//! ```

pub mod auth;
pub mod error;
pub mod routes;
pub mod server;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use routes::router;
pub use server::{ServerConfig, serve_with_shutdown};
pub use state::ApiState;

#[cfg(test)]
mod tests;
