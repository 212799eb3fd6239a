//! Clients for the services the wallet depends on.
//!
//! - [`HttpElectionDirectory`] - election lookups (pricing, prize pool, status)
//! - [`HttpSessionVerifier`] - bearer token resolution by the auth service
//! - [`DemoSessionVerifier`] - `demo:<user>[:admin]` tokens for demo mode
//!
//! Both HTTP clients send `x-service-token` when configured with one.

mod client;
pub mod elections;
pub mod sessions;

pub use client::ServiceConfig;
pub use elections::HttpElectionDirectory;
pub use sessions::{DemoSessionVerifier, HttpSessionVerifier};
