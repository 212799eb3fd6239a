//! Port trait for session verification.
//!
//! Identity is never taken from client-supplied headers. Bearer tokens are
//! resolved by the auth service behind this port.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::UpstreamResult;
use crate::models::AccountId;

/// Role granting withdrawal review.
pub const ADMIN_ROLE: &str = "admin";

/// Authenticated caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Principal {
    pub account_id: AccountId,
    #[serde(default)]
    pub roles: Vec<String>,
}

impl Principal {
    pub fn has_role(&self, role: &str) -> bool {
        self.roles.iter().any(|r| r == role)
    }

    pub fn is_admin(&self) -> bool {
        self.has_role(ADMIN_ROLE)
    }
}

/// Port trait for resolving a session token.
#[async_trait]
pub trait SessionVerifier: Send + Sync {
    /// Resolve a bearer token, `None` when the session is unknown or expired.
    async fn verify(&self, token: &str) -> UpstreamResult<Option<Principal>>;
}
