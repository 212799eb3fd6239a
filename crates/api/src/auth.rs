//! Request authentication extractors.
//!
//! - [`AuthUser`] - bearer session resolved by the auth service
//! - [`AdminUser`] - same, with the admin role
//! - [`ServiceCaller`] - election service calling internal routes

use axum::extract::FromRequestParts;
use axum::http::header::AUTHORIZATION;
use axum::http::request::Parts;
use sha2::{Digest, Sha256};
use tracing::debug;

use electa_core::ports::Principal;

use crate::error::ApiError;
use crate::state::ApiState;

pub const SERVICE_TOKEN_HEADER: &str = "x-service-token";

fn bearer(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Compare secrets through their digests so timing does not depend on the prefix.
fn same_secret(given: &str, expected: &str) -> bool {
    let given = Sha256::digest(given.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    given
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

/// Authenticated wallet owner.
#[derive(Debug, Clone)]
pub struct AuthUser(pub Principal);

impl FromRequestParts<ApiState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let token = bearer(parts).ok_or(ApiError::Unauthorized)?;
        let principal = state
            .sessions
            .verify(token)
            .await?
            .ok_or(ApiError::Unauthorized)?;
        debug!(account = %principal.account_id, "Session resolved");
        Ok(AuthUser(principal))
    }
}

/// Authenticated caller holding the admin role.
#[derive(Debug, Clone)]
pub struct AdminUser(pub Principal);

impl FromRequestParts<ApiState> for AdminUser {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let AuthUser(principal) = AuthUser::from_request_parts(parts, state).await?;
        if !principal.is_admin() {
            return Err(ApiError::Forbidden("admin role required".to_string()));
        }
        Ok(AdminUser(principal))
    }
}

/// Internal caller presenting the shared service token.
#[derive(Debug, Clone, Copy)]
pub struct ServiceCaller;

impl FromRequestParts<ApiState> for ServiceCaller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &ApiState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.service_token.as_deref() else {
            return Err(ApiError::Forbidden("internal routes are disabled".to_string()));
        };
        let given = parts
            .headers
            .get(SERVICE_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        if !same_secret(given, expected) {
            return Err(ApiError::Forbidden("invalid service token".to_string()));
        }
        Ok(ServiceCaller)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    #[test]
    fn test_bearer_parsing() {
        let (parts, _) = Request::builder()
            .header(AUTHORIZATION, "Bearer demo:alice")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer(&parts), Some("demo:alice"));

        let (parts, _) = Request::builder()
            .header(AUTHORIZATION, "Basic abc")
            .body(())
            .unwrap()
            .into_parts();
        assert_eq!(bearer(&parts), None);
    }

    #[test]
    fn test_same_secret() {
        assert!(same_secret("s3cret", "s3cret"));
        assert!(!same_secret("s3cret", "s3cre"));
        assert!(!same_secret("", "s3cret"));
    }
}
