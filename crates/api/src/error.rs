//! HTTP mapping of the wallet error taxonomy.
//!
//! Client mistakes become 4xx with a message. Contention and upstream
//! timeouts become 503 with `Retry-After`. Invariant violations and storage
//! failures are logged at error and returned as an opaque 500.

use axum::Json;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

use electa_core::error::{GatewayError, LedgerError, UpstreamError};

/// Seconds a client should wait before retrying a 503.
const RETRY_AFTER_SECS: &str = "1";

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing or invalid session")]
    Unauthorized,

    #[error("{0}")]
    Forbidden(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

pub type ApiResult<T> = Result<T, ApiError>;

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        ApiError::Ledger(err.into())
    }
}

impl From<UpstreamError> for ApiError {
    fn from(err: UpstreamError) -> Self {
        ApiError::Ledger(err.into())
    }
}

impl ApiError {
    /// Status code and stable machine-readable code.
    fn classify(&self) -> (StatusCode, &'static str) {
        let ledger = match self {
            ApiError::Unauthorized => return (StatusCode::UNAUTHORIZED, "unauthorized"),
            ApiError::Forbidden(_) => return (StatusCode::FORBIDDEN, "forbidden"),
            ApiError::BadRequest(_) => return (StatusCode::BAD_REQUEST, "bad_request"),
            ApiError::NotFound(_) => return (StatusCode::NOT_FOUND, "not_found"),
            ApiError::Ledger(err) => err,
        };
        if ledger.is_retryable() {
            return (StatusCode::SERVICE_UNAVAILABLE, "retryable");
        }
        match ledger {
            LedgerError::InsufficientFunds { .. } => {
                (StatusCode::UNPROCESSABLE_ENTITY, "insufficient_funds")
            }
            LedgerError::InvalidAmount(_) => (StatusCode::BAD_REQUEST, "invalid_amount"),
            LedgerError::Validation(_) => (StatusCode::BAD_REQUEST, "validation_error"),
            // No-op outcomes are reported as success.
            LedgerError::AlreadyConfirmed(_) => (StatusCode::OK, "already_confirmed"),
            LedgerError::DuplicateWebhook(_) => (StatusCode::OK, "duplicate_webhook"),
            LedgerError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
            LedgerError::InvalidState(_) => (StatusCode::CONFLICT, "invalid_state"),
            LedgerError::DepositRequired { .. } => (StatusCode::CONFLICT, "deposit_required"),
            LedgerError::Gateway(GatewayError::InvalidSignature) => {
                (StatusCode::BAD_REQUEST, "invalid_signature")
            }
            LedgerError::Gateway(GatewayError::NotConfigured(_)) => {
                (StatusCode::BAD_REQUEST, "gateway_not_configured")
            }
            LedgerError::Gateway(_) => (StatusCode::BAD_GATEWAY, "gateway_error"),
            LedgerError::Upstream(_) => (StatusCode::BAD_GATEWAY, "upstream_error"),
            LedgerError::Configuration(_)
            | LedgerError::FeeExceedsGross { .. }
            | LedgerError::Storage(_)
            | LedgerError::Retryable(_) => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.classify();

        let message = if status.is_server_error() && status != StatusCode::SERVICE_UNAVAILABLE {
            error!(error = %self, code, "Request failed");
            "internal error".to_string()
        } else {
            if status.is_server_error() {
                warn!(error = %self, "Retryable failure");
            }
            self.to_string()
        };

        let key = if status.is_success() { "status" } else { "error" };
        let mut body = json!({ key: code, "message": message });
        if let ApiError::Ledger(LedgerError::DepositRequired { amount, .. }) = &self {
            body["requiredAmount"] = json!(amount.as_dollars());
        }

        let mut response = (status, Json(body)).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static(RETRY_AFTER_SECS));
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use electa_core::error::StorageError;
    use electa_core::models::{AccountId, Bucket, ElectionId, Money};

    fn status_of(err: impl Into<ApiError>) -> StatusCode {
        err.into().into_response().status()
    }

    #[test]
    fn test_client_errors() {
        assert_eq!(
            status_of(LedgerError::InsufficientFunds {
                account: AccountId::from("alice"),
                bucket: Bucket::Available,
            }),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            status_of(LedgerError::InvalidAmount("too small".into())),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            status_of(LedgerError::DepositRequired {
                election_id: ElectionId::from("el_1"),
                amount: Money::from_dollars_whole(1000),
            }),
            StatusCode::CONFLICT
        );
        assert_eq!(status_of(GatewayError::InvalidSignature), StatusCode::BAD_REQUEST);
    }

    // Test critique: un timeout de verrou => 503 + Retry-After
    #[test]
    fn test_retryable_sets_retry_after() {
        let response = ApiError::from(LedgerError::from(StorageError::LockTimeout(
            "wallet_accounts".into(),
        )))
        .into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers().get(header::RETRY_AFTER).unwrap(), "1");

        assert_eq!(
            status_of(UpstreamError::Timeout("elections".into())),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_already_confirmed_is_not_a_failure() {
        assert_eq!(
            status_of(LedgerError::AlreadyConfirmed("withdrawal".into())),
            StatusCode::OK
        );
    }

    #[test]
    fn test_invariant_violations_are_opaque_500() {
        let err = ApiError::from(LedgerError::FeeExceedsGross {
            gross: Money::from_cents(10),
            fees: Money::from_cents(40),
        });
        assert_eq!(err.into_response().status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            status_of(LedgerError::from(StorageError::QueryError("boom".into()))),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
