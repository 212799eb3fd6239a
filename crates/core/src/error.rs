//! Error types for the wallet domain layer.
//!
//! This module defines a hierarchy of error types:
//!
//! - [`StorageError`] - Database/repository errors
//! - [`GatewayError`] - Payment processor errors
//! - [`UpstreamError`] - Election/auth service errors
//! - [`LedgerError`] - Domain taxonomy returned by every service
//!
//! Error conversion is automatic via `From` implementations,
//! allowing `?` to work across error boundaries.

use thiserror::Error;

use crate::models::{AccountId, Bucket, ElectionId, Gateway, Money};

// =============================================================================
// Storage Errors
// =============================================================================

/// Database and repository errors.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Failed to establish database connection.
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// SQL query execution failed.
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Requested record was not found.
    #[error("Record not found: {0}")]
    NotFound(String),

    /// Database constraint was violated (unique, foreign key, etc.).
    #[error("Constraint violation: {0}")]
    ConstraintViolation(String),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// Transaction commit/rollback failed.
    #[error("Transaction error: {0}")]
    TransactionError(String),

    /// Data serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// A row lock could not be acquired in time.
    #[error("Lock timeout: {0}")]
    LockTimeout(String),

    /// Applying a transaction would make a bucket negative.
    #[error("Balance of {account} would go negative in bucket {bucket}")]
    NegativeBalance { account: AccountId, bucket: Bucket },

    /// A uniqueness guard (receipt, settlement marker, live deposit) already exists.
    #[error("Duplicate: {0}")]
    Duplicate(String),

    /// A compare-and-set transition found the record in another state.
    #[error("Stale state: {0}")]
    StaleState(String),
}

// =============================================================================
// Gateway Errors
// =============================================================================

/// Payment processor errors.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// HTTP connection to the processor failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// The processor answered with an error status.
    #[error("{gateway} API error ({status}): {message}")]
    Api {
        gateway: Gateway,
        status: u16,
        message: String,
    },

    /// The processor did not answer in time.
    #[error("Gateway timeout: {0}")]
    Timeout(String),

    /// Webhook signature missing, malformed or not matching.
    #[error("Invalid webhook signature")]
    InvalidSignature,

    /// Webhook or API payload could not be interpreted.
    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    /// No adapter registered for this gateway.
    #[error("Gateway not configured: {0}")]
    NotConfigured(Gateway),
}

// =============================================================================
// Upstream Errors
// =============================================================================

/// Errors from the election and auth services.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("Upstream unavailable: {0}")]
    Unavailable(String),

    #[error("Upstream timeout: {0}")]
    Timeout(String),

    #[error("Invalid upstream response: {0}")]
    InvalidResponse(String),

    /// The service answered but refused the request.
    #[error("Upstream rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
}

// =============================================================================
// Ledger Errors
// =============================================================================

/// Domain error taxonomy returned by wallet services.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Insufficient funds in {bucket} balance of {account}")]
    InsufficientFunds { account: AccountId, bucket: Bucket },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    /// The operation already happened. Callers treat this as success.
    #[error("Already confirmed: {0}")]
    AlreadyConfirmed(String),

    /// Webhook event already processed. Ignored.
    #[error("Duplicate webhook: {0}")]
    DuplicateWebhook(String),

    /// Transient contention or timeout. The caller may retry.
    #[error("Retryable: {0}")]
    Retryable(String),

    /// Invalid configuration. Fatal at startup.
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Fees {fees} exceed gross amount {gross}")]
    FeeExceedsGross { gross: Money, fees: Money },

    #[error("Not found: {0}")]
    NotFound(String),

    /// The record exists but is in a state that forbids the operation.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// The election has a monetary prize pool without a completed deposit.
    #[error("Prize pool deposit of {amount} required before publishing election {election_id}")]
    DepositRequired { election_id: ElectionId, amount: Money },

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Upstream error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("Storage error: {0}")]
    Storage(StorageError),
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::LockTimeout(msg) => LedgerError::Retryable(msg),
            StorageError::NegativeBalance { account, bucket } => {
                LedgerError::InsufficientFunds { account, bucket }
            }
            other => LedgerError::Storage(other),
        }
    }
}

impl LedgerError {
    /// No-op outcomes reported as success to callers.
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            LedgerError::AlreadyConfirmed(_) | LedgerError::DuplicateWebhook(_)
        )
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            LedgerError::Retryable(_)
                | LedgerError::Gateway(GatewayError::Timeout(_))
                | LedgerError::Gateway(GatewayError::ConnectionFailed(_))
                | LedgerError::Upstream(UpstreamError::Timeout(_))
                | LedgerError::Upstream(UpstreamError::Unavailable(_))
        )
    }
}

// =============================================================================
// Result Type Aliases
// =============================================================================

/// Result type for wallet services.
pub type LedgerResult<T> = Result<T, LedgerError>;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Result type for payment gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Result type for upstream service calls.
pub type UpstreamResult<T> = Result<T, UpstreamError>;
