//! Shared helper functions for PostgreSQL row conversion and error mapping.

use std::str::FromStr;

use electa_core::error::StorageError;
use electa_core::models::Money;

/// SQLSTATE `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";
/// SQLSTATE `check_violation`.
const CHECK_VIOLATION: &str = "23514";
/// SQLSTATE `lock_not_available`, raised when `lock_timeout` expires.
const LOCK_NOT_AVAILABLE: &str = "55P03";

/// Map a sqlx error to the storage taxonomy.
///
/// A CHECK violation means a bucket went negative despite the staged
/// balance check in `commit_entry`, so it surfaces as a constraint
/// violation rather than as insufficient funds.
pub fn query_error(e: sqlx::Error) -> StorageError {
    if let Some(db) = e.as_database_error()
        && let Some(code) = db.code()
        && let Some(mapped) = classify(code.as_ref(), db.message())
    {
        return mapped;
    }
    StorageError::QueryError(e.to_string())
}

fn classify(code: &str, message: &str) -> Option<StorageError> {
    match code {
        UNIQUE_VIOLATION => Some(StorageError::Duplicate(message.to_string())),
        CHECK_VIOLATION => Some(StorageError::ConstraintViolation(message.to_string())),
        LOCK_NOT_AVAILABLE => Some(StorageError::LockTimeout(message.to_string())),
        _ => None,
    }
}

/// Narrow a count to an `INTEGER` column.
pub fn int_column(value: u32, field_name: &str) -> Result<i32, StorageError> {
    i32::try_from(value)
        .map_err(|_| StorageError::SerializationError(format!("{field_name} out of range ({value})")))
}

/// Parse a text column into one of the domain's text enums.
pub fn parse_text<T>(value: &str, field_name: &str) -> Result<T, StorageError>
where
    T: FromStr<Err = String>,
{
    value
        .parse()
        .map_err(|e: String| StorageError::SerializationError(format!("{field_name}: {e}")))
}

/// Parse an optional text column.
pub fn parse_optional_text<T>(value: Option<&str>, field_name: &str) -> Result<Option<T>, StorageError>
where
    T: FromStr<Err = String>,
{
    value.map(|v| parse_text(v, field_name)).transpose()
}

/// Convert a cents column, rejecting negative amounts as corrupt.
pub fn cents(value: i64, field_name: &str) -> Result<Money, StorageError> {
    if value < 0 {
        return Err(StorageError::SerializationError(format!(
            "{field_name} is negative ({value}), which indicates data corruption"
        )));
    }
    Ok(Money::from_cents(value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use electa_core::models::{Bucket, TransactionStatus};

    // Test critique: un montant négatif en base indique une corruption
    #[test]
    fn test_negative_cents_rejected() {
        let err = cents(-1, "wallet_accounts.available_cents").unwrap_err();
        assert!(err.to_string().contains("corruption"));
        assert_eq!(cents(430, "x").unwrap(), Money::from_cents(430));
    }

    // Test critique: erreurs incluent le nom du champ pour debug
    #[test]
    fn test_parse_error_includes_field_name() {
        let err = parse_text::<TransactionStatus>("settled", "wallet_transactions.status").unwrap_err();
        assert!(err.to_string().contains("wallet_transactions.status"));

        let bucket: Option<Bucket> = parse_optional_text(Some("blocked"), "debit_bucket").unwrap();
        assert_eq!(bucket, Some(Bucket::Blocked));
        assert_eq!(parse_optional_text::<Bucket>(None, "debit_bucket").unwrap(), None);
    }

    #[test]
    fn test_sqlstate_classification() {
        assert!(matches!(classify("23505", "dup"), Some(StorageError::Duplicate(_))));
        assert!(matches!(
            classify("23514", "wallet_accounts_available_check"),
            Some(StorageError::ConstraintViolation(_))
        ));
        assert!(matches!(classify("55P03", "timeout"), Some(StorageError::LockTimeout(_))));
        assert!(classify("42P01", "undefined table").is_none());
    }

    // Test critique: un compteur hors plage n'est jamais tronqué silencieusement
    #[test]
    fn test_int_column_rejects_overflow() {
        assert_eq!(int_column(12, "participant_count").unwrap(), 12);
        let err = int_column(u32::MAX, "participant_count").unwrap_err();
        assert!(matches!(err, StorageError::SerializationError(_)));
        assert!(err.to_string().contains("participant_count"));
    }
}
