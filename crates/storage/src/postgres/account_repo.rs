//! Account repository implementation for PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use electa_core::error::StorageResult;
use electa_core::models::{AccountId, Balance, WalletAccount};
use electa_core::ports::AccountRepository;

use super::database::Database;
use super::helpers::{cents, query_error};

/// PostgreSQL implementation of AccountRepository.
pub struct PgAccountRepository {
    pool: PgPool,
}

impl PgAccountRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl AccountRepository for PgAccountRepository {
    async fn get_account(&self, id: &AccountId) -> StorageResult<Option<WalletAccount>> {
        let row = sqlx::query_as::<_, AccountRow>(
            r#"
            SELECT id, available_cents, blocked_cents, escrowed_cents, created_at, updated_at
            FROM wallet_accounts
            WHERE id = $1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        row.map(AccountRow::into_account).transpose()
    }
}

/// Database row representation for WalletAccount.
#[derive(sqlx::FromRow)]
pub(super) struct AccountRow {
    id: String,
    available_cents: i64,
    blocked_cents: i64,
    escrowed_cents: i64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl AccountRow {
    pub(super) fn into_account(self) -> StorageResult<WalletAccount> {
        Ok(WalletAccount {
            id: AccountId::from(self.id),
            balance: Balance {
                available: cents(self.available_cents, "wallet_accounts.available_cents")?,
                blocked: cents(self.blocked_cents, "wallet_accounts.blocked_cents")?,
                escrowed: cents(self.escrowed_cents, "wallet_accounts.escrowed_cents")?,
            },
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}
