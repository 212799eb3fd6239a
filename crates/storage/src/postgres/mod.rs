//! PostgreSQL storage adapter.
//!
//! This module implements the repository traits defined in `electa-core`
//! using PostgreSQL as the backing store.
//!
//! # Architecture
//!
//! - [`Database`] - Connection pool and migrations
//! - [`PgRepositories`] - Composite repository implementing `Repositories` trait
//! - Individual repos: `PgAccountRepository`, `PgTransactionRepository`, etc.
//!
//! # Usage
//!
//! ```ignore
//! let config = DatabaseConfig::for_service(&database_url, lock_timeout);
//! let db = Database::connect(&config).await?;
//! db.migrate().await?;
//!
//! let repositories = PgRepositories::new(Arc::new(db));
//! ```

mod account_repo;
mod database;
mod escrow_repo;
mod helpers;
mod settlement_repo;
mod transaction_repo;

pub use account_repo::PgAccountRepository;
pub use database::{Database, DatabaseConfig};
pub use escrow_repo::PgEscrowRepository;
pub use settlement_repo::PgSettlementRepository;
pub use transaction_repo::PgTransactionRepository;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use sqlx::PgConnection;
use tracing::{debug, instrument};

use electa_core::error::{StorageError, StorageResult};
use electa_core::models::{
    AccountId, Balance, ElectionSettlement, EscrowStatus, Transaction, TransactionId,
    TransactionStatus, WebhookReceipt,
};
use electa_core::ports::{
    AccountRepository, CommitReceipt, EscrowRepository, EscrowTransition, LedgerEntry,
    Repositories, SettlementRepository, TransactionRepository,
};

use account_repo::AccountRow;
use helpers::{int_column, query_error};
use transaction_repo::{TRANSACTION_COLUMNS, TransactionRow, insert_transaction};

// =============================================================================
// Composite Repository
// =============================================================================

/// Aggregated PostgreSQL repositories implementing the `Repositories` trait.
///
/// This provides a single entry point for all storage operations and
/// implements the atomic ledger commit spanning every table.
pub struct PgRepositories {
    db: Arc<Database>,
    accounts: PgAccountRepository,
    transactions: PgTransactionRepository,
    escrows: PgEscrowRepository,
    settlements: PgSettlementRepository,
}

impl PgRepositories {
    /// Create a new repository aggregate from a database connection.
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            accounts: PgAccountRepository::new(&db),
            transactions: PgTransactionRepository::new(&db),
            escrows: PgEscrowRepository::new(&db),
            settlements: PgSettlementRepository::new(&db),
            db,
        }
    }
}

#[async_trait]
impl Repositories for PgRepositories {
    fn accounts(&self) -> &dyn AccountRepository {
        &self.accounts
    }

    fn transactions(&self) -> &dyn TransactionRepository {
        &self.transactions
    }

    fn escrows(&self) -> &dyn EscrowRepository {
        &self.escrows
    }

    fn settlements(&self) -> &dyn SettlementRepository {
        &self.settlements
    }

    #[instrument(skip_all, fields(entry = entry.label()))]
    async fn commit_entry(&self, entry: LedgerEntry) -> StorageResult<CommitReceipt> {
        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        sqlx::query(&self.db.lock_timeout_statement())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;

        let mut staged = lock_accounts(&mut *tx, &entry.accounts()).await?;

        if let Some(receipt) = &entry.receipt {
            insert_receipt(&mut *tx, receipt).await?;
        }
        if let Some(marker) = &entry.settlement {
            insert_settlement(&mut *tx, marker).await?;
        }
        if let Some(transition) = &entry.escrow {
            transition_deposit(&mut *tx, transition).await?;
        }

        // Resolutions first: a new row may spend what a resolution brings in.
        for resolution in &entry.resolutions {
            let stored = lock_transaction(&mut *tx, &resolution.transaction_id).await?;
            if stored.status != TransactionStatus::Pending
                || stored.account_id != resolution.account_id
            {
                return Err(StorageError::StaleState(format!(
                    "transaction {} is {}",
                    stored.id, stored.status
                )));
            }
            if resolution.status == TransactionStatus::Success {
                apply(&mut staged, &stored)?;
            }
            sqlx::query(
                "UPDATE wallet_transactions SET status = $2, resolved_at = $3 WHERE id = $1",
            )
            .bind(resolution.transaction_id.as_uuid())
            .bind(resolution.status.as_str())
            .bind(resolution.resolved_at)
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        for txn in &entry.transactions {
            if txn.status == TransactionStatus::Success {
                apply(&mut staged, txn)?;
            }
            insert_transaction(&mut *tx, txn).await?;
        }

        for (id, balance) in &staged {
            sqlx::query(
                r#"
                UPDATE wallet_accounts
                SET available_cents = $2, blocked_cents = $3, escrowed_cents = $4, updated_at = NOW()
                WHERE id = $1
                "#,
            )
            .bind(id.as_str())
            .bind(balance.available.cents())
            .bind(balance.blocked.cents())
            .bind(balance.escrowed.cents())
            .execute(&mut *tx)
            .await
            .map_err(query_error)?;
        }

        tx.commit()
            .await
            .map_err(|e| StorageError::TransactionError(e.to_string()))?;

        debug!(accounts = staged.len(), "Ledger entry committed");
        Ok(CommitReceipt { balances: staged })
    }
}

// =============================================================================
// Commit steps
// =============================================================================

/// Open missing wallets, then lock every touched row in id order.
async fn lock_accounts(
    conn: &mut PgConnection,
    accounts: &[AccountId],
) -> StorageResult<BTreeMap<AccountId, Balance>> {
    let ids: Vec<String> = accounts.iter().map(|a| a.as_str().to_string()).collect();

    sqlx::query(
        "INSERT INTO wallet_accounts (id) SELECT UNNEST($1::TEXT[]) ON CONFLICT (id) DO NOTHING",
    )
    .bind(&ids)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    let rows = sqlx::query_as::<_, AccountRow>(
        r#"
        SELECT id, available_cents, blocked_cents, escrowed_cents, created_at, updated_at
        FROM wallet_accounts
        WHERE id = ANY($1)
        ORDER BY id
        FOR UPDATE
        "#,
    )
    .bind(&ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(query_error)?;

    rows.into_iter()
        .map(|row| row.into_account().map(|a| (a.id, a.balance)))
        .collect()
}

async fn insert_receipt(conn: &mut PgConnection, receipt: &WebhookReceipt) -> StorageResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO webhook_receipts (gateway, event_id, received_at)
        VALUES ($1, $2, $3)
        ON CONFLICT (gateway, event_id) DO NOTHING
        "#,
    )
    .bind(receipt.gateway.as_str())
    .bind(&receipt.event_id)
    .bind(receipt.received_at)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::Duplicate(format!(
            "webhook {} already processed",
            receipt.event_id
        )));
    }
    Ok(())
}

async fn insert_settlement(
    conn: &mut PgConnection,
    marker: &ElectionSettlement,
) -> StorageResult<()> {
    let result = sqlx::query(
        r#"
        INSERT INTO election_settlements (
            election_id, creator_id, outcome, amount_cents, participant_count, settled_at
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        ON CONFLICT (election_id) DO NOTHING
        "#,
    )
    .bind(marker.election_id.as_str())
    .bind(marker.creator_id.as_str())
    .bind(marker.outcome.as_str())
    .bind(marker.amount.cents())
    .bind(int_column(marker.participant_count, "participant_count")?)
    .bind(marker.settled_at)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    if result.rows_affected() == 0 {
        return Err(StorageError::Duplicate(format!(
            "election {} already settled",
            marker.election_id
        )));
    }
    Ok(())
}

/// Compare-and-set on the deposit status.
async fn transition_deposit(
    conn: &mut PgConnection,
    transition: &EscrowTransition,
) -> StorageResult<()> {
    let completes = transition.to == EscrowStatus::Completed;
    let settles = !matches!(transition.to, EscrowStatus::Pending | EscrowStatus::Completed);

    let result = sqlx::query(
        r#"
        UPDATE escrow_deposits
        SET status = $2,
            completed_at = CASE WHEN $3 THEN $5 ELSE completed_at END,
            gateway_payment_id = CASE WHEN $3 THEN $6 ELSE gateway_payment_id END,
            settled_at = CASE WHEN $4 THEN $5 ELSE settled_at END
        WHERE id = $1 AND status = $7
        "#,
    )
    .bind(transition.deposit_id.as_uuid())
    .bind(transition.to.as_str())
    .bind(completes)
    .bind(settles)
    .bind(transition.at)
    .bind(transition.gateway_payment_id.as_deref())
    .bind(transition.from.as_str())
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    if result.rows_affected() == 1 {
        return Ok(());
    }

    let current: Option<(String,)> = sqlx::query_as("SELECT status FROM escrow_deposits WHERE id = $1")
        .bind(transition.deposit_id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?;
    match current {
        None => Err(StorageError::NotFound(format!(
            "deposit {}",
            transition.deposit_id
        ))),
        Some((status,)) => Err(StorageError::StaleState(format!(
            "deposit {} is {status}, expected {}",
            transition.deposit_id, transition.from
        ))),
    }
}

async fn lock_transaction(conn: &mut PgConnection, id: &TransactionId) -> StorageResult<Transaction> {
    let query = format!(
        "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE id = $1 FOR UPDATE"
    );
    sqlx::query_as::<_, TransactionRow>(&query)
        .bind(id.as_uuid())
        .fetch_optional(&mut *conn)
        .await
        .map_err(query_error)?
        .ok_or_else(|| StorageError::NotFound(format!("transaction {id}")))?
        .into_transaction()
}

/// Apply a row's bucket movement to the staged balances.
fn apply(staged: &mut BTreeMap<AccountId, Balance>, txn: &Transaction) -> StorageResult<()> {
    let balance = staged.get_mut(&txn.account_id).ok_or_else(|| {
        StorageError::TransactionError(format!("account {} not locked", txn.account_id))
    })?;
    *balance = balance
        .apply(txn)
        .map_err(|bucket| StorageError::NegativeBalance {
            account: txn.account_id.clone(),
            bucket,
        })?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use electa_core::models::{Bucket, Money, TransactionKind};

    fn staged(account: &str, available: i64) -> BTreeMap<AccountId, Balance> {
        BTreeMap::from([(
            AccountId::from(account),
            Balance {
                available: Money::from_cents(available),
                ..Balance::default()
            },
        )])
    }

    // Test critique: un débit au-delà du solde est refusé avant tout UPDATE
    #[test]
    fn test_apply_rejects_overdraft() {
        let mut balances = staged("alice", 1_000);
        let txn = Transaction::new(AccountId::from("alice"), TransactionKind::Withdrawal, Money::from_cents(1_500))
            .debit_from(Bucket::Available);

        let err = apply(&mut balances, &txn).unwrap_err();
        assert!(matches!(err, StorageError::NegativeBalance { bucket: Bucket::Available, .. }));
        assert_eq!(balances[&AccountId::from("alice")].available, Money::from_cents(1_000));
    }

    #[test]
    fn test_apply_requires_locked_account() {
        let mut balances = staged("alice", 1_000);
        let txn = Transaction::new(AccountId::from("bob"), TransactionKind::Deposit, Money::from_cents(100))
            .credit_to(Bucket::Available);
        assert!(matches!(
            apply(&mut balances, &txn),
            Err(StorageError::TransactionError(_))
        ));
    }
}
