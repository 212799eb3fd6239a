//! Ledger store service.
//!
//! Wraps the [`Repositories`] port with per-account locking and the entry
//! validation every mutation goes through. All balance changes in the crate
//! flow through [`Ledger::commit_locked`].

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, instrument};

use crate::error::{LedgerError, LedgerResult};
use crate::metrics::{CommitTimer, record_commit};
use crate::models::{AccountId, Balance, Transaction, TransactionKind};
use crate::ports::{CommitReceipt, LedgerEntry, Repositories};

use super::locks::{AccountGuard, AccountLocks};

/// Ledger store: balances plus the immutable transaction log.
pub struct Ledger {
    repositories: Arc<dyn Repositories>,
    locks: AccountLocks,
}

impl Ledger {
    pub fn new(repositories: Arc<dyn Repositories>, lock_timeout: Duration) -> Self {
        Self {
            repositories,
            locks: AccountLocks::new(lock_timeout),
        }
    }

    /// Read access to the underlying repositories.
    pub fn repositories(&self) -> &dyn Repositories {
        self.repositories.as_ref()
    }

    /// Current balance. Accounts without activity have a zero balance.
    pub async fn balance(&self, account: &AccountId) -> LedgerResult<Balance> {
        Ok(self
            .repositories
            .accounts()
            .get_account(account)
            .await?
            .map(|a| a.balance)
            .unwrap_or_default())
    }

    /// Take the locks of `accounts` for a read-then-commit sequence.
    pub async fn lock(&self, accounts: &[AccountId]) -> LedgerResult<AccountGuard> {
        self.locks.acquire(accounts).await
    }

    /// Append one transaction and apply its movement.
    #[instrument(skip_all, fields(account = %txn.account_id, kind = %txn.kind))]
    pub async fn record_transaction(&self, txn: Transaction) -> LedgerResult<Transaction> {
        let _guard = self.lock(std::slice::from_ref(&txn.account_id)).await?;
        self.commit_locked(LedgerEntry::new().record(txn.clone()))
            .await?;
        Ok(txn)
    }

    /// Lock every account of `entry` and commit it.
    pub async fn commit(&self, entry: LedgerEntry) -> LedgerResult<CommitReceipt> {
        let _guard = self.lock(&entry.accounts()).await?;
        self.commit_locked(entry).await
    }

    /// Commit an entry whose accounts the caller already holds locked.
    #[instrument(skip_all, fields(entry = entry.label()))]
    pub async fn commit_locked(&self, entry: LedgerEntry) -> LedgerResult<CommitReceipt> {
        validate_entry(&entry)?;
        let label = entry.label();
        let _timer = CommitTimer::new();
        let receipt = self.repositories.commit_entry(entry).await?;
        record_commit(label);
        debug!(accounts = receipt.balances.len(), "Ledger entry committed");
        Ok(receipt)
    }
}

/// Row-level checks shared by every commit.
fn validate_entry(entry: &LedgerEntry) -> LedgerResult<()> {
    if entry.is_empty() {
        return Err(LedgerError::Validation("empty ledger entry".to_string()));
    }
    for txn in &entry.transactions {
        if !txn.amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "{} amount must be positive, got {}",
                txn.kind, txn.amount
            )));
        }
        if txn.debit.is_some() && txn.debit == txn.credit {
            return Err(LedgerError::Validation(format!(
                "{} moves {} onto itself",
                txn.kind, txn.amount
            )));
        }
        if txn.kind == TransactionKind::VoterFeePayment || txn.kind == TransactionKind::FeeRelease {
            let fees = txn.fees();
            if !fees.is_balanced() || fees.net_amount != txn.amount {
                error!(
                    txn = %txn.id,
                    gross = %fees.gross_amount,
                    net = %fees.net_amount,
                    amount = %txn.amount,
                    "❌ Unbalanced fee breakdown refused"
                );
                return Err(LedgerError::InvalidState(format!(
                    "transaction {} carries an unbalanced fee breakdown",
                    txn.id
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;
    use crate::models::{Bucket, FeeBreakdown, Money};

    fn ledger() -> Ledger {
        Ledger::new(Arc::new(MemoryStore::new()), Duration::from_millis(200))
    }

    // Test critique: aucun solde négatif, erreur métier explicite
    #[tokio::test]
    async fn test_overdraw_is_insufficient_funds() {
        let ledger = ledger();
        let alice = AccountId::from("alice");
        ledger
            .record_transaction(
                Transaction::new(alice.clone(), TransactionKind::Deposit, Money::from_cents(900))
                    .credit_to(Bucket::Available),
            )
            .await
            .unwrap();

        let err = ledger
            .record_transaction(
                Transaction::new(alice.clone(), TransactionKind::Withdrawal, Money::from_cents(901))
                    .debit_from(Bucket::Available),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientFunds { bucket: Bucket::Available, .. }));
        assert_eq!(ledger.balance(&alice).await.unwrap().available, Money::from_cents(900));
    }

    #[tokio::test]
    async fn test_unknown_account_has_zero_balance() {
        let balance = ledger().balance(&AccountId::from("nobody")).await.unwrap();
        assert_eq!(balance, Balance::default());
    }

    #[tokio::test]
    async fn test_rejects_non_positive_and_unbalanced_rows() {
        let ledger = ledger();
        let alice = AccountId::from("alice");

        let zero = Transaction::new(alice.clone(), TransactionKind::Deposit, Money::ZERO)
            .credit_to(Bucket::Available);
        assert!(matches!(
            ledger.record_transaction(zero).await,
            Err(LedgerError::InvalidAmount(_))
        ));

        let skewed = Transaction::new(alice, TransactionKind::VoterFeePayment, Money::from_cents(430))
            .credit_to(Bucket::Blocked)
            .with_fees(FeeBreakdown {
                gross_amount: Money::from_cents(500),
                gateway_fee: Money::from_cents(45),
                platform_fee: Money::from_cents(20),
                net_amount: Money::from_cents(430),
            });
        assert!(matches!(
            ledger.record_transaction(skewed).await,
            Err(LedgerError::InvalidState(_))
        ));
    }
}
