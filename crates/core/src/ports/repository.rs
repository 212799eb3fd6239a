//! Port traits for data repositories.
//!
//! These traits define the storage interface used by the domain layer.
//! Implementations live in the infrastructure layer (`electa-storage`) and in
//! [`crate::memory`].

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageResult;
use crate::models::{
    AccountId, Balance, DepositId, ElectionId, ElectionSettlement, EscrowDeposit, EscrowStatus,
    Gateway, LockedFunds, Transaction, TransactionId, TransactionKind, TransactionStatus,
    WalletAccount, WalletAnalytics, WebhookReceipt,
};

use super::pagination::{OrderDirection, Page, PageRequest};

// =============================================================================
// Filter Types
// =============================================================================

/// Direction of a transaction relative to the wallet being listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowDirection {
    /// Credits to the wallet.
    Incoming,
    /// Debits from the wallet, and payments it made through a gateway.
    Outgoing,
}

/// Filter options for transaction history queries.
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub kind: Option<TransactionKind>,
    pub status: Option<TransactionStatus>,
    pub election_id: Option<ElectionId>,
    pub direction: Option<FlowDirection>,
}

impl TransactionFilter {
    /// Whether `txn` belongs to `account`'s history and matches this filter.
    ///
    /// History covers rows on the account and rows it paid for as a voter.
    pub fn matches(&self, account: &AccountId, txn: &Transaction) -> bool {
        let owns = &txn.account_id == account;
        let paid = txn.payer_id.as_ref() == Some(account);
        if !owns && !paid {
            return false;
        }
        if self.kind.is_some_and(|k| k != txn.kind)
            || self.status.is_some_and(|s| s != txn.status)
            || self
                .election_id
                .as_ref()
                .is_some_and(|e| txn.election_id.as_ref() != Some(e))
        {
            return false;
        }
        match self.direction {
            None => true,
            Some(FlowDirection::Incoming) => owns && txn.credit.is_some() && txn.debit.is_none(),
            Some(FlowDirection::Outgoing) => {
                (owns && txn.debit.is_some() && txn.credit.is_none()) || (paid && !owns)
            }
        }
    }
}

// =============================================================================
// Ledger Entries
// =============================================================================

/// Moves a pending transaction to a terminal status.
///
/// When `status` is `Success` the stored row's bucket movement is applied.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub transaction_id: TransactionId,
    /// Owner of the row, so the commit can lock it up front.
    pub account_id: AccountId,
    pub status: TransactionStatus,
    pub resolved_at: DateTime<Utc>,
}

/// Compare-and-set transition of an escrow deposit.
#[derive(Debug, Clone)]
pub struct EscrowTransition {
    pub deposit_id: DepositId,
    pub from: EscrowStatus,
    pub to: EscrowStatus,
    /// Recorded when moving to `Completed`.
    pub gateway_payment_id: Option<String>,
    pub at: DateTime<Utc>,
}

/// Atomic unit of ledger work.
///
/// Everything in an entry commits together or not at all. Guards (receipt,
/// settlement marker, escrow compare-and-set, pending resolution) fail the
/// whole entry with [`crate::error::StorageError::Duplicate`] or
/// [`crate::error::StorageError::StaleState`] when already consumed.
#[derive(Debug, Clone, Default)]
pub struct LedgerEntry {
    pub transactions: Vec<Transaction>,
    pub resolutions: Vec<Resolution>,
    pub escrow: Option<EscrowTransition>,
    pub settlement: Option<ElectionSettlement>,
    pub receipt: Option<WebhookReceipt>,
}

impl LedgerEntry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(mut self, txn: Transaction) -> Self {
        self.transactions.push(txn);
        self
    }

    pub fn record_all(mut self, txns: impl IntoIterator<Item = Transaction>) -> Self {
        self.transactions.extend(txns);
        self
    }

    pub fn resolve(mut self, txn: &Transaction, status: TransactionStatus) -> Self {
        self.resolutions.push(Resolution {
            transaction_id: txn.id,
            account_id: txn.account_id.clone(),
            status,
            resolved_at: Utc::now(),
        });
        self
    }

    pub fn transition(mut self, transition: EscrowTransition) -> Self {
        self.escrow = Some(transition);
        self
    }

    pub fn settle(mut self, marker: ElectionSettlement) -> Self {
        self.settlement = Some(marker);
        self
    }

    pub fn with_receipt(mut self, receipt: Option<WebhookReceipt>) -> Self {
        self.receipt = receipt;
        self
    }

    /// Accounts touched by this entry, sorted and deduplicated.
    ///
    /// Lock acquisition must follow this order.
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut ids: Vec<AccountId> = self
            .transactions
            .iter()
            .map(|t| t.account_id.clone())
            .chain(self.resolutions.iter().map(|r| r.account_id.clone()))
            .collect();
        ids.sort();
        ids.dedup();
        ids
    }

    pub fn is_empty(&self) -> bool {
        self.transactions.is_empty()
            && self.resolutions.is_empty()
            && self.escrow.is_none()
            && self.settlement.is_none()
            && self.receipt.is_none()
    }

    /// Label used for metrics: the kind of the first row, or the guard kind.
    pub fn label(&self) -> &'static str {
        if let Some(txn) = self.transactions.first() {
            return txn.kind.as_str();
        }
        if !self.resolutions.is_empty() {
            return "resolution";
        }
        if self.escrow.is_some() {
            return "escrow_transition";
        }
        "marker"
    }
}

/// Result of a committed entry: post-commit balances of touched accounts.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    pub balances: BTreeMap<AccountId, Balance>,
}

// =============================================================================
// Repository Traits
// =============================================================================

/// Repository for wallet accounts.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Get a wallet, `None` if the user never had any activity.
    async fn get_account(&self, id: &AccountId) -> StorageResult<Option<WalletAccount>>;
}

/// Repository for ledger transactions.
#[async_trait]
pub trait TransactionRepository: Send + Sync {
    /// Get transaction by ID.
    async fn get_transaction(&self, id: &TransactionId) -> StorageResult<Option<Transaction>>;

    /// List an account's history with pagination and filtering.
    async fn list_transactions(
        &self,
        account: &AccountId,
        filter: TransactionFilter,
        page: PageRequest,
        order: OrderDirection,
    ) -> StorageResult<Page<Transaction>>;

    /// Transactions created for a gateway payment, any kind or status.
    async fn find_by_reference(
        &self,
        gateway: Gateway,
        reference: &str,
    ) -> StorageResult<Vec<Transaction>>;

    /// Successful participation fee of `voter` for `election`, if any.
    async fn find_successful_fee(
        &self,
        voter: &AccountId,
        election: &ElectionId,
    ) -> StorageResult<Option<Transaction>>;

    /// Successful voter-fee transactions of an election.
    async fn voter_fees(&self, election: &ElectionId) -> StorageResult<Vec<Transaction>>;

    /// Blocked voter fees of a creator grouped by unsettled election.
    async fn locked_funds(&self, creator: &AccountId) -> StorageResult<Vec<LockedFunds>>;

    /// Pending gateway-backed transactions created before `before`.
    async fn stale_pending(&self, before: DateTime<Utc>) -> StorageResult<Vec<Transaction>>;

    /// Withdrawals awaiting admin approval, oldest first.
    async fn pending_withdrawals(&self) -> StorageResult<Vec<Transaction>>;

    /// Aggregate totals for an account's analytics view.
    async fn analytics(&self, account: &AccountId) -> StorageResult<WalletAnalytics>;
}

/// Repository for prize-pool escrow deposits.
#[async_trait]
pub trait EscrowRepository: Send + Sync {
    /// Insert a new deposit.
    ///
    /// Fails with `Duplicate` when a live deposit exists for the same
    /// (election, creator).
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> StorageResult<()>;

    /// Get deposit by ID.
    async fn get_deposit(&self, id: &DepositId) -> StorageResult<Option<EscrowDeposit>>;

    /// Live (pending or completed) deposit for an (election, creator) pair.
    async fn find_live_deposit(
        &self,
        election: &ElectionId,
        creator: &AccountId,
    ) -> StorageResult<Option<EscrowDeposit>>;

    /// Pending deposits created before `before`.
    async fn stale_pending(&self, before: DateTime<Utc>) -> StorageResult<Vec<EscrowDeposit>>;
}

/// Repository for settlement markers and webhook receipts.
#[async_trait]
pub trait SettlementRepository: Send + Sync {
    /// Settlement marker of an election, if it was settled.
    async fn get_settlement(
        &self,
        election: &ElectionId,
    ) -> StorageResult<Option<ElectionSettlement>>;

    /// Whether a webhook event was already processed.
    async fn has_receipt(&self, gateway: Gateway, event_id: &str) -> StorageResult<bool>;
}

// =============================================================================
// Composite Repository
// =============================================================================

/// Combined repository access for the wallet services.
///
/// This trait provides access to all individual repositories and the
/// atomic commit that spans them.
#[async_trait]
pub trait Repositories: Send + Sync {
    /// Access the account repository.
    fn accounts(&self) -> &dyn AccountRepository;

    /// Access the transaction repository.
    fn transactions(&self) -> &dyn TransactionRepository;

    /// Access the escrow repository.
    fn escrows(&self) -> &dyn EscrowRepository;

    /// Access settlement markers and webhook receipts.
    fn settlements(&self) -> &dyn SettlementRepository;

    /// Commit a ledger entry atomically in a single transaction.
    ///
    /// Creates missing accounts, inserts rows, applies the bucket movements
    /// of successful rows and resolutions, and writes guards. A bucket that
    /// would go negative fails the entry with `NegativeBalance`. If any
    /// operation fails, everything is rolled back.
    async fn commit_entry(&self, entry: LedgerEntry) -> StorageResult<CommitReceipt>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Bucket, Money};

    fn row(account: &str) -> Transaction {
        Transaction::new(
            AccountId::from(account),
            TransactionKind::Deposit,
            Money::from_cents(100),
        )
    }

    // Test critique: l'ordre des verrous est déterministe
    #[test]
    fn test_entry_accounts_sorted_and_deduplicated() {
        let pending = row("alice").pending();
        let entry = LedgerEntry::new()
            .record(row("carol"))
            .record(row("alice"))
            .resolve(&pending, TransactionStatus::Success)
            .record(row("bob"));
        let ids: Vec<String> = entry.accounts().into_iter().map(|a| a.0).collect();
        assert_eq!(ids, vec!["alice", "bob", "carol"]);
    }

    #[test]
    fn test_filter_direction_for_voter_payments() {
        let creator = AccountId::from("creator");
        let voter = AccountId::from("voter");
        let fee = Transaction::new(
            creator.clone(),
            TransactionKind::VoterFeePayment,
            Money::from_cents(430),
        )
        .credit_to(Bucket::Blocked)
        .paid_by(voter.clone());

        let incoming = TransactionFilter {
            direction: Some(FlowDirection::Incoming),
            ..Default::default()
        };
        let outgoing = TransactionFilter {
            direction: Some(FlowDirection::Outgoing),
            ..Default::default()
        };

        assert!(incoming.matches(&creator, &fee));
        assert!(!outgoing.matches(&creator, &fee));
        assert!(outgoing.matches(&voter, &fee));
        assert!(!TransactionFilter::default().matches(&AccountId::from("eve"), &fee));
    }
}
