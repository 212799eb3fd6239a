//! In-memory adapters.
//!
//! [`MemoryStore`] implements [`Repositories`] with the same guard semantics
//! as the PostgreSQL adapter: a commit validates every guard and balance on a
//! staged copy before touching shared state. It backs demo mode and the
//! service tests. [`MemoryDirectory`] stands in for the election service.

use std::collections::{BTreeMap, HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::error::{StorageError, StorageResult, UpstreamResult};
use crate::models::{
    AccountId, Balance, DepositId, ElectionId, ElectionSettlement, EscrowDeposit, EscrowStatus,
    Gateway, LockedFunds, Money, Transaction, TransactionId, TransactionKind, TransactionStatus,
    WalletAccount, WalletAnalytics,
};
use crate::ports::{
    AccountRepository, CommitReceipt, ElectionDirectory, ElectionInfo, ElectionStatus,
    EscrowRepository, LedgerEntry, OrderDirection, Page, PageRequest, Repositories,
    SettlementRepository, TransactionFilter, TransactionRepository,
};

#[derive(Default)]
struct State {
    accounts: BTreeMap<AccountId, WalletAccount>,
    /// Insertion order doubles as creation order.
    transactions: Vec<Transaction>,
    index: HashMap<TransactionId, usize>,
    deposits: HashMap<DepositId, EscrowDeposit>,
    settlements: HashMap<ElectionId, ElectionSettlement>,
    receipts: HashSet<(Gateway, String)>,
}

impl State {
    fn transaction(&self, id: &TransactionId) -> Option<&Transaction> {
        self.index.get(id).map(|&i| &self.transactions[i])
    }

    fn reference_taken(&self, txn: &Transaction) -> bool {
        let (Some(gateway), Some(reference)) = (txn.gateway, txn.gateway_reference.as_deref())
        else {
            return false;
        };
        self.transactions.iter().any(|t| {
            t.kind == txn.kind
                && t.gateway == Some(gateway)
                && t.gateway_reference.as_deref() == Some(reference)
        })
    }
}

/// In-memory implementation of [`Repositories`].
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl AccountRepository for MemoryStore {
    async fn get_account(&self, id: &AccountId) -> StorageResult<Option<WalletAccount>> {
        Ok(self.state.read().await.accounts.get(id).cloned())
    }
}

#[async_trait]
impl TransactionRepository for MemoryStore {
    async fn get_transaction(&self, id: &TransactionId) -> StorageResult<Option<Transaction>> {
        Ok(self.state.read().await.transaction(id).cloned())
    }

    async fn list_transactions(
        &self,
        account: &AccountId,
        filter: TransactionFilter,
        page: PageRequest,
        order: OrderDirection,
    ) -> StorageResult<Page<Transaction>> {
        let state = self.state.read().await;
        let mut matching: Vec<&Transaction> = state
            .transactions
            .iter()
            .filter(|t| filter.matches(account, t))
            .collect();
        if order == OrderDirection::Desc {
            matching.reverse();
        }
        let total = matching.len() as u64;
        let items = matching
            .into_iter()
            .skip(page.offset() as usize)
            .take(page.limit as usize)
            .cloned()
            .collect();
        Ok(Page::new(items, page, total))
    }

    async fn find_by_reference(
        &self,
        gateway: Gateway,
        reference: &str,
    ) -> StorageResult<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.gateway == Some(gateway) && t.gateway_reference.as_deref() == Some(reference))
            .cloned()
            .collect())
    }

    async fn find_successful_fee(
        &self,
        voter: &AccountId,
        election: &ElectionId,
    ) -> StorageResult<Option<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .find(|t| {
                t.kind == TransactionKind::VoterFeePayment
                    && t.status == TransactionStatus::Success
                    && t.payer_id.as_ref() == Some(voter)
                    && t.election_id.as_ref() == Some(election)
            })
            .cloned())
    }

    async fn voter_fees(&self, election: &ElectionId) -> StorageResult<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| {
                t.kind == TransactionKind::VoterFeePayment
                    && t.status == TransactionStatus::Success
                    && t.election_id.as_ref() == Some(election)
            })
            .cloned()
            .collect())
    }

    async fn locked_funds(&self, creator: &AccountId) -> StorageResult<Vec<LockedFunds>> {
        let state = self.state.read().await;
        let mut groups: BTreeMap<ElectionId, (u32, Money, DateTime<Utc>)> = BTreeMap::new();
        for txn in &state.transactions {
            let Some(election) = txn.election_id.as_ref() else {
                continue;
            };
            if txn.kind != TransactionKind::VoterFeePayment
                || txn.status != TransactionStatus::Success
                || &txn.account_id != creator
                || state.settlements.contains_key(election)
            {
                continue;
            }
            let group = groups
                .entry(election.clone())
                .or_insert((0, Money::ZERO, txn.created_at));
            group.0 += 1;
            group.1 += txn.amount;
            group.2 = group.2.min(txn.created_at);
        }
        Ok(groups
            .into_iter()
            .map(|(election_id, (count, total, since))| LockedFunds {
                election_id,
                participant_count: count,
                fee_per_participant: total.split_even(count).map(|(share, _)| share).unwrap_or_default(),
                total_locked: total,
                oldest_payment_at: since,
            })
            .collect())
    }

    async fn stale_pending(&self, before: DateTime<Utc>) -> StorageResult<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| {
                t.status == TransactionStatus::Pending && t.gateway.is_some() && t.created_at < before
            })
            .cloned()
            .collect())
    }

    async fn pending_withdrawals(&self) -> StorageResult<Vec<Transaction>> {
        let state = self.state.read().await;
        Ok(state
            .transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::Withdrawal && t.status == TransactionStatus::Pending)
            .cloned()
            .collect())
    }

    async fn analytics(&self, account: &AccountId) -> StorageResult<WalletAnalytics> {
        let state = self.state.read().await;
        let mut out = WalletAnalytics::default();
        for txn in &state.transactions {
            let owns = &txn.account_id == account;
            let paid = txn.payer_id.as_ref() == Some(account);
            if !owns && !paid {
                continue;
            }
            out.transaction_count += 1;
            let success = txn.status == TransactionStatus::Success;
            match txn.kind {
                TransactionKind::Deposit if owns && success => out.total_deposits += txn.amount,
                TransactionKind::Withdrawal if owns && success => {
                    out.total_withdrawals += txn.amount
                }
                TransactionKind::Withdrawal if owns && txn.status == TransactionStatus::Pending => {
                    out.pending_withdrawals += txn.amount
                }
                TransactionKind::PrizeDistribution if owns && success => {
                    out.total_prizes += txn.amount
                }
                TransactionKind::VoterFeePayment if success => {
                    if owns {
                        out.total_election_fees_earned += txn.net_amount;
                    }
                    if paid {
                        out.total_election_fees_paid += txn.gross_amount;
                    }
                }
                TransactionKind::Refund if owns && success && txn.credit.is_some() => {
                    out.total_refunds += txn.amount
                }
                _ => {}
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl EscrowRepository for MemoryStore {
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> StorageResult<()> {
        let mut state = self.state.write().await;
        let live_exists = state.deposits.values().any(|d| {
            d.status.is_live() && d.election_id == deposit.election_id && d.creator_id == deposit.creator_id
        });
        if live_exists || state.deposits.contains_key(&deposit.id) {
            return Err(StorageError::Duplicate(format!(
                "live deposit for election {}",
                deposit.election_id
            )));
        }
        state.deposits.insert(deposit.id, deposit.clone());
        Ok(())
    }

    async fn get_deposit(&self, id: &DepositId) -> StorageResult<Option<EscrowDeposit>> {
        Ok(self.state.read().await.deposits.get(id).cloned())
    }

    async fn find_live_deposit(
        &self,
        election: &ElectionId,
        creator: &AccountId,
    ) -> StorageResult<Option<EscrowDeposit>> {
        let state = self.state.read().await;
        Ok(state
            .deposits
            .values()
            .find(|d| d.status.is_live() && &d.election_id == election && &d.creator_id == creator)
            .cloned())
    }

    async fn stale_pending(&self, before: DateTime<Utc>) -> StorageResult<Vec<EscrowDeposit>> {
        let state = self.state.read().await;
        Ok(state
            .deposits
            .values()
            .filter(|d| d.status == EscrowStatus::Pending && d.created_at < before)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl SettlementRepository for MemoryStore {
    async fn get_settlement(
        &self,
        election: &ElectionId,
    ) -> StorageResult<Option<ElectionSettlement>> {
        Ok(self.state.read().await.settlements.get(election).cloned())
    }

    async fn has_receipt(&self, gateway: Gateway, event_id: &str) -> StorageResult<bool> {
        let state = self.state.read().await;
        Ok(state.receipts.contains(&(gateway, event_id.to_string())))
    }
}

#[async_trait]
impl Repositories for MemoryStore {
    fn accounts(&self) -> &dyn AccountRepository {
        self
    }

    fn transactions(&self) -> &dyn TransactionRepository {
        self
    }

    fn escrows(&self) -> &dyn EscrowRepository {
        self
    }

    fn settlements(&self) -> &dyn SettlementRepository {
        self
    }

    async fn commit_entry(&self, entry: LedgerEntry) -> StorageResult<CommitReceipt> {
        let mut state = self.state.write().await;

        // Guards first: nothing below may run if one is already consumed.
        if let Some(receipt) = &entry.receipt
            && state
                .receipts
                .contains(&(receipt.gateway, receipt.event_id.clone()))
        {
            return Err(StorageError::Duplicate(format!(
                "webhook {} already processed",
                receipt.event_id
            )));
        }
        if let Some(marker) = &entry.settlement
            && state.settlements.contains_key(&marker.election_id)
        {
            return Err(StorageError::Duplicate(format!(
                "election {} already settled",
                marker.election_id
            )));
        }
        if let Some(transition) = &entry.escrow {
            let deposit = state
                .deposits
                .get(&transition.deposit_id)
                .ok_or_else(|| StorageError::NotFound(format!("deposit {}", transition.deposit_id)))?;
            if deposit.status != transition.from {
                return Err(StorageError::StaleState(format!(
                    "deposit {} is {}, expected {}",
                    deposit.id, deposit.status, transition.from
                )));
            }
        }
        for (i, txn) in entry.transactions.iter().enumerate() {
            let clashes_in_entry = entry.transactions[..i].iter().any(|other| {
                other.id == txn.id
                    || (txn.gateway_reference.is_some()
                        && other.kind == txn.kind
                        && other.gateway == txn.gateway
                        && other.gateway_reference == txn.gateway_reference)
            });
            if state.index.contains_key(&txn.id) || state.reference_taken(txn) || clashes_in_entry {
                return Err(StorageError::Duplicate(format!("transaction {}", txn.id)));
            }
        }

        // Stage balances of touched accounts.
        let mut staged: BTreeMap<AccountId, Balance> = entry
            .accounts()
            .into_iter()
            .map(|id| {
                let balance = state.accounts.get(&id).map(|a| a.balance).unwrap_or_default();
                (id, balance)
            })
            .collect();

        let mut apply = |txn: &Transaction| -> StorageResult<()> {
            let balance = staged
                .get_mut(&txn.account_id)
                .ok_or_else(|| StorageError::TransactionError(format!("account {} not staged", txn.account_id)))?;
            *balance = balance
                .apply(txn)
                .map_err(|bucket| StorageError::NegativeBalance {
                    account: txn.account_id.clone(),
                    bucket,
                })?;
            Ok(())
        };

        // Resolutions first: a new row may spend what a resolution brings in.
        for resolution in &entry.resolutions {
            let stored = state.transaction(&resolution.transaction_id).ok_or_else(|| {
                StorageError::NotFound(format!("transaction {}", resolution.transaction_id))
            })?;
            if stored.status != TransactionStatus::Pending || stored.account_id != resolution.account_id {
                return Err(StorageError::StaleState(format!(
                    "transaction {} is {}",
                    stored.id, stored.status
                )));
            }
            if resolution.status == TransactionStatus::Success {
                apply(stored)?;
            }
        }
        for txn in &entry.transactions {
            if txn.status == TransactionStatus::Success {
                apply(txn)?;
            }
        }

        // Everything validated: publish.
        let now = Utc::now();
        for (id, balance) in &staged {
            let account = state
                .accounts
                .entry(id.clone())
                .or_insert_with(|| WalletAccount::open(id.clone()));
            account.balance = *balance;
            account.updated_at = now;
        }
        for txn in entry.transactions {
            let position = state.transactions.len();
            state.index.insert(txn.id, position);
            state.transactions.push(txn);
        }
        for resolution in &entry.resolutions {
            if let Some(&i) = state.index.get(&resolution.transaction_id) {
                let row = &mut state.transactions[i];
                row.status = resolution.status;
                row.resolved_at = Some(resolution.resolved_at);
            }
        }
        if let Some(transition) = entry.escrow
            && let Some(deposit) = state.deposits.get_mut(&transition.deposit_id)
        {
            deposit.status = transition.to;
            match transition.to {
                EscrowStatus::Completed => {
                    deposit.completed_at = Some(transition.at);
                    deposit.gateway_payment_id = transition.gateway_payment_id;
                }
                EscrowStatus::Pending => {}
                _ => deposit.settled_at = Some(transition.at),
            }
        }
        if let Some(marker) = entry.settlement {
            state.settlements.insert(marker.election_id.clone(), marker);
        }
        if let Some(receipt) = entry.receipt {
            state.receipts.insert((receipt.gateway, receipt.event_id));
        }

        Ok(CommitReceipt { balances: staged })
    }
}

/// In-memory election directory.
#[derive(Default)]
pub struct MemoryDirectory {
    elections: RwLock<HashMap<ElectionId, ElectionInfo>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, election: ElectionInfo) {
        self.elections
            .write()
            .await
            .insert(election.id.clone(), election);
    }

    /// Change an election's status. Returns false if it is unknown.
    pub async fn set_status(&self, id: &ElectionId, status: ElectionStatus) -> bool {
        match self.elections.write().await.get_mut(id) {
            Some(election) => {
                election.status = status;
                true
            }
            None => false,
        }
    }
}

#[async_trait]
impl ElectionDirectory for MemoryDirectory {
    async fn get_election(&self, id: &ElectionId) -> UpstreamResult<Option<ElectionInfo>> {
        Ok(self.elections.read().await.get(id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Bucket;
    use crate::ports::EscrowTransition;

    fn credit(account: &str, cents: i64) -> Transaction {
        Transaction::new(AccountId::from(account), TransactionKind::Deposit, Money::from_cents(cents))
            .credit_to(Bucket::Available)
    }

    // Test critique: une entrée qui échoue ne laisse aucune trace
    #[tokio::test]
    async fn test_failed_commit_is_all_or_nothing() {
        let store = MemoryStore::new();
        store
            .commit_entry(LedgerEntry::new().record(credit("alice", 100)))
            .await
            .unwrap();

        let overdraw = Transaction::new(
            AccountId::from("alice"),
            TransactionKind::Withdrawal,
            Money::from_cents(150),
        )
        .debit_from(Bucket::Available);
        let entry = LedgerEntry::new().record(credit("bob", 500)).record(overdraw);

        let err = store.commit_entry(entry).await.unwrap_err();
        assert!(matches!(err, StorageError::NegativeBalance { bucket: Bucket::Available, .. }));

        // Bob n'a pas été crédité, aucune ligne n'a été ajoutée
        assert!(store.get_account(&AccountId::from("bob")).await.unwrap().is_none());
        let history = store
            .list_transactions(
                &AccountId::from("alice"),
                TransactionFilter::default(),
                PageRequest::default(),
                OrderDirection::Desc,
            )
            .await
            .unwrap();
        assert_eq!(history.total, 1);
    }

    #[tokio::test]
    async fn test_pending_row_applies_on_success_resolution_only_once() {
        let store = MemoryStore::new();
        let pending = credit("alice", 250).pending();
        store
            .commit_entry(LedgerEntry::new().record(pending.clone()))
            .await
            .unwrap();
        let account = store.get_account(&AccountId::from("alice")).await.unwrap().unwrap();
        assert_eq!(account.balance.available, Money::ZERO);

        store
            .commit_entry(LedgerEntry::new().resolve(&pending, TransactionStatus::Success))
            .await
            .unwrap();
        let err = store
            .commit_entry(LedgerEntry::new().resolve(&pending, TransactionStatus::Success))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::StaleState(_)));

        let account = store.get_account(&AccountId::from("alice")).await.unwrap().unwrap();
        assert_eq!(account.balance.available, Money::from_cents(250));
    }

    #[tokio::test]
    async fn test_escrow_transition_is_compare_and_set() {
        let store = MemoryStore::new();
        let deposit = EscrowDeposit {
            id: DepositId::generate(),
            election_id: ElectionId::from("el-1"),
            creator_id: AccountId::from("creator"),
            amount: Money::from_dollars_whole(1000),
            gateway: Gateway::Sandbox,
            status: EscrowStatus::Pending,
            checkout_reference: Some("sbx_1".into()),
            gateway_payment_id: None,
            created_at: Utc::now(),
            completed_at: None,
            settled_at: None,
        };
        store.insert_deposit(&deposit).await.unwrap();

        // Un second dépôt vivant pour la même paire est refusé
        let twin = EscrowDeposit { id: DepositId::generate(), ..deposit.clone() };
        assert!(matches!(store.insert_deposit(&twin).await, Err(StorageError::Duplicate(_))));

        let complete = EscrowTransition {
            deposit_id: deposit.id,
            from: EscrowStatus::Pending,
            to: EscrowStatus::Completed,
            gateway_payment_id: Some("sbx_1".into()),
            at: Utc::now(),
        };
        store
            .commit_entry(LedgerEntry::new().transition(complete.clone()))
            .await
            .unwrap();
        let err = store
            .commit_entry(LedgerEntry::new().transition(complete))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::StaleState(_)));

        let stored = store.get_deposit(&deposit.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EscrowStatus::Completed);
        assert!(stored.completed_at.is_some());
    }
}
