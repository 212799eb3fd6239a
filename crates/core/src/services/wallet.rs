//! Wallet service: the operations behind the `/wallet` endpoints.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::{LedgerError, LedgerResult};
use crate::models::{
    AccountId, Balance, Bucket, CheckoutPurpose, DepositId, ElectionId, EscrowDeposit, FeeBreakdown,
    Gateway, LockedFunds, Money, Transaction, TransactionId, TransactionKind, TransactionStatus,
    WalletAnalytics,
};
use crate::ports::{
    CheckoutRequest, CheckoutSession, ElectionDirectory, ElectionStatus, GatewayEvent,
    GatewayRegistry, LedgerEntry, OrderDirection, Page, PageRequest, PaymentStatus,
    TransactionFilter,
};

use super::escrow::{DepositCheckout, EscrowManager};
use super::fees::FeeSchedule;
use super::ledger::Ledger;
use super::reconcile::Reconciler;

/// Withdrawal limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalPolicy {
    pub minimum: Money,
    /// Withdrawals above this amount wait for an admin.
    pub approval_threshold: Money,
}

impl Default for WithdrawalPolicy {
    fn default() -> Self {
        Self {
            minimum: Money::from_dollars_whole(10),
            approval_threshold: Money::from_dollars_whole(1000),
        }
    }
}

/// Payout request from a wallet owner.
#[derive(Debug, Clone)]
pub struct WithdrawalRequest {
    pub amount: Money,
    pub method: String,
    pub details: serde_json::Value,
}

/// Result of a withdrawal request.
#[derive(Debug, Clone)]
pub enum WithdrawalOutcome {
    /// Debited immediately.
    Completed(Transaction),
    /// Recorded as pending, balance untouched until approval.
    AwaitingApproval(Transaction),
}

/// Result of a participation payment request.
#[derive(Debug, Clone)]
pub enum ElectionPayment {
    AlreadyPaid(Transaction),
    Checkout {
        transaction: Transaction,
        session: CheckoutSession,
        fees: FeeBreakdown,
    },
}

/// Top-up checkout.
#[derive(Debug, Clone)]
pub struct TopUp {
    pub transaction: Transaction,
    pub session: CheckoutSession,
}

/// Wallet operations for end users and admins.
pub struct WalletService {
    ledger: Arc<Ledger>,
    gateways: Arc<GatewayRegistry>,
    directory: Arc<dyn ElectionDirectory>,
    escrow: Arc<EscrowManager>,
    reconciler: Arc<Reconciler>,
    fees: FeeSchedule,
    policy: WithdrawalPolicy,
}

impl WalletService {
    pub fn new(
        ledger: Arc<Ledger>,
        gateways: Arc<GatewayRegistry>,
        directory: Arc<dyn ElectionDirectory>,
        escrow: Arc<EscrowManager>,
        reconciler: Arc<Reconciler>,
        fees: FeeSchedule,
        policy: WithdrawalPolicy,
    ) -> Self {
        Self {
            ledger,
            gateways,
            directory,
            escrow,
            reconciler,
            fees,
            policy,
        }
    }

    pub fn policy(&self) -> WithdrawalPolicy {
        self.policy
    }

    // =========================================================================
    // Queries
    // =========================================================================

    pub async fn balance(&self, account: &AccountId) -> LedgerResult<Balance> {
        self.ledger.balance(account).await
    }

    pub async fn transactions(
        &self,
        account: &AccountId,
        filter: TransactionFilter,
        page: PageRequest,
    ) -> LedgerResult<Page<Transaction>> {
        Ok(self
            .ledger
            .repositories()
            .transactions()
            .list_transactions(account, filter, page, OrderDirection::Desc)
            .await?)
    }

    pub async fn analytics(&self, account: &AccountId) -> LedgerResult<WalletAnalytics> {
        Ok(self.ledger.repositories().transactions().analytics(account).await?)
    }

    /// Per-election voter fees still blocked for a creator.
    pub async fn blocked_accounts(&self, creator: &AccountId) -> LedgerResult<Vec<LockedFunds>> {
        Ok(self
            .ledger
            .repositories()
            .transactions()
            .locked_funds(creator)
            .await?)
    }

    // =========================================================================
    // Withdrawals
    // =========================================================================

    /// Request a payout from the available balance.
    #[instrument(skip(self, request), fields(amount = %request.amount))]
    pub async fn withdraw(
        &self,
        account: &AccountId,
        request: WithdrawalRequest,
    ) -> LedgerResult<WithdrawalOutcome> {
        if request.amount < self.policy.minimum {
            return Err(LedgerError::InvalidAmount(format!(
                "minimum withdrawal is {}",
                self.policy.minimum
            )));
        }
        if request.method.trim().is_empty() {
            return Err(LedgerError::Validation("payment method is required".to_string()));
        }

        let _guard = self.ledger.lock(std::slice::from_ref(account)).await?;
        let balance = self.ledger.balance(account).await?;
        if balance.available < request.amount {
            return Err(LedgerError::InsufficientFunds {
                account: account.clone(),
                bucket: Bucket::Available,
            });
        }

        let needs_approval = request.amount > self.policy.approval_threshold;
        let mut row = Transaction::new(account.clone(), TransactionKind::Withdrawal, request.amount)
            .debit_from(Bucket::Available)
            .with_details(json!({
                "payment_method": request.method,
                "payment_details": request.details,
            }));
        row = if needs_approval {
            row.pending().described("Withdrawal awaiting approval")
        } else {
            row.described(format!("Withdrawal via {}", request.method))
        };

        self.ledger
            .commit_locked(LedgerEntry::new().record(row.clone()))
            .await?;

        if needs_approval {
            info!(txn = %row.id, "🧾 Withdrawal flagged for admin approval");
            Ok(WithdrawalOutcome::AwaitingApproval(row))
        } else {
            info!(txn = %row.id, "💸 Withdrawal completed");
            Ok(WithdrawalOutcome::Completed(row))
        }
    }

    /// Withdrawals awaiting review.
    pub async fn pending_withdrawals(&self) -> LedgerResult<Vec<Transaction>> {
        Ok(self
            .ledger
            .repositories()
            .transactions()
            .pending_withdrawals()
            .await?)
    }

    /// Approve a pending withdrawal; the balance is debited now.
    #[instrument(skip(self), fields(txn = %id, admin = %admin))]
    pub async fn approve_withdrawal(
        &self,
        id: &TransactionId,
        admin: &AccountId,
    ) -> LedgerResult<Transaction> {
        self.review_withdrawal(id, TransactionStatus::Success).await
    }

    /// Reject a pending withdrawal; nothing was debited.
    #[instrument(skip(self), fields(txn = %id, admin = %admin))]
    pub async fn reject_withdrawal(
        &self,
        id: &TransactionId,
        admin: &AccountId,
    ) -> LedgerResult<Transaction> {
        self.review_withdrawal(id, TransactionStatus::Cancelled).await
    }

    async fn review_withdrawal(
        &self,
        id: &TransactionId,
        decision: TransactionStatus,
    ) -> LedgerResult<Transaction> {
        let row = self.transaction(id).await?;
        if row.kind != TransactionKind::Withdrawal {
            return Err(LedgerError::NotFound(format!("withdrawal {id}")));
        }
        let _guard = self
            .ledger
            .lock(std::slice::from_ref(&row.account_id))
            .await?;
        let row = self.transaction(id).await?;
        match row.status {
            TransactionStatus::Pending => {}
            status if status == decision => {
                return Err(LedgerError::AlreadyConfirmed(format!(
                    "withdrawal {id} already {status}"
                )));
            }
            status => {
                return Err(LedgerError::InvalidState(format!(
                    "withdrawal {id} is already {status}"
                )));
            }
        }

        self.ledger
            .commit_locked(LedgerEntry::new().resolve(&row, decision))
            .await?;
        info!(decision = %decision, "🧾 Withdrawal reviewed");
        self.transaction(id).await
    }

    async fn transaction(&self, id: &TransactionId) -> LedgerResult<Transaction> {
        self.ledger
            .repositories()
            .transactions()
            .get_transaction(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("transaction {id}")))
    }

    // =========================================================================
    // Participation payments
    // =========================================================================

    /// Open a checkout for an election's participation fee.
    #[instrument(skip(self), fields(voter = %voter, election = %election_id))]
    pub async fn pay_election(
        &self,
        voter: &AccountId,
        election_id: &ElectionId,
        region: &str,
        gateway: Option<Gateway>,
    ) -> LedgerResult<ElectionPayment> {
        let election = self
            .directory
            .get_election(election_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("election {election_id}")))?;
        if !matches!(election.status, ElectionStatus::Scheduled | ElectionStatus::Active) {
            return Err(LedgerError::InvalidState(format!(
                "election {election_id} is not accepting participants"
            )));
        }

        if let Some(paid) = self
            .ledger
            .repositories()
            .transactions()
            .find_successful_fee(voter, election_id)
            .await?
        {
            return Ok(ElectionPayment::AlreadyPaid(paid));
        }

        let fee = election
            .pricing
            .fee_for(region)
            .filter(|f| f.is_positive())
            .ok_or_else(|| {
                LedgerError::Validation(format!(
                    "election {election_id} has no participation fee for region '{region}'"
                ))
            })?;

        let adapter = self.gateways.choose(gateway)?;
        let fees = self.fees.settle(fee, adapter.kind())?;
        let transaction_id = TransactionId::generate();
        let session = adapter
            .create_checkout(CheckoutRequest {
                amount: fee,
                description: format!("Participation in \"{}\"", election.title),
                customer: voter.clone(),
                purpose: CheckoutPurpose::ElectionFee {
                    transaction_id,
                    election_id: election_id.clone(),
                    voter_id: voter.clone(),
                    creator_id: election.creator_id.clone(),
                    region: region.to_string(),
                },
            })
            .await?;

        let row = Transaction::new(
            election.creator_id.clone(),
            TransactionKind::VoterFeePayment,
            fees.net_amount,
        )
        .with_id(transaction_id)
        .credit_to(Bucket::Blocked)
        .with_fees(fees)
        .paid_by(voter.clone())
        .for_election(election_id.clone())
        .via(session.gateway, session.reference.clone())
        .described("Election participation fee")
        .with_details(json!({ "region": region }))
        .pending();
        self.ledger.commit(LedgerEntry::new().record(row.clone())).await?;

        Ok(ElectionPayment::Checkout {
            transaction: row,
            session,
            fees,
        })
    }

    /// Client-side confirmation of a participation payment.
    pub async fn confirm_election_payment(
        &self,
        voter: &AccountId,
        gateway: Gateway,
        payment_id: &str,
    ) -> LedgerResult<Transaction> {
        let row = self
            .owned_row(gateway, payment_id, TransactionKind::VoterFeePayment, |t| {
                t.payer_id.as_ref() == Some(voter)
            })
            .await?;
        self.confirm_payment(gateway, payment_id).await?;
        self.transaction(&row.id).await
    }

    // =========================================================================
    // Top-ups
    // =========================================================================

    /// Open a checkout crediting the available balance.
    #[instrument(skip(self), fields(account = %account, amount = %amount))]
    pub async fn deposit(
        &self,
        account: &AccountId,
        amount: Money,
        gateway: Option<Gateway>,
    ) -> LedgerResult<TopUp> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "deposit must be positive, got {amount}"
            )));
        }
        let adapter = self.gateways.choose(gateway)?;
        let transaction_id = TransactionId::generate();
        let session = adapter
            .create_checkout(CheckoutRequest {
                amount,
                description: "Wallet top-up".to_string(),
                customer: account.clone(),
                purpose: CheckoutPurpose::WalletDeposit {
                    transaction_id,
                    account_id: account.clone(),
                },
            })
            .await?;

        let row = Transaction::new(account.clone(), TransactionKind::Deposit, amount)
            .with_id(transaction_id)
            .credit_to(Bucket::Available)
            .via(session.gateway, session.reference.clone())
            .described("Wallet top-up")
            .pending();
        self.ledger.commit(LedgerEntry::new().record(row.clone())).await?;
        Ok(TopUp {
            transaction: row,
            session,
        })
    }

    /// Client-side confirmation of a top-up.
    pub async fn confirm_deposit(
        &self,
        account: &AccountId,
        gateway: Gateway,
        payment_id: &str,
    ) -> LedgerResult<Transaction> {
        let row = self
            .owned_row(gateway, payment_id, TransactionKind::Deposit, |t| {
                &t.account_id == account
            })
            .await?;
        self.confirm_payment(gateway, payment_id).await?;
        self.transaction(&row.id).await
    }

    // =========================================================================
    // Prize pools
    // =========================================================================

    /// Open a prize-pool deposit for an election the caller created.
    pub async fn fund_prize_pool(
        &self,
        creator: &AccountId,
        election_id: &ElectionId,
        amount: Money,
        gateway: Option<Gateway>,
    ) -> LedgerResult<DepositCheckout> {
        self.escrow
            .initiate_deposit(election_id, creator, amount, gateway)
            .await
    }

    /// Client-side confirmation of a prize-pool deposit.
    pub async fn confirm_prize_pool(
        &self,
        creator: &AccountId,
        deposit_id: &DepositId,
    ) -> LedgerResult<EscrowDeposit> {
        let deposit = self
            .ledger
            .repositories()
            .escrows()
            .get_deposit(deposit_id)
            .await?
            .filter(|d| &d.creator_id == creator)
            .ok_or_else(|| LedgerError::NotFound(format!("deposit {deposit_id}")))?;
        let reference = deposit.checkout_reference.clone().ok_or_else(|| {
            LedgerError::InvalidState(format!("deposit {deposit_id} has no checkout"))
        })?;
        self.confirm_payment(deposit.gateway, &reference).await?;
        self.ledger
            .repositories()
            .escrows()
            .get_deposit(deposit_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("deposit {deposit_id}")))
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn owned_row(
        &self,
        gateway: Gateway,
        payment_id: &str,
        kind: TransactionKind,
        owned: impl Fn(&Transaction) -> bool,
    ) -> LedgerResult<Transaction> {
        self.ledger
            .repositories()
            .transactions()
            .find_by_reference(gateway, payment_id)
            .await?
            .into_iter()
            .find(|t| t.kind == kind && owned(t))
            .ok_or_else(|| LedgerError::NotFound(format!("payment {payment_id}")))
    }

    /// Poll the gateway and reconcile what it reports. Replays are success.
    async fn confirm_payment(&self, gateway: Gateway, reference: &str) -> LedgerResult<()> {
        let lookup = self.gateways.get(gateway)?.payment_status(reference).await?;
        if lookup.status == PaymentStatus::Pending {
            return Ok(());
        }
        match self
            .reconciler
            .reconcile(GatewayEvent::from_lookup(gateway, lookup))
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_benign() => Ok(()),
            Err(e) => {
                warn!(reference, error = %e, "⚠️  Payment confirmation failed");
                Err(e)
            }
        }
    }
}
