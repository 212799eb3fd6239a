//! Payment confirmation adapter.
//!
//! Turns normalized gateway events into ledger entries. Every event is
//! deduplicated twice: on the gateway event id (webhook receipt, committed
//! with the movement) and on the payment id (unique gateway reference per
//! transaction kind). The checkout metadata written at checkout creation
//! decides what a payment was for.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{LedgerError, LedgerResult, StorageError};
use crate::metrics::record_webhook;
use crate::models::{
    AccountId, Bucket, CheckoutPurpose, ElectionId, EscrowDeposit, Gateway, SettlementOutcome,
    Transaction, TransactionId, TransactionKind, TransactionStatus, WebhookReceipt,
};
use crate::ports::{GatewayEvent, GatewayEventKind, LedgerEntry};

use super::escrow::EscrowManager;
use super::fees::FeeSchedule;
use super::ledger::Ledger;

/// Outcome of reconciling one event.
#[derive(Debug, Clone)]
pub enum ReconciliationResult {
    /// Payment recorded as a successful transaction.
    Recorded(Transaction),
    /// Prize-pool deposit moved to completed.
    DepositConfirmed(EscrowDeposit),
    /// Second payment for an already paid participation, kept for manual refund.
    DuplicatePayment(Transaction),
    /// Pending transactions marked failed (or deposit expired).
    Failed { resolved: usize },
    /// Event carries nothing the wallet acts on.
    Ignored(String),
}

impl ReconciliationResult {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Recorded(_) | Self::DepositConfirmed(_) => "processed",
            Self::DuplicatePayment(_) => "duplicate_payment",
            Self::Failed { .. } => "failed_payment",
            Self::Ignored(_) => "ignored",
        }
    }
}

/// Reconciles gateway events into the ledger.
pub struct Reconciler {
    ledger: Arc<Ledger>,
    escrow: Arc<EscrowManager>,
    fees: FeeSchedule,
}

impl Reconciler {
    pub fn new(ledger: Arc<Ledger>, escrow: Arc<EscrowManager>, fees: FeeSchedule) -> Self {
        Self {
            ledger,
            escrow,
            fees,
        }
    }

    /// Apply one event. Replays fail with a benign error
    /// ([`LedgerError::DuplicateWebhook`] or [`LedgerError::AlreadyConfirmed`]).
    #[instrument(skip_all, fields(gateway = %event.gateway, payment = %event.payment_id))]
    pub async fn reconcile(&self, event: GatewayEvent) -> LedgerResult<ReconciliationResult> {
        let gateway = event.gateway.as_str();
        let result = self.reconcile_inner(event).await;
        let outcome = match &result {
            Ok(r) => r.label(),
            Err(LedgerError::DuplicateWebhook(_)) | Err(LedgerError::AlreadyConfirmed(_)) => {
                "duplicate"
            }
            Err(_) => "error",
        };
        record_webhook(gateway, outcome);
        result
    }

    async fn reconcile_inner(&self, event: GatewayEvent) -> LedgerResult<ReconciliationResult> {
        let receipt = event.event_id.as_ref().map(|id| WebhookReceipt {
            gateway: event.gateway,
            event_id: id.clone(),
            received_at: Utc::now(),
        });
        if let Some(r) = &receipt
            && self
                .ledger
                .repositories()
                .settlements()
                .has_receipt(r.gateway, &r.event_id)
                .await?
        {
            debug!(event = %r.event_id, "Webhook already processed");
            return Err(LedgerError::DuplicateWebhook(r.event_id.clone()));
        }

        if let GatewayEventKind::Ignored(kind) = &event.kind {
            return Ok(ReconciliationResult::Ignored(kind.clone()));
        }

        let purpose = match event.purpose() {
            Some(p) => Some(p),
            None => self.purpose_from_ledger(&event).await?,
        };
        let Some(purpose) = purpose else {
            warn!("⚠️  Payment without wallet metadata ignored");
            return Ok(ReconciliationResult::Ignored("no wallet metadata".to_string()));
        };

        match (&event.kind, purpose) {
            (GatewayEventKind::PaymentFailed, CheckoutPurpose::PrizePool { deposit_id, .. }) => {
                match self.escrow.expire(&deposit_id).await {
                    Ok(_) => Ok(ReconciliationResult::Failed { resolved: 1 }),
                    Err(LedgerError::InvalidState(_)) => Ok(ReconciliationResult::Failed { resolved: 0 }),
                    Err(e) => Err(e),
                }
            }
            (GatewayEventKind::PaymentFailed, _) => self.fail_pending(&event, receipt).await,
            (_, CheckoutPurpose::ElectionFee { transaction_id, election_id, voter_id, creator_id, .. }) => {
                self.record_election_fee(&event, receipt, transaction_id, election_id, voter_id, creator_id)
                    .await
            }
            (_, CheckoutPurpose::PrizePool { deposit_id, .. }) => {
                let deposit = self
                    .escrow
                    .confirm_deposit(&deposit_id, &event.payment_id, Some(event.amount), receipt)
                    .await?;
                Ok(ReconciliationResult::DepositConfirmed(deposit))
            }
            (_, CheckoutPurpose::WalletDeposit { transaction_id, account_id }) => {
                self.record_top_up(&event, receipt, transaction_id, account_id).await
            }
        }
    }

    /// Recover the purpose from our own pending row when metadata is missing.
    async fn purpose_from_ledger(&self, event: &GatewayEvent) -> LedgerResult<Option<CheckoutPurpose>> {
        let rows = self.rows_for(event.gateway, &event.payment_id).await?;
        Ok(rows.into_iter().find_map(|t| match t.kind {
            TransactionKind::VoterFeePayment => Some(CheckoutPurpose::ElectionFee {
                transaction_id: t.id,
                election_id: t.election_id?,
                voter_id: t.payer_id?,
                creator_id: t.account_id,
                region: String::new(),
            }),
            TransactionKind::Deposit => Some(CheckoutPurpose::WalletDeposit {
                transaction_id: t.id,
                account_id: t.account_id,
            }),
            _ => None,
        }))
    }

    async fn rows_for(&self, gateway: Gateway, reference: &str) -> LedgerResult<Vec<Transaction>> {
        Ok(self
            .ledger
            .repositories()
            .transactions()
            .find_by_reference(gateway, reference)
            .await?)
    }

    async fn fail_pending(
        &self,
        event: &GatewayEvent,
        receipt: Option<WebhookReceipt>,
    ) -> LedgerResult<ReconciliationResult> {
        let pending: Vec<Transaction> = self
            .rows_for(event.gateway, &event.payment_id)
            .await?
            .into_iter()
            .filter(|t| t.status == TransactionStatus::Pending)
            .collect();
        if pending.is_empty() {
            return Ok(ReconciliationResult::Failed { resolved: 0 });
        }
        let accounts: Vec<AccountId> = pending.iter().map(|t| t.account_id.clone()).collect();
        let _guard = self.ledger.lock(&accounts).await?;
        let mut entry = LedgerEntry::new().with_receipt(receipt);
        for txn in &pending {
            entry = entry.resolve(txn, TransactionStatus::Failed);
        }
        self.commit_idempotent(entry).await?;
        info!(resolved = pending.len(), "❌ Payment failed, pending transactions closed");
        Ok(ReconciliationResult::Failed {
            resolved: pending.len(),
        })
    }

    async fn record_election_fee(
        &self,
        event: &GatewayEvent,
        receipt: Option<WebhookReceipt>,
        transaction_id: TransactionId,
        election_id: ElectionId,
        voter_id: AccountId,
        creator_id: AccountId,
    ) -> LedgerResult<ReconciliationResult> {
        let _guard = self.ledger.lock(std::slice::from_ref(&creator_id)).await?;
        let repos = self.ledger.repositories();

        let rows: Vec<Transaction> = self
            .rows_for(event.gateway, &event.payment_id)
            .await?
            .into_iter()
            .filter(|t| t.kind == TransactionKind::VoterFeePayment)
            .collect();
        if let Some(done) = rows.iter().find(|t| t.status.is_terminal()) {
            return Err(LedgerError::AlreadyConfirmed(format!(
                "payment {} already recorded as {}",
                event.payment_id, done.status
            )));
        }
        let pending = rows.into_iter().find(|t| t.status == TransactionStatus::Pending);

        let fees = self.fees.settle(event.amount, event.gateway)?;
        if let Some(p) = &pending
            && p.gross_amount != event.amount
        {
            error!(
                txn = %p.id,
                expected = %p.gross_amount,
                paid = %event.amount,
                "❌ Participation payment amount mismatch, left pending for review"
            );
            return Err(LedgerError::InvalidState(format!(
                "payment {} amount {} does not match {}",
                event.payment_id, event.amount, p.gross_amount
            )));
        }

        let already_paid = repos
            .transactions()
            .find_successful_fee(&voter_id, &election_id)
            .await?;
        let settlement = repos.settlements().get_settlement(&election_id).await?;

        let final_status = match (&already_paid, settlement.as_ref().map(|s| s.outcome)) {
            (Some(_), _) | (None, Some(SettlementOutcome::Refunded)) => TransactionStatus::Refunded,
            _ => TransactionStatus::Success,
        };

        let (row, mut entry) = match pending {
            Some(p) => {
                let entry = LedgerEntry::new().resolve(&p, final_status);
                (p, entry)
            }
            None => {
                let row = Transaction::new(
                    creator_id.clone(),
                    TransactionKind::VoterFeePayment,
                    fees.net_amount,
                )
                .with_id(transaction_id)
                .credit_to(Bucket::Blocked)
                .with_fees(fees)
                .paid_by(voter_id.clone())
                .for_election(election_id.clone())
                .via(event.gateway, event.payment_id.clone())
                .described("Election participation fee")
                .with_status(final_status);
                (row.clone(), LedgerEntry::new().record(row))
            }
        };

        // Late payment for an election whose fees were already released.
        if final_status == TransactionStatus::Success
            && settlement.as_ref().map(|s| s.outcome) == Some(SettlementOutcome::Released)
        {
            entry = entry.record(
                Transaction::new(creator_id.clone(), TransactionKind::FeeRelease, row.amount)
                    .debit_from(Bucket::Blocked)
                    .credit_to(Bucket::Available)
                    .with_fees(row.fees())
                    .for_election(election_id.clone())
                    .via(event.gateway, event.payment_id.clone())
                    .described("Late voter fee released"),
            );
        }

        self.commit_idempotent(entry.with_receipt(receipt)).await?;
        let row = Transaction {
            status: final_status,
            resolved_at: Some(Utc::now()),
            ..row
        };

        if final_status == TransactionStatus::Refunded {
            warn!(
                voter = %voter_id,
                election = %election_id,
                payment = %event.payment_id,
                "⚠️  Participation payment not applied, gateway refund required"
            );
            return Ok(ReconciliationResult::DuplicatePayment(row));
        }
        info!(net = %row.amount, "🗳️  Participation fee blocked for creator");
        Ok(ReconciliationResult::Recorded(row))
    }

    async fn record_top_up(
        &self,
        event: &GatewayEvent,
        receipt: Option<WebhookReceipt>,
        transaction_id: TransactionId,
        account_id: AccountId,
    ) -> LedgerResult<ReconciliationResult> {
        let _guard = self.ledger.lock(std::slice::from_ref(&account_id)).await?;

        let rows: Vec<Transaction> = self
            .rows_for(event.gateway, &event.payment_id)
            .await?
            .into_iter()
            .filter(|t| t.kind == TransactionKind::Deposit)
            .collect();
        if rows.iter().any(|t| t.status.is_terminal()) {
            return Err(LedgerError::AlreadyConfirmed(format!(
                "top-up {} already recorded",
                event.payment_id
            )));
        }

        let (row, entry) = match rows.into_iter().next() {
            Some(p) => {
                if p.amount != event.amount {
                    error!(txn = %p.id, expected = %p.amount, paid = %event.amount, "❌ Top-up amount mismatch");
                    return Err(LedgerError::InvalidState(format!(
                        "top-up {} amount {} does not match {}",
                        event.payment_id, event.amount, p.amount
                    )));
                }
                let entry = LedgerEntry::new().resolve(&p, TransactionStatus::Success);
                (p, entry)
            }
            None => {
                let row = Transaction::new(account_id, TransactionKind::Deposit, event.amount)
                    .with_id(transaction_id)
                    .credit_to(Bucket::Available)
                    .via(event.gateway, event.payment_id.clone())
                    .described("Wallet top-up");
                (row.clone(), LedgerEntry::new().record(row))
            }
        };

        self.commit_idempotent(entry.with_receipt(receipt)).await?;
        info!(amount = %row.amount, "💳 Wallet topped up");
        Ok(ReconciliationResult::Recorded(Transaction {
            status: TransactionStatus::Success,
            resolved_at: Some(Utc::now()),
            ..row
        }))
    }

    /// Commit, turning consumed guards into benign replays.
    async fn commit_idempotent(&self, entry: LedgerEntry) -> LedgerResult<()> {
        match self.ledger.commit_locked(entry).await {
            Ok(_) => Ok(()),
            Err(LedgerError::Storage(StorageError::Duplicate(msg)))
            | Err(LedgerError::Storage(StorageError::StaleState(msg))) => {
                Err(LedgerError::AlreadyConfirmed(msg))
            }
            Err(e) => Err(e),
        }
    }
}
