//! Escrow manager for creator-funded prize pools.
//!
//! A deposit moves `pending → completed → {distributed, returned}`, or
//! `pending → expired` when its checkout is abandoned. Every transition is a
//! compare-and-set inside the same ledger entry as the money it moves.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{error, info, instrument, warn};

use crate::error::{LedgerError, LedgerResult, StorageError};
use crate::metrics::record_escrow_transition;
use crate::models::{
    AccountId, Bucket, CheckoutPurpose, DepositId, ElectionId, EscrowDeposit, EscrowStatus,
    Gateway, Money, Transaction, TransactionKind, WebhookReceipt,
};
use crate::ports::{
    CheckoutRequest, CheckoutSession, ElectionDirectory, ElectionInfo, ElectionStatus,
    EscrowTransition, GatewayRegistry, LedgerEntry, PaymentStatus, RewardType,
};

use super::ledger::Ledger;

/// Deposit plus the checkout the creator must complete.
#[derive(Debug, Clone)]
pub struct DepositCheckout {
    pub deposit: EscrowDeposit,
    /// `None` when the existing deposit is already paid and only waits for
    /// its confirmation.
    pub session: Option<CheckoutSession>,
}

enum Reopened {
    /// Still payable: hand the checkout back to the creator.
    Open(CheckoutSession),
    /// Paid, waiting for the confirmation.
    Paid,
    /// Can no longer be paid.
    Closed,
}

/// Result of a distribution request.
#[derive(Debug, Clone, PartialEq)]
pub enum DistributionOutcome {
    /// Pool split among winners; `returned` went back to the creator.
    Distributed {
        share: Money,
        winners: Vec<AccountId>,
        returned: Money,
    },
    /// Nobody to pay, or the reward is not monetary: the whole pool went
    /// back to the creator.
    Returned { amount: Money },
}

/// Publish gating state of an election.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessState {
    Ready,
    DepositPending,
    DepositRequired,
}

/// Publish readiness report.
#[derive(Debug, Clone, Serialize)]
pub struct PublishReadiness {
    pub election_id: ElectionId,
    pub state: ReadinessState,
    pub required_amount: Money,
    pub deposit: Option<EscrowDeposit>,
}

/// Prize-pool escrow lifecycle.
pub struct EscrowManager {
    ledger: Arc<Ledger>,
    gateways: Arc<GatewayRegistry>,
    directory: Arc<dyn ElectionDirectory>,
}

impl EscrowManager {
    pub fn new(
        ledger: Arc<Ledger>,
        gateways: Arc<GatewayRegistry>,
        directory: Arc<dyn ElectionDirectory>,
    ) -> Self {
        Self {
            ledger,
            gateways,
            directory,
        }
    }

    async fn election(&self, id: &ElectionId) -> LedgerResult<ElectionInfo> {
        self.directory
            .get_election(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("election {id}")))
    }

    async fn deposit(&self, id: &DepositId) -> LedgerResult<EscrowDeposit> {
        self.ledger
            .repositories()
            .escrows()
            .get_deposit(id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("deposit {id}")))
    }

    /// Start a prize-pool deposit and open its checkout.
    ///
    /// A live pending deposit for the pair is returned with its checkout
    /// reopened. If that checkout can no longer be paid the deposit expires
    /// and a new one is started. A completed deposit yields
    /// [`LedgerError::AlreadyConfirmed`].
    #[instrument(skip(self), fields(election = %election_id, creator = %creator_id))]
    pub async fn initiate_deposit(
        &self,
        election_id: &ElectionId,
        creator_id: &AccountId,
        amount: Money,
        gateway: Option<Gateway>,
    ) -> LedgerResult<DepositCheckout> {
        if !amount.is_positive() {
            return Err(LedgerError::InvalidAmount(format!(
                "prize pool must be positive, got {amount}"
            )));
        }

        let election = self.election(election_id).await?;
        if &election.creator_id != creator_id {
            return Err(LedgerError::Validation(format!(
                "only the creator of election {election_id} can fund its prize pool"
            )));
        }
        if election.status.has_ended() {
            return Err(LedgerError::InvalidState(format!(
                "election {election_id} has already ended"
            )));
        }
        let Some(prize) = election.prize.as_ref().filter(|p| p.requires_deposit()) else {
            return Err(LedgerError::Validation(format!(
                "election {election_id} has no monetary prize pool to fund"
            )));
        };
        if prize.amount != amount {
            return Err(LedgerError::Validation(format!(
                "prize pool of election {election_id} is {}, got {amount}",
                prize.amount
            )));
        }

        if let Some(existing) = self.live_deposit(election_id, creator_id).await? {
            match self.reopen(&existing).await? {
                Reopened::Open(session) => {
                    return Ok(DepositCheckout {
                        deposit: existing,
                        session: Some(session),
                    });
                }
                Reopened::Paid => {
                    return Ok(DepositCheckout {
                        deposit: existing,
                        session: None,
                    });
                }
                Reopened::Closed => {
                    self.expire(&existing.id).await?;
                }
            }
        }

        let adapter = self.gateways.choose(gateway)?;
        let deposit_id = DepositId::generate();
        let session = adapter
            .create_checkout(CheckoutRequest {
                amount,
                description: format!("Prize pool for \"{}\"", election.title),
                customer: creator_id.clone(),
                purpose: CheckoutPurpose::PrizePool {
                    deposit_id,
                    election_id: election_id.clone(),
                    creator_id: creator_id.clone(),
                },
            })
            .await?;

        let deposit = EscrowDeposit {
            id: deposit_id,
            election_id: election_id.clone(),
            creator_id: creator_id.clone(),
            amount,
            gateway: adapter.kind(),
            status: EscrowStatus::Pending,
            checkout_reference: Some(session.reference.clone()),
            gateway_payment_id: None,
            created_at: Utc::now(),
            completed_at: None,
            settled_at: None,
        };

        match self.ledger.repositories().escrows().insert_deposit(&deposit).await {
            Ok(()) => {}
            Err(StorageError::Duplicate(_)) => {
                // Lost a race with a concurrent initiation.
                return match self.live_deposit(election_id, creator_id).await? {
                    Some(existing) => Ok(DepositCheckout {
                        deposit: existing,
                        session: None,
                    }),
                    None => Err(LedgerError::Retryable(
                        "concurrent deposit initiation".to_string(),
                    )),
                };
            }
            Err(e) => return Err(e.into()),
        }

        record_escrow_transition(EscrowStatus::Pending.as_str());
        info!(deposit = %deposit.id, amount = %amount, "💰 Prize pool deposit initiated");
        Ok(DepositCheckout {
            deposit,
            session: Some(session),
        })
    }

    /// Where the checkout of a live pending deposit stands at its processor.
    async fn reopen(&self, deposit: &EscrowDeposit) -> LedgerResult<Reopened> {
        let Some(reference) = deposit.checkout_reference.as_deref() else {
            return Ok(Reopened::Closed);
        };
        let adapter = self.gateways.get(deposit.gateway)?;
        match adapter.payment_status(reference).await?.status {
            PaymentStatus::Pending => Ok(Reopened::Open(adapter.resume_checkout(reference).await?)),
            PaymentStatus::Succeeded => Ok(Reopened::Paid),
            PaymentStatus::Expired => Ok(Reopened::Closed),
            PaymentStatus::Failed => {
                if let Err(e) = adapter.cancel_payment(reference).await {
                    warn!(deposit = %deposit.id, error = %e, "⚠️  Could not cancel failed checkout");
                }
                Ok(Reopened::Closed)
            }
        }
    }

    /// Live deposit of a pair, `AlreadyConfirmed` if it is completed.
    async fn live_deposit(
        &self,
        election_id: &ElectionId,
        creator_id: &AccountId,
    ) -> LedgerResult<Option<EscrowDeposit>> {
        match self
            .ledger
            .repositories()
            .escrows()
            .find_live_deposit(election_id, creator_id)
            .await?
        {
            Some(d) if d.status == EscrowStatus::Completed => Err(LedgerError::AlreadyConfirmed(
                format!("prize pool of election {election_id} is already funded"),
            )),
            other => Ok(other),
        }
    }

    /// Confirm a deposit paid through its gateway.
    ///
    /// Idempotent: a second confirmation with the same payment id fails with
    /// [`LedgerError::AlreadyConfirmed`] and moves nothing.
    #[instrument(skip(self, receipt), fields(deposit = %deposit_id))]
    pub async fn confirm_deposit(
        &self,
        deposit_id: &DepositId,
        gateway_payment_id: &str,
        amount_paid: Option<Money>,
        receipt: Option<WebhookReceipt>,
    ) -> LedgerResult<EscrowDeposit> {
        let deposit = self.deposit(deposit_id).await?;
        let _guard = self
            .ledger
            .lock(std::slice::from_ref(&deposit.creator_id))
            .await?;
        // Re-read under the lock.
        let deposit = self.deposit(deposit_id).await?;

        match deposit.status {
            EscrowStatus::Pending => {}
            EscrowStatus::Completed | EscrowStatus::Distributed | EscrowStatus::Returned => {
                return Err(already_confirmed_or_conflict(&deposit, gateway_payment_id));
            }
            EscrowStatus::Expired => {
                error!(
                    deposit = %deposit.id,
                    payment = gateway_payment_id,
                    "❌ Payment received for an expired deposit, manual refund required"
                );
                return Err(LedgerError::InvalidState(format!(
                    "deposit {} has expired",
                    deposit.id
                )));
            }
        }
        if let Some(paid) = amount_paid
            && paid != deposit.amount
        {
            error!(deposit = %deposit.id, expected = %deposit.amount, paid = %paid, "❌ Deposit amount mismatch");
            return Err(LedgerError::InvalidState(format!(
                "deposit {} expects {}, gateway reported {paid}",
                deposit.id, deposit.amount
            )));
        }

        let now = Utc::now();
        let row = Transaction::new(
            deposit.creator_id.clone(),
            TransactionKind::EscrowDeposit,
            deposit.amount,
        )
        .credit_to(Bucket::Escrowed)
        .for_election(deposit.election_id.clone())
        .for_deposit(deposit.id)
        .via(deposit.gateway, gateway_payment_id)
        .described("Prize pool deposit");
        let entry = LedgerEntry::new()
            .record(row)
            .transition(EscrowTransition {
                deposit_id: deposit.id,
                from: EscrowStatus::Pending,
                to: EscrowStatus::Completed,
                gateway_payment_id: Some(gateway_payment_id.to_string()),
                at: now,
            })
            .with_receipt(receipt);

        match self.ledger.commit_locked(entry).await {
            Ok(_) => {}
            Err(LedgerError::Storage(StorageError::Duplicate(msg))) => {
                return Err(LedgerError::AlreadyConfirmed(msg));
            }
            Err(LedgerError::Storage(StorageError::StaleState(_))) => {
                let current = self.deposit(deposit_id).await?;
                return Err(already_confirmed_or_conflict(&current, gateway_payment_id));
            }
            Err(e) => return Err(e),
        }

        record_escrow_transition(EscrowStatus::Completed.as_str());
        info!(amount = %deposit.amount, "🔒 Prize pool escrowed");
        Ok(EscrowDeposit {
            status: EscrowStatus::Completed,
            gateway_payment_id: Some(gateway_payment_id.to_string()),
            completed_at: Some(now),
            ..deposit
        })
    }

    /// Pay the prize pool out to `winners`.
    ///
    /// Monetary pools are split evenly over the configured winner count. The
    /// rounding remainder and the shares of unfilled slots return to the
    /// creator. Non-monetary rewards are never split automatically, so any
    /// pool funded for them is returned whole.
    #[instrument(skip(self, winners), fields(deposit = %deposit_id, winners = winners.len()))]
    pub async fn distribute(
        &self,
        deposit_id: &DepositId,
        winners: &[AccountId],
    ) -> LedgerResult<DistributionOutcome> {
        let deposit = self.deposit(deposit_id).await?;
        let election = self.election(&deposit.election_id).await?;
        if election.status != ElectionStatus::Completed {
            return Err(LedgerError::InvalidState(format!(
                "election {} has not completed",
                election.id
            )));
        }

        let Some(prize) = election
            .prize
            .as_ref()
            .filter(|p| p.reward_type == RewardType::Monetary)
        else {
            info!("🎁 Non-monetary reward, prize pool goes back to the creator");
            let amount = self.return_unused(deposit_id).await?.amount;
            return Ok(DistributionOutcome::Returned { amount });
        };

        let mut payees: Vec<AccountId> = Vec::new();
        for winner in winners {
            if !payees.contains(winner) {
                payees.push(winner.clone());
            }
        }
        let slots = if prize.winner_count == 0 {
            payees.len() as u32
        } else {
            prize.winner_count
        };
        if payees.len() as u32 > slots {
            warn!(
                winners = payees.len(),
                slots, "⚠️  More winners than prize slots, extra winners ignored"
            );
            payees.truncate(slots as usize);
        }

        let share = deposit
            .amount
            .split_even(slots)
            .map(|(share, _)| share)
            .unwrap_or(Money::ZERO);
        if payees.is_empty() || !share.is_positive() {
            let amount = self.return_unused(deposit_id).await?.amount;
            return Ok(DistributionOutcome::Returned { amount });
        }

        let mut accounts = payees.clone();
        accounts.push(deposit.creator_id.clone());
        let _guard = self.ledger.lock(&accounts).await?;
        let deposit = self.deposit(deposit_id).await?;
        match deposit.status {
            EscrowStatus::Completed => {}
            EscrowStatus::Distributed => {
                return Err(LedgerError::AlreadyConfirmed(format!(
                    "deposit {} already distributed",
                    deposit.id
                )));
            }
            other => {
                return Err(LedgerError::InvalidState(format!(
                    "deposit {} is {other}, expected completed",
                    deposit.id
                )));
            }
        }

        let paid = share
            .times(payees.len() as u32)
            .ok_or_else(|| LedgerError::InvalidAmount("prize share overflow".to_string()))?;
        let returned = deposit.amount - paid;
        let details = json!({
            "deposit_id": deposit.id,
            "share_cents": share.cents(),
            "winners": payees,
        });

        let mut entry = LedgerEntry::new().record(
            Transaction::new(
                deposit.creator_id.clone(),
                TransactionKind::PrizeDistribution,
                paid,
            )
            .debit_from(Bucket::Escrowed)
            .for_election(deposit.election_id.clone())
            .for_deposit(deposit.id)
            .described(format!("Prize pool paid to {} winner(s)", payees.len()))
            .with_details(details),
        );
        for (rank, winner) in payees.iter().enumerate() {
            entry = entry.record(
                Transaction::new(winner.clone(), TransactionKind::PrizeDistribution, share)
                    .credit_to(Bucket::Available)
                    .for_election(deposit.election_id.clone())
                    .for_deposit(deposit.id)
                    .described(format!("Prize for \"{}\"", election.title))
                    .with_details(json!({ "rank": rank + 1 })),
            );
        }
        if returned.is_positive() {
            entry = entry.record(
                Transaction::new(
                    deposit.creator_id.clone(),
                    TransactionKind::EscrowReturn,
                    returned,
                )
                .debit_from(Bucket::Escrowed)
                .credit_to(Bucket::Available)
                .for_election(deposit.election_id.clone())
                .for_deposit(deposit.id)
                .described("Unallocated prize pool returned"),
            );
        }
        let entry = entry.transition(EscrowTransition {
            deposit_id: deposit.id,
            from: EscrowStatus::Completed,
            to: EscrowStatus::Distributed,
            gateway_payment_id: None,
            at: Utc::now(),
        });

        self.ledger.commit_locked(entry).await?;
        record_escrow_transition(EscrowStatus::Distributed.as_str());
        info!(share = %share, winners = payees.len(), returned = %returned, "🏆 Prize pool distributed");
        Ok(DistributionOutcome::Distributed {
            share,
            winners: payees,
            returned,
        })
    }

    /// Return an undistributed pool to its creator.
    ///
    /// A completed deposit is moved back to available balance; a pending one
    /// holds no funds and simply expires.
    #[instrument(skip(self), fields(deposit = %deposit_id))]
    pub async fn return_unused(&self, deposit_id: &DepositId) -> LedgerResult<EscrowDeposit> {
        let deposit = self.deposit(deposit_id).await?;
        let _guard = self
            .ledger
            .lock(std::slice::from_ref(&deposit.creator_id))
            .await?;
        let deposit = self.deposit(deposit_id).await?;

        match deposit.status {
            EscrowStatus::Completed => {}
            EscrowStatus::Pending => return self.expire_locked(deposit).await,
            EscrowStatus::Returned | EscrowStatus::Expired => {
                return Err(LedgerError::AlreadyConfirmed(format!(
                    "deposit {} already returned",
                    deposit.id
                )));
            }
            EscrowStatus::Distributed => {
                return Err(LedgerError::InvalidState(format!(
                    "deposit {} was already distributed",
                    deposit.id
                )));
            }
        }

        let now = Utc::now();
        let entry = LedgerEntry::new()
            .record(
                Transaction::new(
                    deposit.creator_id.clone(),
                    TransactionKind::EscrowReturn,
                    deposit.amount,
                )
                .debit_from(Bucket::Escrowed)
                .credit_to(Bucket::Available)
                .for_election(deposit.election_id.clone())
                .for_deposit(deposit.id)
                .described("Prize pool returned"),
            )
            .transition(EscrowTransition {
                deposit_id: deposit.id,
                from: EscrowStatus::Completed,
                to: EscrowStatus::Returned,
                gateway_payment_id: None,
                at: now,
            });
        self.ledger.commit_locked(entry).await?;

        record_escrow_transition(EscrowStatus::Returned.as_str());
        info!(amount = %deposit.amount, "↩️  Prize pool returned to creator");
        Ok(EscrowDeposit {
            status: EscrowStatus::Returned,
            settled_at: Some(now),
            ..deposit
        })
    }

    /// Expire a pending deposit whose checkout was abandoned.
    pub async fn expire(&self, deposit_id: &DepositId) -> LedgerResult<EscrowDeposit> {
        let deposit = self.deposit(deposit_id).await?;
        let _guard = self
            .ledger
            .lock(std::slice::from_ref(&deposit.creator_id))
            .await?;
        let deposit = self.deposit(deposit_id).await?;
        if deposit.status != EscrowStatus::Pending {
            return Err(LedgerError::InvalidState(format!(
                "deposit {} is {}, only pending deposits expire",
                deposit.id, deposit.status
            )));
        }
        self.expire_locked(deposit).await
    }

    async fn expire_locked(&self, deposit: EscrowDeposit) -> LedgerResult<EscrowDeposit> {
        let now = Utc::now();
        self.ledger
            .commit_locked(LedgerEntry::new().transition(EscrowTransition {
                deposit_id: deposit.id,
                from: EscrowStatus::Pending,
                to: EscrowStatus::Expired,
                gateway_payment_id: None,
                at: now,
            }))
            .await?;
        record_escrow_transition(EscrowStatus::Expired.as_str());
        info!(deposit = %deposit.id, "⌛ Prize pool deposit expired");
        Ok(EscrowDeposit {
            status: EscrowStatus::Expired,
            settled_at: Some(now),
            ..deposit
        })
    }

    /// Whether an election may be published.
    pub async fn publish_readiness(
        &self,
        election_id: &ElectionId,
    ) -> LedgerResult<PublishReadiness> {
        let election = self.election(election_id).await?;
        let required = election
            .prize
            .as_ref()
            .filter(|p| p.requires_deposit())
            .map(|p| p.amount);

        let Some(required_amount) = required else {
            return Ok(PublishReadiness {
                election_id: election_id.clone(),
                state: ReadinessState::Ready,
                required_amount: Money::ZERO,
                deposit: None,
            });
        };

        let deposit = self
            .ledger
            .repositories()
            .escrows()
            .find_live_deposit(election_id, &election.creator_id)
            .await?;
        let state = match deposit.as_ref().map(|d| d.status) {
            Some(EscrowStatus::Completed) => ReadinessState::Ready,
            Some(_) => ReadinessState::DepositPending,
            None => ReadinessState::DepositRequired,
        };
        Ok(PublishReadiness {
            election_id: election_id.clone(),
            state,
            required_amount,
            deposit,
        })
    }

    /// Fail with [`LedgerError::DepositRequired`] unless the election is ready.
    pub async fn ensure_publishable(&self, election_id: &ElectionId) -> LedgerResult<()> {
        let readiness = self.publish_readiness(election_id).await?;
        match readiness.state {
            ReadinessState::Ready => Ok(()),
            _ => Err(LedgerError::DepositRequired {
                election_id: election_id.clone(),
                amount: readiness.required_amount,
            }),
        }
    }
}

fn already_confirmed_or_conflict(deposit: &EscrowDeposit, payment_id: &str) -> LedgerError {
    if deposit.gateway_payment_id.as_deref() == Some(payment_id) {
        LedgerError::AlreadyConfirmed(format!("deposit {} already confirmed", deposit.id))
    } else {
        error!(
            deposit = %deposit.id,
            payment = payment_id,
            "❌ Second payment for an already funded deposit"
        );
        LedgerError::InvalidState(format!(
            "deposit {} was funded by another payment",
            deposit.id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{Harness, free_election, monetary_election};

    // Test critique: double confirmation (webhook dupliqué) => +1000$ une seule fois
    #[tokio::test]
    async fn test_duplicate_confirmation_escrows_once() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 100_000, 10);
        h.directory.upsert(election.clone()).await;

        let checkout = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, Money::from_dollars_whole(1000), None)
            .await
            .unwrap();
        let deposit_id = checkout.deposit.id;
        let reference = checkout.session.unwrap().reference;

        h.escrow
            .confirm_deposit(&deposit_id, &reference, Some(Money::from_dollars_whole(1000)), None)
            .await
            .unwrap();
        let err = h
            .escrow
            .confirm_deposit(&deposit_id, &reference, Some(Money::from_dollars_whole(1000)), None)
            .await
            .unwrap_err();
        assert!(err.is_benign());

        let balance = h.ledger.balance(&election.creator_id).await.unwrap();
        assert_eq!(balance.escrowed, Money::from_dollars_whole(1000));
    }

    #[tokio::test]
    async fn test_initiate_returns_existing_pending_then_rejects_completed() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 50_000, 1);
        h.directory.upsert(election.clone()).await;
        let amount = Money::from_dollars_whole(500);

        let first = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap();
        let second = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap();
        assert_eq!(first.deposit.id, second.deposit.id);
        // Le créateur récupère le même checkout
        assert_eq!(
            second.session.map(|s| s.reference),
            first.session.map(|s| s.reference)
        );

        h.escrow
            .confirm_deposit(&first.deposit.id, "pay_1", None, None)
            .await
            .unwrap();
        let err = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::AlreadyConfirmed(_)));

        let err = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, Money::ZERO, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidAmount(_)));
    }

    // Test critique: 10 gagnants / 1000$ => 100$ chacun, reste nul
    #[tokio::test]
    async fn test_distribution_splits_pool_exactly() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 100_000, 10);
        h.directory.upsert(election.clone()).await;
        let deposit = h.funded_deposit(&election).await;
        h.directory.set_status(&election.id, ElectionStatus::Completed).await;

        let winners: Vec<AccountId> = (0..10).map(|i| AccountId::new(format!("w{i}"))).collect();
        let outcome = h.escrow.distribute(&deposit.id, &winners).await.unwrap();
        assert_eq!(
            outcome,
            DistributionOutcome::Distributed {
                share: Money::from_dollars_whole(100),
                winners: winners.clone(),
                returned: Money::ZERO,
            }
        );

        let mut credited = Money::ZERO;
        for winner in &winners {
            let balance = h.ledger.balance(winner).await.unwrap();
            assert_eq!(balance.available, Money::from_dollars_whole(100));
            credited += balance.available;
        }
        let creator = h.ledger.balance(&election.creator_id).await.unwrap();
        assert_eq!(credited + creator.available, Money::from_dollars_whole(1000));
        assert_eq!(creator.escrowed, Money::ZERO);

        let err = h.escrow.distribute(&deposit.id, &winners).await.unwrap_err();
        assert!(err.is_benign());
    }

    #[tokio::test]
    async fn test_remainder_and_unfilled_slots_return_to_creator() {
        let h = Harness::new().await;
        // 10.00$ sur 3 places, 2 gagnants seulement
        let election = monetary_election("el-1", "creator", 1_000, 3);
        h.directory.upsert(election.clone()).await;
        let deposit = h.funded_deposit(&election).await;
        h.directory.set_status(&election.id, ElectionStatus::Completed).await;

        let winners = vec![AccountId::from("a"), AccountId::from("b")];
        let outcome = h.escrow.distribute(&deposit.id, &winners).await.unwrap();
        let DistributionOutcome::Distributed { share, returned, .. } = outcome else {
            panic!("expected a distribution");
        };
        assert_eq!(share, Money::from_cents(333));
        assert_eq!(returned, Money::from_cents(334));

        let creator = h.ledger.balance(&election.creator_id).await.unwrap();
        let a = h.ledger.balance(&winners[0]).await.unwrap();
        let b = h.ledger.balance(&winners[1]).await.unwrap();
        assert_eq!(a.available + b.available + creator.available, Money::from_cents(1_000));
    }

    #[tokio::test]
    async fn test_distribution_requires_completed_election() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 1_000, 1);
        h.directory.upsert(election.clone()).await;
        let deposit = h.funded_deposit(&election).await;

        let err = h
            .escrow
            .distribute(&deposit.id, &[AccountId::from("a")])
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_return_unused_restores_available_balance() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 20_000, 2);
        h.directory.upsert(election.clone()).await;
        let deposit = h.funded_deposit(&election).await;

        let returned = h.escrow.return_unused(&deposit.id).await.unwrap();
        assert_eq!(returned.status, EscrowStatus::Returned);

        let balance = h.ledger.balance(&election.creator_id).await.unwrap();
        assert_eq!(balance.available, Money::from_dollars_whole(200));
        assert_eq!(balance.escrowed, Money::ZERO);

        assert!(h.escrow.return_unused(&deposit.id).await.unwrap_err().is_benign());
    }

    #[tokio::test]
    async fn test_publish_gating_follows_deposit_state() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 10_000, 1);
        h.directory.upsert(election.clone()).await;

        let readiness = h.escrow.publish_readiness(&election.id).await.unwrap();
        assert_eq!(readiness.state, ReadinessState::DepositRequired);
        assert!(matches!(
            h.escrow.ensure_publishable(&election.id).await,
            Err(LedgerError::DepositRequired { .. })
        ));

        let checkout = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, Money::from_dollars_whole(100), None)
            .await
            .unwrap();
        let readiness = h.escrow.publish_readiness(&election.id).await.unwrap();
        assert_eq!(readiness.state, ReadinessState::DepositPending);

        h.escrow
            .confirm_deposit(&checkout.deposit.id, "pay_1", None, None)
            .await
            .unwrap();
        assert!(h.escrow.ensure_publishable(&election.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_expired_deposit_allows_a_new_one() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 10_000, 1);
        h.directory.upsert(election.clone()).await;
        let amount = Money::from_dollars_whole(100);

        let first = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap();
        h.escrow.expire(&first.deposit.id).await.unwrap();

        let second = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap();
        assert_ne!(first.deposit.id, second.deposit.id);
        assert!(second.session.is_some());

        // Un paiement tardif sur le dépôt expiré est refusé
        let err = h
            .escrow
            .confirm_deposit(&first.deposit.id, "late", None, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    // Test critique: aucun dépôt sans pot monétaire à financer
    #[tokio::test]
    async fn test_initiate_requires_monetary_prize() {
        let h = Harness::new().await;
        let free = free_election("el-free", "creator", 500);
        h.directory.upsert(free.clone()).await;
        let mut revenue = monetary_election("el-rev", "creator", 50_000, 1);
        if let Some(prize) = revenue.prize.as_mut() {
            prize.reward_type = RewardType::ProjectedRevenue;
        }
        h.directory.upsert(revenue.clone()).await;

        for election in [&free, &revenue] {
            let err = h
                .escrow
                .initiate_deposit(&election.id, &election.creator_id, Money::from_dollars_whole(500), None)
                .await
                .unwrap_err();
            assert!(matches!(err, LedgerError::Validation(_)));
        }
        assert!(h.gateway.cancelled().is_empty());
    }

    #[tokio::test]
    async fn test_closed_checkout_is_replaced_on_initiate() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 10_000, 1);
        h.directory.upsert(election.clone()).await;
        let amount = Money::from_dollars_whole(100);

        let first = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap();
        let first_ref = first.session.unwrap().reference;
        h.gateway.set_status(&first_ref, PaymentStatus::Failed);

        let second = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap();
        assert_ne!(second.deposit.id, first.deposit.id);
        let second_ref = second.session.unwrap().reference;
        assert_ne!(second_ref, first_ref);
        assert_eq!(h.gateway.cancelled(), vec![first_ref.clone()]);

        let old = h.deposit_status(&first.deposit.id).await;
        assert_eq!(old, EscrowStatus::Expired);

        // Paiement reçu mais pas encore confirmé: pas de nouveau checkout
        h.gateway.set_status(&second_ref, PaymentStatus::Succeeded);
        let third = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap();
        assert_eq!(third.deposit.id, second.deposit.id);
        assert!(third.session.is_none());
    }
}
