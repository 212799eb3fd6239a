//! Settlement scheduler.
//!
//! Runs when an election ends. Completed elections release the creator's
//! blocked voter fees to available balance in one fee-release transaction and
//! pay out the prize pool. Cancelled elections refund voters and return the
//! pool. The settlement marker is written in the same entry as the money
//! movement, so a second run for the same election is a no-op.

use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::error::{LedgerError, LedgerResult, StorageError};
use crate::metrics::record_settlement;
use crate::models::{
    AccountId, Bucket, ElectionId, ElectionSettlement, EscrowStatus, FeeBreakdown, Money,
    SettlementOutcome, Transaction, TransactionKind,
};
use crate::ports::{ElectionDirectory, ElectionInfo, ElectionStatus, LedgerEntry};

use super::escrow::{DistributionOutcome, EscrowManager};
use super::ledger::Ledger;

/// How an election ended, as reported by the election service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionOutcome {
    Completed { winners: Vec<AccountId> },
    Cancelled,
}

/// What happened to the blocked voter fees.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum FeeSettlement {
    Released { amount: Money, participants: u32 },
    Refunded { amount: Money, participants: u32 },
    AlreadySettled,
}

/// What happened to the prize pool.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum EscrowSettlement {
    NoDeposit,
    Distributed { share: Money, winners: u32, returned: Money },
    Returned { amount: Money },
    Expired,
}

/// Summary of one settlement run.
#[derive(Debug, Clone, Serialize)]
pub struct SettlementReport {
    pub election_id: ElectionId,
    pub fees: FeeSettlement,
    pub escrow: EscrowSettlement,
}

/// Releases or refunds election funds at election end.
pub struct SettlementScheduler {
    ledger: Arc<Ledger>,
    escrow: Arc<EscrowManager>,
    directory: Arc<dyn ElectionDirectory>,
}

impl SettlementScheduler {
    pub fn new(
        ledger: Arc<Ledger>,
        escrow: Arc<EscrowManager>,
        directory: Arc<dyn ElectionDirectory>,
    ) -> Self {
        Self {
            ledger,
            escrow,
            directory,
        }
    }

    /// Settle an ended election. Safe to call any number of times.
    #[instrument(skip(self, outcome), fields(election = %election_id))]
    pub async fn settle(
        &self,
        election_id: &ElectionId,
        outcome: ElectionOutcome,
    ) -> LedgerResult<SettlementReport> {
        let election = self
            .directory
            .get_election(election_id)
            .await?
            .ok_or_else(|| LedgerError::NotFound(format!("election {election_id}")))?;

        let expected = match outcome {
            ElectionOutcome::Completed { .. } => ElectionStatus::Completed,
            ElectionOutcome::Cancelled => ElectionStatus::Cancelled,
        };
        if election.status != expected {
            return Err(LedgerError::InvalidState(format!(
                "election {election_id} is {:?}, cannot settle as {:?}",
                election.status, expected
            )));
        }

        let fees = self.settle_fees(&election, &outcome).await?;
        let escrow = self.settle_escrow(&election, &outcome).await?;

        info!(fees = ?fees, escrow = ?escrow, "🧾 Election settled");
        Ok(SettlementReport {
            election_id: election_id.clone(),
            fees,
            escrow,
        })
    }

    async fn settle_fees(
        &self,
        election: &ElectionInfo,
        outcome: &ElectionOutcome,
    ) -> LedgerResult<FeeSettlement> {
        let repos = self.ledger.repositories();
        if repos.settlements().get_settlement(&election.id).await?.is_some() {
            return Ok(FeeSettlement::AlreadySettled);
        }

        let preview = repos.transactions().voter_fees(&election.id).await?;
        let mut accounts = vec![election.creator_id.clone()];
        if *outcome == ElectionOutcome::Cancelled {
            accounts.extend(preview.iter().filter_map(|t| t.payer_id.clone()));
        }
        let _guard = self.ledger.lock(&accounts).await?;

        // Re-read under the creator's lock: no voter fee can land meanwhile.
        if repos.settlements().get_settlement(&election.id).await?.is_some() {
            return Ok(FeeSettlement::AlreadySettled);
        }
        let fees: Vec<Transaction> = repos
            .transactions()
            .voter_fees(&election.id)
            .await?
            .into_iter()
            .filter(|t| t.account_id == election.creator_id)
            .collect();

        let total: Money = fees.iter().map(|t| t.amount).sum();
        let participants = fees.len() as u32;
        let settled_outcome = match outcome {
            ElectionOutcome::Completed { .. } => SettlementOutcome::Released,
            ElectionOutcome::Cancelled => SettlementOutcome::Refunded,
        };
        let marker = ElectionSettlement {
            election_id: election.id.clone(),
            creator_id: election.creator_id.clone(),
            outcome: settled_outcome,
            amount: total,
            participant_count: participants,
            settled_at: Utc::now(),
        };

        let mut entry = LedgerEntry::new().settle(marker);
        if total.is_positive() {
            entry = match settled_outcome {
                SettlementOutcome::Released => {
                    entry.record(release_row(election, &fees, total))
                }
                SettlementOutcome::Refunded => {
                    let refunds = refund_rows(election, &fees, total)?;
                    if refunds
                        .iter()
                        .any(|r| !accounts.contains(&r.account_id))
                    {
                        return Err(LedgerError::Retryable(
                            "participants changed during settlement".to_string(),
                        ));
                    }
                    entry.record_all(refunds)
                }
            };
        }

        match self.ledger.commit_locked(entry).await {
            Ok(_) => {}
            Err(LedgerError::Storage(StorageError::Duplicate(_))) => {
                return Ok(FeeSettlement::AlreadySettled);
            }
            Err(e) => return Err(e),
        }
        record_settlement(settled_outcome.as_str());

        Ok(match settled_outcome {
            SettlementOutcome::Released => FeeSettlement::Released {
                amount: total,
                participants,
            },
            SettlementOutcome::Refunded => FeeSettlement::Refunded {
                amount: total,
                participants,
            },
        })
    }

    async fn settle_escrow(
        &self,
        election: &ElectionInfo,
        outcome: &ElectionOutcome,
    ) -> LedgerResult<EscrowSettlement> {
        let Some(deposit) = self
            .ledger
            .repositories()
            .escrows()
            .find_live_deposit(&election.id, &election.creator_id)
            .await?
        else {
            return Ok(EscrowSettlement::NoDeposit);
        };

        let result = match (deposit.status, outcome) {
            (EscrowStatus::Completed, ElectionOutcome::Completed { winners }) => self
                .escrow
                .distribute(&deposit.id, winners)
                .await
                .map(|d| match d {
                    DistributionOutcome::Distributed {
                        share,
                        winners,
                        returned,
                    } => EscrowSettlement::Distributed {
                        share,
                        winners: winners.len() as u32,
                        returned,
                    },
                    DistributionOutcome::Returned { amount } => {
                        EscrowSettlement::Returned { amount }
                    }
                }),
            (EscrowStatus::Completed, ElectionOutcome::Cancelled) => self
                .escrow
                .return_unused(&deposit.id)
                .await
                .map(|d| EscrowSettlement::Returned { amount: d.amount }),
            _ => {
                warn!(deposit = %deposit.id, "⚠️  Unpaid prize pool deposit at election end");
                self.escrow
                    .expire(&deposit.id)
                    .await
                    .map(|_| EscrowSettlement::Expired)
            }
        };

        match result {
            Err(e) if e.is_benign() => Ok(EscrowSettlement::NoDeposit),
            other => other,
        }
    }
}

/// Single blocked → available transfer carrying the aggregated breakdown.
fn release_row(election: &ElectionInfo, fees: &[Transaction], total: Money) -> Transaction {
    let breakdown = fees
        .iter()
        .map(Transaction::fees)
        .fold(FeeBreakdown::default(), |acc, f| acc + f);
    let ids: Vec<String> = fees.iter().map(|t| t.id.to_string()).collect();
    Transaction::new(
        election.creator_id.clone(),
        TransactionKind::FeeRelease,
        total,
    )
    .debit_from(Bucket::Blocked)
    .credit_to(Bucket::Available)
    .with_fees(breakdown)
    .for_election(election.id.clone())
    .described(format!(
        "Voter fees released for \"{}\" ({} participant(s))",
        election.title,
        fees.len()
    ))
    .with_details(json!({ "participant_count": fees.len(), "transactions": ids }))
}

/// Creator debit of the blocked total plus one credit per voter.
fn refund_rows(
    election: &ElectionInfo,
    fees: &[Transaction],
    total: Money,
) -> LedgerResult<Vec<Transaction>> {
    let mut rows = vec![
        Transaction::new(election.creator_id.clone(), TransactionKind::Refund, total)
            .debit_from(Bucket::Blocked)
            .for_election(election.id.clone())
            .described(format!("Voter fees refunded for cancelled \"{}\"", election.title)),
    ];
    for fee in fees {
        let voter = fee.payer_id.clone().ok_or_else(|| {
            LedgerError::InvalidState(format!("voter fee {} has no payer", fee.id))
        })?;
        rows.push(
            Transaction::new(voter.clone(), TransactionKind::Refund, fee.amount)
                .credit_to(Bucket::Available)
                .for_election(election.id.clone())
                .described(format!("Refund for cancelled \"{}\"", election.title))
                .with_details(json!({ "voter_fee_id": fee.id })),
        );
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Gateway, TransactionStatus};
    use crate::ports::{GatewayEvent, PaymentGateway, PaymentStatus, RewardType};
    use crate::services::testing::{Harness, free_election, monetary_election};

    // Test critique: scénario 5.00$ => 4.30$ bloqué puis libéré à la fin
    #[tokio::test]
    async fn test_blocked_fees_released_once() {
        let h = Harness::new().await;
        let election = free_election("el-1", "creator", 500);
        h.directory.upsert(election.clone()).await;
        h.paid_vote(&election, "voter-1").await;

        let creator = h.ledger.balance(&election.creator_id).await.unwrap();
        assert_eq!(creator.blocked, Money::from_cents(430));
        assert_eq!(creator.available, Money::ZERO);

        h.directory.set_status(&election.id, ElectionStatus::Completed).await;
        let outcome = ElectionOutcome::Completed { winners: vec![] };
        let report = h.settlement.settle(&election.id, outcome.clone()).await.unwrap();
        assert_eq!(
            report.fees,
            FeeSettlement::Released {
                amount: Money::from_cents(430),
                participants: 1
            }
        );

        // Second passage: aucun mouvement
        let report = h.settlement.settle(&election.id, outcome).await.unwrap();
        assert_eq!(report.fees, FeeSettlement::AlreadySettled);

        let creator = h.ledger.balance(&election.creator_id).await.unwrap();
        assert_eq!(creator.available, Money::from_cents(430));
        assert_eq!(creator.blocked, Money::ZERO);
    }

    #[tokio::test]
    async fn test_release_carries_aggregated_breakdown() {
        let h = Harness::new().await;
        let election = free_election("el-1", "creator", 500);
        h.directory.upsert(election.clone()).await;
        h.paid_vote(&election, "voter-1").await;
        h.paid_vote(&election, "voter-2").await;
        h.directory.set_status(&election.id, ElectionStatus::Completed).await;

        h.settlement
            .settle(&election.id, ElectionOutcome::Completed { winners: vec![] })
            .await
            .unwrap();

        let release = h
            .history(&election.creator_id)
            .await
            .into_iter()
            .find(|t| t.kind == TransactionKind::FeeRelease)
            .unwrap();
        assert_eq!(release.gross_amount, Money::from_cents(1_000));
        assert_eq!(release.gateway_fee, Money::from_cents(90));
        assert_eq!(release.platform_fee, Money::from_cents(50));
        assert_eq!(release.net_amount, Money::from_cents(860));
        assert!(release.fees().is_balanced());
    }

    #[tokio::test]
    async fn test_cancellation_refunds_voters_and_returns_pool() {
        let h = Harness::new().await;
        let mut election = monetary_election("el-1", "creator", 10_000, 1);
        election.pricing.default_fee = Some(Money::from_cents(500));
        h.directory.upsert(election.clone()).await;
        h.funded_deposit(&election).await;
        h.paid_vote(&election, "voter-1").await;

        h.directory.set_status(&election.id, ElectionStatus::Cancelled).await;
        let report = h
            .settlement
            .settle(&election.id, ElectionOutcome::Cancelled)
            .await
            .unwrap();
        assert_eq!(
            report.fees,
            FeeSettlement::Refunded {
                amount: Money::from_cents(430),
                participants: 1
            }
        );
        assert_eq!(
            report.escrow,
            EscrowSettlement::Returned {
                amount: Money::from_dollars_whole(100)
            }
        );

        let voter = h.ledger.balance(&AccountId::from("voter-1")).await.unwrap();
        assert_eq!(voter.available, Money::from_cents(430));
        let creator = h.ledger.balance(&election.creator_id).await.unwrap();
        assert_eq!(creator.blocked, Money::ZERO);
        assert_eq!(creator.escrowed, Money::ZERO);
        assert_eq!(creator.available, Money::from_dollars_whole(100));
    }

    #[tokio::test]
    async fn test_settle_refuses_running_election() {
        let h = Harness::new().await;
        let election = free_election("el-1", "creator", 500);
        h.directory.upsert(election.clone()).await;

        let err = h
            .settlement
            .settle(&election.id, ElectionOutcome::Cancelled)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InvalidState(_)));
    }

    #[tokio::test]
    async fn test_completed_election_pays_winners_from_escrow() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 100_000, 10);
        h.directory.upsert(election.clone()).await;
        h.funded_deposit(&election).await;
        h.directory.set_status(&election.id, ElectionStatus::Completed).await;

        let winners: Vec<AccountId> = (0..10).map(|i| AccountId::new(format!("w{i}"))).collect();
        let outcome = ElectionOutcome::Completed { winners };
        let report = h.settlement.settle(&election.id, outcome.clone()).await.unwrap();
        assert_eq!(
            report.escrow,
            EscrowSettlement::Distributed {
                share: Money::from_dollars_whole(100),
                winners: 10,
                returned: Money::ZERO,
            }
        );

        let again = h.settlement.settle(&election.id, outcome).await.unwrap();
        assert_eq!(again.escrow, EscrowSettlement::NoDeposit);
    }

    // Test critique: un pot financé pour une récompense non monétaire revient au créateur
    #[tokio::test]
    async fn test_pool_of_non_monetary_reward_returns_to_creator() {
        let h = Harness::new().await;
        let mut election = monetary_election("el-1", "creator", 50_000, 3);
        h.directory.upsert(election.clone()).await;
        h.funded_deposit(&election).await;

        // Le service des élections change la récompense après le financement
        if let Some(prize) = election.prize.as_mut() {
            prize.reward_type = RewardType::ProjectedRevenue;
        }
        election.status = ElectionStatus::Completed;
        h.directory.upsert(election.clone()).await;

        let outcome = ElectionOutcome::Completed {
            winners: vec![AccountId::from("w1")],
        };
        let report = h.settlement.settle(&election.id, outcome.clone()).await.unwrap();
        assert_eq!(
            report.escrow,
            EscrowSettlement::Returned {
                amount: Money::from_dollars_whole(500)
            }
        );
        let again = h.settlement.settle(&election.id, outcome).await.unwrap();
        assert_eq!(again.escrow, EscrowSettlement::NoDeposit);

        let creator = h.ledger.balance(&election.creator_id).await.unwrap();
        assert_eq!(creator.escrowed, Money::ZERO);
        assert_eq!(creator.available, Money::from_dollars_whole(500));
        assert_eq!(
            h.ledger.balance(&AccountId::from("w1")).await.unwrap().available,
            Money::ZERO
        );
    }

    // Test critique: règlement et paiement tardif simultanés => aucun frais perdu
    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_settlement_racing_late_payment_stays_balanced() {
        let h = Arc::new(Harness::new().await);
        let election = free_election("el-1", "creator", 500);
        h.directory.upsert(election.clone()).await;
        h.paid_vote(&election, "voter-1").await;
        let (_, session) = h.start_vote(&election, "voter-2").await;
        h.gateway.set_status(&session.reference, PaymentStatus::Succeeded);
        let lookup = h.gateway.payment_status(&session.reference).await.unwrap();
        h.directory.set_status(&election.id, ElectionStatus::Completed).await;

        let settle = {
            let h = h.clone();
            let id = election.id.clone();
            tokio::spawn(async move {
                h.settlement
                    .settle(&id, ElectionOutcome::Completed { winners: vec![] })
                    .await
            })
        };
        let late = {
            let h = h.clone();
            let event = GatewayEvent::from_lookup(Gateway::Sandbox, lookup);
            tokio::spawn(async move { h.reconciler.reconcile(event).await })
        };
        settle.await.unwrap().unwrap();
        late.await.unwrap().unwrap();

        let creator = h.ledger.balance(&election.creator_id).await.unwrap();
        assert_eq!(creator.blocked, Money::ZERO);
        assert_eq!(creator.available, Money::from_cents(860));

        let history = h.history(&election.creator_id).await;
        let paid = history
            .iter()
            .filter(|t| t.kind == TransactionKind::VoterFeePayment)
            .filter(|t| t.status == TransactionStatus::Success)
            .count();
        assert_eq!(paid, 2);
    }
}
