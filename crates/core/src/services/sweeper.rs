//! Background sweeper for payments whose webhook never arrived.
//!
//! Pending gateway-backed rows and pending prize-pool deposits older than
//! the TTL are re-checked against the processor and closed out through the
//! same reconciliation path a webhook would take. Checkouts still open after
//! `max_pending_age` are cancelled at the processor and closed locally, so
//! no record stays pending forever.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use crate::error::{LedgerError, LedgerResult, StorageError};
use crate::metrics::record_sweeper_resolutions;
use crate::models::{EscrowDeposit, Transaction, TransactionStatus};
use crate::ports::{
    GatewayEvent, GatewayRegistry, LedgerEntry, PaymentGateway, PaymentLookup, PaymentStatus,
};

use super::escrow::EscrowManager;
use super::ledger::Ledger;
use super::reconcile::Reconciler;

// =============================================================================
// Configuration
// =============================================================================

/// Configuration for the sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Time between sweeps.
    pub interval: Duration,
    /// Age after which a pending payment is re-checked.
    pub ttl: Duration,
    /// Age after which a checkout the processor still reports as open is
    /// abandoned.
    pub max_pending_age: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(300),
            ttl: Duration::from_secs(3600),
            max_pending_age: Duration::from_secs(24 * 3600),
        }
    }
}

/// Counts from one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub resolved: usize,
    pub still_pending: usize,
    pub errors: usize,
}

// =============================================================================
// Sweeper
// =============================================================================

pub struct Sweeper {
    config: SweeperConfig,
    ledger: Arc<Ledger>,
    gateways: Arc<GatewayRegistry>,
    escrow: Arc<EscrowManager>,
    reconciler: Arc<Reconciler>,
}

impl Sweeper {
    pub fn new(
        config: SweeperConfig,
        ledger: Arc<Ledger>,
        gateways: Arc<GatewayRegistry>,
        escrow: Arc<EscrowManager>,
        reconciler: Arc<Reconciler>,
    ) -> Self {
        Self {
            config,
            ledger,
            gateways,
            escrow,
            reconciler,
        }
    }

    /// Sweep every `interval` until shutdown is signalled.
    #[instrument(skip_all)]
    pub async fn run(&self, mut shutdown_rx: tokio::sync::watch::Receiver<bool>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            ttl_secs = self.config.ttl.as_secs(),
            max_pending_age_secs = self.config.max_pending_age.as_secs(),
            "🧹 Starting payment sweeper"
        );

        loop {
            if *shutdown_rx.borrow() {
                debug!("Shutdown requested");
                return;
            }

            match self.sweep_once().await {
                Ok(report) if report.examined > 0 => {
                    info!(
                        examined = report.examined,
                        resolved = report.resolved,
                        pending = report.still_pending,
                        errors = report.errors,
                        "🧹 Sweep finished"
                    );
                }
                Ok(_) => debug!("Nothing to sweep"),
                Err(e) => warn!(error = %e, "⚠️  Sweep failed"),
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        return;
                    }
                }
            }
        }
    }

    /// One pass over everything older than the TTL.
    pub async fn sweep_once(&self) -> LedgerResult<SweepReport> {
        let ttl = chrono::Duration::from_std(self.config.ttl)
            .map_err(|e| LedgerError::Configuration(format!("sweeper ttl: {e}")))?;
        self.sweep_before(Utc::now() - ttl).await
    }

    /// One pass over everything created before `cutoff`.
    ///
    /// `cutoff` is the TTL boundary. Payments created more than
    /// `max_pending_age - ttl` before it are abandoned when still open.
    pub async fn sweep_before(&self, cutoff: DateTime<Utc>) -> LedgerResult<SweepReport> {
        let grace = self.config.max_pending_age.saturating_sub(self.config.ttl);
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| LedgerError::Configuration(format!("sweeper max pending age: {e}")))?;
        let abandon_before = cutoff - grace;

        let repos = self.ledger.repositories();
        let rows = repos.transactions().stale_pending(cutoff).await?;
        let deposits = repos.escrows().stale_pending(cutoff).await?;

        let mut report = SweepReport::default();
        for row in rows {
            report.examined += 1;
            match self.sweep_transaction(&row, abandon_before).await {
                Ok(true) => report.resolved += 1,
                Ok(false) => report.still_pending += 1,
                Err(e) => {
                    warn!(txn = %row.id, error = %e, "⚠️  Could not sweep transaction");
                    report.errors += 1;
                }
            }
        }
        for deposit in deposits {
            report.examined += 1;
            match self.sweep_deposit(&deposit, abandon_before).await {
                Ok(true) => report.resolved += 1,
                Ok(false) => report.still_pending += 1,
                Err(e) => {
                    warn!(deposit = %deposit.id, error = %e, "⚠️  Could not sweep deposit");
                    report.errors += 1;
                }
            }
        }

        record_sweeper_resolutions(report.resolved as u64);
        Ok(report)
    }

    /// Returns `true` when the row left the pending state.
    async fn sweep_transaction(
        &self,
        row: &Transaction,
        abandon_before: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let (Some(gateway), Some(reference)) = (row.gateway, row.gateway_reference.as_deref())
        else {
            return Ok(false);
        };
        let adapter = self.gateways.get(gateway)?;
        let mut lookup = adapter.payment_status(reference).await?;
        if lookup.status == PaymentStatus::Pending {
            if row.created_at >= abandon_before {
                return Ok(false);
            }
            lookup = abandon(adapter.as_ref(), reference).await?;
        }
        match lookup.status {
            PaymentStatus::Pending | PaymentStatus::Expired => {
                let entry = LedgerEntry::new().resolve(row, TransactionStatus::Cancelled);
                settled(self.ledger.commit(entry).await.map(|_| ()))?;
                info!(txn = %row.id, "⌛ Abandoned checkout cancelled");
                Ok(true)
            }
            PaymentStatus::Succeeded | PaymentStatus::Failed => {
                let event = GatewayEvent::from_lookup(gateway, lookup);
                settled(self.reconciler.reconcile(event).await.map(|_| ()))?;
                Ok(true)
            }
        }
    }

    async fn sweep_deposit(
        &self,
        deposit: &EscrowDeposit,
        abandon_before: DateTime<Utc>,
    ) -> LedgerResult<bool> {
        let Some(reference) = deposit.checkout_reference.as_deref() else {
            settled(self.escrow.expire(&deposit.id).await.map(|_| ()))?;
            return Ok(true);
        };
        let adapter = self.gateways.get(deposit.gateway)?;
        let mut lookup = adapter.payment_status(reference).await?;
        if lookup.status == PaymentStatus::Pending {
            if deposit.created_at >= abandon_before {
                return Ok(false);
            }
            lookup = abandon(adapter.as_ref(), reference).await?;
        }
        match lookup.status {
            PaymentStatus::Succeeded => {
                let event = GatewayEvent::from_lookup(deposit.gateway, lookup);
                settled(self.reconciler.reconcile(event).await.map(|_| ()))?;
                Ok(true)
            }
            PaymentStatus::Pending | PaymentStatus::Failed | PaymentStatus::Expired => {
                settled(self.escrow.expire(&deposit.id).await.map(|_| ()))?;
                Ok(true)
            }
        }
    }
}

/// Cancel an open checkout at its processor, then read its final status.
///
/// A payment that succeeded in the meantime is reported as such. One the
/// processor would not cancel is reported as expired and closed locally.
async fn abandon(adapter: &dyn PaymentGateway, reference: &str) -> LedgerResult<PaymentLookup> {
    if let Err(e) = adapter.cancel_payment(reference).await {
        warn!(reference, error = %e, "⚠️  Could not cancel checkout at the processor");
    }
    let mut lookup = adapter.payment_status(reference).await?;
    if lookup.status == PaymentStatus::Pending {
        lookup.status = PaymentStatus::Expired;
    }
    Ok(lookup)
}

/// A race with a webhook that already closed the payment is not an error.
fn settled(result: LedgerResult<()>) -> LedgerResult<()> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_benign() => Ok(()),
        Err(LedgerError::Storage(StorageError::Duplicate(_) | StorageError::StaleState(_))) => {
            Ok(())
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccountId, EscrowStatus, Money};
    use crate::services::ReadinessState;
    use crate::services::testing::{Harness, free_election, monetary_election};

    fn sweeper(h: &Harness) -> Sweeper {
        Sweeper::new(
            SweeperConfig::default(),
            h.ledger.clone(),
            h.gateways.clone(),
            h.escrow.clone(),
            h.reconciler.clone(),
        )
    }

    fn later() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::seconds(1)
    }

    // Test critique: webhook perdu => le balayage crédite le paiement une seule fois
    #[tokio::test]
    async fn test_missed_webhook_is_recovered() {
        let h = Harness::new().await;
        let election = free_election("el-1", "creator", 500);
        h.directory.upsert(election.clone()).await;
        let (txn, session) = h.start_vote(&election, "voter-1").await;
        h.gateway.set_status(&session.reference, PaymentStatus::Succeeded);

        let sweeper = sweeper(&h);
        let report = sweeper.sweep_before(later()).await.unwrap();
        assert_eq!(report.resolved, 1);

        let row = h
            .ledger
            .repositories()
            .transactions()
            .get_transaction(&txn.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.status, TransactionStatus::Success);
        assert_eq!(
            h.ledger.balance(&election.creator_id).await.unwrap().blocked,
            Money::from_cents(430)
        );

        let again = sweeper.sweep_before(later()).await.unwrap();
        assert_eq!(again.examined, 0);
    }

    #[tokio::test]
    async fn test_expired_checkout_is_cancelled_and_pending_kept() {
        let h = Harness::new().await;
        let election = free_election("el-1", "creator", 500);
        h.directory.upsert(election.clone()).await;
        let (expired, session) = h.start_vote(&election, "voter-1").await;
        h.gateway.set_status(&session.reference, PaymentStatus::Expired);
        let (waiting, _) = h.start_vote(&election, "voter-2").await;

        let report = sweeper(&h).sweep_before(later()).await.unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.still_pending, 1);

        let history = h.history(&election.creator_id).await;
        let status_of = |id| history.iter().find(|t| t.id == id).map(|t| t.status);
        assert_eq!(status_of(expired.id), Some(TransactionStatus::Cancelled));
        assert_eq!(status_of(waiting.id), Some(TransactionStatus::Pending));
        assert_eq!(h.ledger.balance(&election.creator_id).await.unwrap().blocked, Money::ZERO);
    }

    #[tokio::test]
    async fn test_failed_deposit_is_expired() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 100_000, 10);
        h.directory.upsert(election.clone()).await;
        let checkout = h
            .escrow
            .initiate_deposit(&election.id, &AccountId::from("creator"), Money::from_dollars_whole(1000), None)
            .await
            .unwrap();
        let reference = checkout.session.unwrap().reference;
        h.gateway.set_status(&reference, PaymentStatus::Failed);

        // Rien n'est encore périmé
        let early = sweeper(&h)
            .sweep_before(checkout.deposit.created_at)
            .await
            .unwrap();
        assert_eq!(early.examined, 0);

        sweeper(&h).sweep_before(later()).await.unwrap();
        let deposit = h
            .ledger
            .repositories()
            .escrows()
            .get_deposit(&checkout.deposit.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(deposit.status, EscrowStatus::Expired);
    }

    // Test critique: un checkout jamais payé ne reste pas en attente indéfiniment
    #[tokio::test]
    async fn test_open_deposit_is_abandoned_after_max_age() {
        let h = Harness::new().await;
        let election = monetary_election("el-1", "creator", 100_000, 10);
        h.directory.upsert(election.clone()).await;
        let amount = Money::from_dollars_whole(1000);
        let checkout = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap();
        let reference = checkout.session.unwrap().reference;

        // Périmé mais encore dans la fenêtre: on attend
        let report = sweeper(&h).sweep_before(later()).await.unwrap();
        assert_eq!(report.still_pending, 1);

        let report = sweeper(&h)
            .sweep_before(Utc::now() + chrono::Duration::days(365))
            .await
            .unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(report.still_pending, 0);
        assert_eq!(h.gateway.cancelled(), vec![reference.clone()]);
        assert_eq!(h.deposit_status(&checkout.deposit.id).await, EscrowStatus::Expired);

        let readiness = h.escrow.publish_readiness(&election.id).await.unwrap();
        assert_eq!(readiness.state, ReadinessState::DepositRequired);
        let retry = h
            .escrow
            .initiate_deposit(&election.id, &election.creator_id, amount, None)
            .await
            .unwrap();
        assert!(retry.session.is_some_and(|s| s.reference != reference));
    }

    #[tokio::test]
    async fn test_open_vote_checkout_is_cancelled_after_max_age() {
        let h = Harness::new().await;
        let election = free_election("el-1", "creator", 500);
        h.directory.upsert(election.clone()).await;
        let (txn, session) = h.start_vote(&election, "voter-1").await;

        let config = SweeperConfig {
            max_pending_age: Duration::from_secs(2 * 3600),
            ..SweeperConfig::default()
        };
        let sweeper = Sweeper::new(
            config,
            h.ledger.clone(),
            h.gateways.clone(),
            h.escrow.clone(),
            h.reconciler.clone(),
        );
        let report = sweeper
            .sweep_before(Utc::now() + chrono::Duration::hours(2))
            .await
            .unwrap();
        assert_eq!(report.resolved, 1);
        assert_eq!(h.gateway.cancelled(), vec![session.reference]);

        let history = h.history(&election.creator_id).await;
        let row = history.iter().find(|t| t.id == txn.id).unwrap();
        assert_eq!(row.status, TransactionStatus::Cancelled);
        assert_eq!(h.ledger.balance(&election.creator_id).await.unwrap().blocked, Money::ZERO);
    }
}
