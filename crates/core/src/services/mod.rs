//! Business services for the wallet.

mod escrow;
mod fees;
mod ledger;
mod locks;
mod reconcile;
mod settlement;
mod sweeper;
mod wallet;

pub use escrow::*;
pub use fees::*;
pub use ledger::*;
pub use locks::*;
pub use reconcile::*;
pub use settlement::*;
pub use sweeper::*;
pub use wallet::*;

/// Shared fixtures for service tests.
#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::error::{GatewayError, GatewayResult};
    use crate::memory::{MemoryDirectory, MemoryStore};
    use crate::models::{
        AccountId, ElectionId, EscrowDeposit, EscrowStatus, Gateway, Money, Transaction,
    };
    use crate::ports::{
        CheckoutRequest, CheckoutSession, ElectionDirectory, ElectionInfo, ElectionStatus,
        GatewayEvent, GatewayEventKind, GatewayRegistry, OrderDirection, PageRequest,
        PaymentGateway, PaymentLookup, PaymentStatus, Pricing, PrizeConfig, Repositories,
        RewardType, TransactionFilter,
    };

    struct Checkout {
        amount: Money,
        metadata: BTreeMap<String, String>,
        status: PaymentStatus,
    }

    /// Sandbox processor whose payment statuses are set by the test.
    #[derive(Default)]
    pub struct ScriptedGateway {
        next: AtomicU64,
        checkouts: Mutex<HashMap<String, Checkout>>,
        cancelled: Mutex<Vec<String>>,
    }

    impl ScriptedGateway {
        pub fn set_status(&self, reference: &str, status: PaymentStatus) {
            if let Some(c) = self.checkouts.lock().unwrap().get_mut(reference) {
                c.status = status;
            }
        }

        /// References the sweeper or escrow asked the processor to cancel.
        pub fn cancelled(&self) -> Vec<String> {
            self.cancelled.lock().unwrap().clone()
        }

        pub fn metadata_of(&self, reference: &str) -> BTreeMap<String, String> {
            self.checkouts
                .lock()
                .unwrap()
                .get(reference)
                .map(|c| c.metadata.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        fn kind(&self) -> Gateway {
            Gateway::Sandbox
        }

        async fn create_checkout(&self, request: CheckoutRequest) -> GatewayResult<CheckoutSession> {
            let reference = format!("ref_{}", self.next.fetch_add(1, Ordering::SeqCst) + 1);
            self.checkouts.lock().unwrap().insert(
                reference.clone(),
                Checkout {
                    amount: request.amount,
                    metadata: request.purpose.to_metadata(),
                    status: PaymentStatus::Pending,
                },
            );
            Ok(CheckoutSession {
                gateway: Gateway::Sandbox,
                reference,
                client_secret: None,
                checkout_url: None,
            })
        }

        async fn payment_status(&self, reference: &str) -> GatewayResult<PaymentLookup> {
            let checkouts = self.checkouts.lock().unwrap();
            let checkout = checkouts
                .get(reference)
                .ok_or_else(|| GatewayError::MalformedPayload(format!("unknown {reference}")))?;
            Ok(PaymentLookup {
                reference: reference.to_string(),
                status: checkout.status.clone(),
                amount: checkout.amount,
                metadata: checkout.metadata.clone(),
            })
        }

        async fn resume_checkout(&self, reference: &str) -> GatewayResult<CheckoutSession> {
            if !self.checkouts.lock().unwrap().contains_key(reference) {
                return Err(GatewayError::MalformedPayload(format!("unknown {reference}")));
            }
            Ok(CheckoutSession {
                gateway: Gateway::Sandbox,
                reference: reference.to_string(),
                client_secret: Some(format!("{reference}_secret")),
                checkout_url: None,
            })
        }

        async fn cancel_payment(&self, reference: &str) -> GatewayResult<()> {
            self.cancelled.lock().unwrap().push(reference.to_string());
            let mut checkouts = self.checkouts.lock().unwrap();
            match checkouts.get_mut(reference) {
                Some(c) if c.status == PaymentStatus::Pending => {
                    c.status = PaymentStatus::Expired;
                    Ok(())
                }
                Some(_) => Err(GatewayError::Api {
                    gateway: Gateway::Sandbox,
                    status: 409,
                    message: format!("{reference} is no longer open"),
                }),
                None => Err(GatewayError::MalformedPayload(format!("unknown {reference}"))),
            }
        }

        fn parse_webhook(&self, _: &[u8], _: Option<&str>) -> GatewayResult<GatewayEvent> {
            Err(GatewayError::MalformedPayload("scripted gateway".to_string()))
        }
    }

    /// Fully wired services over the in-memory store.
    pub struct Harness {
        pub directory: Arc<MemoryDirectory>,
        pub gateway: Arc<ScriptedGateway>,
        pub gateways: Arc<GatewayRegistry>,
        pub ledger: Arc<Ledger>,
        pub escrow: Arc<EscrowManager>,
        pub settlement: SettlementScheduler,
        pub reconciler: Arc<Reconciler>,
        pub wallet: WalletService,
    }

    impl Harness {
        pub async fn new() -> Self {
            let store: Arc<dyn Repositories> = Arc::new(MemoryStore::new());
            let directory = Arc::new(MemoryDirectory::new());
            let gateway = Arc::new(ScriptedGateway::default());
            let mut registry = GatewayRegistry::new();
            registry.register(gateway.clone());
            let gateways = Arc::new(registry);

            let ledger = Arc::new(Ledger::new(store, Duration::from_secs(2)));
            let elections: Arc<dyn ElectionDirectory> = directory.clone();
            let escrow = Arc::new(EscrowManager::new(
                ledger.clone(),
                gateways.clone(),
                elections.clone(),
            ));
            let fees = FeeSchedule::default();
            let reconciler = Arc::new(Reconciler::new(ledger.clone(), escrow.clone(), fees.clone()));
            let settlement =
                SettlementScheduler::new(ledger.clone(), escrow.clone(), elections.clone());
            let wallet = WalletService::new(
                ledger.clone(),
                gateways.clone(),
                elections,
                escrow.clone(),
                reconciler.clone(),
                fees,
                WithdrawalPolicy::default(),
            );

            Self {
                directory,
                gateway,
                gateways,
                ledger,
                escrow,
                settlement,
                reconciler,
                wallet,
            }
        }

        /// Initiate and confirm the election's prize-pool deposit.
        pub async fn funded_deposit(&self, election: &ElectionInfo) -> EscrowDeposit {
            let amount = election.prize.as_ref().map(|p| p.amount).unwrap();
            let checkout = self
                .escrow
                .initiate_deposit(&election.id, &election.creator_id, amount, None)
                .await
                .unwrap();
            let reference = checkout.session.unwrap().reference;
            self.gateway.set_status(&reference, PaymentStatus::Succeeded);
            self.escrow
                .confirm_deposit(&checkout.deposit.id, &reference, Some(amount), None)
                .await
                .unwrap()
        }

        /// Open a participation checkout for `voter`.
        pub async fn start_vote(
            &self,
            election: &ElectionInfo,
            voter: &str,
        ) -> (Transaction, CheckoutSession) {
            match self
                .wallet
                .pay_election(&AccountId::from(voter), &election.id, "us", None)
                .await
                .unwrap()
            {
                ElectionPayment::Checkout {
                    transaction,
                    session,
                    ..
                } => (transaction, session),
                ElectionPayment::AlreadyPaid(_) => panic!("{voter} already paid"),
            }
        }

        /// Participation paid and delivered by webhook.
        pub async fn paid_vote(&self, election: &ElectionInfo, voter: &str) -> Transaction {
            let (_, session) = self.start_vote(election, voter).await;
            self.gateway
                .set_status(&session.reference, PaymentStatus::Succeeded);
            let lookup = self.gateway.payment_status(&session.reference).await.unwrap();
            let event = GatewayEvent {
                gateway: Gateway::Sandbox,
                event_id: Some(format!("evt_{}", session.reference)),
                kind: GatewayEventKind::PaymentSucceeded,
                payment_id: session.reference.clone(),
                amount: lookup.amount,
                metadata: lookup.metadata,
            };
            match self.reconciler.reconcile(event).await.unwrap() {
                ReconciliationResult::Recorded(txn) => txn,
                other => panic!("unexpected reconciliation {}", other.label()),
            }
        }

        pub async fn deposit_status(&self, id: &crate::models::DepositId) -> EscrowStatus {
            self.ledger
                .repositories()
                .escrows()
                .get_deposit(id)
                .await
                .unwrap()
                .unwrap()
                .status
        }

        /// Every row of an account, newest first.
        pub async fn history(&self, account: &AccountId) -> Vec<Transaction> {
            self.ledger
                .repositories()
                .transactions()
                .list_transactions(
                    account,
                    TransactionFilter::default(),
                    PageRequest::new(Some(1), Some(100)),
                    OrderDirection::Desc,
                )
                .await
                .unwrap()
                .items
        }
    }

    pub fn monetary_election(id: &str, creator: &str, prize_cents: i64, winners: u32) -> ElectionInfo {
        ElectionInfo {
            id: ElectionId::from(id),
            creator_id: AccountId::from(creator),
            title: format!("Election {id}"),
            status: ElectionStatus::Active,
            pricing: Pricing::default(),
            prize: Some(PrizeConfig {
                reward_type: RewardType::Monetary,
                amount: Money::from_cents(prize_cents),
                winner_count: winners,
            }),
        }
    }

    pub fn free_election(id: &str, creator: &str, fee_cents: i64) -> ElectionInfo {
        ElectionInfo {
            id: ElectionId::from(id),
            creator_id: AccountId::from(creator),
            title: format!("Election {id}"),
            status: ElectionStatus::Active,
            pricing: Pricing {
                fee_by_region: BTreeMap::new(),
                default_fee: Some(Money::from_cents(fee_cents)),
            },
            prize: None,
        }
    }
}
