//! Domain models for the wallet ledger.
//!
//! These models are storage-agnostic and represent the canonical form of
//! wallet data within the domain layer. Amounts are always [`Money`] (integer
//! cents); dollar floats never enter the domain.

mod money;

pub use money::{BPS_SCALE, Money};

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// =============================================================================
// Identifier Types
// =============================================================================

/// Generates string-backed identifier newtypes for identities owned by other
/// services (users, elections).
macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

/// Generates UUID-backed identifier newtypes for records this service creates.
macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            /// Generate a fresh random identifier.
            pub fn generate() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s).map(Self)
            }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Wallet owner identity, as issued by the auth service.
    AccountId
);

string_id!(
    /// Election identifier, as issued by the election service.
    ElectionId
);

uuid_id!(
    /// Ledger transaction identifier.
    TransactionId
);

uuid_id!(
    /// Escrow deposit identifier.
    DepositId
);

/// Implements `as_str` / `FromStr` / `Display` for a fieldless enum stored as text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(format!("unknown {} '{}'", stringify!($name), other)),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

// =============================================================================
// Balances
// =============================================================================

/// One of the three balance buckets of a wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Bucket {
    /// Spendable funds.
    Available,
    /// Voter fees locked until the election ends.
    Blocked,
    /// Prize-pool deposits held for distribution.
    Escrowed,
}

text_enum!(Bucket {
    Available => "available",
    Blocked => "blocked",
    Escrowed => "escrowed",
});

/// Bucketed balance of a wallet. Every bucket is non-negative.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balance {
    pub available: Money,
    pub blocked: Money,
    pub escrowed: Money,
}

impl Balance {
    pub fn get(&self, bucket: Bucket) -> Money {
        match bucket {
            Bucket::Available => self.available,
            Bucket::Blocked => self.blocked,
            Bucket::Escrowed => self.escrowed,
        }
    }

    fn slot(&mut self, bucket: Bucket) -> &mut Money {
        match bucket {
            Bucket::Available => &mut self.available,
            Bucket::Blocked => &mut self.blocked,
            Bucket::Escrowed => &mut self.escrowed,
        }
    }

    /// Total economic claim of the account.
    pub fn total(&self) -> Money {
        self.available + self.blocked + self.escrowed
    }

    /// Apply the bucket movement of a transaction.
    ///
    /// Returns the bucket that would go negative (or overflow) on failure.
    pub fn apply(&self, txn: &Transaction) -> Result<Balance, Bucket> {
        let mut next = *self;
        if let Some(bucket) = txn.debit {
            let slot = next.slot(bucket);
            *slot = slot
                .checked_sub(txn.amount)
                .filter(|m| !m.is_negative())
                .ok_or(bucket)?;
        }
        if let Some(bucket) = txn.credit {
            let slot = next.slot(bucket);
            *slot = slot.checked_add(txn.amount).ok_or(bucket)?;
        }
        Ok(next)
    }
}

/// A user's wallet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletAccount {
    pub id: AccountId,
    pub balance: Balance,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WalletAccount {
    /// Empty wallet, created on first activity.
    pub fn open(id: AccountId) -> Self {
        let now = Utc::now();
        Self {
            id,
            balance: Balance::default(),
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// Gateways
// =============================================================================

/// External payment processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gateway {
    Stripe,
    Paddle,
    /// Local processor used in demo mode and tests.
    Sandbox,
}

text_enum!(Gateway {
    Stripe => "stripe",
    Paddle => "paddle",
    Sandbox => "sandbox",
});

// =============================================================================
// Transactions
// =============================================================================

/// Kind of ledger transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    VoterFeePayment,
    FeeRelease,
    Withdrawal,
    PrizeDistribution,
    EscrowDeposit,
    EscrowReturn,
    Refund,
    /// Wallet top-up through a gateway checkout.
    Deposit,
}

text_enum!(TransactionKind {
    VoterFeePayment => "voter_fee_payment",
    FeeRelease => "fee_release",
    Withdrawal => "withdrawal",
    PrizeDistribution => "prize_distribution",
    EscrowDeposit => "escrow_deposit",
    EscrowReturn => "escrow_return",
    Refund => "refund",
    Deposit => "deposit",
});

/// Lifecycle status of a transaction.
///
/// Only `Pending` is mutable, and only towards one terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Success,
    Failed,
    Cancelled,
    Refunded,
}

text_enum!(TransactionStatus {
    Pending => "pending",
    Success => "success",
    Failed => "failed",
    Cancelled => "cancelled",
    Refunded => "refunded",
});

impl TransactionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Structured fee split of a gross payment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeBreakdown {
    pub gross_amount: Money,
    pub gateway_fee: Money,
    pub platform_fee: Money,
    pub net_amount: Money,
}

impl FeeBreakdown {
    /// Breakdown of an amount that carries no fees.
    pub fn flat(amount: Money) -> Self {
        Self {
            gross_amount: amount,
            gateway_fee: Money::ZERO,
            platform_fee: Money::ZERO,
            net_amount: amount,
        }
    }

    /// `net + gateway_fee + platform_fee == gross`.
    pub fn is_balanced(&self) -> bool {
        self.net_amount + self.gateway_fee + self.platform_fee == self.gross_amount
    }
}

impl std::ops::Add for FeeBreakdown {
    type Output = FeeBreakdown;

    fn add(self, rhs: FeeBreakdown) -> FeeBreakdown {
        FeeBreakdown {
            gross_amount: self.gross_amount + rhs.gross_amount,
            gateway_fee: self.gateway_fee + rhs.gateway_fee,
            platform_fee: self.platform_fee + rhs.platform_fee,
            net_amount: self.net_amount + rhs.net_amount,
        }
    }
}

/// Immutable ledger record of one balance movement on one account.
///
/// `debit` and `credit` name the buckets moved on `account_id`. A transaction
/// with neither only records an external fact (e.g. a withdrawal awaiting
/// approval). Movements take effect when the transaction is `Success`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    /// Paying party when it differs from the account (voter of a voter fee).
    pub payer_id: Option<AccountId>,
    pub kind: TransactionKind,
    pub amount: Money,
    pub debit: Option<Bucket>,
    pub credit: Option<Bucket>,
    pub gross_amount: Money,
    pub gateway_fee: Money,
    pub platform_fee: Money,
    pub net_amount: Money,
    pub status: TransactionStatus,
    pub election_id: Option<ElectionId>,
    pub deposit_id: Option<DepositId>,
    pub gateway: Option<Gateway>,
    pub gateway_reference: Option<String>,
    pub description: String,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Transaction {
    /// New successful transaction with no movement and a flat breakdown.
    pub fn new(account_id: AccountId, kind: TransactionKind, amount: Money) -> Self {
        let now = Utc::now();
        Self {
            id: TransactionId::generate(),
            account_id,
            payer_id: None,
            kind,
            amount,
            debit: None,
            credit: None,
            gross_amount: amount,
            gateway_fee: Money::ZERO,
            platform_fee: Money::ZERO,
            net_amount: amount,
            status: TransactionStatus::Success,
            election_id: None,
            deposit_id: None,
            gateway: None,
            gateway_reference: None,
            description: String::new(),
            details: serde_json::Value::Null,
            created_at: now,
            resolved_at: Some(now),
        }
    }

    pub fn with_id(mut self, id: TransactionId) -> Self {
        self.id = id;
        self
    }

    pub fn credit_to(mut self, bucket: Bucket) -> Self {
        self.credit = Some(bucket);
        self
    }

    pub fn debit_from(mut self, bucket: Bucket) -> Self {
        self.debit = Some(bucket);
        self
    }

    pub fn pending(mut self) -> Self {
        self.status = TransactionStatus::Pending;
        self.resolved_at = None;
        self
    }

    pub fn with_status(mut self, status: TransactionStatus) -> Self {
        self.status = status;
        self.resolved_at = status.is_terminal().then_some(self.created_at);
        self
    }

    pub fn with_fees(mut self, fees: FeeBreakdown) -> Self {
        self.gross_amount = fees.gross_amount;
        self.gateway_fee = fees.gateway_fee;
        self.platform_fee = fees.platform_fee;
        self.net_amount = fees.net_amount;
        self
    }

    pub fn paid_by(mut self, payer: AccountId) -> Self {
        self.payer_id = Some(payer);
        self
    }

    pub fn for_election(mut self, election_id: ElectionId) -> Self {
        self.election_id = Some(election_id);
        self
    }

    pub fn for_deposit(mut self, deposit_id: DepositId) -> Self {
        self.deposit_id = Some(deposit_id);
        self
    }

    pub fn via(mut self, gateway: Gateway, reference: impl Into<String>) -> Self {
        self.gateway = Some(gateway);
        self.gateway_reference = Some(reference.into());
        self
    }

    pub fn described(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    /// Typed fee breakdown carried by this transaction.
    pub fn fees(&self) -> FeeBreakdown {
        FeeBreakdown {
            gross_amount: self.gross_amount,
            gateway_fee: self.gateway_fee,
            platform_fee: self.platform_fee,
            net_amount: self.net_amount,
        }
    }

    /// Whether this transaction moves money on its account.
    pub fn moves_funds(&self) -> bool {
        self.debit.is_some() || self.credit.is_some()
    }

    /// Signed effect on the account's total claim (credits positive).
    pub fn signed_amount(&self) -> i64 {
        match (self.debit, self.credit) {
            (Some(_), None) => -self.amount.cents(),
            (None, Some(_)) => self.amount.cents(),
            _ => 0,
        }
    }
}

// =============================================================================
// Escrow
// =============================================================================

/// Lifecycle status of a prize-pool deposit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Completed,
    Distributed,
    Returned,
    /// Checkout abandoned or failed; a new deposit may be started.
    Expired,
}

text_enum!(EscrowStatus {
    Pending => "pending",
    Completed => "completed",
    Distributed => "distributed",
    Returned => "returned",
    Expired => "expired",
});

impl EscrowStatus {
    /// Live deposits block a second deposit for the same (election, creator).
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Pending | Self::Completed)
    }
}

/// Creator-funded prize pool held in escrow for one election.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscrowDeposit {
    pub id: DepositId,
    pub election_id: ElectionId,
    pub creator_id: AccountId,
    pub amount: Money,
    pub gateway: Gateway,
    pub status: EscrowStatus,
    pub checkout_reference: Option<String>,
    pub gateway_payment_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

// =============================================================================
// Settlement
// =============================================================================

/// How an election's blocked voter fees were settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SettlementOutcome {
    /// Released to the creator's available balance.
    Released,
    /// Refunded to the voters (election cancelled).
    Refunded,
}

text_enum!(SettlementOutcome {
    Released => "released",
    Refunded => "refunded",
});

/// Per-election marker proving voter fees were settled exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElectionSettlement {
    pub election_id: ElectionId,
    pub creator_id: AccountId,
    pub outcome: SettlementOutcome,
    pub amount: Money,
    pub participant_count: u32,
    pub settled_at: DateTime<Utc>,
}

/// Derived view: voter fees locked for one election.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockedFunds {
    pub election_id: ElectionId,
    pub participant_count: u32,
    /// Average net fee per participant (fees can differ per region).
    pub fee_per_participant: Money,
    pub total_locked: Money,
    pub oldest_payment_at: DateTime<Utc>,
}

/// Aggregate wallet totals for the analytics view.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WalletAnalytics {
    pub total_deposits: Money,
    pub total_withdrawals: Money,
    pub pending_withdrawals: Money,
    pub total_prizes: Money,
    pub total_election_fees_earned: Money,
    pub total_election_fees_paid: Money,
    pub total_refunds: Money,
    pub transaction_count: u64,
}

/// Record of a processed gateway webhook event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookReceipt {
    pub gateway: Gateway,
    pub event_id: String,
    pub received_at: DateTime<Utc>,
}

// =============================================================================
// Checkout metadata
// =============================================================================

/// What a gateway checkout pays for.
///
/// Embedded in the checkout's metadata at creation time and read back from
/// the gateway's callback to route the payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "purpose", rename_all = "snake_case")]
pub enum CheckoutPurpose {
    ElectionFee {
        transaction_id: TransactionId,
        election_id: ElectionId,
        voter_id: AccountId,
        creator_id: AccountId,
        region: String,
    },
    PrizePool {
        deposit_id: DepositId,
        election_id: ElectionId,
        creator_id: AccountId,
    },
    WalletDeposit {
        transaction_id: TransactionId,
        account_id: AccountId,
    },
}

impl CheckoutPurpose {
    /// Flatten into the string map gateways accept as metadata.
    pub fn to_metadata(&self) -> BTreeMap<String, String> {
        let Ok(serde_json::Value::Object(map)) = serde_json::to_value(self) else {
            return BTreeMap::new();
        };
        map.into_iter()
            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
            .collect()
    }

    /// Parse back from gateway metadata. Unknown keys are ignored.
    pub fn from_metadata(metadata: &BTreeMap<String, String>) -> Option<Self> {
        let map: serde_json::Map<String, serde_json::Value> = metadata
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        serde_json::from_value(serde_json::Value::Object(map)).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn txn(amount: i64) -> Transaction {
        Transaction::new(
            AccountId::from("alice"),
            TransactionKind::Deposit,
            Money::from_cents(amount),
        )
    }

    // Test critique: aucun bucket ne peut devenir négatif
    #[test]
    fn test_balance_apply_rejects_negative_bucket() {
        let balance = Balance {
            available: Money::from_cents(100),
            ..Default::default()
        };

        let ok = balance.apply(&txn(100).debit_from(Bucket::Available)).unwrap();
        assert_eq!(ok.available, Money::ZERO);

        let err = balance.apply(&txn(101).debit_from(Bucket::Available));
        assert_eq!(err, Err(Bucket::Available));
    }

    #[test]
    fn test_balance_transfer_preserves_total() {
        let balance = Balance {
            blocked: Money::from_cents(430),
            ..Default::default()
        };
        let release = txn(430)
            .debit_from(Bucket::Blocked)
            .credit_to(Bucket::Available);
        let after = balance.apply(&release).unwrap();
        assert_eq!(after.total(), balance.total());
        assert_eq!(after.available, Money::from_cents(430));
        assert_eq!(after.blocked, Money::ZERO);
    }

    #[test]
    fn test_checkout_purpose_metadata_roundtrip() {
        let purpose = CheckoutPurpose::ElectionFee {
            transaction_id: TransactionId::generate(),
            election_id: ElectionId::from("el-1"),
            voter_id: AccountId::from("voter"),
            creator_id: AccountId::from("creator"),
            region: "us".into(),
        };
        let metadata = purpose.to_metadata();
        assert_eq!(metadata.get("purpose").map(String::as_str), Some("election_fee"));
        assert_eq!(CheckoutPurpose::from_metadata(&metadata), Some(purpose));
    }

    #[test]
    fn test_checkout_purpose_ignores_foreign_metadata() {
        let mut metadata = BTreeMap::new();
        metadata.insert("campaign".to_string(), "spring".to_string());
        assert_eq!(CheckoutPurpose::from_metadata(&metadata), None);
    }

    #[test]
    fn test_text_enums_parse_their_own_output() {
        for kind in [TransactionKind::VoterFeePayment, TransactionKind::EscrowReturn] {
            assert_eq!(kind.as_str().parse::<TransactionKind>(), Ok(kind));
        }
        assert!("settled".parse::<EscrowStatus>().is_err());
    }
}
