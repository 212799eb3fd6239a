//! Request and response bodies.
//!
//! Amounts cross the API as dollars; the ledger stores cents. Field names are
//! camelCase to match the web client.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use electa_core::models::{
    Balance, EscrowDeposit, FeeBreakdown, Gateway, LockedFunds, Money, Transaction,
    TransactionKind, TransactionStatus, WalletAnalytics,
};
use electa_core::ports::{CheckoutSession, FlowDirection, Page, PageRequest, TransactionFilter};
use electa_core::services::{EscrowSettlement, FeeSettlement, PublishReadiness, SettlementReport};

use crate::error::{ApiError, ApiResult};

pub const CURRENCY: &str = "USD";

/// Convert a client amount to cents.
pub fn parse_amount(dollars: f64) -> ApiResult<Money> {
    Money::from_dollars(dollars)
        .ok_or_else(|| ApiError::BadRequest(format!("invalid amount {dollars}")))
}

fn parse_text<T: FromStr<Err = String>>(field: &str, value: &str) -> ApiResult<T> {
    value
        .trim()
        .to_ascii_lowercase()
        .replace('-', "_")
        .parse()
        .map_err(|e| ApiError::BadRequest(format!("invalid {field}: {e}")))
}

// =============================================================================
// Balances
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub balance: f64,
    pub blocked_balance: f64,
    pub escrowed_balance: f64,
    pub total_balance: f64,
    pub currency: &'static str,
}

impl From<Balance> for BalanceResponse {
    fn from(balance: Balance) -> Self {
        Self {
            balance: balance.available.as_dollars(),
            blocked_balance: balance.blocked.as_dollars(),
            escrowed_balance: balance.escrowed.as_dollars(),
            total_balance: balance.total().as_dollars(),
            currency: CURRENCY,
        }
    }
}

// =============================================================================
// Transactions
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionDto {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub amount: f64,
    pub gross_amount: f64,
    pub gateway_fee: f64,
    pub platform_fee: f64,
    pub net_amount: f64,
    pub status: &'static str,
    pub election_id: Option<String>,
    pub deposit_id: Option<String>,
    pub payment_gateway: Option<Gateway>,
    pub payment_id: Option<String>,
    pub description: String,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl From<Transaction> for TransactionDto {
    fn from(txn: Transaction) -> Self {
        Self {
            id: txn.id.to_string(),
            kind: txn.kind.as_str(),
            amount: txn.amount.as_dollars(),
            gross_amount: txn.gross_amount.as_dollars(),
            gateway_fee: txn.gateway_fee.as_dollars(),
            platform_fee: txn.platform_fee.as_dollars(),
            net_amount: txn.net_amount.as_dollars(),
            status: txn.status.as_str(),
            election_id: txn.election_id.map(|e| e.to_string()),
            deposit_id: txn.deposit_id.map(|d| d.to_string()),
            payment_gateway: txn.gateway,
            payment_id: txn.gateway_reference,
            description: txn.description,
            created_at: txn.created_at,
            resolved_at: txn.resolved_at,
        }
    }
}

/// `GET /wallet/transactions` query string.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub status: Option<String>,
    /// `incoming`, `outgoing` or `all`.
    pub filter_type: Option<String>,
    pub election_id: Option<String>,
}

impl TransactionQuery {
    pub fn page(&self) -> PageRequest {
        PageRequest::new(self.page, self.limit)
    }

    pub fn filter(&self) -> ApiResult<TransactionFilter> {
        let kind = match self.kind.as_deref().filter(|k| !k.is_empty() && *k != "all") {
            Some(k) => Some(parse_text::<TransactionKind>("type", k)?),
            None => None,
        };
        let status = match self.status.as_deref().filter(|s| !s.is_empty() && *s != "all") {
            Some(s) => Some(parse_text::<TransactionStatus>("status", s)?),
            None => None,
        };
        let direction = match self.filter_type.as_deref().map(str::to_ascii_lowercase).as_deref() {
            None | Some("") | Some("all") => None,
            Some("incoming") => Some(FlowDirection::Incoming),
            Some("outgoing") => Some(FlowDirection::Outgoing),
            Some(other) => {
                return Err(ApiError::BadRequest(format!("invalid filterType: {other}")));
            }
        };
        Ok(TransactionFilter {
            kind,
            status,
            election_id: self.election_id.clone().map(Into::into),
            direction,
        })
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Pagination {
    pub page: u32,
    pub limit: u32,
    pub total: u64,
    pub total_pages: u64,
}

#[derive(Debug, Serialize)]
pub struct TransactionPage {
    pub transactions: Vec<TransactionDto>,
    pub pagination: Pagination,
}

impl From<Page<Transaction>> for TransactionPage {
    fn from(page: Page<Transaction>) -> Self {
        let pagination = Pagination {
            page: page.page,
            limit: page.limit,
            total: page.total,
            total_pages: page.total_pages(),
        };
        Self {
            transactions: page.items.into_iter().map(Into::into).collect(),
            pagination,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsResponse {
    pub total_deposits: f64,
    pub total_withdrawals: f64,
    pub pending_withdrawals: f64,
    pub total_prizes: f64,
    pub total_election_fees_earned: f64,
    pub total_election_fees_paid: f64,
    pub total_refunds: f64,
    pub transaction_count: u64,
}

impl From<WalletAnalytics> for AnalyticsResponse {
    fn from(a: WalletAnalytics) -> Self {
        Self {
            total_deposits: a.total_deposits.as_dollars(),
            total_withdrawals: a.total_withdrawals.as_dollars(),
            pending_withdrawals: a.pending_withdrawals.as_dollars(),
            total_prizes: a.total_prizes.as_dollars(),
            total_election_fees_earned: a.total_election_fees_earned.as_dollars(),
            total_election_fees_paid: a.total_election_fees_paid.as_dollars(),
            total_refunds: a.total_refunds.as_dollars(),
            transaction_count: a.transaction_count,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedAccount {
    pub election_id: String,
    pub participant_count: u32,
    pub fee_per_participant: f64,
    pub total_locked: f64,
    pub locked_since: DateTime<Utc>,
}

impl From<LockedFunds> for BlockedAccount {
    fn from(l: LockedFunds) -> Self {
        Self {
            election_id: l.election_id.to_string(),
            participant_count: l.participant_count,
            fee_per_participant: l.fee_per_participant.as_dollars(),
            total_locked: l.total_locked.as_dollars(),
            locked_since: l.oldest_payment_at,
        }
    }
}

// =============================================================================
// Withdrawals
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawRequest {
    pub amount: f64,
    pub payment_method: String,
    #[serde(default)]
    pub payment_details: serde_json::Value,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WithdrawResponse {
    pub transaction: TransactionDto,
    pub requires_approval: bool,
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FeeDto {
    pub gross_amount: f64,
    pub gateway_fee: f64,
    pub platform_fee: f64,
    pub net_amount: f64,
}

impl From<FeeBreakdown> for FeeDto {
    fn from(f: FeeBreakdown) -> Self {
        Self {
            gross_amount: f.gross_amount.as_dollars(),
            gateway_fee: f.gateway_fee.as_dollars(),
            platform_fee: f.platform_fee.as_dollars(),
            net_amount: f.net_amount.as_dollars(),
        }
    }
}

/// Checkout fields the client needs to complete a payment.
#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckoutDto {
    pub payment_gateway: Option<Gateway>,
    pub payment_id: Option<String>,
    pub client_secret: Option<String>,
    pub checkout_url: Option<String>,
}

impl From<CheckoutSession> for CheckoutDto {
    fn from(s: CheckoutSession) -> Self {
        Self {
            payment_gateway: Some(s.gateway),
            payment_id: Some(s.reference),
            client_secret: s.client_secret,
            checkout_url: s.checkout_url,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayElectionRequest {
    pub election_id: String,
    pub region_code: String,
    pub payment_gateway: Option<Gateway>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PayElectionResponse {
    pub already_paid: bool,
    pub transaction: TransactionDto,
    #[serde(flatten)]
    pub checkout: CheckoutDto,
    pub fees: Option<FeeDto>,
}

/// Client-side confirmation after the checkout completed.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPaymentRequest {
    #[serde(alias = "paymentIntentId", alias = "transactionId")]
    pub payment_id: String,
    pub payment_gateway: Option<Gateway>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositRequest {
    pub amount: f64,
    pub payment_gateway: Option<Gateway>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositResponse {
    pub transaction: TransactionDto,
    #[serde(flatten)]
    pub checkout: CheckoutDto,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmationResponse {
    pub confirmed: bool,
    pub transaction: TransactionDto,
}

// =============================================================================
// Prize pools
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EscrowDepositDto {
    pub id: String,
    pub election_id: String,
    pub amount: f64,
    pub status: &'static str,
    pub payment_gateway: Gateway,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl From<EscrowDeposit> for EscrowDepositDto {
    fn from(d: EscrowDeposit) -> Self {
        Self {
            id: d.id.to_string(),
            election_id: d.election_id.to_string(),
            amount: d.amount.as_dollars(),
            status: d.status.as_str(),
            payment_gateway: d.gateway,
            created_at: d.created_at,
            completed_at: d.completed_at,
            settled_at: d.settled_at,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FundPrizePoolRequest {
    pub election_id: String,
    pub amount: f64,
    pub payment_gateway: Option<Gateway>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FundPrizePoolResponse {
    pub deposit: EscrowDepositDto,
    #[serde(flatten)]
    pub checkout: CheckoutDto,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmPrizePoolRequest {
    pub deposit_id: String,
}

// =============================================================================
// Internal routes
// =============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SettleRequest {
    Completed {
        #[serde(default)]
        winners: Vec<String>,
    },
    Cancelled,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementResponse {
    pub election_id: String,
    pub fees: serde_json::Value,
    pub escrow: serde_json::Value,
}

impl From<SettlementReport> for SettlementResponse {
    fn from(report: SettlementReport) -> Self {
        use serde_json::json;

        let fees = match report.fees {
            FeeSettlement::Released { amount, participants } => {
                json!({ "result": "released", "amount": amount.as_dollars(), "participants": participants })
            }
            FeeSettlement::Refunded { amount, participants } => {
                json!({ "result": "refunded", "amount": amount.as_dollars(), "participants": participants })
            }
            FeeSettlement::AlreadySettled => json!({ "result": "already_settled" }),
        };
        let escrow = match report.escrow {
            EscrowSettlement::NoDeposit => json!({ "result": "no_deposit" }),
            EscrowSettlement::Distributed { share, winners, returned } => json!({
                "result": "distributed",
                "share": share.as_dollars(),
                "winners": winners,
                "returned": returned.as_dollars(),
            }),
            EscrowSettlement::Returned { amount } => {
                json!({ "result": "returned", "amount": amount.as_dollars() })
            }
            EscrowSettlement::Expired => json!({ "result": "expired" }),
        };
        Self {
            election_id: report.election_id.to_string(),
            fees,
            escrow,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadinessResponse {
    pub election_id: String,
    pub state: electa_core::services::ReadinessState,
    pub can_publish: bool,
    pub required_amount: f64,
    pub deposit: Option<EscrowDepositDto>,
}

impl From<PublishReadiness> for ReadinessResponse {
    fn from(r: PublishReadiness) -> Self {
        Self {
            election_id: r.election_id.to_string(),
            can_publish: r.state == electa_core::services::ReadinessState::Ready,
            state: r.state,
            required_amount: r.required_amount.as_dollars(),
            deposit: r.deposit.map(Into::into),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dollar_conversion() {
        assert_eq!(parse_amount(4.3).unwrap(), Money::from_cents(430));
        assert_eq!(parse_amount(1000.0).unwrap(), Money::from_dollars_whole(1000));
        assert!(parse_amount(f64::NAN).is_err());
    }

    #[test]
    fn test_transaction_query_filter() {
        let query = TransactionQuery {
            kind: Some("voter-fee-payment".into()),
            status: Some("success".into()),
            filter_type: Some("Outgoing".into()),
            ..Default::default()
        };
        let filter = query.filter().unwrap();
        assert_eq!(filter.kind, Some(TransactionKind::VoterFeePayment));
        assert_eq!(filter.status, Some(TransactionStatus::Success));
        assert_eq!(filter.direction, Some(FlowDirection::Outgoing));

        let all = TransactionQuery {
            kind: Some("all".into()),
            filter_type: Some("all".into()),
            ..Default::default()
        };
        let filter = all.filter().unwrap();
        assert!(filter.kind.is_none() && filter.direction.is_none());

        let bad = TransactionQuery {
            filter_type: Some("sideways".into()),
            ..Default::default()
        };
        assert!(bad.filter().is_err());
    }

    #[test]
    fn test_settle_request_shapes() {
        let completed: SettleRequest =
            serde_json::from_str(r#"{"outcome":"completed","winners":["a","b"]}"#).unwrap();
        assert!(matches!(completed, SettleRequest::Completed { winners } if winners.len() == 2));
        let cancelled: SettleRequest = serde_json::from_str(r#"{"outcome":"cancelled"}"#).unwrap();
        assert!(matches!(cancelled, SettleRequest::Cancelled));
    }
}
