//! Wallet owner routes.

use axum::extract::{Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use electa_core::models::{ElectionId, TransactionStatus};
use electa_core::services::{ElectionPayment, WithdrawalOutcome, WithdrawalRequest};

use crate::auth::AuthUser;
use crate::error::ApiResult;
use crate::state::ApiState;
use crate::types::{
    AnalyticsResponse, BalanceResponse, BlockedAccount, CheckoutDto, ConfirmPaymentRequest,
    ConfirmationResponse, DepositRequest, DepositResponse, PayElectionRequest,
    PayElectionResponse, TransactionPage, TransactionQuery, WithdrawRequest, WithdrawResponse,
    parse_amount,
};

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/wallet", get(balance))
        .route("/wallet/transactions", get(transactions))
        .route("/wallet/analytics", get(analytics))
        .route("/wallet/blocked-accounts", get(blocked_accounts))
        .route("/wallet/withdraw", post(withdraw))
        .route("/wallet/pay-election", post(pay_election))
        .route("/wallet/election-payment/confirm", post(confirm_election_payment))
        .route("/wallet/deposit", post(deposit))
        .route("/wallet/deposit/confirm", post(confirm_deposit))
}

async fn balance(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<BalanceResponse>> {
    let balance = state.wallet.balance(&user.account_id).await?;
    Ok(Json(balance.into()))
}

async fn transactions(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
    Query(query): Query<TransactionQuery>,
) -> ApiResult<Json<TransactionPage>> {
    let page = state
        .wallet
        .transactions(&user.account_id, query.filter()?, query.page())
        .await?;
    Ok(Json(page.into()))
}

async fn analytics(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<AnalyticsResponse>> {
    let analytics = state.wallet.analytics(&user.account_id).await?;
    Ok(Json(analytics.into()))
}

async fn blocked_accounts(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
) -> ApiResult<Json<Vec<BlockedAccount>>> {
    let locked = state.wallet.blocked_accounts(&user.account_id).await?;
    Ok(Json(locked.into_iter().map(Into::into).collect()))
}

async fn withdraw(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
    Json(body): Json<WithdrawRequest>,
) -> ApiResult<Json<WithdrawResponse>> {
    let request = WithdrawalRequest {
        amount: parse_amount(body.amount)?,
        method: body.payment_method,
        details: body.payment_details,
    };
    let response = match state.wallet.withdraw(&user.account_id, request).await? {
        WithdrawalOutcome::Completed(txn) => WithdrawResponse {
            transaction: txn.into(),
            requires_approval: false,
        },
        WithdrawalOutcome::AwaitingApproval(txn) => WithdrawResponse {
            transaction: txn.into(),
            requires_approval: true,
        },
    };
    Ok(Json(response))
}

async fn pay_election(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
    Json(body): Json<PayElectionRequest>,
) -> ApiResult<Json<PayElectionResponse>> {
    let election_id = ElectionId::new(body.election_id);
    let payment = state
        .wallet
        .pay_election(
            &user.account_id,
            &election_id,
            &body.region_code,
            body.payment_gateway,
        )
        .await?;

    let response = match payment {
        ElectionPayment::AlreadyPaid(txn) => PayElectionResponse {
            already_paid: true,
            transaction: txn.into(),
            checkout: CheckoutDto::default(),
            fees: None,
        },
        ElectionPayment::Checkout {
            transaction,
            session,
            fees,
        } => PayElectionResponse {
            already_paid: false,
            transaction: transaction.into(),
            checkout: session.into(),
            fees: Some(fees.into()),
        },
    };
    Ok(Json(response))
}

async fn confirm_election_payment(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
    Json(body): Json<ConfirmPaymentRequest>,
) -> ApiResult<Json<ConfirmationResponse>> {
    let gateway = state.gateways.choose(body.payment_gateway)?.kind();
    let txn = state
        .wallet
        .confirm_election_payment(&user.account_id, gateway, &body.payment_id)
        .await?;
    Ok(Json(ConfirmationResponse {
        confirmed: txn.status == TransactionStatus::Success,
        transaction: txn.into(),
    }))
}

async fn deposit(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
    Json(body): Json<DepositRequest>,
) -> ApiResult<Json<DepositResponse>> {
    let amount = parse_amount(body.amount)?;
    let top_up = state
        .wallet
        .deposit(&user.account_id, amount, body.payment_gateway)
        .await?;
    Ok(Json(DepositResponse {
        transaction: top_up.transaction.into(),
        checkout: top_up.session.into(),
    }))
}

async fn confirm_deposit(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
    Json(body): Json<ConfirmPaymentRequest>,
) -> ApiResult<Json<ConfirmationResponse>> {
    let gateway = state.gateways.choose(body.payment_gateway)?.kind();
    let txn = state
        .wallet
        .confirm_deposit(&user.account_id, gateway, &body.payment_id)
        .await?;
    Ok(Json(ConfirmationResponse {
        confirmed: txn.status == TransactionStatus::Success,
        transaction: txn.into(),
    }))
}
