//! Prize-pool funding by election creators.

use std::str::FromStr;

use axum::extract::State;
use axum::routing::post;
use axum::{Json, Router};

use electa_core::models::{DepositId, ElectionId};

use crate::auth::AuthUser;
use crate::error::{ApiError, ApiResult};
use crate::state::ApiState;
use crate::types::{
    CheckoutDto, ConfirmPrizePoolRequest, EscrowDepositDto, FundPrizePoolRequest,
    FundPrizePoolResponse, parse_amount,
};

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/wallet/sponsor/fund-prize-pool", post(fund_prize_pool))
        .route("/wallet/sponsor/fund-prize-pool/confirm", post(confirm_prize_pool))
}

async fn fund_prize_pool(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
    Json(body): Json<FundPrizePoolRequest>,
) -> ApiResult<Json<FundPrizePoolResponse>> {
    let amount = parse_amount(body.amount)?;
    let checkout = state
        .wallet
        .fund_prize_pool(
            &user.account_id,
            &ElectionId::new(body.election_id),
            amount,
            body.payment_gateway,
        )
        .await?;

    // A pending deposit is returned without a new session; the client resumes
    // the checkout it already has.
    let session = match checkout.session {
        Some(session) => session.into(),
        None => CheckoutDto {
            payment_gateway: Some(checkout.deposit.gateway),
            payment_id: checkout.deposit.checkout_reference.clone(),
            ..Default::default()
        },
    };
    Ok(Json(FundPrizePoolResponse {
        deposit: checkout.deposit.into(),
        checkout: session,
    }))
}

async fn confirm_prize_pool(
    State(state): State<ApiState>,
    AuthUser(user): AuthUser,
    Json(body): Json<ConfirmPrizePoolRequest>,
) -> ApiResult<Json<EscrowDepositDto>> {
    let deposit_id = DepositId::from_str(&body.deposit_id)
        .map_err(|e| ApiError::BadRequest(format!("invalid depositId: {e}")))?;
    let deposit = state
        .wallet
        .confirm_prize_pool(&user.account_id, &deposit_id)
        .await?;
    Ok(Json(deposit.into()))
}
