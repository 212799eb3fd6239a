//! Withdrawal review for admins.

use std::str::FromStr;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use electa_core::models::TransactionId;

use crate::auth::AdminUser;
use crate::error::{ApiError, ApiResult};
use crate::state::ApiState;
use crate::types::TransactionDto;

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/admin/withdrawals/pending", get(pending))
        .route("/admin/withdrawals/{id}/approve", post(approve))
        .route("/admin/withdrawals/{id}/reject", post(reject))
}

fn transaction_id(raw: &str) -> ApiResult<TransactionId> {
    TransactionId::from_str(raw)
        .map_err(|e| ApiError::BadRequest(format!("invalid withdrawal id: {e}")))
}

async fn pending(
    State(state): State<ApiState>,
    AdminUser(_): AdminUser,
) -> ApiResult<Json<Vec<TransactionDto>>> {
    let rows = state.wallet.pending_withdrawals().await?;
    Ok(Json(rows.into_iter().map(Into::into).collect()))
}

async fn approve(
    State(state): State<ApiState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<TransactionDto>> {
    let txn = state
        .wallet
        .approve_withdrawal(&transaction_id(&id)?, &admin.account_id)
        .await?;
    Ok(Json(txn.into()))
}

async fn reject(
    State(state): State<ApiState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> ApiResult<Json<TransactionDto>> {
    let txn = state
        .wallet
        .reject_withdrawal(&transaction_id(&id)?, &admin.account_id)
        .await?;
    Ok(Json(txn.into()))
}
