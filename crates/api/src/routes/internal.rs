//! Election lifecycle hooks called by the election service.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};

use electa_core::models::{AccountId, ElectionId};
use electa_core::services::ElectionOutcome;

use crate::auth::ServiceCaller;
use crate::error::ApiResult;
use crate::state::ApiState;
use crate::types::{ReadinessResponse, SettleRequest, SettlementResponse};

pub fn routes() -> Router<ApiState> {
    Router::new()
        .route("/internal/elections/{id}/settle", post(settle))
        .route(
            "/internal/elections/{id}/publish-readiness",
            get(publish_readiness),
        )
}

async fn settle(
    State(state): State<ApiState>,
    _caller: ServiceCaller,
    Path(id): Path<String>,
    Json(body): Json<SettleRequest>,
) -> ApiResult<Json<SettlementResponse>> {
    let outcome = match body {
        SettleRequest::Completed { winners } => ElectionOutcome::Completed {
            winners: winners.into_iter().map(AccountId::from).collect(),
        },
        SettleRequest::Cancelled => ElectionOutcome::Cancelled,
    };
    let report = state
        .settlement
        .settle(&ElectionId::new(id), outcome)
        .await?;
    Ok(Json(report.into()))
}

async fn publish_readiness(
    State(state): State<ApiState>,
    _caller: ServiceCaller,
    Path(id): Path<String>,
) -> ApiResult<Json<ReadinessResponse>> {
    let readiness = state.escrow.publish_readiness(&ElectionId::new(id)).await?;
    Ok(Json(readiness.into()))
}
