//! Payment processor callbacks.
//!
//! The signature is checked against the raw body before anything else. Replays
//! are acknowledged with 200 so processors stop retrying; transient failures
//! return 5xx so they retry later.

use std::str::FromStr;

use axum::Json;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::HeaderMap;
use axum::routing::post;
use serde_json::{Value, json};
use tracing::{info, warn};

use electa_core::models::Gateway;

use crate::error::{ApiError, ApiResult};
use crate::state::ApiState;

pub fn routes() -> Router<ApiState> {
    Router::new().route("/webhooks/{gateway}", post(receive))
}

fn signature_header(gateway: Gateway) -> &'static str {
    match gateway {
        Gateway::Stripe => "stripe-signature",
        Gateway::Paddle => "paddle-signature",
        Gateway::Sandbox => "x-sandbox-signature",
    }
}

async fn receive(
    State(state): State<ApiState>,
    Path(gateway): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<Json<Value>> {
    let gateway = Gateway::from_str(&gateway)
        .map_err(|_| ApiError::NotFound(format!("unknown gateway {gateway}")))?;
    let adapter = state.gateways.get(gateway)?;

    let signature = headers
        .get(signature_header(gateway))
        .and_then(|v| v.to_str().ok());
    let event = adapter.parse_webhook(&body, signature).inspect_err(|e| {
        warn!(gateway = %gateway, error = %e, "Rejected webhook");
    })?;

    match state.reconciler.reconcile(event).await {
        Ok(result) => {
            info!(gateway = %gateway, outcome = result.label(), "📬 Webhook processed");
            Ok(Json(json!({ "received": true, "outcome": result.label() })))
        }
        Err(e) if e.is_benign() => Ok(Json(json!({ "received": true, "outcome": "duplicate" }))),
        Err(e) => Err(e.into()),
    }
}
