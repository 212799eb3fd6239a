//! HTTP routes, grouped by caller.

mod admin;
mod internal;
mod sponsor;
mod wallet;
mod webhooks;

use axum::Router;
use axum::routing::get;

use crate::state::ApiState;

/// Build the full router.
pub fn router(state: ApiState) -> Router {
    Router::new()
        .merge(wallet::routes())
        .merge(sponsor::routes())
        .merge(admin::routes())
        .merge(internal::routes())
        .merge(webhooks::routes())
        .route("/health", get(health_check))
        .with_state(state)
}

/// Health check endpoint.
async fn health_check() -> &'static str {
    "OK"
}
