//! Shared handler state.

use std::sync::Arc;

use electa_core::ports::{GatewayRegistry, SessionVerifier};
use electa_core::services::{EscrowManager, Reconciler, SettlementScheduler, WalletService};

/// Services exposed over HTTP. Cheap to clone.
#[derive(Clone)]
pub struct ApiState {
    pub wallet: Arc<WalletService>,
    pub escrow: Arc<EscrowManager>,
    pub settlement: Arc<SettlementScheduler>,
    pub reconciler: Arc<Reconciler>,
    pub gateways: Arc<GatewayRegistry>,
    pub sessions: Arc<dyn SessionVerifier>,
    /// Token expected in `x-service-token` on internal routes. `None` disables them.
    pub service_token: Option<String>,
}
