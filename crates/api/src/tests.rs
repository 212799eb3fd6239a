//! Router tests over the in-memory store and the sandbox processor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tower::ServiceExt;

use electa_core::memory::{MemoryDirectory, MemoryStore};
use electa_core::models::{AccountId, ElectionId, Money};
use electa_core::ports::{
    ElectionDirectory, ElectionInfo, ElectionStatus, GatewayRegistry, Pricing, PrizeConfig,
    Repositories, RewardType,
};
use electa_core::services::{
    EscrowManager, FeeSchedule, Ledger, Reconciler, SettlementScheduler, WalletService,
    WithdrawalPolicy,
};
use electa_gateways::{SANDBOX_SIGNATURE_HEADER, SandboxConfig, SandboxGateway};
use electa_upstream::DemoSessionVerifier;

use crate::routes::router;
use crate::state::ApiState;

const SERVICE_TOKEN: &str = "svc_token";

struct TestApp {
    router: Router,
    sandbox: Arc<SandboxGateway>,
    directory: Arc<MemoryDirectory>,
}

async fn app() -> TestApp {
    let store: Arc<dyn Repositories> = Arc::new(MemoryStore::new());
    let directory = Arc::new(MemoryDirectory::new());
    let sandbox = Arc::new(SandboxGateway::new(SandboxConfig::new("sbx_secret")));
    let mut registry = GatewayRegistry::new();
    registry.register(sandbox.clone());
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
    let settlement = Arc::new(SettlementScheduler::new(
        ledger.clone(),
        escrow.clone(),
        elections.clone(),
    ));
    let wallet = Arc::new(WalletService::new(
        ledger,
        gateways.clone(),
        elections,
        escrow.clone(),
        reconciler.clone(),
        fees,
        WithdrawalPolicy::default(),
    ));

    let state = ApiState {
        wallet,
        escrow,
        settlement,
        reconciler,
        gateways,
        sessions: Arc::new(DemoSessionVerifier),
        service_token: Some(SERVICE_TOKEN.to_string()),
    };
    TestApp {
        router: router(state),
        sandbox,
        directory,
    }
}

fn election(id: &str, creator: &str, fee_cents: i64, prize_cents: Option<i64>) -> ElectionInfo {
    ElectionInfo {
        id: ElectionId::from(id),
        creator_id: AccountId::from(creator),
        title: format!("Election {id}"),
        status: ElectionStatus::Active,
        pricing: Pricing {
            fee_by_region: BTreeMap::new(),
            default_fee: Some(Money::from_cents(fee_cents)),
        },
        prize: prize_cents.map(|cents| PrizeConfig {
            reward_type: RewardType::Monetary,
            amount: Money::from_cents(cents),
            winner_count: 2,
        }),
    }
}

impl TestApp {
    async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, body)
    }

    async fn get(&self, uri: &str, user: &str) -> (StatusCode, Value) {
        let request = Request::get(uri)
            .header("authorization", format!("Bearer demo:{user}"))
            .body(Body::empty())
            .unwrap();
        self.send(request).await
    }

    async fn post(&self, uri: &str, user: &str, body: Value) -> (StatusCode, Value) {
        let request = Request::post(uri)
            .header("authorization", format!("Bearer demo:{user}"))
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        self.send(request).await
    }

    async fn internal(&self, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .header("x-service-token", SERVICE_TOKEN)
            .header("content-type", "application/json")
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_string())))
            .unwrap();
        self.send(request).await
    }

    async fn webhook(&self, payload: Vec<u8>, signature: &str) -> (StatusCode, Value) {
        let request = Request::post("/webhooks/sandbox")
            .header(SANDBOX_SIGNATURE_HEADER, signature)
            .body(Body::from(payload))
            .unwrap();
        self.send(request).await
    }
}

#[tokio::test]
async fn test_health_and_auth() {
    let app = app().await;
    let (status, _) = app
        .send(Request::get("/health").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app
        .send(Request::get("/wallet").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, body) = app.get("/wallet", "alice").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["balance"], 0.0);
    assert_eq!(body["currency"], "USD");
}

// Test critique: paiement électoral confirmé par webhook, rejoué sans double crédit
#[tokio::test]
async fn test_pay_election_through_webhook() {
    let app = app().await;
    app.directory.upsert(election("el_1", "carol", 500, None)).await;

    let (status, body) = app
        .post(
            "/wallet/pay-election",
            "alice",
            json!({ "electionId": "el_1", "regionCode": "US" }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["alreadyPaid"], false);
    assert_eq!(body["fees"]["netAmount"], 4.75);
    let payment_id = body["paymentId"].as_str().unwrap().to_string();
    assert!(body["checkoutUrl"].is_string());

    let (payload, signature) = app.sandbox.complete(&payment_id).unwrap();
    let (status, body) = app.webhook(payload.clone(), &signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "processed");

    let (status, body) = app.webhook(payload, &signature).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["outcome"], "duplicate");

    let (_, wallet) = app.get("/wallet", "carol").await;
    assert_eq!(wallet["blockedBalance"], 4.75);
    assert_eq!(wallet["balance"], 0.0);

    let (_, body) = app
        .post(
            "/wallet/pay-election",
            "alice",
            json!({ "electionId": "el_1", "regionCode": "US" }),
        )
        .await;
    assert_eq!(body["alreadyPaid"], true);

    let (_, blocked) = app.get("/wallet/blocked-accounts", "carol").await;
    assert_eq!(blocked[0]["electionId"], "el_1");
    assert_eq!(blocked[0]["participantCount"], 1);

    let (_, history) = app
        .get("/wallet/transactions?filterType=outgoing", "alice")
        .await;
    assert_eq!(history["pagination"]["total"], 1);
    assert_eq!(history["transactions"][0]["type"], "voter_fee_payment");
}

#[tokio::test]
async fn test_forged_webhook_rejected() {
    let app = app().await;
    let (status, body) = app.webhook(br#"{"type":"payment.succeeded"}"#.to_vec(), "00ff").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_signature");

    let request = Request::post("/webhooks/bitpay").body(Body::empty()).unwrap();
    let (status, _) = app.send(request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_top_up_then_withdraw() {
    let app = app().await;

    let (status, body) = app.post("/wallet/withdraw", "bob", json!({
        "amount": 20.0, "paymentMethod": "bank_transfer"
    })).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert_eq!(body["error"], "insufficient_funds");

    let (status, body) = app
        .post("/wallet/deposit", "bob", json!({ "amount": 50.0 }))
        .await;
    assert_eq!(status, StatusCode::OK);
    let payment_id = body["paymentId"].as_str().unwrap().to_string();

    // Paiement encore en attente : la confirmation ne crédite rien
    let (_, body) = app
        .post("/wallet/deposit/confirm", "bob", json!({ "paymentId": payment_id }))
        .await;
    assert_eq!(body["confirmed"], false);

    app.sandbox.complete(&payment_id).unwrap();
    let (status, body) = app
        .post("/wallet/deposit/confirm", "bob", json!({ "paymentId": payment_id }))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["confirmed"], true);

    let (status, body) = app.post("/wallet/withdraw", "bob", json!({
        "amount": 5.0, "paymentMethod": "bank_transfer"
    })).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "invalid_amount");

    let (status, body) = app.post("/wallet/withdraw", "bob", json!({
        "amount": 20.0, "paymentMethod": "bank_transfer"
    })).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["requiresApproval"], false);

    let (_, wallet) = app.get("/wallet", "bob").await;
    assert_eq!(wallet["balance"], 30.0);

    let (_, analytics) = app.get("/wallet/analytics", "bob").await;
    assert_eq!(analytics["totalDeposits"], 50.0);
    assert_eq!(analytics["totalWithdrawals"], 20.0);
}

#[tokio::test]
async fn test_admin_routes_require_admin_role() {
    let app = app().await;
    let (status, _) = app.get("/admin/withdrawals/pending", "alice").await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = app.get("/admin/withdrawals/pending", "root:admin").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([]));

    let (status, _) = app
        .post("/admin/withdrawals/not-a-uuid/approve", "root:admin", json!({}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

// Test critique: publication bloquée tant que la cagnotte n'est pas déposée
#[tokio::test]
async fn test_prize_pool_gates_publishing_then_settles() {
    let app = app().await;
    app.directory
        .upsert(election("el_2", "carol", 500, Some(100_000)))
        .await;

    let (status, _) = app
        .send(
            Request::get("/internal/elections/el_2/publish-readiness")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = app
        .internal("GET", "/internal/elections/el_2/publish-readiness", None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "deposit_required");
    assert_eq!(body["canPublish"], false);
    assert_eq!(body["requiredAmount"], 1000.0);

    let (status, body) = app
        .post(
            "/wallet/sponsor/fund-prize-pool",
            "carol",
            json!({ "electionId": "el_2", "amount": 1000.0 }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    let deposit_id = body["deposit"]["id"].as_str().unwrap().to_string();
    let payment_id = body["paymentId"].as_str().unwrap().to_string();

    let (payload, signature) = app.sandbox.complete(&payment_id).unwrap();
    app.webhook(payload.clone(), &signature).await;
    app.webhook(payload, &signature).await;

    let (status, body) = app
        .post(
            "/wallet/sponsor/fund-prize-pool/confirm",
            "carol",
            json!({ "depositId": deposit_id }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "completed");

    let (_, wallet) = app.get("/wallet", "carol").await;
    assert_eq!(wallet["escrowedBalance"], 1000.0);

    let (_, body) = app
        .internal("GET", "/internal/elections/el_2/publish-readiness", None)
        .await;
    assert_eq!(body["state"], "ready");

    app.directory
        .set_status(&ElectionId::from("el_2"), ElectionStatus::Completed)
        .await;
    let (status, body) = app
        .internal(
            "POST",
            "/internal/elections/el_2/settle",
            Some(json!({ "outcome": "completed", "winners": ["w1", "w2"] })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["escrow"]["result"], "distributed");
    assert_eq!(body["escrow"]["share"], 500.0);

    let (_, wallet) = app.get("/wallet", "w1").await;
    assert_eq!(wallet["balance"], 500.0);
    let (_, wallet) = app.get("/wallet", "carol").await;
    assert_eq!(wallet["escrowedBalance"], 0.0);
}
