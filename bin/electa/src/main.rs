//! Electa - creator wallet, prize-pool escrow and fee settlement.
//!
//! # Usage
//!
//! ```bash
//! # Local demo: in-memory ledger, sandbox payments, demo:<user> tokens
//! electa --demo
//!
//! # Production
//! DATABASE_URL=postgres://localhost/electa \
//! STRIPE_API_KEY=sk_live_... STRIPE_WEBHOOK_SECRET=whsec_... \
//! ELECTION_SERVICE_URL=http://elections:8080 AUTH_SERVICE_URL=http://auth:8080 \
//! SERVICE_TOKEN=... electa
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, ValueEnum};
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::signal;
use tokio::sync::watch;
use tracing::{Instrument, debug, error, info, info_span, warn};
use tracing_subscriber::{EnvFilter, fmt};
use url::Url;

use electa_api::{ApiState, ServerConfig, serve_with_shutdown};
use electa_core::memory::{MemoryDirectory, MemoryStore};
use electa_core::metrics::init_metrics;
use electa_core::models::{AccountId, ElectionId, Gateway, Money};
use electa_core::ports::{
    ElectionDirectory, ElectionInfo, ElectionStatus, GatewayRegistry, Pricing, PrizeConfig,
    Repositories, RewardType, SessionVerifier,
};
use electa_core::services::{
    EscrowManager, FeeSchedule, GatewayRate, Ledger, Reconciler, SettlementScheduler, Sweeper,
    SweeperConfig, WalletService, WithdrawalPolicy,
};
use electa_gateways::{
    PaddleConfig, PaddleGateway, SandboxConfig, SandboxGateway, StripeConfig, StripeGateway,
};
use electa_storage::{Database, DatabaseConfig, PgRepositories};
use electa_upstream::{DemoSessionVerifier, HttpElectionDirectory, HttpSessionVerifier, ServiceConfig};

/// Ledger storage backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum StorageBackend {
    Postgres,
    Memory,
}

/// Electa CLI - wallet, escrow and fee-settlement service.
#[derive(Parser, Debug)]
#[command(name = "electa")]
#[command(about = "Electa - creator wallet, prize-pool escrow and fee settlement")]
#[command(version)]
struct Cli {
    /// PostgreSQL database URL.
    #[arg(long, env = "DATABASE_URL", default_value = "postgres://localhost/electa")]
    database_url: String,

    /// Ledger storage backend.
    #[arg(long, env = "STORAGE_BACKEND", value_enum, default_value = "postgres")]
    storage: StorageBackend,

    /// REST API port.
    #[arg(long, env = "HTTP_PORT", default_value = "8080")]
    http_port: u16,

    /// Prometheus metrics port.
    #[arg(long, env = "METRICS_PORT", default_value = "9090")]
    metrics_port: u16,

    /// Enable JSON log output.
    #[arg(long, env = "JSON_LOGS")]
    json_logs: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Run database migrations and exit.
    #[arg(long)]
    migrate_only: bool,

    /// Demo mode: in-memory ledger, auto-succeeding sandbox payments,
    /// `demo:<user>[:admin]` bearer tokens and a seeded election.
    #[arg(long, env = "DEMO")]
    demo: bool,

    // ── Fees ────────────────────────────────────────────────────────────────
    /// Stripe percentage fee in basis points.
    #[arg(long, env = "STRIPE_FEE_BPS", default_value = "290")]
    stripe_fee_bps: u32,

    /// Stripe fixed fee per payment, in cents.
    #[arg(long, env = "STRIPE_FIXED_CENTS", default_value = "30")]
    stripe_fixed_cents: i64,

    /// Paddle percentage fee in basis points.
    #[arg(long, env = "PADDLE_FEE_BPS", default_value = "500")]
    paddle_fee_bps: u32,

    /// Paddle fixed fee per payment, in cents.
    #[arg(long, env = "PADDLE_FIXED_CENTS", default_value = "50")]
    paddle_fixed_cents: i64,

    /// Sandbox percentage fee in basis points.
    #[arg(long, env = "SANDBOX_FEE_BPS", default_value = "0")]
    sandbox_fee_bps: u32,

    /// Sandbox fixed fee per payment, in cents.
    #[arg(long, env = "SANDBOX_FIXED_CENTS", default_value = "0")]
    sandbox_fixed_cents: i64,

    /// Platform fee in basis points.
    #[arg(long, env = "PLATFORM_FEE_BPS", default_value = "500")]
    platform_fee_bps: u32,

    // ── Withdrawals ─────────────────────────────────────────────────────────
    /// Minimum withdrawal, in cents.
    #[arg(long, env = "WITHDRAWAL_MINIMUM_CENTS", default_value = "1000")]
    withdrawal_minimum_cents: i64,

    /// Withdrawals above this amount (cents) wait for admin approval.
    #[arg(long, env = "WITHDRAWAL_APPROVAL_CENTS", default_value = "100000")]
    withdrawal_approval_cents: i64,

    // ── Ledger & sweeper ────────────────────────────────────────────────────
    /// Account lock timeout in milliseconds.
    #[arg(long, env = "LOCK_TIMEOUT_MS", default_value = "5000")]
    lock_timeout_ms: u64,

    /// Age after which pending payments are reconciled by polling, in seconds.
    #[arg(long, env = "PENDING_TTL_SECS", default_value = "3600")]
    pending_ttl_secs: u64,

    /// Age after which checkouts still open at the processor are cancelled, in seconds.
    #[arg(long, env = "MAX_PENDING_AGE_SECS", default_value = "86400")]
    max_pending_age_secs: u64,

    /// Sweeper interval in seconds.
    #[arg(long, env = "SWEEP_INTERVAL_SECS", default_value = "300")]
    sweep_interval_secs: u64,

    // ── Gateways ────────────────────────────────────────────────────────────
    #[arg(long, env = "STRIPE_API_KEY", hide_env_values = true)]
    stripe_api_key: Option<String>,

    #[arg(long, env = "STRIPE_WEBHOOK_SECRET", hide_env_values = true)]
    stripe_webhook_secret: Option<String>,

    #[arg(long, env = "PADDLE_API_KEY", hide_env_values = true)]
    paddle_api_key: Option<String>,

    #[arg(long, env = "PADDLE_WEBHOOK_SECRET", hide_env_values = true)]
    paddle_webhook_secret: Option<String>,

    /// Enables the sandbox gateway outside demo mode.
    #[arg(long, env = "SANDBOX_WEBHOOK_SECRET", hide_env_values = true)]
    sandbox_webhook_secret: Option<String>,

    /// Gateway used when a client does not choose one.
    #[arg(long, env = "DEFAULT_GATEWAY", value_parser = parse_gateway)]
    default_gateway: Option<Gateway>,

    // ── Upstream services ───────────────────────────────────────────────────
    /// Election service base URL.
    #[arg(long, env = "ELECTION_SERVICE_URL")]
    election_service_url: Option<Url>,

    /// Auth service base URL.
    #[arg(long, env = "AUTH_SERVICE_URL")]
    auth_service_url: Option<Url>,

    /// Shared token for internal routes and upstream calls.
    #[arg(long, env = "SERVICE_TOKEN", hide_env_values = true)]
    service_token: Option<String>,
}

/// Parse a gateway name from string.
fn parse_gateway(s: &str) -> Result<Gateway, String> {
    s.to_lowercase().parse()
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_tracing(&cli.log_level, cli.json_logs);

    // Prometheus metrics exporter (optional - failures don't crash the app)
    let metrics_enabled = match format!("0.0.0.0:{}", cli.metrics_port).parse::<std::net::SocketAddr>() {
        Ok(metrics_addr) => {
            match PrometheusBuilder::new()
                .with_http_listener(metrics_addr)
                .install()
            {
                Ok(()) => {
                    init_metrics();
                    true
                }
                Err(e) => {
                    warn!("⚠️  Failed to start metrics exporter: {}. Continuing without metrics.", e);
                    false
                }
            }
        }
        Err(e) => {
            warn!("⚠️  Invalid metrics address: {}. Continuing without metrics.", e);
            false
        }
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 🚀 STARTUP
    // ─────────────────────────────────────────────────────────────────────────
    info!("🚀 Starting Electa wallet");
    if cli.demo {
        warn!("🧪 Demo mode: in-memory ledger, sandbox payments, demo session tokens");
    }

    let fees = fee_schedule(&cli).inspect_err(|e| error!(error = %e, "❌ Invalid fee configuration"))?;
    let policy = withdrawal_policy(&cli)?;
    let lock_timeout = Duration::from_millis(cli.lock_timeout_ms);

    // ─────────────────────────────────────────────────────────────────────────
    // 🗄️ STORAGE
    // ─────────────────────────────────────────────────────────────────────────
    let backend = if cli.demo {
        StorageBackend::Memory
    } else {
        cli.storage
    };

    let (repositories, db): (Arc<dyn Repositories>, Option<Arc<Database>>) = match backend {
        StorageBackend::Postgres => {
            debug!(database_url = %mask_password(&cli.database_url), "Database endpoint");
            info!("🗄️  Connecting to database...");
            let db = Database::connect(&DatabaseConfig::for_service(&cli.database_url, lock_timeout))
                .await
                .context("Failed to connect to database")?;
            db.migrate().await.context("Failed to run migrations")?;
            info!("🗄️  Database ready (migrations applied)");

            if cli.migrate_only {
                info!("🛑 --migrate-only flag set, exiting");
                db.close().await;
                return Ok(());
            }
            let db = Arc::new(db);
            let repositories: Arc<dyn Repositories> = Arc::new(PgRepositories::new(db.clone()));
            (repositories, Some(db))
        }
        StorageBackend::Memory => {
            if cli.migrate_only {
                bail!("--migrate-only requires the postgres storage backend");
            }
            warn!("🗄️  Using in-memory ledger, balances are lost on restart");
            let repositories: Arc<dyn Repositories> = Arc::new(MemoryStore::new());
            (repositories, None)
        }
    };

    // ─────────────────────────────────────────────────────────────────────────
    // 🔌 EXTERNAL SERVICES
    // ─────────────────────────────────────────────────────────────────────────
    let gateways = Arc::new(gateway_registry(&cli)?);
    info!(gateways = ?gateways.registered(), "💳 Payment gateways configured");

    let (directory, sessions, service_token) = upstream(&cli).await?;

    // ─────────────────────────────────────────────────────────────────────────
    // 🧮 SERVICES
    // ─────────────────────────────────────────────────────────────────────────
    let ledger = Arc::new(Ledger::new(repositories, lock_timeout));
    let escrow = Arc::new(EscrowManager::new(
        ledger.clone(),
        gateways.clone(),
        directory.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(ledger.clone(), escrow.clone(), fees.clone()));
    let settlement = Arc::new(SettlementScheduler::new(
        ledger.clone(),
        escrow.clone(),
        directory.clone(),
    ));
    let wallet = Arc::new(WalletService::new(
        ledger.clone(),
        gateways.clone(),
        directory,
        escrow.clone(),
        reconciler.clone(),
        fees,
        policy,
    ));
    let sweeper = Sweeper::new(
        SweeperConfig {
            interval: Duration::from_secs(cli.sweep_interval_secs),
            ttl: Duration::from_secs(cli.pending_ttl_secs),
            max_pending_age: Duration::from_secs(cli.max_pending_age_secs),
        },
        ledger,
        gateways.clone(),
        escrow.clone(),
        reconciler.clone(),
    );

    // ─────────────────────────────────────────────────────────────────────────
    // ⚡ SERVICES START
    // ─────────────────────────────────────────────────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut api_shutdown_rx = shutdown_tx.subscribe();

    let state = ApiState {
        wallet,
        escrow,
        settlement,
        reconciler,
        gateways,
        sessions,
        service_token,
    };
    let api_config = ServerConfig {
        host: "0.0.0.0".to_string(),
        port: cli.http_port,
    };
    let api_handle = tokio::spawn(
        async move {
            let shutdown_signal = async move {
                while !*api_shutdown_rx.borrow() {
                    if api_shutdown_rx.changed().await.is_err() {
                        break;
                    }
                }
            };

            if let Err(e) = serve_with_shutdown(state, api_config, shutdown_signal).await {
                error!(error = %e, "❌ Server error");
            }
            debug!("Server stopped");
        }
        .instrument(info_span!("api")),
    );

    let sweeper_handle = tokio::spawn(
        async move { sweeper.run(shutdown_rx).await }.instrument(info_span!("sweeper")),
    );

    // ─────────────────────────────────────────────────────────────────────────
    // ✅ READY
    // ─────────────────────────────────────────────────────────────────────────
    info!("✅ Electa ready");
    info!("   ⚡ API:      http://localhost:{}", cli.http_port);
    if metrics_enabled {
        info!(
            "   📊 Metrics:  http://localhost:{}/metrics",
            cli.metrics_port
        );
    } else {
        info!("   📊 Metrics:  disabled");
    }
    info!("   Press Ctrl+C to stop");

    shutdown_signal().await;

    // ─────────────────────────────────────────────────────────────────────────
    // 🛑 SHUTDOWN
    // ─────────────────────────────────────────────────────────────────────────
    info!("🛑 Shutting down...");
    let _ = shutdown_tx.send(true);

    match tokio::time::timeout(Duration::from_secs(30), sweeper_handle).await {
        Ok(_) => debug!("Sweeper stopped"),
        Err(_) => warn!("⚠️  Sweeper shutdown timed out"),
    }

    match tokio::time::timeout(Duration::from_secs(10), api_handle).await {
        Ok(_) => debug!("API stopped"),
        Err(_) => warn!("⚠️  API shutdown timed out"),
    }

    if let Some(db) = db {
        db.close().await;
    }

    info!("🛑 Shutdown complete");
    Ok(())
}

// =============================================================================
// Wiring
// =============================================================================

fn fee_schedule(cli: &Cli) -> Result<FeeSchedule> {
    Ok(FeeSchedule::new(
        GatewayRate::new(cli.stripe_fee_bps, cli.stripe_fixed_cents),
        GatewayRate::new(cli.paddle_fee_bps, cli.paddle_fixed_cents),
        GatewayRate::new(cli.sandbox_fee_bps, cli.sandbox_fixed_cents),
        cli.platform_fee_bps,
    )?)
}

fn withdrawal_policy(cli: &Cli) -> Result<WithdrawalPolicy> {
    let policy = WithdrawalPolicy {
        minimum: Money::from_cents(cli.withdrawal_minimum_cents),
        approval_threshold: Money::from_cents(cli.withdrawal_approval_cents),
    };
    if !policy.minimum.is_positive() || policy.approval_threshold < policy.minimum {
        bail!(
            "invalid withdrawal policy: minimum {} and approval threshold {}",
            policy.minimum,
            policy.approval_threshold
        );
    }
    Ok(policy)
}

fn gateway_registry(cli: &Cli) -> Result<GatewayRegistry> {
    let mut registry = GatewayRegistry::new();

    if let (Some(key), Some(secret)) = (&cli.stripe_api_key, &cli.stripe_webhook_secret) {
        let stripe = StripeGateway::new(StripeConfig::new(key, secret))
            .context("Failed to build Stripe client")?;
        registry.register(Arc::new(stripe));
    } else if cli.stripe_api_key.is_some() {
        warn!("⚠️  STRIPE_API_KEY set without STRIPE_WEBHOOK_SECRET, Stripe disabled");
    }

    if let (Some(key), Some(secret)) = (&cli.paddle_api_key, &cli.paddle_webhook_secret) {
        let paddle = PaddleGateway::new(PaddleConfig::new(key, secret))
            .context("Failed to build Paddle client")?;
        registry.register(Arc::new(paddle));
    } else if cli.paddle_api_key.is_some() {
        warn!("⚠️  PADDLE_API_KEY set without PADDLE_WEBHOOK_SECRET, Paddle disabled");
    }

    let sandbox_secret = match (&cli.sandbox_webhook_secret, cli.demo) {
        (Some(secret), _) => Some(secret.clone()),
        (None, true) => Some("demo-sandbox-secret".to_string()),
        (None, false) => None,
    };
    if let Some(secret) = sandbox_secret {
        let config = SandboxConfig::new(secret).auto_succeed(cli.demo);
        registry.register(Arc::new(SandboxGateway::new(config)));
    }

    if registry.registered().is_empty() {
        bail!("no payment gateway configured (set Stripe or Paddle credentials, or use --demo)");
    }
    if let Some(default) = cli.default_gateway {
        registry.get(default).context("DEFAULT_GATEWAY is not configured")?;
        registry.set_default(default);
    }
    Ok(registry)
}

type Upstream = (
    Arc<dyn ElectionDirectory>,
    Arc<dyn SessionVerifier>,
    Option<String>,
);

async fn upstream(cli: &Cli) -> Result<Upstream> {
    if cli.demo {
        let memory = Arc::new(MemoryDirectory::new());
        memory.upsert(demo_election()).await;
        let directory: Arc<dyn ElectionDirectory> = memory;
        info!("🧪 Seeded demo election 'demo-election' (creator 'demo-creator')");
        let token = cli
            .service_token
            .clone()
            .unwrap_or_else(|| "demo-service-token".to_string());
        let sessions: Arc<dyn SessionVerifier> = Arc::new(DemoSessionVerifier);
        return Ok((directory, sessions, Some(token)));
    }

    let Some(election_url) = cli.election_service_url.clone() else {
        bail!("ELECTION_SERVICE_URL is required outside demo mode");
    };
    let Some(auth_url) = cli.auth_service_url.clone() else {
        bail!("AUTH_SERVICE_URL is required outside demo mode");
    };
    if cli.service_token.is_none() {
        warn!("⚠️  SERVICE_TOKEN not set, internal election routes are disabled");
    }

    let with_token = |url: Url| match &cli.service_token {
        Some(token) => ServiceConfig::new(url).with_service_token(token),
        None => ServiceConfig::new(url),
    };
    let directory = HttpElectionDirectory::new(with_token(election_url))
        .context("Failed to build election service client")?;
    let sessions = HttpSessionVerifier::new(with_token(auth_url))
        .context("Failed to build auth service client")?;
    let directory: Arc<dyn ElectionDirectory> = Arc::new(directory);
    let sessions: Arc<dyn SessionVerifier> = Arc::new(sessions);
    Ok((directory, sessions, cli.service_token.clone()))
}

fn demo_election() -> ElectionInfo {
    let mut fee_by_region = BTreeMap::new();
    fee_by_region.insert("US".to_string(), Money::from_dollars_whole(5));
    fee_by_region.insert("IN".to_string(), Money::from_cents(99));
    ElectionInfo {
        id: ElectionId::from("demo-election"),
        creator_id: AccountId::from("demo-creator"),
        title: "Demo election".to_string(),
        status: ElectionStatus::Active,
        pricing: Pricing {
            fee_by_region,
            default_fee: Some(Money::from_dollars_whole(3)),
        },
        prize: Some(PrizeConfig {
            reward_type: RewardType::Monetary,
            amount: Money::from_dollars_whole(1000),
            winner_count: 10,
        }),
    }
}

/// Initialize tracing subscriber.
fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        fmt().with_env_filter(filter).json().init();
    } else {
        fmt()
            .with_env_filter(filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .init();
    }
}

/// Mask password in database URL for logging.
fn mask_password(url_str: &str) -> String {
    match Url::parse(url_str) {
        Ok(mut url) => {
            if url.password().is_some() {
                let _ = url.set_password(Some("****"));
            }
            url.to_string()
        }
        Err(_) => url_str.to_string(),
    }
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "❌ Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "❌ Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["electa"];
        argv.extend_from_slice(args);
        Cli::parse_from(argv)
    }

    #[test]
    fn test_mask_password() {
        assert_eq!(
            mask_password("postgres://electa:hunter2@db:5432/electa"),
            "postgres://electa:****@db:5432/electa"
        );
        assert_eq!(mask_password("not a url"), "not a url");
    }

    // Test critique: une configuration de frais invalide bloque le démarrage
    #[test]
    fn test_invalid_fee_configuration_is_fatal() {
        assert!(fee_schedule(&cli(&["--platform-fee-bps", "12000"])).is_err());
        assert!(fee_schedule(&cli(&[])).is_ok());
        assert!(withdrawal_policy(&cli(&["--withdrawal-approval-cents", "500"])).is_err());
    }

    #[test]
    fn test_demo_registers_sandbox_only() {
        let registry = gateway_registry(&cli(&["--demo"])).unwrap();
        assert_eq!(registry.registered(), vec![Gateway::Sandbox]);
        assert!(gateway_registry(&cli(&[])).is_err());
        assert!(gateway_registry(&cli(&["--demo", "--default-gateway", "stripe"])).is_err());
    }
}
