//! Connection pool for the wallet ledger.
//!
//! Every ledger commit runs in its own transaction with a local
//! `lock_timeout`, so a writer stuck behind a row lock fails fast with
//! SQLSTATE 55P03 instead of holding a pool connection.

use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::{debug, instrument};

use electa_core::error::{StorageError, StorageResult};

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    /// Row lock wait inside a ledger commit. Postgres reads `0` as "wait
    /// forever", so the pool never hands that value to a commit.
    pub lock_timeout: Duration,
}

impl DatabaseConfig {
    /// Pool sized for the HTTP API plus the background sweeper.
    pub fn for_service(url: &str, lock_timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            max_connections: 15,
            min_connections: 2,
            acquire_timeout: Duration::from_secs(5),
            idle_timeout: Duration::from_secs(300),
            max_lifetime: Duration::from_secs(900),
            lock_timeout,
        }
    }
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
    lock_timeout: Duration,
}

impl Database {
    #[instrument(skip_all)]
    pub async fn connect(config: &DatabaseConfig) -> StorageResult<Self> {
        debug!(
            max_conn = config.max_connections,
            lock_timeout_ms = config.lock_timeout.as_millis() as u64,
            "Creating ledger pool"
        );

        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout)
            .idle_timeout(Some(config.idle_timeout))
            .max_lifetime(Some(config.max_lifetime))
            .connect(&config.url)
            .await
            .map_err(|e| StorageError::ConnectionError(e.to_string()))?;

        Ok(Self {
            pool,
            lock_timeout: config.lock_timeout,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `SET LOCAL` statement issued at the start of each ledger commit.
    pub fn lock_timeout_statement(&self) -> String {
        lock_timeout_statement(self.lock_timeout)
    }

    /// Apply the wallet schema.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> StorageResult<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| StorageError::MigrationError(e.to_string()))?;
        debug!("Wallet schema up to date");
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

// SET LOCAL takes no bind parameters; the value is an integer we own.
fn lock_timeout_statement(timeout: Duration) -> String {
    let millis = timeout.as_millis().max(1);
    format!("SET LOCAL lock_timeout = '{millis}ms'")
}
