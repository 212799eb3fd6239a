//! Escrow deposit repository implementation for PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use electa_core::error::StorageResult;
use electa_core::models::{AccountId, DepositId, ElectionId, EscrowDeposit};
use electa_core::ports::EscrowRepository;

use super::database::Database;
use super::helpers::{cents, parse_text, query_error};

const DEPOSIT_COLUMNS: &str = "id, election_id, creator_id, amount_cents, gateway, status, \
     checkout_reference, gateway_payment_id, created_at, completed_at, settled_at";

/// PostgreSQL implementation of EscrowRepository.
pub struct PgEscrowRepository {
    pool: PgPool,
}

impl PgEscrowRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl EscrowRepository for PgEscrowRepository {
    async fn insert_deposit(&self, deposit: &EscrowDeposit) -> StorageResult<()> {
        // A second live deposit for the pair hits escrow_deposits_live_idx
        // and surfaces as StorageError::Duplicate.
        sqlx::query(
            r#"
            INSERT INTO escrow_deposits (
                id, election_id, creator_id, amount_cents, gateway, status,
                checkout_reference, gateway_payment_id, created_at, completed_at, settled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(deposit.id.as_uuid())
        .bind(deposit.election_id.as_str())
        .bind(deposit.creator_id.as_str())
        .bind(deposit.amount.cents())
        .bind(deposit.gateway.as_str())
        .bind(deposit.status.as_str())
        .bind(deposit.checkout_reference.as_deref())
        .bind(deposit.gateway_payment_id.as_deref())
        .bind(deposit.created_at)
        .bind(deposit.completed_at)
        .bind(deposit.settled_at)
        .execute(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(())
    }

    async fn get_deposit(&self, id: &DepositId) -> StorageResult<Option<EscrowDeposit>> {
        let query = format!("SELECT {DEPOSIT_COLUMNS} FROM escrow_deposits WHERE id = $1");
        let row = sqlx::query_as::<_, DepositRow>(&query)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

        row.map(DepositRow::into_deposit).transpose()
    }

    async fn find_live_deposit(
        &self,
        election: &ElectionId,
        creator: &AccountId,
    ) -> StorageResult<Option<EscrowDeposit>> {
        let query = format!(
            "SELECT {DEPOSIT_COLUMNS} FROM escrow_deposits \
             WHERE election_id = $1 AND creator_id = $2 AND status IN ('pending', 'completed')"
        );
        let row = sqlx::query_as::<_, DepositRow>(&query)
            .bind(election.as_str())
            .bind(creator.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

        row.map(DepositRow::into_deposit).transpose()
    }

    async fn stale_pending(&self, before: DateTime<Utc>) -> StorageResult<Vec<EscrowDeposit>> {
        let query = format!(
            "SELECT {DEPOSIT_COLUMNS} FROM escrow_deposits \
             WHERE status = 'pending' AND created_at < $1 ORDER BY created_at"
        );
        sqlx::query_as::<_, DepositRow>(&query)
            .bind(before)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?
            .into_iter()
            .map(DepositRow::into_deposit)
            .collect()
    }
}

/// Database row representation for EscrowDeposit.
#[derive(sqlx::FromRow)]
struct DepositRow {
    id: Uuid,
    election_id: String,
    creator_id: String,
    amount_cents: i64,
    gateway: String,
    status: String,
    checkout_reference: Option<String>,
    gateway_payment_id: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    settled_at: Option<DateTime<Utc>>,
}

impl DepositRow {
    fn into_deposit(self) -> StorageResult<EscrowDeposit> {
        Ok(EscrowDeposit {
            id: DepositId(self.id),
            election_id: ElectionId::from(self.election_id),
            creator_id: AccountId::from(self.creator_id),
            amount: cents(self.amount_cents, "escrow_deposits.amount_cents")?,
            gateway: parse_text(&self.gateway, "escrow_deposits.gateway")?,
            status: parse_text(&self.status, "escrow_deposits.status")?,
            checkout_reference: self.checkout_reference,
            gateway_payment_id: self.gateway_payment_id,
            created_at: self.created_at,
            completed_at: self.completed_at,
            settled_at: self.settled_at,
        })
    }
}
