//! Settlement marker and webhook receipt queries for PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;

use electa_core::error::StorageResult;
use electa_core::models::{AccountId, ElectionId, ElectionSettlement, Gateway};
use electa_core::ports::SettlementRepository;

use super::database::Database;
use super::helpers::{cents, parse_text, query_error};

/// PostgreSQL implementation of SettlementRepository.
pub struct PgSettlementRepository {
    pool: PgPool,
}

impl PgSettlementRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }
}

#[async_trait]
impl SettlementRepository for PgSettlementRepository {
    async fn get_settlement(
        &self,
        election: &ElectionId,
    ) -> StorageResult<Option<ElectionSettlement>> {
        let row = sqlx::query_as::<_, SettlementRow>(
            r#"
            SELECT election_id, creator_id, outcome, amount_cents, participant_count, settled_at
            FROM election_settlements
            WHERE election_id = $1
            "#,
        )
        .bind(election.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(query_error)?;

        row.map(SettlementRow::into_settlement).transpose()
    }

    async fn has_receipt(&self, gateway: Gateway, event_id: &str) -> StorageResult<bool> {
        let row: (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM webhook_receipts WHERE gateway = $1 AND event_id = $2)",
        )
        .bind(gateway.as_str())
        .bind(event_id)
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;

        Ok(row.0)
    }
}

/// Database row representation for ElectionSettlement.
#[derive(sqlx::FromRow)]
struct SettlementRow {
    election_id: String,
    creator_id: String,
    outcome: String,
    amount_cents: i64,
    participant_count: i32,
    settled_at: DateTime<Utc>,
}

impl SettlementRow {
    fn into_settlement(self) -> StorageResult<ElectionSettlement> {
        Ok(ElectionSettlement {
            election_id: ElectionId::from(self.election_id),
            creator_id: AccountId::from(self.creator_id),
            outcome: parse_text(&self.outcome, "election_settlements.outcome")?,
            amount: cents(self.amount_cents, "election_settlements.amount_cents")?,
            participant_count: self.participant_count.max(0) as u32,
            settled_at: self.settled_at,
        })
    }
}
