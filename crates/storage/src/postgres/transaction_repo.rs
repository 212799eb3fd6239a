//! Transaction repository implementation for PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use electa_core::error::StorageResult;
use electa_core::models::{
    AccountId, DepositId, ElectionId, Gateway, LockedFunds, Money, Transaction, TransactionId,
    WalletAnalytics,
};
use electa_core::ports::{
    FlowDirection, OrderDirection, Page, PageRequest, TransactionFilter, TransactionRepository,
};

use super::database::Database;
use super::helpers::{cents, parse_optional_text, parse_text, query_error};

/// Column list matching [`TransactionRow`].
pub(super) const TRANSACTION_COLUMNS: &str = "id, account_id, payer_id, kind, amount_cents, \
     debit_bucket, credit_bucket, gross_cents, gateway_fee_cents, platform_fee_cents, net_cents, \
     status, election_id, deposit_id, gateway, gateway_reference, description, details, \
     created_at, resolved_at";

/// PostgreSQL implementation of TransactionRepository.
pub struct PgTransactionRepository {
    pool: PgPool,
}

impl PgTransactionRepository {
    pub fn new(db: &Database) -> Self {
        Self {
            pool: db.pool().clone(),
        }
    }

    async fn fetch_where(&self, condition: &str, binds: &[&str]) -> StorageResult<Vec<Transaction>> {
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE {condition} ORDER BY seq"
        );
        let mut query_builder = sqlx::query_as::<_, TransactionRow>(&query);
        for bind in binds {
            query_builder = query_builder.bind(*bind);
        }
        query_builder
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?
            .into_iter()
            .map(TransactionRow::into_transaction)
            .collect()
    }
}

#[async_trait]
impl TransactionRepository for PgTransactionRepository {
    async fn get_transaction(&self, id: &TransactionId) -> StorageResult<Option<Transaction>> {
        let query = format!("SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions WHERE id = $1");
        let row = sqlx::query_as::<_, TransactionRow>(&query)
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await
            .map_err(query_error)?;

        row.map(TransactionRow::into_transaction).transpose()
    }

    async fn list_transactions(
        &self,
        account: &AccountId,
        filter: TransactionFilter,
        page: PageRequest,
        order: OrderDirection,
    ) -> StorageResult<Page<Transaction>> {
        let order_sql = match order {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        };

        // Build WHERE clause dynamically.
        //
        // Column names and operators are hardcoded; every value is bound.
        let mut params: Vec<String> = vec![account.as_str().to_string()];
        let mut conditions = vec!["(account_id = $1 OR payer_id = $1)".to_string()];

        if let Some(kind) = filter.kind {
            params.push(kind.as_str().to_string());
            conditions.push(format!("kind = ${}", params.len()));
        }
        if let Some(status) = filter.status {
            params.push(status.as_str().to_string());
            conditions.push(format!("status = ${}", params.len()));
        }
        if let Some(election) = &filter.election_id {
            params.push(election.as_str().to_string());
            conditions.push(format!("election_id = ${}", params.len()));
        }
        match filter.direction {
            Some(FlowDirection::Incoming) => conditions.push(
                "account_id = $1 AND credit_bucket IS NOT NULL AND debit_bucket IS NULL"
                    .to_string(),
            ),
            Some(FlowDirection::Outgoing) => conditions.push(
                "((account_id = $1 AND debit_bucket IS NOT NULL AND credit_bucket IS NULL) \
                 OR (payer_id = $1 AND account_id <> $1))"
                    .to_string(),
            ),
            None => {}
        }
        let where_clause = conditions.join(" AND ");

        let count_query = format!("SELECT COUNT(*) FROM wallet_transactions WHERE {where_clause}");
        let mut count_builder = sqlx::query_as::<_, (i64,)>(&count_query);
        for param in &params {
            count_builder = count_builder.bind(param);
        }
        let (total,) = count_builder
            .fetch_one(&self.pool)
            .await
            .map_err(query_error)?;

        let query = format!(
            r#"
            SELECT {TRANSACTION_COLUMNS}
            FROM wallet_transactions
            WHERE {where_clause}
            ORDER BY seq {order_sql}
            LIMIT {} OFFSET {}
            "#,
            page.limit,
            page.offset()
        );
        let mut query_builder = sqlx::query_as::<_, TransactionRow>(&query);
        for param in &params {
            query_builder = query_builder.bind(param);
        }
        let items = query_builder
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?
            .into_iter()
            .map(TransactionRow::into_transaction)
            .collect::<StorageResult<Vec<_>>>()?;

        Ok(Page::new(items, page, total as u64))
    }

    async fn find_by_reference(
        &self,
        gateway: Gateway,
        reference: &str,
    ) -> StorageResult<Vec<Transaction>> {
        self.fetch_where(
            "gateway = $1 AND gateway_reference = $2",
            &[gateway.as_str(), reference],
        )
        .await
    }

    async fn find_successful_fee(
        &self,
        voter: &AccountId,
        election: &ElectionId,
    ) -> StorageResult<Option<Transaction>> {
        let rows = self
            .fetch_where(
                "kind = 'voter_fee_payment' AND status = 'success' \
                 AND payer_id = $1 AND election_id = $2",
                &[voter.as_str(), election.as_str()],
            )
            .await?;
        Ok(rows.into_iter().next())
    }

    async fn voter_fees(&self, election: &ElectionId) -> StorageResult<Vec<Transaction>> {
        self.fetch_where(
            "kind = 'voter_fee_payment' AND status = 'success' AND election_id = $1",
            &[election.as_str()],
        )
        .await
    }

    async fn locked_funds(&self, creator: &AccountId) -> StorageResult<Vec<LockedFunds>> {
        let rows = sqlx::query_as::<_, LockedRow>(
            r#"
            SELECT t.election_id,
                   COUNT(*) AS participants,
                   SUM(t.amount_cents)::BIGINT AS total_cents,
                   MIN(t.created_at) AS oldest_payment_at
            FROM wallet_transactions t
            WHERE t.kind = 'voter_fee_payment'
              AND t.status = 'success'
              AND t.account_id = $1
              AND t.election_id IS NOT NULL
              AND NOT EXISTS (
                  SELECT 1 FROM election_settlements s WHERE s.election_id = t.election_id
              )
            GROUP BY t.election_id
            ORDER BY t.election_id
            "#,
        )
        .bind(creator.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(query_error)?;

        rows.into_iter().map(LockedRow::into_locked_funds).collect()
    }

    async fn stale_pending(&self, before: DateTime<Utc>) -> StorageResult<Vec<Transaction>> {
        let query = format!(
            "SELECT {TRANSACTION_COLUMNS} FROM wallet_transactions \
             WHERE status = 'pending' AND gateway IS NOT NULL AND created_at < $1 ORDER BY seq"
        );
        sqlx::query_as::<_, TransactionRow>(&query)
            .bind(before)
            .fetch_all(&self.pool)
            .await
            .map_err(query_error)?
            .into_iter()
            .map(TransactionRow::into_transaction)
            .collect()
    }

    async fn pending_withdrawals(&self) -> StorageResult<Vec<Transaction>> {
        self.fetch_where("kind = 'withdrawal' AND status = 'pending'", &[])
            .await
    }

    async fn analytics(&self, account: &AccountId) -> StorageResult<WalletAnalytics> {
        let row = sqlx::query_as::<_, AnalyticsRow>(
            r#"
            SELECT
                COUNT(*) AS transaction_count,
                COALESCE(SUM(amount_cents) FILTER (
                    WHERE account_id = $1 AND kind = 'deposit' AND status = 'success'
                ), 0)::BIGINT AS total_deposits,
                COALESCE(SUM(amount_cents) FILTER (
                    WHERE account_id = $1 AND kind = 'withdrawal' AND status = 'success'
                ), 0)::BIGINT AS total_withdrawals,
                COALESCE(SUM(amount_cents) FILTER (
                    WHERE account_id = $1 AND kind = 'withdrawal' AND status = 'pending'
                ), 0)::BIGINT AS pending_withdrawals,
                COALESCE(SUM(amount_cents) FILTER (
                    WHERE account_id = $1 AND kind = 'prize_distribution' AND status = 'success'
                ), 0)::BIGINT AS total_prizes,
                COALESCE(SUM(net_cents) FILTER (
                    WHERE account_id = $1 AND kind = 'voter_fee_payment' AND status = 'success'
                ), 0)::BIGINT AS total_election_fees_earned,
                COALESCE(SUM(gross_cents) FILTER (
                    WHERE payer_id = $1 AND kind = 'voter_fee_payment' AND status = 'success'
                ), 0)::BIGINT AS total_election_fees_paid,
                COALESCE(SUM(amount_cents) FILTER (
                    WHERE account_id = $1 AND kind = 'refund' AND status = 'success'
                      AND credit_bucket IS NOT NULL
                ), 0)::BIGINT AS total_refunds
            FROM wallet_transactions
            WHERE account_id = $1 OR payer_id = $1
            "#,
        )
        .bind(account.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(query_error)?;

        row.into_analytics()
    }
}

/// Insert one ledger row inside an open database transaction.
pub(super) async fn insert_transaction(
    conn: &mut PgConnection,
    txn: &Transaction,
) -> StorageResult<()> {
    sqlx::query(
        r#"
        INSERT INTO wallet_transactions (
            id, account_id, payer_id, kind, amount_cents, debit_bucket, credit_bucket,
            gross_cents, gateway_fee_cents, platform_fee_cents, net_cents, status,
            election_id, deposit_id, gateway, gateway_reference, description, details,
            created_at, resolved_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20)
        "#,
    )
    .bind(txn.id.as_uuid())
    .bind(txn.account_id.as_str())
    .bind(txn.payer_id.as_ref().map(|p| p.as_str()))
    .bind(txn.kind.as_str())
    .bind(txn.amount.cents())
    .bind(txn.debit.map(|b| b.as_str()))
    .bind(txn.credit.map(|b| b.as_str()))
    .bind(txn.gross_amount.cents())
    .bind(txn.gateway_fee.cents())
    .bind(txn.platform_fee.cents())
    .bind(txn.net_amount.cents())
    .bind(txn.status.as_str())
    .bind(txn.election_id.as_ref().map(|e| e.as_str()))
    .bind(txn.deposit_id.map(|d| d.0))
    .bind(txn.gateway.map(|g| g.as_str()))
    .bind(txn.gateway_reference.as_deref())
    .bind(&txn.description)
    .bind(&txn.details)
    .bind(txn.created_at)
    .bind(txn.resolved_at)
    .execute(&mut *conn)
    .await
    .map_err(query_error)?;

    Ok(())
}

/// Database row representation for Transaction.
#[derive(sqlx::FromRow)]
pub(super) struct TransactionRow {
    id: Uuid,
    account_id: String,
    payer_id: Option<String>,
    kind: String,
    amount_cents: i64,
    debit_bucket: Option<String>,
    credit_bucket: Option<String>,
    gross_cents: i64,
    gateway_fee_cents: i64,
    platform_fee_cents: i64,
    net_cents: i64,
    status: String,
    election_id: Option<String>,
    deposit_id: Option<Uuid>,
    gateway: Option<String>,
    gateway_reference: Option<String>,
    description: String,
    details: serde_json::Value,
    created_at: DateTime<Utc>,
    resolved_at: Option<DateTime<Utc>>,
}

impl TransactionRow {
    pub(super) fn into_transaction(self) -> StorageResult<Transaction> {
        Ok(Transaction {
            id: TransactionId(self.id),
            account_id: AccountId::from(self.account_id),
            payer_id: self.payer_id.map(AccountId::from),
            kind: parse_text(&self.kind, "wallet_transactions.kind")?,
            amount: cents(self.amount_cents, "wallet_transactions.amount_cents")?,
            debit: parse_optional_text(self.debit_bucket.as_deref(), "wallet_transactions.debit_bucket")?,
            credit: parse_optional_text(
                self.credit_bucket.as_deref(),
                "wallet_transactions.credit_bucket",
            )?,
            gross_amount: cents(self.gross_cents, "wallet_transactions.gross_cents")?,
            gateway_fee: cents(self.gateway_fee_cents, "wallet_transactions.gateway_fee_cents")?,
            platform_fee: cents(self.platform_fee_cents, "wallet_transactions.platform_fee_cents")?,
            net_amount: cents(self.net_cents, "wallet_transactions.net_cents")?,
            status: parse_text(&self.status, "wallet_transactions.status")?,
            election_id: self.election_id.map(ElectionId::from),
            deposit_id: self.deposit_id.map(DepositId),
            gateway: parse_optional_text(self.gateway.as_deref(), "wallet_transactions.gateway")?,
            gateway_reference: self.gateway_reference,
            description: self.description,
            details: self.details,
            created_at: self.created_at,
            resolved_at: self.resolved_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LockedRow {
    election_id: String,
    participants: i64,
    total_cents: i64,
    oldest_payment_at: DateTime<Utc>,
}

impl LockedRow {
    fn into_locked_funds(self) -> StorageResult<LockedFunds> {
        let total = cents(self.total_cents, "locked_funds.total_cents")?;
        let count = u32::try_from(self.participants).unwrap_or(u32::MAX);
        Ok(LockedFunds {
            election_id: ElectionId::from(self.election_id),
            participant_count: count,
            fee_per_participant: total
                .split_even(count)
                .map(|(share, _)| share)
                .unwrap_or(Money::ZERO),
            total_locked: total,
            oldest_payment_at: self.oldest_payment_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct AnalyticsRow {
    transaction_count: i64,
    total_deposits: i64,
    total_withdrawals: i64,
    pending_withdrawals: i64,
    total_prizes: i64,
    total_election_fees_earned: i64,
    total_election_fees_paid: i64,
    total_refunds: i64,
}

impl AnalyticsRow {
    fn into_analytics(self) -> StorageResult<WalletAnalytics> {
        Ok(WalletAnalytics {
            total_deposits: cents(self.total_deposits, "analytics.total_deposits")?,
            total_withdrawals: cents(self.total_withdrawals, "analytics.total_withdrawals")?,
            pending_withdrawals: cents(self.pending_withdrawals, "analytics.pending_withdrawals")?,
            total_prizes: cents(self.total_prizes, "analytics.total_prizes")?,
            total_election_fees_earned: cents(
                self.total_election_fees_earned,
                "analytics.total_election_fees_earned",
            )?,
            total_election_fees_paid: cents(
                self.total_election_fees_paid,
                "analytics.total_election_fees_paid",
            )?,
            total_refunds: cents(self.total_refunds, "analytics.total_refunds")?,
            transaction_count: self.transaction_count as u64,
        })
    }
}
