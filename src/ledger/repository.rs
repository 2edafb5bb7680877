use super::models::*;
use super::LedgerStore;
use crate::error::{AppError, AppResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::types::BigDecimal;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use std::str::FromStr;
use tracing::debug;

const SAGA_COLUMNS: &str = r#"
    id, kind, address, step, status, input_amount, converted_amount, principal_amount,
    shares_amount, assets_returned, yield_amount, rate, rate_source, yield_status,
    pending_tx, pending_from_block, yield_tx, yield_from_block, attempt, last_error,
    next_attempt_at, origin_tx, origin_log_index, origin_block, trigger, created_at, updated_at
"#;

const UNFINISHED: &str = "('PENDING', 'STEP_CONFIRMED', 'FAILED_RETRYABLE', 'CONFIRMATION_UNKNOWN')";

/// Ledger repository - THE source of truth for positions and sagas
pub struct LedgerRepository {
    pub pool: PgPool,
}

impl LedgerRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn begin_tx(&self) -> AppResult<Transaction<'_, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    async fn lock_position(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        address: &str,
    ) -> AppResult<UserPosition> {
        sqlx::query(
            r#"
            INSERT INTO user_positions (address)
            VALUES ($1)
            ON CONFLICT (address) DO NOTHING
            "#,
        )
        .bind(address)
        .execute(&mut **tx)
        .await?;

        let row = sqlx::query_as::<_, PositionRow>(
            r#"
            SELECT address, principal, remote_shares, state, created_at, updated_at
            FROM user_positions
            WHERE address = $1
            FOR UPDATE
            "#,
        )
        .bind(address)
        .fetch_one(&mut **tx)
        .await?;

        row.try_into()
    }

    async fn write_position(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        position: &UserPosition,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            UPDATE user_positions
            SET principal = $2, remote_shares = $3, state = $4, updated_at = NOW()
            WHERE address = $1
            "#,
        )
        .bind(&position.address)
        .bind(to_numeric(position.principal)?)
        .bind(to_numeric(position.remote_shares)?)
        .bind(position.state)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl LedgerStore for LedgerRepository {
    async fn get_position(&self, address: &str) -> AppResult<Option<UserPosition>> {
        let row = sqlx::query_as::<_, PositionRow>(
            r#"
            SELECT address, principal, remote_shares, state, created_at, updated_at
            FROM user_positions
            WHERE address = $1
            "#,
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.map(UserPosition::try_from).transpose()
    }

    async fn insert_saga(&self, saga: &SagaRecord) -> AppResult<bool> {
        let sql = format!(
            "INSERT INTO sagas ({SAGA_COLUMNS}) VALUES ({}) ON CONFLICT (id) DO NOTHING",
            placeholders(27)
        );
        let result = bind_saga(sqlx::query(&sql), SagaParams::try_from(saga)?)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_saga(&self, id: &str) -> AppResult<Option<SagaRecord>> {
        let sql = format!("SELECT {SAGA_COLUMNS} FROM sagas WHERE id = $1");
        let row = sqlx::query_as::<_, SagaRow>(&sql)
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(SagaRecord::try_from).transpose()
    }

    async fn apply_transition(
        &self,
        saga: &SagaRecord,
        effect: Option<PositionEffect>,
    ) -> AppResult<Option<UserPosition>> {
        let mut tx = self.begin_tx().await?;

        let sql = format!(
            r#"
            UPDATE sagas SET (
                kind, address, step, status, input_amount, converted_amount, principal_amount,
                shares_amount, assets_returned, yield_amount, rate, rate_source, yield_status,
                pending_tx, pending_from_block, yield_tx, yield_from_block, attempt, last_error,
                next_attempt_at, origin_tx, origin_log_index, origin_block, trigger, created_at,
                updated_at
            ) = ({})
            WHERE id = $1
            "#,
            (2..=27).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ")
        );
        let result = bind_saga(sqlx::query(&sql), SagaParams::try_from(saga)?)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(format!("saga {}", saga.id)));
        }

        let position = match effect {
            Some(effect) => {
                let mut position = self.lock_position(&mut tx, &saga.address).await?;
                position.apply(&effect)?;
                self.write_position(&mut tx, &position).await?;
                Some(position)
            }
            None => None,
        };

        tx.commit().await?;

        debug!(
            saga_id = %saga.id,
            step = %saga.step,
            status = %saga.status,
            "saga transition committed"
        );
        Ok(position)
    }

    async fn list_sagas_by_status(&self, statuses: &[SagaStatus]) -> AppResult<Vec<SagaRecord>> {
        let statuses: Vec<String> = statuses.iter().map(|s| s.as_str().to_string()).collect();
        let sql = format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE status::TEXT = ANY($1) ORDER BY created_at, id"
        );
        let rows = sqlx::query_as::<_, SagaRow>(&sql)
            .bind(statuses)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(SagaRecord::try_from).collect()
    }

    async fn list_user_sagas(&self, address: &str, limit: i64) -> AppResult<Vec<SagaRecord>> {
        let sql = format!(
            "SELECT {SAGA_COLUMNS} FROM sagas WHERE address = $1 ORDER BY created_at DESC LIMIT $2"
        );
        let rows = sqlx::query_as::<_, SagaRow>(&sql)
            .bind(address)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;

        rows.into_iter().map(SagaRecord::try_from).collect()
    }

    async fn ledger_totals(&self) -> AppResult<LedgerTotals> {
        let (principal, shares, active, withdrawing) =
            sqlx::query_as::<_, (BigDecimal, BigDecimal, i64, i64)>(
                r#"
                SELECT
                    COALESCE(SUM(principal), 0),
                    COALESCE(SUM(remote_shares), 0),
                    COUNT(*) FILTER (WHERE state = 'ACTIVE'),
                    COUNT(*) FILTER (WHERE state = 'WITHDRAWING')
                FROM user_positions
                "#,
            )
            .fetch_one(&self.pool)
            .await?;

        Ok(LedgerTotals {
            total_principal: from_numeric(&principal)?,
            total_shares: from_numeric(&shares)?,
            active_users: active.max(0) as u64,
            withdrawing_users: withdrawing.max(0) as u64,
        })
    }

    async fn saga_stats(&self, stale_before: DateTime<Utc>) -> AppResult<SagaStats> {
        let rows = sqlx::query_as::<_, (SagaKind, SagaStatus, i64)>(
            r#"
            SELECT kind, status, COUNT(*)
            FROM sagas
            GROUP BY kind, status
            ORDER BY kind, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let realized: BigDecimal = sqlx::query_scalar(
            "SELECT COALESCE(SUM(yield_amount), 0) FROM sagas WHERE kind = 'WITHDRAW'",
        )
        .fetch_one(&self.pool)
        .await?;

        let stale_sql = format!(
            "SELECT COUNT(*) FROM sagas WHERE status IN {UNFINISHED} AND updated_at < $1"
        );
        let stale: i64 = sqlx::query_scalar(&stale_sql)
            .bind(stale_before)
            .fetch_one(&self.pool)
            .await?;

        Ok(SagaStats {
            counts: rows
                .into_iter()
                .map(|(kind, status, count)| SagaCount {
                    kind,
                    status,
                    count: count.max(0) as u64,
                })
                .collect(),
            realized_yield: from_numeric(&realized)?,
            stale: stale.max(0) as u64,
        })
    }

    async fn get_cursor(&self, stream: &str) -> AppResult<Option<u64>> {
        let block: Option<i64> =
            sqlx::query_scalar("SELECT last_block FROM watcher_cursors WHERE stream = $1")
                .bind(stream)
                .fetch_optional(&self.pool)
                .await?;

        block.map(from_block_number).transpose()
    }

    async fn set_cursor(&self, stream: &str, last_block: u64) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO watcher_cursors (stream, last_block)
            VALUES ($1, $2)
            ON CONFLICT (stream) DO UPDATE
            SET last_block = EXCLUDED.last_block, updated_at = NOW()
            WHERE watcher_cursors.last_block < EXCLUDED.last_block
            "#,
        )
        .bind(stream)
        .bind(to_block_number(last_block)?)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn log_audit_event(
        &self,
        saga_id: &str,
        event_type: &str,
        details: serde_json::Value,
    ) -> AppResult<()> {
        sqlx::query(
            r#"
            INSERT INTO saga_audit (saga_id, event_type, details)
            VALUES ($1, $2, $3)
            "#,
        )
        .bind(saga_id)
        .bind(event_type)
        .bind(details)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_audit(&self, saga_id: &str) -> AppResult<Vec<AuditEntry>> {
        let rows = sqlx::query_as::<_, (String, String, serde_json::Value, DateTime<Utc>)>(
            r#"
            SELECT saga_id, event_type, details, created_at
            FROM saga_audit
            WHERE saga_id = $1
            ORDER BY id
            "#,
        )
        .bind(saga_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|(saga_id, event_type, details, created_at)| AuditEntry {
                saga_id,
                event_type,
                details,
                created_at,
            })
            .collect())
    }
}

// ========== ROW MAPPING ==========

#[derive(FromRow)]
struct PositionRow {
    address: String,
    principal: BigDecimal,
    remote_shares: BigDecimal,
    state: PositionState,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PositionRow> for UserPosition {
    type Error = AppError;

    fn try_from(row: PositionRow) -> AppResult<Self> {
        Ok(UserPosition {
            address: row.address,
            principal: from_numeric(&row.principal)?,
            remote_shares: from_numeric(&row.remote_shares)?,
            state: row.state,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(FromRow)]
struct SagaRow {
    id: String,
    kind: SagaKind,
    address: String,
    step: SagaStep,
    status: SagaStatus,
    input_amount: BigDecimal,
    converted_amount: Option<BigDecimal>,
    principal_amount: Option<BigDecimal>,
    shares_amount: Option<BigDecimal>,
    assets_returned: Option<BigDecimal>,
    yield_amount: Option<BigDecimal>,
    rate: Option<BigDecimal>,
    rate_source: Option<RateSource>,
    yield_status: YieldLeg,
    pending_tx: Option<String>,
    pending_from_block: Option<i64>,
    yield_tx: Option<String>,
    yield_from_block: Option<i64>,
    attempt: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    origin_tx: Option<String>,
    origin_log_index: Option<i64>,
    origin_block: Option<i64>,
    trigger: SagaTrigger,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<SagaRow> for SagaRecord {
    type Error = AppError;

    fn try_from(row: SagaRow) -> AppResult<Self> {
        let amount = |v: &Option<BigDecimal>| v.as_ref().map(from_numeric).transpose();
        let block = |v: Option<i64>| v.map(from_block_number).transpose();

        Ok(SagaRecord {
            input_amount: from_numeric(&row.input_amount)?,
            converted_amount: amount(&row.converted_amount)?,
            principal_amount: amount(&row.principal_amount)?,
            shares_amount: amount(&row.shares_amount)?,
            assets_returned: amount(&row.assets_returned)?,
            yield_amount: amount(&row.yield_amount)?,
            rate: row
                .rate
                .map(|r| Decimal::from_str(&r.to_string()))
                .transpose()?,
            rate_source: row.rate_source,
            yield_status: row.yield_status,
            pending_tx: row.pending_tx,
            pending_from_block: block(row.pending_from_block)?,
            yield_tx: row.yield_tx,
            yield_from_block: block(row.yield_from_block)?,
            attempt: row.attempt.max(0) as u32,
            last_error: row.last_error,
            next_attempt_at: row.next_attempt_at,
            origin_tx: row.origin_tx,
            origin_log_index: block(row.origin_log_index)?,
            origin_block: block(row.origin_block)?,
            trigger: row.trigger,
            created_at: row.created_at,
            updated_at: row.updated_at,
            id: row.id,
            kind: row.kind,
            address: row.address,
            step: row.step,
            status: row.status,
        })
    }
}

/// Column values in `SAGA_COLUMNS` order, converted for binding
struct SagaParams {
    id: String,
    kind: SagaKind,
    address: String,
    step: SagaStep,
    status: SagaStatus,
    input_amount: BigDecimal,
    converted_amount: Option<BigDecimal>,
    principal_amount: Option<BigDecimal>,
    shares_amount: Option<BigDecimal>,
    assets_returned: Option<BigDecimal>,
    yield_amount: Option<BigDecimal>,
    rate: Option<BigDecimal>,
    rate_source: Option<RateSource>,
    yield_status: YieldLeg,
    pending_tx: Option<String>,
    pending_from_block: Option<i64>,
    yield_tx: Option<String>,
    yield_from_block: Option<i64>,
    attempt: i32,
    last_error: Option<String>,
    next_attempt_at: Option<DateTime<Utc>>,
    origin_tx: Option<String>,
    origin_log_index: Option<i64>,
    origin_block: Option<i64>,
    trigger: SagaTrigger,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<&SagaRecord> for SagaParams {
    type Error = AppError;

    fn try_from(saga: &SagaRecord) -> AppResult<Self> {
        let amount = |v: Option<u128>| v.map(to_numeric).transpose();
        let block = |v: Option<u64>| v.map(to_block_number).transpose();

        Ok(SagaParams {
            id: saga.id.clone(),
            kind: saga.kind,
            address: saga.address.clone(),
            step: saga.step,
            status: saga.status,
            input_amount: to_numeric(saga.input_amount)?,
            converted_amount: amount(saga.converted_amount)?,
            principal_amount: amount(saga.principal_amount)?,
            shares_amount: amount(saga.shares_amount)?,
            assets_returned: amount(saga.assets_returned)?,
            yield_amount: amount(saga.yield_amount)?,
            rate: saga
                .rate
                .map(|r| {
                    BigDecimal::from_str(&r.to_string())
                        .map_err(|e| AppError::Internal(format!("rate conversion: {e}")))
                })
                .transpose()?,
            rate_source: saga.rate_source,
            yield_status: saga.yield_status,
            pending_tx: saga.pending_tx.clone(),
            pending_from_block: block(saga.pending_from_block)?,
            yield_tx: saga.yield_tx.clone(),
            yield_from_block: block(saga.yield_from_block)?,
            attempt: i32::try_from(saga.attempt)
                .map_err(|_| AppError::Internal("attempt counter overflow".into()))?,
            last_error: saga.last_error.clone(),
            next_attempt_at: saga.next_attempt_at,
            origin_tx: saga.origin_tx.clone(),
            origin_log_index: block(saga.origin_log_index)?,
            origin_block: block(saga.origin_block)?,
            trigger: saga.trigger,
            created_at: saga.created_at,
            updated_at: saga.updated_at,
        })
    }
}

fn bind_saga<'q>(
    query: Query<'q, Postgres, PgArguments>,
    p: SagaParams,
) -> Query<'q, Postgres, PgArguments> {
    query
        .bind(p.id)
        .bind(p.kind)
        .bind(p.address)
        .bind(p.step)
        .bind(p.status)
        .bind(p.input_amount)
        .bind(p.converted_amount)
        .bind(p.principal_amount)
        .bind(p.shares_amount)
        .bind(p.assets_returned)
        .bind(p.yield_amount)
        .bind(p.rate)
        .bind(p.rate_source)
        .bind(p.yield_status)
        .bind(p.pending_tx)
        .bind(p.pending_from_block)
        .bind(p.yield_tx)
        .bind(p.yield_from_block)
        .bind(p.attempt)
        .bind(p.last_error)
        .bind(p.next_attempt_at)
        .bind(p.origin_tx)
        .bind(p.origin_log_index)
        .bind(p.origin_block)
        .bind(p.trigger)
        .bind(p.created_at)
        .bind(p.updated_at)
}

fn placeholders(n: usize) -> String {
    (1..=n).map(|i| format!("${i}")).collect::<Vec<_>>().join(", ")
}

fn to_numeric(value: u128) -> AppResult<BigDecimal> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| AppError::Internal(format!("numeric conversion: {e}")))
}

fn from_numeric(value: &BigDecimal) -> AppResult<u128> {
    value
        .with_scale(0)
        .to_string()
        .parse::<u128>()
        .map_err(|e| AppError::Internal(format!("amount {value} out of range: {e}")))
}

fn to_block_number(value: u64) -> AppResult<i64> {
    i64::try_from(value).map_err(|_| AppError::Internal(format!("block number {value} out of range")))
}

fn from_block_number(value: i64) -> AppResult<u64> {
    u64::try_from(value).map_err(|_| AppError::Internal(format!("negative block number {value}")))
}
