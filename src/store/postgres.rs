use crate::config::DatabaseConfig;
use crate::model::{
    Direction, ErrorCode, ExceptionRecord, InMessage, InStatus, Operation, OutMessage, OutStatus,
};
use crate::reliability::RetryRecord;
use crate::store::{
    check_in_transition, check_out_transition, InMessageUpdate, InsertOutcome, MessageRepository,
    OutMessageFilter, OutMessageUpdate, RepositoryError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::str::FromStr;
use std::time::Duration;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS in_messages (
        ebms_message_id TEXT PRIMARY KEY,
        ref_to_message_id TEXT,
        message_type TEXT NOT NULL,
        pmode_id TEXT,
        mpc TEXT,
        status TEXT NOT NULL,
        operation TEXT NOT NULL,
        content_type TEXT NOT NULL,
        body BYTEA NOT NULL,
        insertion_time TIMESTAMPTZ NOT NULL,
        modification_time TIMESTAMPTZ NOT NULL)",
    "CREATE INDEX IF NOT EXISTS in_messages_operation ON in_messages (operation, insertion_time)",
    "CREATE TABLE IF NOT EXISTS out_messages (
        ebms_message_id TEXT PRIMARY KEY,
        ref_to_message_id TEXT,
        message_type TEXT NOT NULL,
        pmode_id TEXT,
        mep TEXT NOT NULL,
        mpc TEXT,
        status TEXT NOT NULL,
        operation TEXT NOT NULL,
        content_type TEXT NOT NULL,
        body BYTEA NOT NULL,
        insertion_time TIMESTAMPTZ NOT NULL,
        modification_time TIMESTAMPTZ NOT NULL)",
    "CREATE INDEX IF NOT EXISTS out_messages_operation ON out_messages (operation, mep, mpc, insertion_time)",
    "CREATE TABLE IF NOT EXISTS exceptions (
        id TEXT PRIMARY KEY,
        direction TEXT NOT NULL,
        ebms_ref_to_message_id TEXT,
        pmode_id TEXT,
        code TEXT,
        exception TEXT NOT NULL,
        message_body BYTEA,
        operation TEXT NOT NULL,
        insertion_time TIMESTAMPTZ NOT NULL,
        modification_time TIMESTAMPTZ NOT NULL)",
    "CREATE TABLE IF NOT EXISTS retry_records (
        key TEXT PRIMARY KEY,
        subject TEXT NOT NULL,
        retry_type TEXT NOT NULL,
        pmode_id TEXT,
        state TEXT NOT NULL,
        retry_count INTEGER NOT NULL,
        max_retries INTEGER NOT NULL,
        current_interval_ms BIGINT NOT NULL,
        min_interval_ms BIGINT NOT NULL,
        max_interval_ms BIGINT NOT NULL,
        factor DOUBLE PRECISION NOT NULL,
        next_due TIMESTAMPTZ NOT NULL,
        last_error TEXT,
        modification_time TIMESTAMPTZ NOT NULL)",
    "CREATE INDEX IF NOT EXISTS retry_records_due ON retry_records (state, next_due)",
];

/// sqlx-backed repository. Unique primary keys give insert-if-absent,
/// `FOR UPDATE SKIP LOCKED` gives competing agents disjoint claims.
#[derive(Clone)]
pub struct PostgresRepository {
    pool: PgPool,
}

impl PostgresRepository {
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, RepositoryError> {
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections.unwrap_or(5))
            .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs.unwrap_or(5)))
            .connect(&config.url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<(), RepositoryError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn lock_in_message(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        ebms_message_id: &str,
    ) -> Result<InMessage, RepositoryError> {
        let row = sqlx::query("SELECT * FROM in_messages WHERE ebms_message_id = $1 FOR UPDATE")
            .bind(ebms_message_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| RepositoryError::not_found("in_message", ebms_message_id))?;
        in_message_from_row(&row)
    }

    async fn lock_out_message(
        &self,
        tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
        ebms_message_id: &str,
    ) -> Result<OutMessage, RepositoryError> {
        let row = sqlx::query("SELECT * FROM out_messages WHERE ebms_message_id = $1 FOR UPDATE")
            .bind(ebms_message_id)
            .fetch_optional(&mut **tx)
            .await?
            .ok_or_else(|| RepositoryError::not_found("out_message", ebms_message_id))?;
        out_message_from_row(&row)
    }
}

#[async_trait]
impl MessageRepository for PostgresRepository {
    async fn insert_in_message(
        &self,
        message: InMessage,
    ) -> Result<InsertOutcome<InMessage>, RepositoryError> {
        let inserted = sqlx::query(
            "INSERT INTO in_messages (ebms_message_id, ref_to_message_id, message_type, pmode_id, mpc,
                status, operation, content_type, body, insertion_time, modification_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
             ON CONFLICT (ebms_message_id) DO NOTHING",
        )
        .bind(&message.ebms_message_id)
        .bind(&message.ref_to_message_id)
        .bind(message.message_type.as_str())
        .bind(&message.pmode_id)
        .bind(&message.mpc)
        .bind(message.status.as_str())
        .bind(message.operation.as_str())
        .bind(&message.content_type)
        .bind(&message.body)
        .bind(message.insertion_time)
        .bind(message.modification_time)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(InsertOutcome::Inserted);
        }
        let existing = self
            .get_in_message(&message.ebms_message_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("in_message", &message.ebms_message_id))?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn get_in_message(
        &self,
        ebms_message_id: &str,
    ) -> Result<Option<InMessage>, RepositoryError> {
        sqlx::query("SELECT * FROM in_messages WHERE ebms_message_id = $1")
            .bind(ebms_message_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| in_message_from_row(&row))
            .transpose()
    }

    async fn update_in_message(
        &self,
        ebms_message_id: &str,
        update: InMessageUpdate,
        now: DateTime<Utc>,
    ) -> Result<InMessage, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let mut row = self.lock_in_message(&mut tx, ebms_message_id).await?;

        if let Some(status) = update.status {
            check_in_transition(&row, status)?;
            row.status = status;
        }
        if let Some(operation) = update.operation {
            row.operation = operation;
        }
        if let Some(pmode_id) = update.pmode_id {
            row.pmode_id = Some(pmode_id);
        }
        if let Some(content_type) = update.content_type {
            row.content_type = content_type;
        }
        if let Some(body) = update.body {
            row.body = body;
        }
        row.modification_time = now;

        sqlx::query(
            "UPDATE in_messages SET status = $2, operation = $3, pmode_id = $4, content_type = $5,
                body = $6, modification_time = $7 WHERE ebms_message_id = $1",
        )
        .bind(ebms_message_id)
        .bind(row.status.as_str())
        .bind(row.operation.as_str())
        .bind(&row.pmode_id)
        .bind(&row.content_type)
        .bind(&row.body)
        .bind(row.modification_time)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn claim_in_messages(
        &self,
        from: Operation,
        to: Operation,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<InMessage>, RepositoryError> {
        let rows = sqlx::query(
            "UPDATE in_messages SET operation = $2, modification_time = $4
             WHERE ebms_message_id IN (
                SELECT ebms_message_id FROM in_messages WHERE operation = $1
                ORDER BY insertion_time LIMIT $3 FOR UPDATE SKIP LOCKED)
             RETURNING *",
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(limit_param(limit))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(in_message_from_row).collect()
    }

    async fn find_in_messages_by_status(
        &self,
        status: InStatus,
    ) -> Result<Vec<InMessage>, RepositoryError> {
        let rows = sqlx::query("SELECT * FROM in_messages WHERE status = $1 ORDER BY insertion_time")
            .bind(status.as_str())
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(in_message_from_row).collect()
    }

    async fn insert_out_message(
        &self,
        message: OutMessage,
    ) -> Result<InsertOutcome<OutMessage>, RepositoryError> {
        let inserted = sqlx::query(
            "INSERT INTO out_messages (ebms_message_id, ref_to_message_id, message_type, pmode_id, mep,
                mpc, status, operation, content_type, body, insertion_time, modification_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
             ON CONFLICT (ebms_message_id) DO NOTHING",
        )
        .bind(&message.ebms_message_id)
        .bind(&message.ref_to_message_id)
        .bind(message.message_type.as_str())
        .bind(&message.pmode_id)
        .bind(message.mep.as_str())
        .bind(&message.mpc)
        .bind(message.status.as_str())
        .bind(message.operation.as_str())
        .bind(&message.content_type)
        .bind(&message.body)
        .bind(message.insertion_time)
        .bind(message.modification_time)
        .execute(&self.pool)
        .await?
        .rows_affected();

        if inserted == 1 {
            return Ok(InsertOutcome::Inserted);
        }
        let existing = self
            .get_out_message(&message.ebms_message_id)
            .await?
            .ok_or_else(|| RepositoryError::not_found("out_message", &message.ebms_message_id))?;
        Ok(InsertOutcome::Existing(existing))
    }

    async fn get_out_message(
        &self,
        ebms_message_id: &str,
    ) -> Result<Option<OutMessage>, RepositoryError> {
        sqlx::query("SELECT * FROM out_messages WHERE ebms_message_id = $1")
            .bind(ebms_message_id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| out_message_from_row(&row))
            .transpose()
    }

    async fn update_out_message(
        &self,
        ebms_message_id: &str,
        update: OutMessageUpdate,
        now: DateTime<Utc>,
    ) -> Result<OutMessage, RepositoryError> {
        let mut tx = self.pool.begin().await?;
        let mut row = self.lock_out_message(&mut tx, ebms_message_id).await?;

        if let Some(status) = update.status {
            check_out_transition(&row, status)?;
            row.status = status;
        }
        if let Some(operation) = update.operation {
            row.operation = operation;
        }
        row.modification_time = now;

        sqlx::query(
            "UPDATE out_messages SET status = $2, operation = $3, modification_time = $4
             WHERE ebms_message_id = $1",
        )
        .bind(ebms_message_id)
        .bind(row.status.as_str())
        .bind(row.operation.as_str())
        .bind(row.modification_time)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(row)
    }

    async fn claim_out_messages(
        &self,
        from: Operation,
        to: Operation,
        filter: &OutMessageFilter,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<OutMessage>, RepositoryError> {
        let rows = sqlx::query(
            "UPDATE out_messages SET operation = $2, modification_time = $6
             WHERE ebms_message_id IN (
                SELECT ebms_message_id FROM out_messages
                WHERE operation = $1
                  AND ($3::TEXT IS NULL OR mep = $3)
                  AND ($4::TEXT IS NULL OR mpc = $4)
                ORDER BY insertion_time LIMIT $5 FOR UPDATE SKIP LOCKED)
             RETURNING *",
        )
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(filter.mep.map(|mep| mep.as_str()))
        .bind(filter.mpc.as_deref())
        .bind(limit_param(limit))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(out_message_from_row).collect()
    }

    async fn find_out_messages_by_status(
        &self,
        status: OutStatus,
    ) -> Result<Vec<OutMessage>, RepositoryError> {
        let rows =
            sqlx::query("SELECT * FROM out_messages WHERE status = $1 ORDER BY insertion_time")
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await?;
        rows.iter().map(out_message_from_row).collect()
    }

    async fn insert_exception(&self, record: ExceptionRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO exceptions (id, direction, ebms_ref_to_message_id, pmode_id, code, exception,
                message_body, operation, insertion_time, modification_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
        )
        .bind(&record.id)
        .bind(record.direction.to_string())
        .bind(&record.ebms_ref_to_message_id)
        .bind(&record.pmode_id)
        .bind(record.code.map(|code| code.code()))
        .bind(&record.exception)
        .bind(&record.message_body)
        .bind(record.operation.as_str())
        .bind(record.insertion_time)
        .bind(record.modification_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_exception(&self, id: &str) -> Result<Option<ExceptionRecord>, RepositoryError> {
        sqlx::query("SELECT * FROM exceptions WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| exception_from_row(&row))
            .transpose()
    }

    async fn update_exception_operation(
        &self,
        id: &str,
        operation: Operation,
        now: DateTime<Utc>,
    ) -> Result<(), RepositoryError> {
        let updated =
            sqlx::query("UPDATE exceptions SET operation = $2, modification_time = $3 WHERE id = $1")
                .bind(id)
                .bind(operation.as_str())
                .bind(now)
                .execute(&self.pool)
                .await?
                .rows_affected();
        if updated == 0 {
            return Err(RepositoryError::not_found("exception", id));
        }
        Ok(())
    }

    async fn claim_exceptions(
        &self,
        direction: Option<Direction>,
        from: Operation,
        to: Operation,
        limit: usize,
        now: DateTime<Utc>,
    ) -> Result<Vec<ExceptionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "UPDATE exceptions SET operation = $3, modification_time = $5
             WHERE id IN (
                SELECT id FROM exceptions
                WHERE operation = $2 AND ($1::TEXT IS NULL OR direction = $1)
                ORDER BY insertion_time LIMIT $4 FOR UPDATE SKIP LOCKED)
             RETURNING *",
        )
        .bind(direction.map(|dir| dir.to_string()))
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(limit_param(limit))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(exception_from_row).collect()
    }

    async fn exceptions_for_message(
        &self,
        ebms_message_id: &str,
    ) -> Result<Vec<ExceptionRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM exceptions WHERE ebms_ref_to_message_id = $1 ORDER BY insertion_time",
        )
        .bind(ebms_message_id)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(exception_from_row).collect()
    }

    async fn upsert_retry(&self, record: RetryRecord) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO retry_records (key, subject, retry_type, pmode_id, state, retry_count,
                max_retries, current_interval_ms, min_interval_ms, max_interval_ms, factor,
                next_due, last_error, modification_time)
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14)
             ON CONFLICT (key) DO UPDATE SET
                state = EXCLUDED.state,
                retry_count = EXCLUDED.retry_count,
                max_retries = EXCLUDED.max_retries,
                current_interval_ms = EXCLUDED.current_interval_ms,
                min_interval_ms = EXCLUDED.min_interval_ms,
                max_interval_ms = EXCLUDED.max_interval_ms,
                factor = EXCLUDED.factor,
                next_due = EXCLUDED.next_due,
                last_error = EXCLUDED.last_error,
                modification_time = EXCLUDED.modification_time",
        )
        .bind(record.key())
        .bind(&record.subject)
        .bind(record.retry_type.as_str())
        .bind(&record.pmode_id)
        .bind(record.state.as_str())
        .bind(i32::try_from(record.retry_count).unwrap_or(i32::MAX))
        .bind(i32::try_from(record.max_retries).unwrap_or(i32::MAX))
        .bind(millis(record.current_interval))
        .bind(millis(record.min_interval))
        .bind(millis(record.max_interval))
        .bind(record.factor)
        .bind(record.next_due)
        .bind(&record.last_error)
        .bind(record.modification_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_retry(&self, key: &str) -> Result<Option<RetryRecord>, RepositoryError> {
        sqlx::query("SELECT * FROM retry_records WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| retry_from_row(&row))
            .transpose()
    }

    async fn due_retries(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<RetryRecord>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM retry_records
             WHERE state IN ('sent', 'retry_scheduled') AND next_due <= $1
             ORDER BY next_due LIMIT $2",
        )
        .bind(now)
        .bind(limit_param(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(retry_from_row).collect()
    }
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}

fn from_millis(value: i64) -> Duration {
    Duration::from_millis(u64::try_from(value).unwrap_or_default())
}

fn parse_column<T>(row: &PgRow, column: &str) -> Result<T, RepositoryError>
where
    T: FromStr<Err = String>,
{
    let raw: String = row.try_get(column)?;
    raw.parse().map_err(RepositoryError::Corrupt)
}

fn in_message_from_row(row: &PgRow) -> Result<InMessage, RepositoryError> {
    Ok(InMessage {
        ebms_message_id: row.try_get("ebms_message_id")?,
        ref_to_message_id: row.try_get("ref_to_message_id")?,
        message_type: parse_column(row, "message_type")?,
        pmode_id: row.try_get("pmode_id")?,
        mpc: row.try_get("mpc")?,
        status: parse_column(row, "status")?,
        operation: parse_column(row, "operation")?,
        content_type: row.try_get("content_type")?,
        body: row.try_get("body")?,
        insertion_time: row.try_get("insertion_time")?,
        modification_time: row.try_get("modification_time")?,
    })
}

fn out_message_from_row(row: &PgRow) -> Result<OutMessage, RepositoryError> {
    Ok(OutMessage {
        ebms_message_id: row.try_get("ebms_message_id")?,
        ref_to_message_id: row.try_get("ref_to_message_id")?,
        message_type: parse_column(row, "message_type")?,
        pmode_id: row.try_get("pmode_id")?,
        mep: parse_column(row, "mep")?,
        mpc: row.try_get("mpc")?,
        status: parse_column(row, "status")?,
        operation: parse_column(row, "operation")?,
        content_type: row.try_get("content_type")?,
        body: row.try_get("body")?,
        insertion_time: row.try_get("insertion_time")?,
        modification_time: row.try_get("modification_time")?,
    })
}

fn exception_from_row(row: &PgRow) -> Result<ExceptionRecord, RepositoryError> {
    let code: Option<String> = row.try_get("code")?;
    Ok(ExceptionRecord {
        id: row.try_get("id")?,
        direction: parse_column(row, "direction")?,
        ebms_ref_to_message_id: row.try_get("ebms_ref_to_message_id")?,
        pmode_id: row.try_get("pmode_id")?,
        code: code.as_deref().and_then(ErrorCode::from_code),
        exception: row.try_get("exception")?,
        message_body: row.try_get("message_body")?,
        operation: parse_column(row, "operation")?,
        insertion_time: row.try_get("insertion_time")?,
        modification_time: row.try_get("modification_time")?,
    })
}

fn retry_from_row(row: &PgRow) -> Result<RetryRecord, RepositoryError> {
    let retry_count: i32 = row.try_get("retry_count")?;
    let max_retries: i32 = row.try_get("max_retries")?;
    Ok(RetryRecord {
        subject: row.try_get("subject")?,
        retry_type: parse_column(row, "retry_type")?,
        pmode_id: row.try_get("pmode_id")?,
        state: parse_column(row, "state")?,
        retry_count: u32::try_from(retry_count).unwrap_or_default(),
        max_retries: u32::try_from(max_retries).unwrap_or_default(),
        current_interval: from_millis(row.try_get("current_interval_ms")?),
        min_interval: from_millis(row.try_get("min_interval_ms")?),
        max_interval: from_millis(row.try_get("max_interval_ms")?),
        factor: row.try_get("factor")?,
        next_due: row.try_get("next_due")?,
        last_error: row.try_get("last_error")?,
        modification_time: row.try_get("modification_time")?,
    })
}
