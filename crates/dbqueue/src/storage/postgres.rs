//! PostgreSQL implementation of QueueStore
//!
//! - One row per task, several queues per table told apart by `queue_name`
//! - Lease acquisition with `FOR UPDATE SKIP LOCKED`
//! - Lease deadline computed from the database clock (`now()`)

use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnection, PgRow};
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::{debug, error, instrument};

use super::store::*;
use crate::api::TaskRecord;
use crate::retry::TaskRetryStrategy;
use crate::settings::{QueueLocation, QueueShardId};

const TASK_COLUMNS: &str =
    "id, payload, attempt, create_time, process_time, correlation_id, actor";

/// DDL for a queue table and its pick index
///
/// `migrations/0001_queue_tasks.sql` is this script for `queue_tasks`.
pub fn schema_sql(location: &QueueLocation) -> String {
    let table = location.table_name();
    let index = format!("{}_pick_idx", table.replace('.', "_"));
    format!(
        r#"
        CREATE TABLE IF NOT EXISTS {table} (
            id             BIGSERIAL PRIMARY KEY,
            queue_name     TEXT        NOT NULL,
            payload        TEXT,
            create_time    TIMESTAMPTZ NOT NULL DEFAULT now(),
            process_time   TIMESTAMPTZ NOT NULL DEFAULT now(),
            attempt        INTEGER     NOT NULL DEFAULT 0,
            correlation_id TEXT,
            actor          TEXT
        );
        CREATE INDEX IF NOT EXISTS {index} ON {table} (queue_name, process_time, id);
        "#
    )
}

/// PostgreSQL implementation of QueueStore
///
/// # Example
///
/// ```ignore
/// use dbqueue::settings::QueueShardId;
/// use dbqueue::storage::PostgresQueueStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://localhost/mydb").await?;
/// let store = PostgresQueueStore::new(QueueShardId::new("main"), pool);
/// ```
#[derive(Clone)]
pub struct PostgresQueueStore {
    shard_id: QueueShardId,
    pool: PgPool,
}

impl PostgresQueueStore {
    pub fn new(shard_id: QueueShardId, pool: PgPool) -> Self {
        Self { shard_id, pool }
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue table of `location` if it does not exist
    pub async fn ensure_schema(&self, location: &QueueLocation) -> Result<(), StoreError> {
        let sql = schema_sql(location);
        sqlx::raw_sql(&sql)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                error!(table = location.table_name(), "Failed to create queue table: {}", e);
                StoreError::Database(e.to_string())
            })?;
        Ok(())
    }
}

#[async_trait]
impl QueueStore for PostgresQueueStore {
    fn shard_id(&self) -> &QueueShardId {
        &self.shard_id
    }

    async fn begin(&self) -> Result<Box<dyn StoreTransaction>, StoreError> {
        let tx = self.pool.begin().await.map_err(|e| {
            error!(shard = %self.shard_id, "Failed to begin transaction: {}", e);
            StoreError::Database(e.to_string())
        })?;
        Ok(Box::new(PostgresTransaction { tx: Some(tx) }))
    }
}

/// Dropping the inner sqlx transaction rolls it back
struct PostgresTransaction {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PostgresTransaction {
    fn conn(&mut self) -> Result<&mut PgConnection, StoreError> {
        self.tx.as_deref_mut().ok_or(StoreError::TransactionFinished)
    }
}

#[async_trait]
impl StoreTransaction for PostgresTransaction {
    #[instrument(skip(self, task))]
    async fn enqueue(
        &mut self,
        location: &QueueLocation,
        task: NewTask,
    ) -> Result<i64, StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {} (queue_name, payload, process_time, correlation_id, actor)
            VALUES ($1, $2, now() + make_interval(secs => $3), $4, $5)
            RETURNING id
            "#,
            location.table_name()
        );

        let row = sqlx::query(&sql)
            .bind(location.queue_name())
            .bind(task.payload)
            .bind(task.execution_delay.as_secs_f64())
            .bind(task.correlation_id)
            .bind(task.actor)
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| {
                error!("Failed to enqueue task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        let id: i64 = row
            .try_get("id")
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
        debug!(task_id = id, "enqueued task");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn pick_task(
        &mut self,
        location: &QueueLocation,
        retry: &TaskRetryStrategy,
    ) -> Result<Option<TaskRecord>, StoreError> {
        let table = location.table_name();

        // Oldest eligible row nobody else holds; the lock lasts until commit
        let select = format!(
            r#"
            SELECT id, attempt
            FROM {table}
            WHERE queue_name = $1
              AND process_time <= now()
            ORDER BY process_time, id
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#
        );
        let candidate = sqlx::query(&select)
            .bind(location.queue_name())
            .fetch_optional(self.conn()?)
            .await
            .map_err(|e| {
                error!("Failed to select task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        let Some(candidate) = candidate else {
            return Ok(None);
        };
        let id: i64 = candidate
            .try_get("id")
            .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
        let next = next_attempt(attempts_from_row(&candidate)?);
        let attempts_count = next.unsigned_abs();
        let lease = retry.delay(attempts_count);

        let update = format!(
            r#"
            UPDATE {table}
            SET attempt = $1,
                process_time = now() + make_interval(secs => $2)
            WHERE id = $3
            RETURNING {TASK_COLUMNS}
            "#
        );
        let row = sqlx::query(&update)
            .bind(next)
            .bind(lease.as_secs_f64())
            .bind(id)
            .fetch_one(self.conn()?)
            .await
            .map_err(|e| {
                error!(task_id = id, "Failed to lease task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        let record = record_from_row(&row)?;
        debug!(task_id = id, attempts_count, ?lease, "picked task");
        Ok(Some(record))
    }

    #[instrument(skip(self))]
    async fn delete_task(&mut self, location: &QueueLocation, id: i64) -> Result<bool, StoreError> {
        let sql = format!(
            "DELETE FROM {} WHERE queue_name = $1 AND id = $2",
            location.table_name()
        );

        let result = sqlx::query(&sql)
            .bind(location.queue_name())
            .bind(id)
            .execute(self.conn()?)
            .await
            .map_err(|e| {
                error!(task_id = id, "Failed to delete task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self))]
    async fn reenqueue(
        &mut self,
        location: &QueueLocation,
        id: i64,
        delay: Duration,
        reset_attempts: bool,
    ) -> Result<bool, StoreError> {
        let sql = format!(
            r#"
            UPDATE {}
            SET process_time = now() + make_interval(secs => $1),
                attempt = CASE WHEN $2 THEN 0 ELSE attempt END
            WHERE queue_name = $3 AND id = $4
            "#,
            location.table_name()
        );

        let result = sqlx::query(&sql)
            .bind(delay.as_secs_f64())
            .bind(reset_attempts)
            .bind(location.queue_name())
            .bind(id)
            .execute(self.conn()?)
            .await
            .map_err(|e| {
                error!(task_id = id, "Failed to reenqueue task: {}", e);
                StoreError::Database(e.to_string())
            })?;

        Ok(result.rows_affected() > 0)
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.commit().await.map_err(|e| {
            error!("Failed to commit transaction: {}", e);
            StoreError::Database(e.to_string())
        })
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.rollback()
            .await
            .map_err(|e| StoreError::Database(e.to_string()))
    }
}

fn attempts_from_row(row: &PgRow) -> Result<u32, StoreError> {
    let attempt: i32 = row
        .try_get("attempt")
        .map_err(|e| StoreError::InvalidRow(e.to_string()))?;
    u32::try_from(attempt).map_err(|_| StoreError::InvalidRow(format!("negative attempt {attempt}")))
}

/// Attempt count after one more pick, saturating at the column's maximum
fn next_attempt(current: u32) -> i32 {
    i32::try_from(current).map_or(i32::MAX, |n| n.saturating_add(1))
}

fn record_from_row(row: &PgRow) -> Result<TaskRecord, StoreError> {
    let invalid = |e: sqlx::Error| StoreError::InvalidRow(e.to_string());

    Ok(TaskRecord {
        id: row.try_get("id").map_err(invalid)?,
        payload: row.try_get("payload").map_err(invalid)?,
        attempts_count: attempts_from_row(row)?,
        create_date: row.try_get("create_time").map_err(invalid)?,
        process_time: row.try_get("process_time").map_err(invalid)?,
        correlation_id: row.try_get("correlation_id").map_err(invalid)?,
        actor: row.try_get("actor").map_err(invalid)?,
    })
}
