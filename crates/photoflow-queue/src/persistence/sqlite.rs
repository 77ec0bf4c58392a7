//! SQLite implementation of QueueStore
//!
//! One table, `pipeline_queue`, holds every task. Claiming is a single
//! conditional UPDATE so concurrent pollers on the same database can never
//! take the same row. Timestamps are stored as unix milliseconds in INTEGER
//! columns; backoff is expressed by shifting `created_at` into the future.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::store::*;
use crate::retry::RetryPolicy;
use crate::task::TaskPayload;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS pipeline_queue (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    task_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    priority INTEGER NOT NULL DEFAULT 0,
    attempts INTEGER NOT NULL DEFAULT 0,
    max_attempts INTEGER NOT NULL DEFAULT 3,
    status TEXT NOT NULL DEFAULT 'pending',
    status_stage TEXT,
    error_message TEXT,
    created_at INTEGER NOT NULL,
    completed_at INTEGER
);

CREATE INDEX IF NOT EXISTS idx_pipeline_queue_claim
    ON pipeline_queue (status, priority DESC, created_at ASC, id ASC);

CREATE INDEX IF NOT EXISTS idx_pipeline_queue_status
    ON pipeline_queue (status);
"#;

const RETURNING_COLUMNS: &str = "id, payload, priority, attempts, max_attempts, \
     status, status_stage, error_message, created_at, completed_at";

/// SQLite implementation of QueueStore
pub struct SqliteQueueStore {
    pool: SqlitePool,
    retry_policy: RetryPolicy,
}

impl SqliteQueueStore {
    /// Create a store over an existing pool.
    pub fn new(pool: SqlitePool, retry_policy: RetryPolicy) -> Self {
        Self { pool, retry_policy }
    }

    /// Connect to a SQLite database URL and run migrations.
    ///
    /// Use `sqlite::memory:` for an ephemeral database (with a single
    /// connection, or each connection sees its own empty database).
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(database_url)
            .await?;

        let store = Self::new(pool, RetryPolicy::default());
        store.migrate().await?;
        Ok(store)
    }

    /// Create the queue table and indexes if they do not exist.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        info!("pipeline queue schema ready");
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(e: sqlx::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Serialization(format!("timestamp out of range: {ms}")))
}

fn row_to_record(row: &SqliteRow) -> Result<TaskRecord, StoreError> {
    let payload_json: String = row.try_get("payload")?;
    let payload: TaskPayload = serde_json::from_str(&payload_json)
        .map_err(|e| StoreError::Serialization(e.to_string()))?;

    let status_str: String = row.try_get("status")?;
    let status: TaskStatus = status_str
        .parse()
        .map_err(StoreError::Serialization)?;

    let attempts: i64 = row.try_get("attempts")?;
    let max_attempts: i64 = row.try_get("max_attempts")?;

    Ok(TaskRecord {
        id: row.try_get("id")?,
        payload,
        priority: row.try_get("priority")?,
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        status,
        status_stage: row.try_get("status_stage")?,
        error_message: row.try_get("error_message")?,
        created_at: from_millis(row.try_get("created_at")?)?,
        completed_at: row
            .try_get::<Option<i64>, _>("completed_at")?
            .map(from_millis)
            .transpose()?,
    })
}

#[async_trait]
impl QueueStore for SqliteQueueStore {
    #[instrument(skip(self, payload), fields(task_type = payload.kind()))]
    async fn insert_task(
        &self,
        payload: &TaskPayload,
        priority: i64,
        max_attempts: u32,
    ) -> Result<i64, StoreError> {
        let payload_json =
            serde_json::to_string(payload).map_err(|e| StoreError::Serialization(e.to_string()))?;

        let row = sqlx::query(
            "INSERT INTO pipeline_queue \
                 (task_type, payload, priority, max_attempts, status, created_at) \
             VALUES (?1, ?2, ?3, ?4, 'pending', ?5) \
             RETURNING id",
        )
        .bind(payload.kind())
        .bind(&payload_json)
        .bind(priority)
        .bind(max_attempts as i64)
        .bind(to_millis(Utc::now()))
        .fetch_one(&self.pool)
        .await?;

        let id: i64 = row.try_get("id")?;
        debug!(task_id = id, task_type = payload.kind(), priority, "task enqueued");
        Ok(id)
    }

    #[instrument(skip(self))]
    async fn claim_next(&self, worker_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        // The subquery picks the winner and the outer status guard makes the
        // write conditional, so two concurrent claims cannot both succeed on
        // the same row.
        let sql = format!(
            "UPDATE pipeline_queue \
             SET status = 'in-stages', status_stage = NULL \
             WHERE id = ( \
                 SELECT id FROM pipeline_queue \
                 WHERE status = 'pending' AND created_at <= ?1 \
                 ORDER BY priority DESC, created_at ASC, id ASC \
                 LIMIT 1 \
             ) AND status = 'pending' \
             RETURNING {RETURNING_COLUMNS}"
        );

        let row = sqlx::query(&sql)
            .bind(to_millis(Utc::now()))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let record = row_to_record(&row)?;
                debug!(worker_id, task_id = record.id, "claimed task");
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>, StoreError> {
        let sql = format!("SELECT {RETURNING_COLUMNS} FROM pipeline_queue WHERE id = ?1");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&self.pool).await?;
        row.as_ref().map(row_to_record).transpose()
    }

    async fn set_stage(&self, id: i64, stage: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE pipeline_queue SET status_stage = ?2 \
             WHERE id = ?1 AND status = 'in-stages'",
        )
        .bind(id)
        .bind(stage)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.require_exists(id).await?;
            debug!(task_id = id, stage, "stage update ignored");
        }
        Ok(())
    }

    async fn complete_task(&self, id: i64) -> Result<(), StoreError> {
        let result = sqlx::query(
            "UPDATE pipeline_queue \
             SET status = 'completed', status_stage = NULL, completed_at = ?2 \
             WHERE id = ?1 AND status = 'in-stages'",
        )
        .bind(id)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            self.require_exists(id).await?;
            debug!(task_id = id, "completion ignored");
        }
        Ok(())
    }

    #[instrument(skip(self, error))]
    async fn fail_task(&self, id: i64, error: &str) -> Result<TaskFailureOutcome, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(
            "SELECT attempts, max_attempts, status FROM pipeline_queue WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or(StoreError::TaskNotFound(id))?;

        let status: TaskStatus = row
            .try_get::<String, _>("status")?
            .parse()
            .map_err(StoreError::Serialization)?;

        if status != TaskStatus::InStages {
            debug!(task_id = id, %status, "failure report ignored");
            return Ok(TaskFailureOutcome::Ignored);
        }

        let attempts = row.try_get::<i64, _>("attempts")? as u32 + 1;
        let max_attempts = row.try_get::<i64, _>("max_attempts")? as u32;

        let outcome = if attempts < max_attempts {
            let delay = self.retry_policy.delay_after_failure(attempts);
            let eligible_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;

            sqlx::query(
                "UPDATE pipeline_queue \
                 SET status = 'pending', status_stage = NULL, error_message = NULL, \
                     attempts = ?2, created_at = ?3 \
                 WHERE id = ?1",
            )
            .bind(id)
            .bind(attempts as i64)
            .bind(to_millis(eligible_at))
            .execute(&mut *tx)
            .await?;

            TaskFailureOutcome::WillRetry {
                next_attempt: attempts + 1,
                delay,
            }
        } else {
            sqlx::query(
                "UPDATE pipeline_queue \
                 SET status = 'failed', status_stage = NULL, \
                     attempts = ?2, error_message = ?3 \
                 WHERE id = ?1",
            )
            .bind(id)
            .bind(attempts as i64)
            .bind(error)
            .execute(&mut *tx)
            .await?;

            TaskFailureOutcome::ExhaustedRetries
        };

        tx.commit().await?;
        Ok(outcome)
    }

    #[instrument(skip(self))]
    async fn recover_dead_tasks(&self, min_priority: i64) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE pipeline_queue \
             SET status = 'pending', status_stage = NULL, priority = MAX(priority, ?1) \
             WHERE status = 'in-stages'",
        )
        .bind(min_priority)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn queue_stats(&self) -> Result<QueueCounts, StoreError> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS n FROM pipeline_queue GROUP BY status",
        )
        .fetch_all(&self.pool)
        .await?;

        let mut counts = QueueCounts::default();
        for row in &rows {
            let status: TaskStatus = row
                .try_get::<String, _>("status")?
                .parse()
                .map_err(StoreError::Serialization)?;
            let n = row.try_get::<i64, _>("n")? as u64;

            match status {
                TaskStatus::Pending => counts.pending = n,
                TaskStatus::InStages => counts.in_stages = n,
                TaskStatus::Completed => counts.completed = n,
                TaskStatus::Failed => counts.failed = n,
            }
        }
        Ok(counts)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {RETURNING_COLUMNS} FROM pipeline_queue WHERE 1 = 1"
        ));

        if let Some(status) = filter.status {
            builder.push(" AND status = ").push_bind(status.as_str());
        }
        if let Some(ref task_type) = filter.task_type {
            builder.push(" AND task_type = ").push_bind(task_type.clone());
        }
        builder.push(" ORDER BY created_at DESC, id DESC");

        let rows = builder.build().fetch_all(&self.pool).await?;
        rows.iter().map(row_to_record).collect()
    }

    async fn reset_task(&self, id: i64) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query("SELECT status FROM pipeline_queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(StoreError::TaskNotFound(id))?;

        let status: TaskStatus = row
            .try_get::<String, _>("status")?
            .parse()
            .map_err(StoreError::Serialization)?;

        if status != TaskStatus::Failed {
            return Err(StoreError::InvalidTransition { id, status });
        }

        sqlx::query(
            "UPDATE pipeline_queue \
             SET status = 'pending', status_stage = NULL, error_message = NULL, \
                 attempts = 0, created_at = ?2, completed_at = NULL \
             WHERE id = ?1",
        )
        .bind(id)
        .bind(to_millis(Utc::now()))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn reset_all_failed(&self) -> Result<u64, StoreError> {
        let result = sqlx::query(
            "UPDATE pipeline_queue \
             SET status = 'pending', status_stage = NULL, error_message = NULL, \
                 attempts = 0, created_at = ?1, completed_at = NULL \
             WHERE status = 'failed'",
        )
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn clear_inactive(&self, filter: &ClearFilter) -> Result<ClearBreakdown, StoreError> {
        let cutoff = filter.cutoff(Utc::now()).map(to_millis);
        let mut tx = self.pool.begin().await?;
        let mut breakdown = ClearBreakdown::default();

        if filter.include_completed {
            let result = sqlx::query(
                "DELETE FROM pipeline_queue \
                 WHERE status = 'completed' AND (?1 IS NULL OR created_at <= ?1)",
            )
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            breakdown.completed = result.rows_affected();
        }

        if filter.include_failed {
            let result = sqlx::query(
                "DELETE FROM pipeline_queue \
                 WHERE status = 'failed' AND (?1 IS NULL OR created_at <= ?1)",
            )
            .bind(cutoff)
            .execute(&mut *tx)
            .await?;
            breakdown.failed = result.rows_affected();
        }

        tx.commit().await?;
        Ok(breakdown)
    }
}

impl SqliteQueueStore {
    async fn require_exists(&self, id: i64) -> Result<(), StoreError> {
        let exists = sqlx::query("SELECT 1 FROM pipeline_queue WHERE id = ?1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();

        if exists {
            Ok(())
        } else {
            Err(StoreError::TaskNotFound(id))
        }
    }
}
