//! In-memory implementation of QueueStore for testing

use std::cmp::Reverse;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use tracing::debug;

use super::store::*;
use crate::retry::RetryPolicy;
use crate::task::TaskPayload;

/// In-memory implementation of QueueStore
///
/// Primarily for tests. It provides the same claim/retry semantics as the
/// SQLite implementation, with a process-local map standing in for the table.
pub struct InMemoryQueueStore {
    rows: RwLock<HashMap<i64, TaskRecord>>,
    next_id: AtomicI64,
    retry_policy: RetryPolicy,
}

impl InMemoryQueueStore {
    /// Create a new in-memory store with the given backoff policy.
    pub fn new(retry_policy: RetryPolicy) -> Self {
        Self {
            rows: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
            retry_policy,
        }
    }

    /// Number of stored rows, regardless of status.
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    /// Whether the store holds no rows.
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Force a row into an arbitrary status, bypassing transition rules.
    ///
    /// Test hook for simulating a crash that strands a task `in-stages`.
    pub fn force_status(&self, id: i64, status: TaskStatus, stage: Option<&str>) {
        let mut rows = self.rows.write();
        if let Some(row) = rows.get_mut(&id) {
            row.status = status;
            row.status_stage = stage.map(str::to_string);
        }
    }
}

impl Default for InMemoryQueueStore {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}

#[async_trait]
impl QueueStore for InMemoryQueueStore {
    async fn insert_task(
        &self,
        payload: &TaskPayload,
        priority: i64,
        max_attempts: u32,
    ) -> Result<i64, StoreError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let record = TaskRecord {
            id,
            payload: payload.clone(),
            priority,
            attempts: 0,
            max_attempts,
            status: TaskStatus::Pending,
            status_stage: None,
            error_message: None,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.rows.write().insert(id, record);
        Ok(id)
    }

    async fn claim_next(&self, worker_id: &str) -> Result<Option<TaskRecord>, StoreError> {
        let now = Utc::now();
        let mut rows = self.rows.write();

        let winner = rows
            .values()
            .filter(|r| r.status == TaskStatus::Pending && r.created_at <= now)
            .min_by_key(|r| (Reverse(r.priority), r.created_at, r.id))
            .map(|r| r.id);

        let Some(row) = winner.and_then(|id| rows.get_mut(&id)) else {
            return Ok(None);
        };

        row.status = TaskStatus::InStages;
        row.status_stage = None;

        debug!(worker_id, task_id = row.id, "claimed task");
        Ok(Some(row.clone()))
    }

    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>, StoreError> {
        Ok(self.rows.read().get(&id).cloned())
    }

    async fn set_stage(&self, id: i64, stage: &str) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

        if row.status == TaskStatus::InStages {
            row.status_stage = Some(stage.to_string());
        } else {
            debug!(task_id = id, status = %row.status, "stage update ignored");
        }
        Ok(())
    }

    async fn complete_task(&self, id: i64) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

        if row.status != TaskStatus::InStages {
            debug!(task_id = id, status = %row.status, "completion ignored");
            return Ok(());
        }

        row.status = TaskStatus::Completed;
        row.status_stage = None;
        row.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_task(&self, id: i64, error: &str) -> Result<TaskFailureOutcome, StoreError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

        if row.status != TaskStatus::InStages {
            debug!(task_id = id, status = %row.status, "failure report ignored");
            return Ok(TaskFailureOutcome::Ignored);
        }

        row.attempts += 1;
        row.status_stage = None;

        if row.attempts < row.max_attempts {
            let delay = self.retry_policy.delay_after_failure(row.attempts);
            row.status = TaskStatus::Pending;
            row.error_message = None;
            row.created_at = Utc::now()
                + chrono::Duration::from_std(delay)
                    .map_err(|e| StoreError::Serialization(e.to_string()))?;

            Ok(TaskFailureOutcome::WillRetry {
                next_attempt: row.attempts + 1,
                delay,
            })
        } else {
            row.status = TaskStatus::Failed;
            row.error_message = Some(error.to_string());
            Ok(TaskFailureOutcome::ExhaustedRetries)
        }
    }

    async fn recover_dead_tasks(&self, min_priority: i64) -> Result<u64, StoreError> {
        let mut rows = self.rows.write();
        let mut recovered = 0;

        for row in rows.values_mut() {
            if row.status == TaskStatus::InStages {
                row.status = TaskStatus::Pending;
                row.status_stage = None;
                row.priority = row.priority.max(min_priority);
                recovered += 1;
            }
        }

        Ok(recovered)
    }

    async fn queue_stats(&self) -> Result<QueueCounts, StoreError> {
        let rows = self.rows.read();
        let mut counts = QueueCounts::default();
        for row in rows.values() {
            match row.status {
                TaskStatus::Pending => counts.pending += 1,
                TaskStatus::InStages => counts.in_stages += 1,
                TaskStatus::Completed => counts.completed += 1,
                TaskStatus::Failed => counts.failed += 1,
            }
        }
        Ok(counts)
    }

    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError> {
        let rows = self.rows.read();
        let mut matched: Vec<TaskRecord> = rows
            .values()
            .filter(|r| {
                if let Some(status) = filter.status {
                    if r.status != status {
                        return false;
                    }
                }
                if let Some(ref task_type) = filter.task_type {
                    if r.payload.kind() != task_type {
                        return false;
                    }
                }
                true
            })
            .cloned()
            .collect();

        matched.sort_by_key(|r| (Reverse(r.created_at), Reverse(r.id)));
        Ok(matched)
    }

    async fn reset_task(&self, id: i64) -> Result<(), StoreError> {
        let mut rows = self.rows.write();
        let row = rows.get_mut(&id).ok_or(StoreError::TaskNotFound(id))?;

        if row.status != TaskStatus::Failed {
            return Err(StoreError::InvalidTransition {
                id,
                status: row.status,
            });
        }

        reset_for_retry(row);
        Ok(())
    }

    async fn reset_all_failed(&self) -> Result<u64, StoreError> {
        let mut rows = self.rows.write();
        let mut count = 0;

        for row in rows.values_mut() {
            if row.status == TaskStatus::Failed {
                reset_for_retry(row);
                count += 1;
            }
        }

        Ok(count)
    }

    async fn clear_inactive(&self, filter: &ClearFilter) -> Result<ClearBreakdown, StoreError> {
        let cutoff = filter.cutoff(Utc::now());
        let mut rows = self.rows.write();
        let mut breakdown = ClearBreakdown::default();

        rows.retain(|_, row| {
            let matches_status = (filter.include_completed && row.status == TaskStatus::Completed)
                || (filter.include_failed && row.status == TaskStatus::Failed);
            let matches_age = cutoff.map_or(true, |c| row.created_at <= c);

            if matches_status && matches_age {
                match row.status {
                    TaskStatus::Completed => breakdown.completed += 1,
                    TaskStatus::Failed => breakdown.failed += 1,
                    _ => {}
                }
                false
            } else {
                true
            }
        });

        Ok(breakdown)
    }
}

fn reset_for_retry(row: &mut TaskRecord) {
    row.status = TaskStatus::Pending;
    row.status_stage = None;
    row.error_message = None;
    row.attempts = 0;
    row.created_at = Utc::now();
    row.completed_at = None;
}
