//! QueueStore trait definition

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::task::TaskPayload;

/// Error type for store operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Task not found
    #[error("task not found: {0}")]
    TaskNotFound(i64),

    /// The row is not in a status that permits the requested transition
    #[error("task {id} is in status '{status}', transition not permitted")]
    InvalidTransition { id: i64, status: TaskStatus },

    /// Database error
    #[error("database error: {0}")]
    Database(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

/// Task lifecycle status.
///
/// Transitions are `pending -> in-stages -> {completed | pending (retry) |
/// failed}`; terminal statuses only leave via an administrative retry-reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskStatus {
    Pending,
    InStages,
    Completed,
    Failed,
}

impl TaskStatus {
    /// The wire/storage label for this status.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InStages => "in-stages",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Whether the task can still run (not terminal).
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Pending | Self::InStages)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-stages" => Ok(Self::InStages),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown task status: {other}")),
        }
    }
}

/// One durable task row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: i64,
    pub payload: TaskPayload,
    pub priority: i64,
    pub attempts: u32,
    pub max_attempts: u32,
    pub status: TaskStatus,
    pub status_stage: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Outcome of failing a claimed task
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskFailureOutcome {
    /// Task went back to pending with a backoff delay
    WillRetry { next_attempt: u32, delay: Duration },

    /// Retry budget exhausted; task is terminally failed
    ExhaustedRetries,

    /// The row was no longer in-stages (lost a race with an administrative
    /// reset); nothing was changed
    Ignored,
}

/// Counts grouped by status, for the producer-facing stats surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub pending: u64,
    #[serde(rename = "in-stages")]
    pub in_stages: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.in_stages + self.completed + self.failed
    }
}

/// Filter for listing tasks
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    /// Matches the payload's JSON `type` tag (e.g. "photo-reverse-geocoding").
    pub task_type: Option<String>,
}

impl TaskFilter {
    pub fn by_status(status: TaskStatus) -> Self {
        Self {
            status: Some(status),
            task_type: None,
        }
    }

    pub fn by_type(task_type: impl Into<String>) -> Self {
        Self {
            status: None,
            task_type: Some(task_type.into()),
        }
    }
}

/// Filter for clearing terminal tasks
#[derive(Debug, Clone)]
pub struct ClearFilter {
    pub include_completed: bool,
    pub include_failed: bool,
    /// Only remove rows created more than this many days ago. Zero means
    /// every terminal row.
    pub older_than_days: Option<u32>,
}

impl Default for ClearFilter {
    fn default() -> Self {
        Self {
            include_completed: true,
            include_failed: true,
            older_than_days: None,
        }
    }
}

impl ClearFilter {
    /// Cutoff timestamp implied by `older_than_days`, if any.
    pub fn cutoff(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.older_than_days
            .map(|days| now - chrono::Duration::days(i64::from(days)))
    }
}

/// Per-status breakdown of rows removed by `clear_inactive`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ClearBreakdown {
    pub completed: u64,
    pub failed: u64,
}

impl ClearBreakdown {
    pub fn total(&self) -> u64 {
        self.completed + self.failed
    }
}

/// Durable task queue storage.
///
/// The table is the sole source of truth: workers hold no task state across
/// ticks, and every decision re-reads it through this trait. Implementations
/// must make `claim_next` atomic so that concurrent pollers can never claim
/// the same row.
#[async_trait]
pub trait QueueStore: Send + Sync + 'static {
    /// Insert a pending task. Returns the assigned id.
    async fn insert_task(
        &self,
        payload: &TaskPayload,
        priority: i64,
        max_attempts: u32,
    ) -> Result<i64, StoreError>;

    /// Atomically claim the best-ranked claimable task, if any.
    ///
    /// Ranking is `priority DESC, created_at ASC, id ASC` over rows that are
    /// `pending` with `created_at <= now` (a retried task's `created_at` is
    /// shifted into the future by its backoff delay). The winning row is
    /// transitioned to `in-stages` inside the same conditional write, so at
    /// most one concurrent caller can claim it.
    async fn claim_next(&self, worker_id: &str) -> Result<Option<TaskRecord>, StoreError>;

    /// Fetch one task by id.
    async fn get_task(&self, id: i64) -> Result<Option<TaskRecord>, StoreError>;

    /// Record the named pipeline sub-step currently executing.
    ///
    /// Only meaningful while the row is `in-stages`; otherwise a no-op.
    async fn set_stage(&self, id: i64, stage: &str) -> Result<(), StoreError>;

    /// Terminal success: `completed`, `completed_at = now`.
    ///
    /// A row no longer `in-stages` is left untouched.
    async fn complete_task(&self, id: i64) -> Result<(), StoreError>;

    /// Consume one attempt for a claimed task that failed.
    ///
    /// If budget remains the row goes back to `pending` with `created_at`
    /// shifted forward by the retry policy's delay; otherwise it becomes
    /// terminally `failed` with `error_message` set.
    async fn fail_task(&self, id: i64, error: &str) -> Result<TaskFailureOutcome, StoreError>;

    /// Reset every `in-stages` row to `pending` with `status_stage` cleared
    /// and `priority` raised to at least `min_priority`.
    ///
    /// Called once at pool startup: any row still `in-stages` at that point
    /// was stranded by a crash, since no live worker can hold it.
    async fn recover_dead_tasks(&self, min_priority: i64) -> Result<u64, StoreError>;

    /// Counts grouped by status.
    async fn queue_stats(&self) -> Result<QueueCounts, StoreError>;

    /// List tasks matching the filter, newest first.
    async fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRecord>, StoreError>;

    /// Administrative retry of one failed task: back to `pending` with
    /// `attempts = 0` and stage/error cleared.
    ///
    /// Errors with `InvalidTransition` if the task is not `failed`.
    async fn reset_task(&self, id: i64) -> Result<(), StoreError>;

    /// Administrative bulk retry of every failed task. Returns the count.
    async fn reset_all_failed(&self) -> Result<u64, StoreError>;

    /// Purge terminal rows matching the filter, returning the per-status
    /// breakdown of what was removed.
    async fn clear_inactive(&self, filter: &ClearFilter) -> Result<ClearBreakdown, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_labels_round_trip() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::InStages,
            TaskStatus::Completed,
            TaskStatus::Failed,
        ] {
            let parsed: TaskStatus = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
        }

        assert_eq!(TaskStatus::InStages.as_str(), "in-stages");
        assert!("running".parse::<TaskStatus>().is_err());
    }

    #[test]
    fn test_status_activity() {
        assert!(TaskStatus::Pending.is_active());
        assert!(TaskStatus::InStages.is_active());
        assert!(!TaskStatus::Completed.is_active());
        assert!(!TaskStatus::Failed.is_active());
    }

    #[test]
    fn test_clear_filter_cutoff() {
        let now = Utc::now();
        let filter = ClearFilter {
            older_than_days: Some(0),
            ..Default::default()
        };
        assert_eq!(filter.cutoff(now), Some(now));

        let filter = ClearFilter::default();
        assert_eq!(filter.cutoff(now), None);
    }

    #[test]
    fn test_queue_counts_serialize_wire_labels() {
        let counts = QueueCounts {
            pending: 1,
            in_stages: 2,
            completed: 3,
            failed: 4,
        };
        let value = serde_json::to_value(counts).unwrap();
        assert_eq!(value["in-stages"], 2);
        assert_eq!(counts.total(), 10);
    }
}
