//! Stage dispatch seam between the queue core and the photo pipeline
//!
//! The queue never interprets payloads beyond their type tag. A
//! `StageDispatcher` implementation owns the actual pipeline work and uses
//! the `StageContext` to record which sub-step is currently executing, so an
//! operator inspecting the table sees where a long task is.

use async_trait::async_trait;

use crate::persistence::{QueueStore, StoreError};
use crate::task::TaskPayload;

/// Handle given to the dispatcher for the duration of one claimed task.
pub struct StageContext<'a> {
    store: &'a dyn QueueStore,
    task_id: i64,
}

impl<'a> StageContext<'a> {
    pub(crate) fn new(store: &'a dyn QueueStore, task_id: i64) -> Self {
        Self { store, task_id }
    }

    /// The id of the task being processed.
    pub fn task_id(&self) -> i64 {
        self.task_id
    }

    /// Record the named sub-step as the task's current stage.
    ///
    /// Purely observational: failing to record a stage does not fail the
    /// task, but store errors are surfaced so the handler can decide.
    pub async fn enter_stage(&self, stage: &str) -> Result<(), StoreError> {
        self.store.set_stage(self.task_id, stage).await
    }
}

/// A stage handler failure.
///
/// The display form of `Failed` is stored verbatim as the task's
/// `error_message` when the retry budget runs out.
#[derive(Debug, thiserror::Error)]
pub enum StageError {
    /// The handler could not process the payload.
    #[error("{0}")]
    Failed(String),

    /// The store failed mid-stage.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl StageError {
    /// Convenience constructor for handler failures.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Executes the pipeline stages for one claimed task.
///
/// Implementations must be safe to call concurrently from multiple workers.
#[async_trait]
pub trait StageDispatcher: Send + Sync + 'static {
    async fn dispatch(
        &self,
        payload: &TaskPayload,
        ctx: &StageContext<'_>,
    ) -> Result<(), StageError>;
}
