//! # Photoflow Queue
//!
//! A persisted, multi-worker task queue driving asynchronous photo-processing
//! pipelines. One SQLite table is the sole source of truth; workers claim
//! tasks atomically, run them through a pluggable stage dispatcher, and
//! record the outcome back in the same table.
//!
//! ## Core guarantees
//!
//! - **Exclusive claiming**: a pending task is claimed by at most one worker,
//!   enforced by a conditional write in the store rather than by scheduling.
//! - **Bounded retries**: a failed task is retried with exponential backoff
//!   until its per-task budget runs out, then parked as `failed` with the
//!   last error message.
//! - **Priority dispatch**: higher priority first, FIFO within a priority.
//! - **Crash recovery**: tasks stranded `in-stages` by a crash are reset to
//!   `pending` at elevated priority when the pool starts.
//! - **Self-healing**: workers with chronically bad counters are replaced.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use photoflow_queue::{
//!     AddTaskOptions, SqliteQueueStore, StageContext, StageDispatcher,
//!     StageError, TaskPayload, WorkerPool, WorkerPoolConfig,
//! };
//!
//! struct PhotoPipeline;
//!
//! #[async_trait::async_trait]
//! impl StageDispatcher for PhotoPipeline {
//!     async fn dispatch(
//!         &self,
//!         payload: &TaskPayload,
//!         ctx: &StageContext<'_>,
//!     ) -> Result<(), StageError> {
//!         match payload {
//!             TaskPayload::Photo { storage_key } => {
//!                 ctx.enter_stage("metadata").await?;
//!                 // ... extract metadata ...
//!                 ctx.enter_stage("thumbnail").await?;
//!                 // ... generate thumbnail ...
//!                 Ok(())
//!             }
//!             _ => Err(StageError::failed("unsupported task type")),
//!         }
//!     }
//! }
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let store = Arc::new(SqliteQueueStore::connect("sqlite://queue.db").await?);
//! let pool = Arc::new(WorkerPool::new(
//!     store,
//!     Arc::new(PhotoPipeline),
//!     WorkerPoolConfig::default(),
//! ));
//!
//! pool.start().await?;
//! pool.add_task(
//!     &TaskPayload::Photo { storage_key: "photos/img_0001.heic".into() },
//!     AddTaskOptions::default().with_priority(5),
//! )
//! .await?;
//! # Ok(())
//! # }
//! ```

mod dispatch;
mod persistence;
mod pool;
mod retry;
mod task;
mod worker;

pub use dispatch::{StageContext, StageDispatcher, StageError};
pub use persistence::{
    ClearBreakdown, ClearFilter, InMemoryQueueStore, QueueCounts, QueueStore, SqliteQueueStore,
    StoreError, TaskFailureOutcome, TaskFilter, TaskRecord, TaskStatus,
};
pub use pool::{PoolError, PoolState, PoolStats, WorkerPool, WorkerPoolConfig};
pub use retry::RetryPolicy;
pub use task::{
    AddTaskOptions, OptionsError, PayloadError, TaskPayload, DEFAULT_MAX_ATTEMPTS,
    MAX_ATTEMPTS_RANGE, PRIORITY_RANGE,
};
pub use worker::{Worker, WorkerError, WorkerStats};

/// Convenience re-exports for consumers wiring up a pool.
pub mod prelude {
    pub use crate::dispatch::{StageContext, StageDispatcher, StageError};
    pub use crate::persistence::{QueueStore, SqliteQueueStore, TaskRecord, TaskStatus};
    pub use crate::pool::{WorkerPool, WorkerPoolConfig};
    pub use crate::retry::RetryPolicy;
    pub use crate::task::{AddTaskOptions, TaskPayload};
}
