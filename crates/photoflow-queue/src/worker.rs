//! Queue worker: claims tasks on an interval and runs them through the
//! stage dispatcher
//!
//! A worker holds no task state between ticks. Each tick claims at most one
//! task from the store, runs it to completion or failure, and reports the
//! result back to the store. Counters on the worker feed the pool's
//! rebalancing decisions.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::dispatch::{StageContext, StageDispatcher};
use crate::persistence::{
    QueueCounts, QueueStore, StoreError, TaskFailureOutcome, TaskRecord,
};
use crate::task::{AddTaskOptions, OptionsError, PayloadError, TaskPayload};

/// Error type for worker operations
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Payload rejected before it was stored
    #[error("invalid payload: {0}")]
    InvalidPayload(#[from] PayloadError),

    /// Task options rejected before the task was stored
    #[error("invalid task options: {0}")]
    InvalidOptions(#[from] OptionsError),

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Point-in-time snapshot of one worker's counters.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub worker_id: String,
    pub is_processing: bool,
    /// Tasks claimed by this worker since it started.
    pub processed_count: u64,
    /// Claimed tasks whose dispatch failed.
    pub error_count: u64,
    pub uptime_secs: u64,
    /// Percentage of claimed tasks that succeeded; 0 when none were claimed
    /// yet.
    pub success_rate: f64,
}

/// A single queue worker.
///
/// Workers are cheap: all durable state lives in the store, so a worker can
/// be stopped and replaced at any time without losing tasks.
pub struct Worker {
    id: String,
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<dyn StageDispatcher>,
    processed_count: AtomicU64,
    error_count: AtomicU64,
    is_processing: AtomicBool,
    started_at: Mutex<Option<Instant>>,
    shutdown_tx: watch::Sender<bool>,
    poll_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        id: impl Into<String>,
        store: Arc<dyn QueueStore>,
        dispatcher: Arc<dyn StageDispatcher>,
    ) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            id: id.into(),
            store,
            dispatcher,
            processed_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            is_processing: AtomicBool::new(false),
            started_at: Mutex::new(None),
            shutdown_tx,
            poll_handle: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Start the polling loop with the given tick interval.
    ///
    /// The first tick fires one full interval after start, not immediately.
    /// Starting an already-running worker is a no-op.
    pub fn start_processing(self: &Arc<Self>, interval: Duration) {
        if self.is_processing.swap(true, Ordering::SeqCst) {
            debug!(worker_id = %self.id, "already processing");
            return;
        }

        *self.started_at.lock() = Some(Instant::now());
        self.shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let worker = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

            info!(worker_id = %worker.id, interval_ms = interval.as_millis() as u64, "worker started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        worker.run_tick().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }

            info!(worker_id = %worker.id, "worker stopped");
        });

        *self.poll_handle.lock() = Some(handle);
    }

    /// Signal the polling loop to stop. Idempotent; an in-flight task
    /// finishes before the loop exits.
    pub fn stop_processing(&self) {
        if self.is_processing.swap(false, Ordering::SeqCst) {
            let _ = self.shutdown_tx.send(true);
        }
    }

    /// Stop and wait for the polling loop to exit.
    pub async fn shutdown(&self) {
        self.stop_processing();
        let handle = self.poll_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    async fn run_tick(&self) {
        let task = match self.store.claim_next(&self.id).await {
            Ok(Some(task)) => task,
            Ok(None) => return,
            Err(e) => {
                warn!(worker_id = %self.id, error = %e, "claim failed, skipping tick");
                return;
            }
        };

        self.process_task(task).await;
    }

    async fn process_task(&self, task: TaskRecord) {
        self.processed_count.fetch_add(1, Ordering::SeqCst);
        info!(
            worker_id = %self.id,
            task_id = task.id,
            task_type = task.payload.kind(),
            attempt = task.attempts + 1,
            "processing task"
        );

        let ctx = StageContext::new(self.store.as_ref(), task.id);

        // A stored payload that no longer passes validation (hand-edited row,
        // schema drift) is a handler failure, not a crash.
        let result = match task.payload.validate() {
            Ok(()) => self.dispatcher.dispatch(&task.payload, &ctx).await,
            Err(e) => Err(crate::dispatch::StageError::failed(e.to_string())),
        };

        match result {
            Ok(()) => {
                if let Err(e) = self.store.complete_task(task.id).await {
                    warn!(worker_id = %self.id, task_id = task.id, error = %e, "failed to record completion");
                } else {
                    info!(worker_id = %self.id, task_id = task.id, "task completed");
                }
            }
            Err(stage_err) => {
                self.error_count.fetch_add(1, Ordering::SeqCst);
                match self.store.fail_task(task.id, &stage_err.to_string()).await {
                    Ok(TaskFailureOutcome::WillRetry { next_attempt, delay }) => {
                        warn!(
                            worker_id = %self.id,
                            task_id = task.id,
                            error = %stage_err,
                            next_attempt,
                            delay_ms = delay.as_millis() as u64,
                            "task failed, will retry"
                        );
                    }
                    Ok(TaskFailureOutcome::ExhaustedRetries) => {
                        error!(
                            worker_id = %self.id,
                            task_id = task.id,
                            error = %stage_err,
                            "task failed permanently"
                        );
                    }
                    Ok(TaskFailureOutcome::Ignored) => {
                        debug!(worker_id = %self.id, task_id = task.id, "failure report ignored");
                    }
                    Err(e) => {
                        warn!(worker_id = %self.id, task_id = task.id, error = %e, "failed to record failure");
                    }
                }
            }
        }
    }

    /// Validate and enqueue a task. Rejected tasks are never stored and
    /// consume no retry attempt.
    pub async fn add_task(
        &self,
        payload: &TaskPayload,
        options: AddTaskOptions,
    ) -> Result<i64, WorkerError> {
        payload.validate()?;
        options.validate()?;
        let id = self
            .store
            .insert_task(payload, options.priority, options.max_attempts)
            .await?;
        Ok(id)
    }

    pub async fn get_task_status(&self, id: i64) -> Result<Option<TaskRecord>, WorkerError> {
        Ok(self.store.get_task(id).await?)
    }

    pub async fn get_queue_stats(&self) -> Result<QueueCounts, WorkerError> {
        Ok(self.store.queue_stats().await?)
    }

    pub fn is_processing(&self) -> bool {
        self.is_processing.load(Ordering::SeqCst)
    }

    /// Current counters.
    pub fn stats(&self) -> WorkerStats {
        let processed = self.processed_count.load(Ordering::SeqCst);
        let errors = self.error_count.load(Ordering::SeqCst);
        let is_processing = self.is_processing.load(Ordering::SeqCst);

        let uptime_secs = if is_processing {
            self.started_at
                .lock()
                .as_ref()
                .map(|s| s.elapsed().as_secs())
                .unwrap_or(0)
        } else {
            0
        };

        let success_rate = if processed == 0 {
            0.0
        } else {
            (processed - errors) as f64 / processed as f64 * 100.0
        };

        WorkerStats {
            worker_id: self.id.clone(),
            is_processing,
            processed_count: processed,
            error_count: errors,
            uptime_secs,
            success_rate,
        }
    }

    #[cfg(test)]
    pub(crate) fn seed_counters(&self, processed: u64, errors: u64) {
        self.processed_count.store(processed, Ordering::SeqCst);
        self.error_count.store(errors, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::StageError;
    use crate::persistence::{InMemoryQueueStore, TaskStatus};
    use crate::retry::RetryPolicy;
    use async_trait::async_trait;

    struct OkDispatcher;

    #[async_trait]
    impl StageDispatcher for OkDispatcher {
        async fn dispatch(
            &self,
            _payload: &TaskPayload,
            ctx: &StageContext<'_>,
        ) -> Result<(), StageError> {
            ctx.enter_stage("thumbnail").await?;
            Ok(())
        }
    }

    struct FailingDispatcher;

    #[async_trait]
    impl StageDispatcher for FailingDispatcher {
        async fn dispatch(
            &self,
            _payload: &TaskPayload,
            _ctx: &StageContext<'_>,
        ) -> Result<(), StageError> {
            Err(StageError::failed("boom"))
        }
    }

    fn photo(key: &str) -> TaskPayload {
        TaskPayload::Photo {
            storage_key: key.to_string(),
        }
    }

    fn memory_worker(dispatcher: impl StageDispatcher) -> (Arc<Worker>, Arc<InMemoryQueueStore>) {
        let store = Arc::new(InMemoryQueueStore::new(RetryPolicy::immediate()));
        let worker = Arc::new(Worker::new(
            "worker-1",
            Arc::clone(&store) as Arc<dyn QueueStore>,
            Arc::new(dispatcher),
        ));
        (worker, store)
    }

    #[tokio::test]
    async fn test_tick_processes_one_task() {
        let (worker, store) = memory_worker(OkDispatcher);

        let id = worker
            .add_task(&photo("a.jpg"), AddTaskOptions::default())
            .await
            .unwrap();
        worker.run_tick().await;

        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);

        let stats = worker.stats();
        assert_eq!(stats.processed_count, 1);
        assert_eq!(stats.error_count, 0);
        assert_eq!(stats.success_rate, 100.0);
    }

    #[tokio::test]
    async fn test_tick_on_empty_queue_is_quiet() {
        let (worker, _store) = memory_worker(OkDispatcher);
        worker.run_tick().await;
        assert_eq!(worker.stats().processed_count, 0);
    }

    #[tokio::test]
    async fn test_failed_dispatch_consumes_attempt() {
        let (worker, store) = memory_worker(FailingDispatcher);

        let id = worker
            .add_task(
                &photo("a.jpg"),
                AddTaskOptions::default().with_max_attempts(2),
            )
            .await
            .unwrap();

        worker.run_tick().await;
        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.attempts, 1);

        worker.run_tick().await;
        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(record.attempts, 2);
        assert_eq!(record.error_message.as_deref(), Some("boom"));

        let stats = worker.stats();
        assert_eq!(stats.processed_count, 2);
        assert_eq!(stats.error_count, 2);
        assert_eq!(stats.success_rate, 0.0);
    }

    #[tokio::test]
    async fn test_invalid_stored_payload_is_handler_failure() {
        let (worker, store) = memory_worker(OkDispatcher);

        // Bypass producer validation to simulate a corrupted row
        let bad = TaskPayload::Photo {
            storage_key: String::new(),
        };
        let id = store.insert_task(&bad, 0, 1).await.unwrap();

        worker.run_tick().await;
        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Failed);
        assert_eq!(
            record.error_message.as_deref(),
            Some("storage key must not be empty")
        );
    }

    #[tokio::test]
    async fn test_add_task_rejects_invalid_input() {
        let (worker, store) = memory_worker(OkDispatcher);

        let err = worker
            .add_task(
                &photo(""),
                AddTaskOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidPayload(_)));

        let err = worker
            .add_task(&photo("a.jpg"), AddTaskOptions::default().with_priority(99))
            .await
            .unwrap_err();
        assert!(matches!(err, WorkerError::InvalidOptions(_)));

        // Nothing reached the store
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_waits_one_interval() {
        let (worker, store) = memory_worker(OkDispatcher);

        let id = worker
            .add_task(&photo("a.jpg"), AddTaskOptions::default())
            .await
            .unwrap();

        worker.start_processing(Duration::from_secs(10));

        // No immediate tick at start
        tokio::time::sleep(Duration::from_secs(5)).await;
        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);

        tokio::time::sleep(Duration::from_secs(6)).await;
        let record = store.get_task(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Completed);

        worker.shutdown().await;
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (worker, _store) = memory_worker(OkDispatcher);

        worker.start_processing(Duration::from_millis(50));
        assert!(worker.is_processing());

        worker.stop_processing();
        worker.stop_processing();
        worker.shutdown().await;
        assert!(!worker.is_processing());
        assert_eq!(worker.stats().uptime_secs, 0);
    }

    #[tokio::test]
    async fn test_stats_success_rate_math() {
        let (worker, _store) = memory_worker(OkDispatcher);
        worker.seed_counters(20, 5);

        let stats = worker.stats();
        assert_eq!(stats.success_rate, 75.0);
    }
}
