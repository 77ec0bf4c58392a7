//! Worker pool: owns the workers and the cross-cutting queue policy
//!
//! The pool runs dead-task recovery once at startup, spawns workers with
//! staggered poll intervals so their ticks do not align, reports aggregate
//! stats on a timer, and replaces chronically unhealthy workers.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::dispatch::StageDispatcher;
use crate::persistence::{QueueCounts, QueueStore, StoreError, TaskRecord};
use crate::task::{AddTaskOptions, TaskPayload};
use crate::worker::{Worker, WorkerError, WorkerStats};

/// Error type for pool operations
#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    /// Pool is already running
    #[error("worker pool is already running")]
    AlreadyRunning,

    /// Pool is not running
    #[error("worker pool is not running")]
    NotRunning,

    /// No workers available to serve the request
    #[error("worker pool has no workers")]
    NoWorkers,

    /// Store error
    #[error(transparent)]
    Store(#[from] StoreError),

    /// Worker error
    #[error(transparent)]
    Worker(#[from] WorkerError),
}

/// Pool lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PoolState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl std::fmt::Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Configuration for the worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerPoolConfig {
    /// Number of workers to spawn.
    pub worker_count: usize,

    /// Poll interval of the first worker.
    #[serde(with = "duration_millis")]
    pub base_interval: Duration,

    /// Extra interval added per worker index, staggering the ticks.
    #[serde(with = "duration_millis")]
    pub interval_offset: Duration,

    /// Whether `rebalance()` may replace unhealthy workers.
    pub enable_load_balancing: bool,

    /// How often the stats loop logs aggregates. Zero disables it.
    #[serde(with = "duration_millis")]
    pub stats_report_interval: Duration,

    /// Delay between stopping an unhealthy worker and starting its
    /// replacement.
    #[serde(with = "duration_millis")]
    pub rebalance_cooldown: Duration,

    /// Minimum priority given to tasks recovered at startup, so stranded
    /// work is retried ahead of the default backlog.
    pub recovered_task_priority: i64,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 3,
            base_interval: Duration::from_millis(2000),
            interval_offset: Duration::from_millis(300),
            enable_load_balancing: true,
            stats_report_interval: Duration::from_secs(30),
            rebalance_cooldown: Duration::from_secs(5),
            recovered_task_priority: 1,
        }
    }
}

impl WorkerPoolConfig {
    /// Set the number of workers.
    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count.max(1);
        self
    }

    /// Set the base poll interval.
    pub fn with_base_interval(mut self, interval: Duration) -> Self {
        self.base_interval = interval;
        self
    }

    /// Set the per-worker interval stagger.
    pub fn with_interval_offset(mut self, offset: Duration) -> Self {
        self.interval_offset = offset;
        self
    }

    /// Enable or disable worker replacement.
    pub fn with_load_balancing(mut self, enabled: bool) -> Self {
        self.enable_load_balancing = enabled;
        self
    }

    /// Set the stats reporting interval. Zero disables reporting.
    pub fn with_stats_report_interval(mut self, interval: Duration) -> Self {
        self.stats_report_interval = interval;
        self
    }

    /// Set the rebalance cool-down.
    pub fn with_rebalance_cooldown(mut self, cooldown: Duration) -> Self {
        self.rebalance_cooldown = cooldown;
        self
    }

    /// Set the minimum priority for recovered tasks.
    pub fn with_recovered_task_priority(mut self, priority: i64) -> Self {
        self.recovered_task_priority = priority;
        self
    }

    fn interval_for(&self, index: usize) -> Duration {
        self.base_interval + self.interval_offset * index as u32
    }
}

/// Aggregated pool statistics.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub worker_count: usize,
    pub total_processed: u64,
    pub total_errors: u64,
    /// Mean success rate over workers that have processed at least one task,
    /// rounded to two decimals. Zero when no worker has processed anything.
    pub average_success_rate: f64,
    pub workers: Vec<WorkerStats>,
}

/// Self-healing pool of queue workers sharing one store.
///
/// Held as a long-lived `Arc<WorkerPool>` wired to process start/shutdown.
pub struct WorkerPool {
    store: Arc<dyn QueueStore>,
    dispatcher: Arc<dyn StageDispatcher>,
    config: WorkerPoolConfig,
    workers: RwLock<Vec<Arc<Worker>>>,
    state: RwLock<PoolState>,
    stats_shutdown_tx: watch::Sender<bool>,
    stats_handle: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        store: Arc<dyn QueueStore>,
        dispatcher: Arc<dyn StageDispatcher>,
        config: WorkerPoolConfig,
    ) -> Self {
        let (stats_shutdown_tx, _) = watch::channel(false);
        Self {
            store,
            dispatcher,
            config,
            workers: RwLock::new(Vec::new()),
            state: RwLock::new(PoolState::Stopped),
            stats_shutdown_tx,
            stats_handle: Mutex::new(None),
        }
    }

    /// Start the pool: recover stranded tasks, spawn the workers, start the
    /// stats loop.
    pub async fn start(self: &Arc<Self>) -> Result<(), PoolError> {
        {
            let mut state = self.state.write();
            if *state != PoolState::Stopped {
                return Err(PoolError::AlreadyRunning);
            }
            *state = PoolState::Starting;
        }

        // Any row still in-stages at startup was stranded by a crash; no
        // live worker can hold it. Recovery failure must not block startup.
        match self
            .store
            .recover_dead_tasks(self.config.recovered_task_priority)
            .await
        {
            Ok(0) => {}
            Ok(recovered) => {
                info!(recovered, "recovered stranded tasks");
            }
            Err(e) => {
                warn!(error = %e, "dead-task recovery failed, continuing");
            }
        }

        {
            let mut workers = self.workers.write();
            for i in 0..self.config.worker_count {
                let worker = Arc::new(Worker::new(
                    format!("worker-{}", i + 1),
                    Arc::clone(&self.store),
                    Arc::clone(&self.dispatcher),
                ));
                worker.start_processing(self.config.interval_for(i));
                workers.push(worker);
            }
        }

        self.start_stats_loop();
        *self.state.write() = PoolState::Running;

        info!(
            worker_count = self.config.worker_count,
            base_interval_ms = self.config.base_interval.as_millis() as u64,
            "worker pool started"
        );
        Ok(())
    }

    /// Stop the pool, waiting for in-flight ticks to finish.
    pub async fn stop(&self) -> Result<(), PoolError> {
        {
            let mut state = self.state.write();
            if *state != PoolState::Running {
                return Err(PoolError::NotRunning);
            }
            *state = PoolState::Stopping;
        }

        let _ = self.stats_shutdown_tx.send(true);
        let stats_handle = self.stats_handle.lock().take();
        if let Some(handle) = stats_handle {
            let _ = handle.await;
        }

        let workers = std::mem::take(&mut *self.workers.write());
        for worker in &workers {
            worker.shutdown().await;
        }

        *self.state.write() = PoolState::Stopped;
        info!("worker pool stopped");
        Ok(())
    }

    fn start_stats_loop(self: &Arc<Self>) {
        if self.config.stats_report_interval.is_zero() {
            return;
        }

        self.stats_shutdown_tx.send_replace(false);
        let mut shutdown_rx = self.stats_shutdown_tx.subscribe();
        let pool = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let interval = pool.config.stats_report_interval;
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.report_stats().await;
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        *self.stats_handle.lock() = Some(handle);
    }

    async fn report_stats(&self) {
        let stats = self.pool_stats();
        match self.store.queue_stats().await {
            Ok(counts) => {
                info!(
                    workers = stats.worker_count,
                    total_processed = stats.total_processed,
                    total_errors = stats.total_errors,
                    average_success_rate = stats.average_success_rate,
                    pending = counts.pending,
                    in_stages = counts.in_stages,
                    completed = counts.completed,
                    failed = counts.failed,
                    "queue stats"
                );
            }
            Err(e) => {
                warn!(error = %e, "failed to read queue stats");
            }
        }

        for worker in &stats.workers {
            debug!(
                worker_id = %worker.worker_id,
                processed = worker.processed_count,
                errors = worker.error_count,
                success_rate = worker.success_rate,
                uptime_secs = worker.uptime_secs,
                "worker stats"
            );
        }
    }

    /// Aggregate counters across all workers.
    pub fn pool_stats(&self) -> PoolStats {
        let workers = self.workers.read();
        let stats: Vec<WorkerStats> = workers.iter().map(|w| w.stats()).collect();

        let total_processed: u64 = stats.iter().map(|s| s.processed_count).sum();
        let total_errors: u64 = stats.iter().map(|s| s.error_count).sum();

        let active: Vec<&WorkerStats> =
            stats.iter().filter(|s| s.processed_count > 0).collect();
        let average_success_rate = if active.is_empty() {
            0.0
        } else {
            let sum: f64 = active.iter().map(|s| s.success_rate).sum();
            (sum / active.len() as f64 * 100.0).round() / 100.0
        };

        PoolStats {
            worker_count: stats.len(),
            total_processed,
            total_errors,
            average_success_rate,
            workers: stats,
        }
    }

    /// Replace workers whose counters indicate chronic failure.
    ///
    /// A worker with more than 10 errors and a success rate below 50% is
    /// stopped; after the configured cool-down a fresh worker with the same
    /// identifier and zeroed counters takes its place. Meant to be driven by
    /// an external timer.
    pub async fn rebalance(self: &Arc<Self>) {
        if !self.config.enable_load_balancing {
            return;
        }
        if *self.state.read() != PoolState::Running {
            return;
        }

        let unhealthy: Vec<Arc<Worker>> = self
            .workers
            .read()
            .iter()
            .filter(|w| {
                let stats = w.stats();
                stats.error_count > 10 && stats.success_rate < 50.0
            })
            .cloned()
            .collect();

        for worker in unhealthy {
            let stats = worker.stats();
            warn!(
                worker_id = %stats.worker_id,
                error_count = stats.error_count,
                success_rate = stats.success_rate,
                "replacing unhealthy worker"
            );

            worker.shutdown().await;

            let pool = Arc::clone(self);
            let worker_id = stats.worker_id;
            let cooldown = self.config.rebalance_cooldown;
            tokio::spawn(async move {
                tokio::time::sleep(cooldown).await;
                pool.replace_worker(&worker_id);
            });
        }
    }

    fn replace_worker(&self, worker_id: &str) {
        if *self.state.read() != PoolState::Running {
            debug!(worker_id, "pool no longer running, skipping replacement");
            return;
        }

        let replacement = Arc::new(Worker::new(
            worker_id,
            Arc::clone(&self.store),
            Arc::clone(&self.dispatcher),
        ));
        replacement.start_processing(self.config.base_interval);

        let mut workers = self.workers.write();
        match workers.iter().position(|w| w.id() == worker_id) {
            Some(idx) => workers[idx] = replacement,
            None => workers.push(replacement),
        }
        info!(worker_id, "worker replaced");
    }

    fn first_worker(&self) -> Result<Arc<Worker>, PoolError> {
        self.workers
            .read()
            .first()
            .cloned()
            .ok_or(PoolError::NoWorkers)
    }

    /// Validate and enqueue a task.
    pub async fn add_task(
        &self,
        payload: &TaskPayload,
        options: AddTaskOptions,
    ) -> Result<i64, PoolError> {
        let worker = self.first_worker()?;
        Ok(worker.add_task(payload, options).await?)
    }

    /// Fetch one task's current record.
    pub async fn get_task_status(&self, id: i64) -> Result<Option<TaskRecord>, PoolError> {
        let worker = self.first_worker()?;
        Ok(worker.get_task_status(id).await?)
    }

    /// Queue counts grouped by status.
    pub async fn get_queue_stats(&self) -> Result<QueueCounts, PoolError> {
        let worker = self.first_worker()?;
        Ok(worker.get_queue_stats().await?)
    }

    pub fn is_active(&self) -> bool {
        *self.state.read() == PoolState::Running
    }

    pub fn state(&self) -> PoolState {
        *self.state.read()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.read().len()
    }

    #[cfg(test)]
    pub(crate) fn worker_at(&self, index: usize) -> Arc<Worker> {
        Arc::clone(&self.workers.read()[index])
    }
}

/// Serde support for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_millis().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatch::{StageContext, StageError};
    use crate::persistence::{InMemoryQueueStore, TaskStatus};
    use async_trait::async_trait;

    struct OkDispatcher;

    #[async_trait]
    impl StageDispatcher for OkDispatcher {
        async fn dispatch(
            &self,
            _payload: &TaskPayload,
            _ctx: &StageContext<'_>,
        ) -> Result<(), StageError> {
            Ok(())
        }
    }

    fn photo(key: &str) -> TaskPayload {
        TaskPayload::Photo {
            storage_key: key.to_string(),
        }
    }

    // Slow intervals so workers never actually tick during these tests.
    fn quiet_config() -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_base_interval(Duration::from_secs(3600))
            .with_stats_report_interval(Duration::ZERO)
            .with_rebalance_cooldown(Duration::from_millis(20))
    }

    fn pool_with(store: Arc<InMemoryQueueStore>, config: WorkerPoolConfig) -> Arc<WorkerPool> {
        Arc::new(WorkerPool::new(
            store as Arc<dyn QueueStore>,
            Arc::new(OkDispatcher),
            config,
        ))
    }

    #[tokio::test]
    async fn test_start_stop_state_machine() {
        let store = Arc::new(InMemoryQueueStore::default());
        let pool = pool_with(store, quiet_config().with_worker_count(2));

        assert_eq!(pool.state(), PoolState::Stopped);
        assert!(!pool.is_active());

        pool.start().await.unwrap();
        assert_eq!(pool.state(), PoolState::Running);
        assert!(pool.is_active());
        assert_eq!(pool.worker_count(), 2);

        assert!(matches!(
            pool.start().await,
            Err(PoolError::AlreadyRunning)
        ));

        pool.stop().await.unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(pool.worker_count(), 0);

        assert!(matches!(pool.stop().await, Err(PoolError::NotRunning)));
    }

    #[tokio::test]
    async fn test_start_recovers_stranded_tasks() {
        let store = Arc::new(InMemoryQueueStore::default());
        let stuck = store.insert_task(&photo("stuck.jpg"), 0, 3).await.unwrap();
        store.force_status(stuck, TaskStatus::InStages, Some("thumbnail"));

        let pool = pool_with(Arc::clone(&store), quiet_config());
        pool.start().await.unwrap();

        let record = store.get_task(stuck).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.status_stage, None);
        assert_eq!(record.priority, 1);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_producer_surface_delegates_to_store() {
        let store = Arc::new(InMemoryQueueStore::default());
        let pool = pool_with(store, quiet_config());

        // Stopped pool has no workers to serve requests
        assert!(matches!(
            pool.add_task(&photo("a.jpg"), AddTaskOptions::default()).await,
            Err(PoolError::NoWorkers)
        ));

        pool.start().await.unwrap();

        let id = pool
            .add_task(&photo("a.jpg"), AddTaskOptions::default().with_priority(5))
            .await
            .unwrap();
        let record = pool.get_task_status(id).await.unwrap().unwrap();
        assert_eq!(record.status, TaskStatus::Pending);
        assert_eq!(record.priority, 5);

        let counts = pool.get_queue_stats().await.unwrap();
        assert_eq!(counts.pending, 1);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_pool_stats_average_ignores_idle_workers() {
        let store = Arc::new(InMemoryQueueStore::default());
        let pool = pool_with(store, quiet_config().with_worker_count(3));
        pool.start().await.unwrap();

        pool.worker_at(0).seed_counters(10, 0); // 100%
        pool.worker_at(1).seed_counters(10, 5); // 50%
        // worker 2 idle, excluded from the average

        let stats = pool.pool_stats();
        assert_eq!(stats.total_processed, 20);
        assert_eq!(stats.total_errors, 5);
        assert_eq!(stats.average_success_rate, 75.0);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebalance_replaces_unhealthy_worker() {
        let store = Arc::new(InMemoryQueueStore::default());
        let pool = pool_with(store, quiet_config().with_worker_count(1));
        pool.start().await.unwrap();

        pool.worker_at(0).seed_counters(18, 11); // ~39% success, 11 errors
        pool.rebalance().await;

        // Old worker is stopped immediately; replacement appears after the
        // cool-down.
        assert!(!pool.worker_at(0).is_processing());
        tokio::time::sleep(Duration::from_millis(100)).await;

        let fresh = pool.worker_at(0);
        assert_eq!(fresh.id(), "worker-1");
        assert!(fresh.is_processing());
        assert_eq!(fresh.stats().processed_count, 0);
        assert_eq!(fresh.stats().error_count, 0);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebalance_leaves_healthy_workers_alone() {
        let store = Arc::new(InMemoryQueueStore::default());
        let pool = pool_with(store, quiet_config().with_worker_count(2));
        pool.start().await.unwrap();

        pool.worker_at(0).seed_counters(100, 8); // errors below threshold
        pool.worker_at(1).seed_counters(30, 12); // 60% success, above 50%

        let before: Vec<_> = (0..2).map(|i| Arc::as_ptr(&pool.worker_at(i))).collect();
        pool.rebalance().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        for (i, ptr) in before.iter().enumerate() {
            assert_eq!(*ptr, Arc::as_ptr(&pool.worker_at(i)));
        }

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_rebalance_disabled_by_config() {
        let store = Arc::new(InMemoryQueueStore::default());
        let pool = pool_with(
            store,
            quiet_config().with_worker_count(1).with_load_balancing(false),
        );
        pool.start().await.unwrap();

        pool.worker_at(0).seed_counters(20, 15);
        pool.rebalance().await;

        assert!(pool.worker_at(0).is_processing());
        assert_eq!(pool.worker_at(0).stats().error_count, 15);

        pool.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_worker_intervals_are_staggered() {
        let config = WorkerPoolConfig::default()
            .with_base_interval(Duration::from_millis(2000))
            .with_interval_offset(Duration::from_millis(300));

        assert_eq!(config.interval_for(0), Duration::from_millis(2000));
        assert_eq!(config.interval_for(1), Duration::from_millis(2300));
        assert_eq!(config.interval_for(2), Duration::from_millis(2600));
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = WorkerPoolConfig::default()
            .with_worker_count(5)
            .with_base_interval(Duration::from_millis(1500));

        let json = serde_json::to_string(&config).unwrap();
        let parsed: WorkerPoolConfig = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.worker_count, 5);
        assert_eq!(parsed.base_interval, Duration::from_millis(1500));
        assert_eq!(parsed.recovered_task_priority, 1);
    }

    #[test]
    fn test_worker_count_floor() {
        let config = WorkerPoolConfig::default().with_worker_count(0);
        assert_eq!(config.worker_count, 1);
    }
}
