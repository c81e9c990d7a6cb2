//! Worker pool draining the task queue.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::metrics;

use super::{FailDisposition, QueueCounts, QueueError, Task, TaskStore};

/// How a task execution failed.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    /// May succeed when run again.
    #[error("retryable: {0}")]
    Retryable(String),

    /// Will never succeed.
    #[error("permanent: {0}")]
    Permanent(String),

    /// Storage is unavailable. The task keeps its lease and runs again once
    /// the lease expires.
    #[error("storage unavailable: {0}")]
    Storage(String),
}

/// Executes claimed tasks.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    /// Run one task.
    async fn handle(&self, task: &Task) -> Result<(), TaskError>;

    /// Called once before a task is marked terminally failed, so the owning
    /// entity can be moved to its failed state.
    async fn on_exhausted(&self, task: &Task, reason: &str) -> Result<(), TaskError>;
}

/// Result of one task execution.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Succeeded,
    Rescheduled { run_after: chrono::DateTime<Utc> },
    Failed { reason: String },
    /// Left leased because storage was unavailable.
    Deferred { reason: String },
}

impl TaskOutcome {
    fn label(&self) -> &'static str {
        match self {
            TaskOutcome::Succeeded => "succeeded",
            TaskOutcome::Rescheduled { .. } => "rescheduled",
            TaskOutcome::Failed { .. } => "failed",
            TaskOutcome::Deferred { .. } => "deferred",
        }
    }
}

/// Report of one processed task.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskReport {
    pub task_id: String,
    pub kind: &'static str,
    pub outcome: TaskOutcome,
}

/// Current status of the worker pool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkerPoolStatus {
    /// Whether the worker loops are running.
    pub running: bool,
    /// Configured number of workers.
    pub workers: usize,
    /// Tasks currently executing.
    pub busy: usize,
    /// Task counts by status.
    pub queue: QueueCounts,
}

/// Pool of worker loops pulling from a shared [`TaskStore`].
pub struct WorkerPool {
    config: WorkerConfig,
    store: Arc<dyn TaskStore>,
    handler: Arc<dyn TaskHandler>,

    running: Arc<AtomicBool>,
    busy: Arc<AtomicUsize>,
    shutdown_tx: broadcast::Sender<()>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn TaskStore>,
        handler: Arc<dyn TaskHandler>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            store,
            handler,
            running: Arc::new(AtomicBool::new(false)),
            busy: Arc::new(AtomicUsize::new(0)),
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Start the worker loops.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Worker pool already running");
            return;
        }

        info!("Starting worker pool with {} workers", self.config.workers);
        let mut handles = self.handles.lock().unwrap();
        for worker in 0..self.config.workers {
            handles.push(self.spawn_worker_loop(worker));
        }
    }

    /// Stop the worker loops, waiting for in-flight tasks to finish.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            warn!("Worker pool not running");
            return;
        }

        info!("Stopping worker pool");
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.handles.lock().unwrap().drain(..).collect();
        for result in futures::future::join_all(handles).await {
            if let Err(e) = result {
                error!("Worker loop panicked: {}", e);
            }
        }
        info!("Worker pool stopped");
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    /// Get current pool status.
    pub fn status(&self) -> WorkerPoolStatus {
        WorkerPoolStatus {
            running: self.is_running(),
            workers: self.config.workers,
            busy: self.busy.load(Ordering::Relaxed),
            queue: self.store.counts().unwrap_or_default(),
        }
    }

    /// Claim and execute one task, if any is runnable.
    pub async fn process_next(&self) -> Result<Option<TaskReport>, QueueError> {
        Self::execute_next(&self.store, &self.handler, &self.config, &self.busy).await
    }

    /// Execute tasks until none is runnable right now.
    pub async fn drain(&self) -> Result<Vec<TaskReport>, QueueError> {
        let mut reports = Vec::new();
        while let Some(report) = self.process_next().await? {
            reports.push(report);
        }
        Ok(reports)
    }

    fn spawn_worker_loop(&self, worker: usize) -> JoinHandle<()> {
        let running = Arc::clone(&self.running);
        let busy = Arc::clone(&self.busy);
        let store = Arc::clone(&self.store);
        let handler = Arc::clone(&self.handler);
        let config = self.config.clone();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            debug!("Worker {} started", worker);
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        debug!("Worker {} received shutdown signal", worker);
                        break;
                    }
                    _ = tokio::time::sleep(Duration::from_millis(config.poll_interval_ms)) => {
                        while running.load(Ordering::Relaxed) {
                            match Self::execute_next(&store, &handler, &config, &busy).await {
                                Ok(Some(_)) => continue,
                                Ok(None) => break,
                                Err(e) => {
                                    warn!("Worker {} queue error: {}", worker, e);
                                    break;
                                }
                            }
                        }
                        if !running.load(Ordering::Relaxed) {
                            break;
                        }
                    }
                }
            }
            debug!("Worker {} stopped", worker);
        })
    }

    async fn execute_next(
        store: &Arc<dyn TaskStore>,
        handler: &Arc<dyn TaskHandler>,
        config: &WorkerConfig,
        busy: &AtomicUsize,
    ) -> Result<Option<TaskReport>, QueueError> {
        let Some(task) = store.claim(Utc::now(), config.lease_duration())? else {
            return Ok(None);
        };

        let kind = task.kind.name();
        debug!(
            "Executing task {} ({}) attempt {}/{}",
            task.id, kind, task.attempts, task.max_attempts
        );

        busy.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = match tokio::time::timeout(config.task_timeout(), handler.handle(&task)).await
        {
            Ok(result) => result,
            Err(_) => Err(TaskError::Retryable(format!(
                "timed out after {}s",
                config.task_timeout_secs
            ))),
        };
        busy.fetch_sub(1, Ordering::Relaxed);

        metrics::TASK_DURATION
            .with_label_values(&[kind])
            .observe(started.elapsed().as_secs_f64());

        let outcome = match result {
            Ok(()) => {
                store.succeed(&task.id)?;
                TaskOutcome::Succeeded
            }
            Err(TaskError::Storage(reason)) => {
                warn!("Task {} deferred, storage unavailable: {}", task.id, reason);
                TaskOutcome::Deferred { reason }
            }
            Err(e) => {
                let (reason, retryable) = match e {
                    TaskError::Retryable(r) => (r, true),
                    TaskError::Permanent(r) | TaskError::Storage(r) => (r, false),
                };
                Self::record_failure(store, handler, config, &task, reason, retryable).await?
            }
        };

        metrics::TASKS_EXECUTED
            .with_label_values(&[kind, outcome.label()])
            .inc();

        Ok(Some(TaskReport {
            task_id: task.id,
            kind,
            outcome,
        }))
    }

    async fn record_failure(
        store: &Arc<dyn TaskStore>,
        handler: &Arc<dyn TaskHandler>,
        config: &WorkerConfig,
        task: &Task,
        reason: String,
        retryable: bool,
    ) -> Result<TaskOutcome, QueueError> {
        let exhausted = !retryable || task.attempts >= task.max_attempts;

        if exhausted {
            if let Err(e) = handler.on_exhausted(task, &reason).await {
                warn!("Task {} left leased, failure not recorded: {}", task.id, e);
                return Ok(TaskOutcome::Deferred {
                    reason: e.to_string(),
                });
            }
        }

        match store.fail(&task.id, &reason, retryable, &config.retry, Utc::now())? {
            FailDisposition::Rescheduled { run_after } => {
                metrics::TASK_RETRIES
                    .with_label_values(&[task.kind.name()])
                    .inc();
                info!(
                    "Task {} ({}) failed, retrying at {}: {}",
                    task.id,
                    task.kind.name(),
                    run_after,
                    reason
                );
                Ok(TaskOutcome::Rescheduled { run_after })
            }
            FailDisposition::Exhausted => {
                warn!(
                    "Task {} ({}) failed after {} attempts: {}",
                    task.id,
                    task.kind.name(),
                    task.attempts,
                    reason
                );
                Ok(TaskOutcome::Failed { reason })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RetryConfig;
    use crate::queue::{NewTask, SqliteTaskStore, TaskKind, TaskStatus};
    use std::collections::VecDeque;

    /// Handler replaying scripted results.
    struct ScriptedHandler {
        results: Mutex<VecDeque<Result<(), TaskError>>>,
        exhausted: Mutex<Vec<String>>,
        delay: Option<Duration>,
    }

    impl ScriptedHandler {
        fn new(results: Vec<Result<(), TaskError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                exhausted: Mutex::new(Vec::new()),
                delay: None,
            }
        }
    }

    #[async_trait]
    impl TaskHandler for ScriptedHandler {
        async fn handle(&self, _task: &Task) -> Result<(), TaskError> {
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }

        async fn on_exhausted(&self, task: &Task, reason: &str) -> Result<(), TaskError> {
            self.exhausted
                .lock()
                .unwrap()
                .push(format!("{}:{}", task.kind.name(), reason));
            Ok(())
        }
    }

    fn config() -> WorkerConfig {
        WorkerConfig::default()
            .with_workers(2)
            .with_poll_interval_ms(10)
            .with_retry(RetryConfig {
                max_attempts: 3,
                initial_delay_secs: 0,
                max_delay_secs: 0,
                backoff_multiplier: 1.0,
            })
    }

    fn pool(handler: Arc<ScriptedHandler>) -> (WorkerPool, Arc<SqliteTaskStore>) {
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let pool = WorkerPool::new(config(), store.clone(), handler);
        (pool, store)
    }

    fn enqueue(store: &SqliteTaskStore, id: &str) -> Task {
        store
            .enqueue(&NewTask::new(
                TaskKind::ProcessItem {
                    item_id: id.to_string(),
                    order_id: "o".to_string(),
                },
                3,
            ))
            .unwrap()
    }

    #[tokio::test]
    async fn test_success_acknowledges() {
        let handler = Arc::new(ScriptedHandler::new(vec![Ok(())]));
        let (pool, store) = pool(handler);
        let task = enqueue(&store, "i1");

        let report = pool.process_next().await.unwrap().unwrap();
        assert_eq!(report.outcome, TaskOutcome::Succeeded);
        assert_eq!(
            store.get(&task.id).unwrap().unwrap().status,
            TaskStatus::Succeeded
        );
        assert!(pool.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retryable_until_exhausted() {
        let handler = Arc::new(ScriptedHandler::new(vec![
            Err(TaskError::Retryable("a".to_string())),
            Err(TaskError::Retryable("b".to_string())),
            Err(TaskError::Retryable("c".to_string())),
        ]));
        let (pool, store) = pool(handler.clone());
        enqueue(&store, "i1");

        let reports = pool.drain().await.unwrap();
        assert_eq!(reports.len(), 3);
        assert!(matches!(reports[0].outcome, TaskOutcome::Rescheduled { .. }));
        assert!(matches!(reports[1].outcome, TaskOutcome::Rescheduled { .. }));
        assert_eq!(
            reports[2].outcome,
            TaskOutcome::Failed {
                reason: "c".to_string()
            }
        );
        assert_eq!(
            handler.exhausted.lock().unwrap().as_slice(),
            ["process_item:c".to_string()]
        );
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let handler = Arc::new(ScriptedHandler::new(vec![
            Err(TaskError::Retryable("busy".to_string())),
            Ok(()),
        ]));
        let (pool, store) = pool(handler.clone());
        enqueue(&store, "i1");

        let reports = pool.drain().await.unwrap();
        assert_eq!(reports.last().unwrap().outcome, TaskOutcome::Succeeded);
        assert!(handler.exhausted.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permanent_failure_skips_retries() {
        let handler = Arc::new(ScriptedHandler::new(vec![Err(TaskError::Permanent(
            "bad".to_string(),
        ))]));
        let (pool, store) = pool(handler.clone());
        enqueue(&store, "i1");

        let reports = pool.drain().await.unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(store.counts().unwrap().failed_terminal, 1);
        assert_eq!(handler.exhausted.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_storage_error_keeps_lease() {
        let handler = Arc::new(ScriptedHandler::new(vec![Err(TaskError::Storage(
            "locked".to_string(),
        ))]));
        let (pool, store) = pool(handler);
        let task = enqueue(&store, "i1");

        let report = pool.process_next().await.unwrap().unwrap();
        assert!(matches!(report.outcome, TaskOutcome::Deferred { .. }));
        let stored = store.get(&task.id).unwrap().unwrap();
        assert_eq!(stored.status, TaskStatus::Running);
        assert!(pool.process_next().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_timeout_is_retryable() {
        let handler = Arc::new(ScriptedHandler {
            results: Mutex::new(VecDeque::new()),
            exhausted: Mutex::new(Vec::new()),
            delay: Some(Duration::from_secs(5)),
        });
        let store = Arc::new(SqliteTaskStore::in_memory().unwrap());
        let mut cfg = config();
        cfg.task_timeout_secs = 0;
        let pool = WorkerPool::new(cfg, store.clone(), handler);
        enqueue(&store, "i1");

        let report = pool.process_next().await.unwrap().unwrap();
        assert!(matches!(report.outcome, TaskOutcome::Rescheduled { .. }));
    }

    #[tokio::test]
    async fn test_start_and_stop_drain_queue() {
        let handler = Arc::new(ScriptedHandler::new(vec![]));
        let (pool, store) = pool(handler);
        for i in 0..5 {
            enqueue(&store, &format!("i{}", i));
        }

        pool.start();
        assert!(pool.is_running());

        let mut waited = 0;
        while store.counts().unwrap().succeeded < 5 && waited < 200 {
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 1;
        }

        pool.stop().await;
        let status = pool.status();
        assert!(!status.running);
        assert_eq!(status.queue.succeeded, 5);
        assert_eq!(status.busy, 0);
    }
}
