//! Task storage trait.

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::RetryConfig;

use super::{FailDisposition, NewTask, QueueCounts, Task, TaskStatus};

/// Error type for queue operations.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum QueueError {
    #[error("task not found: {0}")]
    NotFound(String),

    /// The task is no longer leased by the caller.
    #[error("task {id} is {actual}, expected running")]
    NotRunning { id: String, actual: String },

    #[error("database error: {0}")]
    Database(String),
}

/// Durable at-least-once task queue.
pub trait TaskStore: Send + Sync {
    /// Enqueue a task. When a task with the same dedup key exists, it is
    /// returned unchanged and nothing is inserted.
    fn enqueue(&self, task: &NewTask) -> Result<Task, QueueError>;

    fn get(&self, id: &str) -> Result<Option<Task>, QueueError>;

    fn find_by_dedup_key(&self, key: &str) -> Result<Option<Task>, QueueError>;

    /// Claim the next runnable task with a lease.
    ///
    /// Runnable: `Pending` or `FailedRetryable` with `run_after <= now`, or
    /// `Running` with an expired lease. Claiming counts one attempt.
    fn claim(&self, now: DateTime<Utc>, lease: std::time::Duration)
        -> Result<Option<Task>, QueueError>;

    /// Acknowledge a running task.
    fn succeed(&self, id: &str) -> Result<(), QueueError>;

    /// Record a failed execution of a running task. Retryable failures are
    /// rescheduled with backoff while attempts remain.
    fn fail(
        &self,
        id: &str,
        error: &str,
        retryable: bool,
        retry: &RetryConfig,
        now: DateTime<Utc>,
    ) -> Result<FailDisposition, QueueError>;

    fn list(&self, status: Option<TaskStatus>, limit: i64) -> Result<Vec<Task>, QueueError>;

    fn counts(&self) -> Result<QueueCounts, QueueError>;
}
