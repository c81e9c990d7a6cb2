//! Durable task queue and the worker pool that executes it.

mod sqlite;
mod store;
mod types;
mod worker;

pub use sqlite::SqliteTaskStore;
pub use store::{QueueError, TaskStore};
pub use types::{
    FailDisposition, NewTask, QueueCounts, Task, TaskKind, TaskScope, TaskStatus,
};
pub use worker::{TaskError, TaskHandler, TaskOutcome, TaskReport, WorkerPool, WorkerPoolStatus};
