//! Task types for the durable work queue.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::order::ItemScope;

/// Unit of work carried by a task, with its payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskKind {
    /// Acquire and deliver one order item.
    ProcessItem {
        item_id: String,
        order_id: String,
    },
    /// Fan out the items of a product or massive order.
    ProcessItemBatch { order_id: String },
    /// Materialize and fan out one subscription timeslot.
    ProcessSubscriptionBatch {
        batch_id: String,
        subscription_id: String,
    },
    /// Aggregate step once every item of the scope is terminal.
    Finalize { scope: TaskScope },
    /// Re-derive the status of an order and its batches.
    RefreshDeliveryStatus { order_id: String },
    /// Remove a file past its retention window.
    DeleteExpiredFile { file_id: String },
}

/// Serializable form of [`ItemScope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "level", content = "id", rename_all = "snake_case")]
pub enum TaskScope {
    Order(String),
    Batch(String),
}

impl From<&ItemScope> for TaskScope {
    fn from(scope: &ItemScope) -> Self {
        match scope {
            ItemScope::Order(id) => TaskScope::Order(id.clone()),
            ItemScope::Batch(id) => TaskScope::Batch(id.clone()),
        }
    }
}

impl From<&TaskScope> for ItemScope {
    fn from(scope: &TaskScope) -> Self {
        match scope {
            TaskScope::Order(id) => ItemScope::Order(id.clone()),
            TaskScope::Batch(id) => ItemScope::Batch(id.clone()),
        }
    }
}

impl TaskKind {
    /// Short name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            TaskKind::ProcessItem { .. } => "process_item",
            TaskKind::ProcessItemBatch { .. } => "process_item_batch",
            TaskKind::ProcessSubscriptionBatch { .. } => "process_subscription_batch",
            TaskKind::Finalize { .. } => "finalize",
            TaskKind::RefreshDeliveryStatus { .. } => "refresh_delivery_status",
            TaskKind::DeleteExpiredFile { .. } => "delete_expired_file",
        }
    }

    /// Deduplication key: a second enqueue with the same key returns the
    /// existing task instead of creating one.
    ///
    /// Status refreshes are not deduplicated, they are cheap and may be
    /// requested again after an earlier refresh ran.
    pub fn dedup_key(&self) -> Option<String> {
        match self {
            TaskKind::ProcessItem { item_id, .. } => Some(format!("item:{}", item_id)),
            TaskKind::ProcessItemBatch { order_id } => Some(format!("order:{}", order_id)),
            TaskKind::ProcessSubscriptionBatch { batch_id, .. } => {
                Some(format!("batch:{}", batch_id))
            }
            TaskKind::Finalize { scope } => Some(match scope {
                TaskScope::Order(id) | TaskScope::Batch(id) => format!("finalize:{}", id),
            }),
            TaskKind::RefreshDeliveryStatus { .. } => None,
            TaskKind::DeleteExpiredFile { file_id } => Some(format!("expire:{}", file_id)),
        }
    }
}

/// Task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Succeeded => "succeeded",
            TaskStatus::FailedRetryable => "failed_retryable",
            TaskStatus::FailedTerminal => "failed_terminal",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(TaskStatus::Pending),
            "running" => Some(TaskStatus::Running),
            "succeeded" => Some(TaskStatus::Succeeded),
            "failed_retryable" => Some(TaskStatus::FailedRetryable),
            "failed_terminal" => Some(TaskStatus::FailedTerminal),
            _ => None,
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskStatus::Succeeded | TaskStatus::FailedTerminal)
    }
}

/// A persisted task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dedup_key: Option<String>,
    pub status: TaskStatus,
    /// Executions started so far.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Not claimable before this instant.
    pub run_after: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_expires_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A task to enqueue.
#[derive(Debug, Clone, PartialEq)]
pub struct NewTask {
    pub kind: TaskKind,
    pub dedup_key: Option<String>,
    pub max_attempts: u32,
    pub run_after: DateTime<Utc>,
}

impl NewTask {
    /// New task runnable immediately, keyed by the kind's default dedup key.
    pub fn new(kind: TaskKind, max_attempts: u32) -> Self {
        Self {
            dedup_key: kind.dedup_key(),
            kind,
            max_attempts: max_attempts.max(1),
            run_after: Utc::now(),
        }
    }

    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = run_after;
        self
    }

    pub fn with_dedup_key(mut self, key: Option<String>) -> Self {
        self.dedup_key = key;
        self
    }
}

/// What happened to a failed task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailDisposition {
    /// Another attempt is scheduled.
    Rescheduled { run_after: DateTime<Utc> },
    /// No attempts left, or the failure was not retryable.
    Exhausted,
}

/// Number of tasks per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueCounts {
    pub pending: i64,
    pub running: i64,
    pub succeeded: i64,
    pub failed_retryable: i64,
    pub failed_terminal: i64,
}

impl QueueCounts {
    pub fn from_map(counts: &BTreeMap<String, i64>) -> Self {
        let get = |s: TaskStatus| counts.get(s.as_str()).copied().unwrap_or(0);
        Self {
            pending: get(TaskStatus::Pending),
            running: get(TaskStatus::Running),
            succeeded: get(TaskStatus::Succeeded),
            failed_retryable: get(TaskStatus::FailedRetryable),
            failed_terminal: get(TaskStatus::FailedTerminal),
        }
    }

    /// Tasks that may still run.
    pub fn outstanding(&self) -> i64 {
        self.pending + self.running + self.failed_retryable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dedup_keys() {
        let item = TaskKind::ProcessItem {
            item_id: "i1".to_string(),
            order_id: "o1".to_string(),
        };
        assert_eq!(item.dedup_key().as_deref(), Some("item:i1"));

        let finalize = TaskKind::Finalize {
            scope: TaskScope::Batch("b1".to_string()),
        };
        assert_eq!(finalize.dedup_key().as_deref(), Some("finalize:b1"));

        let refresh = TaskKind::RefreshDeliveryStatus {
            order_id: "o1".to_string(),
        };
        assert_eq!(refresh.dedup_key(), None);
    }

    #[test]
    fn test_kind_serialization() {
        let kind = TaskKind::ProcessSubscriptionBatch {
            batch_id: "b".to_string(),
            subscription_id: "s".to_string(),
        };
        let json = serde_json::to_string(&kind).unwrap();
        assert!(json.contains("\"type\":\"process_subscription_batch\""));
        let parsed: TaskKind = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, kind);

        let scope = TaskKind::Finalize {
            scope: TaskScope::Order("o".to_string()),
        };
        let json = serde_json::to_string(&scope).unwrap();
        assert!(json.contains("\"level\":\"order\""));
    }

    #[test]
    fn test_status_parse() {
        for status in [
            TaskStatus::Pending,
            TaskStatus::Running,
            TaskStatus::Succeeded,
            TaskStatus::FailedRetryable,
            TaskStatus::FailedTerminal,
        ] {
            assert_eq!(TaskStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(TaskStatus::parse("done"), None);
    }

    #[test]
    fn test_new_task_clamps_attempts() {
        let task = NewTask::new(
            TaskKind::DeleteExpiredFile {
                file_id: "f".to_string(),
            },
            0,
        );
        assert_eq!(task.max_attempts, 1);
        assert_eq!(task.dedup_key.as_deref(), Some("expire:f"));
    }
}
