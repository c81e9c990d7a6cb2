//! Lifecycle events, outcomes and errors.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::dispatch::DispatchError;
use crate::order::StoreError;
use crate::plugin::{DeliveredItem, PluginError};
use crate::queue::QueueError;

/// Typed result of work done outside the lifecycle manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CompletionEvent {
    /// The plugin delivered an item.
    ItemDelivered {
        item_id: String,
        delivered: DeliveredItem,
    },
    /// The item cannot be delivered.
    ItemFailed { item_id: String, reason: String },
    /// The order-level package was produced.
    PackagingSucceeded { order_id: String, location: String },
    /// The order-level package could not be produced.
    PackagingFailed { order_id: String, reason: String },
}

/// What applying an event or command did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransitionOutcome {
    /// The transition was persisted.
    Applied,
    /// The target moved on (for instance it was cancelled) and the result
    /// was dropped.
    Discarded,
    /// The target already was in the resulting state.
    AlreadyTerminal,
}

/// Errors raised by lifecycle transitions.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    /// The operation is not allowed in the current status.
    #[error("cannot {operation} {id}: status is {status}")]
    InvalidState {
        id: String,
        status: String,
        operation: &'static str,
    },

    /// Compare-and-set kept losing against concurrent writers.
    #[error("concurrent modification of {0}")]
    ConcurrencyConflict(String),

    #[error("order store error: {0}")]
    Store(StoreError),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
}

impl From<StoreError> for LifecycleError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => LifecycleError::NotFound { entity, id },
            StoreError::Conflict { entity, id, .. } => {
                LifecycleError::ConcurrencyConflict(format!("{} {}", entity, id))
            }
            other => LifecycleError::Store(other),
        }
    }
}

impl LifecycleError {
    pub(crate) fn not_found(entity: &'static str, id: &str) -> Self {
        LifecycleError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub(crate) fn invalid_state(
        operation: &'static str,
        id: &str,
        status: impl Into<String>,
    ) -> Self {
        LifecycleError::InvalidState {
            id: id.to_string(),
            status: status.into(),
            operation,
        }
    }

    /// Whether the failure comes from unavailable storage.
    pub fn is_unavailable(&self) -> bool {
        match self {
            LifecycleError::Store(e) => e.is_unavailable(),
            LifecycleError::Queue(QueueError::Database(_)) => true,
            LifecycleError::Dispatch(e) => e.is_unavailable(),
            _ => false,
        }
    }
}

/// Summary of a cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReport {
    /// Items moved to `Cancelled`.
    pub cancelled_items: usize,
    /// Subscriptions terminated.
    pub terminated_subscriptions: usize,
}
