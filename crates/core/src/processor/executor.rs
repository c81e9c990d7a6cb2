//! Task handler routing queued tasks to the engine components.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info};

use crate::dispatch::{BatchDispatcher, DispatchError};
use crate::lifecycle::{CompletionEvent, LifecycleError, LifecycleManager};
use crate::order::{ItemScope, OrderStore, PackagingState, StoreError};
use crate::queue::{Task, TaskError, TaskHandler, TaskKind, TaskScope};

use super::item::{ItemProcessor, ProcessOutcome};

impl From<LifecycleError> for TaskError {
    fn from(e: LifecycleError) -> Self {
        if e.is_unavailable() {
            return TaskError::Storage(e.to_string());
        }
        match e {
            LifecycleError::ConcurrencyConflict(_) => TaskError::Retryable(e.to_string()),
            LifecycleError::Plugin(ref p) if p.is_retryable() => {
                TaskError::Retryable(e.to_string())
            }
            _ => TaskError::Permanent(e.to_string()),
        }
    }
}

impl From<DispatchError> for TaskError {
    fn from(e: DispatchError) -> Self {
        if e.is_unavailable() {
            return TaskError::Storage(e.to_string());
        }
        match e {
            DispatchError::Plugin(ref p) if p.is_retryable() => {
                TaskError::Retryable(e.to_string())
            }
            _ => TaskError::Permanent(e.to_string()),
        }
    }
}

impl From<StoreError> for TaskError {
    fn from(e: StoreError) -> Self {
        if e.is_unavailable() {
            TaskError::Storage(e.to_string())
        } else {
            TaskError::Permanent(e.to_string())
        }
    }
}

/// Executes every [`TaskKind`].
pub struct TaskExecutor {
    orders: Arc<dyn OrderStore>,
    lifecycle: Arc<LifecycleManager>,
    dispatcher: Arc<BatchDispatcher>,
    processor: ItemProcessor,
}

impl TaskExecutor {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        lifecycle: Arc<LifecycleManager>,
        dispatcher: Arc<BatchDispatcher>,
        processor: ItemProcessor,
    ) -> Self {
        Self {
            orders,
            lifecycle,
            dispatcher,
            processor,
        }
    }

    async fn process_item(&self, item_id: &str) -> Result<(), TaskError> {
        let Some(item) = self.lifecycle.start_item(item_id).await? else {
            return Ok(());
        };

        match self.processor.process(&item).await {
            ProcessOutcome::Finished(event) => {
                let outcome = self.lifecycle.apply(event).await?;
                debug!("Item {} settled: {:?}", item_id, outcome);
                Ok(())
            }
            ProcessOutcome::Retry(reason) => Err(TaskError::Retryable(reason)),
        }
    }

    async fn finalize_order(&self, order_id: &str) -> Result<(), TaskError> {
        let order = self
            .orders
            .get_order(order_id)?
            .ok_or_else(|| TaskError::Permanent(format!("order not found: {}", order_id)))?;

        if order.packaging == PackagingState::Pending {
            let delivered = self
                .orders
                .list_scope_items(&ItemScope::Order(order_id.to_string()))?
                .iter()
                .any(|i| i.status.is_delivered());
            let format = order.delivery.packaging.clone().unwrap_or_default();

            if delivered {
                match self.processor.package(&order, &format).await? {
                    ProcessOutcome::Finished(event) => {
                        self.lifecycle.apply(event).await?;
                    }
                    ProcessOutcome::Retry(reason) => return Err(TaskError::Retryable(reason)),
                }
            }
        }

        self.lifecycle.refresh_order(order_id).await?;
        info!("Order {} finalized", order_id);
        Ok(())
    }
}

#[async_trait]
impl TaskHandler for TaskExecutor {
    async fn handle(&self, task: &Task) -> Result<(), TaskError> {
        match &task.kind {
            TaskKind::ProcessItem { item_id, .. } => self.process_item(item_id).await,
            TaskKind::ProcessItemBatch { order_id } => {
                let queued = self.dispatcher.fan_out(order_id)?;
                debug!("Order {} fanned out into {} item tasks", order_id, queued);
                Ok(())
            }
            TaskKind::ProcessSubscriptionBatch { batch_id, .. } => {
                let queued = self.dispatcher.materialize_batch(batch_id).await?;
                if queued == 0 {
                    // Empty or already settled batches still get closed.
                    self.lifecycle.finish_batch(batch_id).await?;
                }
                Ok(())
            }
            TaskKind::Finalize { scope } => match scope {
                TaskScope::Order(order_id) => self.finalize_order(order_id).await,
                TaskScope::Batch(batch_id) => {
                    self.lifecycle.finish_batch(batch_id).await?;
                    Ok(())
                }
            },
            TaskKind::RefreshDeliveryStatus { order_id } => {
                self.lifecycle.refresh_delivery_status(order_id).await?;
                Ok(())
            }
            TaskKind::DeleteExpiredFile { file_id } => {
                self.lifecycle.expire_file(file_id, Utc::now()).await?;
                Ok(())
            }
        }
    }

    async fn on_exhausted(&self, task: &Task, reason: &str) -> Result<(), TaskError> {
        match &task.kind {
            TaskKind::ProcessItem { item_id, .. } => {
                self.lifecycle
                    .apply(CompletionEvent::ItemFailed {
                        item_id: item_id.clone(),
                        reason: format!(
                            "Processing failed after {} attempts: {}",
                            task.attempts, reason
                        ),
                    })
                    .await?;
            }
            TaskKind::Finalize {
                scope: TaskScope::Order(order_id),
            } => {
                self.lifecycle
                    .apply(CompletionEvent::PackagingFailed {
                        order_id: order_id.clone(),
                        reason: reason.to_string(),
                    })
                    .await?;
            }
            kind => {
                error!("Task {} ({}) gave up: {}", task.id, kind.name(), reason);
            }
        }
        Ok(())
    }
}
