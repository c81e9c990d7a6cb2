use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{debug, info};

use crate::metrics;
use crate::order::{
    Batch, BatchCreation, ItemScope, ItemStatus, OrderItem, OrderStore, StoreError, Subscription,
};
use crate::plugin::{OrderProcessor, PluginError, Timeslot};
use crate::queue::{NewTask, QueueError, Task, TaskKind, TaskScope, TaskStore};

/// Errors that can occur while dispatching work.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("order store error: {0}")]
    Store(#[from] StoreError),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("plugin error: {0}")]
    Plugin(#[from] PluginError),
}

impl DispatchError {
    fn not_found(entity: &'static str, id: &str) -> Self {
        DispatchError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the failure comes from unavailable storage.
    pub fn is_unavailable(&self) -> bool {
        match self {
            DispatchError::Store(e) => e.is_unavailable(),
            DispatchError::Queue(QueueError::Database(_)) => true,
            _ => false,
        }
    }
}

/// Result of dispatching one subscription timeslot.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeslotDispatch {
    /// A new batch was created and queued.
    Dispatched(Batch),
    /// The timeslot had a batch already.
    AlreadyDispatched(Batch),
}

impl TimeslotDispatch {
    pub fn batch(&self) -> &Batch {
        match self {
            TimeslotDispatch::Dispatched(b) | TimeslotDispatch::AlreadyDispatched(b) => b,
        }
    }
}

/// Groups order items into batches and hands them to the task queue.
pub struct BatchDispatcher {
    orders: Arc<dyn OrderStore>,
    tasks: Arc<dyn TaskStore>,
    plugin: Arc<dyn OrderProcessor>,
    max_attempts: u32,
}

impl BatchDispatcher {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        tasks: Arc<dyn TaskStore>,
        plugin: Arc<dyn OrderProcessor>,
        max_attempts: u32,
    ) -> Self {
        Self {
            orders,
            tasks,
            plugin,
            max_attempts,
        }
    }

    fn enqueue(&self, kind: TaskKind) -> Result<Task, DispatchError> {
        Ok(self.tasks.enqueue(&NewTask::new(kind, self.max_attempts))?)
    }

    /// Queue the batch task of a product or massive order.
    pub fn dispatch_order(&self, order_id: &str) -> Result<Task, DispatchError> {
        if self.orders.get_order(order_id)?.is_none() {
            return Err(DispatchError::not_found("order", order_id));
        }
        let task = self.enqueue(TaskKind::ProcessItemBatch {
            order_id: order_id.to_string(),
        })?;
        info!("Dispatched order {} as task {}", order_id, task.id);
        Ok(task)
    }

    /// Queue one item task per runnable item of the order.
    pub fn fan_out(&self, order_id: &str) -> Result<usize, DispatchError> {
        let items = self
            .orders
            .list_scope_items(&ItemScope::Order(order_id.to_string()))?;
        self.enqueue_items(&items)
    }

    fn enqueue_items(&self, items: &[OrderItem]) -> Result<usize, DispatchError> {
        let mut queued = 0;
        for item in items {
            if !matches!(item.status, ItemStatus::Accepted | ItemStatus::InProduction) {
                continue;
            }
            self.enqueue(TaskKind::ProcessItem {
                item_id: item.id.clone(),
                order_id: item.order_id.clone(),
            })?;
            queued += 1;
        }
        debug!("Queued {} item tasks", queued);
        Ok(queued)
    }

    /// Create the batch of a subscription timeslot and queue it.
    ///
    /// Dispatching the same timeslot again reports `AlreadyDispatched`. The
    /// batch task is re-enqueued in that case as well, which the dedup key
    /// turns into a no-op unless an earlier dispatch crashed before queueing.
    pub fn dispatch_timeslot(
        &self,
        subscription: &Subscription,
        timeslot: DateTime<Utc>,
    ) -> Result<TimeslotDispatch, DispatchError> {
        let creation = self.orders.create_batch(&subscription.id, timeslot)?;
        let batch = creation.batch().clone();

        self.enqueue(TaskKind::ProcessSubscriptionBatch {
            batch_id: batch.id.clone(),
            subscription_id: subscription.id.clone(),
        })?;

        match creation {
            BatchCreation::Created(_) => {
                metrics::BATCHES_DISPATCHED.inc();
                info!(
                    "Dispatched batch {} of subscription {} for timeslot {}",
                    batch.id, subscription.id, timeslot
                );
                Ok(TimeslotDispatch::Dispatched(batch))
            }
            BatchCreation::Existing(_) => {
                debug!(
                    "Timeslot {} of subscription {} already dispatched",
                    timeslot, subscription.id
                );
                Ok(TimeslotDispatch::AlreadyDispatched(batch))
            }
        }
    }

    /// Create the items of a batch and queue them. Replays only re-queue.
    pub async fn materialize_batch(&self, batch_id: &str) -> Result<usize, DispatchError> {
        let batch = self
            .orders
            .get_batch(batch_id)?
            .ok_or_else(|| DispatchError::not_found("batch", batch_id))?;

        if !batch.materialized {
            let subscription = self
                .orders
                .get_subscription(&batch.subscription_id)?
                .ok_or_else(|| DispatchError::not_found("subscription", &batch.subscription_id))?;

            // Batches only exist for elapsed timeslots, whose end is representable.
            let timeslot = Timeslot {
                start: batch.timeslot,
                end: subscription
                    .timeslot_end(batch.timeslot)
                    .unwrap_or(subscription.end),
            };
            let identifiers = self
                .plugin
                .subscription_batch_item_identifiers(
                    timeslot,
                    &subscription.collection,
                    &subscription.options,
                )
                .await?;

            let now = Utc::now();
            let items: Vec<OrderItem> = identifiers
                .into_iter()
                .map(|identifier| OrderItem {
                    id: uuid::Uuid::new_v4().to_string(),
                    order_id: batch.order_id.clone(),
                    batch_id: Some(batch.id.clone()),
                    item_id: identifier.clone(),
                    identifier,
                    collection: subscription.collection.clone(),
                    options: subscription.options.clone(),
                    status: ItemStatus::Accepted,
                    status_info: None,
                    attempts: 0,
                    file_id: None,
                    created_at: now,
                    updated_at: now,
                    completed_at: None,
                })
                .collect();

            if self.orders.materialize_batch(batch_id, &items)? {
                info!("Materialized batch {} with {} items", batch_id, items.len());
            }
        }

        let items = self
            .orders
            .list_scope_items(&ItemScope::Batch(batch_id.to_string()))?;
        self.enqueue_items(&items)
    }

    /// Queue the outstanding work of a batch again: the batch task while the
    /// batch has no items, its runnable item tasks afterwards.
    pub fn redispatch_batch(&self, batch: &Batch) -> Result<usize, DispatchError> {
        if !batch.materialized {
            self.enqueue(TaskKind::ProcessSubscriptionBatch {
                batch_id: batch.id.clone(),
                subscription_id: batch.subscription_id.clone(),
            })?;
            return Ok(1);
        }
        let items = self
            .orders
            .list_scope_items(&ItemScope::Batch(batch.id.clone()))?;
        self.enqueue_items(&items)
    }

    /// Queue the aggregate step of a scope whose items are all terminal.
    pub fn schedule_finalize(&self, scope: &ItemScope) -> Result<Task, DispatchError> {
        let task = self.enqueue(TaskKind::Finalize {
            scope: TaskScope::from(scope),
        })?;
        debug!("Finalize of {} queued as task {}", scope.id(), task.id);
        Ok(task)
    }
}
