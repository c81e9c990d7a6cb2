//! Order lifecycle manager.
//!
//! Owns every state transition of orders, order items, subscriptions and
//! delivered files. Transitions of one item are serialized by [`ItemLocks`]
//! and persisted with compare-and-set writes, so concurrent workers, sweeps
//! and client commands never overwrite each other.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::config::OrdersConfig;
use crate::dispatch::BatchDispatcher;
use crate::metrics;
use crate::notify::{Notification, NotificationHandle, NotificationKind};
use crate::order::{
    status_message, DeliveredFile, DeliveryMethod, ItemScope, ItemStatus, Order, OrderItem,
    OrderStatus, OrderStore, OrderType, PackagingState, StatusChange, StoreError,
    SubscriptionStatus,
};
use crate::plugin::{DeliveredItem, OrderProcessor};

use super::locks::ItemLocks;
use super::types::{CancelReport, CompletionEvent, LifecycleError, TransitionOutcome};

/// Re-reads after a lost compare-and-set before giving up.
const MAX_CAS_ATTEMPTS: usize = 3;

pub struct LifecycleManager {
    orders: Arc<dyn OrderStore>,
    plugin: Arc<dyn OrderProcessor>,
    dispatcher: Arc<BatchDispatcher>,
    notify: NotificationHandle,
    config: OrdersConfig,
    moderators: Vec<String>,
    locks: ItemLocks,
}

impl LifecycleManager {
    pub fn new(
        orders: Arc<dyn OrderStore>,
        plugin: Arc<dyn OrderProcessor>,
        dispatcher: Arc<BatchDispatcher>,
        notify: NotificationHandle,
        config: OrdersConfig,
        moderators: Vec<String>,
    ) -> Self {
        Self {
            orders,
            plugin,
            dispatcher,
            notify,
            config,
            moderators,
            locks: ItemLocks::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn OrderStore> {
        &self.orders
    }

    fn load_order(&self, id: &str) -> Result<Order, LifecycleError> {
        self.orders
            .get_order(id)?
            .ok_or_else(|| LifecycleError::not_found("order", id))
    }

    fn load_item(&self, id: &str) -> Result<OrderItem, LifecycleError> {
        self.orders
            .get_item(id)?
            .ok_or_else(|| LifecycleError::not_found("order item", id))
    }

    fn send(&self, notification: Notification) {
        self.notify.try_emit(notification);
    }

    // ------------------------------------------------------------------
    // Item transitions
    // ------------------------------------------------------------------

    /// Move an item into production for one more attempt.
    ///
    /// Returns `None` when the item already reached a terminal status, for
    /// instance because it was cancelled while its task waited in the queue.
    pub async fn start_item(&self, item_id: &str) -> Result<Option<OrderItem>, LifecycleError> {
        let _guard = self.locks.lock(item_id).await;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let item = self.load_item(item_id)?;
            match item.status {
                ItemStatus::Accepted | ItemStatus::InProduction => {
                    match self.orders.begin_item_attempt(item_id, item.status) {
                        Ok(started) => {
                            metrics::ITEM_TRANSITIONS
                                .with_label_values(&[ItemStatus::InProduction.as_str()])
                                .inc();
                            debug!("Item {} attempt {} started", item_id, started.attempts);
                            self.after_item_transition(&started, false).await?;
                            return Ok(Some(started));
                        }
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                ItemStatus::Submitted => {
                    return Err(LifecycleError::invalid_state(
                        "start",
                        item_id,
                        item.status.as_str(),
                    ))
                }
                status => {
                    debug!("Item {} is {}, not starting", item_id, status.as_str());
                    return Ok(None);
                }
            }
        }

        Err(LifecycleError::ConcurrencyConflict(format!(
            "order item {}",
            item_id
        )))
    }

    /// Apply a completion event.
    pub async fn apply(&self, event: CompletionEvent) -> Result<TransitionOutcome, LifecycleError> {
        match event {
            CompletionEvent::ItemDelivered { item_id, delivered } => {
                self.deliver_item(&item_id, delivered).await
            }
            CompletionEvent::ItemFailed { item_id, reason } => {
                self.fail_item(&item_id, &reason).await
            }
            CompletionEvent::PackagingSucceeded { order_id, location } => {
                self.complete_packaging(&order_id, &location).await
            }
            CompletionEvent::PackagingFailed { order_id, reason } => {
                self.fail_packaging(&order_id, &reason).await
            }
        }
    }

    async fn deliver_item(
        &self,
        item_id: &str,
        delivered: DeliveredItem,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let guard = self.locks.lock(item_id).await;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let item = self.load_item(item_id)?;
            match item.status {
                ItemStatus::InProduction => {
                    let order = self.load_order(&item.order_id)?;
                    let now = Utc::now();
                    let expires = now + self.config.settings(order.order_type).availability();
                    let file = DeliveredFile::new(
                        &item.order_id,
                        Some(item.id.clone()),
                        &delivered.location,
                        now,
                        expires,
                    );

                    match self.orders.complete_item(item_id, &file) {
                        Ok(completed) => {
                            drop(guard);
                            metrics::ITEM_TRANSITIONS
                                .with_label_values(&[ItemStatus::Completed.as_str()])
                                .inc();
                            info!(
                                "Item {} of order {} delivered to {}",
                                item_id, completed.order_id, delivered.location
                            );
                            self.after_item_transition(&completed, true).await?;
                            return Ok(TransitionOutcome::Applied);
                        }
                        Err(e) if e.is_conflict() => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                status if status.is_delivered() => {
                    let registered = match &item.file_id {
                        Some(file_id) => self.orders.get_file(file_id)?,
                        None => None,
                    };
                    if registered.is_some_and(|f| f.location == delivered.location) {
                        debug!("Item {} already delivered to the same location", item_id);
                        return Ok(TransitionOutcome::AlreadyTerminal);
                    }
                    drop(guard);
                    self.discard_location(item_id, &delivered.location).await;
                    return Ok(TransitionOutcome::Discarded);
                }
                ItemStatus::Failed | ItemStatus::Cancelled => {
                    drop(guard);
                    info!(
                        "Discarding late delivery of item {} ({})",
                        item_id,
                        item.status.as_str()
                    );
                    self.discard_location(item_id, &delivered.location).await;
                    return Ok(TransitionOutcome::Discarded);
                }
                status => {
                    return Err(LifecycleError::invalid_state(
                        "deliver",
                        item_id,
                        status.as_str(),
                    ))
                }
            }
        }

        Err(LifecycleError::ConcurrencyConflict(format!(
            "order item {}",
            item_id
        )))
    }

    /// Remove a file that will never be registered.
    async fn discard_location(&self, owner: &str, location: &str) {
        match self
            .plugin
            .clean_files(Utc::now(), &[location.to_string()])
            .await
        {
            Ok(_) => debug!("Cleaned discarded file {} of {}", location, owner),
            Err(e) => warn!("Failed to clean discarded file {} of {}: {}", location, owner, e),
        }
    }

    async fn fail_item(
        &self,
        item_id: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let guard = self.locks.lock(item_id).await;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let item = self.load_item(item_id)?;
            let result = match item.status {
                ItemStatus::InProduction => self.orders.update_item_status(
                    item_id,
                    ItemStatus::InProduction,
                    ItemStatus::Failed,
                    Some(reason),
                ),
                // Failing requires passing through production first.
                ItemStatus::Accepted => {
                    match self.orders.begin_item_attempt(item_id, ItemStatus::Accepted) {
                        Ok(_) | Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                ItemStatus::Submitted => {
                    return Err(LifecycleError::invalid_state(
                        "fail",
                        item_id,
                        item.status.as_str(),
                    ))
                }
                _ => return Ok(TransitionOutcome::AlreadyTerminal),
            };

            match result {
                Ok(failed) => {
                    drop(guard);
                    metrics::ITEM_TRANSITIONS
                        .with_label_values(&[ItemStatus::Failed.as_str()])
                        .inc();
                    warn!("Item {} of order {} failed: {}", item_id, failed.order_id, reason);
                    self.after_item_transition(&failed, true).await?;
                    return Ok(TransitionOutcome::Applied);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(LifecycleError::ConcurrencyConflict(format!(
            "order item {}",
            item_id
        )))
    }

    async fn cancel_item(&self, item_id: &str, info: &str) -> Result<bool, LifecycleError> {
        let _guard = self.locks.lock(item_id).await;

        for _ in 0..MAX_CAS_ATTEMPTS {
            let item = self.load_item(item_id)?;
            if !item.status.can_cancel() {
                return Ok(false);
            }
            match self
                .orders
                .update_item_status(item_id, item.status, ItemStatus::Cancelled, Some(info))
            {
                Ok(_) => {
                    metrics::ITEM_TRANSITIONS
                        .with_label_values(&[ItemStatus::Cancelled.as_str()])
                        .inc();
                    return Ok(true);
                }
                Err(e) if e.is_conflict() => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(LifecycleError::ConcurrencyConflict(format!(
            "order item {}",
            item_id
        )))
    }

    /// Re-derive the status of the item's scope and, once every sibling is
    /// terminal, queue the aggregate finalize step.
    async fn after_item_transition(
        &self,
        item: &OrderItem,
        terminal: bool,
    ) -> Result<(), LifecycleError> {
        let scope = ItemScope::of(item);
        match &scope {
            ItemScope::Order(order_id) => {
                self.refresh_order(order_id).await?;
            }
            ItemScope::Batch(batch_id) => {
                self.orders.refresh_batch_status(batch_id)?;
            }
        }

        if terminal {
            self.check_barrier(&scope)?;
        }
        Ok(())
    }

    fn check_barrier(&self, scope: &ItemScope) -> Result<bool, LifecycleError> {
        if self.orders.count_unfinished_items(scope)? > 0 {
            return Ok(false);
        }
        self.dispatcher.schedule_finalize(scope)?;
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Order level
    // ------------------------------------------------------------------

    /// Re-derive and persist the order status, notifying on change.
    pub async fn refresh_order(&self, order_id: &str) -> Result<StatusChange, LifecycleError> {
        let change = self.orders.refresh_order_status(order_id)?;
        if change.changed() {
            let order = self.load_order(order_id)?;
            info!(
                "Order {} moved from {} to {}",
                order_id,
                change.previous.as_str(),
                change.current.as_str()
            );
            self.announce_status(&order);
        }
        Ok(change)
    }

    /// Send the notice matching the order's current status, if any.
    fn announce_status(&self, order: &Order) {
        if order.status.is_terminal() {
            metrics::ORDERS_FINISHED
                .with_label_values(&[order.status.as_str()])
                .inc();
        }
        let kind = match order.status {
            OrderStatus::Accepted => NotificationKind::OrderAccepted,
            OrderStatus::Completed => NotificationKind::OrderCompleted,
            OrderStatus::Failed => NotificationKind::OrderFailed,
            OrderStatus::Cancelled => NotificationKind::OrderCancelled,
            _ => return,
        };

        let mut notification = Notification::new(kind, &order.ordered_by)
            .with("order_id", &order.id)
            .with("order_type", order.order_type.as_str());
        if let Some(info) = &order.status_info {
            notification = notification.with("status_info", info);
        }
        if let Some(reference) = &order.reference {
            notification = notification.with("reference", reference);
        }
        self.send(notification);
    }

    /// Notices sent right after an order was stored.
    pub fn announce_submission(&self, order: &Order) {
        match order.status {
            OrderStatus::Submitted => {
                for moderator in &self.moderators {
                    self.send(
                        Notification::new(NotificationKind::OrderAwaitingModeration, moderator)
                            .with("order_id", &order.id)
                            .with("order_type", order.order_type.as_str())
                            .with("ordered_by", &order.ordered_by),
                    );
                }
            }
            OrderStatus::Accepted => {
                if self.config.settings(order.order_type).notify_creation {
                    self.announce_status(order);
                }
            }
            _ => {}
        }
    }

    async fn complete_packaging(
        &self,
        order_id: &str,
        location: &str,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let order = self.load_order(order_id)?;
        match &order.packaging {
            PackagingState::Pending => {}
            PackagingState::Completed { location: existing } if existing == location => {
                return Ok(TransitionOutcome::AlreadyTerminal);
            }
            _ => {
                self.discard_location(order_id, location).await;
                return Ok(TransitionOutcome::Discarded);
            }
        }

        let now = Utc::now();
        let expires = now + self.config.settings(order.order_type).availability();
        let file = DeliveredFile::new(order_id, None, location, now, expires);
        match self.orders.complete_packaging(order_id, &file) {
            Ok(()) => {}
            Err(e) if e.is_conflict() => {
                self.discard_location(order_id, location).await;
                return Ok(TransitionOutcome::Discarded);
            }
            Err(e) => return Err(e.into()),
        }

        info!("Order {} packaged at {}", order_id, location);
        self.refresh_order(order_id).await?;
        Ok(TransitionOutcome::Applied)
    }

    async fn fail_packaging(
        &self,
        order_id: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let order = self.load_order(order_id)?;
        if order.packaging != PackagingState::Pending {
            return Ok(TransitionOutcome::AlreadyTerminal);
        }
        self.orders.set_packaging(
            order_id,
            &PackagingState::Failed {
                reason: reason.to_string(),
            },
        )?;
        warn!("Packaging of order {} failed: {}", order_id, reason);
        self.refresh_order(order_id).await?;
        Ok(TransitionOutcome::Applied)
    }

    /// Cancel every non-terminal item of an order.
    ///
    /// Items already in production are cancelled too; their late results
    /// are discarded. Cancelling a finished order changes nothing.
    pub async fn cancel_order(
        &self,
        order_id: &str,
        by: &str,
    ) -> Result<CancelReport, LifecycleError> {
        let order = self.load_order(order_id)?;
        let mut report = CancelReport::default();
        if order.status.is_terminal() {
            debug!("Order {} already {}", order_id, order.status.as_str());
            return Ok(report);
        }

        let info = format!("Cancelled by {}", by);
        let mut scopes = HashSet::new();
        for item in self.orders.list_items(order_id)? {
            if self.cancel_item(&item.id, &info).await? {
                report.cancelled_items += 1;
                scopes.insert(ItemScope::of(&item));
            }
        }

        if order.order_type == OrderType::Subscription {
            report.terminated_subscriptions = self.terminate_order_subscriptions(order_id)?;
            for scope in &scopes {
                self.orders.refresh_batch_status(scope.id())?;
                self.check_barrier(scope)?;
            }
            self.close_subscription_order(&order, OrderStatus::Cancelled, &info)?;
        } else {
            self.refresh_order(order_id).await?;
            for scope in &scopes {
                self.check_barrier(scope)?;
            }
        }

        info!(
            "Order {} cancelled by {}: {} items, {} subscriptions",
            order_id, by, report.cancelled_items, report.terminated_subscriptions
        );
        Ok(report)
    }

    fn terminate_order_subscriptions(&self, order_id: &str) -> Result<usize, LifecycleError> {
        let mut terminated = 0;
        for subscription in self.orders.list_order_subscriptions(order_id)? {
            if subscription.status != SubscriptionStatus::Active {
                continue;
            }
            match self.orders.update_subscription_status(
                &subscription.id,
                SubscriptionStatus::Active,
                SubscriptionStatus::Terminated,
            ) {
                Ok(_) => terminated += 1,
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(terminated)
    }

    /// Move a subscription order to a final status unless it already is final.
    fn close_subscription_order(
        &self,
        order: &Order,
        status: OrderStatus,
        info: &str,
    ) -> Result<bool, LifecycleError> {
        let mut current = order.status;
        for _ in 0..MAX_CAS_ATTEMPTS {
            if current.is_terminal() {
                return Ok(false);
            }
            match self
                .orders
                .update_order_status(&order.id, current, status, Some(info))
            {
                Ok(updated) => {
                    self.announce_status(&updated);
                    return Ok(true);
                }
                Err(StoreError::Conflict { .. }) => {
                    current = self.load_order(&order.id)?.status;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(LifecycleError::ConcurrencyConflict(format!("order {}", order.id)))
    }

    /// Approve or reject an order awaiting moderation.
    pub async fn moderate(
        &self,
        order_id: &str,
        approved: bool,
        details: Option<&str>,
    ) -> Result<Order, LifecycleError> {
        let order = self.load_order(order_id)?;
        if order.status != OrderStatus::Submitted {
            return Err(LifecycleError::invalid_state(
                "moderate",
                order_id,
                order.status.as_str(),
            ));
        }

        if !approved {
            let info = details.unwrap_or("Order rejected by moderator");
            for item in self.orders.list_items(order_id)? {
                self.cancel_item(&item.id, info).await?;
            }
            self.terminate_order_subscriptions(order_id)?;
            let updated = self.orders.update_order_status(
                order_id,
                OrderStatus::Submitted,
                OrderStatus::Cancelled,
                Some(info),
            )?;
            info!("Order {} rejected: {}", order_id, info);
            self.announce_status(&updated);
            return Ok(updated);
        }

        for item in self.orders.list_items(order_id)? {
            if item.status != ItemStatus::Submitted {
                continue;
            }
            let _guard = self.locks.lock(&item.id).await;
            match self.orders.update_item_status(
                &item.id,
                ItemStatus::Submitted,
                ItemStatus::Accepted,
                None,
            ) {
                Ok(_) => {
                    metrics::ITEM_TRANSITIONS
                        .with_label_values(&[ItemStatus::Accepted.as_str()])
                        .inc();
                }
                Err(e) if e.is_conflict() => {}
                Err(e) => return Err(e.into()),
            }
        }

        let info = details.unwrap_or(status_message(OrderStatus::Accepted));
        let updated = self.orders.update_order_status(
            order_id,
            OrderStatus::Submitted,
            OrderStatus::Accepted,
            Some(info),
        )?;
        info!("Order {} approved", order_id);
        self.announce_status(&updated);

        if updated.order_type != OrderType::Subscription {
            self.dispatcher.dispatch_order(order_id)?;
        }
        Ok(updated)
    }

    /// Re-derive order and batch status, queue again any work of an accepted
    /// order that has no task, and re-check the finalize barriers.
    ///
    /// Orders and tasks live in separate stores, so a crash between accepting
    /// an order and queueing its work leaves runnable items without a task.
    /// Item and batch tasks are keyed, so re-queueing work that is already
    /// queued is a no-op.
    pub async fn refresh_delivery_status(&self, order_id: &str) -> Result<(), LifecycleError> {
        let order = self.load_order(order_id)?;
        let open = order.status != OrderStatus::Submitted && !order.status.is_terminal();

        if order.order_type == OrderType::Subscription {
            for subscription in self.orders.list_order_subscriptions(order_id)? {
                for batch in self.orders.list_batches(&subscription.id)? {
                    if open && !batch.status.is_terminal() {
                        self.dispatcher.redispatch_batch(&batch)?;
                    }
                    self.orders.refresh_batch_status(&batch.id)?;
                    if batch.materialized {
                        self.check_barrier(&ItemScope::Batch(batch.id.clone()))?;
                    }
                }
            }
            return Ok(());
        }

        if open {
            let queued = self.dispatcher.fan_out(order_id)?;
            debug!("Refresh of order {} re-queued {} item tasks", order_id, queued);
        }
        self.refresh_order(order_id).await?;
        if order.status != OrderStatus::Submitted {
            self.check_barrier(&ItemScope::Order(order_id.to_string()))?;
        }
        Ok(())
    }

    /// Close a subscription batch whose items are all terminal.
    pub async fn finish_batch(&self, batch_id: &str) -> Result<TransitionOutcome, LifecycleError> {
        self.orders.refresh_batch_status(batch_id)?;
        let batch = self
            .orders
            .get_batch(batch_id)?
            .ok_or_else(|| LifecycleError::not_found("batch", batch_id))?;

        let delivered = self
            .orders
            .list_scope_items(&ItemScope::Batch(batch_id.to_string()))?
            .iter()
            .filter(|i| i.status.is_delivered())
            .count();
        if delivered == 0 {
            debug!("Batch {} finished without deliveries", batch_id);
            return Ok(TransitionOutcome::Applied);
        }

        let subscription = self
            .orders
            .get_subscription(&batch.subscription_id)?
            .ok_or_else(|| LifecycleError::not_found("subscription", &batch.subscription_id))?;
        self.send(
            Notification::new(
                NotificationKind::SubscriptionBatchAvailable,
                &subscription.owner,
            )
            .with("order_id", &batch.order_id)
            .with("subscription_id", &subscription.id)
            .with("batch_id", &batch.id)
            .with("timeslot", batch.timeslot.to_rfc3339())
            .with("items", delivered),
        );
        Ok(TransitionOutcome::Applied)
    }

    // ------------------------------------------------------------------
    // Subscriptions
    // ------------------------------------------------------------------

    /// End an active subscription. The owning order terminates with its
    /// last active subscription.
    pub async fn terminate_subscription(
        &self,
        subscription_id: &str,
        reason: &str,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let subscription = self
            .orders
            .get_subscription(subscription_id)?
            .ok_or_else(|| LifecycleError::not_found("subscription", subscription_id))?;
        if subscription.status != SubscriptionStatus::Active {
            return Ok(TransitionOutcome::AlreadyTerminal);
        }

        match self.orders.update_subscription_status(
            subscription_id,
            SubscriptionStatus::Active,
            SubscriptionStatus::Terminated,
        ) {
            Ok(_) => {}
            Err(e) if e.is_conflict() => return Ok(TransitionOutcome::AlreadyTerminal),
            Err(e) => return Err(e.into()),
        }

        info!("Subscription {} terminated: {}", subscription_id, reason);
        metrics::SUBSCRIPTIONS_TERMINATED.inc();
        self.send(
            Notification::new(NotificationKind::SubscriptionTerminated, &subscription.owner)
                .with("order_id", &subscription.order_id)
                .with("subscription_id", subscription_id)
                .with("reason", reason),
        );

        let remaining = self
            .orders
            .list_order_subscriptions(&subscription.order_id)?
            .iter()
            .filter(|s| s.status == SubscriptionStatus::Active)
            .count();
        if remaining == 0 {
            let order = self.load_order(&subscription.order_id)?;
            self.close_subscription_order(
                &order,
                OrderStatus::Terminated,
                status_message(OrderStatus::Terminated),
            )?;
        }
        Ok(TransitionOutcome::Applied)
    }

    // ------------------------------------------------------------------
    // Delivered files
    // ------------------------------------------------------------------

    /// Remove an expired file and expire its item.
    ///
    /// The `available` flag is cleared by compare-and-set first; only the
    /// caller that wins it deletes the file, so repeated sweeps are no-ops.
    pub async fn expire_file(
        &self,
        file_id: &str,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome, LifecycleError> {
        let file = self
            .orders
            .get_file(file_id)?
            .ok_or_else(|| LifecycleError::not_found("delivered file", file_id))?;
        if !file.available {
            return Ok(TransitionOutcome::AlreadyTerminal);
        }
        if !file.is_expired_at(now) {
            debug!("File {} not expired yet", file_id);
            return Ok(TransitionOutcome::Discarded);
        }
        if !self.orders.mark_file_unavailable(file_id)? {
            return Ok(TransitionOutcome::AlreadyTerminal);
        }

        match self
            .plugin
            .clean_files(now, std::slice::from_ref(&file.location))
            .await
        {
            Ok(deleted) => info!("File {} expired, {} deleted", file_id, deleted),
            Err(e) => warn!(
                "File {} marked expired but {} was not deleted: {}",
                file_id, file.location, e
            ),
        }

        if let Some(item_id) = &file.order_item_id {
            self.expire_item(item_id).await?;
        }
        Ok(TransitionOutcome::Applied)
    }

    async fn expire_item(&self, item_id: &str) -> Result<(), LifecycleError> {
        let guard = self.locks.lock(item_id).await;
        let item = self.load_item(item_id)?;
        if item.status != ItemStatus::Completed {
            return Ok(());
        }
        match self.orders.update_item_status(
            item_id,
            ItemStatus::Completed,
            ItemStatus::Expired,
            Some("Delivered file expired"),
        ) {
            Ok(expired) => {
                drop(guard);
                metrics::ITEM_TRANSITIONS
                    .with_label_values(&[ItemStatus::Expired.as_str()])
                    .inc();
                self.after_item_transition(&expired, false).await
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Send the "expiring soon" notice for a file, once.
    pub fn warn_file_expiring(&self, file: &DeliveredFile) -> Result<bool, LifecycleError> {
        if !self.orders.mark_file_warned(&file.id)? {
            return Ok(false);
        }
        let order = self.load_order(&file.order_id)?;
        self.send(
            Notification::new(NotificationKind::FileExpiringSoon, &order.ordered_by)
                .with("order_id", &order.id)
                .with("file_id", &file.id)
                .with("expires_at", file.expires_at.to_rfc3339()),
        );
        Ok(true)
    }

    /// Files of an order the client can download now.
    ///
    /// Only online-access orders expose files. Product and massive orders
    /// expose them once completed, as the package when one was built;
    /// subscription orders expose each batch's files as they arrive.
    pub fn result_access(&self, order_id: &str) -> Result<Vec<DeliveredFile>, LifecycleError> {
        let order = self.load_order(order_id)?;
        if order.delivery.method != DeliveryMethod::OnlineDataAccess {
            return Ok(Vec::new());
        }
        if order.order_type != OrderType::Subscription && order.status != OrderStatus::Completed {
            return Ok(Vec::new());
        }

        let files: Vec<DeliveredFile> = self
            .orders
            .list_order_files(order_id)?
            .into_iter()
            .filter(|f| f.available)
            .collect();
        if let Some(package) = files.iter().find(|f| f.order_item_id.is_none()) {
            return Ok(vec![package.clone()]);
        }
        Ok(files)
    }

    /// Count a download of an available file.
    pub fn record_download(&self, file_id: &str) -> Result<DeliveredFile, LifecycleError> {
        match self.orders.record_download(file_id, Utc::now()) {
            Ok(file) => Ok(file),
            Err(StoreError::Conflict { .. }) => Err(LifecycleError::invalid_state(
                "download",
                file_id,
                "unavailable",
            )),
            Err(e) => Err(e.into()),
        }
    }
}
