//! Inbound order service.
//!
//! Validates submissions through the plugin, persists new orders and routes
//! client commands to the lifecycle manager.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::config::OrdersConfig;
use crate::dispatch::{BatchDispatcher, DispatchError};
use crate::lifecycle::{CancelReport, LifecycleError, LifecycleManager};
use crate::order::{
    status_message, DeliveredFile, DeliveryMethod, ItemStatus, Order, OrderFilter, OrderItem,
    OrderSpec, OrderStatus, OrderStore, OrderType, PackagingState, StoreError, Subscription,
    SubscriptionStatus,
};
use crate::plugin::{OrderProcessor, PluginError};
use crate::queue::{NewTask, QueueError, Task, TaskKind, TaskStore};

/// Errors returned to clients of the order service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The submission was rejected; nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("lifecycle error: {0}")]
    Lifecycle(LifecycleError),

    #[error("order store error: {0}")]
    Store(StoreError),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// The plugin failed for a reason other than the request itself.
    #[error("plugin error: {0}")]
    Plugin(PluginError),
}

impl From<LifecycleError> for ServiceError {
    fn from(e: LifecycleError) -> Self {
        match e {
            LifecycleError::NotFound { entity, id } => ServiceError::NotFound { entity, id },
            e @ LifecycleError::InvalidState { .. } => ServiceError::InvalidState(e.to_string()),
            other => ServiceError::Lifecycle(other),
        }
    }
}

impl From<StoreError> for ServiceError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound { entity, id } => ServiceError::NotFound { entity, id },
            other => ServiceError::Store(other),
        }
    }
}

impl From<PluginError> for ServiceError {
    fn from(e: PluginError) -> Self {
        if e.is_validation() {
            ServiceError::Validation(e.to_string())
        } else {
            ServiceError::Plugin(e)
        }
    }
}

impl ServiceError {
    fn validation(message: impl Into<String>) -> Self {
        ServiceError::Validation(message.into())
    }

    fn not_found(entity: &'static str, id: &str) -> Self {
        ServiceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }
}

/// Everything a client can see about an order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderStatusReport {
    pub order: Order,
    pub items: Vec<OrderItem>,
    pub subscriptions: Vec<Subscription>,
}

pub struct OrderService {
    config: OrdersConfig,
    orders: Arc<dyn OrderStore>,
    tasks: Arc<dyn TaskStore>,
    plugin: Arc<dyn OrderProcessor>,
    dispatcher: Arc<BatchDispatcher>,
    lifecycle: Arc<LifecycleManager>,
    max_attempts: u32,
}

impl OrderService {
    pub fn new(
        config: OrdersConfig,
        orders: Arc<dyn OrderStore>,
        tasks: Arc<dyn TaskStore>,
        plugin: Arc<dyn OrderProcessor>,
        dispatcher: Arc<BatchDispatcher>,
        lifecycle: Arc<LifecycleManager>,
        max_attempts: u32,
    ) -> Self {
        Self {
            config,
            orders,
            tasks,
            plugin,
            dispatcher,
            lifecycle,
            max_attempts,
        }
    }

    /// Validate and persist a new order, then dispatch it when it needs no
    /// moderation. Returns the order id.
    pub async fn submit_order(&self, spec: OrderSpec) -> Result<String, ServiceError> {
        let settings = self.config.settings(spec.order_type);
        if !settings.enabled {
            return Err(ServiceError::validation(format!(
                "{} orders are disabled",
                spec.order_type.as_str()
            )));
        }
        if spec.ordered_by.trim().is_empty() {
            return Err(ServiceError::validation("ordered_by is required"));
        }
        if let DeliveryMethod::OnlineDataDelivery { target } = &spec.delivery.method {
            if target.trim().is_empty() {
                return Err(ServiceError::validation("delivery target is required"));
            }
        }

        let options = self.parse_options(&spec.options)?;
        let extensions = self.parse_extensions(&spec.extensions)?;
        let packaging = match &spec.delivery.packaging {
            Some(_) if spec.order_type == OrderType::Subscription => {
                return Err(ServiceError::validation(
                    "packaging is not supported for subscription orders",
                ));
            }
            Some(format) => Some(
                self.plugin
                    .validate_and_parse_option("packaging", format)?
                    .value,
            ),
            None => None,
        };

        let now = Utc::now();
        let approved = settings.automatic_approval;
        let order_id = uuid::Uuid::new_v4().to_string();
        let mut order = Order {
            id: order_id.clone(),
            order_type: spec.order_type,
            status: if approved {
                OrderStatus::Accepted
            } else {
                OrderStatus::Submitted
            },
            status_info: None,
            ordered_by: spec.ordered_by.clone(),
            reference: spec.reference.clone(),
            priority: spec.priority,
            delivery: spec.delivery.clone(),
            options,
            extensions,
            packaging: if packaging.is_some() {
                PackagingState::Pending
            } else {
                PackagingState::NotRequested
            },
            submitted_at: now,
            updated_at: now,
            completed_at: None,
        };
        order.delivery.packaging = packaging;

        let (items, subscription) = match spec.order_type {
            OrderType::Subscription => {
                if !spec.items.is_empty() {
                    return Err(ServiceError::validation(
                        "subscription orders do not take items",
                    ));
                }
                let subscription = self.build_subscription(&spec, &order)?;
                if subscription.status == SubscriptionStatus::Expired {
                    order.status = OrderStatus::Terminated;
                }
                (Vec::new(), Some(subscription))
            }
            OrderType::Product | OrderType::Massive => {
                if spec.subscription.is_some() {
                    return Err(ServiceError::validation(format!(
                        "{} orders do not take a subscription",
                        spec.order_type.as_str()
                    )));
                }
                (self.build_items(&spec, &order)?, None)
            }
        };
        order.status_info = Some(status_message(order.status).to_string());

        self.orders
            .insert_order(&order, &items, subscription.as_ref())?;
        info!(
            "Order {} submitted by {} ({}, {} items, {})",
            order.id,
            order.ordered_by,
            order.order_type.as_str(),
            items.len(),
            order.status.as_str()
        );

        self.lifecycle.announce_submission(&order);
        if order.status == OrderStatus::Accepted && order.order_type != OrderType::Subscription {
            self.dispatcher.dispatch_order(&order.id)?;
        }
        Ok(order_id)
    }

    fn parse_options(
        &self,
        raw: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        raw.iter()
            .map(|(name, value)| {
                let parsed = self.plugin.validate_and_parse_option(name, value)?;
                Ok((parsed.name, parsed.value))
            })
            .collect()
    }

    fn parse_extensions(
        &self,
        raw: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, ServiceError> {
        raw.iter()
            .map(|(name, value)| {
                let parsed = self.plugin.validate_and_parse_extension(name, value)?;
                Ok((parsed.name, parsed.value))
            })
            .collect()
    }

    fn build_items(&self, spec: &OrderSpec, order: &Order) -> Result<Vec<OrderItem>, ServiceError> {
        if spec.items.is_empty() {
            return Err(ServiceError::validation("order has no items"));
        }
        if spec.items.len() > self.config.max_order_items {
            return Err(ServiceError::validation(format!(
                "order has {} items, the limit is {}",
                spec.items.len(),
                self.config.max_order_items
            )));
        }

        let status = if order.status == OrderStatus::Accepted {
            ItemStatus::Accepted
        } else {
            ItemStatus::Submitted
        };
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(spec.items.len());
        for item in &spec.items {
            if item.item_id.trim().is_empty() || item.identifier.trim().is_empty() {
                return Err(ServiceError::validation(
                    "items need an item_id and an identifier",
                ));
            }
            if !seen.insert(item.item_id.as_str()) {
                return Err(ServiceError::validation(format!(
                    "duplicate item_id {}",
                    item.item_id
                )));
            }

            // Order-level options apply to every item unless overridden.
            let mut options = order.options.clone();
            options.extend(self.parse_options(&item.options)?);

            items.push(OrderItem {
                id: uuid::Uuid::new_v4().to_string(),
                order_id: order.id.clone(),
                batch_id: None,
                item_id: item.item_id.clone(),
                identifier: item.identifier.clone(),
                collection: item.collection.clone(),
                options,
                status,
                status_info: None,
                attempts: 0,
                file_id: None,
                created_at: order.submitted_at,
                updated_at: order.submitted_at,
                completed_at: None,
            });
        }
        Ok(items)
    }

    fn build_subscription(
        &self,
        spec: &OrderSpec,
        order: &Order,
    ) -> Result<Subscription, ServiceError> {
        let sub = spec
            .subscription
            .as_ref()
            .ok_or_else(|| ServiceError::validation("subscription orders need a subscription"))?;
        if sub.collection.trim().is_empty() {
            return Err(ServiceError::validation("subscription collection is required"));
        }

        let timeslot_secs = sub.timeslot_secs.unwrap_or(self.config.default_timeslot_secs);
        if timeslot_secs == 0 {
            return Err(ServiceError::validation("timeslot length must be positive"));
        }

        let timeslot_length = i64::try_from(timeslot_secs)
            .ok()
            .and_then(TimeDelta::try_seconds)
            .ok_or_else(|| ServiceError::validation("timeslot length is out of range"))?;

        let (begin, end) = self.plugin.subscription_duration(sub)?;
        if end <= begin {
            return Err(ServiceError::validation("subscription ends before it begins"));
        }
        if timeslot_length > end - begin {
            return Err(ServiceError::validation(
                "timeslot length exceeds the subscription window",
            ));
        }

        let mut options = order.options.clone();
        options.extend(self.parse_options(&sub.options)?);

        let now = order.submitted_at;
        let status = if end <= now {
            warn!("Subscription of order {} ended before creation", order.id);
            SubscriptionStatus::Expired
        } else {
            SubscriptionStatus::Active
        };

        Ok(Subscription {
            id: uuid::Uuid::new_v4().to_string(),
            order_id: order.id.clone(),
            owner: order.ordered_by.clone(),
            collection: sub.collection.clone(),
            options,
            begin,
            end,
            timeslot_secs,
            next_timeslot: begin,
            status,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get_order_status(&self, order_id: &str) -> Result<OrderStatusReport, ServiceError> {
        let order = self
            .orders
            .get_order(order_id)?
            .ok_or_else(|| ServiceError::not_found("order", order_id))?;
        Ok(OrderStatusReport {
            items: self.orders.list_items(order_id)?,
            subscriptions: self.orders.list_order_subscriptions(order_id)?,
            order,
        })
    }

    pub fn list_orders(&self, filter: &OrderFilter) -> Result<Vec<Order>, ServiceError> {
        Ok(self.orders.list_orders(filter)?)
    }

    pub async fn cancel_order(
        &self,
        order_id: &str,
        by: &str,
    ) -> Result<CancelReport, ServiceError> {
        Ok(self.lifecycle.cancel_order(order_id, by).await?)
    }

    pub async fn moderate_order(
        &self,
        order_id: &str,
        approved: bool,
        details: Option<&str>,
    ) -> Result<Order, ServiceError> {
        Ok(self.lifecycle.moderate(order_id, approved, details).await?)
    }

    /// Files of the order the client can download now.
    pub fn result_access(&self, order_id: &str) -> Result<Vec<DeliveredFile>, ServiceError> {
        Ok(self.lifecycle.result_access(order_id)?)
    }

    pub fn record_download(&self, file_id: &str) -> Result<DeliveredFile, ServiceError> {
        Ok(self.lifecycle.record_download(file_id)?)
    }

    /// Queue a re-derivation of the order's delivery status.
    pub fn refresh_order(&self, order_id: &str) -> Result<Task, ServiceError> {
        if self.orders.get_order(order_id)?.is_none() {
            return Err(ServiceError::not_found("order", order_id));
        }
        Ok(self.tasks.enqueue(&NewTask::new(
            TaskKind::RefreshDeliveryStatus {
                order_id: order_id.to_string(),
            },
            self.max_attempts,
        ))?)
    }
}
