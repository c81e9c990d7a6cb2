//! Runs the processing plugin for one item or one order package.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::lifecycle::CompletionEvent;
use crate::order::{Order, OrderItem, OrderStore, StoreError};
use crate::plugin::{ItemRequest, OrderProcessor, PackageRequest, PluginError};

/// Result of one plugin run.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// The run settled the item (or package) either way.
    Finished(CompletionEvent),
    /// The run failed transiently and should be retried.
    Retry(String),
}

/// Drives plugin calls and turns their results into completion events.
pub struct ItemProcessor {
    orders: Arc<dyn OrderStore>,
    plugin: Arc<dyn OrderProcessor>,
}

impl ItemProcessor {
    pub fn new(orders: Arc<dyn OrderStore>, plugin: Arc<dyn OrderProcessor>) -> Self {
        Self { orders, plugin }
    }

    /// Acquire and deliver an item that is in production.
    pub async fn process(&self, item: &OrderItem) -> ProcessOutcome {
        let request = ItemRequest {
            order_id: item.order_id.clone(),
            order_item_id: item.id.clone(),
            identifier: item.identifier.clone(),
            collection: item.collection.clone(),
            options: item.options.clone(),
            attempt: item.attempts,
        };

        debug!(
            "Plugin {} processing item {} ({}) attempt {}",
            self.plugin.name(),
            item.id,
            item.identifier,
            item.attempts
        );

        match self.plugin.acquire_and_deliver_item(&request).await {
            Ok(delivered) => ProcessOutcome::Finished(CompletionEvent::ItemDelivered {
                item_id: item.id.clone(),
                delivered,
            }),
            Err(e) if e.is_retryable() => {
                warn!("Item {} attempt {} failed: {}", item.id, item.attempts, e);
                ProcessOutcome::Retry(e.to_string())
            }
            Err(e) => ProcessOutcome::Finished(CompletionEvent::ItemFailed {
                item_id: item.id.clone(),
                reason: e.to_string(),
            }),
        }
    }

    /// Bundle the delivered item files of an order.
    pub async fn package(&self, order: &Order, format: &str) -> Result<ProcessOutcome, StoreError> {
        let locations: Vec<String> = self
            .orders
            .list_order_files(&order.id)?
            .into_iter()
            .filter(|f| f.available && f.order_item_id.is_some())
            .map(|f| f.location)
            .collect();

        let request = PackageRequest {
            order_id: order.id.clone(),
            format: format.to_string(),
            locations,
        };

        Ok(match self.plugin.package_files(&request).await {
            Ok(location) => ProcessOutcome::Finished(CompletionEvent::PackagingSucceeded {
                order_id: order.id.clone(),
                location,
            }),
            Err(e) if e.is_retryable() => ProcessOutcome::Retry(e.to_string()),
            Err(e) => ProcessOutcome::Finished(CompletionEvent::PackagingFailed {
                order_id: order.id.clone(),
                reason: match e {
                    PluginError::Packaging(reason) => reason,
                    other => other.to_string(),
                },
            }),
        })
    }
}
