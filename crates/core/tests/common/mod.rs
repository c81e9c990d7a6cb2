//! Shared harness for the engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use oseo_core::{
    config::Config,
    notify::{create_notification_system, NotificationKind},
    order::{Order, OrderItem, OrderStore},
    queue::TaskStore,
    testing::{fixtures, MockProcessor, RecordingNotifier},
    BatchDispatcher, ItemProcessor, LifecycleManager, OrderService, SqliteOrderStore,
    SqliteTaskStore, SweepScheduler, TaskExecutor, WorkerPool,
};

/// Every engine component wired against file-backed stores and mocks.
pub struct TestHarness {
    pub config: Config,
    pub orders: Arc<SqliteOrderStore>,
    pub tasks: Arc<SqliteTaskStore>,
    pub plugin: Arc<MockProcessor>,
    pub notifier: RecordingNotifier,
    pub dispatcher: Arc<BatchDispatcher>,
    pub lifecycle: Arc<LifecycleManager>,
    pub service: OrderService,
    pub pool: Arc<WorkerPool>,
    pub scheduler: Arc<SweepScheduler>,
    _temp_dir: TempDir,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(fixtures::test_config())
    }

    pub fn with_config(config: Config) -> Self {
        Self::with_plugin(config, MockProcessor::new())
    }

    pub fn with_plugin(config: Config, plugin: MockProcessor) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let orders = Arc::new(
            SqliteOrderStore::new(&temp_dir.path().join("orders.db"))
                .expect("Failed to create order store"),
        );
        let tasks = Arc::new(
            SqliteTaskStore::new(&temp_dir.path().join("tasks.db"))
                .expect("Failed to create task store"),
        );
        let plugin = Arc::new(plugin);
        let notifier = RecordingNotifier::new();

        let (notify, notify_dispatcher) = create_notification_system(
            Arc::new(notifier.clone()),
            config.notifications.buffer_size,
        );
        tokio::spawn(notify_dispatcher.run());

        let max_attempts = config.worker.retry.max_attempts;
        let dispatcher = Arc::new(BatchDispatcher::new(
            orders.clone(),
            tasks.clone(),
            plugin.clone(),
            max_attempts,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            orders.clone(),
            plugin.clone(),
            dispatcher.clone(),
            notify,
            config.orders.clone(),
            config.notifications.moderators.clone(),
        ));
        let executor = TaskExecutor::new(
            orders.clone(),
            lifecycle.clone(),
            dispatcher.clone(),
            ItemProcessor::new(orders.clone(), plugin.clone()),
        );
        let pool = Arc::new(WorkerPool::new(
            config.worker.clone(),
            tasks.clone(),
            Arc::new(executor),
        ));
        let service = OrderService::new(
            config.orders.clone(),
            orders.clone(),
            tasks.clone(),
            plugin.clone(),
            dispatcher.clone(),
            lifecycle.clone(),
            max_attempts,
        );
        let scheduler = Arc::new(SweepScheduler::new(
            config.scheduler.clone(),
            orders.clone(),
            tasks.clone(),
            dispatcher.clone(),
            lifecycle.clone(),
            max_attempts,
        ));

        Self {
            config,
            orders,
            tasks,
            plugin,
            notifier,
            dispatcher,
            lifecycle,
            service,
            pool,
            scheduler,
            _temp_dir: temp_dir,
        }
    }

    /// Run queued tasks until none is runnable.
    pub async fn drain(&self) -> usize {
        self.pool.drain().await.expect("Failed to drain queue").len()
    }

    pub fn order(&self, order_id: &str) -> Order {
        self.orders
            .get_order(order_id)
            .expect("Failed to load order")
            .expect("Order not found")
    }

    pub fn items(&self, order_id: &str) -> Vec<OrderItem> {
        self.orders.list_items(order_id).expect("Failed to list items")
    }

    pub fn pending_tasks(&self) -> i64 {
        self.tasks.counts().expect("Failed to count tasks").pending
    }

    /// Wait until `count` notifications of `kind` were delivered.
    pub async fn wait_for_notifications(&self, kind: NotificationKind, count: usize) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < Duration::from_secs(5) {
            if self.notifier.of_kind(kind).len() >= count {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }
}
