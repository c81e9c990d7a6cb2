//! Wiring of the fulfillment engine.
//!
//! Builds the stores, the processing plugin, the notification system and the
//! background components from a [`Config`], and tears them down in order.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use oseo_core::{
    create_notification_system, BatchDispatcher, Config, ItemProcessor, LifecycleManager,
    LocalArchiveProcessor, LogNotifier, Notifier, OrderProcessor, OrderService, OrderStore,
    SqliteOrderStore, SqliteTaskStore, SweepScheduler, TaskExecutor, TaskStore, WorkerPool,
};

use crate::state::AppState;

/// How long shutdown waits for queued notifications to be delivered.
const NOTIFY_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Every long-lived component of a running engine.
pub struct Engine {
    config: Config,
    service: Arc<OrderService>,
    pool: Arc<WorkerPool>,
    scheduler: Arc<SweepScheduler>,
    notify_task: JoinHandle<()>,
}

impl Engine {
    /// Build an engine with the bundled local archive processor and log notifier.
    pub fn new(config: Config) -> Result<Self> {
        let plugin = Arc::new(LocalArchiveProcessor::new(config.processor.clone()));
        Self::with_components(config, plugin, Arc::new(LogNotifier))
    }

    /// Build an engine around the given plugin and notifier.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn with_components(
        config: Config,
        plugin: Arc<dyn OrderProcessor>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let orders: Arc<dyn OrderStore> = Arc::new(
            SqliteOrderStore::new(&config.database.path)
                .context("Failed to create order store")?,
        );
        info!("Order store initialized");

        let tasks: Arc<dyn TaskStore> = Arc::new(
            SqliteTaskStore::new(&config.database.path).context("Failed to create task store")?,
        );
        info!("Task queue initialized");

        let (notify, notify_dispatcher) =
            create_notification_system(notifier, config.notifications.buffer_size);
        let notify_task = tokio::spawn(notify_dispatcher.run());

        let max_attempts = config.worker.retry.max_attempts;
        let dispatcher = Arc::new(BatchDispatcher::new(
            Arc::clone(&orders),
            Arc::clone(&tasks),
            Arc::clone(&plugin),
            max_attempts,
        ));
        let lifecycle = Arc::new(LifecycleManager::new(
            Arc::clone(&orders),
            Arc::clone(&plugin),
            Arc::clone(&dispatcher),
            notify,
            config.orders.clone(),
            config.notifications.moderators.clone(),
        ));

        let executor = TaskExecutor::new(
            Arc::clone(&orders),
            Arc::clone(&lifecycle),
            Arc::clone(&dispatcher),
            ItemProcessor::new(Arc::clone(&orders), Arc::clone(&plugin)),
        );
        let pool = Arc::new(WorkerPool::new(
            config.worker.clone(),
            Arc::clone(&tasks),
            Arc::new(executor),
        ));

        let service = Arc::new(OrderService::new(
            config.orders.clone(),
            Arc::clone(&orders),
            Arc::clone(&tasks),
            plugin,
            Arc::clone(&dispatcher),
            Arc::clone(&lifecycle),
            max_attempts,
        ));

        let scheduler = Arc::new(SweepScheduler::new(
            config.scheduler.clone(),
            orders,
            tasks,
            dispatcher,
            lifecycle,
            max_attempts,
        ));

        Ok(Self {
            config,
            service,
            pool,
            scheduler,
            notify_task,
        })
    }

    /// Start the worker pool and the sweep scheduler.
    pub fn start(&self) {
        self.pool.start();
        self.scheduler.start();
    }

    pub fn service(&self) -> &Arc<OrderService> {
        &self.service
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    pub fn scheduler(&self) -> &Arc<SweepScheduler> {
        &self.scheduler
    }

    /// State for the operations router.
    pub fn app_state(&self) -> Arc<AppState> {
        Arc::new(AppState::new(
            self.config.clone(),
            Arc::clone(&self.pool),
            Arc::clone(&self.scheduler),
        ))
    }

    /// Stop the scheduler, then the worker pool, then let the notification
    /// dispatcher drain once every handle is gone.
    pub async fn shutdown(self) {
        let Self {
            service,
            pool,
            scheduler,
            notify_task,
            ..
        } = self;

        info!("Stopping sweep scheduler...");
        scheduler.stop();

        if pool.is_running() {
            info!("Stopping worker pool...");
            pool.stop().await;
        }

        // The notification channel closes once the last lifecycle manager is dropped.
        drop(service);
        drop(pool);
        drop(scheduler);

        match tokio::time::timeout(NOTIFY_DRAIN_TIMEOUT, notify_task).await {
            Ok(_) => info!("Notification dispatcher stopped"),
            Err(_) => warn!("Notification dispatcher did not stop in time"),
        }
    }
}
