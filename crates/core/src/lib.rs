pub mod config;
pub mod dispatch;
pub mod lifecycle;
pub mod metrics;
pub mod notify;
pub mod order;
pub mod plugin;
pub mod processor;
pub mod queue;
pub mod scheduler;
pub mod service;
pub mod testing;

pub use config::{
    load_config, load_config_from_str, validate_config, Config, ConfigError, SanitizedConfig,
};
pub use dispatch::{BatchDispatcher, DispatchError, TimeslotDispatch};
pub use lifecycle::{
    CancelReport, CompletionEvent, LifecycleError, LifecycleManager, TransitionOutcome,
};
pub use notify::{
    create_notification_system, LogNotifier, Notification, NotificationDispatcher,
    NotificationHandle, NotificationKind, Notifier,
};
pub use order::{
    derive_order_status, Batch, DeliveredFile, ItemStatus, Order, OrderItem, OrderSpec,
    OrderStatus, OrderStore, OrderType, SqliteOrderStore, StoreError, Subscription,
};
pub use plugin::{LocalArchiveProcessor, OrderProcessor, PluginError};
pub use processor::{ItemProcessor, TaskExecutor};
pub use queue::{SqliteTaskStore, TaskStore, WorkerPool, WorkerPoolStatus};
pub use scheduler::{SchedulerStatus, SweepScheduler};
pub use service::{OrderService, OrderStatusReport, ServiceError};
