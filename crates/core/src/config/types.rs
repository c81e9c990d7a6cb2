use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::order::OrderType;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub orders: OrdersConfig,
    #[serde(default)]
    pub notifications: NotificationConfig,
    #[serde(default)]
    pub processor: ProcessorConfig,
}

/// Operations endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port() -> u16 {
    8080
}

/// Database configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

fn default_db_path() -> PathBuf {
    PathBuf::from("oseo.db")
}

/// Worker pool configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WorkerConfig {
    /// Number of concurrent worker loops.
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// How long an idle worker waits before polling the queue again.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Wall-clock budget for a single task execution.
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,

    /// Retry policy for retryable failures.
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            poll_interval_ms: default_poll_interval_ms(),
            task_timeout_secs: default_task_timeout(),
            retry: RetryConfig::default(),
        }
    }
}

impl WorkerConfig {
    /// Set the number of workers.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the poll interval.
    pub fn with_poll_interval_ms(mut self, ms: u64) -> Self {
        self.poll_interval_ms = ms;
        self
    }

    /// Set the task timeout.
    pub fn with_task_timeout_secs(mut self, secs: u64) -> Self {
        self.task_timeout_secs = secs;
        self
    }

    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    /// Lease granted to a claimed task. Outlives the task timeout so a live
    /// worker never loses its claim.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs + 60)
    }
}

/// Retry configuration for failed tasks.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct RetryConfig {
    /// Maximum attempts, including the first execution.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in seconds.
    #[serde(default = "default_retry_delay")]
    pub initial_delay_secs: u64,

    /// Maximum delay between retries in seconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: u64,

    /// Exponential backoff multiplier.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_retry_delay(),
            max_delay_secs: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryConfig {
    /// Delay before the next attempt after `attempt` attempts have failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let secs = self.initial_delay_secs as f64 * self.backoff_multiplier.powi(exponent);
        let capped = secs.min(self.max_delay_secs as f64).max(0.0);
        Duration::from_secs_f64(capped)
    }
}

fn default_workers() -> usize {
    4
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_task_timeout() -> u64 {
    3600 // 1 hour
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    20
}

fn default_max_delay() -> u64 {
    3600 // 1 hour
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

/// Periodic sweep configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Interval of the "advance subscriptions" sweep.
    #[serde(default = "default_advance_interval")]
    pub advance_interval_secs: u64,

    /// Interval of the "expire files / terminate subscriptions" sweep.
    #[serde(default = "default_expiry_interval")]
    pub expiry_interval_secs: u64,

    /// Files expiring within this window get a single warning notice.
    #[serde(default = "default_expiry_warning_hours")]
    pub expiry_warning_hours: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            advance_interval_secs: default_advance_interval(),
            expiry_interval_secs: default_expiry_interval(),
            expiry_warning_hours: default_expiry_warning_hours(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_advance_interval() -> u64 {
    3600 // 1 hour
}

fn default_expiry_interval() -> u64 {
    86400 // 1 day
}

fn default_expiry_warning_hours() -> u64 {
    24
}

/// Order acceptance configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrdersConfig {
    /// Maximum number of items a single order may request.
    #[serde(default = "default_max_order_items")]
    pub max_order_items: usize,

    /// Timeslot length for subscriptions.
    #[serde(default = "default_timeslot_secs")]
    pub default_timeslot_secs: u64,

    #[serde(default)]
    pub product: OrderTypeSettings,
    #[serde(default)]
    pub subscription: OrderTypeSettings,
    #[serde(default)]
    pub massive: OrderTypeSettings,
}

impl Default for OrdersConfig {
    fn default() -> Self {
        Self {
            max_order_items: default_max_order_items(),
            default_timeslot_secs: default_timeslot_secs(),
            product: OrderTypeSettings::default(),
            subscription: OrderTypeSettings::default(),
            massive: OrderTypeSettings::default(),
        }
    }
}

impl OrdersConfig {
    /// Settings that apply to the given order type.
    pub fn settings(&self, order_type: OrderType) -> &OrderTypeSettings {
        match order_type {
            OrderType::Product => &self.product,
            OrderType::Subscription => &self.subscription,
            OrderType::Massive => &self.massive,
        }
    }

    /// Mutable access, used by tests and builders.
    pub fn settings_mut(&mut self, order_type: OrderType) -> &mut OrderTypeSettings {
        match order_type {
            OrderType::Product => &mut self.product,
            OrderType::Subscription => &mut self.subscription,
            OrderType::Massive => &mut self.massive,
        }
    }
}

fn default_max_order_items() -> usize {
    200
}

fn default_timeslot_secs() -> u64 {
    86400 // 1 day
}

/// Per order type settings.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct OrderTypeSettings {
    /// Whether orders of this type are accepted at all.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Accept without moderation.
    #[serde(default = "default_true")]
    pub automatic_approval: bool,

    /// Send a notice when an order of this type is created.
    #[serde(default)]
    pub notify_creation: bool,

    /// How long delivered files stay available.
    #[serde(default = "default_item_availability_days")]
    pub item_availability_days: u32,
}

impl Default for OrderTypeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            automatic_approval: true,
            notify_creation: false,
            item_availability_days: default_item_availability_days(),
        }
    }
}

impl OrderTypeSettings {
    pub fn availability(&self) -> chrono::Duration {
        chrono::Duration::days(self.item_availability_days as i64)
    }
}

fn default_item_availability_days() -> u32 {
    10
}

/// Notification channel configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct NotificationConfig {
    /// Size of the notification channel buffer.
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Recipients of moderation notices.
    #[serde(default)]
    pub moderators: Vec<String>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            moderators: Vec::new(),
        }
    }
}

fn default_buffer_size() -> usize {
    1000
}

/// Configuration of the bundled local archive processor.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProcessorConfig {
    /// Directory holding catalog items, one subdirectory per collection.
    #[serde(default = "default_source_dir")]
    pub source_dir: PathBuf,

    /// Directory delivered files are written to.
    #[serde(default = "default_delivery_dir")]
    pub delivery_dir: PathBuf,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            source_dir: default_source_dir(),
            delivery_dir: default_delivery_dir(),
        }
    }
}

fn default_source_dir() -> PathBuf {
    PathBuf::from("data/catalog")
}

fn default_delivery_dir() -> PathBuf {
    PathBuf::from("data/delivery")
}

/// Sanitized config for the operations endpoint
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub worker: WorkerConfig,
    pub scheduler: SchedulerConfig,
    pub orders: OrdersConfig,
    pub notifications: SanitizedNotificationConfig,
}

/// Moderator addresses are not exposed, only how many there are.
#[derive(Debug, Clone, Serialize)]
pub struct SanitizedNotificationConfig {
    pub buffer_size: usize,
    pub moderators_configured: usize,
}

impl From<&Config> for SanitizedConfig {
    fn from(config: &Config) -> Self {
        Self {
            server: config.server.clone(),
            database: config.database.clone(),
            worker: config.worker.clone(),
            scheduler: config.scheduler.clone(),
            orders: config.orders.clone(),
            notifications: SanitizedNotificationConfig {
                buffer_size: config.notifications.buffer_size,
                moderators_configured: config.notifications.moderators.len(),
            },
        }
    }
}
