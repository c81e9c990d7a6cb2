//! Temporal sweep scheduler.
//!
//! Two independent loops:
//! - advance: dispatch every elapsed subscription timeslot, then terminate
//!   subscriptions past their end date
//! - expiry: queue deletion of expired files, warn about files expiring soon
//!   and terminate subscriptions past their end date
//!
//! A one-shot recovery sweep runs on start and refreshes every open order, so
//! work lost between the order store and the task queue is queued again.
//!
//! All sweeps only issue idempotent commands, so overlapping or repeated
//! runs are harmless.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::dispatch::{BatchDispatcher, DispatchError, TimeslotDispatch};
use crate::lifecycle::{LifecycleError, LifecycleManager, TransitionOutcome};
use crate::metrics;
use crate::order::{OrderFilter, OrderStatus, OrderStore, StoreError, Subscription};
use crate::queue::{NewTask, QueueError, TaskKind, TaskStore};

/// Orders listed per page by the recovery sweep.
const RECOVERY_PAGE_SIZE: i64 = 200;

/// Errors aborting a sweep run.
#[derive(Debug, Error)]
pub enum SweepError {
    #[error("order store error: {0}")]
    Store(#[from] StoreError),

    #[error("task queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("lifecycle error: {0}")]
    Lifecycle(#[from] LifecycleError),
}

/// What one advance sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdvanceReport {
    pub batches_dispatched: usize,
    pub already_dispatched: usize,
    pub subscriptions_terminated: usize,
}

/// What one expiry sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExpiryReport {
    pub expiry_tasks: usize,
    pub warnings_sent: usize,
    pub subscriptions_terminated: usize,
}

/// Current status of the scheduler.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub active_subscriptions: usize,
}

pub struct SweepScheduler {
    config: SchedulerConfig,
    orders: Arc<dyn OrderStore>,
    tasks: Arc<dyn TaskStore>,
    dispatcher: Arc<BatchDispatcher>,
    lifecycle: Arc<LifecycleManager>,
    max_attempts: u32,

    running: Arc<AtomicBool>,
    shutdown_tx: broadcast::Sender<()>,
}

impl SweepScheduler {
    pub fn new(
        config: SchedulerConfig,
        orders: Arc<dyn OrderStore>,
        tasks: Arc<dyn TaskStore>,
        dispatcher: Arc<BatchDispatcher>,
        lifecycle: Arc<LifecycleManager>,
        max_attempts: u32,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            config,
            orders,
            tasks,
            dispatcher,
            lifecycle,
            max_attempts,
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx,
        }
    }

    /// Start both sweep loops.
    pub fn start(self: &Arc<Self>) {
        if !self.config.enabled {
            info!("Sweep scheduler disabled");
            return;
        }
        if self.running.swap(true, Ordering::SeqCst) {
            warn!("Sweep scheduler already running");
            return;
        }

        info!(
            "Starting sweep scheduler (advance every {}s, expiry every {}s)",
            self.config.advance_interval_secs, self.config.expiry_interval_secs
        );
        self.spawn_recovery();
        self.spawn_advance_loop();
        self.spawn_expiry_loop();
    }

    /// Stop both sweep loops.
    pub fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("Stopping sweep scheduler");
        let _ = self.shutdown_tx.send(());
    }

    pub fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.running.load(Ordering::Relaxed),
            active_subscriptions: self
                .orders
                .list_active_subscriptions()
                .map(|s| s.len())
                .unwrap_or(0),
        }
    }

    fn spawn_recovery(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = scheduler.run_recovery_once().await {
                warn!("Recovery sweep error: {}", e);
            }
        });
    }

    fn spawn_advance_loop(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(self.config.advance_interval_secs);

        tokio::spawn(async move {
            info!("Advance sweep loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Advance sweep loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !scheduler.running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = scheduler.run_advance_once(Utc::now()).await {
                            warn!("Advance sweep error: {}", e);
                        }
                    }
                }
            }
            info!("Advance sweep loop stopped");
        });
    }

    fn spawn_expiry_loop(self: &Arc<Self>) {
        let scheduler = Arc::clone(self);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let interval = Duration::from_secs(self.config.expiry_interval_secs);

        tokio::spawn(async move {
            info!("Expiry sweep loop started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        info!("Expiry sweep loop received shutdown signal");
                        break;
                    }
                    _ = tokio::time::sleep(interval) => {
                        if !scheduler.running.load(Ordering::Relaxed) {
                            break;
                        }
                        if let Err(e) = scheduler.run_expiry_once(Utc::now()).await {
                            warn!("Expiry sweep error: {}", e);
                        }
                    }
                }
            }
            info!("Expiry sweep loop stopped");
        });
    }

    /// Refresh every accepted or in-production order. Returns how many
    /// orders were refreshed.
    pub async fn run_recovery_once(&self) -> Result<usize, SweepError> {
        let result = self.recover().await;
        metrics::SWEEP_RUNS
            .with_label_values(&["recovery", if result.is_ok() { "ok" } else { "error" }])
            .inc();
        result
    }

    async fn recover(&self) -> Result<usize, SweepError> {
        // Collected up front, refreshing may move an order between statuses.
        let mut open = Vec::new();
        for status in [OrderStatus::Accepted, OrderStatus::InProduction] {
            let mut offset = 0;
            loop {
                let filter = OrderFilter::new()
                    .with_status(status)
                    .with_limit(RECOVERY_PAGE_SIZE)
                    .with_offset(offset);
                let page = self.orders.list_orders(&filter)?;
                let fetched = page.len() as i64;
                open.extend(page.into_iter().map(|order| order.id));
                if fetched < RECOVERY_PAGE_SIZE {
                    break;
                }
                offset += fetched;
            }
        }

        let mut refreshed = 0;
        for order_id in &open {
            match self.lifecycle.refresh_delivery_status(order_id).await {
                Ok(()) => refreshed += 1,
                Err(e) => warn!("Recovery of order {} failed: {}", order_id, e),
            }
        }
        if refreshed > 0 {
            info!("Recovery sweep: {} open orders refreshed", refreshed);
        }
        Ok(refreshed)
    }

    /// Dispatch every elapsed timeslot of every active subscription.
    pub async fn run_advance_once(&self, now: DateTime<Utc>) -> Result<AdvanceReport, SweepError> {
        let result = self.advance(now).await;
        metrics::SWEEP_RUNS
            .with_label_values(&["advance", if result.is_ok() { "ok" } else { "error" }])
            .inc();
        result
    }

    async fn advance(&self, now: DateTime<Utc>) -> Result<AdvanceReport, SweepError> {
        let mut report = AdvanceReport::default();

        for subscription in self.orders.list_active_subscriptions()? {
            let Some(order) = self.orders.get_order(&subscription.order_id)? else {
                continue;
            };
            if order.status == OrderStatus::Submitted {
                debug!(
                    "Subscription {} waits for moderation of order {}",
                    subscription.id, order.id
                );
                continue;
            }

            self.advance_subscription(&subscription, now, &mut report)?;

            if subscription.has_ended_at(now)
                && self
                    .lifecycle
                    .terminate_subscription(&subscription.id, "End date reached")
                    .await?
                    == TransitionOutcome::Applied
            {
                report.subscriptions_terminated += 1;
            }
        }

        if report != AdvanceReport::default() {
            info!(
                "Advance sweep: {} batches dispatched, {} already dispatched, {} subscriptions terminated",
                report.batches_dispatched,
                report.already_dispatched,
                report.subscriptions_terminated
            );
        }
        Ok(report)
    }

    fn advance_subscription(
        &self,
        subscription: &Subscription,
        now: DateTime<Utc>,
        report: &mut AdvanceReport,
    ) -> Result<(), SweepError> {
        let mut cursor = subscription.next_timeslot;

        for timeslot in subscription.due_timeslots(now) {
            match self.dispatcher.dispatch_timeslot(subscription, timeslot)? {
                TimeslotDispatch::Dispatched(_) => report.batches_dispatched += 1,
                TimeslotDispatch::AlreadyDispatched(_) => report.already_dispatched += 1,
            }

            let Some(next) = subscription.timeslot_end(timeslot) else {
                break;
            };
            if !self
                .orders
                .advance_subscription(&subscription.id, cursor, next)?
            {
                debug!(
                    "Subscription {} cursor moved by a concurrent sweep",
                    subscription.id
                );
                break;
            }
            cursor = next;
        }
        Ok(())
    }

    /// Queue deletion of expired files, warn about files expiring soon and
    /// end subscriptions past their end date.
    pub async fn run_expiry_once(&self, now: DateTime<Utc>) -> Result<ExpiryReport, SweepError> {
        let result = self.expire(now).await;
        metrics::SWEEP_RUNS
            .with_label_values(&["expiry", if result.is_ok() { "ok" } else { "error" }])
            .inc();
        result
    }

    async fn expire(&self, now: DateTime<Utc>) -> Result<ExpiryReport, SweepError> {
        let mut report = ExpiryReport::default();

        for file in self.orders.list_expired_files(now)? {
            self.tasks.enqueue(&NewTask::new(
                TaskKind::DeleteExpiredFile {
                    file_id: file.id.clone(),
                },
                self.max_attempts,
            ))?;
            report.expiry_tasks += 1;
        }

        let window = chrono::Duration::hours(self.config.expiry_warning_hours as i64);
        if window > chrono::Duration::zero() {
            for file in self.orders.list_files_expiring_before(now, now + window)? {
                if self.lifecycle.warn_file_expiring(&file)? {
                    report.warnings_sent += 1;
                }
            }
        }

        // Subscriptions with undispatched timeslots are left to the advance sweep.
        for subscription in self.orders.list_active_subscriptions()? {
            if subscription.has_ended_at(now)
                && subscription.due_timeslots(now).is_empty()
                && self
                    .lifecycle
                    .terminate_subscription(&subscription.id, "End date reached")
                    .await?
                    == TransitionOutcome::Applied
            {
                report.subscriptions_terminated += 1;
            }
        }

        if report != ExpiryReport::default() {
            info!(
                "Expiry sweep: {} files to delete, {} warnings, {} subscriptions terminated",
                report.expiry_tasks, report.warnings_sent, report.subscriptions_terminated
            );
        }
        Ok(report)
    }
}
