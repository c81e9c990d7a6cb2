use std::sync::Arc;

use oseo_core::{Config, SanitizedConfig, SweepScheduler, WorkerPool};

/// Shared application state
pub struct AppState {
    config: Config,
    pool: Arc<WorkerPool>,
    scheduler: Arc<SweepScheduler>,
}

impl AppState {
    pub fn new(config: Config, pool: Arc<WorkerPool>, scheduler: Arc<SweepScheduler>) -> Self {
        Self {
            config,
            pool,
            scheduler,
        }
    }

    pub fn sanitized_config(&self) -> SanitizedConfig {
        SanitizedConfig::from(&self.config)
    }

    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    pub fn scheduler(&self) -> &SweepScheduler {
        &self.scheduler
    }
}
