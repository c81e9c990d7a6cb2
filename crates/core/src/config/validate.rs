use super::{types::Config, ConfigError};

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - At least one worker, non-zero task timeout and attempt budget
/// - Non-zero sweep intervals and subscription timeslot
/// - A positive order item limit
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    if config.worker.workers == 0 {
        return Err(ConfigError::ValidationError(
            "worker.workers must be at least 1".to_string(),
        ));
    }

    if config.worker.task_timeout_secs == 0 {
        return Err(ConfigError::ValidationError(
            "worker.task_timeout_secs cannot be 0".to_string(),
        ));
    }

    if config.worker.retry.max_attempts == 0 {
        return Err(ConfigError::ValidationError(
            "worker.retry.max_attempts must be at least 1".to_string(),
        ));
    }

    if config.worker.retry.backoff_multiplier < 1.0 {
        return Err(ConfigError::ValidationError(
            "worker.retry.backoff_multiplier must be >= 1.0".to_string(),
        ));
    }

    if config.scheduler.advance_interval_secs == 0 || config.scheduler.expiry_interval_secs == 0 {
        return Err(ConfigError::ValidationError(
            "scheduler intervals cannot be 0".to_string(),
        ));
    }

    if config.orders.default_timeslot_secs == 0 {
        return Err(ConfigError::ValidationError(
            "orders.default_timeslot_secs cannot be 0".to_string(),
        ));
    }

    if config.orders.max_order_items == 0 {
        return Err(ConfigError::ValidationError(
            "orders.max_order_items must be at least 1".to_string(),
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(validate_config(&Config::default()).is_ok());
    }

    #[test]
    fn test_validate_port_zero_fails() {
        let mut config = Config::default();
        config.server.port = 0;
        let result = validate_config(&config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_validate_zero_workers_fails() {
        let mut config = Config::default();
        config.worker.workers = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_attempts_fails() {
        let mut config = Config::default();
        config.worker.retry.max_attempts = 0;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_shrinking_backoff_fails() {
        let mut config = Config::default();
        config.worker.retry.backoff_multiplier = 0.5;
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_validate_zero_timeslot_fails() {
        let mut config = Config::default();
        config.orders.default_timeslot_secs = 0;
        assert!(validate_config(&config).is_err());
    }
}
