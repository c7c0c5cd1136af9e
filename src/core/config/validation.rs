#![allow(clippy::result_large_err)]

use super::StatewrightConfig;
use crate::core::error::AppError;
use crate::core::types::ErrorCategory;
use std::time::Duration;

pub struct ConfigValidator;

impl ConfigValidator {
    pub fn validate(config: &StatewrightConfig) -> Result<(), AppError> {
        if config.coordination.pool_id.trim().is_empty() {
            return Err(invalid("coordination.pool_id cannot be empty"));
        }

        if config.checkpoint.path.as_os_str().is_empty() {
            return Err(invalid("checkpoint.path cannot be empty"));
        }

        for (name, value) in [
            ("worker.poll_interval", config.worker.poll_interval),
            ("worker.heartbeat_interval", config.worker.heartbeat_interval),
            ("reaper.interval", config.reaper.interval),
            ("checker.interval", config.checker.interval),
        ] {
            if value == Duration::ZERO {
                return Err(invalid(&format!("{} must be greater than zero", name)));
            }
        }

        // A worker that heartbeats on time must never look stale.
        if config.reaper.stale_after <= config.worker.heartbeat_interval {
            return Err(invalid(
                "reaper.stale_after must be longer than worker.heartbeat_interval",
            ));
        }

        if config.checker.max_workers == 0 {
            return Err(invalid("checker.max_workers must be at least 1"));
        }

        if config.checker.items_per_worker == 0 {
            return Err(invalid("checker.items_per_worker must be at least 1"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> AppError {
    AppError::new(ErrorCategory::ValidationError, message).with_code("CFG-003")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_default_config() {
        assert!(ConfigValidator::validate(&StatewrightConfig::default()).is_ok());
    }

    #[test]
    fn test_validate_zero_interval() {
        let mut config = StatewrightConfig::default();
        config.worker.poll_interval = Duration::ZERO;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("worker.poll_interval"));
    }

    #[test]
    fn test_validate_stale_after_not_longer_than_heartbeat() {
        let mut config = StatewrightConfig::default();
        config.worker.heartbeat_interval = Duration::from_secs(30);
        config.reaper.stale_after = Duration::from_secs(30);
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(err.to_string().contains("stale_after"));
    }

    #[test]
    fn test_validate_checker_bounds() {
        let mut config = StatewrightConfig::default();
        config.checker.items_per_worker = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        let mut config = StatewrightConfig::default();
        config.checker.max_workers = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_validate_empty_pool_id() {
        let mut config = StatewrightConfig::default();
        config.coordination.pool_id = "  ".to_string();
        assert!(ConfigValidator::validate(&config).is_err());
    }
}
