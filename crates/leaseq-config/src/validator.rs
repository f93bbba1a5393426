//! Configuration validation.

use crate::error::ConfigError;
use crate::schema::Config;

/// Validation result.
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<ValidationWarning>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, error: ValidationError) {
        self.errors.push(error);
    }

    pub fn add_warning(&mut self, warning: ValidationWarning) {
        self.warnings.push(warning);
    }
}

/// A validation error.
#[derive(Debug)]
pub struct ValidationError {
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// A validation warning.
#[derive(Debug)]
pub struct ValidationWarning {
    pub path: String,
    pub message: String,
}

impl ValidationWarning {
    pub fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Configuration validator.
pub struct ConfigValidator;

impl ConfigValidator {
    /// Validate the configuration.
    pub fn validate(config: &Config) -> Result<ValidationResult, ConfigError> {
        let mut result = ValidationResult::default();

        Self::validate_store(config, &mut result);
        Self::validate_worker(config, &mut result);
        Self::validate_lease_timing(config, &mut result);
        Self::validate_logging(config, &mut result);

        Ok(result)
    }

    fn validate_store(config: &Config, result: &mut ValidationResult) {
        let store = &config.store;

        if store.lease_window_ms == 0 {
            result.add_error(ValidationError::new(
                "store.lease_window_ms",
                "lease_window_ms must be greater than 0",
            ));
        }

        if store.max_connections == 0 {
            result.add_error(ValidationError::new(
                "store.max_connections",
                "max_connections must be at least 1",
            ));
        }

        if store.is_in_memory() && store.max_connections > 1 {
            result.add_warning(ValidationWarning::new(
                "store.max_connections",
                "in-memory store always uses a single connection",
            ));
        }
    }

    fn validate_worker(config: &Config, result: &mut ValidationResult) {
        let worker = &config.worker;

        if worker.poll_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "worker.poll_interval_ms",
                "poll_interval_ms must be greater than 0",
            ));
        }

        if worker.heartbeat_interval_ms == 0 {
            result.add_error(ValidationError::new(
                "worker.heartbeat_interval_ms",
                "heartbeat_interval_ms must be greater than 0",
            ));
        }
    }

    // A lease that is not refreshed within the window is handed to another worker.
    fn validate_lease_timing(config: &Config, result: &mut ValidationResult) {
        let heartbeat = config.worker.heartbeat_interval_ms;
        let window = config.store.lease_window_ms;
        if heartbeat == 0 || window == 0 {
            return;
        }

        if heartbeat >= window {
            result.add_error(ValidationError::new(
                "worker.heartbeat_interval_ms",
                format!(
                    "heartbeat interval ({}ms) must be shorter than the lease window ({}ms)",
                    heartbeat, window
                ),
            ));
        } else if heartbeat > window / 2 {
            result.add_warning(ValidationWarning::new(
                "worker.heartbeat_interval_ms",
                format!(
                    "heartbeat interval ({}ms) is more than half the lease window ({}ms); a single slow heartbeat may lose the lease",
                    heartbeat, window
                ),
            ));
        }
    }

    fn validate_logging(config: &Config, result: &mut ValidationResult) {
        if let Err(e) = config.logging.format() {
            result.add_error(ValidationError::new("logging.format", e.to_string()));
        }

        if config.logging.level.trim().is_empty() {
            result.add_error(ValidationError::new(
                "logging.level",
                "level cannot be empty",
            ));
        }
    }
}

#[cfg(test)]
#[path = "validator_tests.rs"]
mod tests;
