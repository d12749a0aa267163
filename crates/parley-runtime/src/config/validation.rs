//! Configuration validation utilities.

use std::time::Duration;

use super::error::{ConfigError, ConfigResult};
use super::schema::{LogOutput, LoggingConfig, ParleyConfig, RuntimeConfig};
use parley_framework::{EventBusConfig, RateLimitPolicy};

/// Longest accepted rate limit window.
const MAX_RATE_LIMIT_WINDOW: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Validates the entire configuration.
pub fn validate_config(config: &ParleyConfig) -> ConfigResult<()> {
    validate_logging_config(&config.logging)?;
    validate_bus_config(&config.bus)?;
    validate_runtime_config(&config.runtime)?;
    if let Some(policy) = &config.security.rate_limit {
        validate_rate_limit(policy)?;
    }
    Ok(())
}

fn validate_logging_config(logging: &LoggingConfig) -> ConfigResult<()> {
    if logging.output == LogOutput::File && logging.file_path.is_none() {
        return Err(ConfigError::missing_field("logging.file_path"));
    }
    Ok(())
}

fn validate_bus_config(bus: &EventBusConfig) -> ConfigResult<()> {
    if bus.workers == 0 {
        return Err(ConfigError::validation(
            "Event bus needs at least one worker",
        ));
    }
    if bus.queue_capacity == 0 {
        return Err(ConfigError::validation(
            "Event bus queue capacity must be greater than 0",
        ));
    }
    Ok(())
}

fn validate_runtime_config(runtime: &RuntimeConfig) -> ConfigResult<()> {
    if runtime.start_timeout_ms == 0 {
        return Err(ConfigError::validation(
            "Start timeout must be greater than 0",
        ));
    }
    if runtime.shutdown_timeout_ms == 0 {
        return Err(ConfigError::validation(
            "Shutdown timeout must be greater than 0",
        ));
    }
    if runtime.handler_timeout_ms == Some(0) {
        return Err(ConfigError::validation(
            "Handler timeout must be greater than 0; omit it to disable the budget",
        ));
    }
    Ok(())
}

fn validate_rate_limit(policy: &RateLimitPolicy) -> ConfigResult<()> {
    if policy.max_requests == 0 {
        return Err(ConfigError::validation(
            "Rate limit must allow at least one request",
        ));
    }
    if policy.window.is_zero() {
        return Err(ConfigError::validation(
            "Rate limit window must be at least one second",
        ));
    }
    if policy.window > MAX_RATE_LIMIT_WINDOW {
        return Err(ConfigError::validation(format!(
            "Rate limit window must be at most {} seconds",
            MAX_RATE_LIMIT_WINDOW.as_secs()
        )));
    }
    Ok(())
}
