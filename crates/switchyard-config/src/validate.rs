//! Post-merge configuration validation.

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Recognized log levels.
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Recognized log formats.
const LOG_FORMATS: &[&str] = &["pretty", "compact", "json", "full"];

/// Validate a fully merged configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_plugins(config)?;
    validate_sandbox(config)?;
    validate_logging(config)?;
    Ok(())
}

fn invalid(field: &str, message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError {
        field: field.to_owned(),
        message: message.into(),
    }
}

fn validate_plugins(config: &Config) -> ConfigResult<()> {
    for id in &config.plugins.trusted {
        let well_formed = !id.is_empty()
            && id
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
        if !well_formed {
            return Err(invalid(
                "plugins.trusted",
                format!("'{id}' is not a valid plugin id"),
            ));
        }
    }
    Ok(())
}

fn validate_sandbox(config: &Config) -> ConfigResult<()> {
    let s = &config.sandbox;

    if s.timeout_ms == 0 {
        return Err(invalid("sandbox.timeout_ms", "must be greater than zero"));
    }
    if s.load_timeout_ms == 0 {
        return Err(invalid("sandbox.load_timeout_ms", "must be greater than zero"));
    }
    if s.memory_limit_mb == 0 || s.memory_limit_mb > 4096 {
        return Err(invalid(
            "sandbox.memory_limit_mb",
            "must be between 1 and 4096",
        ));
    }
    if s.max_timers == 0 {
        return Err(invalid("sandbox.max_timers", "must be greater than zero"));
    }
    if s.min_interval_ms == 0 || s.min_interval_ms > s.max_interval_ms {
        return Err(invalid(
            "sandbox.min_interval_ms",
            format!(
                "must be non-zero and no greater than sandbox.max_interval_ms ({})",
                s.max_interval_ms
            ),
        ));
    }
    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    let level = config.logging.level.to_ascii_lowercase();
    if !LOG_LEVELS.contains(&level.as_str()) {
        return Err(invalid(
            "logging.level",
            format!(
                "unsupported level '{}'; expected one of: {}",
                config.logging.level,
                LOG_LEVELS.join(", ")
            ),
        ));
    }
    let format = config.logging.format.to_ascii_lowercase();
    if !LOG_FORMATS.contains(&format.as_str()) {
        return Err(invalid(
            "logging.format",
            format!(
                "unsupported format '{}'; expected one of: {}",
                config.logging.format,
                LOG_FORMATS.join(", ")
            ),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(validate(&Config::default()).is_ok());
    }

    #[test]
    fn test_rejects_zero_timeout() {
        let mut config = Config::default();
        config.sandbox.timeout_ms = 0;
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("sandbox.timeout_ms"));
    }

    #[test]
    fn test_rejects_inverted_interval_bounds() {
        let mut config = Config::default();
        config.sandbox.min_interval_ms = 10_000;
        config.sandbox.max_interval_ms = 10;
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_rejects_bad_trusted_id() {
        let mut config = Config::default();
        config.plugins.trusted = vec!["Not_Valid".to_owned()];
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("plugins.trusted"));
    }

    #[test]
    fn test_rejects_unknown_log_format() {
        let mut config = Config::default();
        config.logging.format = "xml".to_owned();
        assert!(validate(&config).is_err());
    }

    #[test]
    fn test_log_level_case_insensitive() {
        let mut config = Config::default();
        config.logging.level = "DEBUG".to_owned();
        assert!(validate(&config).is_ok());
    }
}
