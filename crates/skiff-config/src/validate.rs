//! Post-merge configuration validation.

use skiff_bootstrap::PlatformVersion;

use crate::error::{ConfigError, ConfigResult};
use crate::types::Config;

/// Log levels accepted in `logging.level`.
pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

/// Formats accepted in `logging.format`.
pub const LOG_FORMATS: &[&str] = &["pretty", "compact", "json", "full"];

/// Validate a fully merged and deserialized configuration.
///
/// # Errors
///
/// Returns the first validation error found.
pub fn validate(config: &Config) -> ConfigResult<()> {
    validate_bootstrap(config)?;
    validate_logging(config)?;
    config.preference_store()?;
    Ok(())
}

fn validate_bootstrap(config: &Config) -> ConfigResult<()> {
    let b = &config.bootstrap;

    if let Err(e) = b.platform_version.parse::<PlatformVersion>() {
        return Err(ConfigError::ValidationError {
            field: "bootstrap.platform_version".to_owned(),
            message: e.to_string(),
        });
    }

    if let Some(root) = &b.platform_root
        && !root.is_absolute()
    {
        return Err(ConfigError::ValidationError {
            field: "bootstrap.platform_root".to_owned(),
            message: format!("'{}' must be an absolute path", root.display()),
        });
    }

    Ok(())
}

fn validate_logging(config: &Config) -> ConfigResult<()> {
    if !LOG_LEVELS.contains(&config.logging.level.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.level".to_owned(),
            message: format!(
                "unsupported log level '{}'; expected one of: {}",
                config.logging.level,
                LOG_LEVELS.join(", ")
            ),
        });
    }

    if !LOG_FORMATS.contains(&config.logging.format.as_str()) {
        return Err(ConfigError::ValidationError {
            field: "logging.format".to_owned(),
            message: format!(
                "unsupported log format '{}'; expected one of: {}",
                config.logging.format,
                LOG_FORMATS.join(", ")
            ),
        });
    }

    Ok(())
}
