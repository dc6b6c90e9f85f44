//! Configuration loading and management
//!
//! This module handles loading configuration from files and environment variables.

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load configuration from a JSON file
///
/// # Arguments
///
/// * `path` - Path to the configuration file
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be read or parsed.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("Loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;

    let config: Config = serde_json::from_str(&contents).map_err(|e| {
        ConfigError::ParseError(format!("Failed to parse JSON: {e} at {path:?}"))
    })?;

    config.validate()?;

    info!(
        hashsize = config.table.effective_hashsize(),
        max_connections = config.table.max_connections,
        tcp_loose = config.tcp.loose,
        tcp_be_liberal = config.tcp.be_liberal,
        "Configuration loaded"
    );

    Ok(config)
}

/// Load configuration from a JSON string
///
/// # Errors
///
/// Returns `ConfigError` if parsing or validation fails.
pub fn load_config_str(json: &str) -> Result<Config, ConfigError> {
    let config: Config =
        serde_json::from_str(json).map_err(|e| ConfigError::ParseError(e.to_string()))?;

    config.validate()?;

    Ok(config)
}

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::EnvError {
        name: name.into(),
        reason: format!("Invalid value: {value}"),
    })
}

fn parse_env_bool(name: &str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::EnvError {
            name: name.into(),
            reason: format!("Invalid boolean: {value}"),
        }),
    }
}

/// Apply environment variable overrides to a loaded configuration
///
/// Environment variables:
/// - `CONNTRACK_LOG_LEVEL`: Override log level
/// - `CONNTRACK_MAX`: Override max connections
/// - `CONNTRACK_HASHSIZE`: Override bucket count
/// - `CONNTRACK_TCP_LOOSE`: Override mid-stream pickup
/// - `CONNTRACK_TCP_BE_LIBERAL`: Override liberal window checking
/// - `CONNTRACK_CHECKSUM`: Override checksum validation
///
/// # Errors
///
/// Returns `ConfigError::EnvError` for unparsable values and
/// `ConfigError::ValidationError` if the result is invalid.
pub fn apply_env_overrides(config: &mut Config) -> Result<(), ConfigError> {
    if let Ok(level) = std::env::var("CONNTRACK_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Ok(max) = std::env::var("CONNTRACK_MAX") {
        config.table.max_connections = parse_env("CONNTRACK_MAX", &max)?;
        debug!("Max connections overridden to {}", config.table.max_connections);
    }

    if let Ok(size) = std::env::var("CONNTRACK_HASHSIZE") {
        config.table.hashsize = parse_env("CONNTRACK_HASHSIZE", &size)?;
        debug!("Hashsize overridden to {}", config.table.hashsize);
    }

    if let Ok(loose) = std::env::var("CONNTRACK_TCP_LOOSE") {
        config.tcp.loose = parse_env_bool("CONNTRACK_TCP_LOOSE", &loose)?;
        debug!("tcp_loose overridden to {}", config.tcp.loose);
    }

    if let Ok(liberal) = std::env::var("CONNTRACK_TCP_BE_LIBERAL") {
        config.tcp.be_liberal = parse_env_bool("CONNTRACK_TCP_BE_LIBERAL", &liberal)?;
        debug!("tcp_be_liberal overridden to {}", config.tcp.be_liberal);
    }

    if let Ok(checksum) = std::env::var("CONNTRACK_CHECKSUM") {
        config.table.checksum = parse_env_bool("CONNTRACK_CHECKSUM", &checksum)?;
        debug!("checksum overridden to {}", config.table.checksum);
    }

    // Re-validate after overrides
    config.validate()
}

/// Load configuration with environment variable overrides
///
/// See [`apply_env_overrides`] for the recognised variables.
///
/// # Errors
///
/// Returns `ConfigError` if loading or parsing fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env_overrides(&mut config)?;
    Ok(config)
}

/// Create a default configuration file at the given path
///
/// # Errors
///
/// Returns `ConfigError` if the file cannot be written.
pub fn create_default_config(path: impl AsRef<Path>) -> Result<(), ConfigError> {
    let config = Config::default_config();
    let json = serde_json::to_string_pretty(&config)
        .map_err(|e| ConfigError::ParseError(format!("Failed to serialize config: {e}")))?;

    std::fs::write(path, json)?;
    Ok(())
}
