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
        "Configuration loaded: dialer={}, udp_workers={}, fakedns={}",
        config.dialer.kind,
        config.tunnel.workers(),
        config.fakedns.enabled
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

/// Load configuration with environment variable overrides
///
/// Environment variables:
/// - `TUN_DISPATCH_LOG_LEVEL`: Override log level
/// - `TUN_DISPATCH_UDP_TIMEOUT`: Override UDP idle timeout (seconds)
/// - `TUN_DISPATCH_UDP_WORKERS`: Override UDP shard count
/// - `TUN_DISPATCH_DNS_LISTEN`: Override fake DNS listen address
///
/// # Errors
///
/// Returns `ConfigError` if loading, parsing or an override fails.
pub fn load_config_with_env(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let mut config = load_config(path)?;
    apply_env(&mut config, |name| std::env::var(name).ok())?;
    Ok(config)
}

/// Apply overrides read through `var`, then re-validate
fn apply_env(
    config: &mut Config,
    var: impl Fn(&str) -> Option<String>,
) -> Result<(), ConfigError> {
    if let Some(level) = var("TUN_DISPATCH_LOG_LEVEL") {
        config.log.level = level;
        debug!("Log level overridden to {}", config.log.level);
    }

    if let Some(secs) = var("TUN_DISPATCH_UDP_TIMEOUT") {
        config.tunnel.udp_timeout_secs = secs.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_DISPATCH_UDP_TIMEOUT".into(),
            reason: format!("Invalid number of seconds: {secs}"),
        })?;
        debug!("UDP timeout overridden to {}s", config.tunnel.udp_timeout_secs);
    }

    if let Some(workers) = var("TUN_DISPATCH_UDP_WORKERS") {
        let workers = workers.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_DISPATCH_UDP_WORKERS".into(),
            reason: format!("Invalid number: {workers}"),
        })?;
        config.tunnel.udp_workers = Some(workers);
        debug!("UDP workers overridden to {}", workers);
    }

    if let Some(addr) = var("TUN_DISPATCH_DNS_LISTEN") {
        let addr = addr.parse().map_err(|_| ConfigError::EnvError {
            name: "TUN_DISPATCH_DNS_LISTEN".into(),
            reason: format!("Invalid socket address: {addr}"),
        })?;
        config.fakedns.listen = Some(addr);
        debug!("Fake DNS listen address overridden to {}", addr);
    }

    // Re-validate after overrides
    config.validate()
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
