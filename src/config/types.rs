//! Configuration types for tun-dispatch
//!
//! The config file is one JSON object with a section per subsystem. Every
//! section and every field has a default, so `{}` is a valid configuration.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::fakedns::FakeDnsConfig;
use crate::tunnel::TunnelConfig;

/// Root configuration structure
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,

    /// Dispatch engine timeouts and sizing
    #[serde(default)]
    pub tunnel: TunnelConfig,

    /// Upstream dialer selection
    #[serde(default)]
    pub dialer: DialerConfig,

    /// Fake-IP resolver and DNS server
    #[serde(default)]
    pub fakedns: FakeDnsConfig,

    /// Traffic statistics
    #[serde(default)]
    pub stats: StatsConfig,

    /// TUN device feeding the user-space stack; needs the `ipstack` feature
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceConfig>,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.log.validate()?;
        self.tunnel.validate()?;
        self.fakedns.validate()?;
        self.stats.validate()?;
        if let Some(device) = &self.device {
            device.validate()?;
        }

        if !self.fakedns.enabled && (self.fakedns.hijack || self.fakedns.listen.is_some()) {
            return Err(ConfigError::ValidationError(
                "fakedns.hijack and fakedns.listen require fakedns.enabled".into(),
            ));
        }

        Ok(())
    }

    /// Create the configuration written by `--generate-config`
    ///
    /// Unlike [`Config::default`] it carries a `device` section, so the
    /// generated file runs a dispatching daemon as-is.
    #[must_use]
    pub fn default_config() -> Self {
        Self {
            device: Some(DeviceConfig::default()),
            ..Self::default()
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "json" or "text"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include target (module path)
    #[serde(default = "default_true")]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: true,
        }
    }
}

impl LogConfig {
    /// Validate the logging configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unknown level or format.
    pub fn validate(&self) -> Result<(), ConfigError> {
        const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];
        if !LEVELS.contains(&self.level.to_ascii_lowercase().as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log level '{}', expected one of {LEVELS:?}",
                self.level
            )));
        }
        if self.format != "json" && self.format != "text" {
            return Err(ConfigError::ValidationError(format!(
                "Invalid log format '{}', expected \"json\" or \"text\"",
                self.format
            )));
        }
        Ok(())
    }

    /// Whether to log JSON lines
    #[must_use]
    pub fn is_json(&self) -> bool {
        self.format == "json"
    }
}

/// Built-in dialer types
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DialerKind {
    /// Connect to destinations directly
    #[default]
    Direct,
    /// Refuse every flow
    Reject,
}

impl std::fmt::Display for DialerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Direct => write!(f, "direct"),
            Self::Reject => write!(f, "reject"),
        }
    }
}

/// Upstream dialer configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct DialerConfig {
    /// Dialer type
    #[serde(rename = "type", default)]
    pub kind: DialerKind,
}

/// Traffic statistics configuration
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StatsConfig {
    /// Rate sampling period in milliseconds
    #[serde(default = "default_sample_interval_ms")]
    pub sample_interval_ms: u64,

    /// Period of the traffic summary log line in seconds (0 disables it)
    #[serde(default = "default_log_interval_secs")]
    pub log_interval_secs: u64,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval_ms(),
            log_interval_secs: default_log_interval_secs(),
        }
    }
}

impl StatsConfig {
    /// Validate the statistics configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for a zero sampling period.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sample_interval_ms == 0 {
            return Err(ConfigError::ValidationError(
                "stats.sample_interval_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub const fn sample_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.sample_interval_ms)
    }

    /// Summary log period, `None` when disabled
    #[must_use]
    pub const fn log_interval(&self) -> Option<std::time::Duration> {
        if self.log_interval_secs == 0 {
            None
        } else {
            Some(std::time::Duration::from_secs(self.log_interval_secs))
        }
    }
}

/// TUN device settings
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Interface name
    #[serde(default = "default_device_name")]
    pub name: String,

    /// Address of the interface itself
    #[serde(default = "default_device_address")]
    pub address: Ipv4Addr,

    /// Netmask of the interface network
    #[serde(default = "default_device_netmask")]
    pub netmask: Ipv4Addr,

    /// Link MTU
    #[serde(default = "default_device_mtu")]
    pub mtu: u16,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            address: default_device_address(),
            netmask: default_device_netmask(),
            mtu: default_device_mtu(),
        }
    }
}

impl DeviceConfig {
    /// Smallest MTU every IPv4 host must accept
    pub const MIN_MTU: u16 = 576;

    /// Validate the device configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an empty name, a
    /// non-contiguous netmask or an MTU below 576.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::ValidationError(
                "device.name must not be empty".into(),
            ));
        }
        let mask = u32::from(self.netmask);
        if mask.leading_ones() + mask.trailing_zeros() != 32 {
            return Err(ConfigError::ValidationError(format!(
                "device.netmask {} is not contiguous",
                self.netmask
            )));
        }
        if self.mtu < Self::MIN_MTU {
            return Err(ConfigError::ValidationError(format!(
                "device.mtu {} is below {}",
                self.mtu,
                Self::MIN_MTU
            )));
        }
        Ok(())
    }
}

// Default value functions

fn default_device_name() -> String {
    "tun0".into()
}

const fn default_device_address() -> Ipv4Addr {
    Ipv4Addr::new(198, 18, 0, 1)
}

const fn default_device_netmask() -> Ipv4Addr {
    Ipv4Addr::new(255, 254, 0, 0)
}

const fn default_device_mtu() -> u16 {
    1500
}

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

const fn default_sample_interval_ms() -> u64 {
    1000
}

const fn default_log_interval_secs() -> u64 {
    60
}
