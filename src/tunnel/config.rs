//! Tunnel configuration
//!
//! Timeouts and worker sizing of the dispatch engine. Deserializes from the
//! `tunnel` section of the config file; every field has a default.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::io::{MAX_BUFFER_SIZE, RELAY_BUFFER_SIZE};

// =============================================================================
// Defaults
// =============================================================================

/// Upstream TCP dial timeout
pub const TCP_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// How long the second direction of a relay may run after the first ends
pub const TCP_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Idle timeout of a UDP NAT entry
pub const UDP_SESSION_TIMEOUT: Duration = Duration::from_secs(60);

/// Depth of each UDP shard queue
pub const UDP_QUEUE_SIZE: usize = 512;

/// Lower bound on UDP shard workers
pub const MIN_UDP_WORKERS: usize = 4;

/// Upper bound accepted from configuration
pub const MAX_UDP_WORKERS: usize = 256;

/// Default UDP shard count: one per core, never fewer than four
#[inline]
#[must_use]
pub fn default_udp_workers() -> usize {
    num_cpus::get().max(MIN_UDP_WORKERS)
}

fn default_udp_queue_size() -> usize {
    UDP_QUEUE_SIZE
}

fn default_udp_timeout_secs() -> u64 {
    UDP_SESSION_TIMEOUT.as_secs()
}

fn default_tcp_connect_timeout_secs() -> u64 {
    TCP_CONNECT_TIMEOUT.as_secs()
}

fn default_tcp_wait_timeout_secs() -> u64 {
    TCP_WAIT_TIMEOUT.as_secs()
}

fn default_relay_buffer_size() -> usize {
    RELAY_BUFFER_SIZE
}

/// Dispatch engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Number of UDP shards (default: `max(num_cpus, 4)`)
    #[serde(default)]
    pub udp_workers: Option<usize>,

    /// Depth of each UDP shard queue
    #[serde(default = "default_udp_queue_size")]
    pub udp_queue_size: usize,

    /// UDP NAT idle timeout in seconds
    #[serde(default = "default_udp_timeout_secs")]
    pub udp_timeout_secs: u64,

    /// Upstream TCP dial timeout in seconds
    #[serde(default = "default_tcp_connect_timeout_secs")]
    pub tcp_connect_timeout_secs: u64,

    /// Half-close wait in seconds
    #[serde(default = "default_tcp_wait_timeout_secs")]
    pub tcp_wait_timeout_secs: u64,

    /// Per-direction relay buffer in bytes
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            udp_workers: None,
            udp_queue_size: default_udp_queue_size(),
            udp_timeout_secs: default_udp_timeout_secs(),
            tcp_connect_timeout_secs: default_tcp_connect_timeout_secs(),
            tcp_wait_timeout_secs: default_tcp_wait_timeout_secs(),
            relay_buffer_size: default_relay_buffer_size(),
        }
    }
}

impl TunnelConfig {
    /// Effective UDP shard count
    #[must_use]
    pub fn workers(&self) -> usize {
        self.udp_workers.unwrap_or_else(default_udp_workers)
    }

    #[must_use]
    pub const fn udp_timeout(&self) -> Duration {
        Duration::from_secs(self.udp_timeout_secs)
    }

    #[must_use]
    pub const fn tcp_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_connect_timeout_secs)
    }

    #[must_use]
    pub const fn tcp_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.tcp_wait_timeout_secs)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` describing the first bad field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(workers) = self.udp_workers {
            if workers == 0 || workers > MAX_UDP_WORKERS {
                return Err(ConfigError::ValidationError(format!(
                    "tunnel.udp_workers must be between 1 and {MAX_UDP_WORKERS}, got {workers}"
                )));
            }
        }
        if self.udp_queue_size == 0 {
            return Err(ConfigError::ValidationError(
                "tunnel.udp_queue_size must be greater than 0".into(),
            ));
        }
        if self.udp_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tunnel.udp_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.tcp_connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "tunnel.tcp_connect_timeout_secs must be greater than 0".into(),
            ));
        }
        if self.relay_buffer_size == 0 || self.relay_buffer_size > MAX_BUFFER_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "tunnel.relay_buffer_size must be between 1 and {MAX_BUFFER_SIZE}"
            )));
        }
        Ok(())
    }
}
