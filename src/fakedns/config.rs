//! FakeDNS configuration types
//!
//! This module provides configuration for the fake-IP resolver and its DNS
//! server. It deserializes from the `fakedns` section of the config file and
//! offers a builder for programmatic use.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use ipnet::{Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Default IPv4 fake-IP range (RFC 2544 benchmarking block)
pub const DEFAULT_IPV4_POOL: &str = "198.18.0.0/15";

/// Default bound on cached host mappings per pool
pub const DEFAULT_MAX_ENTRIES: usize = 1000;

/// Per-upstream exchange timeout
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(1);

fn default_enabled() -> bool {
    true
}

fn default_ipv4_pool() -> Ipv4Net {
    Ipv4Net::new(std::net::Ipv4Addr::new(198, 18, 0, 0), 15).unwrap_or_default()
}

fn default_max_entries() -> usize {
    DEFAULT_MAX_ENTRIES
}

fn default_upstream_timeout_ms() -> u64 {
    1000
}

/// Configuration for the fake-IP resolver
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FakeDnsConfig {
    /// Whether fake-IP resolution is enabled
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// UDP address of the DNS server; no server runs when unset
    #[serde(default)]
    pub listen: Option<SocketAddr>,

    /// Answer UDP queries to port 53 inside the tunnel
    #[serde(default)]
    pub hijack: bool,

    /// IPv4 address pool for fake IPs
    ///
    /// Default: 198.18.0.0/15
    #[serde(default = "default_ipv4_pool")]
    pub ipv4_pool: Ipv4Net,

    /// Optional IPv6 address pool; `AAAA` queries go upstream without it
    #[serde(default)]
    pub ipv6_pool: Option<Ipv6Net>,

    /// Maximum cached host mappings per pool before LRU eviction
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Static host entries: `example.com` or `*.example.com` to an address
    #[serde(default)]
    pub hosts: HashMap<String, IpAddr>,

    /// Upstream DNS servers queried over TCP for non-fake answers
    #[serde(default)]
    pub upstreams: Vec<SocketAddr>,

    /// Timeout for each upstream exchange in milliseconds
    #[serde(default = "default_upstream_timeout_ms")]
    pub upstream_timeout_ms: u64,
}

impl Default for FakeDnsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            listen: None,
            hijack: false,
            ipv4_pool: default_ipv4_pool(),
            ipv6_pool: None,
            max_entries: DEFAULT_MAX_ENTRIES,
            hosts: HashMap::new(),
            upstreams: Vec::new(),
            upstream_timeout_ms: default_upstream_timeout_ms(),
        }
    }
}

impl FakeDnsConfig {
    /// Create a new `FakeDnsConfig` with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the IPv4 address pool
    #[must_use]
    pub fn with_ipv4_pool(mut self, pool: Ipv4Net) -> Self {
        self.ipv4_pool = pool;
        self
    }

    /// Set the IPv6 address pool (enables fake `AAAA` answers)
    #[must_use]
    pub fn with_ipv6_pool(mut self, pool: Ipv6Net) -> Self {
        self.ipv6_pool = Some(pool);
        self
    }

    /// Set the maximum number of cached mappings
    #[must_use]
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max;
        self
    }

    /// Add a static host entry
    #[must_use]
    pub fn with_host(mut self, domain: impl Into<String>, ip: IpAddr) -> Self {
        self.hosts.insert(domain.into(), ip);
        self
    }

    /// Add an upstream DNS server
    #[must_use]
    pub fn with_upstream(mut self, addr: SocketAddr) -> Self {
        self.upstreams.push(addr);
        self
    }

    /// Set the UDP listen address of the DNS server
    #[must_use]
    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Answer port-53 UDP traffic inside the tunnel
    #[must_use]
    pub fn with_hijack(mut self, hijack: bool) -> Self {
        self.hijack = hijack;
        self
    }

    /// Enable or disable fake-IP resolution
    #[must_use]
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Check if IPv6 is enabled
    #[must_use]
    pub fn ipv6_enabled(&self) -> bool {
        self.ipv6_pool.is_some()
    }

    /// Per-upstream exchange timeout
    #[must_use]
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_millis(self.upstream_timeout_ms)
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an unusable pool or limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "fakedns.max_entries must be greater than 0".into(),
            ));
        }
        if self.ipv4_pool.prefix_len() > 29 {
            return Err(ConfigError::ValidationError(format!(
                "fakedns.ipv4_pool {} is too small (max prefix /29)",
                self.ipv4_pool
            )));
        }
        if let Some(pool) = self.ipv6_pool {
            if pool.prefix_len() > 125 {
                return Err(ConfigError::ValidationError(format!(
                    "fakedns.ipv6_pool {pool} is too small (max prefix /125)"
                )));
            }
        }
        if self.upstream_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "fakedns.upstream_timeout_ms must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}
