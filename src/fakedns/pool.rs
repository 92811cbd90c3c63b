//! FakeIP pool management
//!
//! Bidirectional host ⇄ fake-IP mapping over one CIDR range. The forward
//! map is a bounded `moka` cache with LRU eviction; the reverse map follows
//! it through the eviction listener. Addresses are handed out by a cursor
//! that cycles through the range and skips addresses that are still mapped.
//! Both `lookup` and `look_back` count as use, so a destination an open flow
//! keeps resolving stays mapped.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use dashmap::DashMap;
use ipnet::IpNet;
use moka::notification::RemovalCause;
use moka::policy::EvictionPolicy;
use moka::sync::Cache;
use parking_lot::Mutex;
use tracing::trace;

use crate::error::ConfigError;

/// First offset handed out inside the network
///
/// `.0` is the network address, `.1` and `.2` are left for the gateway and
/// the TUN interface itself.
pub const FIRST_OFFSET: u128 = 3;

/// Fake-IP pool over one network
pub struct FakeIpPool {
    network: IpNet,
    /// First and last assignable address, as integers
    first: u128,
    last: u128,
    /// Live mappings never exceed this
    bound: usize,
    /// host -> address, least recently used evicted first
    by_host: Cache<String, u128>,
    /// address -> host
    by_ip: Arc<DashMap<u128, String>>,
    /// Next address to try; held for the whole allocation
    cursor: Mutex<u128>,
}

impl FakeIpPool {
    /// Create a pool over `network` holding at most `max_entries` mappings
    ///
    /// The network address, the first two hosts and the broadcast address are
    /// never assigned. One assignable address is always kept free so a new
    /// mapping never waits for an eviction, which caps the bound at the
    /// range size minus one.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` when the range leaves fewer
    /// than two assignable addresses or `max_entries` is zero.
    pub fn new(network: IpNet, max_entries: usize) -> Result<Self, ConfigError> {
        let network = network.trunc();
        let base = to_u128(network.network());
        let broadcast = to_u128(network.broadcast());
        let first = base + FIRST_OFFSET;
        let last = broadcast.saturating_sub(1);

        if first >= last {
            return Err(ConfigError::ValidationError(format!(
                "fake-IP range {network} is too small"
            )));
        }
        if max_entries == 0 {
            return Err(ConfigError::ValidationError(
                "fake-IP pool needs max_entries > 0".into(),
            ));
        }

        let usable = last - first;
        let bound = usize::try_from(usable).map_or(max_entries, |c| c.min(max_entries));

        let by_ip = Arc::new(DashMap::new());
        let reverse = Arc::clone(&by_ip);
        let by_host = Cache::builder()
            .max_capacity(u64::try_from(bound).unwrap_or(u64::MAX))
            .eviction_policy(EvictionPolicy::lru())
            .eviction_listener(move |host: Arc<String>, ip: u128, cause| match cause {
                RemovalCause::Size | RemovalCause::Explicit | RemovalCause::Expired => {
                    trace!(host = %host, "fake-IP mapping evicted");
                    reverse.remove_if(&ip, |_, mapped: &String| mapped == host.as_str());
                }
                RemovalCause::Replaced => {}
            })
            .build();

        Ok(Self {
            network,
            first,
            last,
            bound,
            by_host,
            by_ip,
            cursor: Mutex::new(first),
        })
    }

    /// Fake IP for `host`, allocating one when needed
    ///
    /// Repeated lookups return the same address while the mapping is cached.
    pub fn lookup(&self, host: &str) -> IpAddr {
        let host = normalize(host);
        if let Some(ip) = self.by_host.get(&host) {
            return self.to_ip(ip);
        }

        let mut cursor = self.cursor.lock();
        // Another caller may have mapped it while we waited
        if let Some(ip) = self.by_host.get(&host) {
            return self.to_ip(ip);
        }

        // At most `bound < range` addresses are mapped, so one is free
        let mut ip = *cursor;
        while self.by_ip.contains_key(&ip) {
            ip = self.advance(ip);
        }
        *cursor = self.advance(ip);

        self.by_ip.insert(ip, host.clone());
        self.by_host.insert(host, ip);
        // Apply the size eviction now so the reverse map never lags
        self.by_host.run_pending_tasks();
        self.to_ip(ip)
    }

    /// Host mapped to `ip`, if any
    #[must_use]
    pub fn look_back(&self, ip: IpAddr) -> Option<String> {
        if !self.contains(ip) {
            return None;
        }
        let value = to_u128(ip);
        let host = self.by_ip.get(&value).map(|h| h.value().clone())?;
        // Reading through the cache refreshes recency
        (self.by_host.get(&host) == Some(value)).then_some(host)
    }

    /// Check if `ip` lies inside this pool's network
    #[must_use]
    pub fn contains(&self, ip: IpAddr) -> bool {
        self.network.contains(&ip)
    }

    /// Whether `host` currently has a mapping (does not refresh it)
    #[must_use]
    pub fn exist(&self, host: &str) -> bool {
        self.by_host.contains_key(&normalize(host))
    }

    /// Number of live mappings
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    /// Whether no host is mapped
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Maximum number of live mappings
    #[must_use]
    pub const fn bound(&self) -> usize {
        self.bound
    }

    /// The network range
    #[must_use]
    pub const fn network(&self) -> IpNet {
        self.network
    }

    /// First assignable address
    #[must_use]
    pub fn first(&self) -> IpAddr {
        self.to_ip(self.first)
    }

    fn advance(&self, ip: u128) -> u128 {
        if ip >= self.last {
            self.first
        } else {
            ip + 1
        }
    }

    fn to_ip(&self, value: u128) -> IpAddr {
        match self.network {
            #[allow(clippy::cast_possible_truncation)]
            IpNet::V4(_) => IpAddr::V4(Ipv4Addr::from(value as u32)),
            IpNet::V6(_) => IpAddr::V6(Ipv6Addr::from(value)),
        }
    }
}

impl std::fmt::Debug for FakeIpPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FakeIpPool")
            .field("network", &self.network)
            .field("bound", &self.bound)
            .field("len", &self.len())
            .finish()
    }
}

fn to_u128(ip: IpAddr) -> u128 {
    match ip {
        IpAddr::V4(v4) => u128::from(u32::from(v4)),
        IpAddr::V6(v6) => u128::from(v6),
    }
}

/// Lowercase, without the trailing root dot
fn normalize(host: &str) -> String {
    host.trim_end_matches('.').to_ascii_lowercase()
}
