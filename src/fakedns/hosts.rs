//! Static host table
//!
//! Entries are either exact (`router.lan`) or wildcard (`*.corp.example`).
//! A wildcard matches any name below its suffix but not the suffix itself.
//! Exact entries win; among wildcards the longest suffix wins.

use std::collections::HashMap;
use std::net::IpAddr;

/// Static host entries answered before any fake IP
#[derive(Debug, Default, Clone)]
pub struct Hosts {
    exact: HashMap<String, IpAddr>,
    /// `(suffix with leading dot, address)`, longest suffix first
    wildcard: Vec<(String, IpAddr)>,
}

impl Hosts {
    /// Build the table from `domain -> address` entries
    #[must_use]
    pub fn new<'a>(entries: impl IntoIterator<Item = (&'a String, &'a IpAddr)>) -> Self {
        let mut hosts = Self::default();
        for (domain, ip) in entries {
            hosts.insert(domain, *ip);
        }
        hosts
    }

    /// Add one entry
    pub fn insert(&mut self, domain: &str, ip: IpAddr) {
        let domain = domain.trim().trim_end_matches('.').to_ascii_lowercase();
        if let Some(suffix) = domain.strip_prefix("*.") {
            self.wildcard.push((format!(".{suffix}"), ip));
            self.wildcard.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
        } else if !domain.is_empty() {
            self.exact.insert(domain, ip);
        }
    }

    /// Address configured for `domain`
    #[must_use]
    pub fn search(&self, domain: &str) -> Option<IpAddr> {
        let domain = domain.trim_end_matches('.').to_ascii_lowercase();
        if let Some(ip) = self.exact.get(&domain) {
            return Some(*ip);
        }
        self.wildcard
            .iter()
            .find(|(suffix, _)| domain.ends_with(suffix.as_str()))
            .map(|(_, ip)| *ip)
    }

    /// Number of entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.exact.len() + self.wildcard.len()
    }

    /// Whether the table is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
