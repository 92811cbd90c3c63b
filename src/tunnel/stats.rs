//! Dispatch statistics
//!
//! Engine-level counters, separate from the per-flow byte accounting done by
//! the connection manager. Per-shard packet counts make uneven sharding
//! visible.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Counters of the dispatch engine
#[derive(Debug)]
pub struct TunnelStats {
    per_shard_packets: Vec<AtomicU64>,
    tcp_accepted: AtomicU64,
    udp_received: AtomicU64,
    udp_dropped: AtomicU64,
    dial_failures: AtomicU64,
    invalid_metadata: AtomicU64,
    dns_hijacked: AtomicU64,
    udp_sessions: AtomicU64,
}

impl TunnelStats {
    /// Create stats for `shard_count` UDP shards
    #[must_use]
    pub fn new(shard_count: usize) -> Self {
        Self {
            per_shard_packets: (0..shard_count).map(|_| AtomicU64::new(0)).collect(),
            tcp_accepted: AtomicU64::new(0),
            udp_received: AtomicU64::new(0),
            udp_dropped: AtomicU64::new(0),
            dial_failures: AtomicU64::new(0),
            invalid_metadata: AtomicU64::new(0),
            dns_hijacked: AtomicU64::new(0),
            udp_sessions: AtomicU64::new(0),
        }
    }

    pub(crate) fn record_tcp_accepted(&self) {
        self.tcp_accepted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a packet queued on `shard`
    pub(crate) fn record_udp_queued(&self, shard: usize) {
        self.udp_received.fetch_add(1, Ordering::Relaxed);
        if let Some(counter) = self.per_shard_packets.get(shard) {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub(crate) fn record_udp_dropped(&self) {
        self.udp_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dial_failure(&self) {
        self.dial_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invalid_metadata(&self) {
        self.invalid_metadata.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_dns_hijacked(&self) {
        self.dns_hijacked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_udp_session(&self) {
        self.udp_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Packets dropped because their shard queue was full or closed
    #[must_use]
    pub fn udp_dropped(&self) -> u64 {
        self.udp_dropped.load(Ordering::Relaxed)
    }

    /// Failed upstream dials (TCP and UDP)
    #[must_use]
    pub fn dial_failures(&self) -> u64 {
        self.dial_failures.load(Ordering::Relaxed)
    }

    /// Number of shards
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.per_shard_packets.len()
    }

    /// Create a snapshot of the current statistics
    #[must_use]
    pub fn snapshot(&self) -> TunnelStatsSnapshot {
        TunnelStatsSnapshot {
            shard_count: self.per_shard_packets.len(),
            per_shard_packets: self
                .per_shard_packets
                .iter()
                .map(|c| c.load(Ordering::Relaxed))
                .collect(),
            tcp_accepted: self.tcp_accepted.load(Ordering::Relaxed),
            udp_received: self.udp_received.load(Ordering::Relaxed),
            udp_dropped: self.udp_dropped(),
            dial_failures: self.dial_failures(),
            invalid_metadata: self.invalid_metadata.load(Ordering::Relaxed),
            dns_hijacked: self.dns_hijacked.load(Ordering::Relaxed),
            udp_sessions: self.udp_sessions.load(Ordering::Relaxed),
        }
    }

    /// Reset all statistics to zero
    pub fn reset(&self) {
        for counter in &self.per_shard_packets {
            counter.store(0, Ordering::Relaxed);
        }
        self.tcp_accepted.store(0, Ordering::Relaxed);
        self.udp_received.store(0, Ordering::Relaxed);
        self.udp_dropped.store(0, Ordering::Relaxed);
        self.dial_failures.store(0, Ordering::Relaxed);
        self.invalid_metadata.store(0, Ordering::Relaxed);
        self.dns_hijacked.store(0, Ordering::Relaxed);
        self.udp_sessions.store(0, Ordering::Relaxed);
    }
}

/// Snapshot of dispatch statistics
#[derive(Debug, Clone, Serialize)]
pub struct TunnelStatsSnapshot {
    /// Number of UDP shards
    pub shard_count: usize,
    /// Packets queued per shard
    pub per_shard_packets: Vec<u64>,
    /// TCP connections handed to the tunnel
    pub tcp_accepted: u64,
    /// UDP packets queued on a shard
    pub udp_received: u64,
    /// UDP packets dropped at enqueue
    pub udp_dropped: u64,
    /// Failed upstream dials
    pub dial_failures: u64,
    /// Flows dropped for missing or unknown destinations
    pub invalid_metadata: u64,
    /// DNS queries answered in-process
    pub dns_hijacked: u64,
    /// UDP NAT entries created
    pub udp_sessions: u64,
}

impl TunnelStatsSnapshot {
    /// Standard deviation of per-shard packet counts
    ///
    /// Lower values indicate more even distribution.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn distribution_skew(&self) -> f64 {
        if self.per_shard_packets.is_empty() {
            return 0.0;
        }
        let shards = self.shard_count as f64;
        let mean = self.per_shard_packets.iter().sum::<u64>() as f64 / shards;
        let variance = self
            .per_shard_packets
            .iter()
            .map(|&count| {
                let diff = count as f64 - mean;
                diff * diff
            })
            .sum::<f64>()
            / shards;
        variance.sqrt()
    }
}
