//! Traffic Manager
//!
//! Central registry of live trackers plus global traffic accounting:
//! - Registry for enumeration and forced close by an inspection API
//! - Monotonic upload/download totals
//! - Per-second throughput from a periodic sampler

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

use super::tracker::{TrackerInfo, TrackerSnapshot};

/// Default sampling period for [`Manager::now`]
pub const SAMPLE_INTERVAL: Duration = Duration::from_secs(1);

/// Point-in-time view of all tracked traffic
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub download_total: u64,
    pub upload_total: u64,
    pub connections: Vec<TrackerSnapshot>,
}

/// Registry of live connections and global traffic counters
#[derive(Debug, Default)]
pub struct Manager {
    connections: DashMap<Uuid, Arc<TrackerInfo>>,
    /// Bytes since the last sample
    upload_temp: AtomicU64,
    download_temp: AtomicU64,
    /// Bytes counted in the last full sample period
    upload_blip: AtomicU64,
    download_blip: AtomicU64,
    upload_total: AtomicU64,
    download_total: AtomicU64,
}

impl Manager {
    /// Create a new manager
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tracker
    pub fn join(&self, info: Arc<TrackerInfo>) {
        debug!(id = %info.id(), "tracker joined: {}", info.metadata());
        self.connections.insert(info.id(), info);
    }

    /// Deregister a tracker
    pub fn leave(&self, id: &Uuid) {
        if self.connections.remove(id).is_some() {
            debug!(id = %id, "tracker left");
        }
    }

    /// Account bytes sent upstream
    pub fn push_uploaded(&self, size: u64) {
        self.upload_temp.fetch_add(size, Ordering::Relaxed);
        self.upload_total.fetch_add(size, Ordering::Relaxed);
    }

    /// Account bytes received from upstream
    pub fn push_downloaded(&self, size: u64) {
        self.download_temp.fetch_add(size, Ordering::Relaxed);
        self.download_total.fetch_add(size, Ordering::Relaxed);
    }

    /// Throughput over the last sample period as `(upload, download)` bytes/s
    #[must_use]
    pub fn now(&self) -> (u64, u64) {
        (
            self.upload_blip.load(Ordering::Relaxed),
            self.download_blip.load(Ordering::Relaxed),
        )
    }

    /// Close the current sample period
    ///
    /// Called once per [`SAMPLE_INTERVAL`] by the sampler task.
    pub fn sample(&self) {
        self.upload_blip
            .store(self.upload_temp.swap(0, Ordering::Relaxed), Ordering::Relaxed);
        self.download_blip
            .store(self.download_temp.swap(0, Ordering::Relaxed), Ordering::Relaxed);
    }

    /// Spawn the sampler feeding [`Manager::now`]
    pub fn spawn_sampler(
        self: &Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // First tick completes immediately
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => manager.sample(),
                }
            }
            debug!("traffic sampler stopped");
        })
    }

    /// Total bytes uploaded since start
    #[must_use]
    pub fn upload_total(&self) -> u64 {
        self.upload_total.load(Ordering::Relaxed)
    }

    /// Total bytes downloaded since start
    #[must_use]
    pub fn download_total(&self) -> u64 {
        self.download_total.load(Ordering::Relaxed)
    }

    /// Number of live trackers
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Snapshot of totals and every live tracker
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let connections = self
            .connections
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect();
        Snapshot {
            download_total: self.download_total(),
            upload_total: self.upload_total(),
            connections,
        }
    }

    /// Forcibly close the tracker with `id`
    ///
    /// Returns `false` when no such tracker is live.
    pub fn close(&self, id: &Uuid) -> bool {
        match self.connections.remove(id) {
            Some((_, info)) => {
                info.close();
                true
            }
            None => false,
        }
    }

    /// Forcibly close every live tracker
    pub fn close_all(&self) -> usize {
        let ids: Vec<Uuid> = self.connections.iter().map(|e| *e.key()).collect();
        let closed = ids.iter().filter(|id| self.close(id)).count();
        if closed > 0 {
            info!("closed {} tracked connections", closed);
        }
        closed
    }

    /// Reset the global counters
    pub fn reset_statistic(&self) {
        for counter in [
            &self.upload_temp,
            &self.download_temp,
            &self.upload_blip,
            &self.download_blip,
            &self.upload_total,
            &self.download_total,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}
