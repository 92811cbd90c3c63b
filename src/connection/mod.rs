//! Connection tracking module
//!
//! This module provides traffic accounting for proxied flows:
//! - `TcpTracker` / `UdpTracker` wrap upstream connections and count bytes
//! - `Manager` keeps the live-connection registry, global totals and
//!   throughput samples for the inspection API

mod manager;
mod tracker;

pub use manager::{Manager, Snapshot, SAMPLE_INTERVAL};
pub use tracker::{TcpTracker, TrackerInfo, TrackerSnapshot, UdpTracker};
