//! Tunnel dispatch engine
//!
//! Turns stack-level TCP connections and UDP datagrams into proxied flows.
//!
//! # Overview
//!
//! - TCP: every accepted connection gets its own task that dials the
//!   upstream, wraps it in a tracker and relays both directions with
//!   half-close handling.
//! - UDP: datagrams are sharded by port onto bounded queues, each drained by
//!   one worker. Sessions are full-cone NAT entries created with a
//!   single-flight dial.
//!
//! # Submodules
//!
//! - [`config`]: timeouts and worker sizing
//! - [`engine`]: [`Tunnel`] and its builder
//! - [`stats`]: dispatch counters
//!
//! # Quick Start
//!
//! ```ignore
//! use std::sync::Arc;
//! use tun_dispatch::dialer::DirectDialer;
//! use tun_dispatch::tunnel::{Tunnel, TunnelConfig};
//!
//! let tunnel = Arc::new(
//!     Tunnel::builder()
//!         .config(TunnelConfig::default())
//!         .dialer(Arc::new(DirectDialer::default()))
//!         .build()?,
//! );
//! tunnel.process();
//!
//! // From the stack:
//! tunnel.handle_tcp(origin);
//! tunnel.handle_udp(packet);
//! ```

pub mod config;
pub mod engine;
mod session;
pub mod stats;
mod tcp;
mod udp;

pub use config::{
    default_udp_workers, TunnelConfig, MIN_UDP_WORKERS, TCP_CONNECT_TIMEOUT, TCP_WAIT_TIMEOUT,
    UDP_QUEUE_SIZE, UDP_SESSION_TIMEOUT,
};
pub use engine::{shard_index, Tunnel, TunnelBuilder};
pub use stats::{TunnelStats, TunnelStatsSnapshot};
