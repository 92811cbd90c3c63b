//! tun-dispatch: Tunnel dispatch and session engine
//!
//! This crate sits between a user-space TCP/IP stack reading a TUN device
//! and a proxy dialer. It turns accepted TCP connections and individual UDP
//! datagrams into proxied flows.
//!
//! # Features
//!
//! - **TCP relay**: per-connection tasks with half-close and a bounded wait
//!   once one direction finishes
//! - **UDP NAT**: full-cone session table with single-flight upstream dials
//! - **Sharded UDP queues**: per-flow FIFO ordering with drop-on-full
//!   backpressure
//! - **Fake-IP DNS**: synthetic addresses mapped back to hostnames before
//!   dialing
//! - **Traffic accounting**: per-connection trackers and global totals
//!
//! # Architecture
//!
//! ```text
//! TUN → stack → Tunnel ─ TCP ─→ TcpTracker ─→ Dialer → Destination
//!                  │
//!                  └─ UDP ─→ shard queue → NAT table → UdpTracker
//!                                ↓
//!                          fake DNS (port 53)
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use tun_dispatch::config::load_config;
//! use tun_dispatch::{dialer, Tunnel};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/tun-dispatch/config.json")?;
//!
//! let tunnel = Tunnel::builder()
//!     .config(config.tunnel.clone())
//!     .dialer(dialer::from_config(&config.dialer, config.tunnel.tcp_connect_timeout()))
//!     .build()?;
//! tunnel.process();
//!
//! // Feed the tunnel from the stack:
//! // tunnel.handle_tcp(origin);
//! // tunnel.handle_udp(packet);
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: Configuration types and loading
//! - [`connection`]: Traffic trackers and the connection manager
//! - [`dialer`]: The proxy boundary
//! - [`error`]: Error types
//! - [`fakedns`]: Fake-IP pool and DNS responder
//! - [`io`]: Buffer allocator and TCP relay
//! - [`metadata`]: Flow description
//! - [`nat`]: UDP session table
//! - [`stack`]: Traits the TCP/IP stack implements
//! - [`tunnel`]: The dispatch engine

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod config;
pub mod connection;
pub mod dialer;
pub mod error;
pub mod fakedns;
pub mod io;
pub mod metadata;
pub mod nat;
pub mod stack;
pub mod tunnel;

// Re-export commonly used types at the crate root
pub use config::{Config, DeviceConfig, DialerConfig, DialerKind, LogConfig, StatsConfig};
pub use connection::{Manager, Snapshot, TcpTracker, UdpTracker};
pub use dialer::{Dialer, DirectDialer, OutboundConnection, PacketConn, RejectDialer};
pub use error::{
    BufferError, ConfigError, DialError, FakeDnsError, MetadataError, TunnelError,
};
pub use fakedns::{FakeDnsConfig, FakeDnsResolver, FakeDnsServer, FakeIpPool};
pub use io::{Allocator, PooledBuffer};
pub use metadata::{Metadata, Network};
pub use nat::NatTable;
pub use stack::{TcpOrigin, UdpPacket};
pub use tunnel::{Tunnel, TunnelBuilder, TunnelConfig, TunnelStats};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
