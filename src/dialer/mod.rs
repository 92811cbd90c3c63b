//! Dialer module
//!
//! The proxy boundary of the tunnel. A [`Dialer`] turns flow [`Metadata`]
//! into an upstream stream (TCP) or packet connection (UDP).
//!
//! # Dialer Types
//!
//! - `DirectDialer`: connect to the destination without a proxy, resolving
//!   hostnames recovered from the fake-IP map.
//! - `RejectDialer`: refuse every flow.
//!
//! Protocol dialers (SOCKS5, Shadowsocks, ...) implement the same trait
//! outside this crate.
//!
//! [`Metadata`]: crate::metadata::Metadata

mod direct;
mod reject;
mod traits;

use std::sync::Arc;
use std::time::Duration;

pub use direct::{DirectDialer, DirectPacketConn};
pub use reject::RejectDialer;
pub use traits::{Dialer, OutboundConnection, PacketConn};

use crate::config::{DialerConfig, DialerKind};

/// Build the dialer selected by configuration
#[must_use]
pub fn from_config(config: &DialerConfig, connect_timeout: Duration) -> Arc<dyn Dialer> {
    match config.kind {
        DialerKind::Direct => Arc::new(DirectDialer::new(connect_timeout)),
        DialerKind::Reject => Arc::new(RejectDialer::new()),
    }
}
