//! Dialer trait definitions
//!
//! The proxy layer sits behind these traits. Protocol handshakes (SOCKS,
//! Shadowsocks, HTTP CONNECT, ...) happen inside `dial_tcp`/`dial_udp`; the
//! tunnel only sees a byte stream or a packet connection.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::DialError;
use crate::io::HalfCloseStream;
use crate::metadata::Metadata;

/// An established upstream TCP connection
pub struct OutboundConnection {
    /// The upstream byte stream
    stream: Box<dyn HalfCloseStream>,
    /// Local address of the upstream socket
    local_addr: Option<SocketAddr>,
}

impl OutboundConnection {
    /// Create a new outbound connection
    pub fn new(stream: Box<dyn HalfCloseStream>, local_addr: Option<SocketAddr>) -> Self {
        Self { stream, local_addr }
    }

    /// Get the local address
    #[must_use]
    pub const fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Consume and return the underlying stream
    #[must_use]
    pub fn into_stream(self) -> Box<dyn HalfCloseStream> {
        self.stream
    }
}

impl std::fmt::Debug for OutboundConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundConnection")
            .field("local_addr", &self.local_addr)
            .finish_non_exhaustive()
    }
}

/// Upstream datagram connection for one NAT entry
///
/// Full-cone: one connection carries datagrams to every destination reached
/// from the same source, so the destination travels with each send.
#[async_trait]
pub trait PacketConn: Send + Sync {
    /// Send a datagram to the destination described by `dst`
    async fn send_to(&self, buf: &[u8], dst: &Metadata) -> io::Result<usize>;

    /// Receive a datagram, returning its length and sender
    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Local address of the upstream socket
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Address replies to `dst` are expected to come from
    ///
    /// Only meaningful after a send to `dst`. Hostname destinations are
    /// resolved inside the connection, so the default knows nothing.
    fn peer_addr(&self, dst: &Metadata) -> Option<SocketAddr> {
        if dst.host.is_some() {
            None
        } else {
            dst.udp_addr()
        }
    }

    /// Stop the connection; pending and future receives fail
    fn close(&self) {}
}

/// Core trait for proxy dialers
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open an upstream stream for a TCP flow.
    ///
    /// # Errors
    ///
    /// Returns `DialError` if the proxy is unreachable or refuses the flow.
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<OutboundConnection, DialError>;

    /// Open an upstream packet connection for a UDP flow.
    ///
    /// # Errors
    ///
    /// Returns `DialError` if the proxy is unreachable or refuses the flow.
    async fn dial_udp(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, DialError>;

    /// Short name used in logs
    fn name(&self) -> &str;
}
