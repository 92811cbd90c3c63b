//! Stack boundary
//!
//! The user-space TCP/IP stack terminates packets read from the TUN device
//! and hands the tunnel two kinds of work:
//!
//! - accepted TCP connections, as [`TcpOrigin`] streams;
//! - individual UDP datagrams, as [`UdpPacket`]s that know how to answer
//!   their sender.
//!
//! Any stack can drive the tunnel by implementing these traits. The optional
//! `ipstack` feature ships an adapter for the `ipstack` crate.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;

use crate::io::HalfCloseStream;

#[cfg(feature = "ipstack")]
mod ipstack;

#[cfg(feature = "ipstack")]
pub use self::ipstack::{open_stack, serve, IpStackTcpOrigin, IpStackUdpPacket};

/// A TCP connection accepted by the stack
pub trait TcpOrigin: HalfCloseStream {
    /// The client endpoint (flow source)
    fn local_addr(&self) -> SocketAddr;

    /// The address the client connected to (flow destination)
    fn remote_addr(&self) -> SocketAddr;
}

/// A UDP datagram delivered by the stack
///
/// Shared between the shard worker and the session reader, which answers
/// the client through [`UdpPacket::write_back`] for as long as the NAT entry
/// lives.
#[async_trait]
pub trait UdpPacket: Send + Sync {
    /// Datagram payload
    fn data(&self) -> &[u8];

    /// Release stack-held resources early
    ///
    /// Called when the packet is dropped under backpressure and when its
    /// session ends. Must be idempotent.
    fn release(&self) {}

    /// The client endpoint (flow source)
    fn local_addr(&self) -> SocketAddr;

    /// The destination the client addressed
    fn remote_addr(&self) -> SocketAddr;

    /// Send `payload` to the client
    ///
    /// `from` overrides the source address of the reply; `None` answers from
    /// [`UdpPacket::remote_addr`].
    async fn write_back(&self, payload: &[u8], from: Option<SocketAddr>) -> io::Result<usize>;
}
