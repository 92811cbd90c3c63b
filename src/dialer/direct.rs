//! Direct dialer
//!
//! Connects straight to the destination without a proxy. Hostnames recovered
//! from the fake-IP map are resolved with the system resolver; the fake IP
//! itself is never dialed.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use socket2::{SockRef, TcpKeepalive};
use tokio::net::{TcpSocket, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::traits::{Dialer, OutboundConnection, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;

/// Keepalive idle time before the first probe
const KEEPALIVE_TIME: Duration = Duration::from_secs(60);
/// Interval between keepalive probes
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

/// Resolve the dial target of a flow
///
/// A known host wins over the destination IP, which may be a fake address.
async fn resolve_target(metadata: &Metadata) -> Result<SocketAddr, DialError> {
    if let Some(host) = &metadata.host {
        let mut addrs = tokio::net::lookup_host((host.as_str(), metadata.dst_port))
            .await
            .map_err(|e| DialError::resolve(host, e.to_string()))?;
        return addrs
            .next()
            .ok_or_else(|| DialError::resolve(host, "no addresses"));
    }
    metadata
        .udp_addr()
        .ok_or_else(|| DialError::connection_failed(metadata.destination_address(), "no destination"))
}

/// Direct dialer - connects to the destination itself
pub struct DirectDialer {
    connect_timeout: Duration,
}

impl DirectDialer {
    /// Create a direct dialer with the given connect timeout
    #[must_use]
    pub const fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn connect(&self, addr: SocketAddr) -> Result<TcpStream, DialError> {
        let failed = |e: io::Error| DialError::connection_failed(addr.to_string(), e.to_string());

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(failed)?;

        let keepalive = TcpKeepalive::new()
            .with_time(KEEPALIVE_TIME)
            .with_interval(KEEPALIVE_INTERVAL);
        SockRef::from(&socket)
            .set_tcp_keepalive(&keepalive)
            .map_err(failed)?;

        match tokio::time::timeout(self.connect_timeout, socket.connect(addr)).await {
            Ok(Ok(stream)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY: {}", e);
                }
                Ok(stream)
            }
            Ok(Err(e)) => Err(failed(e)),
            Err(_) => Err(DialError::timeout(addr.to_string(), self.connect_timeout)),
        }
    }
}

impl Default for DirectDialer {
    fn default() -> Self {
        Self::new(crate::tunnel::TCP_CONNECT_TIMEOUT)
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<OutboundConnection, DialError> {
        let addr = resolve_target(metadata).await?;
        let stream = self.connect(addr).await?;
        let local_addr = stream.local_addr().ok();
        debug!("Direct connection to {} ({}) successful", metadata.destination_address(), addr);
        Ok(OutboundConnection::new(Box::new(stream), local_addr))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, DialError> {
        let bind: SocketAddr = match metadata.dst_ip {
            Some(IpAddr::V6(_)) => (Ipv6Addr::UNSPECIFIED, 0).into(),
            _ => (Ipv4Addr::UNSPECIFIED, 0).into(),
        };
        let socket = UdpSocket::bind(bind)
            .await
            .map_err(|e| DialError::connection_failed(metadata.destination_address(), e.to_string()))?;
        debug!(
            local = ?socket.local_addr().ok(),
            "Direct UDP socket for {} bound",
            metadata.source_address()
        );
        Ok(Arc::new(DirectPacketConn::new(socket)))
    }

    fn name(&self) -> &str {
        "direct"
    }
}

/// Unconnected UDP socket serving one NAT entry
pub struct DirectPacketConn {
    socket: UdpSocket,
    /// Last resolved host, reused for consecutive sends to the same name
    resolved: Mutex<Option<(String, u16, SocketAddr)>>,
    closed: CancellationToken,
}

impl DirectPacketConn {
    /// Wrap a bound UDP socket
    #[must_use]
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            resolved: Mutex::new(None),
            closed: CancellationToken::new(),
        }
    }

    async fn target(&self, dst: &Metadata) -> io::Result<SocketAddr> {
        let Some(host) = &dst.host else {
            return dst
                .udp_addr()
                .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no destination"));
        };

        if let Some((cached_host, port, addr)) = self.resolved.lock().as_ref() {
            if cached_host == host && *port == dst.dst_port {
                return Ok(*addr);
            }
        }

        let addr = resolve_target(dst)
            .await
            .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?;
        *self.resolved.lock() = Some((host.clone(), dst.dst_port, addr));
        Ok(addr)
    }
}

#[async_trait]
impl PacketConn for DirectPacketConn {
    async fn send_to(&self, buf: &[u8], dst: &Metadata) -> io::Result<usize> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "packet conn closed"));
        }
        let addr = self.target(dst).await?;
        self.socket.send_to(buf, addr).await
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        tokio::select! {
            res = self.socket.recv_from(buf) => res,
            () = self.closed.cancelled() => {
                Err(io::Error::new(io::ErrorKind::NotConnected, "packet conn closed"))
            }
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    fn peer_addr(&self, dst: &Metadata) -> Option<SocketAddr> {
        let Some(host) = &dst.host else {
            return dst.udp_addr();
        };
        match self.resolved.lock().as_ref() {
            Some((cached_host, port, addr)) if cached_host == host && *port == dst.dst_port => {
                Some(*addr)
            }
            _ => None,
        }
    }

    fn close(&self) {
        self.closed.cancel();
    }
}
