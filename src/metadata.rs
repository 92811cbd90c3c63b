//! Flow metadata
//!
//! `Metadata` identifies exactly one TCP connection or UDP conversation. It is
//! built when the stack hands a flow to the tunnel, gets its mid (dialer-side)
//! address once the upstream dial succeeds, and is then frozen behind an `Arc`
//! shared with the flow's tracker.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use serde::{Deserialize, Serialize};

/// SOCKS address type: IPv4
const ATYP_IPV4: u8 = 0x01;
/// SOCKS address type: domain name
const ATYP_DOMAIN: u8 = 0x03;
/// SOCKS address type: IPv6
const ATYP_IPV6: u8 = 0x04;

/// Transport protocol of a flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Tcp,
    Udp,
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp => write!(f, "tcp"),
            Self::Udp => write!(f, "udp"),
        }
    }
}

/// Identity of a single flow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub network: Network,
    #[serde(rename = "sourceIP")]
    pub src_ip: IpAddr,
    #[serde(rename = "sourcePort")]
    pub src_port: u16,
    /// Local address of the upstream socket, filled after the dial
    #[serde(rename = "dialerIP")]
    pub mid_ip: Option<IpAddr>,
    #[serde(rename = "dialerPort")]
    pub mid_port: u16,
    #[serde(rename = "destinationIP")]
    pub dst_ip: Option<IpAddr>,
    #[serde(rename = "destinationPort")]
    pub dst_port: u16,
    /// Hostname recovered from the fake-IP reverse map
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
}

impl Metadata {
    /// Metadata for a flow between two socket addresses
    #[must_use]
    pub fn new(network: Network, src: SocketAddr, dst: SocketAddr) -> Self {
        Self {
            network,
            src_ip: src.ip(),
            src_port: src.port(),
            mid_ip: None,
            mid_port: 0,
            dst_ip: Some(dst.ip()),
            dst_port: dst.port(),
            host: None,
        }
    }

    /// Metadata for a TCP flow
    #[must_use]
    pub fn tcp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Network::Tcp, src, dst)
    }

    /// Metadata for a UDP flow
    #[must_use]
    pub fn udp(src: SocketAddr, dst: SocketAddr) -> Self {
        Self::new(Network::Udp, src, dst)
    }

    /// Source endpoint
    #[must_use]
    pub fn source(&self) -> SocketAddr {
        SocketAddr::new(self.src_ip, self.src_port)
    }

    /// `ip:port` of the source, IPv6 bracketed
    #[must_use]
    pub fn source_address(&self) -> String {
        self.source().to_string()
    }

    /// `host:port` when a host is known, otherwise `ip:port`
    #[must_use]
    pub fn destination_address(&self) -> String {
        match (&self.host, self.dst_ip) {
            (Some(host), _) => join_host_port(host, self.dst_port),
            (None, Some(ip)) => SocketAddr::new(ip, self.dst_port).to_string(),
            (None, None) => join_host_port("", self.dst_port),
        }
    }

    /// Destination endpoint, when the destination IP is known
    #[must_use]
    pub fn udp_addr(&self) -> Option<SocketAddr> {
        self.dst_ip.map(|ip| SocketAddr::new(ip, self.dst_port))
    }

    /// Dialer-side endpoint, once the upstream dial has filled it
    #[must_use]
    pub fn mid_addr(&self) -> Option<SocketAddr> {
        self.mid_ip.map(|ip| SocketAddr::new(ip, self.mid_port))
    }

    /// Record the local address of the upstream socket
    pub fn set_mid(&mut self, addr: SocketAddr) {
        self.mid_ip = Some(addr.ip());
        self.mid_port = addr.port();
    }

    /// NAT key of this flow
    ///
    /// Full-cone: keyed on the source endpoint only, so every destination
    /// reached from one source shares an upstream socket.
    #[must_use]
    pub fn nat_key(&self) -> String {
        self.source_address()
    }

    /// A flow is dialable once it has a host or a destination IP
    #[must_use]
    pub fn valid(&self) -> bool {
        self.host.is_some() || self.dst_ip.is_some()
    }

    /// Destination encoded as a SOCKS5 address
    ///
    /// Domains use `0x03 len name`, IPv4 `0x01`, IPv6 `0x04`; the port
    /// follows in network byte order. Hostnames longer than 255 bytes are
    /// truncated to fit the length octet.
    #[must_use]
    pub fn serialize_socks_addr(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(1 + 1 + 255 + 2);
        match (&self.host, self.dst_ip) {
            (Some(host), _) => {
                let name = &host.as_bytes()[..host.len().min(255)];
                buf.push(ATYP_DOMAIN);
                #[allow(clippy::cast_possible_truncation)]
                buf.push(name.len() as u8);
                buf.extend_from_slice(name);
            }
            (None, Some(IpAddr::V4(ip))) => {
                buf.push(ATYP_IPV4);
                buf.extend_from_slice(&ip.octets());
            }
            (None, Some(IpAddr::V6(ip))) => {
                buf.push(ATYP_IPV6);
                buf.extend_from_slice(&ip.octets());
            }
            (None, None) => return Vec::new(),
        }
        buf.extend_from_slice(&self.dst_port.to_be_bytes());
        buf
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} -> {}",
            self.network,
            self.source_address(),
            self.destination_address()
        )
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}
