//! Live UDP session
//!
//! Wraps the tracked upstream connection of one NAT entry. Every datagram in
//! either direction counts as activity for the idle timer, and replies from
//! an upstream that was reached through a fake IP are reported as coming
//! from that fake address.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::dialer::PacketConn;
use crate::metadata::Metadata;

pub(crate) struct UdpSession {
    conn: Arc<dyn PacketConn>,
    last_active: Mutex<Instant>,
    /// Upstream peer address -> fake destination the client used
    fake_routes: DashMap<SocketAddr, SocketAddr>,
}

impl UdpSession {
    pub(crate) fn new(conn: Arc<dyn PacketConn>) -> Self {
        Self {
            conn,
            last_active: Mutex::new(Instant::now()),
            fake_routes: DashMap::new(),
        }
    }

    fn touch(&self) {
        *self.last_active.lock() = Instant::now();
    }

    /// When the session expires if nothing else happens
    pub(crate) fn idle_deadline(&self, idle: Duration) -> Instant {
        *self.last_active.lock() + idle
    }

    /// Remember which fake address a destination was reached through
    ///
    /// A send to a plain destination forgets any fake route to the same
    /// peer, so the latest way the client addressed it wins.
    fn record_route(&self, dst: &Metadata) {
        let Some(addressed) = dst.udp_addr() else {
            return;
        };
        if dst.host.is_none() {
            self.fake_routes.remove(&addressed);
            return;
        }
        match self.conn.peer_addr(dst) {
            Some(peer) if peer != addressed => {
                self.fake_routes.insert(peer, addressed);
            }
            _ => {}
        }
    }

    fn reply_source(&self, from: SocketAddr) -> SocketAddr {
        self.fake_routes.get(&from).map_or(from, |fake| *fake)
    }
}

#[async_trait]
impl PacketConn for UdpSession {
    async fn send_to(&self, buf: &[u8], dst: &Metadata) -> io::Result<usize> {
        // Known peers are mapped before the reply can race us; a host
        // resolved by this very send is mapped right after it
        self.record_route(dst);
        let n = self.conn.send_to(buf, dst).await?;
        self.touch();
        self.record_route(dst);
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.conn.recv_from(buf).await?;
        self.touch();
        Ok((n, self.reply_source(from)))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.conn.local_addr()
    }

    fn peer_addr(&self, dst: &Metadata) -> Option<SocketAddr> {
        self.conn.peer_addr(dst)
    }

    fn close(&self) {
        self.conn.close();
    }
}
