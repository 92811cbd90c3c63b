//! Tunnel engine
//!
//! `Tunnel` is the entry point for the stack: accepted TCP connections go
//! through [`Tunnel::handle_tcp`], UDP datagrams through
//! [`Tunnel::handle_udp`].
//!
//! # Architecture
//!
//! ```text
//!   stack ──TCP──> unbounded queue ──> dispatcher ──spawn──> flow task (dial, relay)
//!
//!   stack ──UDP──> shard = (src_port + dst_port) % N
//!                   ├─> shard 0 queue (bounded) ──> worker 0
//!                   ├─> ...
//!                   └─> shard N-1 queue         ──> worker N-1
//! ```
//!
//! Each UDP shard has exactly one consumer, so datagrams of one 5-tuple are
//! handled in arrival order. A full shard drops the datagram instead of
//! blocking the stack.

use std::future::Future;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::config::TunnelConfig;
use super::stats::TunnelStats;
use super::{tcp, udp};
use crate::connection::Manager;
use crate::dialer::{Dialer, DirectDialer};
use crate::error::{ConfigError, DialError, MetadataError, TunnelError};
use crate::fakedns::FakeDnsResolver;
use crate::io::Allocator;
use crate::metadata::Metadata;
use crate::nat::NatTable;
use crate::stack::{TcpOrigin, UdpPacket};

type TcpQueue = mpsc::UnboundedReceiver<Box<dyn TcpOrigin>>;
type UdpQueue = mpsc::Receiver<Arc<dyn UdpPacket>>;

/// Shard of a UDP datagram
///
/// Depends only on the two ports, so every datagram of a flow lands on the
/// same shard.
#[inline]
#[must_use]
pub fn shard_index(src_port: u16, dst_port: u16, shards: usize) -> usize {
    (usize::from(src_port) + usize::from(dst_port)) % shards
}

/// State shared by the tunnel and its flow tasks
pub(crate) struct Context {
    pub(crate) config: TunnelConfig,
    dialer: RwLock<Arc<dyn Dialer>>,
    udp_timeout_ms: AtomicU64,
    pub(crate) manager: Arc<Manager>,
    pub(crate) nat: Arc<NatTable>,
    pub(crate) allocator: Arc<Allocator>,
    pub(crate) resolver: Option<Arc<FakeDnsResolver>>,
    pub(crate) hijack_dns: bool,
    pub(crate) stats: TunnelStats,
    pub(crate) shutdown: CancellationToken,
}

impl Context {
    pub(crate) fn dialer(&self) -> Arc<dyn Dialer> {
        Arc::clone(&*self.dialer.read())
    }

    pub(crate) fn udp_timeout(&self) -> Duration {
        Duration::from_millis(self.udp_timeout_ms.load(Ordering::Relaxed))
    }

    /// Fill `metadata.host` from the fake-IP map
    ///
    /// A fake destination without a live mapping cannot be dialed: the real
    /// address is unknown.
    pub(crate) fn resolve_metadata(&self, metadata: &mut Metadata) -> Result<(), MetadataError> {
        let ip = metadata
            .dst_ip
            .filter(|ip| !ip.is_unspecified())
            .ok_or(MetadataError::MissingDestination)?;

        if let Some(host) = self.fake_host(ip)? {
            metadata.host = Some(host);
        }
        Ok(())
    }

    /// Run one upstream dial under the connect timeout
    ///
    /// Failures, timeouts included, are counted and come back as
    /// `TunnelError::Dial`.
    pub(crate) async fn dial<T>(
        &self,
        metadata: &Metadata,
        dial: impl Future<Output = Result<T, DialError>>,
    ) -> crate::error::Result<T> {
        let connect_timeout = self.config.tcp_connect_timeout();
        let res = match tokio::time::timeout(connect_timeout, dial).await {
            Ok(res) => res,
            Err(_) => Err(DialError::timeout(
                metadata.destination_address(),
                connect_timeout,
            )),
        };
        res.map_err(|e| {
            self.stats.record_dial_failure();
            TunnelError::from(e)
        })
    }

    fn fake_host(&self, ip: IpAddr) -> Result<Option<String>, MetadataError> {
        match &self.resolver {
            Some(resolver) if resolver.is_fake_ip(ip) => resolver
                .ip_to_host(ip)
                .map(Some)
                .ok_or(MetadataError::FakeIpNotFound(ip)),
            _ => Ok(None),
        }
    }
}

struct Queues {
    tcp: TcpQueue,
    udp: Vec<UdpQueue>,
}

/// Builder for [`Tunnel`]
#[derive(Default)]
pub struct TunnelBuilder {
    config: TunnelConfig,
    dialer: Option<Arc<dyn Dialer>>,
    manager: Option<Arc<Manager>>,
    allocator: Option<Arc<Allocator>>,
    resolver: Option<Arc<FakeDnsResolver>>,
    hijack_dns: bool,
}

impl TunnelBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn config(mut self, config: TunnelConfig) -> Self {
        self.config = config;
        self
    }

    /// Upstream dialer (default: [`DirectDialer`])
    #[must_use]
    pub fn dialer(mut self, dialer: Arc<dyn Dialer>) -> Self {
        self.dialer = Some(dialer);
        self
    }

    /// Traffic manager shared with the inspection API
    #[must_use]
    pub fn manager(mut self, manager: Arc<Manager>) -> Self {
        self.manager = Some(manager);
        self
    }

    #[must_use]
    pub fn allocator(mut self, allocator: Arc<Allocator>) -> Self {
        self.allocator = Some(allocator);
        self
    }

    /// Fake-IP resolver used to map destinations back to hosts
    #[must_use]
    pub fn resolver(mut self, resolver: Arc<FakeDnsResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Answer UDP port-53 traffic with the resolver
    #[must_use]
    pub fn hijack_dns(mut self, hijack: bool) -> Self {
        self.hijack_dns = hijack;
        self
    }

    /// Build the tunnel; workers start on [`Tunnel::process`]
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` for an invalid configuration.
    pub fn build(self) -> Result<Tunnel, ConfigError> {
        self.config.validate()?;

        let workers = self.config.workers();
        let (tcp_tx, tcp_rx) = mpsc::unbounded_channel();
        let (udp_txs, udp_rxs): (Vec<_>, Vec<_>) = (0..workers)
            .map(|_| mpsc::channel(self.config.udp_queue_size))
            .unzip();

        let dialer = self
            .dialer
            .unwrap_or_else(|| Arc::new(DirectDialer::new(self.config.tcp_connect_timeout())));
        let udp_timeout_ms = u64::try_from(self.config.udp_timeout().as_millis()).unwrap_or(u64::MAX);

        let ctx = Context {
            dialer: RwLock::new(dialer),
            udp_timeout_ms: AtomicU64::new(udp_timeout_ms),
            manager: self.manager.unwrap_or_default(),
            nat: Arc::new(NatTable::new()),
            allocator: self.allocator.unwrap_or_default(),
            resolver: self.resolver,
            hijack_dns: self.hijack_dns,
            stats: TunnelStats::new(workers),
            shutdown: CancellationToken::new(),
            config: self.config,
        };

        Ok(Tunnel {
            ctx: Arc::new(ctx),
            tcp_tx,
            udp_txs,
            queues: Mutex::new(Some(Queues {
                tcp: tcp_rx,
                udp: udp_rxs,
            })),
        })
    }
}

/// Dispatch engine between the stack and the dialer
pub struct Tunnel {
    ctx: Arc<Context>,
    tcp_tx: mpsc::UnboundedSender<Box<dyn TcpOrigin>>,
    udp_txs: Vec<mpsc::Sender<Arc<dyn UdpPacket>>>,
    /// Taken by the first `process` call
    queues: Mutex<Option<Queues>>,
}

impl Tunnel {
    #[must_use]
    pub fn builder() -> TunnelBuilder {
        TunnelBuilder::new()
    }

    /// Start the TCP dispatcher and the UDP shard workers
    ///
    /// Must be called inside a tokio runtime. Later calls are no-ops.
    pub fn process(&self) {
        let Some(queues) = self.queues.lock().take() else {
            return;
        };

        tokio::spawn(tcp_dispatcher(Arc::clone(&self.ctx), queues.tcp));
        for (shard_id, rx) in queues.udp.into_iter().enumerate() {
            tokio::spawn(udp::worker(Arc::clone(&self.ctx), shard_id, rx));
        }

        info!(
            udp_workers = self.udp_txs.len(),
            udp_queue_size = self.ctx.config.udp_queue_size,
            dialer = self.ctx.dialer().name(),
            "Tunnel started"
        );
    }

    /// Hand an accepted TCP connection to the tunnel
    pub fn handle_tcp(&self, origin: Box<dyn TcpOrigin>) {
        self.ctx.stats.record_tcp_accepted();
        if let Err(mpsc::error::SendError(origin)) = self.tcp_tx.send(origin) {
            debug!(src = %origin.local_addr(), "[TCP] tunnel closed, dropping connection");
        }
    }

    /// Queue a UDP datagram on its shard
    ///
    /// Never blocks: when the shard is full the datagram is released and
    /// dropped.
    pub fn handle_udp(&self, packet: Arc<dyn UdpPacket>) {
        let shard = shard_index(
            packet.local_addr().port(),
            packet.remote_addr().port(),
            self.udp_txs.len(),
        );

        match self.udp_txs[shard].try_send(packet) {
            Ok(()) => self.ctx.stats.record_udp_queued(shard),
            Err(TrySendError::Full(packet)) => {
                self.ctx.stats.record_udp_dropped();
                warn!(
                    shard_id = shard,
                    src = %packet.local_addr(),
                    dst = %packet.remote_addr(),
                    "[UDP] shard queue full, dropping packet"
                );
                packet.release();
            }
            Err(TrySendError::Closed(packet)) => {
                self.ctx.stats.record_udp_dropped();
                debug!(shard_id = shard, "[UDP] tunnel closed, dropping packet");
                packet.release();
            }
        }
    }

    /// Stop all workers and drop every NAT entry
    ///
    /// Live TCP relays end as well. Idempotent.
    pub fn close(&self) {
        if self.ctx.shutdown.is_cancelled() {
            return;
        }
        self.ctx.shutdown.cancel();
        self.ctx.nat.clear();
        info!("Tunnel closed");
    }

    /// Resolves once [`Tunnel::close`] has been called
    pub async fn closed(&self) {
        self.ctx.shutdown.cancelled().await;
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.ctx.shutdown.is_cancelled()
    }

    /// Current dialer
    #[must_use]
    pub fn dialer(&self) -> Arc<dyn Dialer> {
        self.ctx.dialer()
    }

    /// Replace the dialer; flows already dialed keep their upstream
    pub fn set_dialer(&self, dialer: Arc<dyn Dialer>) {
        info!(dialer = dialer.name(), "Dialer updated");
        *self.ctx.dialer.write() = dialer;
    }

    /// UDP NAT idle timeout
    #[must_use]
    pub fn udp_timeout(&self) -> Duration {
        self.ctx.udp_timeout()
    }

    /// Change the UDP idle timeout for sessions created from now on
    pub fn set_udp_timeout(&self, timeout: Duration) {
        let ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self.ctx.udp_timeout_ms.store(ms, Ordering::Relaxed);
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<Manager> {
        &self.ctx.manager
    }

    #[must_use]
    pub fn nat(&self) -> &Arc<NatTable> {
        &self.ctx.nat
    }

    #[must_use]
    pub fn allocator(&self) -> &Arc<Allocator> {
        &self.ctx.allocator
    }

    #[must_use]
    pub fn resolver(&self) -> Option<&Arc<FakeDnsResolver>> {
        self.ctx.resolver.as_ref()
    }

    #[must_use]
    pub fn stats(&self) -> &TunnelStats {
        &self.ctx.stats
    }

    #[must_use]
    pub fn config(&self) -> &TunnelConfig {
        &self.ctx.config
    }

    /// Number of UDP shards
    #[must_use]
    pub fn shard_count(&self) -> usize {
        self.udp_txs.len()
    }
}

impl Drop for Tunnel {
    fn drop(&mut self) {
        self.ctx.shutdown.cancel();
    }
}

impl std::fmt::Debug for Tunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tunnel")
            .field("shards", &self.udp_txs.len())
            .field("nat_entries", &self.ctx.nat.len())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Spawn one task per accepted TCP connection
async fn tcp_dispatcher(ctx: Arc<Context>, mut rx: TcpQueue) {
    loop {
        let origin = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            origin = rx.recv() => match origin {
                Some(origin) => origin,
                None => break,
            },
        };
        tokio::spawn(tcp::handle(Arc::clone(&ctx), origin));
    }
    debug!("TCP dispatcher stopped");
}
