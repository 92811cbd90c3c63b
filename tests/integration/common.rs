//! Shared fixtures for the integration suite
//!
//! In-memory stand-ins for both sides of the tunnel:
//! - `MockOrigin`: a stack TCP connection backed by `tokio::io::duplex`
//! - `MockPacket`: a stack UDP datagram that records replies and releases
//! - `CountingDialer`: counts dials and hands out echoing upstreams
//! - `RedirectDialer`: dials a fixed local address whatever the destination

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;

use tun_dispatch::dialer::{Dialer, DirectDialer, OutboundConnection, PacketConn};
use tun_dispatch::error::DialError;
use tun_dispatch::io::HalfCloseStream;
use tun_dispatch::metadata::Metadata;
use tun_dispatch::stack::{TcpOrigin, UdpPacket};

pub fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

/// Poll `cond` every 10ms until it holds or `within` elapses
pub async fn wait_until(within: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    cond()
}

// ============================================================================
// TCP origin
// ============================================================================

/// Stack-side end of a duplex pipe; the test keeps the other end
pub struct MockOrigin {
    stream: DuplexStream,
    local: SocketAddr,
    remote: SocketAddr,
}

impl MockOrigin {
    /// Returns the origin for the tunnel and the client end for the test
    pub fn pair(local: SocketAddr, remote: SocketAddr) -> (Box<dyn TcpOrigin>, DuplexStream) {
        let (client, stream) = tokio::io::duplex(64 * 1024);
        (
            Box::new(Self {
                stream,
                local,
                remote,
            }),
            client,
        )
    }
}

impl AsyncRead for MockOrigin {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for MockOrigin {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.stream).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_shutdown(cx)
    }
}

impl HalfCloseStream for MockOrigin {}

impl TcpOrigin for MockOrigin {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

// ============================================================================
// UDP packet
// ============================================================================

/// A reply written back to the client: payload and source override
pub type Reply = (Vec<u8>, Option<SocketAddr>);

/// Shared observation point for every packet of one test
#[derive(Clone)]
pub struct PacketSink {
    replies: mpsc::UnboundedSender<Reply>,
    released: Arc<AtomicUsize>,
}

impl PacketSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Reply>) {
        let (replies, rx) = mpsc::unbounded_channel();
        (
            Self {
                replies,
                released: Arc::new(AtomicUsize::new(0)),
            },
            rx,
        )
    }

    /// Number of packets released so far
    pub fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    pub fn packet(&self, src: SocketAddr, dst: SocketAddr, data: &[u8]) -> Arc<dyn UdpPacket> {
        Arc::new(MockPacket {
            data: data.to_vec(),
            src,
            dst,
            released: AtomicBool::new(false),
            sink: self.clone(),
        })
    }
}

pub struct MockPacket {
    data: Vec<u8>,
    src: SocketAddr,
    dst: SocketAddr,
    released: AtomicBool,
    sink: PacketSink,
}

#[async_trait]
impl UdpPacket for MockPacket {
    fn data(&self) -> &[u8] {
        &self.data
    }

    fn release(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.sink.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn local_addr(&self) -> SocketAddr {
        self.src
    }

    fn remote_addr(&self) -> SocketAddr {
        self.dst
    }

    async fn write_back(&self, payload: &[u8], from: Option<SocketAddr>) -> io::Result<usize> {
        self.sink
            .replies
            .send((payload.to_vec(), from))
            .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe))?;
        Ok(payload.len())
    }
}

/// Receive `n` replies or give up after `within`
pub async fn collect_replies(
    rx: &mut mpsc::UnboundedReceiver<Reply>,
    n: usize,
    within: Duration,
) -> Vec<Reply> {
    let mut out = Vec::with_capacity(n);
    let _ = tokio::time::timeout(within, async {
        while out.len() < n {
            match rx.recv().await {
                Some(reply) => out.push(reply),
                None => break,
            }
        }
    })
    .await;
    out
}

// ============================================================================
// Upstreams
// ============================================================================

/// Packet connection that answers every datagram with the same payload
///
/// Replies come from the destination the datagram was sent to. With
/// `resolved` set, hostname destinations are "resolved" to that IP and the
/// reply comes from there instead, the way a real socket would see it. A
/// silent connection records what it is sent and never answers.
pub struct EchoConn {
    tx: mpsc::UnboundedSender<(Vec<u8>, SocketAddr)>,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(Vec<u8>, SocketAddr)>>,
    sent: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
    silent: bool,
    resolved: Option<IpAddr>,
}

impl EchoConn {
    pub fn new() -> Self {
        Self::with_options(false, None)
    }

    fn with_options(silent: bool, resolved: Option<IpAddr>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            tx,
            rx: tokio::sync::Mutex::new(rx),
            sent: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            silent,
            resolved,
        }
    }

    /// Payloads received from the tunnel, in order
    pub fn sent(&self) -> Vec<Vec<u8>> {
        self.sent.lock().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PacketConn for EchoConn {
    async fn send_to(&self, buf: &[u8], dst: &Metadata) -> io::Result<usize> {
        self.sent.lock().push(buf.to_vec());
        let from = self
            .peer_addr(dst)
            .or_else(|| dst.udp_addr())
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        if !self.silent {
            let _ = self.tx.send((buf.to_vec(), from));
        }
        Ok(buf.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let mut rx = self.rx.lock().await;
        match rx.recv().await {
            Some((data, from)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                Ok((n, from))
            }
            None => Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
        }
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        Ok(addr("192.0.2.1:40000"))
    }

    fn peer_addr(&self, dst: &Metadata) -> Option<SocketAddr> {
        match (&dst.host, self.resolved) {
            (Some(_), Some(ip)) => Some(SocketAddr::new(ip, dst.dst_port)),
            (Some(_), None) => None,
            (None, _) => dst.udp_addr(),
        }
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Dialer that counts dials and records the metadata it was handed
///
/// TCP dials return an in-memory echo stream; UDP dials an [`EchoConn`].
#[derive(Default)]
pub struct CountingDialer {
    delay: Duration,
    fail: bool,
    silent: bool,
    resolved: Option<IpAddr>,
    tcp_dials: AtomicUsize,
    udp_dials: AtomicUsize,
    seen: Mutex<Vec<Metadata>>,
    conns: Mutex<Vec<Arc<EchoConn>>>,
}

impl CountingDialer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every dial for `delay` before answering
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Fail every dial
    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    /// Upstreams never answer
    pub fn silent(mut self) -> Self {
        self.silent = true;
        self
    }

    /// Upstreams resolve every hostname to `ip`
    pub fn resolving(mut self, ip: IpAddr) -> Self {
        self.resolved = Some(ip);
        self
    }

    pub fn tcp_dials(&self) -> usize {
        self.tcp_dials.load(Ordering::SeqCst)
    }

    pub fn udp_dials(&self) -> usize {
        self.udp_dials.load(Ordering::SeqCst)
    }

    /// Metadata of every dial, in order
    pub fn seen(&self) -> Vec<Metadata> {
        self.seen.lock().clone()
    }

    /// Upstream packet connections handed out so far
    pub fn conns(&self) -> Vec<Arc<EchoConn>> {
        self.conns.lock().clone()
    }

    async fn pause(&self, metadata: &Metadata) -> Result<(), DialError> {
        self.seen.lock().push(metadata.clone());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.fail {
            return Err(DialError::connection_failed(
                metadata.destination_address(),
                "refused by test dialer",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl Dialer for CountingDialer {
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<OutboundConnection, DialError> {
        self.tcp_dials.fetch_add(1, Ordering::SeqCst);
        self.pause(metadata).await?;

        let (near, mut far) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (mut r, mut w) = tokio::io::split(&mut far);
            let _ = tokio::io::copy(&mut r, &mut w).await;
            let _ = tokio::io::AsyncWriteExt::shutdown(&mut w).await;
        });
        Ok(OutboundConnection::new(Box::new(near), None))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, DialError> {
        self.udp_dials.fetch_add(1, Ordering::SeqCst);
        self.pause(metadata).await?;

        let conn = Arc::new(EchoConn::with_options(self.silent, self.resolved));
        self.conns.lock().push(Arc::clone(&conn));
        Ok(conn)
    }

    fn name(&self) -> &str {
        "counting"
    }
}

/// Dialer that sends every flow to one local address through `DirectDialer`
///
/// Lets a test address a public destination while the bytes go to a
/// loopback server. The metadata the tunnel handed over is recorded as is.
pub struct RedirectDialer {
    target: SocketAddr,
    direct: DirectDialer,
    seen: Mutex<Vec<Metadata>>,
}

impl RedirectDialer {
    pub fn new(target: SocketAddr) -> Self {
        Self {
            target,
            direct: DirectDialer::new(Duration::from_secs(2)),
            seen: Mutex::new(Vec::new()),
        }
    }

    pub fn seen(&self) -> Vec<Metadata> {
        self.seen.lock().clone()
    }

    fn redirect(&self, metadata: &Metadata) -> Metadata {
        self.seen.lock().push(metadata.clone());
        let mut redirected = metadata.clone();
        redirected.host = None;
        redirected.dst_ip = Some(self.target.ip());
        redirected.dst_port = self.target.port();
        redirected
    }
}

#[async_trait]
impl Dialer for RedirectDialer {
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<OutboundConnection, DialError> {
        let redirected = self.redirect(metadata);
        self.direct.dial_tcp(&redirected).await
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, DialError> {
        let redirected = self.redirect(metadata);
        self.direct.dial_udp(&redirected).await
    }

    fn name(&self) -> &str {
        "redirect"
    }
}
