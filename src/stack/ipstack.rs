//! `ipstack` adapter
//!
//! Pumps streams accepted by an [`ipstack::IpStack`] into a [`Tunnel`]:
//!
//! ```text
//! TUN device --> IpStack --accept--> Tcp --> Tunnel::handle_tcp
//!                                  \-> Udp --> datagrams --> Tunnel::handle_udp
//! ```
//!
//! ipstack already demultiplexes UDP per 5-tuple, so every accepted UDP
//! stream is read datagram by datagram into one reusable segment buffer.
//! Each datagram is copied into a buffer of its own size class and becomes
//! one [`UdpPacket`] whose replies go back through the stream's write half.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use ::ipstack::stream::{IpStackStream, IpStackTcpStream, IpStackUdpStream};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, WriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info, trace, warn};

use super::{TcpOrigin, UdpPacket};
use crate::config::DeviceConfig;
use crate::error::TunnelError;
use crate::io::{Allocator, HalfCloseStream, PooledBuffer, MAX_SEGMENT_SIZE};
use crate::tunnel::Tunnel;

/// Create the TUN device described by `device` and put an ipstack on it
///
/// # Errors
///
/// Returns `TunnelError::Io` when the device cannot be created, usually for
/// lack of `CAP_NET_ADMIN`.
pub fn open_stack(device: &DeviceConfig) -> Result<::ipstack::IpStack, TunnelError> {
    let mut config = tun::Configuration::default();
    config
        .name(&device.name)
        .address(device.address)
        .netmask(device.netmask)
        .mtu(i32::from(device.mtu))
        .up();

    #[cfg(target_os = "linux")]
    config.platform(|c| {
        c.packet_information(false);
    });

    let dev = tun::create_as_async(&config).map_err(|e| {
        TunnelError::Io(io::Error::other(format!(
            "create TUN device {}: {e}",
            device.name
        )))
    })?;
    info!(
        "TUN device {} up: {}/{} mtu {}",
        device.name, device.address, device.netmask, device.mtu
    );

    let mut stack_config = ::ipstack::IpStackConfig::default();
    stack_config.mtu(device.mtu);
    Ok(::ipstack::IpStack::new(stack_config, dev))
}

/// TCP connection accepted by ipstack
pub struct IpStackTcpOrigin {
    stream: IpStackTcpStream,
    local: SocketAddr,
    remote: SocketAddr,
}

impl IpStackTcpOrigin {
    /// Wrap an accepted ipstack TCP stream
    #[must_use]
    pub fn new(stream: IpStackTcpStream) -> Self {
        let local = stream.local_addr();
        let remote = stream.peer_addr();
        Self {
            stream,
            local,
            remote,
        }
    }
}

impl AsyncRead for IpStackTcpOrigin {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.stream).poll_read(cx, buf)
    }
}

impl AsyncWrite for IpStackTcpOrigin {
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

impl HalfCloseStream for IpStackTcpOrigin {}

impl TcpOrigin for IpStackTcpOrigin {
    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

/// One datagram read from an ipstack UDP stream
///
/// Holds an exact-class copy of the payload; the stream's read buffer is
/// reused for the next datagram.
pub struct IpStackUdpPacket<S = IpStackUdpStream> {
    buf: PooledBuffer,
    local: SocketAddr,
    remote: SocketAddr,
    writer: Arc<Mutex<WriteHalf<S>>>,
}

#[async_trait]
impl<S> UdpPacket for IpStackUdpPacket<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn data(&self) -> &[u8] {
        &self.buf
    }

    fn local_addr(&self) -> SocketAddr {
        self.local
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    async fn write_back(&self, payload: &[u8], from: Option<SocketAddr>) -> io::Result<usize> {
        // The stream is bound to its 5-tuple; replies always leave from `remote`
        if let Some(from) = from.filter(|f| *f != self.remote) {
            trace!(from = %from, remote = %self.remote, "ipstack reply source override ignored");
        }
        let mut writer = self.writer.lock().await;
        writer.write_all(payload).await?;
        Ok(payload.len())
    }
}

/// Copy one datagram into the smallest size class that holds it
fn datagram(allocator: &Arc<Allocator>, payload: &[u8]) -> Option<PooledBuffer> {
    let mut buf = allocator.get_pooled(payload.len())?;
    buf.copy_from_slice(payload);
    Some(buf)
}

/// Read datagrams from one UDP stream until it ends
async fn pump_udp<S>(
    stream: S,
    local: SocketAddr,
    remote: SocketAddr,
    tunnel: Arc<Tunnel>,
    allocator: Arc<Allocator>,
) where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let writer = Arc::new(Mutex::new(writer));
    let Some(mut scratch) = allocator.get_pooled(MAX_SEGMENT_SIZE) else {
        return;
    };

    loop {
        let len = match reader.read(&mut scratch).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                debug!(src = %local, dst = %remote, error = %e, "ipstack UDP stream ended");
                break;
            }
        };
        let Some(buf) = datagram(&allocator, &scratch[..len]) else {
            continue;
        };
        tunnel.handle_udp(Arc::new(IpStackUdpPacket {
            buf,
            local,
            remote,
            writer: Arc::clone(&writer),
        }));
    }
}

/// Feed every stream accepted by `stack` into `tunnel` until the tunnel closes
pub async fn serve(mut stack: ::ipstack::IpStack, tunnel: Arc<Tunnel>) {
    info!("ipstack adapter started");
    let allocator = Arc::clone(tunnel.allocator());

    loop {
        let stream = tokio::select! {
            () = tunnel.closed() => break,
            res = stack.accept() => match res {
                Ok(stream) => stream,
                Err(e) => {
                    warn!("ipstack accept error: {:?}", e);
                    // Avoid a hot loop on persistent errors
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    continue;
                }
            },
        };

        match stream {
            IpStackStream::Tcp(tcp) => tunnel.handle_tcp(Box::new(IpStackTcpOrigin::new(tcp))),
            IpStackStream::Udp(udp) => {
                let local = udp.local_addr();
                let remote = udp.peer_addr();
                tokio::spawn(pump_udp(
                    udp,
                    local,
                    remote,
                    Arc::clone(&tunnel),
                    Arc::clone(&allocator),
                ));
            }
            _ => trace!("Ignoring non TCP/UDP stream"),
        }
    }

    info!("ipstack adapter stopped");
}
