//! Connection trackers
//!
//! A tracker wraps the upstream side of a flow and counts every byte that
//! crosses it. Reads from upstream are downloads, writes to upstream are
//! uploads. The tracker registers itself with the [`Manager`] on creation and
//! leaves exactly once, on the first close.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::manager::Manager;
use crate::dialer::PacketConn;
use crate::io::HalfCloseStream;
use crate::metadata::Metadata;

/// Shared state of one tracked flow
#[derive(Debug)]
pub struct TrackerInfo {
    id: Uuid,
    start: DateTime<Utc>,
    metadata: Arc<Metadata>,
    upload_total: AtomicU64,
    download_total: AtomicU64,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl TrackerInfo {
    /// Fresh tracker state for a flow
    #[must_use]
    pub fn new(metadata: Arc<Metadata>) -> Self {
        Self {
            id: Uuid::new_v4(),
            start: Utc::now(),
            metadata,
            upload_total: AtomicU64::new(0),
            download_total: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        }
    }

    #[must_use]
    pub const fn id(&self) -> Uuid {
        self.id
    }

    #[must_use]
    pub const fn start(&self) -> DateTime<Utc> {
        self.start
    }

    #[must_use]
    pub fn metadata(&self) -> &Arc<Metadata> {
        &self.metadata
    }

    #[must_use]
    pub fn upload_total(&self) -> u64 {
        self.upload_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn download_total(&self) -> u64 {
        self.download_total.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Cancelled when the flow is closed, by its owner or by force
    #[must_use]
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Mark closed; returns `true` only for the first caller
    pub(crate) fn close(&self) -> bool {
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.cancel.cancel();
        true
    }

    fn add_upload(&self, n: u64) {
        self.upload_total.fetch_add(n, Ordering::Relaxed);
    }

    fn add_download(&self, n: u64) {
        self.download_total.fetch_add(n, Ordering::Relaxed);
    }

    /// Serializable view for the inspection API
    #[must_use]
    pub fn snapshot(&self) -> TrackerSnapshot {
        TrackerSnapshot {
            id: self.id,
            metadata: Metadata::clone(&self.metadata),
            upload: self.upload_total(),
            download: self.download_total(),
            start: self.start,
        }
    }
}

/// Inspection view of one tracker
#[derive(Debug, Clone, Serialize)]
pub struct TrackerSnapshot {
    pub id: Uuid,
    pub metadata: Metadata,
    pub upload: u64,
    pub download: u64,
    pub start: DateTime<Utc>,
}

/// Registration handle shared by both tracker kinds
#[derive(Debug)]
struct Registration {
    info: Arc<TrackerInfo>,
    manager: Arc<Manager>,
}

impl Registration {
    fn join(metadata: Arc<Metadata>, manager: Arc<Manager>) -> Self {
        let info = Arc::new(TrackerInfo::new(metadata));
        manager.join(Arc::clone(&info));
        Self { info, manager }
    }

    fn uploaded(&self, n: usize) {
        let n = n as u64;
        self.info.add_upload(n);
        self.manager.push_uploaded(n);
    }

    fn downloaded(&self, n: usize) {
        let n = n as u64;
        self.info.add_download(n);
        self.manager.push_downloaded(n);
    }

    fn close(&self) {
        if self.info.close() {
            self.manager.leave(&self.info.id);
        }
    }
}

/// Tracked upstream stream of a TCP flow
#[derive(Debug)]
pub struct TcpTracker<S> {
    inner: S,
    reg: Registration,
}

impl<S: HalfCloseStream> TcpTracker<S> {
    /// Wrap `inner` and register it with `manager`
    pub fn new(inner: S, metadata: Arc<Metadata>, manager: Arc<Manager>) -> Self {
        Self {
            inner,
            reg: Registration::join(metadata, manager),
        }
    }

    #[must_use]
    pub fn info(&self) -> &Arc<TrackerInfo> {
        &self.reg.info
    }

    /// Deregister the flow; later calls do nothing
    pub fn close(&self) {
        self.reg.close();
    }
}

impl<S> Drop for TcpTracker<S> {
    fn drop(&mut self) {
        self.reg.close();
    }
}

impl<S: HalfCloseStream> AsyncRead for TcpTracker<S> {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let before = buf.filled().len();
        let res = Pin::new(&mut self.inner).poll_read(cx, buf);
        if let Poll::Ready(Ok(())) = res {
            let n = buf.filled().len() - before;
            if n > 0 {
                self.reg.downloaded(n);
            }
        }
        res
    }
}

impl<S: HalfCloseStream> AsyncWrite for TcpTracker<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let res = Pin::new(&mut self.inner).poll_write(cx, buf);
        if let Poll::Ready(Ok(n)) = res {
            self.reg.uploaded(n);
        }
        res
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.inner).poll_shutdown(cx)
    }
}

impl<S: HalfCloseStream> HalfCloseStream for TcpTracker<S> {
    fn close_read(&mut self) -> io::Result<()> {
        self.inner.close_read()
    }
}

/// Tracked upstream packet connection of a UDP flow
pub struct UdpTracker {
    inner: Arc<dyn PacketConn>,
    reg: Registration,
}

impl UdpTracker {
    /// Wrap `inner` and register it with `manager`
    pub fn new(inner: Arc<dyn PacketConn>, metadata: Arc<Metadata>, manager: Arc<Manager>) -> Self {
        Self {
            inner,
            reg: Registration::join(metadata, manager),
        }
    }

    #[must_use]
    pub fn info(&self) -> &Arc<TrackerInfo> {
        &self.reg.info
    }
}

impl Drop for UdpTracker {
    fn drop(&mut self) {
        self.reg.close();
    }
}

#[async_trait]
impl PacketConn for UdpTracker {
    async fn send_to(&self, buf: &[u8], dst: &Metadata) -> io::Result<usize> {
        let n = self.inner.send_to(buf, dst).await?;
        self.reg.uploaded(n);
        Ok(n)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, from) = self.inner.recv_from(buf).await?;
        self.reg.downloaded(n);
        Ok((n, from))
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    fn peer_addr(&self, dst: &Metadata) -> Option<SocketAddr> {
        self.inner.peer_addr(dst)
    }

    fn close(&self) {
        self.reg.close();
        self.inner.close();
    }
}
