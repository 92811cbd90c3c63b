//! Bidirectional relay with half-close
//!
//! Copies bytes between the stack-side origin stream and the upstream proxy
//! stream. Each direction runs independently inside one future. When a
//! direction reaches EOF or fails, the relay shuts down the destination's
//! write half and closes the source's read half, then gives the opposite
//! direction at most `wait_timeout` to finish on its own.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::time::Sleep;
use tracing::{debug, trace};

use super::allocator::{Allocator, PooledBuffer};
use super::half_close::HalfCloseStream;

/// Outcome of a relay
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelayResult {
    /// Bytes copied from the origin to the upstream
    pub origin_to_upstream: u64,
    /// Bytes copied from the upstream to the origin
    pub upstream_to_origin: u64,
    /// The second direction was cut off by the half-close timeout
    pub timed_out: bool,
}

impl RelayResult {
    /// Total bytes relayed in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.origin_to_upstream + self.upstream_to_origin
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Copying,
    Flushing,
    ShuttingDown,
    Done,
}

/// State for one direction of transfer
struct Direction {
    buf: PooledBuffer,
    pos: usize,
    cap: usize,
    phase: Phase,
    bytes: u64,
    label: &'static str,
}

impl Direction {
    fn new(buf: PooledBuffer, label: &'static str) -> Self {
        Self {
            buf,
            pos: 0,
            cap: 0,
            phase: Phase::Copying,
            bytes: 0,
            label,
        }
    }

    fn finish_with(&mut self, err: Option<io::Error>) {
        if let Some(e) = err {
            debug!(direction = self.label, error = %e, "relay direction ended with error");
        }
        self.phase = Phase::Flushing;
    }

    fn poll_transfer<R, W>(
        &mut self,
        cx: &mut Context<'_>,
        mut reader: Pin<&mut R>,
        mut writer: Pin<&mut W>,
    ) -> Poll<()>
    where
        R: AsyncRead + ?Sized,
        W: AsyncWrite + ?Sized,
    {
        loop {
            match self.phase {
                Phase::Copying if self.pos < self.cap => {
                    match writer.as_mut().poll_write(cx, &self.buf[self.pos..self.cap]) {
                        Poll::Ready(Ok(0)) => self.finish_with(Some(io::Error::new(
                            io::ErrorKind::WriteZero,
                            "write zero bytes",
                        ))),
                        Poll::Ready(Ok(n)) => {
                            self.pos += n;
                            self.bytes += n as u64;
                            if self.pos == self.cap {
                                self.pos = 0;
                                self.cap = 0;
                            }
                        }
                        Poll::Ready(Err(e)) => self.finish_with(Some(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                Phase::Copying => {
                    let mut read_buf = ReadBuf::new(&mut self.buf);
                    match reader.as_mut().poll_read(cx, &mut read_buf) {
                        Poll::Ready(Ok(())) => {
                            let n = read_buf.filled().len();
                            if n == 0 {
                                self.finish_with(None);
                            } else {
                                self.cap = n;
                            }
                        }
                        Poll::Ready(Err(e)) => self.finish_with(Some(e)),
                        Poll::Pending => return Poll::Pending,
                    }
                }
                Phase::Flushing => match writer.as_mut().poll_flush(cx) {
                    Poll::Ready(_) => self.phase = Phase::ShuttingDown,
                    Poll::Pending => return Poll::Pending,
                },
                Phase::ShuttingDown => match writer.as_mut().poll_shutdown(cx) {
                    Poll::Ready(res) => {
                        if let Err(e) = res {
                            trace!(direction = self.label, error = %e, "write shutdown failed");
                        }
                        self.phase = Phase::Done;
                    }
                    Poll::Pending => return Poll::Pending,
                },
                Phase::Done => return Poll::Ready(()),
            }
        }
    }
}

/// Relay future over two half-closable streams
struct Relay<'a, A: ?Sized, B: ?Sized> {
    origin: &'a mut A,
    upstream: &'a mut B,
    up: Direction,
    down: Direction,
    up_done: bool,
    down_done: bool,
    wait_timeout: Duration,
    deadline: Option<Pin<Box<Sleep>>>,
}

impl<A, B> Relay<'_, A, B>
where
    A: HalfCloseStream + ?Sized,
    B: HalfCloseStream + ?Sized,
{
    fn result(&self, timed_out: bool) -> RelayResult {
        RelayResult {
            origin_to_upstream: self.up.bytes,
            upstream_to_origin: self.down.bytes,
            timed_out,
        }
    }
}

impl<A, B> Future for Relay<'_, A, B>
where
    A: HalfCloseStream + ?Sized,
    B: HalfCloseStream + ?Sized,
{
    type Output = RelayResult;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        if !this.up_done
            && this
                .up
                .poll_transfer(cx, Pin::new(&mut *this.origin), Pin::new(&mut *this.upstream))
                .is_ready()
        {
            this.up_done = true;
            if let Err(e) = this.origin.close_read() {
                trace!(error = %e, "origin close_read failed");
            }
        }

        if !this.down_done
            && this
                .down
                .poll_transfer(cx, Pin::new(&mut *this.upstream), Pin::new(&mut *this.origin))
                .is_ready()
        {
            this.down_done = true;
            if let Err(e) = this.upstream.close_read() {
                trace!(error = %e, "upstream close_read failed");
            }
        }

        if this.up_done && this.down_done {
            return Poll::Ready(this.result(false));
        }

        if this.up_done || this.down_done {
            let wait = this.wait_timeout;
            let deadline = this
                .deadline
                .get_or_insert_with(|| Box::pin(tokio::time::sleep(wait)));
            if deadline.as_mut().poll(cx).is_ready() {
                debug!(
                    wait_secs = wait.as_secs(),
                    "half-closed relay timed out waiting for peer"
                );
                return Poll::Ready(this.result(true));
            }
        }

        Poll::Pending
    }
}

/// Relay bytes between `origin` and `upstream` until both directions end
///
/// Each direction uses a `buf_size` buffer borrowed from `allocator`. Once
/// either direction finishes, the other is bounded by `wait_timeout`.
///
/// # Errors
///
/// Returns `InvalidInput` when `buf_size` is not a size the allocator serves.
pub async fn relay<A, B>(
    origin: &mut A,
    upstream: &mut B,
    allocator: &Arc<Allocator>,
    buf_size: usize,
    wait_timeout: Duration,
) -> io::Result<RelayResult>
where
    A: HalfCloseStream + ?Sized,
    B: HalfCloseStream + ?Sized,
{
    let (Some(up_buf), Some(down_buf)) = (
        allocator.get_pooled(buf_size),
        allocator.get_pooled(buf_size),
    ) else {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("invalid relay buffer size {buf_size}"),
        ));
    };

    Ok(Relay {
        origin,
        upstream,
        up: Direction::new(up_buf, "origin->upstream"),
        down: Direction::new(down_buf, "upstream->origin"),
        up_done: false,
        down_done: false,
        wait_timeout,
        deadline: None,
    }
    .await)
}
