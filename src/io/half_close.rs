//! Half-close capability for relayed streams
//!
//! Closing the write half of any stream goes through `AsyncWrite::poll_shutdown`.
//! Closing the read half is transport specific, so it is exposed as a
//! capability with a no-op default.

use std::io;
use std::net::Shutdown;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

/// A bidirectional byte stream the relay can half-close
pub trait HalfCloseStream: AsyncRead + AsyncWrite + Unpin + Send {
    /// Stop receiving on this stream.
    ///
    /// Transports that cannot split-close keep the default, which does nothing.
    fn close_read(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl HalfCloseStream for TcpStream {
    fn close_read(&mut self) -> io::Result<()> {
        socket2::SockRef::from(&*self).shutdown(Shutdown::Read)
    }
}

impl HalfCloseStream for tokio::io::DuplexStream {}

impl<T: HalfCloseStream + ?Sized> HalfCloseStream for Box<T> {
    fn close_read(&mut self) -> io::Result<()> {
        (**self).close_read()
    }
}
