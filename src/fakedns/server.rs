//! FakeDNS UDP server
//!
//! Serves the fake-IP resolver over UDP. Each query is answered on its own
//! task, so a slow upstream exchange never stalls fake answers.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, ResponseCode};
use tokio::net::UdpSocket;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace};

use super::resolver::FakeDnsResolver;
use crate::error::FakeDnsError;

/// Largest DNS message accepted over UDP (EDNS ceiling)
const MAX_DNS_MESSAGE: usize = 65535;

/// FakeDNS UDP server
pub struct FakeDnsServer {
    socket: Arc<UdpSocket>,
    resolver: Arc<FakeDnsResolver>,
}

impl FakeDnsServer {
    /// Bind to the given address and create a new UDP server
    ///
    /// # Errors
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr, resolver: Arc<FakeDnsResolver>) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self {
            socket: Arc::new(socket),
            resolver,
        })
    }

    /// Get the local address of the server
    ///
    /// # Errors
    /// Returns an error if the socket address cannot be read.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Run the server loop until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        if let Ok(addr) = self.local_addr() {
            info!("FakeDNS server listening on udp://{}", addr);
        }
        let mut buffer = vec![0u8; MAX_DNS_MESSAGE];

        loop {
            let (n, peer_addr) = tokio::select! {
                () = shutdown.cancelled() => break,
                res = self.socket.recv_from(&mut buffer) => match res {
                    Ok(r) => r,
                    Err(err) => {
                        error!("FakeDNS UDP recv error: {}", err);
                        time::sleep(Duration::from_secs(1)).await;
                        continue;
                    }
                },
            };

            trace!("FakeDNS UDP received {} bytes from {}", n, peer_addr);

            let request = buffer[..n].to_vec();
            let socket = Arc::clone(&self.socket);
            let resolver = Arc::clone(&self.resolver);
            tokio::spawn(async move {
                let Some(response) = respond(&resolver, &request, peer_addr).await else {
                    return;
                };
                if let Err(err) = socket.send_to(&response, peer_addr).await {
                    debug!("FakeDNS UDP send error to {}: {}", peer_addr, err);
                }
            });
        }

        info!("FakeDNS server stopped");
    }
}

/// Reply bytes for one request, `SERVFAIL` when resolution fails
pub(crate) async fn respond(
    resolver: &FakeDnsResolver,
    request: &[u8],
    peer_addr: SocketAddr,
) -> Option<Vec<u8>> {
    match resolver.resolve(request).await {
        Ok(rsp) => Some(rsp),
        Err(FakeDnsError::Parse(err)) => {
            debug!("FakeDNS parse error from {}: {}", peer_addr, err);
            None
        }
        Err(err) => {
            error!("FakeDNS request error from {}: {}", peer_addr, err);
            let req = Message::from_vec(request).ok()?;
            Message::error_msg(req.id(), req.op_code(), ResponseCode::ServFail)
                .to_vec()
                .ok()
        }
    }
}
