//! UDP flow handling
//!
//! A shard worker takes datagrams off its queue in order. For each one:
//!
//! 1. Dial in flight for the flow key: park the datagram on the dial lock.
//! 2. NAT hit: forward on the existing upstream connection.
//! 3. Miss: take the dial lock. The first packet owns the dial; once the
//!    session is stored the owner forwards its own packet and then every
//!    parked one, in arrival order, before closing the lock.
//! 4. The session reader relays upstream replies back to the client until
//!    nothing has crossed the session in either direction for the UDP
//!    timeout.
//!
//! With DNS hijack enabled, datagrams to port 53 never reach the dialer and
//! are answered by the fake-IP resolver instead.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::engine::Context;
use super::session::UdpSession;
use crate::connection::UdpTracker;
use crate::dialer::PacketConn;
use crate::fakedns::server::respond;
use crate::io::MAX_SEGMENT_SIZE;
use crate::metadata::Metadata;
use crate::nat::{DialGuard, DialLock, Pending};
use crate::stack::UdpPacket;

const DNS_PORT: u16 = 53;

/// Drain one shard queue until the tunnel closes
pub(crate) async fn worker(
    ctx: Arc<Context>,
    shard_id: usize,
    mut rx: mpsc::Receiver<Arc<dyn UdpPacket>>,
) {
    debug!(shard_id, "UDP worker started");

    loop {
        let packet = tokio::select! {
            () = ctx.shutdown.cancelled() => break,
            packet = rx.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
        };

        let held = Arc::clone(&packet);
        if AssertUnwindSafe(handle_packet(&ctx, packet))
            .catch_unwind()
            .await
            .is_err()
        {
            error!(
                shard_id,
                src = %held.local_addr(),
                dst = %held.remote_addr(),
                "[UDP] packet handler panicked"
            );
            held.release();
        }
    }

    rx.close();
    while let Ok(packet) = rx.try_recv() {
        packet.release();
    }
    debug!(shard_id, "UDP worker stopped");
}

async fn handle_packet(ctx: &Arc<Context>, packet: Arc<dyn UdpPacket>) {
    if ctx.hijack_dns && packet.remote_addr().port() == DNS_PORT {
        if let Some(resolver) = &ctx.resolver {
            let resolver = Arc::clone(resolver);
            ctx.stats.record_dns_hijacked();
            tokio::spawn(async move {
                if let Some(reply) = respond(&resolver, packet.data(), packet.local_addr()).await {
                    if let Err(e) = packet.write_back(&reply, None).await {
                        debug!(src = %packet.local_addr(), error = %e, "[UDP] DNS reply failed");
                    }
                }
                packet.release();
            });
            return;
        }
    }

    let mut metadata = Metadata::udp(packet.local_addr(), packet.remote_addr());
    if let Err(e) = ctx.resolve_metadata(&mut metadata) {
        ctx.stats.record_invalid_metadata();
        warn!(src = %metadata.source_address(), error = %e, "[UDP] invalid metadata, dropping");
        packet.release();
        return;
    }

    let key = metadata.nat_key();

    // Until its queue closes, an in-flight dial owns the flow's ordering
    let (packet, metadata) = match ctx.nat.get_lock(&key) {
        Some(lock) => match lock.enqueue(packet, metadata) {
            Ok(()) => return,
            Err(Pending { packet, metadata }) => (packet, metadata),
        },
        None => (packet, metadata),
    };

    if let Some(conn) = ctx.nat.get(&key) {
        forward(&conn, &packet, &metadata).await;
        return;
    }

    let (lock, existed) = ctx.nat.get_or_create_lock(&key);
    if existed {
        if let Err(Pending { packet, metadata }) = lock.enqueue(packet, metadata) {
            // The dial finished between the lookups
            match ctx.nat.get(&key) {
                Some(conn) => forward(&conn, &packet, &metadata).await,
                None => {
                    debug!(key = %key, "[UDP] no session after dial, dropping packet");
                    packet.release();
                }
            }
        }
        return;
    }

    let guard = DialGuard::new(Arc::clone(&ctx.nat), key.clone(), lock);
    tokio::spawn(own_dial(Arc::clone(ctx), key, guard, packet, metadata));
}

/// Forward every datagram parked behind the dial, then close its queue
async fn flush_parked(conn: &Arc<dyn PacketConn>, lock: &DialLock) {
    loop {
        let batch = lock.drain();
        if batch.is_empty() {
            break;
        }
        for Pending { packet, metadata } in batch {
            forward(conn, &packet, &metadata).await;
        }
    }
}

/// Dial the upstream for a new session and start its reader
async fn own_dial(
    ctx: Arc<Context>,
    key: String,
    guard: DialGuard,
    packet: Arc<dyn UdpPacket>,
    mut metadata: Metadata,
) {
    // An earlier dial may have completed between the miss and the lock
    if let Some(conn) = ctx.nat.get(&key) {
        forward(&conn, &packet, &metadata).await;
        flush_parked(&conn, guard.lock()).await;
        return;
    }

    let dialer = ctx.dialer();
    let upstream = match ctx.dial(&metadata, dialer.dial_udp(&metadata)).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(
                dialer = dialer.name(),
                recoverable = e.is_recoverable(),
                "[UDP] dial {} failed: {}",
                metadata.destination_address(),
                e
            );
            packet.release();
            // Parked datagrams are released with the guard
            return;
        }
    };

    if let Ok(addr) = upstream.local_addr() {
        metadata.set_mid(addr);
    }
    let metadata = Arc::new(metadata);
    let tracker = UdpTracker::new(upstream, Arc::clone(&metadata), Arc::clone(&ctx.manager));
    let cancel = tracker.info().cancel_token().clone();
    let session = Arc::new(UdpSession::new(Arc::new(tracker)));
    let conn: Arc<dyn PacketConn> = Arc::clone(&session) as Arc<dyn PacketConn>;

    ctx.nat.set(key.clone(), Arc::clone(&conn));
    ctx.stats.record_udp_session();

    info!(
        "[UDP] {} --> {}",
        metadata.source_address(),
        metadata.destination_address()
    );

    tokio::spawn(read_session(
        Arc::clone(&ctx),
        key,
        session,
        cancel,
        Arc::clone(&packet),
    ));

    // Own packet first, then the parked ones; the lock stays up until both
    // are on the wire so later arrivals queue behind them
    forward(&conn, &packet, &metadata).await;
    flush_parked(&conn, guard.lock()).await;
    drop(guard);
}

async fn forward(conn: &Arc<dyn PacketConn>, packet: &Arc<dyn UdpPacket>, metadata: &Metadata) {
    match conn.send_to(packet.data(), metadata).await {
        Ok(n) => trace!(bytes = n, dst = %metadata.destination_address(), "[UDP] forwarded"),
        Err(e) => debug!(
            dst = %metadata.destination_address(),
            error = %e,
            "[UDP] send to upstream failed"
        ),
    }
}

/// Relay upstream datagrams to the client until the session goes idle
///
/// Sends refresh the session as well, so a flow that only talks outbound
/// keeps its NAT entry.
async fn read_session(
    ctx: Arc<Context>,
    key: String,
    session: Arc<UdpSession>,
    cancel: CancellationToken,
    packet: Arc<dyn UdpPacket>,
) {
    let conn: Arc<dyn PacketConn> = Arc::clone(&session) as Arc<dyn PacketConn>;

    if let Some(mut buf) = ctx.allocator.get_pooled(MAX_SEGMENT_SIZE) {
        loop {
            let idle = ctx.udp_timeout();
            let deadline = session.idle_deadline(idle);
            let received = tokio::select! {
                () = cancel.cancelled() => break,
                () = ctx.shutdown.cancelled() => break,
                res = time::timeout_at(deadline, session.recv_from(&mut buf)) => res,
            };

            let (n, from) = match received {
                Ok(Ok(r)) => r,
                Ok(Err(e)) => {
                    debug!(key = %key, error = %e, "[UDP] upstream read ended");
                    break;
                }
                Err(_) => {
                    if session.idle_deadline(idle) > Instant::now() {
                        // Something was sent while we waited
                        continue;
                    }
                    debug!(key = %key, "[UDP] session idle for {:?}", idle);
                    break;
                }
            };

            if let Err(e) = packet.write_back(&buf[..n], Some(from)).await {
                debug!(key = %key, error = %e, "[UDP] write back failed");
                break;
            }
        }
    }

    ctx.nat.delete_if_same(&key, &conn);
    conn.close();
    packet.release();
    trace!(key = %key, "[UDP] session closed");
}
