//! TCP flow handling
//!
//! One task per accepted connection: resolve metadata, dial the upstream
//! within the connect timeout, wrap it in a tracker and relay until both
//! directions end, the manager closes the flow, or the tunnel shuts down.

use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tracing::{debug, info, info_span, warn, Instrument};

use super::engine::Context;
use crate::connection::TcpTracker;
use crate::io::relay;
use crate::metadata::Metadata;
use crate::stack::TcpOrigin;

pub(crate) async fn handle(ctx: Arc<Context>, mut origin: Box<dyn TcpOrigin>) {
    let mut metadata = Metadata::tcp(origin.local_addr(), origin.remote_addr());

    if let Err(e) = ctx.resolve_metadata(&mut metadata) {
        ctx.stats.record_invalid_metadata();
        warn!(src = %metadata.source_address(), error = %e, "[TCP] invalid metadata, dropping");
        let _ = origin.shutdown().await;
        return;
    }

    let span = info_span!(
        "tcp",
        src = %metadata.source_address(),
        dst = %metadata.destination_address(),
    );
    relay_flow(ctx, origin, metadata).instrument(span).await;
}

async fn relay_flow(ctx: Arc<Context>, mut origin: Box<dyn TcpOrigin>, mut metadata: Metadata) {
    let dialer = ctx.dialer();
    let conn = match ctx.dial(&metadata, dialer.dial_tcp(&metadata)).await {
        Ok(conn) => conn,
        Err(e) => {
            warn!(
                dialer = dialer.name(),
                recoverable = e.is_recoverable(),
                "[TCP] dial {} failed: {}",
                metadata.destination_address(),
                e
            );
            let _ = origin.shutdown().await;
            return;
        }
    };

    if let Some(addr) = conn.local_addr() {
        metadata.set_mid(addr);
    }
    let metadata = Arc::new(metadata);
    let mut upstream = TcpTracker::new(
        conn.into_stream(),
        Arc::clone(&metadata),
        Arc::clone(&ctx.manager),
    );
    let cancel = upstream.info().cancel_token().clone();

    info!(
        "[TCP] {} <-> {}",
        metadata.source_address(),
        metadata.destination_address()
    );

    tokio::select! {
        res = relay(
            &mut *origin,
            &mut upstream,
            &ctx.allocator,
            ctx.config.relay_buffer_size,
            ctx.config.tcp_wait_timeout(),
        ) => match res {
            Ok(result) => debug!(
                upload = result.origin_to_upstream,
                download = result.upstream_to_origin,
                timed_out = result.timed_out,
                "[TCP] relay finished"
            ),
            Err(e) => debug!(error = %e, "[TCP] relay error"),
        },
        () = cancel.cancelled() => debug!("[TCP] closed by manager"),
        () = ctx.shutdown.cancelled() => debug!("[TCP] tunnel closing"),
    }

    upstream.close();
}
