//! End-to-end UDP tests

use std::sync::Arc;
use std::time::Duration;

use tun_dispatch::tunnel::{Tunnel, TunnelConfig};

use super::common::{addr, collect_replies, wait_until, CountingDialer, PacketSink};

fn tunnel_with(dialer: &Arc<CountingDialer>) -> Tunnel {
    let tunnel = Tunnel::builder()
        .config(TunnelConfig {
            udp_workers: Some(4),
            ..TunnelConfig::default()
        })
        .dialer(dialer.clone())
        .build()
        .unwrap();
    tunnel.process();
    tunnel
}

#[tokio::test]
async fn test_nat_entry_reused_across_datagrams() {
    let dialer = Arc::new(CountingDialer::new());
    let tunnel = tunnel_with(&dialer);
    let (sink, mut replies) = PacketSink::new();

    let src = addr("10.0.0.2:5353");
    let dst = addr("8.8.4.4:9000");

    tunnel.handle_udp(sink.packet(src, dst, b"one"));
    let first = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
    assert_eq!(first.len(), 1);

    tunnel.handle_udp(sink.packet(src, dst, b"two"));
    tunnel.handle_udp(sink.packet(src, dst, b"three"));
    let rest = collect_replies(&mut replies, 2, Duration::from_secs(5)).await;

    let payloads: Vec<_> = first.iter().chain(&rest).map(|(p, _)| p.clone()).collect();
    assert_eq!(payloads, vec![b"one".to_vec(), b"two".to_vec(), b"three".to_vec()]);
    assert_eq!(dialer.udp_dials(), 1);
    assert_eq!(tunnel.nat().len(), 1);
    assert_eq!(tunnel.stats().snapshot().udp_sessions, 1);
    tunnel.close();
}

#[tokio::test]
async fn test_full_cone_shares_session_across_destinations() {
    let dialer = Arc::new(CountingDialer::new());
    let tunnel = tunnel_with(&dialer);
    let (sink, mut replies) = PacketSink::new();

    let src = addr("10.0.0.2:6000");
    tunnel.handle_udp(sink.packet(src, addr("1.1.1.1:7000"), b"a"));
    collect_replies(&mut replies, 1, Duration::from_secs(5)).await;

    // Different destination, and a different shard, same source
    tunnel.handle_udp(sink.packet(src, addr("9.9.9.9:7001"), b"b"));
    let reply = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;

    assert_eq!(reply.len(), 1);
    assert_eq!(reply[0].1, Some(addr("9.9.9.9:7001")));
    assert_eq!(dialer.udp_dials(), 1);
    assert_eq!(tunnel.nat().len(), 1);
    tunnel.close();
}

#[tokio::test]
async fn test_replies_carry_upstream_source() {
    let dialer = Arc::new(CountingDialer::new());
    let tunnel = tunnel_with(&dialer);
    let (sink, mut replies) = PacketSink::new();

    let dst = addr("203.0.113.50:3478");
    tunnel.handle_udp(sink.packet(addr("10.0.0.3:50000"), dst, b"stun"));

    let reply = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
    assert_eq!(reply, vec![(b"stun".to_vec(), Some(dst))]);
    tunnel.close();
}

#[tokio::test]
async fn test_idle_session_expires() {
    let dialer = Arc::new(CountingDialer::new());
    let tunnel = tunnel_with(&dialer);
    tunnel.set_udp_timeout(Duration::from_millis(200));
    let (sink, mut replies) = PacketSink::new();

    let src = addr("10.0.0.4:41000");
    tunnel.handle_udp(sink.packet(src, addr("192.0.2.10:9999"), b"hi"));
    collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
    assert_eq!(tunnel.nat().len(), 1);

    assert!(wait_until(Duration::from_secs(3), || tunnel.nat().is_empty()).await);
    // The packet kept by the session reader is released on expiry
    assert!(wait_until(Duration::from_secs(1), || sink.released() == 1).await);
    assert!(dialer.conns()[0].is_closed());
    assert!(
        wait_until(Duration::from_secs(1), || tunnel.manager().connection_count() == 0).await
    );

    // The next datagram opens a fresh session
    tunnel.handle_udp(sink.packet(src, addr("192.0.2.10:9999"), b"again"));
    collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
    assert_eq!(dialer.udp_dials(), 2);
    tunnel.close();
}

#[tokio::test]
async fn test_outbound_only_flow_keeps_session() {
    let dialer = Arc::new(CountingDialer::new().silent());
    let tunnel = tunnel_with(&dialer);
    tunnel.set_udp_timeout(Duration::from_millis(300));
    let (sink, _replies) = PacketSink::new();

    // The upstream never answers; sends alone keep the session alive
    let src = addr("10.0.0.4:41001");
    let dst = addr("192.0.2.11:9999");
    for i in 0..10u8 {
        tunnel.handle_udp(sink.packet(src, dst, &[i]));
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    assert_eq!(dialer.udp_dials(), 1);
    assert_eq!(tunnel.nat().len(), 1);
    assert_eq!(dialer.conns()[0].sent().len(), 10);

    // Once the sends stop the session expires as usual
    assert!(wait_until(Duration::from_secs(3), || tunnel.nat().is_empty()).await);
    assert!(dialer.conns()[0].is_closed());
    tunnel.close();
}

#[tokio::test]
async fn test_tunnel_close_clears_sessions() {
    let dialer = Arc::new(CountingDialer::new());
    let tunnel = tunnel_with(&dialer);
    let (sink, mut replies) = PacketSink::new();

    for port in 0..5u16 {
        let src = addr(&format!("10.0.0.5:{}", 30000 + port));
        tunnel.handle_udp(sink.packet(src, addr("192.0.2.20:53000"), b"x"));
    }
    collect_replies(&mut replies, 5, Duration::from_secs(5)).await;
    assert_eq!(tunnel.nat().len(), 5);

    tunnel.close();
    assert!(tunnel.nat().is_empty());
    assert!(wait_until(Duration::from_secs(2), || sink.released() == 5).await);
    assert!(dialer.conns().iter().all(|c| c.is_closed()));
}

#[tokio::test]
async fn test_udp_dial_failure_releases_packet() {
    let dialer = Arc::new(CountingDialer::new().failing());
    let tunnel = tunnel_with(&dialer);
    let (sink, _replies) = PacketSink::new();

    let src = addr("10.0.0.6:42000");
    tunnel.handle_udp(sink.packet(src, addr("192.0.2.30:1234"), b"x"));

    assert!(wait_until(Duration::from_secs(2), || sink.released() == 1).await);
    assert!(tunnel.nat().is_empty());
    assert!(!tunnel.nat().has_lock(&src.to_string()));
    assert_eq!(tunnel.stats().dial_failures(), 1);
}
