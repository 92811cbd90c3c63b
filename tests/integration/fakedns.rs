//! Fake-IP integration: DNS hijack inside the tunnel and fake destinations

use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use tun_dispatch::fakedns::{FakeDnsConfig, FakeDnsResolver, FakeDnsServer, FAKE_TTL};
use tun_dispatch::tunnel::Tunnel;

use super::common::{addr, collect_replies, wait_until, CountingDialer, MockOrigin, PacketSink};

fn query(id: u16, name: &str, record_type: RecordType) -> Vec<u8> {
    let mut req = Message::new();
    req.set_id(id);
    req.set_message_type(MessageType::Query);
    req.set_op_code(OpCode::Query);
    req.set_recursion_desired(true);
    req.add_query(Query::query(Name::from_str(name).unwrap(), record_type));
    req.to_vec().unwrap()
}

fn answer_ip(rsp: &Message) -> IpAddr {
    match rsp.answers()[0].data() {
        Some(RData::A(a)) => IpAddr::V4(a.0),
        Some(RData::AAAA(aaaa)) => IpAddr::V6(aaaa.0),
        other => panic!("unexpected answer {other:?}"),
    }
}

fn resolver() -> Arc<FakeDnsResolver> {
    let config = FakeDnsConfig::new().with_host("router.lan", "192.168.1.1".parse().unwrap());
    Arc::new(FakeDnsResolver::new(&config).unwrap())
}

fn tunnel(dialer: &Arc<CountingDialer>, resolver: &Arc<FakeDnsResolver>, hijack: bool) -> Tunnel {
    let tunnel = Tunnel::builder()
        .dialer(dialer.clone())
        .resolver(Arc::clone(resolver))
        .hijack_dns(hijack)
        .build()
        .unwrap();
    tunnel.process();
    tunnel
}

mod dns_hijack {
    use super::*;

    #[tokio::test]
    async fn test_hijacked_query_gets_fake_answer() {
        let dialer = Arc::new(CountingDialer::new());
        let resolver = resolver();
        let tunnel = tunnel(&dialer, &resolver, true);
        let (sink, mut replies) = PacketSink::new();

        let request = query(42, "example.com.", RecordType::A);
        tunnel.handle_udp(sink.packet(addr("10.0.0.2:33000"), addr("10.0.0.1:53"), &request));

        let got = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
        assert_eq!(got.len(), 1);
        // Answered from the address the client queried
        assert_eq!(got[0].1, None);

        let rsp = Message::from_vec(&got[0].0).unwrap();
        assert_eq!(rsp.id(), 42);
        assert_eq!(rsp.answers()[0].ttl(), FAKE_TTL);
        let ip = answer_ip(&rsp);
        assert!(resolver.is_fake_ip(ip));
        assert_eq!(resolver.ip_to_host(ip).as_deref(), Some("example.com"));

        assert_eq!(dialer.udp_dials(), 0);
        assert!(tunnel.nat().is_empty());
        assert!(wait_until(Duration::from_secs(1), || sink.released() == 1).await);
        assert_eq!(tunnel.stats().snapshot().dns_hijacked, 1);
        tunnel.close();
    }

    #[tokio::test]
    async fn test_hijack_serves_static_hosts() {
        let dialer = Arc::new(CountingDialer::new());
        let resolver = resolver();
        let tunnel = tunnel(&dialer, &resolver, true);
        let (sink, mut replies) = PacketSink::new();

        let request = query(7, "router.lan.", RecordType::A);
        tunnel.handle_udp(sink.packet(addr("10.0.0.2:33001"), addr("10.0.0.1:53"), &request));

        let got = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
        let rsp = Message::from_vec(&got[0].0).unwrap();
        assert_eq!(answer_ip(&rsp), "192.168.1.1".parse::<IpAddr>().unwrap());
        tunnel.close();
    }

    #[tokio::test]
    async fn test_without_hijack_port_53_is_dialed() {
        let dialer = Arc::new(CountingDialer::new());
        let resolver = resolver();
        let tunnel = tunnel(&dialer, &resolver, false);
        let (sink, mut replies) = PacketSink::new();

        let request = query(9, "example.com.", RecordType::A);
        tunnel.handle_udp(sink.packet(addr("10.0.0.2:33002"), addr("10.0.0.1:53"), &request));

        let got = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
        // The echo upstream returns the query untouched
        assert_eq!(got[0].0, request);
        assert_eq!(dialer.udp_dials(), 1);
        tunnel.close();
    }
}

mod fake_destinations {
    use super::*;

    #[tokio::test]
    async fn test_tcp_to_fake_ip_dials_hostname() {
        let dialer = Arc::new(CountingDialer::new());
        let resolver = resolver();
        let tunnel = tunnel(&dialer, &resolver, false);

        let fake = resolver.lookup("github.com", RecordType::A).unwrap();
        let (origin, mut client) =
            MockOrigin::pair(addr("10.0.0.2:44000"), std::net::SocketAddr::new(fake, 443));
        tunnel.handle_tcp(origin);

        client.write_all(b"GET /").await.unwrap();
        let mut buf = [0u8; 5];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();

        let seen = dialer.seen();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].host.as_deref(), Some("github.com"));
        assert_eq!(seen[0].destination_address(), "github.com:443");

        let snapshot = tunnel.manager().snapshot();
        assert_eq!(
            snapshot.connections[0].metadata.host.as_deref(),
            Some("github.com")
        );
        tunnel.close();
    }

    #[tokio::test]
    async fn test_udp_to_fake_ip_replies_from_fake_address() {
        let dialer = Arc::new(CountingDialer::new());
        let resolver = resolver();
        let tunnel = tunnel(&dialer, &resolver, false);
        let (sink, mut replies) = PacketSink::new();

        let fake = resolver.lookup("quic.example", RecordType::A).unwrap();
        let dst = std::net::SocketAddr::new(fake, 443);
        tunnel.handle_udp(sink.packet(addr("10.0.0.2:44001"), dst, b"initial"));

        let got = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
        assert_eq!(got, vec![(b"initial".to_vec(), Some(dst))]);
        assert_eq!(dialer.seen()[0].host.as_deref(), Some("quic.example"));
        tunnel.close();
    }

    #[tokio::test]
    async fn test_reply_source_follows_each_destination() {
        // Hostnames resolve to a real address the client never saw
        let dialer = Arc::new(CountingDialer::new().resolving("93.184.216.34".parse().unwrap()));
        let resolver = resolver();
        let tunnel = tunnel(&dialer, &resolver, false);
        let (sink, mut replies) = PacketSink::new();

        let src = addr("10.0.0.2:44004");
        let fake = std::net::SocketAddr::new(
            resolver.lookup("example.com", RecordType::A).unwrap(),
            7000,
        );
        tunnel.handle_udp(sink.packet(src, fake, b"via-fake"));
        let first = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
        assert_eq!(first, vec![(b"via-fake".to_vec(), Some(fake))]);

        // Same session, real destination: its replies keep their own source
        let real = addr("9.9.9.9:7001");
        tunnel.handle_udp(sink.packet(src, real, b"direct"));
        let second = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
        assert_eq!(second, vec![(b"direct".to_vec(), Some(real))]);

        // And the fake destination still maps back afterwards
        tunnel.handle_udp(sink.packet(src, fake, b"again"));
        let third = collect_replies(&mut replies, 1, Duration::from_secs(5)).await;
        assert_eq!(third, vec![(b"again".to_vec(), Some(fake))]);

        assert_eq!(dialer.udp_dials(), 1);
        tunnel.close();
    }

    #[tokio::test]
    async fn test_unknown_fake_ip_is_dropped() {
        let dialer = Arc::new(CountingDialer::new());
        let resolver = resolver();
        let tunnel = tunnel(&dialer, &resolver, false);
        let (sink, _replies) = PacketSink::new();

        // Inside the pool, never handed out
        let stale = addr("198.18.200.1:443");
        tunnel.handle_udp(sink.packet(addr("10.0.0.2:44002"), stale, b"x"));
        let (origin, mut client) = MockOrigin::pair(addr("10.0.0.2:44003"), stale);
        tunnel.handle_tcp(origin);

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert!(wait_until(Duration::from_secs(1), || sink.released() == 1).await);
        assert_eq!(dialer.tcp_dials() + dialer.udp_dials(), 0);
        assert_eq!(tunnel.stats().snapshot().invalid_metadata, 2);
    }
}

mod dns_server {
    use super::*;

    #[tokio::test]
    async fn test_server_answers_over_udp() {
        let resolver = resolver();
        let server = FakeDnsServer::bind(addr("127.0.0.1:0"), Arc::clone(&resolver))
            .await
            .unwrap();
        let server_addr = server.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        tokio::spawn(server.run(shutdown.clone()));

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(&query(1, "example.org.", RecordType::A), server_addr)
            .await
            .unwrap();

        let mut buf = [0u8; 512];
        let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        let rsp = Message::from_vec(&buf[..n]).unwrap();
        let ip = answer_ip(&rsp);

        // The same mapping is visible to the tunnel side
        assert_eq!(resolver.ip_to_host(ip).as_deref(), Some("example.org"));
        shutdown.cancel();
    }
}
