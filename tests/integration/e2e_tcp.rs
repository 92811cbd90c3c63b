//! End-to-end TCP tests
//!
//! A duplex pipe plays the stack-accepted connection; upstreams are either a
//! real loopback echo server reached through `RedirectDialer` or the
//! in-memory echo of `CountingDialer`.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use tun_dispatch::dialer::RejectDialer;
use tun_dispatch::tunnel::Tunnel;

use super::common::{addr, wait_until, CountingDialer, MockOrigin, RedirectDialer};

/// Loopback echo server; the flag flips once a client half-closes
async fn echo_server() -> (SocketAddr, Arc<AtomicBool>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    let saw_eof = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&saw_eof);

    tokio::spawn(async move {
        while let Ok((mut stream, _)) = listener.accept().await {
            let flag = Arc::clone(&flag);
            tokio::spawn(async move {
                let (mut r, mut w) = stream.split();
                let _ = tokio::io::copy(&mut r, &mut w).await;
                flag.store(true, Ordering::SeqCst);
                let _ = w.shutdown().await;
            });
        }
    });

    (local, saw_eof)
}

mod e2e_tcp_relay {
    use super::*;

    #[tokio::test]
    async fn test_echo_through_direct_dialer() {
        let (server, saw_eof) = echo_server().await;
        let dialer = Arc::new(RedirectDialer::new(server));
        let tunnel = Tunnel::builder().dialer(dialer.clone()).build().unwrap();
        tunnel.process();

        // The client believes it talks to a public web server
        let (origin, mut client) =
            MockOrigin::pair(addr("10.0.0.2:40001"), addr("93.184.216.34:80"));
        tunnel.handle_tcp(origin);

        client.write_all(b"hello tunnel").await.unwrap();
        let mut buf = [0u8; 12];
        tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
            .await
            .expect("echo timed out")
            .unwrap();
        assert_eq!(&buf, b"hello tunnel");
        assert_eq!(tunnel.manager().connection_count(), 1);
        assert_eq!(dialer.seen()[0].destination_address(), "93.184.216.34:80");
        let tracked = tunnel.manager().snapshot();
        assert_eq!(
            tracked.connections[0].metadata.destination_address(),
            "93.184.216.34:80"
        );

        // Half-close from the client propagates upstream and back
        client.shutdown().await.unwrap();
        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("origin never closed")
            .unwrap();
        assert!(rest.is_empty());
        assert!(saw_eof.load(Ordering::SeqCst));

        assert!(
            wait_until(Duration::from_secs(2), || tunnel.manager().connection_count() == 0).await
        );
        assert_eq!(tunnel.manager().upload_total(), 12);
        assert_eq!(tunnel.manager().download_total(), 12);
        assert_eq!(tunnel.stats().snapshot().tcp_accepted, 1);

        tunnel.close();
    }

    #[tokio::test]
    async fn test_many_concurrent_flows() {
        let dialer = Arc::new(CountingDialer::new());
        let tunnel = Tunnel::builder().dialer(dialer.clone()).build().unwrap();
        tunnel.process();

        let mut clients = Vec::new();
        for i in 0..32u16 {
            let (origin, client) = MockOrigin::pair(
                SocketAddr::new("10.0.0.2".parse().unwrap(), 20000 + i),
                addr("93.184.216.34:443"),
            );
            tunnel.handle_tcp(origin);
            clients.push(client);
        }

        for (i, client) in clients.iter_mut().enumerate() {
            let msg = format!("flow-{i:02}");
            client.write_all(msg.as_bytes()).await.unwrap();
            let mut buf = vec![0u8; msg.len()];
            tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut buf))
                .await
                .unwrap()
                .unwrap();
            assert_eq!(buf, msg.as_bytes());
        }

        assert_eq!(dialer.tcp_dials(), 32);
        assert_eq!(tunnel.manager().connection_count(), 32);
        tunnel.close();
    }
}

mod e2e_tcp_errors {
    use super::*;

    #[tokio::test]
    async fn test_dial_failure_closes_origin() {
        let tunnel = Tunnel::builder()
            .dialer(Arc::new(RejectDialer::new()))
            .build()
            .unwrap();
        tunnel.process();

        let (origin, mut client) =
            MockOrigin::pair(addr("10.0.0.2:40002"), addr("203.0.113.9:443"));
        tunnel.handle_tcp(origin);

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .expect("origin not closed after failed dial")
            .unwrap();
        assert!(buf.is_empty());
        assert_eq!(tunnel.stats().dial_failures(), 1);
        assert_eq!(tunnel.manager().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unspecified_destination_is_dropped() {
        let dialer = Arc::new(CountingDialer::new());
        let tunnel = Tunnel::builder().dialer(dialer.clone()).build().unwrap();
        tunnel.process();

        let (origin, mut client) = MockOrigin::pair(addr("10.0.0.2:40003"), addr("0.0.0.0:80"));
        tunnel.handle_tcp(origin);

        let mut buf = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dialer.tcp_dials(), 0);
        assert_eq!(tunnel.stats().snapshot().invalid_metadata, 1);
    }

    #[tokio::test]
    async fn test_manager_close_terminates_relay() {
        let dialer = Arc::new(CountingDialer::new());
        let tunnel = Tunnel::builder().dialer(dialer.clone()).build().unwrap();
        tunnel.process();

        let (origin, mut client) =
            MockOrigin::pair(addr("10.0.0.2:40004"), addr("198.51.100.7:8080"));
        tunnel.handle_tcp(origin);

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        client.read_exact(&mut buf).await.unwrap();

        let snapshot = tunnel.manager().snapshot();
        assert_eq!(snapshot.connections.len(), 1);
        assert_eq!(snapshot.upload_total, 4);

        assert_eq!(tunnel.manager().close_all(), 1);

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("relay survived forced close")
            .unwrap();
        assert!(
            wait_until(Duration::from_secs(2), || tunnel.manager().connection_count() == 0).await
        );
    }

    #[tokio::test]
    async fn test_tunnel_close_terminates_relay() {
        let tunnel = Tunnel::builder()
            .dialer(Arc::new(CountingDialer::new()))
            .build()
            .unwrap();
        tunnel.process();

        let (origin, mut client) =
            MockOrigin::pair(addr("10.0.0.2:40005"), addr("198.51.100.7:8080"));
        tunnel.handle_tcp(origin);
        client.write_all(b"x").await.unwrap();
        let mut one = [0u8; 1];
        client.read_exact(&mut one).await.unwrap();

        tunnel.close();

        let mut rest = Vec::new();
        tokio::time::timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .expect("relay survived tunnel close")
            .unwrap();
    }
}
