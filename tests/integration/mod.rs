//! Integration tests for tun-dispatch
//!
//! These tests drive a real [`Tunnel`](tun_dispatch::Tunnel) through in-memory
//! stack mocks and counting dialers.
//!
//! # Test Organization
//!
//! - `common`: mock origins, packets, upstreams and dialers
//! - `e2e_tcp`: TCP relay through the tunnel, dial failures, forced close
//! - `e2e_udp`: UDP NAT reuse, reply addressing, idle expiry
//! - `nat_single_flight`: one dial per concurrent burst of a new flow
//! - `backpressure`: shard affinity, FIFO order and queue saturation
//! - `fakedns`: DNS hijack and fake-IP destinations
//!
//! # Running Tests
//!
//! ```bash
//! # Run all integration tests
//! cargo test --test integration_tests
//!
//! # Run specific test module
//! cargo test --test integration_tests single_flight
//! ```
//!
//! # Test Requirements
//!
//! - No network access; the only sockets are bound on loopback
//! - No privileges

pub mod backpressure;
pub mod common;
pub mod e2e_tcp;
pub mod e2e_udp;
pub mod fakedns;
