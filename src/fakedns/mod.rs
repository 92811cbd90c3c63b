//! FakeDNS - fake-IP resolution for domain-based dispatch
//!
//! Queries for a name get an address from a reserved range instead of the
//! real one. When the tunnel later sees traffic to that address it maps it
//! back to the name and dials the name, so the upstream resolves it itself.
//!
//! ```text
//! client --A example.com--> FakeDnsResolver --198.18.0.3--> client
//! client --tcp 198.18.0.3:443--> Tunnel --ip_to_host--> dial example.com:443
//! ```
//!
//! ## Components
//!
//! - [`FakeIpPool`]: bounded LRU host ⇄ IP mapping over one CIDR range
//! - [`Hosts`]: static entries answered before any fake IP
//! - [`FakeDnsResolver`]: hosts, then fake answers, then upstream over TCP
//! - [`FakeDnsServer`]: UDP front end

pub mod config;
pub mod hosts;
pub mod pool;
pub mod resolver;
pub mod server;

pub use config::FakeDnsConfig;
pub use hosts::Hosts;
pub use pool::FakeIpPool;
pub use resolver::{FakeDnsResolver, FAKE_TTL, HOSTS_TTL};
pub use server::FakeDnsServer;
