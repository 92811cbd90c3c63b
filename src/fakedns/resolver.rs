//! Fake-IP resolver
//!
//! Answers DNS queries in three steps:
//! 1. static hosts (`A`/`AAAA`, TTL 600);
//! 2. fake `A` from the IPv4 pool, fake `AAAA` from the IPv6 pool when one is
//!    configured (TTL 1, so clients re-resolve and mappings get reused);
//! 3. anything else is exchanged over TCP with the upstream servers in
//!    order. When every upstream fails the reply is an empty `NOERROR`.
//!
//! The tunnel uses [`FakeDnsResolver::ip_to_host`] to turn a fake destination
//! back into the queried name.

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Header, Message, MessageType, OpCode, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use super::config::FakeDnsConfig;
use super::hosts::Hosts;
use super::pool::FakeIpPool;
use crate::error::{ConfigError, FakeDnsError};

/// TTL of fake answers
pub const FAKE_TTL: u32 = 1;
/// TTL of static host answers
pub const HOSTS_TTL: u32 = 600;

/// Fake-IP resolver shared by the DNS server and the tunnel
#[derive(Debug)]
pub struct FakeDnsResolver {
    pool_v4: FakeIpPool,
    pool_v6: Option<FakeIpPool>,
    hosts: Hosts,
    upstreams: Vec<SocketAddr>,
    upstream_timeout: Duration,
}

impl FakeDnsResolver {
    /// Build a resolver from configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` when the configuration or a pool is invalid.
    pub fn new(config: &FakeDnsConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let pool_v4 = FakeIpPool::new(config.ipv4_pool.into(), config.max_entries)?;
        let pool_v6 = config
            .ipv6_pool
            .map(|net| FakeIpPool::new(net.into(), config.max_entries))
            .transpose()?;

        Ok(Self {
            pool_v4,
            pool_v6,
            hosts: Hosts::new(&config.hosts),
            upstreams: config.upstreams.clone(),
            upstream_timeout: config.upstream_timeout(),
        })
    }

    /// Whether `ip` belongs to one of the fake ranges
    #[must_use]
    pub fn is_fake_ip(&self, ip: IpAddr) -> bool {
        self.pool_for(ip).is_some()
    }

    /// Host behind a fake IP
    #[must_use]
    pub fn ip_to_host(&self, ip: IpAddr) -> Option<String> {
        self.pool_for(ip)?.look_back(ip)
    }

    /// Fake address for `host` of the given family
    ///
    /// Returns `None` for `AAAA` without an IPv6 pool.
    #[must_use]
    pub fn lookup(&self, host: &str, record_type: RecordType) -> Option<IpAddr> {
        match record_type {
            RecordType::A => Some(self.pool_v4.lookup(host)),
            RecordType::AAAA => self.pool_v6.as_ref().map(|p| p.lookup(host)),
            _ => None,
        }
    }

    /// The IPv4 pool
    #[must_use]
    pub fn pool_v4(&self) -> &FakeIpPool {
        &self.pool_v4
    }

    /// The IPv6 pool, when configured
    #[must_use]
    pub fn pool_v6(&self) -> Option<&FakeIpPool> {
        self.pool_v6.as_ref()
    }

    fn pool_for(&self, ip: IpAddr) -> Option<&FakeIpPool> {
        match ip {
            IpAddr::V4(_) if self.pool_v4.contains(ip) => Some(&self.pool_v4),
            IpAddr::V6(_) => self.pool_v6.as_ref().filter(|p| p.contains(ip)),
            IpAddr::V4(_) => None,
        }
    }

    /// Resolve a wire-format query into a wire-format reply
    ///
    /// # Errors
    ///
    /// Returns `FakeDnsError` when the query cannot be decoded, has no
    /// question, or the reply cannot be encoded.
    pub async fn resolve(&self, request: &[u8]) -> Result<Vec<u8>, FakeDnsError> {
        let req = Message::from_vec(request).map_err(|e| FakeDnsError::parse(e.to_string()))?;
        let rsp = self.handle(&req).await?;
        rsp.to_vec().map_err(|e| FakeDnsError::Encode(e.to_string()))
    }

    /// Answer a decoded query
    ///
    /// # Errors
    ///
    /// Returns `FakeDnsError::EmptyQuestion` when the query has no question.
    pub async fn handle(&self, req: &Message) -> Result<Message, FakeDnsError> {
        if req.op_code() != OpCode::Query || req.message_type() != MessageType::Query {
            let mut rsp = reply_to(req);
            rsp.set_response_code(ResponseCode::NotImp);
            return Ok(rsp);
        }

        let query = req.queries().first().ok_or(FakeDnsError::EmptyQuestion)?;
        let name = query.name().clone();
        let domain = name.to_string();
        let domain = domain.trim_end_matches('.');
        let query_type = query.query_type();

        if let Some(rsp) = self.host_resolve(req, &name, domain, query_type) {
            trace!("FakeDNS hosts answer for {}", domain);
            return Ok(rsp);
        }

        if query.query_class() == DNSClass::IN {
            if let Some(ip) = self.lookup(domain, query_type) {
                debug!("FakeDNS {} {} -> {}", query_type, domain, ip);
                return Ok(answer(req, name, ip, FAKE_TTL));
            }
        }

        match self.exchange(req).await {
            Ok(rsp) => Ok(rsp),
            Err(e) => {
                debug!(error = %e, "FakeDNS {} {} unanswered", query_type, domain);
                // Empty NOERROR so the client does not retry forever
                Ok(reply_to(req))
            }
        }
    }

    fn host_resolve(
        &self,
        req: &Message,
        name: &Name,
        domain: &str,
        query_type: RecordType,
    ) -> Option<Message> {
        if self.hosts.is_empty() {
            return None;
        }
        let ip = self.hosts.search(domain)?;
        match (query_type, ip) {
            (RecordType::A, IpAddr::V4(_)) | (RecordType::AAAA, IpAddr::V6(_)) => {
                Some(answer(req, name.clone(), ip, HOSTS_TTL))
            }
            _ => None,
        }
    }

    /// Forward to the upstreams, first answer wins
    ///
    /// # Errors
    ///
    /// Returns `FakeDnsError::Upstream` when no upstream answered.
    async fn exchange(&self, req: &Message) -> Result<Message, FakeDnsError> {
        let bytes = req.to_vec().map_err(|e| FakeDnsError::Encode(e.to_string()))?;

        let mut last = String::from("no upstream configured");
        for upstream in &self.upstreams {
            match tokio::time::timeout(self.upstream_timeout, exchange_tcp(*upstream, &bytes)).await {
                Ok(Ok(mut rsp)) => {
                    rsp.set_id(req.id());
                    trace!("FakeDNS upstream {} answered", upstream);
                    return Ok(rsp);
                }
                Ok(Err(e)) => {
                    debug!("FakeDNS upstream {} failed: {}", upstream, e);
                    last = format!("{upstream}: {e}");
                }
                Err(_) => {
                    debug!("FakeDNS upstream {} timed out", upstream);
                    last = format!("{upstream}: timed out");
                }
            }
        }
        Err(FakeDnsError::upstream(last))
    }
}

/// One DNS-over-TCP exchange (RFC 1035 §4.2.2 length framing)
async fn exchange_tcp(upstream: SocketAddr, request: &[u8]) -> io::Result<Message> {
    let len = u16::try_from(request.len())
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "DNS query too large"))?;

    let mut stream = TcpStream::connect(upstream).await?;
    let mut framed = Vec::with_capacity(request.len() + 2);
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(request);
    stream.write_all(&framed).await?;

    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let mut body = vec![0u8; usize::from(u16::from_be_bytes(len_buf))];
    stream.read_exact(&mut body).await?;

    Message::from_vec(&body).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

/// Empty reply echoing the request's header and questions
fn reply_to(req: &Message) -> Message {
    let mut rsp = Message::new();
    let mut header = Header::response_from_request(req.header());
    header.set_recursion_available(true);
    rsp.set_header(header);
    rsp.add_queries(req.queries().iter().cloned());
    rsp
}

fn answer(req: &Message, name: Name, ip: IpAddr, ttl: u32) -> Message {
    let rdata = match ip {
        IpAddr::V4(v4) => RData::A(A(v4)),
        IpAddr::V6(v6) => RData::AAAA(AAAA(v6)),
    };
    let mut record = Record::from_rdata(name, ttl, rdata);
    record.set_dns_class(DNSClass::IN);

    let mut rsp = reply_to(req);
    rsp.add_answer(record);
    rsp
}
