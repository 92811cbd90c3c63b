//! Error types for tun-dispatch
//!
//! This module defines the error hierarchy for the dispatch engine.
//! Errors are grouped by subsystem and each group carries a recovery hint.

use std::io;
use std::net::IpAddr;

use thiserror::Error;

/// Top-level error type for tun-dispatch
#[derive(Debug, Error)]
pub enum TunnelError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Upstream dial errors
    #[error("Dial error: {0}")]
    Dial(#[from] DialError),

    /// Flow metadata could not be resolved
    #[error("Metadata error: {0}")]
    Metadata(#[from] MetadataError),

    /// Buffer allocator misuse
    #[error("Buffer error: {0}")]
    Buffer(#[from] BufferError),

    /// Fake DNS errors
    #[error("FakeDNS error: {0}")]
    FakeDns(#[from] FakeDnsError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl TunnelError {
    /// Check if this error is recoverable (the operation may be retried)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Dial(e) => e.is_recoverable(),
            Self::Metadata(e) => e.is_recoverable(),
            Self::Buffer(e) => e.is_recoverable(),
            Self::FakeDns(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Errors returned by a [`Dialer`](crate::dialer::Dialer)
#[derive(Debug, Error)]
pub enum DialError {
    /// Connection failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectionFailed { addr: String, reason: String },

    /// Handshake or connect exceeded the deadline
    #[error("Connection to {addr} timed out after {timeout_ms}ms")]
    Timeout { addr: String, timeout_ms: u64 },

    /// The dialer refuses this destination
    #[error("Connection to {addr} rejected")]
    Rejected { addr: String },

    /// Hostname resolution failed
    #[error("Failed to resolve {host}: {reason}")]
    Resolve { host: String, reason: String },

    /// I/O error during dial
    #[error("Dial I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl DialError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionFailed { .. } => true,
            Self::Timeout { .. } => true,
            Self::Rejected { .. } => false,
            Self::Resolve { .. } => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a connection failed error
    pub fn connection_failed(addr: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::ConnectionFailed {
            addr: addr.into(),
            reason: reason.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(addr: impl Into<String>, timeout: std::time::Duration) -> Self {
        Self::Timeout {
            addr: addr.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }

    /// Create a rejected error
    pub fn rejected(addr: impl Into<String>) -> Self {
        Self::Rejected { addr: addr.into() }
    }

    /// Create a resolve error
    pub fn resolve(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Resolve {
            host: host.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised while resolving flow metadata
#[derive(Debug, Error)]
pub enum MetadataError {
    /// Neither a destination IP nor a host is present
    #[error("Metadata has no destination")]
    MissingDestination,

    /// The destination is a fake IP with no live mapping
    #[error("No host mapped to fake IP {0}")]
    FakeIpNotFound(IpAddr),
}

impl MetadataError {
    /// Metadata errors drop the flow; retrying the same flow cannot succeed
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Buffer allocator misuse
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Buffer with zero capacity
    #[error("Cannot return a zero-capacity buffer")]
    ZeroCapacity,

    /// Capacity exceeds the largest size class
    #[error("Buffer capacity {0} exceeds the largest size class")]
    TooLarge(usize),

    /// Capacity is not one of the size classes
    #[error("Buffer capacity {0} is not a power of two")]
    NotPowerOfTwo(usize),
}

impl BufferError {
    /// Buffer misuse is a programming defect
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Fake DNS errors
#[derive(Debug, Error)]
pub enum FakeDnsError {
    /// Request could not be decoded
    #[error("Invalid DNS message: {0}")]
    Parse(String),

    /// Request carries no question
    #[error("DNS message has no question")]
    EmptyQuestion,

    /// Response could not be encoded
    #[error("Failed to encode DNS response: {0}")]
    Encode(String),

    /// Every upstream server failed
    #[error("Upstream exchange failed: {0}")]
    Upstream(String),

    /// I/O error
    #[error("FakeDNS I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl FakeDnsError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Parse(_) | Self::EmptyQuestion | Self::Encode(_) => false,
            Self::Upstream(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse(msg.into())
    }

    /// Create an upstream error
    pub fn upstream(msg: impl Into<String>) -> Self {
        Self::Upstream(msg.into())
    }
}

/// Type alias for Result with `TunnelError`
pub type Result<T> = std::result::Result<T, TunnelError>;
