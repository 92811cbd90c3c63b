//! Reject dialer
//!
//! Refuses every flow. Useful as a kill switch and in tests that exercise the
//! dial-failure path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use super::traits::{Dialer, OutboundConnection, PacketConn};
use crate::error::DialError;
use crate::metadata::Metadata;

/// Reject dialer - fails every dial
#[derive(Debug, Default)]
pub struct RejectDialer {
    rejected: AtomicU64,
}

impl RejectDialer {
    /// Create a new reject dialer
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of flows refused so far
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    fn reject(&self, metadata: &Metadata) -> DialError {
        self.rejected.fetch_add(1, Ordering::Relaxed);
        debug!("Rejecting {}", metadata);
        DialError::rejected(metadata.destination_address())
    }
}

#[async_trait]
impl Dialer for RejectDialer {
    async fn dial_tcp(&self, metadata: &Metadata) -> Result<OutboundConnection, DialError> {
        Err(self.reject(metadata))
    }

    async fn dial_udp(&self, metadata: &Metadata) -> Result<Arc<dyn PacketConn>, DialError> {
        Err(self.reject(metadata))
    }

    fn name(&self) -> &str {
        "reject"
    }
}
