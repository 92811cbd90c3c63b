//! Per-key dial promise
//!
//! The first packet of a new UDP flow owns the dial. Packets racing in behind
//! it are parked on the same `DialLock`, in arrival order, and the owner
//! forwards them once the session exists.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;

use super::table::NatTable;
use crate::metadata::Metadata;
use crate::stack::UdpPacket;

/// A datagram parked behind an in-flight dial
pub struct Pending {
    pub packet: Arc<dyn UdpPacket>,
    pub metadata: Metadata,
}

impl std::fmt::Debug for Pending {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pending")
            .field("len", &self.packet.data().len())
            .field("dst", &self.metadata.destination_address())
            .finish()
    }
}

/// One-shot completion signal for an in-flight dial
///
/// Carries the queue of datagrams that arrived while the dial was running.
/// The queue closes exactly once; after that `enqueue` hands the datagram
/// back and the caller looks the session up itself.
pub struct DialLock {
    done: watch::Sender<bool>,
    /// `None` once closed
    pending: Mutex<Option<Vec<Pending>>>,
}

impl Default for DialLock {
    fn default() -> Self {
        Self::new()
    }
}

impl DialLock {
    /// Create an unresolved lock with an open queue
    #[must_use]
    pub fn new() -> Self {
        let (done, _) = watch::channel(false);
        Self {
            done,
            pending: Mutex::new(Some(Vec::new())),
        }
    }

    /// Mark the dial finished and wake every waiter
    pub fn resolve(&self) {
        self.done.send_replace(true);
    }

    /// Whether the dial has finished
    #[must_use]
    pub fn is_resolved(&self) -> bool {
        *self.done.borrow()
    }

    /// Wait until the dial finishes, successfully or not
    pub async fn wait(&self) {
        let mut rx = self.done.subscribe();
        // The sender lives as long as `self`, so this only returns once resolved
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Park a datagram behind the dial
    ///
    /// # Errors
    ///
    /// Returns the datagram unchanged when the queue is already closed.
    pub fn enqueue(&self, packet: Arc<dyn UdpPacket>, metadata: Metadata) -> Result<(), Pending> {
        let pending = Pending { packet, metadata };
        match self.pending.lock().as_mut() {
            Some(queue) => {
                queue.push(pending);
                Ok(())
            }
            None => Err(pending),
        }
    }

    /// Take everything parked so far, closing the queue when it is empty
    ///
    /// The owner calls this in a loop until it returns nothing; the empty
    /// take and the close happen under one lock, so no datagram can slip in
    /// between the last drain and the close.
    pub fn drain(&self) -> Vec<Pending> {
        let mut guard = self.pending.lock();
        match guard.as_mut() {
            Some(queue) if !queue.is_empty() => std::mem::take(queue),
            Some(_) => {
                *guard = None;
                Vec::new()
            }
            None => Vec::new(),
        }
    }

    /// Close the queue and return whatever was still parked
    pub fn close(&self) -> Vec<Pending> {
        self.pending.lock().take().unwrap_or_default()
    }

    /// Whether the queue still accepts datagrams
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.pending.lock().is_some()
    }

    /// Number of parked datagrams
    #[must_use]
    pub fn queued(&self) -> usize {
        self.pending.lock().as_ref().map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for DialLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DialLock")
            .field("resolved", &self.is_resolved())
            .field("queued", &self.queued())
            .finish()
    }
}

/// Owner side of a dial
///
/// Dropping the guard removes the lock entry from the table, closes the
/// queue and then resolves the lock, on success, failure, or panic alike.
/// Datagrams still parked at that point have no session to go to and are
/// released.
pub struct DialGuard {
    table: Arc<NatTable>,
    key: String,
    lock: Arc<DialLock>,
}

impl DialGuard {
    /// Take ownership of the dial for flow `key`
    #[must_use]
    pub fn new(table: Arc<NatTable>, key: impl Into<String>, lock: Arc<DialLock>) -> Self {
        Self {
            table,
            key: key.into(),
            lock,
        }
    }

    /// The lock this guard owns
    #[must_use]
    pub fn lock(&self) -> &Arc<DialLock> {
        &self.lock
    }
}

impl Drop for DialGuard {
    fn drop(&mut self) {
        for pending in self.lock.close() {
            pending.packet.release();
        }
        self.table.delete_lock(&self.key);
        self.lock.resolve();
    }
}
