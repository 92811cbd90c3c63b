//! NAT session table
//!
//! Maps a flow key to its live upstream packet connection. Dial locks share
//! the same map under the derived key `"<key>-lock"`, so unrelated flows never
//! contend on anything wider than a `DashMap` shard.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::lock::DialLock;
use crate::dialer::PacketConn;

/// Suffix of the lock entry derived from a flow key
const LOCK_SUFFIX: &str = "-lock";

/// A value in the NAT table
#[derive(Clone)]
enum NatEntry {
    /// Live upstream connection
    Conn(Arc<dyn PacketConn>),
    /// In-flight dial
    Lock(Arc<DialLock>),
}

/// Key of the lock entry guarding the dial for `key`
#[must_use]
pub fn lock_key(key: &str) -> String {
    format!("{key}{LOCK_SUFFIX}")
}

/// Concurrent NAT table
#[derive(Default)]
pub struct NatTable {
    entries: DashMap<String, NatEntry>,
}

impl NatTable {
    /// Create an empty table
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store the live connection for `key`, replacing any previous one
    pub fn set(&self, key: impl Into<String>, conn: Arc<dyn PacketConn>) {
        self.entries.insert(key.into(), NatEntry::Conn(conn));
    }

    /// Live connection for `key`
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Arc<dyn PacketConn>> {
        match self.entries.get(key).as_deref() {
            Some(NatEntry::Conn(conn)) => Some(Arc::clone(conn)),
            _ => None,
        }
    }

    /// Remove the connection for `key`
    pub fn delete(&self, key: &str) {
        self.entries
            .remove_if(key, |_, entry| matches!(entry, NatEntry::Conn(_)));
    }

    /// Remove the connection for `key` only if it is still `conn`
    ///
    /// A session tearing down must not evict a newer session that replaced it.
    pub fn delete_if_same(&self, key: &str, conn: &Arc<dyn PacketConn>) {
        self.entries.remove_if(key, |_, entry| {
            matches!(entry, NatEntry::Conn(current) if Arc::ptr_eq(current, conn))
        });
    }

    /// Fetch the dial lock for `key`, creating it when absent
    ///
    /// Returns the lock and whether it already existed. The check and the
    /// insert are one atomic step, so exactly one caller sees `false` per
    /// lock lifetime.
    pub fn get_or_create_lock(&self, key: &str) -> (Arc<DialLock>, bool) {
        match self.entries.entry(lock_key(key)) {
            Entry::Occupied(mut occupied) => {
                if let NatEntry::Lock(lock) = occupied.get() {
                    return (Arc::clone(lock), true);
                }
                // Lock keys only ever hold locks; heal a stray connection
                let lock = Arc::new(DialLock::new());
                occupied.insert(NatEntry::Lock(Arc::clone(&lock)));
                (lock, false)
            }
            Entry::Vacant(vacant) => {
                let lock = Arc::new(DialLock::new());
                vacant.insert(NatEntry::Lock(Arc::clone(&lock)));
                (lock, false)
            }
        }
    }

    /// Dial lock for `key`, if a dial is in flight
    #[must_use]
    pub fn get_lock(&self, key: &str) -> Option<Arc<DialLock>> {
        match self.entries.get(&lock_key(key)).as_deref() {
            Some(NatEntry::Lock(lock)) => Some(Arc::clone(lock)),
            _ => None,
        }
    }

    /// Whether a dial for `key` is in flight
    #[must_use]
    pub fn has_lock(&self, key: &str) -> bool {
        self.entries.contains_key(&lock_key(key))
    }

    /// Remove the dial lock for `key`
    pub fn delete_lock(&self, key: &str) {
        self.entries.remove(&lock_key(key));
    }

    /// Number of live sessions
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e.value(), NatEntry::Conn(_)))
            .count()
    }

    /// Whether no session is live
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close every live connection and clear the table
    pub fn clear(&self) {
        for entry in &self.entries {
            match entry.value() {
                NatEntry::Conn(conn) => conn.close(),
                NatEntry::Lock(lock) => lock.resolve(),
            }
        }
        self.entries.clear();
    }
}

impl std::fmt::Debug for NatTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatTable")
            .field("entries", &self.entries.len())
            .finish()
    }
}
