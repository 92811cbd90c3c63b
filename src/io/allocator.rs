//! Size-classed buffer allocator
//!
//! Buffers are grouped into 17 power-of-two size classes from 1 byte up to
//! 64 KiB. Each class has its own lock-free free-list built on
//! `crossbeam-queue::SegQueue`, so `get`/`put` from many workers never contend
//! on a shared lock. The pools are caches, not limits: an empty class simply
//! allocates a fresh buffer of exactly the class size.
//!
//! # Example
//!
//! ```
//! use tun_dispatch::io::Allocator;
//!
//! let alloc = Allocator::new();
//!
//! let buf = alloc.get(1500).unwrap();
//! assert_eq!(buf.len(), 1500);
//! assert_eq!(buf.capacity(), 2048);
//!
//! alloc.put(buf).unwrap();
//! assert_eq!(alloc.stats().returns(), 1);
//! ```

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::SegQueue;
use serde::Serialize;

use crate::error::BufferError;

/// Number of size classes (2^0 ..= 2^16)
pub const SIZE_CLASSES: usize = 17;

/// Largest buffer the allocator hands out
pub const MAX_BUFFER_SIZE: usize = 1 << (SIZE_CLASSES - 1);

/// Statistics for the allocator
#[derive(Debug, Default)]
pub struct AllocatorStats {
    /// Fresh allocations (class pool was empty)
    allocations: AtomicU64,
    /// Buffers served from a class pool
    reuses: AtomicU64,
    /// Buffers accepted back by `put`
    returns: AtomicU64,
    /// Buffers refused by `put`
    rejected: AtomicU64,
}

impl AllocatorStats {
    /// Get the number of allocations
    #[must_use]
    pub fn allocations(&self) -> u64 {
        self.allocations.load(Ordering::Relaxed)
    }

    /// Get the number of reuses
    #[must_use]
    pub fn reuses(&self) -> u64 {
        self.reuses.load(Ordering::Relaxed)
    }

    /// Get the number of accepted returns
    #[must_use]
    pub fn returns(&self) -> u64 {
        self.returns.load(Ordering::Relaxed)
    }

    /// Get the number of rejected returns
    #[must_use]
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Get a snapshot of all counters
    #[must_use]
    pub fn snapshot(&self) -> AllocatorStatsSnapshot {
        AllocatorStatsSnapshot {
            allocations: self.allocations(),
            reuses: self.reuses(),
            returns: self.returns(),
            rejected: self.rejected(),
        }
    }
}

/// Snapshot of allocator statistics
#[derive(Debug, Clone, Copy, Serialize)]
pub struct AllocatorStatsSnapshot {
    pub allocations: u64,
    pub reuses: u64,
    pub returns: u64,
    pub rejected: u64,
}

impl AllocatorStatsSnapshot {
    /// Fraction of `get` calls served from a pool, as a percentage
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn reuse_rate(&self) -> f64 {
        let total = self.allocations + self.reuses;
        if total == 0 {
            0.0
        } else {
            (self.reuses as f64 / total as f64) * 100.0
        }
    }
}

/// Size-classed buffer allocator
#[derive(Debug)]
pub struct Allocator {
    pools: [SegQueue<Vec<u8>>; SIZE_CLASSES],
    stats: AllocatorStats,
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl Allocator {
    /// Create an allocator with empty class pools
    #[must_use]
    pub fn new() -> Self {
        Self {
            pools: std::array::from_fn(|_| SegQueue::new()),
            stats: AllocatorStats::default(),
        }
    }

    /// Get a buffer of exactly `size` bytes
    ///
    /// The capacity is the smallest power of two that fits `size`. Returns
    /// `None` when `size` is zero or larger than [`MAX_BUFFER_SIZE`]; the
    /// call never blocks.
    #[must_use]
    pub fn get(&self, size: usize) -> Option<Vec<u8>> {
        if size == 0 || size > MAX_BUFFER_SIZE {
            return None;
        }

        let class = class_index(size);
        let mut buf = if let Some(buf) = self.pools[class].pop() {
            self.stats.reuses.fetch_add(1, Ordering::Relaxed);
            buf
        } else {
            self.stats.allocations.fetch_add(1, Ordering::Relaxed);
            Vec::with_capacity(1 << class)
        };

        buf.resize(size, 0);
        Some(buf)
    }

    /// Return a buffer to its class pool
    ///
    /// # Errors
    ///
    /// Returns `BufferError` when the capacity is zero, larger than
    /// [`MAX_BUFFER_SIZE`], or not a power of two. Such buffers did not come
    /// from this allocator and are dropped.
    pub fn put(&self, mut buf: Vec<u8>) -> Result<(), BufferError> {
        let cap = buf.capacity();
        let err = if cap == 0 {
            Some(BufferError::ZeroCapacity)
        } else if cap > MAX_BUFFER_SIZE {
            Some(BufferError::TooLarge(cap))
        } else if !cap.is_power_of_two() {
            Some(BufferError::NotPowerOfTwo(cap))
        } else {
            None
        };

        if let Some(err) = err {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        buf.clear();
        self.pools[msb(cap)].push(buf);
        self.stats.returns.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Get a buffer that returns itself to this allocator on drop
    #[must_use]
    pub fn get_pooled(self: &Arc<Self>, size: usize) -> Option<PooledBuffer> {
        self.get(size).map(|buf| PooledBuffer {
            buffer: Some(buf),
            allocator: Arc::clone(self),
        })
    }

    /// Number of idle buffers cached for the class that serves `size`
    #[must_use]
    pub fn available(&self, size: usize) -> usize {
        if size == 0 || size > MAX_BUFFER_SIZE {
            return 0;
        }
        self.pools[class_index(size)].len()
    }

    /// Get allocator statistics
    #[must_use]
    pub fn stats(&self) -> &AllocatorStats {
        &self.stats
    }
}

/// Index of the most significant set bit. `n` must be non-zero.
#[inline]
fn msb(n: usize) -> usize {
    (usize::BITS - 1 - n.leading_zeros()) as usize
}

/// Size class serving a request of `size` bytes
#[inline]
fn class_index(size: usize) -> usize {
    let bit = msb(size);
    if size == 1 << bit {
        bit
    } else {
        bit + 1
    }
}

/// A buffer borrowed from an [`Allocator`]
///
/// Returned to its class pool when dropped.
#[derive(Debug)]
pub struct PooledBuffer {
    buffer: Option<Vec<u8>>,
    allocator: Arc<Allocator>,
}

impl PooledBuffer {
    /// Capacity of the underlying buffer
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.as_ref().map_or(0, Vec::capacity)
    }

    /// Take the buffer out without returning it to the allocator
    #[must_use]
    pub fn into_vec(mut self) -> Vec<u8> {
        self.buffer.take().unwrap_or_default()
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buffer.take() {
            // Buffers handed out by `get` always have a class capacity.
            let _ = self.allocator.put(buf);
        }
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        self.buffer.as_ref().map_or(&[], Vec::as_slice)
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.buffer.as_mut().map_or(&mut [], Vec::as_mut_slice)
    }
}
