//! I/O utilities for tun-dispatch
//!
//! # Allocator
//!
//! `Allocator` hands out power-of-two sized buffers from per-class lock-free
//! pools, for UDP datagrams and TCP relay buffers alike.
//!
//! # Relay
//!
//! `relay` copies both directions of a TCP flow with half-close semantics and
//! a bounded wait once one side is finished.

mod allocator;
mod half_close;
mod relay;

pub use allocator::{
    Allocator, AllocatorStats, AllocatorStatsSnapshot, PooledBuffer, MAX_BUFFER_SIZE,
    SIZE_CLASSES,
};
pub use half_close::HalfCloseStream;
pub use relay::{relay, RelayResult};

/// Size of each TCP relay buffer (20 KiB)
pub const RELAY_BUFFER_SIZE: usize = 20 << 10;

/// Largest UDP payload read from an upstream packet connection
pub const MAX_SEGMENT_SIZE: usize = (1 << 16) - 1;
