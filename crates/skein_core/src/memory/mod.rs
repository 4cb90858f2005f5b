//! # Memory Management
//!
//! Pooled buffers and objects shared between I/O threads and the poll thread.
//!
//! ## Design Philosophy
//!
//! Buffers are allocated once and recycled. During steady-state traffic:
//! - No per-message heap allocations
//! - Every rented object carries a ticket; returns are validated against it
//! - Misuse (foreign or stale returns) is rejected silently and counted

mod buffer_pool;
mod object_pool;
mod packet;
mod tickets;

pub use buffer_pool::{
    bucket_index, bucket_size, BufferPool, PooledBuffer, BUCKET_COUNT, MAX_BUCKET_SIZE,
    MIN_BUCKET_SIZE,
};
pub use object_pool::{ObjectPool, Poolable, Pooled};
pub use packet::{Packet, SharedPacket};
pub use tickets::PoolStats;
