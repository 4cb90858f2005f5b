//! # SKEIN Core
//!
//! Allocation-free building blocks shared by every transport:
//! - Size-bucketed [`BufferPool`] handing out reusable byte buffers
//! - Typed [`ObjectPool`] for decoded messages
//! - [`Packet`] views over pooled buffers, shareable across send queues
//! - Little-endian message [`codec`] with Pod fast paths
//!
//! ## Architecture Rules
//!
//! 1. **No per-message allocation** - buffers and messages come from pools
//! 2. **Pools are thread-safe** - I/O threads rent, the poll thread returns
//! 3. **Malformed input never panics** - decoding yields `None`/`false`
//!
//! ## Example
//!
//! ```rust
//! use skein_core::{BufferPool, Packet};
//!
//! let pool = BufferPool::new();
//! let packet = Packet::copy_from(&pool, b"hello");
//! assert_eq!(packet.as_slice(), b"hello");
//! assert!(packet.release(&pool));
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::perf)]

pub mod codec;
pub mod memory;

pub use codec::{
    decode, decode_into, encode_frame, split_frame, CodecError, CodecResult, Message,
    MessageId, MessageReader, MessageRegistry, MessageWriter,
};
pub use memory::{
    BufferPool, ObjectPool, Packet, PoolStats, Poolable, Pooled, PooledBuffer, SharedPacket,
};
