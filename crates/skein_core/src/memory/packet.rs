//! # Packets
//!
//! A packet is a window (`offset`, `len`) over a pooled buffer.
//!
//! ## Ownership
//!
//! ```text
//! encode ──> Packet (single writer) ──> Arc<Packet> ──> send queue(s)
//!                                                         │
//!                               last holder: recycle ─────┘──> BufferPool
//! ```

use std::sync::Arc;

use super::buffer_pool::{BufferPool, PooledBuffer};

/// A packet shared between send queues after it has been written.
pub type SharedPacket = Arc<Packet>;

/// Transient view over a pooled buffer.
#[derive(Debug)]
pub struct Packet {
    buffer: PooledBuffer,
    offset: usize,
    len: usize,
}

impl Packet {
    /// Wraps the whole written region of a buffer.
    #[must_use]
    pub fn new(buffer: PooledBuffer) -> Self {
        let len = buffer.len();
        Self {
            buffer,
            offset: 0,
            len,
        }
    }

    /// Wraps a sub-range of a buffer.
    ///
    /// Returns `Err` with the buffer when the range exceeds the written
    /// bytes, so the caller can still return it to its pool.
    pub fn with_range(buffer: PooledBuffer, offset: usize, len: usize) -> Result<Self, PooledBuffer> {
        match offset.checked_add(len) {
            Some(end) if end <= buffer.len() => Ok(Self { buffer, offset, len }),
            _ => Err(buffer),
        }
    }

    /// Copies bytes into a buffer rented from `pool`.
    #[must_use]
    pub fn copy_from(pool: &BufferPool, bytes: &[u8]) -> Self {
        let mut buffer = pool.rent(bytes.len());
        buffer.extend_from_slice(bytes);
        Self::new(buffer)
    }

    /// Returns the visible bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.buffer.as_slice()[self.offset..self.offset + self.len]
    }

    /// Offset of the view into the buffer.
    #[inline]
    #[must_use]
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Length of the view.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the view is empty.
    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Skips `count` bytes from the front of the view.
    ///
    /// Returns false (and leaves the view untouched) if fewer bytes remain.
    pub fn advance(&mut self, count: usize) -> bool {
        if count > self.len {
            return false;
        }
        self.offset += count;
        self.len -= count;
        true
    }

    /// Releases the view and yields the underlying buffer.
    #[must_use]
    pub fn into_buffer(self) -> PooledBuffer {
        self.buffer
    }

    /// Returns the underlying buffer to `pool`.
    pub fn release(self, pool: &BufferPool) -> bool {
        pool.give_back(self.buffer)
    }

    /// Drops one reference to a shared packet; the last holder returns the
    /// buffer to `pool`.
    ///
    /// Safe to call from several threads at once: exactly one of them
    /// observes the last reference.
    pub fn recycle(shared: SharedPacket, pool: &BufferPool) -> bool {
        match Arc::into_inner(shared) {
            Some(packet) => packet.release(pool),
            None => false,
        }
    }
}

impl AsRef<[u8]> for Packet {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packet_view() {
        let pool = BufferPool::new();
        let mut packet = Packet::copy_from(&pool, b"\x01\x00hello");
        assert_eq!(packet.len(), 7);

        assert!(packet.advance(2));
        assert_eq!(packet.as_slice(), b"hello");
        assert_eq!(packet.offset(), 2);
        assert!(!packet.advance(10));
        assert_eq!(packet.as_slice(), b"hello");

        assert!(packet.release(&pool));
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_concurrent_recycle_returns_buffer() {
        use std::sync::Barrier;

        let pool = Arc::new(BufferPool::new());
        for _ in 0..500 {
            let shared = Arc::new(Packet::copy_from(&pool, b"\x02\x00fan-out"));
            let barrier = Arc::new(Barrier::new(4));
            let copies: Vec<SharedPacket> = (0..4).map(|_| Arc::clone(&shared)).collect();
            drop(shared);
            let holders: Vec<_> = copies
                .into_iter()
                .map(|packet| {
                    let pool = Arc::clone(&pool);
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        barrier.wait();
                        Packet::recycle(packet, &pool)
                    })
                })
                .collect();

            let returned = holders
                .into_iter()
                .map(|holder| holder.join().unwrap())
                .filter(|returned| *returned)
                .count();
            assert_eq!(returned, 1);
        }
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn test_with_range_bounds() {
        let pool = BufferPool::new();
        let mut buffer = pool.rent(8);
        buffer.extend_from_slice(b"abcdef");

        let buffer = Packet::with_range(buffer, 4, 10).unwrap_err();
        let packet = Packet::with_range(buffer, 1, 3).unwrap();
        assert_eq!(packet.as_slice(), b"bcd");
    }

    #[test]
    fn test_last_holder_recycles() {
        let pool = BufferPool::new();
        let shared: SharedPacket = Arc::new(Packet::copy_from(&pool, b"fan-out"));
        let second = Arc::clone(&shared);

        assert!(!Packet::recycle(shared, &pool));
        assert_eq!(pool.outstanding(), 1);

        assert!(Packet::recycle(second, &pool));
        assert_eq!(pool.outstanding(), 0);
    }
}
