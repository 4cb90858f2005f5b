//! # Buffer Pool
//!
//! Size-bucketed byte buffer pool shared by the network I/O threads and the
//! poll thread.
//!
//! ## Bucket Ladder
//!
//! ```text
//! bucket:   0    1    2     3     4     5     6
//! size:    16   32   64   128   256   512  1024
//! ```
//!
//! Requests above 1024 bytes bypass the pool entirely: they are allocated
//! directly and dropped when returned.

use std::ops::Deref;

use parking_lot::Mutex;

use super::tickets::{PoolCounters, PoolStats, TicketBook};

/// Number of size classes.
pub const BUCKET_COUNT: usize = 7;

/// Size of the smallest bucket.
pub const MIN_BUCKET_SIZE: usize = 16;

/// Size of the largest bucket.
pub const MAX_BUCKET_SIZE: usize = MIN_BUCKET_SIZE << (BUCKET_COUNT - 1);

/// Default number of idle buffers retained per bucket.
const DEFAULT_MAX_PER_BUCKET: usize = 1024;

/// Returns the bucket serving a request of `len` bytes.
///
/// `None` means the request is too large to be pooled.
#[inline]
#[must_use]
pub fn bucket_index(len: usize) -> Option<usize> {
    if len <= MIN_BUCKET_SIZE {
        return Some(0);
    }
    if len > MAX_BUCKET_SIZE {
        return None;
    }
    let shift = len.next_power_of_two().trailing_zeros() - MIN_BUCKET_SIZE.trailing_zeros();
    Some(shift as usize)
}

/// Returns the byte size of a bucket.
#[inline]
#[must_use]
pub const fn bucket_size(index: usize) -> usize {
    MIN_BUCKET_SIZE << index
}

/// Maps a returned buffer's capacity back to the bucket it can serve.
///
/// A buffer fits the largest bucket whose size does not exceed its
/// capacity. Buffers that grew past the ladder no longer fit anywhere.
fn bucket_for_capacity(capacity: usize) -> Option<usize> {
    if !(MIN_BUCKET_SIZE..=MAX_BUCKET_SIZE).contains(&capacity) {
        return None;
    }
    let floor = usize::BITS - 1 - capacity.leading_zeros();
    Some((floor - MIN_BUCKET_SIZE.trailing_zeros()) as usize)
}

/// A byte buffer rented from a [`BufferPool`].
///
/// Rented buffers start empty with at least the requested capacity. They
/// may grow; a buffer that grows past the bucket ladder is discarded when
/// returned.
#[derive(Debug)]
pub struct PooledBuffer {
    data: Vec<u8>,
    /// Pool that rented this buffer (0 = never pooled).
    origin: u32,
    ticket: u64,
}

impl PooledBuffer {
    /// Wraps a buffer that did not come from any pool.
    ///
    /// Returning it to a pool is always rejected.
    #[must_use]
    pub fn unpooled(data: Vec<u8>) -> Self {
        Self {
            data,
            origin: 0,
            ticket: 0,
        }
    }

    /// Returns true if this buffer was rented from a pool bucket.
    #[inline]
    #[must_use]
    pub const fn is_pooled(&self) -> bool {
        self.origin != 0
    }

    /// Returns the written bytes.
    #[inline]
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    /// Returns the underlying vector for writing.
    #[inline]
    pub fn as_mut_vec(&mut self) -> &mut Vec<u8> {
        &mut self.data
    }

    /// Number of bytes written.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true if nothing has been written.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Allocated capacity.
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    /// Appends bytes.
    #[inline]
    pub fn extend_from_slice(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    /// Empties the buffer, keeping its capacity.
    #[inline]
    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    #[inline]
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl AsRef<[u8]> for PooledBuffer {
    #[inline]
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

/// Size-bucketed byte buffer pool.
///
/// # Thread Safety
///
/// Every bucket is its own `parking_lot` mutex over a free stack, so the
/// I/O threads (renting for received frames) and the poll thread
/// (returning after dispatch) rarely contend on the same lock.
///
/// # Example
///
/// ```rust
/// use skein_core::memory::BufferPool;
///
/// let pool = BufferPool::new();
/// let mut buffer = pool.rent(100);
/// buffer.extend_from_slice(b"hello");
/// assert!(pool.give_back(buffer));
///
/// // Warm pool: the same bucket serves the next request.
/// let again = pool.rent(100);
/// assert!(again.capacity() >= 100);
/// assert_eq!(pool.stats().reuses, 1);
/// ```
pub struct BufferPool {
    buckets: [Mutex<Vec<Vec<u8>>>; BUCKET_COUNT],
    tickets: TicketBook,
    max_per_bucket: usize,
    counters: PoolCounters,
}

impl BufferPool {
    /// Creates an empty pool with the default retention limit.
    #[must_use]
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_MAX_PER_BUCKET)
    }

    /// Creates an empty pool keeping at most `max_per_bucket` idle buffers
    /// per size class.
    #[must_use]
    pub fn with_retention(max_per_bucket: usize) -> Self {
        Self {
            buckets: std::array::from_fn(|_| Mutex::new(Vec::new())),
            tickets: TicketBook::new(),
            max_per_bucket,
            counters: PoolCounters::default(),
        }
    }

    /// Pre-allocates `count` buffers in every bucket.
    pub fn warm(&self, count: usize) {
        for (index, bucket) in self.buckets.iter().enumerate() {
            let mut free = bucket.lock();
            let target = count.min(self.max_per_bucket);
            while free.len() < target {
                free.push(Vec::with_capacity(bucket_size(index)));
            }
        }
    }

    /// Rents an empty buffer with capacity for at least `min_len` bytes.
    ///
    /// Served from the matching bucket when one is idle, freshly allocated
    /// otherwise. Requests above [`MAX_BUCKET_SIZE`] are never pooled.
    #[must_use]
    pub fn rent(&self, min_len: usize) -> PooledBuffer {
        let Some(index) = bucket_index(min_len) else {
            self.counters.rent(false);
            return PooledBuffer::unpooled(Vec::with_capacity(min_len));
        };

        let recycled = self.buckets[index].lock().pop();
        self.counters.rent(recycled.is_some());

        let mut data = recycled.unwrap_or_else(|| Vec::with_capacity(bucket_size(index)));
        data.clear();

        PooledBuffer {
            data,
            origin: self.tickets.pool_id(),
            ticket: self.tickets.issue(),
        }
    }

    /// Returns a buffer to its bucket.
    ///
    /// Returns false when the buffer is rejected (not rented from this pool,
    /// or rented before [`clear`](Self::clear)) or discarded (grew past the
    /// bucket ladder, or its bucket is full). Rejection is silent apart
    /// from the counters.
    pub fn give_back(&self, buffer: PooledBuffer) -> bool {
        if !self.tickets.redeem(buffer.origin, buffer.ticket) {
            self.counters.rejected();
            tracing::trace!(origin = buffer.origin, "rejected foreign or stale buffer");
            return false;
        }

        let Some(index) = bucket_for_capacity(buffer.data.capacity()) else {
            self.counters.discarded();
            return false;
        };

        let mut free = self.buckets[index].lock();
        if free.len() >= self.max_per_bucket {
            self.counters.discarded();
            return false;
        }
        free.push(buffer.data);
        self.counters.returned();
        true
    }

    /// Number of idle buffers in a bucket.
    #[must_use]
    pub fn available(&self, index: usize) -> usize {
        self.buckets.get(index).map_or(0, |bucket| bucket.lock().len())
    }

    /// Number of buffers currently rented out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tickets.outstanding()
    }

    /// Drops every idle buffer and forgets outstanding rentals.
    pub fn clear(&self) {
        for bucket in &self.buckets {
            bucket.lock().clear();
        }
        self.tickets.clear();
    }

    /// Returns a snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}
