//! # Object Pool
//!
//! Free-list pool for typed objects that are checked out, used and handed
//! back, such as decoded message instances.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use super::tickets::{PoolCounters, PoolStats, TicketBook};

/// Objects that can live in an [`ObjectPool`].
pub trait Poolable: Send {
    /// Creates a fresh instance for an empty pool.
    fn create() -> Self;

    /// Restores the instance to its freshly created state.
    ///
    /// Implementations should keep allocated capacity (clear vectors
    /// instead of replacing them).
    fn reset(&mut self);
}

/// An object checked out of an [`ObjectPool`].
#[derive(Debug)]
pub struct Pooled<T> {
    value: T,
    origin: u32,
    ticket: u64,
}

impl<T> Pooled<T> {
    /// Consumes the wrapper and keeps the object. It can no longer be
    /// returned to the pool.
    #[must_use]
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for Pooled<T> {
    type Target = T;

    #[inline]
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> DerefMut for Pooled<T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        &mut self.value
    }
}

/// A pool of reusable objects.
///
/// Renting moves an object out of the free list; returning validates the
/// rent ticket before the object is reset and pushed back. An object can
/// only be handed back once (the [`Pooled`] wrapper is consumed), and
/// objects from another pool or from before [`clear`](Self::clear) are
/// rejected.
pub struct ObjectPool<T> {
    free: Mutex<Vec<T>>,
    tickets: TicketBook,
    capacity: usize,
    counters: PoolCounters,
}

impl<T: Poolable> ObjectPool<T> {
    /// Creates a pool retaining at most `capacity` idle objects.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(capacity.min(64))),
            tickets: TicketBook::new(),
            capacity,
            counters: PoolCounters::default(),
        }
    }

    /// Checks out an object, reusing an idle one when available.
    #[must_use]
    pub fn rent(&self) -> Pooled<T> {
        let recycled = self.free.lock().pop();
        self.counters.rent(recycled.is_some());

        Pooled {
            value: recycled.unwrap_or_else(T::create),
            origin: self.tickets.pool_id(),
            ticket: self.tickets.issue(),
        }
    }

    /// Hands an object back.
    ///
    /// Returns false if the object was rejected or the pool is full.
    pub fn give_back(&self, pooled: Pooled<T>) -> bool {
        if !self.tickets.redeem(pooled.origin, pooled.ticket) {
            self.counters.rejected();
            return false;
        }

        let mut value = pooled.value;
        value.reset();

        let mut free = self.free.lock();
        if free.len() >= self.capacity {
            self.counters.discarded();
            return false;
        }
        free.push(value);
        self.counters.returned();
        true
    }

    /// Number of idle objects.
    #[must_use]
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    /// Number of objects currently checked out.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.tickets.outstanding()
    }

    /// Drops idle objects and forgets outstanding rentals.
    pub fn clear(&self) {
        self.free.lock().clear();
        self.tickets.clear();
    }

    /// Returns a snapshot of the pool counters.
    #[must_use]
    pub fn stats(&self) -> PoolStats {
        self.counters.snapshot()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Default)]
    struct Scratch {
        bytes: Vec<u8>,
    }

    impl Poolable for Scratch {
        fn create() -> Self {
            Self::default()
        }

        fn reset(&mut self) {
            self.bytes.clear();
        }
    }

    #[test]
    fn test_rent_and_return() {
        let pool: ObjectPool<Scratch> = ObjectPool::new(4);

        let mut obj = pool.rent();
        obj.bytes.extend_from_slice(b"abc");
        assert_eq!(pool.outstanding(), 1);

        assert!(pool.give_back(obj));
        assert_eq!(pool.outstanding(), 0);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn test_reset_keeps_capacity() {
        let pool: ObjectPool<Scratch> = ObjectPool::new(4);

        let mut obj = pool.rent();
        obj.bytes.extend_from_slice(&[1u8; 256]);
        assert!(pool.give_back(obj));

        let obj = pool.rent();
        assert!(obj.bytes.is_empty());
        assert!(obj.bytes.capacity() >= 256);
        assert_eq!(pool.stats().reuses, 1);
    }

    #[test]
    fn test_foreign_object_rejected() {
        let a: ObjectPool<Scratch> = ObjectPool::new(4);
        let b: ObjectPool<Scratch> = ObjectPool::new(4);

        let obj = b.rent();
        assert!(!a.give_back(obj));
        assert_eq!(a.available(), 0);
        assert_eq!(a.stats().rejected, 1);
    }

    #[test]
    fn test_stale_object_rejected() {
        let pool: ObjectPool<Scratch> = ObjectPool::new(4);
        let obj = pool.rent();
        pool.clear();
        assert!(!pool.give_back(obj));
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn test_no_object_handed_out_twice() {
        let pool: ObjectPool<Scratch> = ObjectPool::new(4);
        let first = pool.rent();
        assert!(pool.give_back(first));

        let mut a = pool.rent();
        let mut b = pool.rent();
        a.bytes.push(1);
        b.bytes.push(2);
        assert_eq!(a.bytes, vec![1]);
        assert_eq!(b.bytes, vec![2]);
        assert_eq!(pool.stats().reuses, 1);
    }

    #[test]
    fn test_capacity_limit() {
        let pool: ObjectPool<Scratch> = ObjectPool::new(1);
        let a = pool.rent();
        let b = pool.rent();
        assert!(pool.give_back(a));
        assert!(!pool.give_back(b));
        assert_eq!(pool.available(), 1);
    }
}
