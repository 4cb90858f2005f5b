//! Rent tickets and pool counters.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use parking_lot::Mutex;

/// Pool identities are process-unique so a buffer can never be accepted by
/// a pool that did not rent it.
static NEXT_POOL_ID: AtomicU32 = AtomicU32::new(1);

/// Tracks which rented objects are currently outstanding.
pub(crate) struct TicketBook {
    pool_id: u32,
    next: AtomicU64,
    outstanding: Mutex<HashSet<u64>>,
}

impl TicketBook {
    pub(crate) fn new() -> Self {
        Self {
            pool_id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            next: AtomicU64::new(1),
            outstanding: Mutex::new(HashSet::new()),
        }
    }

    #[inline]
    pub(crate) const fn pool_id(&self) -> u32 {
        self.pool_id
    }

    /// Issues a fresh ticket and marks it outstanding.
    pub(crate) fn issue(&self) -> u64 {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        self.outstanding.lock().insert(ticket);
        ticket
    }

    /// Redeems a ticket. Returns false for foreign, stale or unknown tickets.
    pub(crate) fn redeem(&self, origin: u32, ticket: u64) -> bool {
        origin == self.pool_id && self.outstanding.lock().remove(&ticket)
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding.lock().len()
    }

    /// Forgets every outstanding ticket. Objects rented before this call
    /// are rejected when returned.
    pub(crate) fn clear(&self) {
        self.outstanding.lock().clear();
    }
}

/// Snapshot of pool counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total rent calls.
    pub rents: u64,
    /// Rents served from a free list.
    pub reuses: u64,
    /// Rents that had to allocate.
    pub allocations: u64,
    /// Returns accepted back into a free list.
    pub returns: u64,
    /// Returns rejected as foreign, stale or duplicate.
    pub rejected: u64,
    /// Valid returns dropped because they no longer fit a bucket or the
    /// bucket was full.
    pub discarded: u64,
}

#[derive(Default)]
pub(crate) struct PoolCounters {
    rents: AtomicU64,
    reuses: AtomicU64,
    allocations: AtomicU64,
    returns: AtomicU64,
    rejected: AtomicU64,
    discarded: AtomicU64,
}

impl PoolCounters {
    #[inline]
    pub(crate) fn rent(&self, reused: bool) {
        self.rents.fetch_add(1, Ordering::Relaxed);
        if reused {
            self.reuses.fetch_add(1, Ordering::Relaxed);
        } else {
            self.allocations.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[inline]
    pub(crate) fn returned(&self) {
        self.returns.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn discarded(&self) {
        self.discarded.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> PoolStats {
        PoolStats {
            rents: self.rents.load(Ordering::Relaxed),
            reuses: self.reuses.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
            returns: self.returns.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}
