//! Connection id allocation.

use std::collections::BTreeSet;

use crate::connection::ConnectionId;

/// Hands out the smallest free id, starting at 1.
#[derive(Debug)]
pub(crate) struct IdAllocator {
    next: u32,
    free: BTreeSet<u32>,
}

impl IdAllocator {
    pub(crate) fn new() -> Self {
        Self {
            next: 1,
            free: BTreeSet::new(),
        }
    }

    pub(crate) fn allocate(&mut self) -> ConnectionId {
        if let Some(id) = self.free.pop_first() {
            return ConnectionId(id);
        }
        let id = self.next;
        self.next += 1;
        ConnectionId(id)
    }

    /// Makes `id` available again. Ids this allocator never issued are
    /// ignored.
    pub(crate) fn release(&mut self, id: ConnectionId) -> bool {
        if id.0 == 0 || id.0 >= self.next {
            return false;
        }
        self.free.insert(id.0)
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smallest_free_id_reused() {
        let mut ids = IdAllocator::new();
        let a = ids.allocate();
        let b = ids.allocate();
        let c = ids.allocate();
        assert_eq!((a.0, b.0, c.0), (1, 2, 3));

        assert!(ids.release(c));
        assert!(ids.release(a));
        assert!(!ids.release(a));
        assert_eq!(ids.allocate(), ConnectionId(1));
        assert_eq!(ids.allocate(), ConnectionId(3));
        assert_eq!(ids.allocate(), ConnectionId(4));
    }

    #[test]
    fn test_foreign_ids_ignored() {
        let mut ids = IdAllocator::new();
        assert!(!ids.release(ConnectionId::SERVER));
        assert!(!ids.release(ConnectionId(10)));
    }
}
