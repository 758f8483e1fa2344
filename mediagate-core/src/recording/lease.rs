use std::sync::Arc;

use dashmap::{mapref::entry::Entry, DashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LeaseState {
    Readers(usize),
    Deleting,
}

/// Read leases on segments. A leased segment is never deleted; the lease
/// is released when the [`SegmentLease`] guard is dropped.
///
/// Deletion goes through [`LeaseTable::try_reserve_delete`], which marks the
/// id so no lease can be taken until the [`DeleteGuard`] is dropped.
#[derive(Default)]
pub struct LeaseTable {
    states: DashMap<String, LeaseState>,
}

impl LeaseTable {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// `None` while the segment is being deleted.
    pub fn acquire(self: &Arc<Self>, id: &str) -> Option<SegmentLease> {
        match self.states.entry(id.to_string()) {
            Entry::Occupied(mut entry) => match entry.get_mut() {
                LeaseState::Readers(count) => *count += 1,
                LeaseState::Deleting => return None,
            },
            Entry::Vacant(entry) => {
                entry.insert(LeaseState::Readers(1));
            }
        }
        Some(SegmentLease {
            table: Arc::clone(self),
            id: id.to_string(),
        })
    }

    /// Claims `id` for deletion. `None` when it is leased or already being
    /// deleted.
    pub fn try_reserve_delete(self: &Arc<Self>, id: &str) -> Option<DeleteGuard> {
        match self.states.entry(id.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(entry) => {
                entry.insert(LeaseState::Deleting);
                Some(DeleteGuard {
                    table: Arc::clone(self),
                    id: id.to_string(),
                })
            }
        }
    }

    #[must_use]
    pub fn is_leased(&self, id: &str) -> bool {
        self.states
            .get(id)
            .is_some_and(|state| matches!(*state, LeaseState::Readers(c) if c > 0))
    }

    /// Segments with readers.
    #[must_use]
    pub fn active(&self) -> usize {
        self.states
            .iter()
            .filter(|state| matches!(*state.value(), LeaseState::Readers(_)))
            .count()
    }

    fn release(&self, id: &str) {
        self.states.remove_if_mut(id, |_, state| match state {
            LeaseState::Readers(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            LeaseState::Deleting => false,
        });
    }

    fn finish_delete(&self, id: &str) {
        self.states.remove_if(id, |_, state| *state == LeaseState::Deleting);
    }
}

#[derive(Debug)]
pub struct SegmentLease {
    table: Arc<LeaseTable>,
    id: String,
}

impl SegmentLease {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl Drop for SegmentLease {
    fn drop(&mut self) {
        self.table.release(&self.id);
    }
}

/// Exclusive claim on a segment being deleted.
#[derive(Debug)]
pub struct DeleteGuard {
    table: Arc<LeaseTable>,
    id: String,
}

impl Drop for DeleteGuard {
    fn drop(&mut self) {
        self.table.finish_delete(&self.id);
    }
}

impl std::fmt::Debug for LeaseTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseTable").field("active", &self.active()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nested_leases() {
        let table = LeaseTable::new();
        let first = table.acquire("seg").unwrap();
        let second = table.acquire("seg").unwrap();
        assert!(table.is_leased("seg"));
        drop(first);
        assert!(table.is_leased("seg"));
        drop(second);
        assert!(!table.is_leased("seg"));
        assert_eq!(table.active(), 0);
    }

    #[test]
    fn test_delete_reservation_excludes_readers() {
        let table = LeaseTable::new();

        let lease = table.acquire("seg").unwrap();
        assert!(table.try_reserve_delete("seg").is_none());
        drop(lease);

        let guard = table.try_reserve_delete("seg").unwrap();
        assert!(table.acquire("seg").is_none());
        assert!(table.try_reserve_delete("seg").is_none());
        assert!(!table.is_leased("seg"));
        drop(guard);

        assert!(table.acquire("seg").is_some());
    }
}
