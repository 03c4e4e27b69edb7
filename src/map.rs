//! Filepath: src/map.rs
//!
//! The ordered, case-insensitive children map of a directory node.
//!
//! A sorted in-segment vector with binary search: iteration order is the
//! ASCII-case-insensitive sort order of the child names, insertion order is
//! irrelevant, and duplicate keys cannot coexist because every insertion
//! goes through the sorted position lookup.

use crate::alloc::AllocError;
use crate::node::Node;
use crate::payload::Payload;
use crate::ptr::ShmShared;
use crate::segment::Segment;
use crate::shmstr::{ci_cmp, ShmString};
use crate::shmvec::ShmVec;

/// One child link: owning reference keyed by name.
#[repr(C)]
pub(crate) struct MapEntry<P: Payload> {
    pub(crate) key: ShmString,
    pub(crate) child: ShmShared<Node<P>>,
}

#[repr(C)]
pub(crate) struct NodeMap<P: Payload> {
    entries: ShmVec<MapEntry<P>>,
}

impl<P: Payload> NodeMap<P> {
    #[must_use]
    pub(crate) const fn new() -> Self {
        Self {
            entries: ShmVec::new(),
        }
    }

    #[inline]
    #[must_use]
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    #[must_use]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[inline]
    #[must_use]
    pub(crate) fn entries<'s>(&self, seg: &'s Segment) -> &'s [MapEntry<P>] {
        self.entries.as_slice(seg)
    }

    /// Sorted position of `name`: `Ok(idx)` when present, `Err(idx)` with
    /// the insertion point when absent. This is the `lower_bound` of the
    /// case-insensitive order.
    pub(crate) fn search(&self, seg: &Segment, name: &[u8]) -> Result<usize, usize> {
        self.entries
            .as_slice(seg)
            .binary_search_by(|e| ci_cmp(e.key.as_bytes(seg), name))
    }

    /// The child stored under `name`, if any.
    #[must_use]
    pub(crate) fn get(&self, seg: &Segment, name: &[u8]) -> Option<ShmShared<Node<P>>> {
        self.search(seg, name)
            .ok()
            .map(|idx| self.entries.as_slice(seg)[idx].child)
    }

    /// Make room for one more entry; the only fallible step of linking.
    pub(crate) fn reserve_one(&mut self, seg: &Segment) -> Result<(), AllocError> {
        self.entries.reserve_one(seg)
    }

    /// Link `child` under `key` at the sorted position `idx`
    /// (from a failed [`NodeMap::search`]), after [`NodeMap::reserve_one`].
    pub(crate) fn insert_at(
        &mut self,
        seg: &Segment,
        idx: usize,
        key: ShmString,
        child: ShmShared<Node<P>>,
    ) {
        self.entries.insert(seg, idx, MapEntry { key, child });
    }

    /// Append an entry known to sort after everything present, after
    /// [`NodeMap::reserve_one`].
    ///
    /// Used by the migration copy, which walks the source in map order.
    pub(crate) fn push_ordered(&mut self, seg: &Segment, key: ShmString, child: ShmShared<Node<P>>) {
        debug_assert!(
            self.entries.is_empty()
                || ci_cmp(
                    self.entries.as_slice(seg)[self.entries.len() - 1]
                        .key
                        .as_bytes(seg),
                    key.as_bytes(seg)
                )
                .is_lt()
        );
        let idx = self.entries.len();
        self.entries.insert(seg, idx, MapEntry { key, child });
    }

    /// Swap the child stored at `idx`, returning the previous one.
    ///
    /// The existing key is kept, so the caller owns only the returned
    /// child reference.
    pub(crate) fn replace_at(
        &mut self,
        seg: &Segment,
        idx: usize,
        child: ShmShared<Node<P>>,
    ) -> ShmShared<Node<P>> {
        // SAFETY: idx came from a successful search on this map.
        unsafe {
            let entry = self.entries.at(seg, idx);
            std::mem::replace(&mut (*entry).child, child)
        }
    }

    /// Unlink and return the entry at `idx`.
    pub(crate) fn remove_at(&mut self, seg: &Segment, idx: usize) -> MapEntry<P> {
        self.entries.remove(seg, idx)
    }

    /// Release the backing buffer.
    ///
    /// # Safety
    ///
    /// All entries must already be torn down; at most once.
    pub(crate) unsafe fn destroy(&mut self, seg: &Segment) {
        self.entries.destroy(seg);
    }
}
