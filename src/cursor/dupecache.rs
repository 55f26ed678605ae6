//! # Duplicate Cache
//!
//! The per-cursor, ordered list of a single key's duplicates across both
//! worlds: entries backed by the B-tree's duplicate table and entries backed
//! by transaction operations. Order is user-visible.
//!
//! Callers address lines with 1-based indices (0 is the "no selection"
//! sentinel kept in the owning cursor); internal storage is 0-based. The
//! cache starts with room for eight lines inline and doubles on demand.

use smallvec::SmallVec;

use crate::txn::OpId;

/// One duplicate: either an index into the B-tree duplicate table of the
/// current key, or a transaction operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DupeLine {
    Btree { dupe_idx: u32 },
    Txn { op: OpId },
}

#[derive(Debug, Default, Clone)]
pub struct DupeCache {
    lines: SmallVec<[DupeLine; 8]>,
}

impl DupeCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// 1-based line access.
    pub fn line(&self, index: u32) -> Option<DupeLine> {
        if index == 0 {
            return None;
        }
        self.lines.get(index as usize - 1).copied()
    }

    pub fn append(&mut self, line: DupeLine) {
        self.lines.push(line);
    }

    /// 0-based positional insert; clamped to the end.
    pub fn insert(&mut self, position: usize, line: DupeLine) {
        let position = position.min(self.lines.len());
        self.lines.insert(position, line);
    }

    /// 0-based removal.
    pub fn erase(&mut self, position: usize) {
        debug_assert!(position < self.lines.len(), "dupe erase out of bounds");
        if position < self.lines.len() {
            self.lines.remove(position);
        }
    }

    /// 0-based overwrite.
    pub fn set(&mut self, position: usize, line: DupeLine) {
        debug_assert!(position < self.lines.len(), "dupe overwrite out of bounds");
        if let Some(slot) = self.lines.get_mut(position) {
            *slot = line;
        }
    }

    /// Empties the cache but keeps its storage.
    pub fn reset(&mut self) {
        self.lines.clear();
    }

    /// Releases the storage entirely.
    pub fn clear(&mut self) {
        self.lines = SmallVec::new();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn btree(i: u32) -> DupeLine {
        DupeLine::Btree { dupe_idx: i }
    }

    fn txn(op: OpId) -> DupeLine {
        DupeLine::Txn { op }
    }

    #[test]
    fn lines_are_one_indexed() {
        let mut dc = DupeCache::new();
        dc.append(btree(0));
        dc.append(txn(42));

        assert_eq!(dc.line(0), None);
        assert_eq!(dc.line(1), Some(btree(0)));
        assert_eq!(dc.line(2), Some(txn(42)));
        assert_eq!(dc.line(3), None);
    }

    #[test]
    fn insert_erase_and_set_keep_order() {
        let mut dc = DupeCache::new();
        dc.append(btree(0));
        dc.append(btree(1));
        dc.append(btree(2));

        dc.insert(1, txn(7));
        assert_eq!(dc.line(2), Some(txn(7)));
        assert_eq!(dc.count(), 4);

        dc.erase(0);
        assert_eq!(dc.line(1), Some(txn(7)));

        dc.set(0, btree(9));
        assert_eq!(dc.line(1), Some(btree(9)));
    }

    #[test]
    fn insert_past_the_end_appends() {
        let mut dc = DupeCache::new();
        dc.append(btree(0));

        dc.insert(10, txn(1));

        assert_eq!(dc.count(), 2);
        assert_eq!(dc.line(2), Some(txn(1)));
    }

    #[test]
    fn reset_keeps_capacity_clear_releases_it() {
        let mut dc = DupeCache::new();
        for i in 0..20 {
            dc.append(btree(i));
        }
        let spilled = dc.lines.spilled();
        assert!(spilled);

        dc.reset();
        assert!(dc.is_empty());
        assert!(dc.lines.capacity() >= 20);

        dc.clear();
        assert!(!dc.lines.spilled());
    }

    #[test]
    fn grows_beyond_inline_capacity() {
        let mut dc = DupeCache::new();
        for i in 0..100 {
            dc.append(btree(i));
        }
        assert_eq!(dc.count(), 100);
        assert_eq!(dc.line(100), Some(btree(99)));
    }
}
