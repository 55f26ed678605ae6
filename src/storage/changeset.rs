//! # Changeset and LSN Manager
//!
//! The changeset records the pages modified by the current operation so they
//! can be flushed together as one recovery unit under a single log sequence
//! number. Writing the actual recovery log is the job of an outer layer;
//! here `flush` assigns the LSN, reports the batch and clears it.
//!
//! Enlisting the same page twice is a no-op.

use hashbrown::HashSet;
use tracing::trace;

#[derive(Debug, Default)]
pub struct Changeset {
    pages: HashSet<u64>,
}

impl Changeset {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enlists a page address. Idempotent.
    pub fn put(&mut self, address: u64) {
        self.pages.insert(address);
    }

    pub fn contains(&self, address: u64) -> bool {
        self.pages.contains(&address)
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    pub fn clear(&mut self) {
        self.pages.clear();
    }

    /// Closes the current batch under `lsn` and clears it.
    pub fn flush(&mut self, lsn: u64) {
        trace!(lsn, pages = self.pages.len(), "changeset flushed");
        self.pages.clear();
    }
}

/// Hands out strictly increasing log sequence numbers.
#[derive(Debug, Default)]
pub struct LsnManager {
    current: u64,
}

impl LsnManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next(&mut self) -> u64 {
        self.current += 1;
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn put_is_idempotent() {
        let mut cs = Changeset::new();
        cs.put(16384);
        cs.put(16384);

        assert_eq!(cs.len(), 1);
        assert!(cs.contains(16384));
    }

    #[test]
    fn flush_clears_the_batch() {
        let mut cs = Changeset::new();
        cs.put(0);
        cs.put(16384);

        cs.flush(1);

        assert!(cs.is_empty());
    }

    #[test]
    fn lsn_manager_is_strictly_increasing() {
        let mut lsn = LsnManager::new();
        let a = lsn.next();
        let b = lsn.next();
        let c = lsn.next();

        assert!(a < b && b < c);
    }
}
