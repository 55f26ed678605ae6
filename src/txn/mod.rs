//! # Transaction Overlay
//!
//! Uncommitted (and committed-but-not-yet-flushed) operations live in an
//! ordered overlay tree keyed like the B-tree. Each key holds its operation
//! list from oldest to newest; the merge cursor replays these lists over
//! the persistent duplicates to produce the user-visible view.
//!
//! ## Visibility
//!
//! An operation is *effective* for a reader when its transaction is
//! committed or is the reader's own. Operations of aborted transactions are
//! skipped everywhere. An operation of a foreign transaction that is still
//! active makes the whole key conflicted: readers surface `TxnConflict`
//! until that transaction settles.
//!
//! ## Key Order
//!
//! The overlay orders keys byte-lexicographically, matching the default
//! B-tree comparator. The two sides of the merge cursor must agree on
//! ordering, which is why the database does not combine the overlay with a
//! custom comparator.

pub mod cursor;

pub use cursor::TxnCursor;

use std::collections::BTreeMap;

use hashbrown::HashMap;

use crate::config::DupePosition;
use crate::error::{Error, Result};

pub type TxnId = u64;
pub type OpId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Insert, overwriting all duplicates of the key.
    Insert,
    /// Overwrite one referenced duplicate, or everything when unreferenced.
    InsertOverwrite,
    /// Insert an additional duplicate at the encoded position.
    InsertDuplicate(DupePosition),
    /// Erase one referenced duplicate, or the whole key when unreferenced.
    Erase,
    Nop,
}

impl OpKind {
    pub fn is_insert(self) -> bool {
        matches!(
            self,
            OpKind::Insert | OpKind::InsertOverwrite | OpKind::InsertDuplicate(_)
        )
    }
}

#[derive(Debug)]
pub struct TxnOp {
    pub id: OpId,
    pub txn: TxnId,
    pub kind: OpKind,
    /// 1-based duplicate position this operation refers to; 0 = the whole
    /// key.
    pub referenced_dupe: u32,
    pub record: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct TxnNode {
    /// Oldest first.
    ops: Vec<TxnOp>,
}

impl TxnNode {
    pub fn ops(&self) -> &[TxnOp] {
        &self.ops
    }
}

/// What a key looks like through the overlay, for a given reader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    /// No effective operations; the overlay says nothing about the key.
    Absent,
    /// A foreign active transaction owns the newest operation.
    Conflict(OpId),
    /// The newest effective operation erases the key.
    Erased(OpId),
    /// The newest effective operation inserts; its id is the access path to
    /// the record.
    Present(OpId),
}

#[derive(Debug, Default)]
pub struct TxnStore {
    nodes: BTreeMap<Vec<u8>, TxnNode>,
    txns: HashMap<TxnId, TxnState>,
    next_txn: TxnId,
    next_op: OpId,
}

impl TxnStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin(&mut self) -> TxnId {
        self.next_txn += 1;
        let id = self.next_txn;
        self.txns.insert(id, TxnState::Active);
        id
    }

    pub fn commit(&mut self, txn: TxnId) -> Result<()> {
        self.settle(txn, TxnState::Committed)
    }

    pub fn abort(&mut self, txn: TxnId) -> Result<()> {
        self.settle(txn, TxnState::Aborted)
    }

    fn settle(&mut self, txn: TxnId, target: TxnState) -> Result<()> {
        match self.txns.get_mut(&txn) {
            Some(state @ TxnState::Active) => {
                *state = target;
                Ok(())
            }
            _ => Err(Error::InvParameter),
        }
    }

    pub fn state(&self, txn: TxnId) -> Option<TxnState> {
        self.txns.get(&txn).copied()
    }

    pub fn is_aborted(&self, txn: TxnId) -> bool {
        self.state(txn) == Some(TxnState::Aborted)
    }

    fn is_foreign_active(&self, txn: TxnId, viewer: Option<TxnId>) -> bool {
        self.state(txn) == Some(TxnState::Active) && viewer != Some(txn)
    }

    pub fn node(&self, key: &[u8]) -> Option<&TxnNode> {
        self.nodes.get(key)
    }

    pub fn op(&self, key: &[u8], id: OpId) -> Option<&TxnOp> {
        self.nodes
            .get(key)?
            .ops
            .iter()
            .find(|op| op.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Resolves the newest effective operation of `key` for `viewer`.
    pub fn node_status(&self, key: &[u8], viewer: Option<TxnId>) -> NodeStatus {
        let Some(node) = self.nodes.get(key) else {
            return NodeStatus::Absent;
        };
        for op in node.ops.iter().rev() {
            if self.is_aborted(op.txn) || op.kind == OpKind::Nop {
                continue;
            }
            if self.is_foreign_active(op.txn, viewer) {
                return NodeStatus::Conflict(op.id);
            }
            return match op.kind {
                OpKind::Erase => NodeStatus::Erased(op.id),
                _ => NodeStatus::Present(op.id),
            };
        }
        NodeStatus::Absent
    }

    /// Records an operation under `txn`. Fails with `TxnConflict` when any
    /// effective operation on the key belongs to a different transaction
    /// that is still active.
    pub fn insert_op(
        &mut self,
        txn: TxnId,
        key: &[u8],
        kind: OpKind,
        referenced_dupe: u32,
        record: Vec<u8>,
    ) -> Result<OpId> {
        if self.state(txn) != Some(TxnState::Active) {
            return Err(Error::InvParameter);
        }
        if let Some(node) = self.nodes.get(key) {
            let conflicted = node
                .ops
                .iter()
                .any(|op| self.is_foreign_active(op.txn, Some(txn)));
            if conflicted {
                return Err(Error::TxnConflict);
            }
        }

        self.next_op += 1;
        let id = self.next_op;
        self.nodes.entry(key.to_vec()).or_default().ops.push(TxnOp {
            id,
            txn,
            kind,
            referenced_dupe,
            record,
        });
        Ok(id)
    }

    /// Ascending iteration over keys with any recorded operation.
    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.nodes.keys().map(|k| k.as_slice())
    }

    pub(crate) fn first_key(&self) -> Option<&[u8]> {
        self.nodes.keys().next().map(|k| k.as_slice())
    }

    pub(crate) fn last_key(&self) -> Option<&[u8]> {
        self.nodes.keys().next_back().map(|k| k.as_slice())
    }

    pub(crate) fn key_after(&self, key: &[u8]) -> Option<&[u8]> {
        use std::ops::Bound;
        self.nodes
            .range::<[u8], _>((Bound::Excluded(key), Bound::Unbounded))
            .next()
            .map(|(k, _)| k.as_slice())
    }

    pub(crate) fn key_before(&self, key: &[u8]) -> Option<&[u8]> {
        use std::ops::Bound;
        self.nodes
            .range::<[u8], _>((Bound::Unbounded, Bound::Excluded(key)))
            .next_back()
            .map(|(k, _)| k.as_slice())
    }

    pub(crate) fn key_at_or_after(&self, key: &[u8]) -> Option<&[u8]> {
        self.nodes
            .range::<[u8], _>((std::ops::Bound::Included(key), std::ops::Bound::Unbounded))
            .next()
            .map(|(k, _)| k.as_slice())
    }

    pub(crate) fn key_at_or_before(&self, key: &[u8]) -> Option<&[u8]> {
        self.nodes
            .range::<[u8], _>((std::ops::Bound::Unbounded, std::ops::Bound::Included(key)))
            .next_back()
            .map(|(k, _)| k.as_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_commit_abort_lifecycle() {
        let mut store = TxnStore::new();
        let a = store.begin();
        let b = store.begin();
        assert_ne!(a, b);

        store.commit(a).unwrap();
        store.abort(b).unwrap();

        assert_eq!(store.state(a), Some(TxnState::Committed));
        assert_eq!(store.state(b), Some(TxnState::Aborted));
        assert!(matches!(store.commit(a), Err(Error::InvParameter)));
        assert!(matches!(store.commit(99), Err(Error::InvParameter)));
    }

    #[test]
    fn newest_effective_op_wins() {
        let mut store = TxnStore::new();
        let txn = store.begin();

        store
            .insert_op(txn, b"k", OpKind::Insert, 0, b"v1".to_vec())
            .unwrap();
        assert!(matches!(
            store.node_status(b"k", Some(txn)),
            NodeStatus::Present(_)
        ));

        store
            .insert_op(txn, b"k", OpKind::Erase, 0, Vec::new())
            .unwrap();
        assert!(matches!(
            store.node_status(b"k", Some(txn)),
            NodeStatus::Erased(_)
        ));
    }

    #[test]
    fn aborted_ops_are_invisible() {
        let mut store = TxnStore::new();
        let txn = store.begin();
        store
            .insert_op(txn, b"k", OpKind::Insert, 0, b"v".to_vec())
            .unwrap();
        store.abort(txn).unwrap();

        assert_eq!(store.node_status(b"k", None), NodeStatus::Absent);
    }

    #[test]
    fn foreign_active_ops_conflict() {
        let mut store = TxnStore::new();
        let writer = store.begin();
        let reader = store.begin();
        store
            .insert_op(writer, b"k", OpKind::Insert, 0, b"v".to_vec())
            .unwrap();

        assert!(matches!(
            store.node_status(b"k", Some(reader)),
            NodeStatus::Conflict(_)
        ));
        assert!(matches!(
            store.node_status(b"k", Some(writer)),
            NodeStatus::Present(_)
        ));

        // writing into the contested key conflicts too
        assert!(matches!(
            store.insert_op(reader, b"k", OpKind::Insert, 0, Vec::new()),
            Err(Error::TxnConflict)
        ));
    }

    #[test]
    fn committed_ops_are_visible_to_everyone() {
        let mut store = TxnStore::new();
        let writer = store.begin();
        store
            .insert_op(writer, b"k", OpKind::Insert, 0, b"v".to_vec())
            .unwrap();
        store.commit(writer).unwrap();

        assert!(matches!(
            store.node_status(b"k", None),
            NodeStatus::Present(_)
        ));
    }

    #[test]
    fn key_navigation_is_ordered() {
        let mut store = TxnStore::new();
        let txn = store.begin();
        for key in [b"b".as_slice(), b"d", b"f"] {
            store
                .insert_op(txn, key, OpKind::Insert, 0, Vec::new())
                .unwrap();
        }

        assert_eq!(store.first_key(), Some(b"b".as_slice()));
        assert_eq!(store.last_key(), Some(b"f".as_slice()));
        assert_eq!(store.key_after(b"b"), Some(b"d".as_slice()));
        assert_eq!(store.key_before(b"d"), Some(b"b".as_slice()));
        assert_eq!(store.key_at_or_after(b"c"), Some(b"d".as_slice()));
        assert_eq!(store.key_at_or_before(b"e"), Some(b"d".as_slice()));
        assert_eq!(store.key_after(b"f"), None);
    }
}
