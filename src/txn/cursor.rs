//! # Transaction Cursor
//!
//! A position inside the transaction overlay: the key of a node plus the id
//! of the operation the cursor is coupled to. Moves resolve each candidate
//! node through the overlay's visibility rules and report the outcome as a
//! status — a key whose newest effective operation is an erase still
//! positions the cursor (the merge layer needs its key for ordering) but
//! reports `KeyErasedInTxn`; a contested key reports `TxnConflict`.

use crate::btree::{ApproxMatch, FindMode};
use crate::error::{Error, Result};
use crate::txn::{NodeStatus, OpId, TxnId, TxnOp, TxnStore};

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Nil,
    Coupled { key: Vec<u8>, op: OpId },
}

pub struct TxnCursor {
    /// The transaction this cursor reads as; `None` sees committed state
    /// only.
    viewer: Option<TxnId>,
    state: State,
}

impl TxnCursor {
    pub fn new(viewer: Option<TxnId>) -> Self {
        Self {
            viewer,
            state: State::Nil,
        }
    }

    pub fn viewer(&self) -> Option<TxnId> {
        self.viewer
    }

    pub fn is_nil(&self) -> bool {
        self.state == State::Nil
    }

    pub fn set_to_nil(&mut self) {
        self.state = State::Nil;
    }

    pub fn coupled_key(&self) -> Option<&[u8]> {
        match &self.state {
            State::Coupled { key, .. } => Some(key),
            State::Nil => None,
        }
    }

    pub fn coupled_op_id(&self) -> Option<OpId> {
        match &self.state {
            State::Coupled { op, .. } => Some(*op),
            State::Nil => None,
        }
    }

    pub fn get_coupled_op<'a>(&self, store: &'a TxnStore) -> Option<&'a TxnOp> {
        match &self.state {
            State::Coupled { key, op } => store.op(key, *op),
            State::Nil => None,
        }
    }

    /// Couples directly to a specific operation (duplicate-cache path).
    pub fn couple_to_op(&mut self, key: Vec<u8>, op: OpId) {
        self.state = State::Coupled { key, op };
    }

    /// Couples to `key`'s resolved operation and translates the node status
    /// into the move result.
    fn land(&mut self, key: &[u8], status: NodeStatus) -> Result<()> {
        match status {
            NodeStatus::Absent => Err(Error::KeyNotFound),
            NodeStatus::Present(op) => {
                self.couple_to_op(key.to_vec(), op);
                Ok(())
            }
            NodeStatus::Erased(op) => {
                self.couple_to_op(key.to_vec(), op);
                Err(Error::KeyErasedInTxn)
            }
            NodeStatus::Conflict(op) => {
                self.couple_to_op(key.to_vec(), op);
                Err(Error::TxnConflict)
            }
        }
    }

    /// Scans from `start` in the given direction for the first key the
    /// overlay knows anything about.
    fn scan(&mut self, store: &TxnStore, start: Option<&[u8]>, forward: bool) -> Result<()> {
        let mut current: Option<Vec<u8>> = start.map(|k| k.to_vec());
        loop {
            let candidate = match (&current, forward) {
                (None, true) => store.first_key(),
                (None, false) => store.last_key(),
                (Some(key), true) => store.key_after(key),
                (Some(key), false) => store.key_before(key),
            }
            .map(|k| k.to_vec());

            let Some(key) = candidate else {
                self.set_to_nil();
                return Err(Error::KeyNotFound);
            };
            match store.node_status(&key, self.viewer) {
                NodeStatus::Absent => current = Some(key),
                status => return self.land(&key, status),
            }
        }
    }

    pub fn move_first(&mut self, store: &TxnStore) -> Result<()> {
        self.set_to_nil();
        self.scan(store, None, true)
    }

    pub fn move_last(&mut self, store: &TxnStore) -> Result<()> {
        self.set_to_nil();
        self.scan(store, None, false)
    }

    pub fn move_next(&mut self, store: &TxnStore) -> Result<()> {
        let key = match self.coupled_key() {
            Some(key) => key.to_vec(),
            None => return Err(Error::CursorIsNil),
        };
        self.scan(store, Some(&key), true)
    }

    pub fn move_previous(&mut self, store: &TxnStore) -> Result<()> {
        let key = match self.coupled_key() {
            Some(key) => key.to_vec(),
            None => return Err(Error::CursorIsNil),
        };
        self.scan(store, Some(&key), false)
    }

    /// Positions on `key`, or on a neighbour under an approximate mode.
    /// Erased and conflicted nodes still count as positions here; their
    /// statuses resurface on the next move.
    pub fn find(&mut self, store: &TxnStore, key: &[u8], mode: FindMode) -> Result<ApproxMatch> {
        self.set_to_nil();

        let candidate = match mode {
            FindMode::Exact => {
                if store.node_status(key, self.viewer) == NodeStatus::Absent {
                    return Err(Error::KeyNotFound);
                }
                Some(key.to_vec())
            }
            FindMode::Geq => store.key_at_or_after(key).map(|k| k.to_vec()),
            FindMode::Leq => store.key_at_or_before(key).map(|k| k.to_vec()),
        };

        let mut current = match candidate {
            Some(k) => k,
            None => return Err(Error::KeyNotFound),
        };

        loop {
            match store.node_status(&current, self.viewer) {
                NodeStatus::Absent => {
                    // only reachable in approximate modes; skip onwards
                    let next = match mode {
                        FindMode::Geq => store.key_after(&current),
                        FindMode::Leq => store.key_before(&current),
                        FindMode::Exact => None,
                    };
                    match next {
                        Some(k) => current = k.to_vec(),
                        None => return Err(Error::KeyNotFound),
                    }
                }
                NodeStatus::Present(op) | NodeStatus::Erased(op) | NodeStatus::Conflict(op) => {
                    let exact = current.as_slice() == key;
                    self.couple_to_op(current, op);
                    return Ok(if exact {
                        ApproxMatch::Exact
                    } else if mode == FindMode::Leq {
                        ApproxMatch::Less
                    } else {
                        ApproxMatch::Greater
                    });
                }
            }
        }
    }

    /// The key of the coupled node.
    pub fn get_key(&self) -> Result<Vec<u8>> {
        self.coupled_key()
            .map(|k| k.to_vec())
            .ok_or(Error::CursorIsNil)
    }

    /// The record of the coupled operation.
    pub fn get_record(&self, store: &TxnStore) -> Result<Vec<u8>> {
        let op = self.get_coupled_op(store).ok_or(Error::CursorIsNil)?;
        debug_assert!(op.kind.is_insert(), "record read from a non-insert op");
        Ok(op.record.clone())
    }

    /// Records an overwriting insert on the coupled key within the
    /// cursor's transaction and re-couples to it.
    pub fn overwrite(&mut self, store: &mut TxnStore, record: Vec<u8>) -> Result<()> {
        let key = self.get_key()?;
        let txn = self.viewer.ok_or(Error::InvParameter)?;
        let op = store.insert_op(txn, &key, crate::txn::OpKind::InsertOverwrite, 0, record)?;
        self.couple_to_op(key, op);
        Ok(())
    }

    /// Records an erase of the coupled key (or one referenced duplicate).
    pub fn erase(&mut self, store: &mut TxnStore, referenced_dupe: u32) -> Result<()> {
        let key = self.get_key()?;
        let txn = self.viewer.ok_or(Error::InvParameter)?;
        let op = store.insert_op(
            txn,
            &key,
            crate::txn::OpKind::Erase,
            referenced_dupe,
            Vec::new(),
        )?;
        self.couple_to_op(key, op);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::OpKind;

    fn store_with(keys: &[&[u8]]) -> (TxnStore, TxnId) {
        let mut store = TxnStore::new();
        let txn = store.begin();
        for key in keys {
            store
                .insert_op(txn, key, OpKind::Insert, 0, key.to_vec())
                .unwrap();
        }
        (store, txn)
    }

    #[test]
    fn first_and_next_walk_keys_in_order() {
        let (store, txn) = store_with(&[b"c", b"a", b"b"]);
        let mut cursor = TxnCursor::new(Some(txn));

        cursor.move_first(&store).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"a");

        cursor.move_next(&store).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"b");

        cursor.move_next(&store).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"c");

        assert!(matches!(
            cursor.move_next(&store),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn moves_skip_fully_aborted_nodes() {
        let mut store = TxnStore::new();
        let keeper = store.begin();
        let loser = store.begin();
        store
            .insert_op(keeper, b"a", OpKind::Insert, 0, Vec::new())
            .unwrap();
        store
            .insert_op(loser, b"b", OpKind::Insert, 0, Vec::new())
            .unwrap();
        store.abort(loser).unwrap();

        let mut cursor = TxnCursor::new(Some(keeper));
        cursor.move_first(&store).unwrap();
        assert_eq!(cursor.get_key().unwrap(), b"a");
        assert!(matches!(
            cursor.move_next(&store),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn erased_keys_position_but_report_their_status() {
        let mut store = TxnStore::new();
        let txn = store.begin();
        store
            .insert_op(txn, b"k", OpKind::Insert, 0, b"v".to_vec())
            .unwrap();
        store
            .insert_op(txn, b"k", OpKind::Erase, 0, Vec::new())
            .unwrap();

        let mut cursor = TxnCursor::new(Some(txn));
        let result = cursor.move_first(&store);

        assert!(matches!(result, Err(Error::KeyErasedInTxn)));
        assert_eq!(cursor.get_key().unwrap(), b"k");
    }

    #[test]
    fn conflicted_keys_report_txn_conflict() {
        let mut store = TxnStore::new();
        let writer = store.begin();
        store
            .insert_op(writer, b"k", OpKind::Insert, 0, Vec::new())
            .unwrap();

        let reader = store.begin();
        let mut cursor = TxnCursor::new(Some(reader));

        assert!(matches!(
            cursor.move_first(&store),
            Err(Error::TxnConflict)
        ));
        assert_eq!(cursor.get_key().unwrap(), b"k");
    }

    #[test]
    fn find_supports_approximate_matches() {
        let (store, txn) = store_with(&[b"b", b"d"]);
        let mut cursor = TxnCursor::new(Some(txn));

        assert_eq!(
            cursor.find(&store, b"b", FindMode::Exact).unwrap(),
            ApproxMatch::Exact
        );
        assert_eq!(
            cursor.find(&store, b"c", FindMode::Geq).unwrap(),
            ApproxMatch::Greater
        );
        assert_eq!(cursor.get_key().unwrap(), b"d");
        assert_eq!(
            cursor.find(&store, b"c", FindMode::Leq).unwrap(),
            ApproxMatch::Less
        );
        assert_eq!(cursor.get_key().unwrap(), b"b");
        assert!(matches!(
            cursor.find(&store, b"x", FindMode::Exact),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn record_reads_come_from_the_coupled_op() {
        let (store, txn) = store_with(&[b"k"]);
        let mut cursor = TxnCursor::new(Some(txn));
        cursor.move_first(&store).unwrap();

        assert_eq!(cursor.get_record(&store).unwrap(), b"k");
    }

    #[test]
    fn overwrite_records_a_new_op_and_recouples() {
        let (mut store, txn) = store_with(&[b"k"]);
        let mut cursor = TxnCursor::new(Some(txn));
        cursor.move_first(&store).unwrap();

        cursor.overwrite(&mut store, b"new".to_vec()).unwrap();

        assert_eq!(cursor.get_record(&store).unwrap(), b"new");
        assert_eq!(store.node(b"k").unwrap().ops().len(), 2);
    }
}
