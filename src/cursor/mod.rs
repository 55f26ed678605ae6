//! # Merge Cursor
//!
//! The user-visible cursor. It is really two cursors in lock-step — one
//! over the B-tree leaves, one over the transaction overlay — plus a
//! per-key duplicate cache. Every move advances both sides, compares their
//! keys and couples to the winning side:
//!
//! - distinct keys: the smaller key wins moving forward, the greater key
//!   moving backward;
//! - equal keys: the transaction side wins (it is chronologically newer),
//!   and the B-tree side steps past the key so it is not visited twice;
//! - a key whose newest effective overlay operation is an erase is skipped
//!   (no duplicates) or surfaced as `KeyErasedInTxn` (duplicates);
//! - a key contested by a foreign active transaction surfaces
//!   `TxnConflict`.
//!
//! ## The Duplicate Cache
//!
//! When a key has duplicates the cursor walks them before moving to the
//! next key. The cache is rebuilt per key: B-tree duplicates are appended
//! in table order, then the key's overlay operations are replayed oldest to
//! newest (inserts reset, overwrites patch, positional duplicate inserts
//! splice, erases drop). `LimitsReached` is the internal "end of the
//! duplicate list" signal and never escapes to callers.
//!
//! ## Direction Changes
//!
//! After a direction change (or an insert/lookup) the nil side is re-aligned
//! to the other side's key with an approximate find — greater-or-equal when
//! heading forward, less-or-equal when heading backward.

pub mod dupecache;

pub use dupecache::{DupeCache, DupeLine};

use crate::btree::{BTree, BTreeCursor, FindMode};
use crate::config::{DupePosition, MoveFlags, MoveOp};
use crate::error::{Error, ErrorKind, Result};
use crate::storage::blob::read_record;
use crate::storage::manager::PageManager;
use crate::txn::{NodeStatus, OpKind, TxnCursor, TxnId, TxnStore};

/// Which sub-cursor holds the effective position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Side {
    Btree,
    Txn,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LastOp {
    None,
    Next,
    Previous,
    Lookup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

/// Which sides contribute to a duplicate-cache rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UpdateWhat {
    Btree,
    Txn,
    Both,
}

impl UpdateWhat {
    fn btree(self) -> bool {
        matches!(self, UpdateWhat::Btree | UpdateWhat::Both)
    }

    fn txn(self) -> bool {
        matches!(self, UpdateWhat::Txn | UpdateWhat::Both)
    }
}

/// Everything a cursor operation needs from the engine.
pub struct CursorContext<'a> {
    pub pm: &'a mut PageManager,
    pub tree: &'a mut BTree,
    pub txns: &'a mut TxnStore,
    pub duplicates_enabled: bool,
}

pub struct Cursor {
    id: u64,
    txn: Option<TxnId>,
    pub(crate) btree: BTreeCursor,
    pub(crate) txn_cursor: TxnCursor,
    dupecache: DupeCache,
    /// 1-based position in the duplicate cache; 0 = no selection.
    dupecache_index: u32,
    lastop: LastOp,
    side: Side,
}

fn normalize(kind: ErrorKind) -> ErrorKind {
    // a sub-cursor falling off either end reads as "no more keys"
    if kind == ErrorKind::CursorIsNil {
        ErrorKind::KeyNotFound
    } else {
        kind
    }
}

/// Converts a sub-cursor move into a consolidation status; hard errors
/// propagate.
fn capture<T>(result: Result<T>) -> Result<Option<ErrorKind>> {
    match result {
        Ok(_) => Ok(None),
        Err(e) if e.is_status() => Ok(Some(normalize(e.kind()))),
        Err(e) => Err(e),
    }
}

impl Cursor {
    pub(crate) fn new(id: u64, txn: Option<TxnId>) -> Self {
        Self {
            id,
            txn,
            btree: BTreeCursor::new(id),
            txn_cursor: TxnCursor::new(txn),
            dupecache: DupeCache::new(),
            dupecache_index: 0,
            lastop: LastOp::None,
            side: Side::Btree,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn txn(&self) -> Option<TxnId> {
        self.txn
    }

    /// True when neither side holds a position.
    pub fn is_nil(&self) -> bool {
        self.btree.is_nil() && self.txn_cursor.is_nil()
    }

    pub(crate) fn couple_to_btree(&mut self) {
        self.side = Side::Btree;
    }

    pub(crate) fn couple_to_txnop(&mut self) {
        self.side = Side::Txn;
    }

    pub(crate) fn set_lastop_lookup(&mut self) {
        self.lastop = LastOp::Lookup;
    }

    pub(crate) fn set_to_nil(&mut self, ctx: &mut CursorContext<'_>) {
        self.btree.set_to_nil(ctx.pm.cache_mut());
        self.txn_cursor.set_to_nil();
        self.clear_dupecache();
        self.side = Side::Btree;
        self.lastop = LastOp::None;
    }

    pub(crate) fn clear_dupecache(&mut self) {
        self.dupecache.reset();
        self.dupecache_index = 0;
    }

    fn current_key(&self, ctx: &mut CursorContext<'_>) -> Result<Vec<u8>> {
        match self.side {
            Side::Txn if !self.txn_cursor.is_nil() => self.txn_cursor.get_key(),
            _ => {
                if !self.btree.is_nil() {
                    self.btree.current_key(ctx.pm)
                } else if !self.txn_cursor.is_nil() {
                    self.txn_cursor.get_key()
                } else {
                    Err(Error::CursorIsNil)
                }
            }
        }
    }

    /// Rebuilds the duplicate cache from the current positions (§ the
    /// module doc). A non-empty cache is already current and is kept.
    pub(crate) fn update_dupecache(
        &mut self,
        ctx: &mut CursorContext<'_>,
        what: UpdateWhat,
    ) -> Result<()> {
        debug_assert!(ctx.duplicates_enabled);
        if self.dupecache.count() != 0 {
            return Ok(());
        }

        if what.btree() && what.txn() && self.btree.is_nil() && !self.txn_cursor.is_nil() {
            let mut equal_keys = false;
            self.sync(ctx, Direction::Backward, Some(&mut equal_keys))?;
            if !equal_keys {
                self.btree.set_to_nil(ctx.pm.cache_mut());
            }
        }

        // B-tree duplicates first: the table is already in user order
        if what.btree() && !self.btree.is_nil() {
            match ctx.tree.get_duplicate_table(ctx.pm, &mut self.btree) {
                Ok(table) => {
                    for i in 0..table.len() {
                        self.dupecache.append(DupeLine::Btree { dupe_idx: i as u32 });
                    }
                }
                Err(Error::CursorIsNil) => {}
                Err(e) => return Err(e),
            }
            ctx.pm.changeset_mut().clear();
        }

        // replay the overlay's operations, oldest to newest
        if what.txn() && !self.txn_cursor.is_nil() {
            let key = match self.txn_cursor.coupled_key() {
                Some(key) => key.to_vec(),
                None => return Ok(()),
            };
            let Some(node) = ctx.txns.node(&key) else {
                return Ok(());
            };
            // collect first: the replay below needs &mut self
            let ops: Vec<(OpKind, u32, u64, bool)> = node
                .ops()
                .iter()
                .map(|op| (op.kind, op.referenced_dupe, op.id, ctx.txns.is_aborted(op.txn)))
                .collect();

            for (kind, referenced, op_id, aborted) in ops {
                if aborted {
                    continue;
                }
                let count = self.dupecache.count();
                match kind {
                    OpKind::Insert => {
                        self.dupecache.reset();
                        self.dupecache.append(DupeLine::Txn { op: op_id });
                    }
                    OpKind::InsertOverwrite => {
                        if referenced >= 1 && referenced as usize <= count {
                            self.dupecache
                                .set(referenced as usize - 1, DupeLine::Txn { op: op_id });
                        } else {
                            self.dupecache.reset();
                            self.dupecache.append(DupeLine::Txn { op: op_id });
                        }
                    }
                    OpKind::InsertDuplicate(position) => {
                        let line = DupeLine::Txn { op: op_id };
                        match position {
                            DupePosition::First => self.dupecache.insert(0, line),
                            DupePosition::Before(r) => self
                                .dupecache
                                .insert((r as usize).saturating_sub(1), line),
                            DupePosition::After(r) => {
                                if r as usize >= count {
                                    self.dupecache.append(line);
                                } else {
                                    self.dupecache.insert(r as usize, line);
                                }
                            }
                            DupePosition::Last => self.dupecache.append(line),
                        }
                    }
                    OpKind::Erase => {
                        if referenced >= 1 && referenced as usize <= count {
                            self.dupecache.erase(referenced as usize - 1);
                        } else {
                            self.dupecache.reset();
                        }
                    }
                    OpKind::Nop => {}
                }
            }
        }

        Ok(())
    }

    /// Couples to the 1-based duplicate `dupe_id` of the current key.
    fn couple_to_dupe(&mut self, ctx: &mut CursorContext<'_>, dupe_id: u32) -> Result<()> {
        let line = self.dupecache.line(dupe_id).ok_or(Error::InvIndex)?;
        match line {
            DupeLine::Btree { dupe_idx } => {
                self.couple_to_btree();
                self.btree.set_dupe_id(dupe_idx);
            }
            DupeLine::Txn { op } => {
                let key = self.current_key(ctx)?;
                self.txn_cursor.couple_to_op(key, op);
                self.couple_to_txnop();
            }
        }
        self.dupecache_index = dupe_id;
        Ok(())
    }

    /// Aligns the nil side of the pair to the other side's key.
    fn sync(
        &mut self,
        ctx: &mut CursorContext<'_>,
        direction: Direction,
        equal_keys: Option<&mut bool>,
    ) -> Result<()> {
        if let Some(flag) = &equal_keys {
            debug_assert!(!**flag);
        }
        let mode = match direction {
            Direction::Forward => FindMode::Geq,
            Direction::Backward => FindMode::Leq,
        };

        if self.btree.is_nil() && !self.txn_cursor.is_nil() {
            let key = self.txn_cursor.get_key()?;
            match ctx.tree.find(ctx.pm, &mut self.btree, &key, mode) {
                Ok(matched) => {
                    if matched.is_exact() {
                        if let Some(flag) = equal_keys {
                            *flag = true;
                        }
                    }
                }
                Err(Error::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        } else if self.txn_cursor.is_nil() && !self.btree.is_nil() {
            let key = self.btree.current_key(ctx.pm)?;
            match self.txn_cursor.find(ctx.txns, &key, mode) {
                Ok(matched) => {
                    if matched.is_exact() {
                        if let Some(flag) = equal_keys {
                            *flag = true;
                        }
                    }
                }
                Err(Error::KeyNotFound) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn has_duplicates(&self) -> bool {
        self.dupecache.count() > 1
    }

    /// Rebuilds the cache for the current key and reports its line count.
    fn dupecache_count(&mut self, ctx: &mut CursorContext<'_>) -> Result<usize> {
        if !ctx.duplicates_enabled {
            return Ok(0);
        }
        if !self.txn_cursor.is_nil() {
            self.update_dupecache(ctx, UpdateWhat::Both)?;
        } else {
            self.update_dupecache(ctx, UpdateWhat::Btree)?;
        }
        Ok(self.dupecache.count())
    }

    fn move_next_dupe(&mut self, ctx: &mut CursorContext<'_>) -> Result<()> {
        if self.dupecache_index != 0 && (self.dupecache_index as usize) < self.dupecache.count() {
            let next = self.dupecache_index + 1;
            return self.couple_to_dupe(ctx, next);
        }
        Err(Error::LimitsReached)
    }

    fn move_previous_dupe(&mut self, ctx: &mut CursorContext<'_>) -> Result<()> {
        if self.dupecache_index > 1 {
            let previous = self.dupecache_index - 1;
            return self.couple_to_dupe(ctx, previous);
        }
        Err(Error::LimitsReached)
    }

    fn move_first_dupe(&mut self, ctx: &mut CursorContext<'_>) -> Result<()> {
        if self.dupecache.count() > 0 {
            return self.couple_to_dupe(ctx, 1);
        }
        Err(Error::LimitsReached)
    }

    fn move_last_dupe(&mut self, ctx: &mut CursorContext<'_>) -> Result<()> {
        let count = self.dupecache.count();
        if count > 0 {
            return self.couple_to_dupe(ctx, count as u32);
        }
        Err(Error::LimitsReached)
    }

    fn step_btree(
        &mut self,
        ctx: &mut CursorContext<'_>,
        direction: Direction,
    ) -> Result<Option<ErrorKind>> {
        let result = match direction {
            Direction::Forward => self.btree.next(ctx.tree, ctx.pm),
            Direction::Backward => self.btree.previous(ctx.tree, ctx.pm),
        };
        capture(result)
    }

    fn step_txn(
        &mut self,
        ctx: &mut CursorContext<'_>,
        direction: Direction,
    ) -> Result<Option<ErrorKind>> {
        let result = match direction {
            Direction::Forward => self.txn_cursor.move_next(ctx.txns),
            Direction::Backward => self.txn_cursor.move_previous(ctx.txns),
        };
        capture(result)
    }

    /// Advances the B-tree side until it stands strictly past `key` in the
    /// move direction.
    fn advance_btree_past(
        &mut self,
        ctx: &mut CursorContext<'_>,
        key: &[u8],
        direction: Direction,
    ) -> Result<Option<ErrorKind>> {
        loop {
            if self.btree.is_nil() {
                return Ok(Some(ErrorKind::KeyNotFound));
            }
            let current = self.btree.current_key(ctx.pm)?;
            let ord = ctx.tree.comparator().compare(&current, key);
            let passed = match direction {
                Direction::Forward => ord == std::cmp::Ordering::Greater,
                Direction::Backward => ord == std::cmp::Ordering::Less,
            };
            if passed {
                return Ok(None);
            }
            if let Some(kind) = self.step_btree(ctx, direction)? {
                return Ok(Some(kind));
            }
        }
    }

    /// Advances the overlay side past `key`, reporting the status of the
    /// node it lands on.
    fn advance_txn_past(
        &mut self,
        ctx: &mut CursorContext<'_>,
        key: &[u8],
        direction: Direction,
    ) -> Result<Option<ErrorKind>> {
        loop {
            let current = match self.txn_cursor.coupled_key() {
                Some(k) => k.to_vec(),
                None => return Ok(Some(ErrorKind::KeyNotFound)),
            };
            let ord = ctx.tree.comparator().compare(&current, key);
            let passed = match direction {
                Direction::Forward => ord == std::cmp::Ordering::Greater,
                Direction::Backward => ord == std::cmp::Ordering::Less,
            };
            if passed {
                let status = match ctx.txns.node_status(&current, self.txn_cursor.viewer()) {
                    NodeStatus::Present(_) => None,
                    NodeStatus::Erased(_) => Some(ErrorKind::KeyErasedInTxn),
                    NodeStatus::Conflict(_) => Some(ErrorKind::TxnConflict),
                    // the node dissolved (all its transactions aborted);
                    // keep scanning
                    NodeStatus::Absent => {
                        if let Some(kind) = self.step_txn(ctx, direction)? {
                            return Ok(Some(kind));
                        }
                        continue;
                    }
                };
                return Ok(status);
            }
            if let Some(kind) = self.step_txn(ctx, direction)? {
                return Ok(Some(kind));
            }
        }
    }

    fn move_first_key(&mut self, ctx: &mut CursorContext<'_>) -> Result<()> {
        let txns = capture(self.txn_cursor.move_first(ctx.txns))?;
        let btrs = capture(self.btree.first(ctx.tree, ctx.pm))?;
        self.consolidate(ctx, Direction::Forward, btrs, txns)
    }

    fn move_last_key(&mut self, ctx: &mut CursorContext<'_>) -> Result<()> {
        let txns = capture(self.txn_cursor.move_last(ctx.txns))?;
        let btrs = capture(self.btree.last(ctx.tree, ctx.pm))?;
        self.consolidate(ctx, Direction::Backward, btrs, txns)
    }

    fn move_next_key(&mut self, ctx: &mut CursorContext<'_>) -> Result<()> {
        let key = self.current_key(ctx)?;
        let btrs = self.advance_btree_past(ctx, &key, Direction::Forward)?;
        let txns = self.advance_txn_past(ctx, &key, Direction::Forward)?;
        self.consolidate(ctx, Direction::Forward, btrs, txns)
    }

    fn move_previous_key(&mut self, ctx: &mut CursorContext<'_>) -> Result<()> {
        let key = self.current_key(ctx)?;
        let btrs = self.advance_btree_past(ctx, &key, Direction::Backward)?;
        let txns = self.advance_txn_past(ctx, &key, Direction::Backward)?;
        self.consolidate(ctx, Direction::Backward, btrs, txns)
    }

    /// The status table of a key move: picks the winning side from the two
    /// sub-cursor outcomes, skipping erased keys and surfacing conflicts.
    fn consolidate(
        &mut self,
        ctx: &mut CursorContext<'_>,
        direction: Direction,
        mut btrs: Option<ErrorKind>,
        mut txns: Option<ErrorKind>,
    ) -> Result<()> {
        loop {
            match (btrs, txns) {
                (Some(ErrorKind::KeyNotFound), Some(ErrorKind::KeyNotFound)) => {
                    return Err(Error::KeyNotFound);
                }
                (Some(ErrorKind::KeyNotFound), _) => {
                    if txns == Some(ErrorKind::TxnConflict) {
                        return Err(Error::TxnConflict);
                    }
                    self.couple_to_txnop();
                    if txns == Some(ErrorKind::KeyErasedInTxn) {
                        if ctx.duplicates_enabled {
                            self.update_dupecache(ctx, UpdateWhat::Txn)?;
                            return Err(Error::KeyErasedInTxn);
                        }
                        txns = self.step_txn(ctx, direction)?;
                        continue;
                    }
                    if ctx.duplicates_enabled {
                        self.update_dupecache(ctx, UpdateWhat::Txn)?;
                    }
                    return Ok(());
                }
                (_, Some(ErrorKind::KeyNotFound)) => {
                    self.couple_to_btree();
                    if ctx.duplicates_enabled {
                        self.update_dupecache(ctx, UpdateWhat::Btree)?;
                    }
                    return Ok(());
                }
                _ => {
                    let btree_key = self.btree.current_key(ctx.pm)?;
                    let txn_key = self.txn_cursor.get_key()?;
                    let ord = ctx.tree.comparator().compare(&btree_key, &txn_key);
                    let btree_wins = match direction {
                        Direction::Forward => ord == std::cmp::Ordering::Less,
                        Direction::Backward => ord == std::cmp::Ordering::Greater,
                    };

                    if ord == std::cmp::Ordering::Equal {
                        // equal keys couple to the overlay: chronologically
                        // newer
                        self.couple_to_txnop();
                        let dupes = self.dupecache_count(ctx)?;
                        if dupes > 0 {
                            return match txns {
                                Some(ErrorKind::KeyErasedInTxn) => {
                                    self.update_dupecache(ctx, UpdateWhat::Both)?;
                                    Err(Error::KeyErasedInTxn)
                                }
                                Some(ErrorKind::TxnConflict) => Err(Error::TxnConflict),
                                _ => {
                                    self.update_dupecache(ctx, UpdateWhat::Both)?;
                                    Ok(())
                                }
                            };
                        }
                        match txns {
                            Some(ErrorKind::KeyErasedInTxn) => {
                                btrs = self.step_btree(ctx, direction)?;
                                txns = self.step_txn(ctx, direction)?;
                                continue;
                            }
                            Some(ErrorKind::TxnConflict) => return Err(Error::TxnConflict),
                            _ => {
                                // the tree's record is overwritten; step the
                                // tree past the key so it is not revisited
                                let _ = self.step_btree(ctx, direction)?;
                                return Ok(());
                            }
                        }
                    } else if btree_wins {
                        self.couple_to_btree();
                        if ctx.duplicates_enabled {
                            self.update_dupecache(ctx, UpdateWhat::Btree)?;
                        }
                        return Ok(());
                    } else {
                        if txns == Some(ErrorKind::TxnConflict) {
                            return Err(Error::TxnConflict);
                        }
                        self.couple_to_txnop();
                        if txns == Some(ErrorKind::KeyErasedInTxn) {
                            if ctx.duplicates_enabled {
                                self.update_dupecache(ctx, UpdateWhat::Txn)?;
                                return Err(Error::KeyErasedInTxn);
                            }
                            txns = self.step_txn(ctx, direction)?;
                            continue;
                        }
                        if ctx.duplicates_enabled {
                            self.update_dupecache(ctx, UpdateWhat::Txn)?;
                        }
                        return Ok(());
                    }
                }
            }
        }
    }

    fn remember(&mut self, op: MoveOp) {
        self.lastop = match op {
            MoveOp::Next => LastOp::Next,
            MoveOp::Previous => LastOp::Previous,
            _ => LastOp::None,
        };
    }

    /// Moves the cursor and returns the key and record at the new position.
    pub fn move_cursor(
        &mut self,
        ctx: &mut CursorContext<'_>,
        flags: MoveFlags,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut flags = flags;
        let skip_duplicates = !ctx.duplicates_enabled || flags.skip_duplicates;

        if flags.op == MoveOp::Current {
            return self.retrieve(ctx);
        }

        // a nil cursor interprets relative moves as absolute ones
        if self.is_nil() {
            flags.op = match flags.op {
                MoveOp::Next => MoveOp::First,
                MoveOp::Previous => MoveOp::Last,
                other => other,
            };
        }

        let changed_direction = (self.lastop == LastOp::Previous && flags.op == MoveOp::Next)
            || (self.lastop == LastOp::Next && flags.op == MoveOp::Previous);
        if matches!(flags.op, MoveOp::Next | MoveOp::Previous)
            && (self.lastop == LastOp::Lookup || changed_direction)
        {
            let direction = if flags.op == MoveOp::Next {
                Direction::Forward
            } else {
                Direction::Backward
            };
            self.sync(ctx, direction, None)?;
        }

        if !skip_duplicates {
            let result = match flags.op {
                MoveOp::Next => self.move_next_dupe(ctx),
                MoveOp::Previous => self.move_previous_dupe(ctx),
                MoveOp::First => self.move_first_dupe(ctx),
                MoveOp::Last => self.move_last_dupe(ctx),
                MoveOp::Current => unreachable!("handled above"),
            };
            match result {
                Ok(()) => {
                    self.remember(flags.op);
                    return self.retrieve(ctx);
                }
                Err(Error::LimitsReached) => {}
                Err(e) => return Err(e),
            }
        }

        self.clear_dupecache();
        let moved = match flags.op {
            MoveOp::First => self.move_first_key(ctx),
            MoveOp::Last => self.move_last_key(ctx),
            MoveOp::Next => self.move_next_key(ctx),
            MoveOp::Previous => self.move_previous_key(ctx),
            MoveOp::Current => unreachable!("handled above"),
        };
        if let Err(e) = moved {
            if !matches!(e, Error::KeyErasedInTxn) || !ctx.duplicates_enabled {
                return Err(e);
            }
            // the overlay erased this key in part or in full
            if self.dupecache.is_empty() {
                // nothing survives; continue to the neighbouring key
                let follow = MoveFlags {
                    op: match flags.op {
                        MoveOp::First => MoveOp::Next,
                        MoveOp::Last => MoveOp::Previous,
                        other => other,
                    },
                    skip_duplicates: flags.skip_duplicates,
                };
                return self.move_cursor(ctx, follow);
            }
            // surviving duplicates: position on the first or last of them
            // (the coupled overlay op is the erase itself, unusable for
            // retrieval)
            if matches!(flags.op, MoveOp::Next | MoveOp::First) {
                self.move_first_dupe(ctx)?;
            } else {
                self.move_last_dupe(ctx)?;
            }
            self.remember(flags.op);
            return self.retrieve(ctx);
        }

        // position inside the fresh key's duplicate list
        if !skip_duplicates && self.has_duplicates() {
            let result = if matches!(flags.op, MoveOp::Next | MoveOp::First) {
                self.move_first_dupe(ctx)
            } else {
                self.move_last_dupe(ctx)
            };
            if let Err(e) = result {
                if matches!(e, Error::LimitsReached) {
                    // every duplicate was erased; fall through to the
                    // neighbouring key
                    let follow = MoveFlags {
                        op: match flags.op {
                            MoveOp::First => MoveOp::Next,
                            MoveOp::Last => MoveOp::Previous,
                            other => other,
                        },
                        skip_duplicates: flags.skip_duplicates,
                    };
                    return self.move_cursor(ctx, follow);
                }
                return Err(e);
            }
        }

        self.remember(flags.op);
        self.retrieve(ctx)
    }

    /// Reads the key and record from the coupled side.
    fn retrieve(&mut self, ctx: &mut CursorContext<'_>) -> Result<(Vec<u8>, Vec<u8>)> {
        if self.side == Side::Txn && !self.txn_cursor.is_nil() {
            let op = self
                .txn_cursor
                .get_coupled_op(ctx.txns)
                .ok_or(Error::CursorIsNil)?;
            debug_assert!(op.kind != OpKind::Erase, "retrieval from an erase op");
            let key = self.txn_cursor.get_key()?;
            let record = self.txn_cursor.get_record(ctx.txns)?;
            return Ok((key, record));
        }

        if self.btree.is_nil() {
            return Err(Error::CursorIsNil);
        }
        if self.btree.is_uncoupled() {
            self.btree.couple(ctx.tree, ctx.pm)?;
        }
        let (address, index) = self.btree.coupled_position().ok_or(Error::CursorIsNil)?;

        // pin the leaf: resolving the record may fault in blob pages
        ctx.pm.cached_mut(address).map_err(Error::from)?.pin();
        let result = (|| -> Result<(Vec<u8>, Vec<u8>)> {
            let (key, rref) = {
                let page = ctx.pm.cached(address).map_err(Error::from)?;
                let leaf =
                    crate::btree::leaf::LeafNode::from_page(page.data()).map_err(Error::from)?;
                let key = leaf.key_at(index)?.to_vec();
                let table = leaf.table_at(index)?;
                let dupe = self.btree.dupe_id() as usize;
                let rref = *table.get(dupe).ok_or(Error::InvIndex)?;
                (key, rref)
            };
            let record = read_record(ctx.pm, rref)?;
            Ok((key, record))
        })();
        ctx.pm.cached_mut(address).map_err(Error::from)?.unpin();
        result
    }

    /// Erases the current key (or current duplicate) — through the overlay
    /// inside a transaction, directly in the tree otherwise.
    pub fn erase(&mut self, ctx: &mut CursorContext<'_>) -> Result<()> {
        if self.is_nil() {
            return Err(Error::CursorIsNil);
        }
        let key = self.current_key(ctx)?;
        let referenced = if ctx.duplicates_enabled && self.dupecache_index > 0 {
            self.dupecache_index
        } else {
            0
        };

        if let Some(txn) = self.txn {
            ctx.txns
                .insert_op(txn, &key, OpKind::Erase, referenced, Vec::new())?;
            self.set_to_nil(ctx);
            return Ok(());
        }

        self.set_to_nil(ctx);
        if referenced > 0 {
            let removed = ctx.tree.erase_duplicate(ctx.pm, &key, referenced as usize - 1)?;
            crate::storage::blob::free_record(ctx.pm, removed)?;
        } else {
            let table = ctx.tree.erase(ctx.pm, &key)?;
            for rref in table {
                crate::storage::blob::free_record(ctx.pm, rref)?;
            }
        }
        Ok(())
    }

    /// Overwrites the record at the current position.
    pub fn overwrite(&mut self, ctx: &mut CursorContext<'_>, record: &[u8]) -> Result<()> {
        if self.txn.is_some() {
            if self.txn_cursor.is_nil() {
                if self.is_nil() {
                    return Err(Error::CursorIsNil);
                }
                let key = self.btree.current_key(ctx.pm)?;
                let txn = self.txn.expect("transaction checked above");
                let op = ctx.txns.insert_op(
                    txn,
                    &key,
                    OpKind::InsertOverwrite,
                    0,
                    record.to_vec(),
                )?;
                self.txn_cursor.couple_to_op(key, op);
            } else {
                self.txn_cursor.overwrite(ctx.txns, record.to_vec())?;
            }
            self.couple_to_txnop();
            return Ok(());
        }

        if self.btree.is_nil() {
            return Err(Error::CursorIsNil);
        }
        if self.btree.is_uncoupled() {
            self.btree.couple(ctx.tree, ctx.pm)?;
        }
        let key = self.btree.current_key(ctx.pm)?;
        let rref = crate::storage::blob::write_record(ctx.pm, record)?;
        let old = ctx
            .tree
            .replace_record(ctx.pm, &key, self.btree.dupe_id() as usize, rref)?;
        crate::storage::blob::free_record(ctx.pm, old)?;
        self.couple_to_btree();
        Ok(())
    }

    /// Number of duplicates of the current key in the merged view.
    pub fn duplicate_count(&mut self, ctx: &mut CursorContext<'_>) -> Result<usize> {
        if self.is_nil() {
            return Err(Error::CursorIsNil);
        }
        if self.txn.is_some() {
            if !ctx.duplicates_enabled {
                return Ok(1);
            }
            // align the overlay side on an exact hit only; an approximate
            // neighbour would replay the wrong key's operations
            if self.txn_cursor.is_nil() && !self.btree.is_nil() {
                let key = self.btree.current_key(ctx.pm)?;
                match self.txn_cursor.find(ctx.txns, &key, FindMode::Exact) {
                    Ok(_) | Err(Error::KeyNotFound) => {}
                    Err(e) => return Err(e),
                }
            }
            return self.dupecache_count(ctx);
        }

        if self.btree.is_uncoupled() {
            self.btree.couple(ctx.tree, ctx.pm)?;
        }
        Ok(ctx.tree.get_duplicate_table(ctx.pm, &mut self.btree)?.len())
    }
}
