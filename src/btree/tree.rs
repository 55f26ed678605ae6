//! # B-Tree Operations
//!
//! Descent, insertion with split propagation, erasure and approximate find.
//! All page access goes through the page manager; the tree itself only
//! remembers its root address and the comparator.
//!
//! ## Insert
//!
//! ```text
//! 1. Descend to the leaf, stacking the interior path
//! 2. Apply the change to the leaf's record table
//! 3. On overflow, collect all entries plus the pending one, redistribute
//!    around the byte midpoint into the old and a fresh leaf
//! 4. Promote the right half's first key as separator, inserting it into
//!    the parent; split parents recursively; grow a new root when the old
//!    root splits
//! ```
//!
//! ## Erase
//!
//! Simple deletion: the cell is removed and the node may become empty, but
//! nodes are never merged or rebalanced. Cursor traversal skips empty
//! leaves. Underflow handling buys little for point-lookup workloads and
//! would complicate the neighbour-walk invariants.
//!
//! ## Cursors
//!
//! Mutating operations assume every registered cursor has been uncoupled to
//! its cached key beforehand (the database layer guarantees it), so splits
//! never have to patch coupled positions.

use crate::btree::cursor::BTreeCursor;
use crate::btree::interior::{InteriorNode, InteriorNodeMut};
use crate::btree::leaf::{
    entry_size, LeafNode, LeafNodeMut, SearchResult,
};
use crate::btree::{ApproxMatch, Comparator, FindMode};
use crate::config::{InsertFlags, DupePosition, PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::error::{Error, Result};
use crate::storage::blob::RecordRef;
use crate::storage::manager::{AllocFlags, FetchFlags, PageManager};
use crate::storage::page::{Page, PageType};

pub struct BTree {
    root: u64,
    cmp: Box<dyn Comparator>,
}

enum InsertOutcome {
    Done,
    Split { separator: Vec<u8>, new_page: u64 },
}

fn fetch_page<'a>(pm: &'a mut PageManager, address: u64) -> Result<&'a mut Page> {
    let page = pm.fetch(None, address, FetchFlags::default())?;
    page.ok_or_else(|| Error::Io(eyre::eyre!("tree page {:#x} unavailable", address)))
}

impl BTree {
    /// Allocates and initializes an empty tree.
    pub fn create(pm: &mut PageManager, cmp: Box<dyn Comparator>) -> Result<Self> {
        let root = pm.alloc(None, PageType::BtreeRoot, AllocFlags::default())?;
        let page = pm.cached_mut(root)?;
        LeafNodeMut::init(page.data_mut())?;
        Ok(Self { root, cmp })
    }

    /// Attaches to an existing tree rooted at `root`.
    pub fn open(root: u64, cmp: Box<dyn Comparator>) -> Self {
        Self { root, cmp }
    }

    pub fn root_page(&self) -> u64 {
        self.root
    }

    pub fn comparator(&self) -> &dyn Comparator {
        self.cmp.as_ref()
    }

    /// Walks from the root to the leaf responsible for `key`, returning the
    /// leaf address and the interior path above it.
    fn descend(&self, pm: &mut PageManager, key: &[u8]) -> Result<(u64, Vec<u64>)> {
        let mut path = Vec::new();
        let mut address = self.root;
        loop {
            let page = fetch_page(pm, address)?;
            let header = page.header().map_err(Error::from)?;
            if header.is_leaf() {
                return Ok((address, path));
            }
            let node = InteriorNode::from_page(page.data()).map_err(Error::from)?;
            let (child, _) = node.find_child(self.cmp.as_ref(), key)?;
            path.push(address);
            address = child;
        }
    }

    /// Positions `cursor` on `key`, or on a neighbour under an approximate
    /// mode. The cursor ends up nil on failure.
    pub fn find(
        &self,
        pm: &mut PageManager,
        cursor: &mut BTreeCursor,
        key: &[u8],
        mode: FindMode,
    ) -> Result<ApproxMatch> {
        cursor.set_to_nil(pm.cache_mut());

        let (leaf_address, _) = self.descend(pm, key)?;
        let (result, count, next, prev) = {
            let page = fetch_page(pm, leaf_address)?;
            let leaf = LeafNode::from_page(page.data()).map_err(Error::from)?;
            (
                leaf.find_key(self.cmp.as_ref(), key),
                leaf.cell_count(),
                leaf.next_leaf(),
                leaf.prev_leaf(),
            )
        };

        match result {
            SearchResult::Found(index) => {
                cursor.couple_to(pm, leaf_address, index)?;
                Ok(ApproxMatch::Exact)
            }
            SearchResult::NotFound(position) => match mode {
                FindMode::Exact => Err(Error::KeyNotFound),
                FindMode::Geq => {
                    if position < count {
                        cursor.couple_to(pm, leaf_address, position)?;
                        return Ok(ApproxMatch::Greater);
                    }
                    let mut address = next;
                    loop {
                        if address == 0 {
                            return Err(Error::KeyNotFound);
                        }
                        let (count, next) = {
                            let page = fetch_page(pm, address)?;
                            let leaf = LeafNode::from_page(page.data()).map_err(Error::from)?;
                            (leaf.cell_count(), leaf.next_leaf())
                        };
                        if count > 0 {
                            cursor.couple_to(pm, address, 0)?;
                            return Ok(ApproxMatch::Greater);
                        }
                        address = next;
                    }
                }
                FindMode::Leq => {
                    if position > 0 {
                        cursor.couple_to(pm, leaf_address, position - 1)?;
                        return Ok(ApproxMatch::Less);
                    }
                    let mut address = prev;
                    loop {
                        if address == 0 {
                            return Err(Error::KeyNotFound);
                        }
                        let (count, prev) = {
                            let page = fetch_page(pm, address)?;
                            let leaf = LeafNode::from_page(page.data()).map_err(Error::from)?;
                            (leaf.cell_count(), leaf.prev_leaf())
                        };
                        if count > 0 {
                            cursor.couple_to(pm, address, count - 1)?;
                            return Ok(ApproxMatch::Less);
                        }
                        address = prev;
                    }
                }
            },
        }
    }

    /// Inserts `key` with a single record reference, honouring overwrite and
    /// duplicate flags. Returns the reference that was overwritten, if any,
    /// so the caller can release its blob.
    pub fn insert(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        rref: RecordRef,
        flags: InsertFlags,
    ) -> Result<Option<RecordRef>> {
        if entry_size(key, 1) > PAGE_SIZE - PAGE_HEADER_SIZE {
            return Err(Error::InvParameter);
        }

        let (leaf_address, path) = self.descend(pm, key)?;

        let search = {
            let page = fetch_page(pm, leaf_address)?;
            let leaf = LeafNode::from_page(page.data()).map_err(Error::from)?;
            leaf.find_key(self.cmp.as_ref(), key)
        };

        match search {
            SearchResult::Found(index) => {
                let mut table = {
                    let page = fetch_page(pm, leaf_address)?;
                    LeafNode::from_page(page.data())
                        .map_err(Error::from)?
                        .table_at(index)?
                };

                let mut replaced = None;
                if flags.duplicate {
                    let position = match flags.position {
                        DupePosition::First => 0,
                        DupePosition::Before(r) => (r as usize).saturating_sub(1).min(table.len()),
                        DupePosition::After(r) => (r as usize).min(table.len()),
                        DupePosition::Last => table.len(),
                    };
                    table.insert(position, rref);
                } else if flags.overwrite {
                    if table.is_empty() {
                        table.push(rref);
                    } else {
                        replaced = Some(table[0]);
                        table[0] = rref;
                    }
                } else {
                    return Err(Error::DuplicateKey);
                }

                if entry_size(key, table.len()) > PAGE_SIZE - PAGE_HEADER_SIZE {
                    return Err(Error::InvParameter);
                }

                let fits = {
                    let page = fetch_page(pm, leaf_address)?;
                    let mut leaf = LeafNodeMut::from_page(page.data_mut()).map_err(Error::from)?;
                    leaf.replace_table(index, &table)?
                };
                if !fits {
                    // the entry was taken out by the failed replace; the
                    // split reinserts it with the rest
                    self.split_leaf(pm, leaf_address, path, key, &table)?;
                }
                Ok(replaced)
            }
            SearchResult::NotFound(_) => {
                let table = vec![rref];
                let fits = {
                    let page = fetch_page(pm, leaf_address)?;
                    let mut leaf = LeafNodeMut::from_page(page.data_mut()).map_err(Error::from)?;
                    if leaf.has_room(key, 1) {
                        leaf.insert_cell(self.cmp.as_ref(), key, &table)?;
                        true
                    } else {
                        false
                    }
                };
                if !fits {
                    self.split_leaf(pm, leaf_address, path, key, &table)?;
                }
                Ok(None)
            }
        }
    }

    /// Insert plus coupling: positions `cursor` on the inserted key.
    pub fn insert_cursor(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        rref: RecordRef,
        flags: InsertFlags,
        cursor: Option<&mut BTreeCursor>,
    ) -> Result<Option<RecordRef>> {
        if let Some(cursor) = &cursor {
            debug_assert!(
                !cursor.is_coupled(),
                "insert with a coupled cursor; uncouple first"
            );
        }
        let replaced = self.insert(pm, key, rref, flags)?;
        if let Some(cursor) = cursor {
            self.find(pm, cursor, key, FindMode::Exact)?;
        }
        Ok(replaced)
    }

    fn split_leaf(
        &mut self,
        pm: &mut PageManager,
        leaf_address: u64,
        path: Vec<u64>,
        pending_key: &[u8],
        pending_table: &[RecordRef],
    ) -> Result<()> {
        let (mut entries, old_next, old_prev) = {
            let page = fetch_page(pm, leaf_address)?;
            let leaf = LeafNode::from_page(page.data()).map_err(Error::from)?;
            let mut entries: Vec<(Vec<u8>, Vec<RecordRef>)> =
                Vec::with_capacity(leaf.cell_count() + 1);
            for i in 0..leaf.cell_count() {
                entries.push((leaf.key_at(i)?.to_vec(), leaf.table_at(i)?));
            }
            (entries, leaf.next_leaf(), leaf.prev_leaf())
        };

        let position = entries
            .iter()
            .position(|(k, _)| self.cmp.compare(k, pending_key) == std::cmp::Ordering::Greater)
            .unwrap_or(entries.len());
        entries.insert(position, (pending_key.to_vec(), pending_table.to_vec()));

        // split around the byte midpoint so skewed entry sizes still fit
        let total: usize = entries.iter().map(|(k, t)| entry_size(k, t.len())).sum();
        let mut acc = 0usize;
        let mut mid = entries.len() - 1;
        for (i, (k, t)) in entries.iter().enumerate() {
            acc += entry_size(k, t.len());
            if acc > total / 2 {
                mid = i + 1;
                break;
            }
        }
        let mid = mid.clamp(1, entries.len() - 1);

        let new_address = pm.alloc(None, PageType::BtreeIndex, AllocFlags::default())?;

        {
            let page = fetch_page(pm, leaf_address)?;
            let mut leaf = LeafNodeMut::init(page.data_mut()).map_err(Error::from)?;
            for (key, table) in &entries[..mid] {
                leaf.insert_cell(self.cmp.as_ref(), key, table)?;
            }
            leaf.set_prev_leaf(old_prev);
            leaf.set_next_leaf(new_address);
        }
        {
            let page = fetch_page(pm, new_address)?;
            let mut leaf = LeafNodeMut::init(page.data_mut()).map_err(Error::from)?;
            for (key, table) in &entries[mid..] {
                leaf.insert_cell(self.cmp.as_ref(), key, table)?;
            }
            leaf.set_prev_leaf(leaf_address);
            leaf.set_next_leaf(old_next);
        }
        if old_next != 0 {
            let page = fetch_page(pm, old_next)?;
            let mut leaf = LeafNodeMut::from_page(page.data_mut()).map_err(Error::from)?;
            leaf.set_prev_leaf(new_address);
        }

        let separator = entries[mid].0.clone();
        self.propagate_split(pm, path, separator, leaf_address, new_address)
    }

    fn propagate_split(
        &mut self,
        pm: &mut PageManager,
        mut path: Vec<u64>,
        mut separator: Vec<u8>,
        mut left: u64,
        mut right: u64,
    ) -> Result<()> {
        while let Some(parent) = path.pop() {
            match self.insert_into_interior(pm, parent, &separator, left, right)? {
                InsertOutcome::Done => return Ok(()),
                InsertOutcome::Split {
                    separator: promoted,
                    new_page,
                } => {
                    separator = promoted;
                    left = parent;
                    right = new_page;
                }
            }
        }
        self.create_new_root(pm, &separator, left, right)
    }

    /// Inserts a separator produced by splitting `left` into `right`. The
    /// slot (or rightmost pointer) that covered `left` is redirected to
    /// `right`, and `(separator, left)` takes the range below it.
    fn insert_into_interior(
        &mut self,
        pm: &mut PageManager,
        address: u64,
        separator: &[u8],
        left: u64,
        right: u64,
    ) -> Result<InsertOutcome> {
        let has_room = {
            let page = fetch_page(pm, address)?;
            let node = InteriorNodeMut::from_page(page.data_mut()).map_err(Error::from)?;
            node.has_room(separator)
        };
        if !has_room {
            return self.split_interior(pm, address, separator, left, right);
        }

        let page = fetch_page(pm, address)?;
        let mut node = InteriorNodeMut::from_page(page.data_mut()).map_err(Error::from)?;

        let count = node.as_ref().cell_count();
        let mut position = count;
        for i in 0..count {
            if self.cmp.compare(separator, node.as_ref().key_at(i)?)
                == std::cmp::Ordering::Less
            {
                position = i;
                break;
            }
        }

        if position == count {
            debug_assert_eq!(node.as_ref().right_child(), left);
            node.set_right_child(right);
        } else {
            debug_assert_eq!(node.as_ref().child_at(position)?, left);
            node.set_child_at(position, right)?;
        }
        node.insert_separator(self.cmp.as_ref(), separator, left)?;
        Ok(InsertOutcome::Done)
    }

    fn split_interior(
        &mut self,
        pm: &mut PageManager,
        address: u64,
        pending_separator: &[u8],
        left: u64,
        right: u64,
    ) -> Result<InsertOutcome> {
        let (mut separators, mut children) = {
            let page = fetch_page(pm, address)?;
            let node = InteriorNode::from_page(page.data()).map_err(Error::from)?;
            let count = node.cell_count();
            let mut separators: Vec<Vec<u8>> = Vec::with_capacity(count + 1);
            let mut children: Vec<u64> = Vec::with_capacity(count + 2);
            for i in 0..count {
                separators.push(node.key_at(i)?.to_vec());
                children.push(node.child_at(i)?);
            }
            children.push(node.right_child());
            (separators, children)
        };

        let position = separators
            .iter()
            .position(|s| self.cmp.compare(pending_separator, s) == std::cmp::Ordering::Less)
            .unwrap_or(separators.len());
        debug_assert_eq!(children[position], left);
        separators.insert(position, pending_separator.to_vec());
        children[position] = left;
        children.insert(position + 1, right);

        let mid = separators.len() / 2;
        let promoted = separators[mid].clone();

        let new_address = pm.alloc(None, PageType::BtreeIndex, AllocFlags::default())?;

        {
            let page = fetch_page(pm, address)?;
            let mut node =
                InteriorNodeMut::init(page.data_mut(), children[mid]).map_err(Error::from)?;
            for i in 0..mid {
                node.insert_separator(self.cmp.as_ref(), &separators[i], children[i])?;
            }
        }
        {
            let page = fetch_page(pm, new_address)?;
            let mut node = InteriorNodeMut::init(page.data_mut(), *children.last().expect("non-empty"))
                .map_err(Error::from)?;
            for i in mid + 1..separators.len() {
                node.insert_separator(self.cmp.as_ref(), &separators[i], children[i])?;
            }
        }

        Ok(InsertOutcome::Split {
            separator: promoted,
            new_page: new_address,
        })
    }

    fn create_new_root(
        &mut self,
        pm: &mut PageManager,
        separator: &[u8],
        left: u64,
        right: u64,
    ) -> Result<()> {
        let new_root = pm.alloc(None, PageType::BtreeRoot, AllocFlags::default())?;
        {
            let page = fetch_page(pm, new_root)?;
            let mut node = InteriorNodeMut::init(page.data_mut(), right).map_err(Error::from)?;
            node.insert_separator(self.cmp.as_ref(), separator, left)?;
        }
        let old_root = fetch_page(pm, self.root)?;
        old_root.set_page_type(PageType::BtreeIndex);
        old_root.set_dirty(true);
        self.root = new_root;
        Ok(())
    }

    /// Swaps the record reference of one duplicate in place, returning the
    /// old reference. References are fixed-width, so the cell never grows.
    pub fn replace_record(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        dupe_index: usize,
        rref: RecordRef,
    ) -> Result<RecordRef> {
        let (leaf_address, _) = self.descend(pm, key)?;
        let page = fetch_page(pm, leaf_address)?;
        let mut leaf = LeafNodeMut::from_page(page.data_mut()).map_err(Error::from)?;

        match leaf.as_ref().find_key(self.cmp.as_ref(), key) {
            SearchResult::Found(index) => {
                let mut table = leaf.as_ref().table_at(index)?;
                if dupe_index >= table.len() {
                    return Err(Error::InvIndex);
                }
                let old = table[dupe_index];
                table[dupe_index] = rref;
                let fits = leaf.replace_table(index, &table)?;
                debug_assert!(fits, "fixed-width replacement cannot overflow");
                Ok(old)
            }
            SearchResult::NotFound(_) => Err(Error::KeyNotFound),
        }
    }

    /// Removes `key` entirely, returning its record table so the caller can
    /// release out-of-line storage.
    pub fn erase(&mut self, pm: &mut PageManager, key: &[u8]) -> Result<Vec<RecordRef>> {
        let (leaf_address, _) = self.descend(pm, key)?;
        let page = fetch_page(pm, leaf_address)?;
        let mut leaf = LeafNodeMut::from_page(page.data_mut()).map_err(Error::from)?;

        match leaf.as_ref().find_key(self.cmp.as_ref(), key) {
            SearchResult::Found(index) => {
                let table = leaf.as_ref().table_at(index)?;
                leaf.delete_cell(index)?;
                Ok(table)
            }
            SearchResult::NotFound(_) => Err(Error::KeyNotFound),
        }
    }

    /// Removes a single duplicate (0-based table index) of `key`.
    pub fn erase_duplicate(
        &mut self,
        pm: &mut PageManager,
        key: &[u8],
        dupe_index: usize,
    ) -> Result<RecordRef> {
        let (leaf_address, _) = self.descend(pm, key)?;
        let page = fetch_page(pm, leaf_address)?;
        let mut leaf = LeafNodeMut::from_page(page.data_mut()).map_err(Error::from)?;

        match leaf.as_ref().find_key(self.cmp.as_ref(), key) {
            SearchResult::Found(index) => {
                let mut table = leaf.as_ref().table_at(index)?;
                if dupe_index >= table.len() {
                    return Err(Error::InvIndex);
                }
                let removed = table.remove(dupe_index);
                if table.is_empty() {
                    leaf.delete_cell(index)?;
                } else {
                    let fits = leaf.replace_table(index, &table)?;
                    debug_assert!(fits, "shrinking a table cannot overflow");
                }
                Ok(removed)
            }
            SearchResult::NotFound(_) => Err(Error::KeyNotFound),
        }
    }

    /// The duplicate table of the cursor's current key, in user-visible
    /// order.
    pub fn get_duplicate_table(
        &self,
        pm: &mut PageManager,
        cursor: &mut BTreeCursor,
    ) -> Result<Vec<RecordRef>> {
        if cursor.is_nil() {
            return Err(Error::CursorIsNil);
        }
        if cursor.is_uncoupled() {
            cursor.couple(self, pm)?;
        }
        let (address, index) = cursor.coupled_position().ok_or(Error::CursorIsNil)?;
        let page = fetch_page(pm, address)?;
        let leaf = LeafNode::from_page(page.data()).map_err(Error::from)?;
        Ok(leaf.table_at(index)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::LexicalComparator;
    use crate::config::Config;
    use crate::storage::device::FileDevice;

    fn setup() -> (tempfile::TempDir, PageManager, BTree) {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(dir.path().join("tree.db")).unwrap();
        let mut pm = PageManager::new(Box::new(device), Config::default());
        pm.setup_header_page().unwrap();
        let tree = BTree::create(&mut pm, Box::new(LexicalComparator)).unwrap();
        (dir, pm, tree)
    }

    fn tiny(b: u8) -> RecordRef {
        RecordRef::Tiny {
            len: 1,
            data: [b, 0, 0, 0, 0, 0, 0],
        }
    }

    fn lookup(pm: &mut PageManager, tree: &BTree, key: &[u8]) -> Option<Vec<RecordRef>> {
        let mut cursor = BTreeCursor::new(u64::MAX);
        let result = tree.find(pm, &mut cursor, key, FindMode::Exact);
        let table = match result {
            Ok(_) => Some(tree.get_duplicate_table(pm, &mut cursor).unwrap()),
            Err(Error::KeyNotFound) => None,
            Err(e) => panic!("unexpected error: {e}"),
        };
        cursor.set_to_nil(pm.cache_mut());
        table
    }

    #[test]
    fn insert_and_find_single_key() {
        let (_dir, mut pm, mut tree) = setup();

        tree.insert(&mut pm, b"hello", tiny(1), InsertFlags::default())
            .unwrap();

        assert_eq!(lookup(&mut pm, &tree, b"hello"), Some(vec![tiny(1)]));
        assert_eq!(lookup(&mut pm, &tree, b"other"), None);
    }

    #[test]
    fn duplicate_key_without_flags_is_rejected() {
        let (_dir, mut pm, mut tree) = setup();

        tree.insert(&mut pm, b"k", tiny(1), InsertFlags::default())
            .unwrap();
        let result = tree.insert(&mut pm, b"k", tiny(2), InsertFlags::default());

        assert!(matches!(result, Err(Error::DuplicateKey)));
    }

    #[test]
    fn overwrite_replaces_and_reports_the_old_record() {
        let (_dir, mut pm, mut tree) = setup();

        tree.insert(&mut pm, b"k", tiny(1), InsertFlags::default())
            .unwrap();
        let replaced = tree
            .insert(&mut pm, b"k", tiny(2), InsertFlags::overwrite())
            .unwrap();

        assert_eq!(replaced, Some(tiny(1)));
        assert_eq!(lookup(&mut pm, &tree, b"k"), Some(vec![tiny(2)]));
    }

    #[test]
    fn duplicates_preserve_insert_positions() {
        let (_dir, mut pm, mut tree) = setup();

        tree.insert(&mut pm, b"k", tiny(1), InsertFlags::default())
            .unwrap();
        tree.insert(
            &mut pm,
            b"k",
            tiny(3),
            InsertFlags::duplicate(DupePosition::Last),
        )
        .unwrap();
        tree.insert(
            &mut pm,
            b"k",
            tiny(2),
            InsertFlags::duplicate(DupePosition::After(1)),
        )
        .unwrap();
        tree.insert(
            &mut pm,
            b"k",
            tiny(0),
            InsertFlags::duplicate(DupePosition::First),
        )
        .unwrap();

        assert_eq!(
            lookup(&mut pm, &tree, b"k"),
            Some(vec![tiny(0), tiny(1), tiny(2), tiny(3)])
        );
    }

    #[test]
    fn splits_keep_all_keys_reachable() {
        let (_dir, mut pm, mut tree) = setup();

        for i in 0..2000u32 {
            let key = format!("key{:06}", i);
            tree.insert(&mut pm, key.as_bytes(), tiny(i as u8), InsertFlags::default())
                .unwrap();
        }

        for i in (0..2000u32).step_by(37) {
            let key = format!("key{:06}", i);
            assert_eq!(
                lookup(&mut pm, &tree, key.as_bytes()),
                Some(vec![tiny(i as u8)]),
                "missing {key}"
            );
        }
    }

    #[test]
    fn reverse_insert_order_splits_correctly() {
        let (_dir, mut pm, mut tree) = setup();

        for i in (0..2000u32).rev() {
            let key = format!("key{:06}", i);
            tree.insert(&mut pm, key.as_bytes(), tiny(i as u8), InsertFlags::default())
                .unwrap();
        }

        for i in (0..2000u32).step_by(41) {
            let key = format!("key{:06}", i);
            assert_eq!(
                lookup(&mut pm, &tree, key.as_bytes()),
                Some(vec![tiny(i as u8)]),
                "missing {key}"
            );
        }
    }

    #[test]
    fn erase_removes_the_key() {
        let (_dir, mut pm, mut tree) = setup();

        tree.insert(&mut pm, b"a", tiny(1), InsertFlags::default())
            .unwrap();
        tree.insert(&mut pm, b"b", tiny(2), InsertFlags::default())
            .unwrap();

        let table = tree.erase(&mut pm, b"a").unwrap();
        assert_eq!(table, vec![tiny(1)]);

        assert_eq!(lookup(&mut pm, &tree, b"a"), None);
        assert_eq!(lookup(&mut pm, &tree, b"b"), Some(vec![tiny(2)]));
        assert!(matches!(
            tree.erase(&mut pm, b"a"),
            Err(Error::KeyNotFound)
        ));
    }

    #[test]
    fn erase_duplicate_leaves_the_rest() {
        let (_dir, mut pm, mut tree) = setup();

        tree.insert(&mut pm, b"k", tiny(1), InsertFlags::default())
            .unwrap();
        tree.insert(
            &mut pm,
            b"k",
            tiny(2),
            InsertFlags::duplicate(DupePosition::Last),
        )
        .unwrap();

        let removed = tree.erase_duplicate(&mut pm, b"k", 0).unwrap();
        assert_eq!(removed, tiny(1));
        assert_eq!(lookup(&mut pm, &tree, b"k"), Some(vec![tiny(2)]));

        tree.erase_duplicate(&mut pm, b"k", 0).unwrap();
        assert_eq!(lookup(&mut pm, &tree, b"k"), None);
    }

    #[test]
    fn find_geq_and_leq_settle_on_neighbours() {
        let (_dir, mut pm, mut tree) = setup();
        for key in [b"b".as_slice(), b"d", b"f"] {
            tree.insert(&mut pm, key, tiny(1), InsertFlags::default())
                .unwrap();
        }

        let mut cursor = BTreeCursor::new(u64::MAX);

        let m = tree.find(&mut pm, &mut cursor, b"c", FindMode::Geq).unwrap();
        assert_eq!(m, ApproxMatch::Greater);
        assert_eq!(cursor.current_key(&mut pm).unwrap(), b"d");

        let m = tree.find(&mut pm, &mut cursor, b"c", FindMode::Leq).unwrap();
        assert_eq!(m, ApproxMatch::Less);
        assert_eq!(cursor.current_key(&mut pm).unwrap(), b"b");

        let m = tree.find(&mut pm, &mut cursor, b"d", FindMode::Geq).unwrap();
        assert_eq!(m, ApproxMatch::Exact);

        assert!(matches!(
            tree.find(&mut pm, &mut cursor, b"g", FindMode::Geq),
            Err(Error::KeyNotFound)
        ));
        assert!(matches!(
            tree.find(&mut pm, &mut cursor, b"a", FindMode::Leq),
            Err(Error::KeyNotFound)
        ));
        cursor.set_to_nil(pm.cache_mut());
    }

    #[test]
    fn oversized_keys_are_rejected() {
        let (_dir, mut pm, mut tree) = setup();

        let huge = vec![b'x'; PAGE_SIZE];
        let result = tree.insert(&mut pm, &huge, tiny(1), InsertFlags::default());

        assert!(matches!(result, Err(Error::InvParameter)));
    }
}
