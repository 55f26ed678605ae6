//! # B-Tree Cursor
//!
//! A cursor over the leaf level in one of three states:
//!
//! - **Nil** — no position.
//! - **Coupled** — bound to a `(page, index)` pair; the cursor is registered
//!   in the page's cursor list so eviction can find it.
//! - **Uncoupled** — detached, holding a private copy of its key. An
//!   uncoupled cursor survives page eviction and re-couples by searching
//!   for the cached key.
//!
//! At most one of the two non-nil states holds, and a coupled cursor always
//! points at a leaf; interior pages never host cursors.
//!
//! ## Neighbour Walk
//!
//! `next`/`previous` step the index inside the current leaf and follow the
//! sibling pointers across leaf boundaries, skipping leaves that erasure
//! has left empty. Falling off either end leaves the cursor nil.

use crate::btree::leaf::LeafNode;
use crate::btree::interior::InteriorNode;
use crate::btree::tree::BTree;
use crate::btree::FindMode;
use crate::error::{Error, Result};
use crate::storage::cache::PageCache;
use crate::storage::manager::{FetchFlags, PageManager};
use crate::storage::page::Page;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorState {
    Nil,
    Coupled { page: u64, index: usize },
    Uncoupled { key: Vec<u8> },
}

pub struct BTreeCursor {
    id: u64,
    state: CursorState,
    /// Which duplicate of the current key the cursor addresses.
    dupe_id: u32,
}

fn fetch_node<'a>(pm: &'a mut PageManager, address: u64) -> Result<&'a mut Page> {
    pm.fetch(None, address, FetchFlags::default())?
        .ok_or_else(|| Error::Io(eyre::eyre!("leaf page {:#x} unavailable", address)))
}

/// (cell_count, next_leaf, prev_leaf) of a leaf page.
fn leaf_shape(pm: &mut PageManager, address: u64) -> Result<(usize, u64, u64)> {
    let page = fetch_node(pm, address)?;
    let leaf = LeafNode::from_page(page.data()).map_err(Error::from)?;
    Ok((leaf.cell_count(), leaf.next_leaf(), leaf.prev_leaf()))
}

impl BTreeCursor {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            state: CursorState::Nil,
            dupe_id: 0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_nil(&self) -> bool {
        matches!(self.state, CursorState::Nil)
    }

    pub fn is_coupled(&self) -> bool {
        matches!(self.state, CursorState::Coupled { .. })
    }

    pub fn is_uncoupled(&self) -> bool {
        matches!(self.state, CursorState::Uncoupled { .. })
    }

    pub fn coupled_position(&self) -> Option<(u64, usize)> {
        match self.state {
            CursorState::Coupled { page, index } => Some((page, index)),
            _ => None,
        }
    }

    pub fn uncoupled_key(&self) -> Option<&[u8]> {
        match &self.state {
            CursorState::Uncoupled { key } => Some(key),
            _ => None,
        }
    }

    pub fn dupe_id(&self) -> u32 {
        self.dupe_id
    }

    pub fn set_dupe_id(&mut self, dupe_id: u32) {
        self.dupe_id = dupe_id;
    }

    /// Drops any position: deregisters from the coupled page or frees the
    /// cached key.
    pub fn set_to_nil(&mut self, cache: &mut PageCache) {
        if let CursorState::Coupled { page, .. } = self.state {
            if let Ok(page) = cache.resident_mut(page) {
                page.remove_cursor(self.id);
            }
        }
        self.state = CursorState::Nil;
        self.dupe_id = 0;
    }

    /// Binds the cursor to a leaf position and registers it on the page.
    pub(crate) fn couple_to(
        &mut self,
        pm: &mut PageManager,
        address: u64,
        index: usize,
    ) -> Result<()> {
        self.set_to_nil(pm.cache_mut());
        let page = pm.cached_mut(address)?;
        debug_assert!(
            LeafNode::from_page(page.data()).is_ok(),
            "coupling to a non-leaf page"
        );
        page.add_cursor(self.id);
        self.state = CursorState::Coupled {
            page: address,
            index,
        };
        Ok(())
    }

    /// Re-couples an uncoupled cursor by searching for its cached key.
    pub fn couple(&mut self, tree: &BTree, pm: &mut PageManager) -> Result<()> {
        let key = match std::mem::replace(&mut self.state, CursorState::Nil) {
            CursorState::Uncoupled { key } => key,
            other => {
                self.state = other;
                debug_assert!(false, "coupling a cursor that is not uncoupled");
                return Err(Error::InvParameter);
            }
        };
        tree.find(pm, self, &key, FindMode::Exact)?;
        Ok(())
    }

    /// Detaches from the page, caching a copy of the current key.
    pub fn uncouple(&mut self, pm: &mut PageManager) -> Result<()> {
        if !self.is_coupled() {
            return Ok(());
        }
        let (address, _) = self.coupled_position().expect("coupled state checked");
        let page = pm.cached_mut(address)?;
        self.uncouple_from_page(page)
    }

    /// Uncouples using a page reference already in hand; this is the path
    /// the eviction visitor takes.
    pub(crate) fn uncouple_from_page(&mut self, page: &mut Page) -> Result<()> {
        let index = match self.state {
            CursorState::Coupled {
                page: address,
                index,
            } => {
                debug_assert_eq!(address, page.address(), "uncoupling from the wrong page");
                index
            }
            _ => return Ok(()),
        };
        let key = {
            let leaf = LeafNode::from_page(page.data()).map_err(Error::from)?;
            leaf.key_at(index)?.to_vec()
        };
        page.remove_cursor(self.id);
        self.state = CursorState::Uncoupled { key };
        Ok(())
    }

    /// Positions on the first key of the tree.
    pub fn first(&mut self, tree: &BTree, pm: &mut PageManager) -> Result<()> {
        self.set_to_nil(pm.cache_mut());

        let mut address = tree.root_page();
        loop {
            let page = fetch_node(pm, address)?;
            if page.header().map_err(Error::from)?.is_leaf() {
                break;
            }
            let node = InteriorNode::from_page(page.data()).map_err(Error::from)?;
            address = node.ptr_left()?;
        }

        loop {
            let (count, next, _) = leaf_shape(pm, address)?;
            if count > 0 {
                return self.couple_to(pm, address, 0);
            }
            if next == 0 {
                return Err(Error::KeyNotFound);
            }
            address = next;
        }
    }

    /// Positions on the last key of the tree.
    pub fn last(&mut self, tree: &BTree, pm: &mut PageManager) -> Result<()> {
        self.set_to_nil(pm.cache_mut());

        let mut address = tree.root_page();
        loop {
            let page = fetch_node(pm, address)?;
            if page.header().map_err(Error::from)?.is_leaf() {
                break;
            }
            let node = InteriorNode::from_page(page.data()).map_err(Error::from)?;
            address = node.right_child();
        }

        loop {
            let (count, _, prev) = leaf_shape(pm, address)?;
            if count > 0 {
                return self.couple_to(pm, address, count - 1);
            }
            if prev == 0 {
                return Err(Error::KeyNotFound);
            }
            address = prev;
        }
    }

    /// Advances to the following key. An uncoupled cursor first re-couples
    /// to its cached key, then steps past it.
    pub fn next(&mut self, tree: &BTree, pm: &mut PageManager) -> Result<()> {
        match self.state {
            CursorState::Nil => return Err(Error::CursorIsNil),
            CursorState::Uncoupled { .. } => self.couple(tree, pm)?,
            CursorState::Coupled { .. } => {}
        }

        let (address, index) = self.coupled_position().ok_or(Error::CursorIsNil)?;
        let (count, mut next, _) = leaf_shape(pm, address)?;

        if index + 1 < count {
            self.state = CursorState::Coupled {
                page: address,
                index: index + 1,
            };
            self.dupe_id = 0;
            return Ok(());
        }

        pm.cached_mut(address)?.remove_cursor(self.id);
        self.state = CursorState::Nil;
        self.dupe_id = 0;

        loop {
            if next == 0 {
                return Err(Error::CursorIsNil);
            }
            let (count, following, _) = leaf_shape(pm, next)?;
            if count > 0 {
                return self.couple_to(pm, next, 0);
            }
            next = following;
        }
    }

    /// Steps back to the preceding key.
    pub fn previous(&mut self, tree: &BTree, pm: &mut PageManager) -> Result<()> {
        match self.state {
            CursorState::Nil => return Err(Error::CursorIsNil),
            CursorState::Uncoupled { .. } => self.couple(tree, pm)?,
            CursorState::Coupled { .. } => {}
        }

        let (address, index) = self.coupled_position().ok_or(Error::CursorIsNil)?;
        let (_, _, mut prev) = leaf_shape(pm, address)?;

        if index > 0 {
            self.state = CursorState::Coupled {
                page: address,
                index: index - 1,
            };
            self.dupe_id = 0;
            return Ok(());
        }

        pm.cached_mut(address)?.remove_cursor(self.id);
        self.state = CursorState::Nil;
        self.dupe_id = 0;

        loop {
            if prev == 0 {
                return Err(Error::CursorIsNil);
            }
            let (count, _, preceding) = leaf_shape(pm, prev)?;
            if count > 0 {
                return self.couple_to(pm, prev, count - 1);
            }
            prev = preceding;
        }
    }

    /// An owned copy of the current key, from the leaf or the uncoupled
    /// cache.
    pub fn current_key(&self, pm: &mut PageManager) -> Result<Vec<u8>> {
        match &self.state {
            CursorState::Nil => Err(Error::CursorIsNil),
            CursorState::Uncoupled { key } => Ok(key.clone()),
            CursorState::Coupled { page, index } => {
                let page = fetch_node(pm, *page)?;
                let leaf = LeafNode::from_page(page.data()).map_err(Error::from)?;
                Ok(leaf.key_at(*index)?.to_vec())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::LexicalComparator;
    use crate::config::{Config, InsertFlags};
    use crate::storage::blob::RecordRef;
    use crate::storage::device::FileDevice;

    fn setup() -> (tempfile::TempDir, PageManager, BTree) {
        let dir = tempfile::tempdir().unwrap();
        let device = FileDevice::create(dir.path().join("cursor.db")).unwrap();
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

    fn fill(pm: &mut PageManager, tree: &mut BTree, count: u32) {
        for i in 0..count {
            let key = format!("key{:06}", i);
            tree.insert(pm, key.as_bytes(), tiny(i as u8), InsertFlags::default())
                .unwrap();
        }
    }

    #[test]
    fn first_on_an_empty_tree_reports_key_not_found() {
        let (_dir, mut pm, tree) = setup();
        let mut cursor = BTreeCursor::new(1);

        assert!(matches!(
            cursor.first(&tree, &mut pm),
            Err(Error::KeyNotFound)
        ));
        assert!(cursor.is_nil());
    }

    #[test]
    fn next_on_a_nil_cursor_reports_nil() {
        let (_dir, mut pm, tree) = setup();
        let mut cursor = BTreeCursor::new(1);

        assert!(matches!(
            cursor.next(&tree, &mut pm),
            Err(Error::CursorIsNil)
        ));
    }

    #[test]
    fn traversal_visits_every_key_in_order() {
        let (_dir, mut pm, mut tree) = setup();
        fill(&mut pm, &mut tree, 2000);

        let mut cursor = BTreeCursor::new(1);
        cursor.first(&tree, &mut pm).unwrap();

        let mut seen = Vec::new();
        loop {
            seen.push(cursor.current_key(&mut pm).unwrap());
            match cursor.next(&tree, &mut pm) {
                Ok(()) => {}
                Err(Error::CursorIsNil) => break,
                Err(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(seen.len(), 2000);
        let mut sorted = seen.clone();
        sorted.sort();
        assert_eq!(seen, sorted);
        cursor.set_to_nil(pm.cache_mut());
    }

    #[test]
    fn backward_traversal_mirrors_forward() {
        let (_dir, mut pm, mut tree) = setup();
        fill(&mut pm, &mut tree, 500);

        let mut cursor = BTreeCursor::new(1);
        cursor.last(&tree, &mut pm).unwrap();

        let mut count = 1;
        while cursor.previous(&tree, &mut pm).is_ok() {
            count += 1;
        }

        assert_eq!(count, 500);
        assert!(cursor.is_nil());
    }

    #[test]
    fn coupled_cursor_is_registered_on_its_page() {
        let (_dir, mut pm, mut tree) = setup();
        fill(&mut pm, &mut tree, 10);

        let mut cursor = BTreeCursor::new(7);
        cursor.first(&tree, &mut pm).unwrap();

        let (address, _) = cursor.coupled_position().unwrap();
        assert!(pm.cached(address).unwrap().cursors().contains(&7));

        cursor.set_to_nil(pm.cache_mut());
        assert!(!pm.cached(address).unwrap().cursors().contains(&7));
    }

    #[test]
    fn uncouple_then_couple_returns_to_the_same_key() {
        let (_dir, mut pm, mut tree) = setup();
        fill(&mut pm, &mut tree, 100);

        let mut cursor = BTreeCursor::new(1);
        cursor.first(&tree, &mut pm).unwrap();
        cursor.next(&tree, &mut pm).unwrap();
        let key_before = cursor.current_key(&mut pm).unwrap();

        cursor.uncouple(&mut pm).unwrap();
        assert!(cursor.is_uncoupled());
        assert_eq!(cursor.uncoupled_key().unwrap(), key_before.as_slice());

        cursor.couple(&tree, &mut pm).unwrap();
        assert!(cursor.is_coupled());
        assert_eq!(cursor.current_key(&mut pm).unwrap(), key_before);
        cursor.set_to_nil(pm.cache_mut());
    }

    #[test]
    fn next_from_uncoupled_steps_past_the_cached_key() {
        let (_dir, mut pm, mut tree) = setup();
        fill(&mut pm, &mut tree, 10);

        let mut cursor = BTreeCursor::new(1);
        cursor.first(&tree, &mut pm).unwrap();
        cursor.uncouple(&mut pm).unwrap();

        cursor.next(&tree, &mut pm).unwrap();
        assert_eq!(cursor.current_key(&mut pm).unwrap(), b"key000001");
        cursor.set_to_nil(pm.cache_mut());
    }

    #[test]
    fn traversal_skips_leaves_emptied_by_erasure() {
        let (_dir, mut pm, mut tree) = setup();
        fill(&mut pm, &mut tree, 1500);

        // empty out a middle stretch spanning at least one whole leaf
        for i in 400..1100u32 {
            let key = format!("key{:06}", i);
            tree.erase(&mut pm, key.as_bytes()).unwrap();
        }

        let mut cursor = BTreeCursor::new(1);
        cursor.first(&tree, &mut pm).unwrap();
        let mut seen = 1;
        while cursor.next(&tree, &mut pm).is_ok() {
            seen += 1;
        }

        assert_eq!(seen, 1500 - 700);
    }
}
