//! # B-Tree Leaf Nodes
//!
//! A leaf stores its entries as a slot array growing up from the node
//! header and a cell area growing down from the page end:
//!
//! ```text
//! +-------------------------+
//! | PageHeader (32 bytes)   |  leaf flag, cell_count, free range,
//! +-------------------------+  left/right sibling addresses
//! | Slot 0 | Slot 1 | ...   |  <- 4 bytes each: offset, key_len
//! +-------------------------+
//! | free space              |
//! +-------------------------+
//! | ... | Cell 1 | Cell 0   |  <- cells allocated from the page end
//! +-------------------------+
//! ```
//!
//! ## Cell Layout
//!
//! ```text
//! [key bytes][u16 record count][count * 9-byte record references]
//! ```
//!
//! One cell holds the whole duplicate table of its key, in user-visible
//! order. Deleting a cell leaves a hole accounted in `frag_bytes`; the page
//! is compacted when a later insertion needs the fragmented space.

use eyre::{ensure, Result};
use zerocopy::byteorder::{LittleEndian, U16};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::Comparator;
use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::storage::blob::{RecordRef, RECORD_REF_SIZE};
use crate::storage::page::PageHeader;

pub const LEAF_SLOT_SIZE: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct LeafSlot {
    offset: U16<LittleEndian>,
    key_len: U16<LittleEndian>,
}

impl LeafSlot {
    fn new(offset: u16, key_len: u16) -> Self {
        Self {
            offset: U16::new(offset),
            key_len: U16::new(key_len),
        }
    }

    pub fn offset(&self) -> usize {
        self.offset.get() as usize
    }

    pub fn key_len(&self) -> usize {
        self.key_len.get() as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchResult {
    Found(usize),
    /// Not present; the payload is the insertion point.
    NotFound(usize),
}

/// Encoded byte size of a record table with `count` entries.
pub fn table_size(count: usize) -> usize {
    2 + count * RECORD_REF_SIZE
}

pub fn encode_table(table: &[RecordRef]) -> Vec<u8> {
    let mut out = vec![0u8; table_size(table.len())];
    out[0..2].copy_from_slice(&(table.len() as u16).to_le_bytes());
    for (i, rref) in table.iter().enumerate() {
        rref.encode(&mut out[2 + i * RECORD_REF_SIZE..]);
    }
    out
}

pub fn decode_table(bytes: &[u8]) -> Result<Vec<RecordRef>> {
    ensure!(bytes.len() >= 2, "record table truncated");
    let count = u16::from_le_bytes(bytes[0..2].try_into().expect("fixed-width slice")) as usize;
    ensure!(
        bytes.len() >= table_size(count),
        "record table of {} entries truncated: {} bytes",
        count,
        bytes.len()
    );
    let mut table = Vec::with_capacity(count);
    for i in 0..count {
        table.push(RecordRef::decode(&bytes[2 + i * RECORD_REF_SIZE..])?);
    }
    Ok(table)
}

/// Space an entry occupies, slot included.
pub fn entry_size(key: &[u8], table_entries: usize) -> usize {
    LEAF_SLOT_SIZE + key.len() + table_size(table_entries)
}

#[derive(Debug)]
pub struct LeafNode<'a> {
    data: &'a [u8],
}

pub struct LeafNodeMut<'a> {
    data: &'a mut [u8],
}

fn validate(data: &[u8]) -> Result<()> {
    ensure!(
        data.len() == PAGE_SIZE,
        "invalid page size: {} != {}",
        data.len(),
        PAGE_SIZE
    );
    let header = PageHeader::from_bytes(data)?;
    ensure!(
        header.page_type().is_btree(),
        "expected a B-tree page, got {:?}",
        header.page_type()
    );
    ensure!(header.is_leaf(), "expected a leaf node");
    Ok(())
}

impl<'a> LeafNode<'a> {
    pub fn from_page(data: &'a [u8]) -> Result<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    fn header(&self) -> &PageHeader {
        PageHeader::from_bytes(self.data).expect("validated in from_page")
    }

    pub fn cell_count(&self) -> usize {
        self.header().cell_count() as usize
    }

    pub fn next_leaf(&self) -> u64 {
        self.header().right_sibling()
    }

    pub fn prev_leaf(&self) -> u64 {
        self.header().left_sibling()
    }

    /// Free bytes including fragmented holes.
    pub fn total_free(&self) -> usize {
        let header = self.header();
        header.free_space() as usize + header.frag_bytes() as usize
    }

    pub fn slot_at(&self, index: usize) -> Result<LeafSlot> {
        ensure!(
            index < self.cell_count(),
            "slot index {} out of bounds (cell_count={})",
            index,
            self.cell_count()
        );
        let offset = PAGE_HEADER_SIZE + index * LEAF_SLOT_SIZE;
        LeafSlot::read_from_bytes(&self.data[offset..offset + LEAF_SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read leaf slot {}: {:?}", index, e))
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let start = slot.offset();
        ensure!(
            start + slot.key_len() <= PAGE_SIZE,
            "key extends beyond page boundary"
        );
        Ok(&self.data[start..start + slot.key_len()])
    }

    pub fn table_bytes_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let start = slot.offset() + slot.key_len();
        ensure!(start + 2 <= PAGE_SIZE, "record table beyond page boundary");
        let count =
            u16::from_le_bytes(self.data[start..start + 2].try_into().expect("fixed-width"))
                as usize;
        let end = start + table_size(count);
        ensure!(end <= PAGE_SIZE, "record table beyond page boundary");
        Ok(&self.data[start..end])
    }

    pub fn table_at(&self, index: usize) -> Result<Vec<RecordRef>> {
        decode_table(self.table_bytes_at(index)?)
    }

    pub fn find_key(&self, cmp: &dyn Comparator, key: &[u8]) -> SearchResult {
        let mut lo = 0usize;
        let mut hi = self.cell_count();
        while lo < hi {
            let mid = (lo + hi) / 2;
            let probe = match self.key_at(mid) {
                Ok(k) => k,
                Err(_) => return SearchResult::NotFound(mid),
            };
            match cmp.compare(probe, key) {
                std::cmp::Ordering::Equal => return SearchResult::Found(mid),
                std::cmp::Ordering::Less => lo = mid + 1,
                std::cmp::Ordering::Greater => hi = mid,
            }
        }
        SearchResult::NotFound(lo)
    }
}

impl<'a> LeafNodeMut<'a> {
    /// Resets the node to an empty leaf, preserving the page type byte.
    pub fn init(data: &'a mut [u8]) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        let page_type = PageHeader::from_bytes(data)?.page_type();
        let mut header = PageHeader::new(page_type);
        header.set_leaf(true);
        header.write_to(data)?;
        Ok(Self { data })
    }

    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> LeafNode<'_> {
        LeafNode { data: self.data }
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::from_bytes_mut(self.data).expect("validated in constructor")
    }

    pub fn set_next_leaf(&mut self, address: u64) {
        self.header_mut().set_right_sibling(address);
    }

    pub fn set_prev_leaf(&mut self, address: u64) {
        self.header_mut().set_left_sibling(address);
    }

    pub fn has_room(&self, key: &[u8], table_entries: usize) -> bool {
        self.as_ref().total_free() >= entry_size(key, table_entries)
    }

    /// Rewrites all cells contiguously at the page end, clearing
    /// fragmentation.
    pub fn compact(&mut self) -> Result<()> {
        let count = self.as_ref().cell_count();
        let mut cells = Vec::with_capacity(count);
        for i in 0..count {
            let node = self.as_ref();
            let key = node.key_at(i)?.to_vec();
            let table = node.table_bytes_at(i)?.to_vec();
            cells.push((key, table));
        }

        let mut end = PAGE_SIZE;
        for (i, (key, table)) in cells.iter().enumerate() {
            let size = key.len() + table.len();
            end -= size;
            self.data[end..end + key.len()].copy_from_slice(key);
            self.data[end + key.len()..end + size].copy_from_slice(table);
            let slot = LeafSlot::new(end as u16, key.len() as u16);
            let slot_off = PAGE_HEADER_SIZE + i * LEAF_SLOT_SIZE;
            self.data[slot_off..slot_off + LEAF_SLOT_SIZE].copy_from_slice(slot.as_bytes());
        }

        let free_start = (PAGE_HEADER_SIZE + count * LEAF_SLOT_SIZE) as u16;
        let header = self.header_mut();
        header.set_free_start(free_start);
        header.set_free_end(end as u16);
        header.set_frag_bytes(0);
        Ok(())
    }

    /// Inserts an entry at its sorted position. The caller must have
    /// verified `has_room`.
    pub fn insert_cell(
        &mut self,
        cmp: &dyn Comparator,
        key: &[u8],
        table: &[RecordRef],
    ) -> Result<()> {
        let position = match self.as_ref().find_key(cmp, key) {
            SearchResult::Found(_) => eyre::bail!("key already present in leaf"),
            SearchResult::NotFound(pos) => pos,
        };
        self.insert_cell_at(position, key, table)
    }

    pub fn insert_cell_at(
        &mut self,
        position: usize,
        key: &[u8],
        table: &[RecordRef],
    ) -> Result<()> {
        let table_bytes = encode_table(table);
        let cell_size = key.len() + table_bytes.len();
        let need = cell_size + LEAF_SLOT_SIZE;

        ensure!(
            self.as_ref().total_free() >= need,
            "leaf node out of space for a {} byte entry",
            need
        );
        if (self.as_ref().header().free_space() as usize) < need {
            self.compact()?;
        }

        let count = self.as_ref().cell_count();
        ensure!(position <= count, "insert position {} out of bounds", position);

        let cell_start = self.as_ref().header().free_end() as usize - cell_size;
        self.data[cell_start..cell_start + key.len()].copy_from_slice(key);
        self.data[cell_start + key.len()..cell_start + cell_size].copy_from_slice(&table_bytes);

        // shift slots right of the insertion point
        let slot_base = PAGE_HEADER_SIZE;
        let src = slot_base + position * LEAF_SLOT_SIZE;
        let len = (count - position) * LEAF_SLOT_SIZE;
        self.data
            .copy_within(src..src + len, src + LEAF_SLOT_SIZE);
        let slot = LeafSlot::new(cell_start as u16, key.len() as u16);
        self.data[src..src + LEAF_SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_cell_count(count as u16 + 1);
        header.set_free_start(header.free_start() + LEAF_SLOT_SIZE as u16);
        header.set_free_end(cell_start as u16);
        Ok(())
    }

    /// Removes the entry at `index`, leaving its cell bytes as a hole.
    pub fn delete_cell(&mut self, index: usize) -> Result<()> {
        let count = self.as_ref().cell_count();
        ensure!(index < count, "delete index {} out of bounds", index);

        let slot = self.as_ref().slot_at(index)?;
        let cell_size = {
            let node = self.as_ref();
            slot.key_len() + node.table_bytes_at(index)?.len()
        };

        let slot_base = PAGE_HEADER_SIZE;
        let dst = slot_base + index * LEAF_SLOT_SIZE;
        let src = dst + LEAF_SLOT_SIZE;
        let len = (count - index - 1) * LEAF_SLOT_SIZE;
        self.data.copy_within(src..src + len, dst);

        let header = self.header_mut();
        header.set_cell_count(count as u16 - 1);
        header.set_free_start(header.free_start() - LEAF_SLOT_SIZE as u16);
        header.set_frag_bytes(header.frag_bytes() + cell_size as u16);
        Ok(())
    }

    /// Replaces the record table of the entry at `index`. Returns `false`
    /// when the grown entry no longer fits the node.
    pub fn replace_table(&mut self, index: usize, table: &[RecordRef]) -> Result<bool> {
        let key = self.as_ref().key_at(index)?.to_vec();
        self.delete_cell(index)?;
        if !self.has_room(&key, table.len()) {
            return Ok(false);
        }
        self.insert_cell_at(index, &key, table)?;
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::LexicalComparator;
    use crate::storage::page::{PageHeader, PageType};

    const CMP: LexicalComparator = LexicalComparator;

    fn empty_leaf() -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        PageHeader::new(PageType::BtreeIndex).write_to(&mut data).unwrap();
        LeafNodeMut::init(&mut data).unwrap();
        data
    }

    fn tiny(byte: u8) -> RecordRef {
        RecordRef::Tiny {
            len: 1,
            data: [byte, 0, 0, 0, 0, 0, 0],
        }
    }

    #[test]
    fn init_produces_an_empty_leaf() {
        let data = empty_leaf();
        let leaf = LeafNode::from_page(&data).unwrap();

        assert_eq!(leaf.cell_count(), 0);
        assert_eq!(leaf.next_leaf(), 0);
        assert_eq!(leaf.prev_leaf(), 0);
    }

    #[test]
    fn insert_keeps_keys_sorted() {
        let mut data = empty_leaf();
        let mut leaf = LeafNodeMut::from_page(&mut data).unwrap();

        leaf.insert_cell(&CMP, b"charlie", &[tiny(3)]).unwrap();
        leaf.insert_cell(&CMP, b"alpha", &[tiny(1)]).unwrap();
        leaf.insert_cell(&CMP, b"bravo", &[tiny(2)]).unwrap();

        let leaf = LeafNode::from_page(&data).unwrap();
        assert_eq!(leaf.cell_count(), 3);
        assert_eq!(leaf.key_at(0).unwrap(), b"alpha");
        assert_eq!(leaf.key_at(1).unwrap(), b"bravo");
        assert_eq!(leaf.key_at(2).unwrap(), b"charlie");
    }

    #[test]
    fn find_key_reports_insertion_points() {
        let mut data = empty_leaf();
        let mut leaf = LeafNodeMut::from_page(&mut data).unwrap();
        leaf.insert_cell(&CMP, b"b", &[tiny(1)]).unwrap();
        leaf.insert_cell(&CMP, b"d", &[tiny(2)]).unwrap();

        let leaf = LeafNode::from_page(&data).unwrap();
        assert_eq!(leaf.find_key(&CMP, b"a"), SearchResult::NotFound(0));
        assert_eq!(leaf.find_key(&CMP, b"b"), SearchResult::Found(0));
        assert_eq!(leaf.find_key(&CMP, b"c"), SearchResult::NotFound(1));
        assert_eq!(leaf.find_key(&CMP, b"d"), SearchResult::Found(1));
        assert_eq!(leaf.find_key(&CMP, b"e"), SearchResult::NotFound(2));
    }

    #[test]
    fn tables_round_trip() {
        let mut data = empty_leaf();
        let mut leaf = LeafNodeMut::from_page(&mut data).unwrap();

        let table = vec![tiny(1), tiny(2), tiny(3)];
        leaf.insert_cell(&CMP, b"key", &table).unwrap();

        let leaf = LeafNode::from_page(&data).unwrap();
        assert_eq!(leaf.table_at(0).unwrap(), table);
    }

    #[test]
    fn delete_cell_tracks_fragmentation() {
        let mut data = empty_leaf();
        let mut leaf = LeafNodeMut::from_page(&mut data).unwrap();
        leaf.insert_cell(&CMP, b"one", &[tiny(1)]).unwrap();
        leaf.insert_cell(&CMP, b"two", &[tiny(2)]).unwrap();

        leaf.delete_cell(0).unwrap();

        let leaf = LeafNode::from_page(&data).unwrap();
        assert_eq!(leaf.cell_count(), 1);
        assert_eq!(leaf.key_at(0).unwrap(), b"two");
        assert!(LeafNode::from_page(&data).unwrap().total_free() > 0);
    }

    #[test]
    fn compaction_recovers_fragmented_space() {
        let mut data = empty_leaf();
        let mut leaf = LeafNodeMut::from_page(&mut data).unwrap();
        leaf.insert_cell(&CMP, b"one", &[tiny(1)]).unwrap();
        leaf.insert_cell(&CMP, b"two", &[tiny(2)]).unwrap();
        leaf.delete_cell(0).unwrap();

        leaf.compact().unwrap();

        let node = LeafNode::from_page(&data).unwrap();
        assert_eq!(node.cell_count(), 1);
        assert_eq!(node.key_at(0).unwrap(), b"two");
        assert_eq!(node.header().frag_bytes(), 0);
    }

    #[test]
    fn replace_table_grows_and_shrinks() {
        let mut data = empty_leaf();
        let mut leaf = LeafNodeMut::from_page(&mut data).unwrap();
        leaf.insert_cell(&CMP, b"key", &[tiny(1)]).unwrap();

        assert!(leaf.replace_table(0, &[tiny(1), tiny(2)]).unwrap());
        assert_eq!(leaf.as_ref().table_at(0).unwrap().len(), 2);

        assert!(leaf.replace_table(0, &[tiny(9)]).unwrap());
        assert_eq!(leaf.as_ref().table_at(0).unwrap(), vec![tiny(9)]);
    }

    #[test]
    fn fills_and_refuses_past_capacity() {
        let mut data = empty_leaf();
        let mut leaf = LeafNodeMut::from_page(&mut data).unwrap();

        let mut inserted = 0u32;
        loop {
            let key = format!("key{:06}", inserted);
            if !leaf.has_room(key.as_bytes(), 1) {
                break;
            }
            leaf.insert_cell(&CMP, key.as_bytes(), &[tiny(1)]).unwrap();
            inserted += 1;
        }

        assert!(inserted > 100);
        let key = format!("key{:06}", inserted);
        assert!(!leaf.has_room(key.as_bytes(), 1));
    }
}
