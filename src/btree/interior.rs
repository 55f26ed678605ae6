//! # B-Tree Interior Nodes
//!
//! Interior nodes hold separator keys and child addresses. Each slot's
//! child covers the keys *below* its separator; the header's right-sibling
//! field doubles as the rightmost child for keys at or above the last
//! separator:
//!
//! ```text
//! K <  separator[0]                 -> slot[0].child
//! separator[i-1] <= K < separator[i] -> slot[i].child
//! K >= separator[N-1]                -> right_child (header)
//! ```
//!
//! Separators are the full first key of the right split partner; a key
//! equal to a separator therefore always descends right.
//!
//! Slots are 12 bytes: the child address plus the cell offset and key
//! length. Separator cells grow down from the page end like leaf cells;
//! interior nodes are never compacted because they only shrink when the
//! whole node is rebuilt by a split.

use eyre::{ensure, Result};
use zerocopy::byteorder::{LittleEndian, U16, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

use crate::btree::Comparator;
use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::storage::page::PageHeader;

pub const INTERIOR_SLOT_SIZE: usize = 12;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct InteriorSlot {
    child: U64<LittleEndian>,
    offset: U16<LittleEndian>,
    key_len: U16<LittleEndian>,
}

impl InteriorSlot {
    fn new(child: u64, offset: u16, key_len: u16) -> Self {
        Self {
            child: U64::new(child),
            offset: U16::new(offset),
            key_len: U16::new(key_len),
        }
    }

    pub fn child(&self) -> u64 {
        self.child.get()
    }
}

#[derive(Debug)]
pub struct InteriorNode<'a> {
    data: &'a [u8],
}

pub struct InteriorNodeMut<'a> {
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
    ensure!(!header.is_leaf(), "expected an interior node");
    Ok(())
}

impl<'a> InteriorNode<'a> {
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

    pub fn right_child(&self) -> u64 {
        self.header().right_sibling()
    }

    pub fn free_space(&self) -> usize {
        self.header().free_space() as usize
    }

    pub fn slot_at(&self, index: usize) -> Result<InteriorSlot> {
        ensure!(
            index < self.cell_count(),
            "slot index {} out of bounds (cell_count={})",
            index,
            self.cell_count()
        );
        let offset = PAGE_HEADER_SIZE + index * INTERIOR_SLOT_SIZE;
        InteriorSlot::read_from_bytes(&self.data[offset..offset + INTERIOR_SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read interior slot {}: {:?}", index, e))
    }

    pub fn key_at(&self, index: usize) -> Result<&'a [u8]> {
        let slot = self.slot_at(index)?;
        let start = slot.offset.get() as usize;
        let len = slot.key_len.get() as usize;
        ensure!(start + len <= PAGE_SIZE, "separator beyond page boundary");
        Ok(&self.data[start..start + len])
    }

    pub fn child_at(&self, index: usize) -> Result<u64> {
        Ok(self.slot_at(index)?.child())
    }

    /// The leftmost child, used by descents to the first key.
    pub fn ptr_left(&self) -> Result<u64> {
        self.child_at(0)
    }

    /// Picks the child covering `key`. The returned index equals
    /// `cell_count` when the rightmost child was chosen.
    pub fn find_child(&self, cmp: &dyn Comparator, key: &[u8]) -> Result<(u64, usize)> {
        let count = self.cell_count();
        let mut lo = 0usize;
        let mut hi = count;
        // smallest separator strictly greater than the key
        while lo < hi {
            let mid = (lo + hi) / 2;
            match cmp.compare(key, self.key_at(mid)?) {
                std::cmp::Ordering::Less => hi = mid,
                _ => lo = mid + 1,
            }
        }
        if lo < count {
            Ok((self.child_at(lo)?, lo))
        } else {
            Ok((self.right_child(), count))
        }
    }
}

impl<'a> InteriorNodeMut<'a> {
    /// Resets the node to an empty interior with the given rightmost child,
    /// preserving the page type byte.
    pub fn init(data: &'a mut [u8], right_child: u64) -> Result<Self> {
        ensure!(
            data.len() == PAGE_SIZE,
            "invalid page size: {} != {}",
            data.len(),
            PAGE_SIZE
        );
        let page_type = PageHeader::from_bytes(data)?.page_type();
        let mut header = PageHeader::new(page_type);
        header.set_leaf(false);
        header.set_right_sibling(right_child);
        header.write_to(data)?;
        Ok(Self { data })
    }

    pub fn from_page(data: &'a mut [u8]) -> Result<Self> {
        validate(data)?;
        Ok(Self { data })
    }

    pub fn as_ref(&self) -> InteriorNode<'_> {
        InteriorNode { data: self.data }
    }

    fn header_mut(&mut self) -> &mut PageHeader {
        PageHeader::from_bytes_mut(self.data).expect("validated in constructor")
    }

    pub fn set_right_child(&mut self, child: u64) {
        self.header_mut().set_right_sibling(child);
    }

    /// Redirects the child pointer of slot `index`.
    pub fn set_child_at(&mut self, index: usize, child: u64) -> Result<()> {
        let count = self.as_ref().cell_count();
        ensure!(index < count, "child index {} out of bounds", index);
        let offset = PAGE_HEADER_SIZE + index * INTERIOR_SLOT_SIZE;
        let slot = InteriorSlot::mut_from_bytes(&mut self.data[offset..offset + INTERIOR_SLOT_SIZE])
            .map_err(|e| eyre::eyre!("failed to read interior slot {}: {:?}", index, e))?;
        slot.child = U64::new(child);
        Ok(())
    }

    pub fn has_room(&self, separator: &[u8]) -> bool {
        self.as_ref().free_space() >= separator.len() + INTERIOR_SLOT_SIZE
    }

    /// Inserts a separator with its left child at the sorted position.
    pub fn insert_separator(
        &mut self,
        cmp: &dyn Comparator,
        separator: &[u8],
        left_child: u64,
    ) -> Result<()> {
        let node = self.as_ref();
        let count = node.cell_count();
        let mut position = count;
        for i in 0..count {
            if cmp.compare(separator, node.key_at(i)?) == std::cmp::Ordering::Less {
                position = i;
                break;
            }
        }

        let need = separator.len() + INTERIOR_SLOT_SIZE;
        ensure!(
            node.free_space() >= need,
            "interior node out of space for a {} byte separator",
            need
        );

        let cell_start = node.header().free_end() as usize - separator.len();
        let key_len = separator.len();
        self.data[cell_start..cell_start + key_len].copy_from_slice(separator);

        let slot_base = PAGE_HEADER_SIZE;
        let src = slot_base + position * INTERIOR_SLOT_SIZE;
        let len = (count - position) * INTERIOR_SLOT_SIZE;
        self.data
            .copy_within(src..src + len, src + INTERIOR_SLOT_SIZE);
        let slot = InteriorSlot::new(left_child, cell_start as u16, key_len as u16);
        self.data[src..src + INTERIOR_SLOT_SIZE].copy_from_slice(slot.as_bytes());

        let header = self.header_mut();
        header.set_cell_count(count as u16 + 1);
        header.set_free_start(header.free_start() + INTERIOR_SLOT_SIZE as u16);
        header.set_free_end(cell_start as u16);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btree::LexicalComparator;
    use crate::storage::page::{PageHeader, PageType};

    const CMP: LexicalComparator = LexicalComparator;

    fn empty_interior(right: u64) -> Vec<u8> {
        let mut data = vec![0u8; PAGE_SIZE];
        PageHeader::new(PageType::BtreeIndex)
            .write_to(&mut data)
            .unwrap();
        InteriorNodeMut::init(&mut data, right).unwrap();
        data
    }

    #[test]
    fn init_sets_the_rightmost_child() {
        let data = empty_interior(99 * PAGE_SIZE as u64);
        let node = InteriorNode::from_page(&data).unwrap();

        assert_eq!(node.cell_count(), 0);
        assert_eq!(node.right_child(), 99 * PAGE_SIZE as u64);
    }

    #[test]
    fn separators_stay_sorted() {
        let mut data = empty_interior(400);
        let mut node = InteriorNodeMut::from_page(&mut data).unwrap();

        node.insert_separator(&CMP, b"m", 100).unwrap();
        node.insert_separator(&CMP, b"c", 200).unwrap();
        node.insert_separator(&CMP, b"t", 300).unwrap();

        let node = InteriorNode::from_page(&data).unwrap();
        assert_eq!(node.key_at(0).unwrap(), b"c");
        assert_eq!(node.key_at(1).unwrap(), b"m");
        assert_eq!(node.key_at(2).unwrap(), b"t");
        assert_eq!(node.child_at(0).unwrap(), 200);
        assert_eq!(node.child_at(1).unwrap(), 100);
        assert_eq!(node.child_at(2).unwrap(), 300);
    }

    #[test]
    fn find_child_routes_by_separator_ranges() {
        let mut data = empty_interior(400);
        let mut node = InteriorNodeMut::from_page(&mut data).unwrap();
        node.insert_separator(&CMP, b"g", 100).unwrap();
        node.insert_separator(&CMP, b"p", 200).unwrap();

        let node = InteriorNode::from_page(&data).unwrap();
        assert_eq!(node.find_child(&CMP, b"a").unwrap(), (100, 0));
        assert_eq!(node.find_child(&CMP, b"h").unwrap(), (200, 1));
        // equal keys descend right
        assert_eq!(node.find_child(&CMP, b"g").unwrap(), (200, 1));
        assert_eq!(node.find_child(&CMP, b"p").unwrap(), (400, 2));
        assert_eq!(node.find_child(&CMP, b"z").unwrap(), (400, 2));
    }

    #[test]
    fn ptr_left_is_the_first_child() {
        let mut data = empty_interior(400);
        let mut node = InteriorNodeMut::from_page(&mut data).unwrap();
        node.insert_separator(&CMP, b"k", 123).unwrap();

        assert_eq!(InteriorNode::from_page(&data).unwrap().ptr_left().unwrap(), 123);
    }
}
