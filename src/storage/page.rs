//! # Pages and On-Disk Headers
//!
//! Every page begins with a 32-byte [`PageHeader`], except the header page
//! (which carries the 64-byte [`FileHeader`] instead) and blob continuation
//! pages (which carry raw data across the whole page).
//!
//! ## Page Header Layout (32 bytes)
//!
//! ```text
//! Offset  Size  Field          Description
//! ------  ----  -------------  ----------------------------------------
//! 0       1     page_type      Type of page (BtreeIndex, Blob, ...)
//! 1       1     flags          bit 0: B-tree node is a leaf
//! 2       2     cell_count     Number of cells in a B-tree node
//! 4       2     free_start     Offset where free space begins
//! 6       2     free_end       Offset where free space ends
//! 8       8     left_sibling   Leaf: left neighbour. Interior: unused.
//! 16      8     right_sibling  Leaf: right neighbour. Interior: rightmost
//!                              child.
//! 24      2     frag_bytes     Fragmented free bytes in the cell area
//! 26      6     reserved
//! ```
//!
//! Sibling and child pointers are byte addresses (0 = none; the header page
//! at address 0 can never be a sibling).
//!
//! ## The `Page` Struct
//!
//! [`Page`] is the in-memory representation: the page buffer plus residency
//! metadata — dirty flag, without-header flag for blob continuations, a pin
//! counter, and the list of cursors currently coupled to the page. Cursors
//! are recorded by id, never by pointer; the cursor registry resolves ids
//! when a page is about to be evicted.

use eyre::{ensure, Result};
use zerocopy::little_endian::{U16, U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::{PAGE_HEADER_SIZE, PAGE_SIZE};
use crate::storage::device::zeroed_page;

pub const FILE_HEADER_SIZE: usize = 64;
pub const FILE_MAGIC: u32 = u32::from_le_bytes(*b"BRW1");
pub const FILE_VERSION: u32 = 1;

/// Flag bit in `PageHeader::flags`: the B-tree node stored here is a leaf.
pub const PAGE_FLAG_LEAF: u8 = 0x01;

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Unknown = 0x00,
    Header = 0x01,
    BtreeRoot = 0x02,
    BtreeIndex = 0x03,
    Blob = 0x04,
    PageManager = 0x05,
    FreelistOverflow = 0x06,
}

impl PageType {
    pub fn from_byte(b: u8) -> Self {
        match b {
            0x01 => PageType::Header,
            0x02 => PageType::BtreeRoot,
            0x03 => PageType::BtreeIndex,
            0x04 => PageType::Blob,
            0x05 => PageType::PageManager,
            0x06 => PageType::FreelistOverflow,
            _ => PageType::Unknown,
        }
    }

    /// True for the two page types that host B-tree nodes.
    pub fn is_btree(self) -> bool {
        matches!(self, PageType::BtreeRoot | PageType::BtreeIndex)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct PageHeader {
    page_type: u8,
    flags: u8,
    cell_count: U16,
    free_start: U16,
    free_end: U16,
    left_sibling: U64,
    right_sibling: U64,
    frag_bytes: U16,
    reserved: [u8; 6],
}

impl PageHeader {
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type: page_type as u8,
            flags: 0,
            cell_count: U16::new(0),
            free_start: U16::new(PAGE_HEADER_SIZE as u16),
            free_end: U16::new(PAGE_SIZE as u16),
            left_sibling: U64::new(0),
            right_sibling: U64::new(0),
            frag_bytes: U16::new(0),
            reserved: [0; 6],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read PageHeader: {:?}", e))
    }

    pub fn write_to(&self, data: &mut [u8]) -> Result<()> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for PageHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        data[..size_of::<Self>()].copy_from_slice(self.as_bytes());
        Ok(())
    }

    pub fn page_type(&self) -> PageType {
        PageType::from_byte(self.page_type)
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type as u8;
    }

    pub fn is_leaf(&self) -> bool {
        self.flags & PAGE_FLAG_LEAF != 0
    }

    pub fn set_leaf(&mut self, leaf: bool) {
        if leaf {
            self.flags |= PAGE_FLAG_LEAF;
        } else {
            self.flags &= !PAGE_FLAG_LEAF;
        }
    }

    pub fn free_space(&self) -> u16 {
        self.free_end.get().saturating_sub(self.free_start.get())
    }

    zerocopy_accessors! {
        cell_count: u16,
        free_start: u16,
        free_end: u16,
        left_sibling: u64,
        right_sibling: u64,
        frag_bytes: u16,
    }
}

/// Header of page 0: file identity plus the two fields the engine reads
/// back at open time — the B-tree root address and the address of the
/// page-manager state chain.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FileHeader {
    magic: U32,
    version: U32,
    page_size: U32,
    flags: U32,
    page_manager_blobid: U64,
    root_page: U64,
    reserved: [u8; 32],
}

impl FileHeader {
    pub fn new() -> Self {
        Self {
            magic: U32::new(FILE_MAGIC),
            version: U32::new(FILE_VERSION),
            page_size: U32::new(PAGE_SIZE as u32),
            flags: U32::new(0),
            page_manager_blobid: U64::new(0),
            root_page: U64::new(0),
            reserved: [0; 32],
        }
    }

    pub fn from_bytes(data: &[u8]) -> Result<&Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for FileHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::ref_from_bytes(&data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read FileHeader: {:?}", e))
    }

    pub fn from_bytes_mut(data: &mut [u8]) -> Result<&mut Self> {
        ensure!(
            data.len() >= size_of::<Self>(),
            "buffer too small for FileHeader: {} < {}",
            data.len(),
            size_of::<Self>()
        );
        Self::mut_from_bytes(&mut data[..size_of::<Self>()])
            .map_err(|e| eyre::eyre!("failed to read FileHeader: {:?}", e))
    }

    pub fn validate(&self) -> Result<()> {
        ensure!(
            self.magic.get() == FILE_MAGIC,
            "bad file magic: {:08x}",
            self.magic.get()
        );
        ensure!(
            self.version.get() == FILE_VERSION,
            "unsupported file version: {}",
            self.version.get()
        );
        ensure!(
            self.page_size.get() as usize == PAGE_SIZE,
            "page size mismatch: file has {}, build uses {}",
            self.page_size.get(),
            PAGE_SIZE
        );
        Ok(())
    }

    zerocopy_accessors! {
        magic: u32,
        version: u32,
        page_size: u32,
        page_manager_blobid: u64,
        root_page: u64,
    }
}

impl Default for FileHeader {
    fn default() -> Self {
        Self::new()
    }
}

/// An in-memory page: the buffer plus residency metadata.
pub struct Page {
    address: u64,
    page_type: PageType,
    dirty: bool,
    without_header: bool,
    db: Option<u32>,
    pin: u32,
    cursors: Vec<u64>,
    /// LRU stamp, maintained by the cache.
    pub(crate) last_access: u64,
    data: Box<[u8]>,
}

impl Page {
    /// Creates a zero-filled page at `address`.
    pub fn new(address: u64, db: Option<u32>) -> Self {
        debug_assert!(address % PAGE_SIZE as u64 == 0, "unaligned page address");
        Self {
            address,
            page_type: PageType::Unknown,
            dirty: false,
            without_header: false,
            db,
            pin: 0,
            cursors: Vec::new(),
            last_access: 0,
            data: zeroed_page(),
        }
    }

    pub fn address(&self) -> u64 {
        self.address
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    /// Sets the page type, mirroring it into the persistent header so the
    /// type survives a flush. Without-header pages track the type only in
    /// memory.
    pub fn set_page_type(&mut self, page_type: PageType) {
        self.page_type = page_type;
        if !self.without_header && self.address != 0 {
            if let Ok(header) = PageHeader::from_bytes_mut(&mut self.data) {
                header.set_page_type(page_type);
            }
        }
    }

    /// Re-reads the page type from the persistent header after a fetch.
    pub fn load_type_from_header(&mut self) {
        if self.without_header {
            return;
        }
        self.page_type = if self.address == 0 {
            PageType::Header
        } else {
            PageHeader::from_bytes(&self.data)
                .map(|h| h.page_type())
                .unwrap_or(PageType::Unknown)
        };
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn set_dirty(&mut self, dirty: bool) {
        self.dirty = dirty;
    }

    pub fn is_without_header(&self) -> bool {
        self.without_header
    }

    pub fn set_without_header(&mut self, without_header: bool) {
        self.without_header = without_header;
    }

    pub fn db(&self) -> Option<u32> {
        self.db
    }

    pub fn set_db(&mut self, db: Option<u32>) {
        self.db = db;
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        &mut self.data
    }

    /// Raw buffer access that does not mark the page dirty (fetch paths).
    pub(crate) fn buffer_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    /// Usable bytes: past the page header, or the whole page for blob
    /// continuation pages.
    pub fn payload(&self) -> &[u8] {
        if self.without_header {
            &self.data
        } else {
            &self.data[PAGE_HEADER_SIZE..]
        }
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        self.dirty = true;
        if self.without_header {
            &mut self.data
        } else {
            &mut self.data[PAGE_HEADER_SIZE..]
        }
    }

    pub fn header(&self) -> Result<&PageHeader> {
        ensure!(
            !self.without_header,
            "page {} has no persistent header",
            self.address
        );
        PageHeader::from_bytes(&self.data)
    }

    pub fn header_mut(&mut self) -> Result<&mut PageHeader> {
        ensure!(
            !self.without_header,
            "page {} has no persistent header",
            self.address
        );
        self.dirty = true;
        PageHeader::from_bytes_mut(&mut self.data)
    }

    pub fn pin(&mut self) {
        self.pin += 1;
    }

    pub fn unpin(&mut self) {
        debug_assert!(self.pin > 0, "unpin of unpinned page");
        self.pin = self.pin.saturating_sub(1);
    }

    pub fn pin_count(&self) -> u32 {
        self.pin
    }

    pub fn add_cursor(&mut self, cursor: u64) {
        debug_assert!(!self.cursors.contains(&cursor), "cursor coupled twice");
        self.cursors.push(cursor);
    }

    pub fn remove_cursor(&mut self, cursor: u64) {
        self.cursors.retain(|&c| c != cursor);
    }

    pub fn cursors(&self) -> &[u64] {
        &self.cursors
    }

    pub fn has_cursors(&self) -> bool {
        !self.cursors.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_header_size_is_32_bytes() {
        assert_eq!(size_of::<PageHeader>(), PAGE_HEADER_SIZE);
    }

    #[test]
    fn file_header_size_is_64_bytes() {
        assert_eq!(size_of::<FileHeader>(), FILE_HEADER_SIZE);
    }

    #[test]
    fn page_type_round_trips_through_byte() {
        for t in [
            PageType::Header,
            PageType::BtreeRoot,
            PageType::BtreeIndex,
            PageType::Blob,
            PageType::PageManager,
            PageType::FreelistOverflow,
        ] {
            assert_eq!(PageType::from_byte(t as u8), t);
        }
        assert_eq!(PageType::from_byte(0xFF), PageType::Unknown);
    }

    #[test]
    fn page_header_new_initializes_free_range() {
        let header = PageHeader::new(PageType::BtreeIndex);

        assert_eq!(header.page_type(), PageType::BtreeIndex);
        assert_eq!(header.cell_count(), 0);
        assert_eq!(header.free_start(), PAGE_HEADER_SIZE as u16);
        assert_eq!(header.free_end(), PAGE_SIZE as u16);
        assert_eq!(header.free_space(), (PAGE_SIZE - PAGE_HEADER_SIZE) as u16);
    }

    #[test]
    fn leaf_flag_round_trips() {
        let mut header = PageHeader::new(PageType::BtreeRoot);
        assert!(!header.is_leaf());

        header.set_leaf(true);
        assert!(header.is_leaf());

        header.set_leaf(false);
        assert!(!header.is_leaf());
    }

    #[test]
    fn sibling_pointers_round_trip() {
        let mut header = PageHeader::new(PageType::BtreeIndex);

        header.set_left_sibling(3 * PAGE_SIZE as u64);
        header.set_right_sibling(7 * PAGE_SIZE as u64);

        assert_eq!(header.left_sibling(), 3 * PAGE_SIZE as u64);
        assert_eq!(header.right_sibling(), 7 * PAGE_SIZE as u64);
    }

    #[test]
    fn file_header_validates_magic_and_version() {
        let header = FileHeader::new();
        assert!(header.validate().is_ok());

        let mut bad = FileHeader::new();
        bad.set_magic(0xDEAD);
        assert!(bad.validate().is_err());
    }

    #[test]
    fn page_type_persists_into_header_byte() {
        let mut page = Page::new(PAGE_SIZE as u64, None);
        page.set_page_type(PageType::Blob);

        assert_eq!(page.data()[0], PageType::Blob as u8);

        page.load_type_from_header();
        assert_eq!(page.page_type(), PageType::Blob);
    }

    #[test]
    fn without_header_page_uses_full_payload() {
        let mut page = Page::new(PAGE_SIZE as u64, None);
        assert_eq!(page.payload().len(), PAGE_SIZE - PAGE_HEADER_SIZE);

        page.set_without_header(true);
        assert_eq!(page.payload().len(), PAGE_SIZE);
        assert!(page.header().is_err());
    }

    #[test]
    fn cursor_list_add_remove() {
        let mut page = Page::new(PAGE_SIZE as u64, None);
        assert!(!page.has_cursors());

        page.add_cursor(1);
        page.add_cursor(2);
        assert_eq!(page.cursors(), &[1, 2]);

        page.remove_cursor(1);
        assert_eq!(page.cursors(), &[2]);
    }

    #[test]
    fn pin_counter_round_trips() {
        let mut page = Page::new(PAGE_SIZE as u64, None);
        page.pin();
        page.pin();
        assert_eq!(page.pin_count(), 2);

        page.unpin();
        page.unpin();
        assert_eq!(page.pin_count(), 0);
    }

    #[test]
    fn payload_mut_marks_dirty() {
        let mut page = Page::new(PAGE_SIZE as u64, None);
        assert!(!page.is_dirty());

        page.payload_mut()[0] = 1;
        assert!(page.is_dirty());
    }
}
