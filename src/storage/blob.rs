//! # Record References and the Blob Store
//!
//! A record in a B-tree leaf is a fixed 9-byte reference. Small payloads
//! live inline in the reference itself; everything else goes out of line
//! into blob pages.
//!
//! ## Reference Layout (9 bytes)
//!
//! ```text
//! [class u8][8 payload bytes]
//!
//! class 0  Empty  payload unused
//! class 1  Tiny   record of 1..7 bytes; data in bytes 0..len, len in byte 7
//! class 2  Small  record of exactly 8 bytes, stored verbatim
//! class 3  Blob   u64 byte offset of the blob header in the file
//! ```
//!
//! ## Blob Layout
//!
//! A blob is a varint size prefix followed by the raw bytes. Small blobs are
//! appended into the current *last blob page* while room remains (the page
//! header's `free_start` tracks the fill, `cell_count` the number of live
//! blobs). Larger blobs take a dedicated run of contiguous pages: the first
//! page keeps its header, continuation pages are raw and addressable only
//! through the run.
//!
//! Freeing decrements the page's live-blob count and returns the whole run
//! to the freelist once it reaches zero.

use eyre::{ensure, Result};

use crate::config::{
    PAGE_HEADER_SIZE, PAGE_PAYLOAD_SIZE, PAGE_SIZE, SMALL_RECORD_SIZE, TINY_RECORD_MAX,
};
use crate::encoding::{decode_varint, encode_varint, varint_len};
use crate::storage::manager::{FetchFlags, PageManager};
use crate::storage::page::{PageHeader, PageType};

pub const RECORD_REF_SIZE: usize = 9;

const CLASS_EMPTY: u8 = 0;
const CLASS_TINY: u8 = 1;
const CLASS_SMALL: u8 = 2;
const CLASS_BLOB: u8 = 3;

const P: u64 = PAGE_SIZE as u64;

/// A leaf record slot: the storage class plus inline bytes or a blob
/// address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordRef {
    Empty,
    Tiny { len: u8, data: [u8; 7] },
    Small([u8; 8]),
    Blob(u64),
}

impl RecordRef {
    pub fn encode(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() >= RECORD_REF_SIZE);
        buf[..RECORD_REF_SIZE].fill(0);
        match self {
            RecordRef::Empty => buf[0] = CLASS_EMPTY,
            RecordRef::Tiny { len, data } => {
                buf[0] = CLASS_TINY;
                buf[1..8].copy_from_slice(data);
                buf[8] = *len;
            }
            RecordRef::Small(data) => {
                buf[0] = CLASS_SMALL;
                buf[1..9].copy_from_slice(data);
            }
            RecordRef::Blob(id) => {
                buf[0] = CLASS_BLOB;
                buf[1..9].copy_from_slice(&id.to_le_bytes());
            }
        }
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        ensure!(
            buf.len() >= RECORD_REF_SIZE,
            "buffer too small for record reference: {}",
            buf.len()
        );
        match buf[0] {
            CLASS_EMPTY => Ok(RecordRef::Empty),
            CLASS_TINY => {
                let len = buf[8];
                ensure!(
                    (len as usize) <= TINY_RECORD_MAX,
                    "tiny record length {} out of range",
                    len
                );
                let mut data = [0u8; 7];
                data.copy_from_slice(&buf[1..8]);
                Ok(RecordRef::Tiny { len, data })
            }
            CLASS_SMALL => {
                let mut data = [0u8; 8];
                data.copy_from_slice(&buf[1..9]);
                Ok(RecordRef::Small(data))
            }
            CLASS_BLOB => Ok(RecordRef::Blob(u64::from_le_bytes(
                buf[1..9].try_into().expect("fixed-width slice"),
            ))),
            other => eyre::bail!("unknown record class {}", other),
        }
    }

    pub fn is_inline(&self) -> bool {
        !matches!(self, RecordRef::Blob(_))
    }
}

/// Stores `data` and returns its reference: inline when it fits, otherwise
/// as a blob.
pub fn write_record(pm: &mut PageManager, data: &[u8]) -> Result<RecordRef> {
    if data.is_empty() {
        return Ok(RecordRef::Empty);
    }
    if data.len() <= TINY_RECORD_MAX {
        let mut inline = [0u8; 7];
        inline[..data.len()].copy_from_slice(data);
        return Ok(RecordRef::Tiny {
            len: data.len() as u8,
            data: inline,
        });
    }
    if data.len() == SMALL_RECORD_SIZE {
        let mut inline = [0u8; 8];
        inline.copy_from_slice(data);
        return Ok(RecordRef::Small(inline));
    }
    Ok(RecordRef::Blob(blob_alloc(pm, data)?))
}

/// Materializes the record bytes behind a reference.
pub fn read_record(pm: &mut PageManager, rref: RecordRef) -> Result<Vec<u8>> {
    match rref {
        RecordRef::Empty => Ok(Vec::new()),
        RecordRef::Tiny { len, data } => Ok(data[..len as usize].to_vec()),
        RecordRef::Small(data) => Ok(data.to_vec()),
        RecordRef::Blob(id) => blob_read(pm, id),
    }
}

/// Releases out-of-line storage held by a reference. Inline classes need no
/// cleanup.
pub fn free_record(pm: &mut PageManager, rref: RecordRef) -> Result<()> {
    match rref {
        RecordRef::Blob(id) => blob_free(pm, id),
        _ => Ok(()),
    }
}

fn pages_for(total: usize) -> u32 {
    if total <= PAGE_PAYLOAD_SIZE {
        1
    } else {
        1 + (total - PAGE_PAYLOAD_SIZE).div_ceil(PAGE_SIZE) as u32
    }
}

/// Initializes the node header of a fresh blob page.
fn init_blob_page(pm: &mut PageManager, address: u64) -> Result<()> {
    let page = pm.cached_mut(address)?;
    let header = PageHeader::new(PageType::Blob);
    header.write_to(page.data_mut())?;
    Ok(())
}

/// Writes `data` as a blob and returns its id (the byte offset of the size
/// prefix).
pub fn blob_alloc(pm: &mut PageManager, data: &[u8]) -> Result<u64> {
    let total = varint_len(data.len() as u64) + data.len();

    if total <= PAGE_PAYLOAD_SIZE {
        // append to the current blob page when there is room; a stale hint
        // (the page was recycled since the hint was persisted) is ignored
        if let Some(address) = pm.last_blob_page()? {
            let page = pm.cached_mut(address)?;
            if page.page_type() == PageType::Blob && !page.is_without_header() {
                let fill = page.header()?.free_start() as usize;
                if PAGE_SIZE - fill >= total {
                    let blob_id = address + fill as u64;
                    write_inline_blob(page.data_mut(), fill, data);
                    let header = page.header_mut()?;
                    header.set_free_start((fill + total) as u16);
                    header.set_cell_count(header.cell_count() + 1);
                    pm.set_last_blob_page(Some(address));
                    return Ok(blob_id);
                }
            }
        }

        let address = pm.alloc(None, PageType::Blob, Default::default())?;
        init_blob_page(pm, address)?;
        let page = pm.cached_mut(address)?;
        write_inline_blob(page.data_mut(), PAGE_HEADER_SIZE, data);
        let header = page.header_mut()?;
        header.set_free_start((PAGE_HEADER_SIZE + total) as u16);
        header.set_cell_count(1);
        pm.set_last_blob_page(Some(address));
        return Ok(address + PAGE_HEADER_SIZE as u64);
    }

    // dedicated run; the first page is marked full so appends skip it
    let num_pages = pages_for(total);
    let base = pm.alloc_multi_blob(num_pages)?;
    init_blob_page(pm, base)?;
    {
        let page = pm.cached_mut(base)?;
        let header = page.header_mut()?;
        header.set_free_start(PAGE_SIZE as u16);
        header.set_cell_count(1);
    }

    let mut prefix = [0u8; 9];
    let prefix_len = encode_varint(data.len() as u64, &mut prefix);

    // first page carries the prefix plus the leading slice of the data
    let first_data = PAGE_PAYLOAD_SIZE - prefix_len;
    let head = data.len().min(first_data);
    {
        let page = pm.cached_mut(base)?;
        let buf = page.data_mut();
        buf[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + prefix_len].copy_from_slice(&prefix[..prefix_len]);
        buf[PAGE_HEADER_SIZE + prefix_len..PAGE_HEADER_SIZE + prefix_len + head]
            .copy_from_slice(&data[..head]);
    }

    let mut written = head;
    let mut address = base + P;
    while written < data.len() {
        let chunk = (data.len() - written).min(PAGE_SIZE);
        let page = pm.cached_mut(address)?;
        debug_assert!(page.is_without_header());
        page.data_mut()[..chunk].copy_from_slice(&data[written..written + chunk]);
        written += chunk;
        address += P;
    }

    Ok(base + PAGE_HEADER_SIZE as u64)
}

fn write_inline_blob(buf: &mut [u8], offset: usize, data: &[u8]) {
    let mut prefix = [0u8; 9];
    let prefix_len = encode_varint(data.len() as u64, &mut prefix);
    buf[offset..offset + prefix_len].copy_from_slice(&prefix[..prefix_len]);
    buf[offset + prefix_len..offset + prefix_len + data.len()].copy_from_slice(data);
}

/// Reads back the size prefix of a blob. Returns (size, prefix_len, first
/// page address, offset within it).
fn blob_header(pm: &mut PageManager, blob_id: u64) -> Result<(usize, usize, u64, usize)> {
    let page_address = blob_id - blob_id % P;
    let offset = (blob_id % P) as usize;
    ensure!(
        offset >= PAGE_HEADER_SIZE,
        "blob id {:#x} points into a page header",
        blob_id
    );
    let page = pm
        .fetch(None, page_address, FetchFlags::default())?
        .ok_or_else(|| eyre::eyre!("blob page {:#x} unavailable", page_address))?;
    let (size, prefix_len) = decode_varint(&page.data()[offset..])?;
    Ok((size as usize, prefix_len, page_address, offset))
}

pub fn blob_read(pm: &mut PageManager, blob_id: u64) -> Result<Vec<u8>> {
    let (size, prefix_len, page_address, offset) = blob_header(pm, blob_id)?;

    let mut out = Vec::with_capacity(size);
    let data_start = offset + prefix_len;
    let head = size.min(PAGE_SIZE - data_start);
    {
        let page = pm.cached(page_address)?;
        out.extend_from_slice(&page.data()[data_start..data_start + head]);
    }

    let mut address = page_address + P;
    while out.len() < size {
        let chunk = (size - out.len()).min(PAGE_SIZE);
        let page = pm
            .fetch(None, address, FetchFlags::NO_HEADER)?
            .ok_or_else(|| eyre::eyre!("blob continuation page {:#x} unavailable", address))?;
        out.extend_from_slice(&page.data()[..chunk]);
        address += P;
    }

    Ok(out)
}

pub fn blob_free(pm: &mut PageManager, blob_id: u64) -> Result<()> {
    if pm.config().in_memory {
        return Ok(());
    }
    let (size, prefix_len, page_address, offset) = blob_header(pm, blob_id)?;
    let total = prefix_len + size;

    if offset == PAGE_HEADER_SIZE && total > PAGE_PAYLOAD_SIZE {
        // dedicated multi-page run
        if pm.last_blob_page()? == Some(page_address) {
            pm.set_last_blob_page(None);
        }
        return pm.del(page_address, pages_for(total));
    }

    let page = pm.cached_mut(page_address)?;
    let header = page.header_mut()?;
    let live = header.cell_count().saturating_sub(1);
    header.set_cell_count(live);
    if live == 0 {
        if pm.last_blob_page()? == Some(page_address) {
            pm.set_last_blob_page(None);
        }
        pm.del(page_address, 1)?;
    }
    Ok(())
}
