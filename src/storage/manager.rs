//! # Page Manager
//!
//! The page manager allocates, fetches and deletes pages, keeps the cache
//! and the freelist consistent, and persists its own state — the freelist
//! plus the last-blob-page hint — into a linked chain of manager pages.
//!
//! ## Allocation
//!
//! Allocation prefers the freelist (first entry, lowest address) and falls
//! back to extending the file. Multi-page blob allocation searches the
//! freelist for a run of sufficient length, splitting the remainder back
//! into the list; fresh multi-page runs are carved from the end of the file
//! with state storage disabled so no overflow page lands in the middle of
//! the run.
//!
//! ## State Chain Layout
//!
//! Per manager page payload:
//!
//! ```text
//! First page only: u64  last_blob_page_id
//! Every page:      u64  next_overflow_page_address (0 = end of chain)
//!                  u32  entry_count
//!                  entry_count entries:
//!                    1 byte header: high nibble = run length (1..15),
//!                                   low nibble  = n, bytes that follow
//!                    n bytes: base_address / PAGE_SIZE, low byte first
//! ```
//!
//! Contiguous freelist entries are merged up to 15 pages per encoded entry.
//! A page is full when the next worst-case entry (9 bytes) would cross the
//! payload; the chain then continues in an overflow page, reusing the
//! existing next pointer when one is set. A chain shrunk by a rewrite
//! orphans its tail: the first orphaned page is pushed to the freelist, any
//! deeper links are forgotten.
//!
//! ## Deletion
//!
//! `del` only updates the in-memory freelist. The change is not persisted
//! immediately: a stale on-disk freelist at most leaks space after a crash.
//!
//! ## Reclamation
//!
//! `reclaim_space` trims free pages off the end of the file page by page,
//! then forces a state store and truncates the device.

use eyre::{ensure, Result};
use tracing::debug;

use crate::config::{
    Config, FREELIST_RUN_MAX, HEADER_PAGE_ADDRESS, PAGE_PAYLOAD_SIZE, PAGE_SIZE,
    STATE_ENTRY_MAX_BYTES,
};
use crate::encoding::{decode_compact_u64, encode_compact_u64};
use crate::storage::cache::PageCache;
use crate::storage::changeset::{Changeset, LsnManager};
use crate::storage::device::{zeroed_page, Device};
use crate::storage::freelist::Freelist;
use crate::storage::page::{FileHeader, Page, PageType};

const P: u64 = PAGE_SIZE as u64;

/// Offset of the overflow pointer within a state page payload.
const STATE_FIRST_EXTRA: usize = 8;
/// Overflow pointer (8) plus entry counter (4).
const STATE_BLOCK_HEADER: usize = 12;

#[derive(Debug, Clone, Copy, Default)]
pub struct AllocFlags {
    /// Always extend the file instead of reusing a free page.
    pub ignore_freelist: bool,
    /// Zero the payload of the allocated page.
    pub clear_with_zero: bool,
    /// Suppress the state store that normally follows an allocation.
    pub disable_store_state: bool,
}

impl AllocFlags {
    pub const IGNORE_FREELIST: Self = Self {
        ignore_freelist: true,
        clear_with_zero: false,
        disable_store_state: false,
    };
}

#[derive(Debug, Clone, Copy, Default)]
pub struct FetchFlags {
    /// The page is a blob continuation and carries no persistent header.
    pub no_header: bool,
    /// Return `None` instead of reading from the device on a cache miss.
    pub only_from_cache: bool,
    /// Do not enlist the page in the changeset or store state.
    pub read_only: bool,
}

impl FetchFlags {
    pub const NO_HEADER: Self = Self {
        no_header: true,
        only_from_cache: false,
        read_only: false,
    };
    pub const ONLY_FROM_CACHE: Self = Self {
        no_header: false,
        only_from_cache: true,
        read_only: false,
    };
}

/// Engine counters, reported through `Database::metrics`.
#[derive(Debug, Default, Clone, Copy)]
pub struct Metrics {
    pub page_count_fetched: u64,
    pub page_count_flushed: u64,
    pub page_count_type_index: u64,
    pub page_count_type_blob: u64,
    pub page_count_type_page_manager: u64,
    pub freelist_hits: u64,
    pub freelist_misses: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub cache_allocated_elements: u64,
}

pub struct PageManager {
    device: Box<dyn Device>,
    config: Config,
    cache: PageCache,
    free_pages: Freelist,
    changeset: Changeset,
    lsn: LsnManager,
    /// First page of the persisted state chain, owned by the manager and
    /// never resident in the cache.
    state_page: Option<Page>,
    /// Address of the cached last blob page, when resident.
    last_blob_page: Option<u64>,
    /// Persisted hint; zero when `last_blob_page` holds the resolution.
    last_blob_page_id: u64,
    /// The on-disk chain no longer matches `free_pages`.
    needs_flush: bool,
    page_count_fetched: u64,
    page_count_flushed: u64,
    page_count_index: u64,
    page_count_blob: u64,
    page_count_page_manager: u64,
    freelist_hits: u64,
    freelist_misses: u64,
}

fn flush_page(device: &mut dyn Device, page: &mut Page, flushed: &mut u64) -> Result<()> {
    if page.is_dirty() {
        device.write(page.address(), page.data())?;
        page.set_dirty(false);
        *flushed += 1;
    }
    Ok(())
}

impl PageManager {
    pub fn new(device: Box<dyn Device>, config: Config) -> Self {
        let cache = PageCache::new(config.cache_capacity);
        Self {
            device,
            config,
            cache,
            free_pages: Freelist::new(),
            changeset: Changeset::new(),
            lsn: LsnManager::new(),
            state_page: None,
            last_blob_page: None,
            last_blob_page_id: 0,
            needs_flush: false,
            page_count_fetched: 0,
            page_count_flushed: 0,
            page_count_index: 0,
            page_count_blob: 0,
            page_count_page_manager: 0,
            freelist_hits: 0,
            freelist_misses: 0,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn cache(&self) -> &PageCache {
        &self.cache
    }

    pub(crate) fn cache_mut(&mut self) -> &mut PageCache {
        &mut self.cache
    }

    pub fn changeset(&self) -> &Changeset {
        &self.changeset
    }

    pub fn changeset_mut(&mut self) -> &mut Changeset {
        &mut self.changeset
    }

    pub fn needs_flush(&self) -> bool {
        self.needs_flush
    }

    pub fn is_cache_full(&self) -> bool {
        self.cache.is_full()
    }

    pub fn file_size(&self) -> Result<u64> {
        self.device.file_size()
    }

    pub fn free_runs(&self) -> Vec<(u64, u32)> {
        self.free_pages.runs()
    }

    pub fn is_page_free(&self, address: u64) -> bool {
        self.free_pages.run_covering(address).is_some()
    }

    pub fn state_page_address(&self) -> Option<u64> {
        self.state_page.as_ref().map(|p| p.address())
    }

    /// Borrows a page that is known to be resident.
    pub fn cached_mut(&mut self, address: u64) -> Result<&mut Page> {
        self.cache.resident_mut(address)
    }

    pub fn cached(&self, address: u64) -> Result<&Page> {
        self.cache.resident(address)
    }

    fn extend_file(&mut self) -> Result<u64> {
        let address = self.device.file_size()?;
        ensure!(address % P == 0, "file size {} is not page aligned", address);
        let zeros = zeroed_page();
        self.device.write(address, &zeros)?;
        Ok(address)
    }

    /// Creates the header page of a fresh database.
    pub fn setup_header_page(&mut self) -> Result<()> {
        ensure!(
            self.device.file_size()? == 0,
            "header setup on a non-empty device"
        );
        let address = self.extend_file()?;
        let mut page = Page::new(address, None);
        page.set_page_type(PageType::Header);
        let header = FileHeader::new();
        page.data_mut()[..size_of::<FileHeader>()].copy_from_slice(zerocopy::IntoBytes::as_bytes(&header));
        self.cache.put(page);
        Ok(())
    }

    /// Loads the header page of an existing database into the cache.
    pub fn load_header_page(&mut self) -> Result<()> {
        let page = self
            .fetch(None, HEADER_PAGE_ADDRESS, FetchFlags::default())?
            .ok_or_else(|| eyre::eyre!("header page unavailable"))?;
        FileHeader::from_bytes(page.data())?.validate()
    }

    pub fn page_manager_blobid(&self) -> Result<u64> {
        let page = self.cache.resident(HEADER_PAGE_ADDRESS)?;
        Ok(FileHeader::from_bytes(page.data())?.page_manager_blobid())
    }

    pub fn set_page_manager_blobid(&mut self, id: u64) -> Result<()> {
        let page = self.cache.resident_mut(HEADER_PAGE_ADDRESS)?;
        FileHeader::from_bytes_mut(page.data_mut())?.set_page_manager_blobid(id);
        Ok(())
    }

    pub fn root_page(&self) -> Result<u64> {
        let page = self.cache.resident(HEADER_PAGE_ADDRESS)?;
        Ok(FileHeader::from_bytes(page.data())?.root_page())
    }

    pub fn set_root_page(&mut self, address: u64) -> Result<()> {
        let page = self.cache.resident_mut(HEADER_PAGE_ADDRESS)?;
        FileHeader::from_bytes_mut(page.data_mut())?.set_root_page(address);
        Ok(())
    }

    /// Fetches a page, reading it from the device on a cache miss. Returns
    /// `None` on a miss when `only_from_cache` is set or the database is
    /// in-memory.
    pub fn fetch(
        &mut self,
        db: Option<u32>,
        address: u64,
        flags: FetchFlags,
    ) -> Result<Option<&mut Page>> {
        let enlist =
            self.config.enable_recovery && !self.config.read_only && !flags.read_only;

        if self.cache.get(address).is_some() {
            if enlist {
                self.changeset.put(address);
            }
            let page = self.cache.resident_mut(address)?;
            if flags.no_header {
                page.set_without_header(true);
            }
            return Ok(Some(page));
        }

        if flags.only_from_cache || self.config.in_memory {
            return Ok(None);
        }

        let mut page = Page::new(address, db);
        self.device.read(address, page.buffer_mut())?;
        if flags.no_header {
            page.set_without_header(true);
        }
        page.load_type_from_header();
        self.cache.put(page);

        if !flags.read_only && !self.config.read_only {
            self.maybe_store_state(false)?;
        }
        if enlist {
            self.changeset.put(address);
        }
        self.page_count_fetched += 1;

        Ok(Some(self.cache.resident_mut(address)?))
    }

    /// Allocates one page, reusing the first freelist run when allowed.
    /// Returns the page address; the page is resident and dirty.
    pub fn alloc(
        &mut self,
        db: Option<u32>,
        page_type: PageType,
        flags: AllocFlags,
    ) -> Result<u64> {
        let mut reused = None;
        if !flags.ignore_freelist {
            if let Some((base, _run)) = self.free_pages.take_first() {
                // the entire run is consumed by this allocation
                self.needs_flush = true;
                self.freelist_hits += 1;
                if !self.cache.contains(base) {
                    let mut page = Page::new(base, db);
                    self.device.read(base, page.buffer_mut())?;
                    self.cache.put(page);
                }
                reused = Some(base);
            }
        }

        let address = match reused {
            Some(address) => address,
            None => {
                // the device backs in-memory pages too, which keeps address
                // assignment uniform across modes
                self.freelist_misses += 1;
                let address = self.extend_file()?;
                self.cache.put(Page::new(address, db));
                address
            }
        };

        {
            let page = self.cache.resident_mut(address)?;
            if flags.clear_with_zero {
                page.payload_mut().fill(0);
            }
            page.set_without_header(false);
            page.set_page_type(page_type);
            page.set_dirty(true);
            page.set_db(db);
        }

        if self.config.enable_recovery {
            self.changeset.put(address);
        }
        if !flags.disable_store_state && !self.config.read_only {
            self.maybe_store_state(false)?;
        }

        match page_type {
            PageType::BtreeRoot | PageType::BtreeIndex => self.page_count_index += 1,
            PageType::PageManager | PageType::FreelistOverflow => {
                self.page_count_page_manager += 1
            }
            PageType::Blob => self.page_count_blob += 1,
            _ => {}
        }

        Ok(address)
    }

    /// Allocates `num_pages` contiguous blob pages. The first page keeps its
    /// header; continuation pages are raw. Returns the address of the first
    /// page.
    pub fn alloc_multi_blob(&mut self, num_pages: u32) -> Result<u64> {
        ensure!(num_pages >= 1, "empty blob allocation");
        if num_pages == 1 {
            return self.alloc(None, PageType::Blob, AllocFlags::default());
        }

        if num_pages <= FREELIST_RUN_MAX {
            if let Some((base, run)) = self.free_pages.find_run_at_least(num_pages) {
                self.free_pages.erase(base);
                if run > num_pages {
                    self.free_pages
                        .insert(base + num_pages as u64 * P, run - num_pages);
                }
                self.needs_flush = true;

                for i in 0..num_pages {
                    let address = base + i as u64 * P;
                    let flags = if i == 0 {
                        FetchFlags::default()
                    } else {
                        FetchFlags::NO_HEADER
                    };
                    let page = self.fetch(None, address, flags)?.ok_or_else(|| {
                        eyre::eyre!("freed blob page {} unavailable", address)
                    })?;
                    page.set_without_header(i != 0);
                    page.set_page_type(PageType::Blob);
                    page.set_dirty(true);
                }
                return Ok(base);
            }
        }

        // fresh run from the end of the file; state storage stays off so no
        // overflow page lands in the middle of the sequence
        let flags = AllocFlags {
            ignore_freelist: true,
            clear_with_zero: false,
            disable_store_state: true,
        };
        let first = self.alloc(None, PageType::Blob, flags)?;
        for _ in 1..num_pages {
            let address = self.alloc(None, PageType::Blob, flags)?;
            self.cache.resident_mut(address)?.set_without_header(true);
        }
        self.maybe_store_state(false)?;
        Ok(first)
    }

    /// Returns a run of pages to the freelist. No-op for in-memory
    /// databases. The state chain is not rewritten here: a stale on-disk
    /// freelist at most leaks space.
    pub fn del(&mut self, address: u64, page_count: u32) -> Result<()> {
        ensure!(page_count >= 1, "empty page deletion");
        if self.config.in_memory {
            return Ok(());
        }
        ensure!(
            address != 0 && address % P == 0,
            "invalid page address {:#x}",
            address
        );
        self.needs_flush = true;
        self.free_pages.insert(address, page_count);
        Ok(())
    }

    /// Merges contiguous freelist entries into encodable runs of at most 15
    /// pages.
    fn encoded_runs(&self) -> Vec<(u64, u32)> {
        let mut out: Vec<(u64, u32)> = Vec::new();
        for (base, run) in self.free_pages.iter() {
            if let Some(last) = out.last_mut() {
                if last.0 + last.1 as u64 * P == base && last.1 + run <= FREELIST_RUN_MAX {
                    last.1 += run;
                    continue;
                }
            }
            let mut base = base;
            let mut run = run;
            while run > FREELIST_RUN_MAX {
                out.push((base, FREELIST_RUN_MAX));
                base += FREELIST_RUN_MAX as u64 * P;
                run -= FREELIST_RUN_MAX;
            }
            out.push((base, run));
        }
        out
    }

    /// Persists the freelist and the last-blob-page hint into the state
    /// chain. Returns the address of the first chain page, or 0 when there
    /// is nothing to store.
    pub fn store_state(&mut self) -> Result<u64> {
        if !self.needs_flush {
            return Ok(self.state_page_address().unwrap_or(0));
        }
        self.needs_flush = false;

        if self.state_page.is_none() && self.free_pages.is_empty() {
            return Ok(0);
        }

        if self.state_page.is_none() {
            let address = self.extend_file()?;
            let mut page = Page::new(address, None);
            page.set_page_type(PageType::PageManager);
            page.set_dirty(true);
            self.state_page = Some(page);
            self.page_count_page_manager += 1;
        }

        let state_address = self.state_page_address().unwrap_or(0);
        if self.config.enable_recovery {
            self.changeset.put(state_address);
        }

        // a rewrite orphans the old chain; its head is returned to the
        // freelist, deeper links are forgotten
        let old_head_next = {
            let page = self.state_page.as_mut().expect("state page just ensured");
            page.set_dirty(true);
            let payload = page.payload();
            u64::from_le_bytes(
                payload[STATE_FIRST_EXTRA..STATE_FIRST_EXTRA + 8]
                    .try_into()
                    .expect("fixed-width slice"),
            )
        };
        if old_head_next != 0 {
            self.free_pages.insert(old_head_next, 1);
        }

        let blob_hint = self.last_blob_page.unwrap_or(self.last_blob_page_id);
        {
            let page = self.state_page.as_mut().expect("state page just ensured");
            page.payload_mut()[0..8].copy_from_slice(&blob_hint.to_le_bytes());
        }

        let runs = self.encoded_runs();
        let mut idx = 0usize;
        let mut target: Option<u64> = None; // None = the owned state page

        loop {
            let base_off = if target.is_none() { STATE_FIRST_EXTRA } else { 0 };

            let mut entries = Vec::new();
            let mut count: u32 = 0;
            let mut pos = base_off + STATE_BLOCK_HEADER;
            while idx < runs.len() && pos + STATE_ENTRY_MAX_BYTES <= PAGE_PAYLOAD_SIZE {
                let (base, run) = runs[idx];
                debug_assert!(base % P == 0);
                let mut buf = [0u8; 8];
                let n = encode_compact_u64(base / P, &mut buf);
                entries.push(((run << 4) as u8) | n as u8);
                entries.extend_from_slice(&buf[..n]);
                pos += 1 + n;
                count += 1;
                idx += 1;
            }

            let old_next = self.read_state_word(target, base_off)?;
            let next = if idx >= runs.len() {
                0
            } else if old_next != 0 {
                old_next
            } else {
                self.alloc(
                    None,
                    PageType::FreelistOverflow,
                    AllocFlags::IGNORE_FREELIST,
                )?
            };

            self.write_state_block(target, base_off, next, count, &entries)?;

            if next == 0 {
                break;
            }
            // make sure the overflow page is resident and typed
            let page = self
                .fetch(None, next, FetchFlags::default())?
                .ok_or_else(|| eyre::eyre!("state overflow page {} unavailable", next))?;
            page.set_page_type(PageType::FreelistOverflow);
            page.set_dirty(true);
            target = Some(next);
        }

        Ok(state_address)
    }

    fn read_state_word(&mut self, target: Option<u64>, offset: usize) -> Result<u64> {
        let payload = match target {
            None => self
                .state_page
                .as_ref()
                .ok_or_else(|| eyre::eyre!("state page missing"))?
                .payload(),
            Some(address) => self.cache.resident(address)?.payload(),
        };
        Ok(u64::from_le_bytes(
            payload[offset..offset + 8].try_into().expect("fixed-width slice"),
        ))
    }

    fn write_state_block(
        &mut self,
        target: Option<u64>,
        offset: usize,
        next: u64,
        count: u32,
        entries: &[u8],
    ) -> Result<()> {
        let payload = match target {
            None => self
                .state_page
                .as_mut()
                .ok_or_else(|| eyre::eyre!("state page missing"))?
                .payload_mut(),
            Some(address) => self.cache.resident_mut(address)?.payload_mut(),
        };
        payload[offset..offset + 8].copy_from_slice(&next.to_le_bytes());
        payload[offset + 8..offset + 12].copy_from_slice(&count.to_le_bytes());
        payload[offset + 12..offset + 12 + entries.len()].copy_from_slice(entries);
        Ok(())
    }

    /// Stores the state when forced or when recovery keeps it eagerly
    /// persisted, updating the header's state pointer on change.
    pub fn maybe_store_state(&mut self, force: bool) -> Result<()> {
        if force || self.config.enable_recovery {
            let new_blobid = self.store_state()?;
            if new_blobid != self.page_manager_blobid()? {
                self.set_page_manager_blobid(new_blobid)?;
                if self.config.enable_recovery {
                    self.changeset.put(HEADER_PAGE_ADDRESS);
                }
            }
        }
        Ok(())
    }

    /// Rebuilds the freelist and the blob hint from the state chain rooted
    /// at `pageid`.
    pub fn initialize(&mut self, pageid: u64) -> Result<()> {
        self.free_pages.clear();

        let mut page = Page::new(pageid, None);
        self.device.read(pageid, page.buffer_mut())?;
        page.load_type_from_header();
        ensure!(
            matches!(
                page.page_type(),
                PageType::PageManager | PageType::FreelistOverflow
            ),
            "page {} is not a manager state page",
            pageid
        );

        self.last_blob_page_id = u64::from_le_bytes(
            page.payload()[0..8].try_into().expect("fixed-width slice"),
        );
        let (entries, mut overflow) = decode_state_entries(page.payload(), true)?;
        for (base, run) in entries {
            self.free_pages.insert(base, run);
        }
        self.state_page = Some(page);

        while overflow != 0 {
            let (entries, next) = {
                let page = self
                    .fetch(None, overflow, FetchFlags::default())?
                    .ok_or_else(|| eyre::eyre!("state overflow page {} unavailable", overflow))?;
                decode_state_entries(page.payload(), false)?
            };
            for (base, run) in entries {
                self.free_pages.insert(base, run);
            }
            overflow = next;
        }

        Ok(())
    }

    /// Purges the cache down to its budget. `uncouple` must detach every
    /// B-tree cursor registered on the page before it is flushed and
    /// dropped. No-op for in-memory databases and non-full caches.
    pub fn purge_cache<F>(&mut self, mut uncouple: F) -> Result<usize>
    where
        F: FnMut(&mut Page) -> Result<()>,
    {
        if self.config.in_memory || !self.cache.is_full() {
            return Ok(0);
        }

        let PageManager {
            ref mut cache,
            ref mut device,
            ref mut last_blob_page,
            ref mut last_blob_page_id,
            ref mut page_count_flushed,
            ..
        } = *self;

        let evicted = cache.purge(|page| {
            uncouple(page)?;
            if *last_blob_page == Some(page.address()) {
                *last_blob_page_id = page.address();
                *last_blob_page = None;
            }
            flush_page(device.as_mut(), page, page_count_flushed)
        })?;

        debug!(evicted, "cache purged");
        Ok(evicted)
    }

    /// Flushes every dirty page (and the state page) without evicting.
    pub fn flush_all(&mut self) -> Result<()> {
        {
            let PageManager {
                ref mut cache,
                ref mut device,
                ref mut page_count_flushed,
                ..
            } = *self;
            cache.purge_if(|page| {
                flush_page(device.as_mut(), page, page_count_flushed)?;
                Ok(false)
            })?;
        }
        {
            let PageManager {
                ref mut device,
                ref mut state_page,
                ref mut page_count_flushed,
                ..
            } = *self;
            if let Some(state) = state_page.as_mut() {
                flush_page(device.as_mut(), state, page_count_flushed)?;
            }
        }
        self.device.flush()
    }

    /// Flushes and drops every page owned by `db`. Pages with coupled
    /// cursors must have been uncoupled by the caller.
    pub fn close_database(&mut self, db: u32) -> Result<()> {
        if let Some(address) = self.last_blob_page.take() {
            self.last_blob_page_id = address;
        }
        let PageManager {
            ref mut cache,
            ref mut device,
            ref mut page_count_flushed,
            ..
        } = *self;
        cache.purge_if(|page| {
            if page.db() == Some(db) && page.address() != HEADER_PAGE_ADDRESS {
                debug_assert!(!page.has_cursors(), "closing database with live cursors");
                flush_page(device.as_mut(), page, page_count_flushed)?;
                return Ok(true);
            }
            Ok(false)
        })?;
        self.changeset.clear();
        Ok(())
    }

    /// Truncates trailing free pages off the file. Free runs covering the
    /// tail are trimmed page by page until the tail page is in use.
    pub fn reclaim_space(&mut self) -> Result<()> {
        if let Some(address) = self.last_blob_page.take() {
            self.last_blob_page_id = address;
        }
        debug_assert!(!self.config.disable_reclaim);

        // trial pass: trim a clone of the freelist so the decision whether a
        // state page must be created can be taken before anything is
        // committed
        let mut trial = self.free_pages.clone();
        let mut file_size = self.device.file_size()?;
        let mut trimmed = Vec::new();

        while file_size >= P {
            let tail = file_size - P;
            match trial.run_covering(tail) {
                Some((base, run)) if base + run as u64 * P == file_size => {
                    trial.erase(base);
                    if run > 1 {
                        trial.insert(base, run - 1);
                    }
                    trimmed.push(tail);
                    file_size -= P;
                }
                _ => break,
            }
        }

        if trimmed.is_empty() {
            return Ok(());
        }

        if self.state_page.is_none() && !trial.is_empty() {
            // storing the remaining entries would create the state page at
            // the end of the file, right where the truncation would cut;
            // persist the untrimmed freelist instead and keep the file size
            self.maybe_store_state(true)?;
            return Ok(());
        }

        self.free_pages = trial;
        self.needs_flush = true;
        for address in trimmed {
            self.cache.del(address);
        }

        let pre_store_end = self.device.file_size()?;
        self.maybe_store_state(true)?;
        if self.device.file_size()? == pre_store_end {
            self.device.truncate(file_size)?;
            debug!(file_size, "reclaimed trailing free pages");
        }
        Ok(())
    }

    /// Closes the manager: final state store, optional reclamation, flush of
    /// all dirty pages.
    pub fn close(&mut self) -> Result<()> {
        if !self.config.in_memory && !self.config.read_only {
            self.maybe_store_state(true)?;
        }

        let mut try_reclaim =
            !self.config.disable_reclaim && !self.config.in_memory && !self.config.read_only;
        // some platforms refuse to truncate a file under an active mapping
        if cfg!(windows) && self.device.is_mapped() {
            try_reclaim = false;
        }

        if try_reclaim {
            self.reclaim_space()?;
            if self.config.enable_recovery {
                let lsn = self.lsn.next();
                self.changeset.flush(lsn);
            }
        }

        self.flush_all()?;
        self.state_page = None;
        self.last_blob_page = None;
        Ok(())
    }

    /// Resolves the last-blob-page hint to a resident page address.
    pub fn last_blob_page(&mut self) -> Result<Option<u64>> {
        if let Some(address) = self.last_blob_page {
            return Ok(Some(address));
        }
        if self.last_blob_page_id != 0 {
            let id = self.last_blob_page_id;
            let fetched = self.fetch(None, id, FetchFlags::default())?;
            return Ok(fetched.map(|p| p.address()));
        }
        Ok(None)
    }

    pub fn set_last_blob_page(&mut self, address: Option<u64>) {
        self.last_blob_page_id = 0;
        self.last_blob_page = address;
    }

    pub fn last_blob_page_id(&self) -> u64 {
        self.last_blob_page_id
    }

    pub fn fill_metrics(&self, metrics: &mut Metrics) {
        metrics.page_count_fetched = self.page_count_fetched;
        metrics.page_count_flushed = self.page_count_flushed;
        metrics.page_count_type_index = self.page_count_index;
        metrics.page_count_type_blob = self.page_count_blob;
        metrics.page_count_type_page_manager = self.page_count_page_manager;
        metrics.freelist_hits = self.freelist_hits;
        metrics.freelist_misses = self.freelist_misses;
        metrics.cache_hits = self.cache.hits();
        metrics.cache_misses = self.cache.misses();
        metrics.cache_allocated_elements = self.cache.allocated_elements() as u64;
    }
}

fn decode_state_entries(payload: &[u8], first: bool) -> Result<(Vec<(u64, u32)>, u64)> {
    let off = if first { STATE_FIRST_EXTRA } else { 0 };
    let next = u64::from_le_bytes(payload[off..off + 8].try_into().expect("fixed-width slice"));
    let count = u32::from_le_bytes(
        payload[off + 8..off + 12]
            .try_into()
            .expect("fixed-width slice"),
    );

    let mut pos = off + STATE_BLOCK_HEADER;
    let mut entries = Vec::with_capacity(count as usize);
    for _ in 0..count {
        ensure!(pos < payload.len(), "state entry beyond payload");
        let header = payload[pos];
        let run = (header >> 4) as u32;
        let nbytes = (header & 0x0F) as usize;
        ensure!(run >= 1, "state entry with empty run");
        ensure!(nbytes <= 8, "state entry width {} exceeds 8", nbytes);
        pos += 1;
        let value = decode_compact_u64(nbytes, &payload[pos..])?;
        pos += nbytes;
        entries.push((value * P, run));
    }
    Ok((entries, next))
}
