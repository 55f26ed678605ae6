//! # Storage Module
//!
//! The storage layer owns everything below the B-tree: the device
//! abstraction, the page cache, the freelist, the page manager and the blob
//! store.
//!
//! ## Architecture Overview
//!
//! ```text
//! PageManager ──┬── PageCache   (residency set, byte budget, LRU purge)
//!               ├── Freelist    (ordered map of free page runs)
//!               ├── Changeset   (pages touched by the current operation)
//!               └── Device      (file / mmap / in-memory byte store)
//! ```
//!
//! All I/O goes through the [`device::Device`] trait; the cache itself never
//! touches the device. The page manager coordinates allocation, fetching,
//! deletion and the persistence of its own state (the freelist plus the
//! last-blob-page hint) into a linked chain of manager pages.
//!
//! ## Page Addressing
//!
//! A page's address is its byte offset in the file, always a multiple of
//! [`PAGE_SIZE`](crate::config::PAGE_SIZE). Address 0 is the header page.
//!
//! ## Persisted Manager State
//!
//! The freelist is stored compactly: contiguous free runs are merged (up to
//! 15 pages, the 4-bit cap of the entry header) and each entry encodes its
//! base address divided by the page size as a minimal little-endian integer.
//! When a state page fills up, the chain continues in an overflow page.
//!
//! ## Thread Safety
//!
//! Nothing in this module synchronizes. The engine serializes all access
//! behind one process-wide lock (held by the `Database` facade); the event
//! log is the only component with its own lock.

pub mod blob;
pub mod cache;
pub mod changeset;
pub mod device;
pub mod freelist;
pub mod manager;
pub mod page;

pub use blob::{blob_alloc, blob_free, blob_read, RecordRef};
pub use cache::PageCache;
pub use changeset::{Changeset, LsnManager};
pub use device::{Device, FileDevice, MemDevice, MmapDevice};
pub use freelist::Freelist;
pub use manager::{AllocFlags, FetchFlags, Metrics, PageManager};
pub use page::{FileHeader, Page, PageHeader, PageType, FILE_HEADER_SIZE};

pub use crate::config::{
    HEADER_PAGE_ADDRESS, PAGE_HEADER_SIZE, PAGE_PAYLOAD_SIZE, PAGE_SIZE,
};
