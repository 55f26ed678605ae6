//! # Configuration Constants
//!
//! All numeric configuration values, grouped by dependency. When changing any
//! constant here, check whether its dependents need adjustment.
//!
//! ## Dependency Graph
//!
//! ```text
//! PAGE_SIZE (16384 bytes, multiple of 512)
//!       │
//!       ├─> PAGE_HEADER_SIZE (32 bytes, fixed)
//!       │
//!       ├─> PAGE_PAYLOAD_SIZE (derived: PAGE_SIZE - PAGE_HEADER_SIZE)
//!       │     Without-header pages (blob continuations) use the full
//!       │     PAGE_SIZE as payload instead.
//!       │
//!       └─> STATE_ENTRY_MAX_BYTES (9)
//!             Worst-case encoded freelist entry: 1 header byte + 8 bytes of
//!             compact page id. A state page chains to an overflow page when
//!             the next entry would cross PAGE_PAYLOAD_SIZE.
//!
//! FREELIST_RUN_MAX (15)
//!       │
//!       └─> The run-length nibble in the persisted state chain is 4 bits;
//!           longer logical runs are split at encode time.
//!
//! SMALL_RECORD_SIZE (8)
//!       │
//!       └─> TINY_RECORD_MAX (7): records shorter than SMALL_RECORD_SIZE are
//!           stored inline with their length in the spare reference byte.
//! ```
//!
//! ## Critical Invariants
//!
//! 1. `PAGE_SIZE % 512 == 0` (device alignment)
//! 2. `PAGE_PAYLOAD_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE`
//! 3. `FREELIST_RUN_MAX < 16` (fits the 4-bit run nibble)

/// Unit of I/O. Every page address is a byte offset that is a multiple of
/// this size.
pub const PAGE_SIZE: usize = 16384;

/// Per-page persistent header, present on every page except blob
/// continuation pages.
pub const PAGE_HEADER_SIZE: usize = 32;

/// Usable bytes in a regular page.
pub const PAGE_PAYLOAD_SIZE: usize = PAGE_SIZE - PAGE_HEADER_SIZE;

/// Address of the header page.
pub const HEADER_PAGE_ADDRESS: u64 = 0;

/// Minimum number of pages a cache purge evicts per call, when that many are
/// eligible.
pub const PURGE_AT_LEAST: usize = 20;

/// Maximum run length of a single persisted freelist entry (4-bit nibble).
pub const FREELIST_RUN_MAX: u32 = 15;

/// Worst-case size of one encoded freelist entry in the state chain.
pub const STATE_ENTRY_MAX_BYTES: usize = 9;

/// Records of exactly this size are stored inline in the record reference.
pub const SMALL_RECORD_SIZE: usize = 8;

/// Records up to this size are stored inline with an explicit length byte.
pub const TINY_RECORD_MAX: usize = SMALL_RECORD_SIZE - 1;

/// Default page cache budget: 128 pages.
pub const DEFAULT_CACHE_CAPACITY: usize = 128 * PAGE_SIZE;

const _: () = assert!(PAGE_SIZE % 512 == 0);
const _: () = assert!(PAGE_PAYLOAD_SIZE == PAGE_SIZE - PAGE_HEADER_SIZE);
const _: () = assert!(FREELIST_RUN_MAX < 16);
const _: () = assert!(TINY_RECORD_MAX < SMALL_RECORD_SIZE);
