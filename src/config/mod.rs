//! # Configuration Module
//!
//! This module centralizes configuration for BurrowDB: the compile-time
//! constants that fix the on-disk format, the runtime [`Config`] assembled by
//! the database builder, and the flag types accepted by the public insert and
//! cursor-move operations.
//!
//! ## Why Centralization?
//!
//! Several constants depend on each other (page size, header sizes, the
//! freelist run cap, state-chain entry sizes). Keeping them in one place with
//! their relationships documented prevents mismatch bugs; see [`constants`].

pub mod constants;
pub use constants::*;

use std::path::PathBuf;

/// Runtime configuration for a database, assembled by `DatabaseBuilder`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Database file path; `None` selects in-memory mode.
    pub path: Option<PathBuf>,
    /// Keep all pages in memory, never touch a device.
    pub in_memory: bool,
    /// Refuse mutations and skip state persistence.
    pub read_only: bool,
    /// Persist page-manager state eagerly and enlist pages in the changeset.
    pub enable_recovery: bool,
    /// Allow multiple records per key and enable the duplicate cache.
    pub enable_duplicates: bool,
    /// Skip end-of-file reclamation at close.
    pub disable_reclaim: bool,
    /// Use a memory-mapped device instead of positioned file I/O.
    pub use_mmap: bool,
    /// Page cache budget in bytes.
    pub cache_capacity: usize,
    /// Append diagnostics to an event log next to the database file.
    pub event_log: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            path: None,
            in_memory: false,
            read_only: false,
            enable_recovery: false,
            enable_duplicates: false,
            disable_reclaim: false,
            use_mmap: false,
            cache_capacity: DEFAULT_CACHE_CAPACITY,
            event_log: false,
        }
    }
}

/// Where a duplicate record is placed relative to the existing duplicates of
/// its key. Positions are 1-based duplicate indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DupePosition {
    /// Insert as the first duplicate.
    First,
    /// Insert before the referenced duplicate.
    Before(u32),
    /// Insert after the referenced duplicate.
    After(u32),
    /// Append as the last duplicate.
    #[default]
    Last,
}

/// Flags for `Database::insert` and cursor-based insertion.
#[derive(Debug, Clone, Copy, Default)]
pub struct InsertFlags {
    /// Overwrite the record if the key already exists.
    pub overwrite: bool,
    /// Insert an additional record under an existing key.
    pub duplicate: bool,
    /// Placement of the duplicate; ignored unless `duplicate` is set.
    pub position: DupePosition,
}

impl InsertFlags {
    pub fn overwrite() -> Self {
        Self {
            overwrite: true,
            ..Self::default()
        }
    }

    pub fn duplicate(position: DupePosition) -> Self {
        Self {
            duplicate: true,
            position,
            ..Self::default()
        }
    }
}

/// Movement requested from a cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveOp {
    /// Do not move; retrieve the current key and record.
    Current,
    First,
    Last,
    Next,
    Previous,
}

/// Flags for `Database::cursor_move`.
#[derive(Debug, Clone, Copy)]
pub struct MoveFlags {
    pub op: MoveOp,
    /// Step over duplicates, visiting each distinct key once.
    pub skip_duplicates: bool,
}

impl MoveFlags {
    pub fn first() -> Self {
        Self {
            op: MoveOp::First,
            skip_duplicates: false,
        }
    }

    pub fn last() -> Self {
        Self {
            op: MoveOp::Last,
            skip_duplicates: false,
        }
    }

    pub fn next() -> Self {
        Self {
            op: MoveOp::Next,
            skip_duplicates: false,
        }
    }

    pub fn previous() -> Self {
        Self {
            op: MoveOp::Previous,
            skip_duplicates: false,
        }
    }

    pub fn current() -> Self {
        Self {
            op: MoveOp::Current,
            skip_duplicates: false,
        }
    }

    pub fn skip_duplicates(mut self) -> Self {
        self.skip_duplicates = true;
        self
    }
}

impl Default for MoveFlags {
    fn default() -> Self {
        Self::next()
    }
}
