//! # BurrowDB - Embedded B-Tree Key/Value Store
//!
//! BurrowDB is an embedded, file-backed key/value store built around a single
//! paged B-tree index with record blobs stored in the same file. Keys are
//! variable-length byte strings; records are stored inline (tiny/small) or as
//! out-of-line blobs. The store supports ordered iteration, point lookup,
//! duplicate keys per logical key, and a transactional overlay whose
//! uncommitted operations are merged with the persistent B-tree during cursor
//! traversal.
//!
//! ## Quick Start
//!
//! ```ignore
//! use burrowdb::Database;
//!
//! let db = Database::builder()
//!     .path("./my.db")
//!     .enable_duplicates(true)
//!     .open()?;
//!
//! db.insert(None, b"hello", b"world", Default::default())?;
//! assert_eq!(db.find(None, b"hello")?, b"world");
//! ```
//!
//! ## Architecture
//!
//! BurrowDB uses a layered architecture:
//!
//! ```text
//! ┌─────────────────────────────────────┐
//! │       Public API (Database)          │
//! ├─────────────────────────────────────┤
//! │  Merge Cursor │ Transaction Overlay  │
//! ├───────────────┼─────────────────────┤
//! │     B-Tree (nodes, tree cursor)      │
//! ├─────────────────────────────────────┤
//! │  Page Manager (cache, freelist,      │
//! │  state chain, blob store)            │
//! ├─────────────────────────────────────┤
//! │  Device (file / mmap / in-memory)    │
//! └─────────────────────────────────────┘
//! ```
//!
//! A cursor is really two cursors moving in lock-step: one over the B-tree
//! leaves, one over the transaction tree. Every user-visible move compares the
//! keys on both sides, couples to the winning side, and maintains a per-key
//! duplicate cache that replays interleaved tree/transaction operations.
//!
//! ## File Layout
//!
//! A database is a single file of fixed-size pages:
//!
//! ```text
//! Offset 0:        header page (magic, root, page-manager state blob id)
//! Offset 16384:    B-tree root
//! Offset 32768+:   index pages, blob pages, page-manager state chain
//! ```
//!
//! Free pages are tracked in an in-memory run map and persisted compactly in
//! a linked chain of page-manager pages (see [`storage`]).
//!
//! ## Module Overview
//!
//! - [`storage`]: device abstraction, page cache, freelist, page manager,
//!   blob store
//! - [`btree`]: B-tree nodes, tree operations, the coupled/uncoupled cursor
//! - [`txn`]: transaction overlay tree and its cursor
//! - [`cursor`]: the merged user-visible cursor and its duplicate cache
//! - [`eventlog`]: optional append-only diagnostics log
//! - [`config`]: constants and runtime configuration

#[macro_use]
mod macros;

pub mod btree;
pub mod config;
pub mod cursor;
pub mod db;
pub mod encoding;
mod error;
pub mod eventlog;
pub mod storage;
pub mod txn;

pub use config::{Config, InsertFlags, MoveFlags};
pub use cursor::Cursor;
pub use db::{CursorHandle, Database, DatabaseBuilder, DupePosition, Metrics, TxnHandle};
pub use error::{Error, ErrorKind, Result};
