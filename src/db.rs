//! # Database Facade
//!
//! `Database` owns the whole engine — device, page manager, B-tree,
//! transaction overlay, cursor registry, optional event log — behind one
//! process-wide lock. Every public operation acquires the lock, serializing
//! all engine mutation; the event log keeps its own lock so diagnostics
//! never contend with the engine.
//!
//! ## Cursors
//!
//! User cursors are registry entries addressed by opaque handles. Pages
//! record the ids of cursors coupled to them; before the cache evicts a
//! page, the registry uncouples those cursors (each caches its key and
//! re-couples lazily). Mutating tree operations uncouple *all* registered
//! cursors first, so splits never move entries under a coupled position.
//!
//! ## Transactions
//!
//! Operations carrying a transaction handle are recorded in the overlay and
//! become visible through the merged cursor view; operations without one go
//! straight to the B-tree. Committed operations stay in the overlay —
//! flushing them into the tree belongs to the recovery machinery, which is
//! out of scope here.

use std::path::Path;

use hashbrown::HashMap;
use parking_lot::Mutex;
use tracing::debug;

use crate::btree::{BTree, BTreeCursor, FindMode, LexicalComparator};
use crate::config::{Config, InsertFlags, MoveFlags};
use crate::cursor::{Cursor, CursorContext};
use crate::error::{Error, Result};
use crate::eventlog::{escape, EventLog};
use crate::storage::blob::{free_record, read_record, write_record};
use crate::storage::device::{Device, FileDevice, MemDevice, MmapDevice};
use crate::storage::manager::PageManager;
use crate::txn::{NodeStatus, OpKind, TxnId, TxnStore};

pub use crate::config::DupePosition;
pub use crate::storage::manager::Metrics;

/// Handle to an open transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxnHandle(pub(crate) TxnId);

/// Handle to a registered cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CursorHandle(pub(crate) u64);

pub struct Database {
    inner: Mutex<DbInner>,
}

struct DbInner {
    config: Config,
    pm: PageManager,
    tree: BTree,
    txns: TxnStore,
    cursors: HashMap<u64, Cursor>,
    next_cursor: u64,
    eventlog: Option<EventLog>,
    log_name: String,
}

#[derive(Debug, Default)]
pub struct DatabaseBuilder {
    config: Config,
}

impl DatabaseBuilder {
    pub fn path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.path = Some(path.as_ref().to_path_buf());
        self
    }

    pub fn in_memory(mut self) -> Self {
        self.config.in_memory = true;
        self.config.path = None;
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    pub fn enable_recovery(mut self, enable: bool) -> Self {
        self.config.enable_recovery = enable;
        self
    }

    pub fn enable_duplicates(mut self, enable: bool) -> Self {
        self.config.enable_duplicates = enable;
        self
    }

    pub fn disable_reclaim(mut self, disable: bool) -> Self {
        self.config.disable_reclaim = disable;
        self
    }

    pub fn use_mmap(mut self, use_mmap: bool) -> Self {
        self.config.use_mmap = use_mmap;
        self
    }

    pub fn cache_capacity(mut self, bytes: usize) -> Self {
        self.config.cache_capacity = bytes;
        self
    }

    pub fn event_log(mut self, enable: bool) -> Self {
        self.config.event_log = enable;
        self
    }

    pub fn open(self) -> Result<Database> {
        let mut config = self.config;
        if config.path.is_none() {
            config.in_memory = true;
        }

        let (device, fresh): (Box<dyn Device>, bool) = match &config.path {
            None => (Box::new(MemDevice::new()), true),
            Some(path) => {
                let exists = path
                    .metadata()
                    .map(|meta| meta.len() > 0)
                    .unwrap_or(false);
                if exists {
                    let device: Box<dyn Device> = if config.use_mmap {
                        Box::new(MmapDevice::open(path)?)
                    } else {
                        Box::new(FileDevice::open(path, config.read_only)?)
                    };
                    (device, false)
                } else {
                    if config.read_only {
                        return Err(Error::InvParameter);
                    }
                    let device: Box<dyn Device> = if config.use_mmap {
                        Box::new(MmapDevice::create(path)?)
                    } else {
                        Box::new(FileDevice::create(path)?)
                    };
                    (device, true)
                }
            }
        };

        let mut pm = PageManager::new(device, config.clone());
        let tree = if fresh {
            pm.setup_header_page()?;
            let tree = BTree::create(&mut pm, Box::new(LexicalComparator))?;
            pm.set_root_page(tree.root_page())?;
            tree
        } else {
            pm.load_header_page()?;
            let state = pm.page_manager_blobid()?;
            if state != 0 {
                pm.initialize(state)?;
            }
            let root = pm.root_page()?;
            if root == 0 {
                return Err(Error::Io(eyre::eyre!("database has no index root")));
            }
            BTree::open(root, Box::new(LexicalComparator))
        };

        let log_name = config
            .path
            .as_ref()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();
        let eventlog = if config.event_log {
            let log = EventLog::new();
            if fresh {
                log.create(&log_name);
            } else {
                log.open(&log_name);
            }
            log.append(&log_name, "open", "");
            Some(log)
        } else {
            None
        };

        debug!(fresh, in_memory = config.in_memory, "database opened");

        Ok(Database {
            inner: Mutex::new(DbInner {
                config,
                pm,
                tree,
                txns: TxnStore::new(),
                cursors: HashMap::new(),
                next_cursor: 0,
                eventlog,
                log_name,
            }),
        })
    }
}

impl DbInner {
    fn log(&self, tag: &str, args: &str) {
        if let Some(log) = &self.eventlog {
            log.append(&self.log_name, tag, args);
        }
    }

    fn guard_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::InvParameter);
        }
        Ok(())
    }

    /// Purges the cache down to budget, uncoupling registered cursors from
    /// evicted pages.
    fn purge(&mut self) -> Result<()> {
        let DbInner { pm, cursors, .. } = self;
        pm.purge_cache(|page| {
            for id in page.cursors().to_vec() {
                match cursors.get_mut(&id) {
                    Some(cursor) => cursor
                        .btree
                        .uncouple_from_page(page)
                        .map_err(|e| eyre::eyre!("cursor uncouple failed: {e}"))?,
                    // a closed cursor left a stale registration behind
                    None => page.remove_cursor(id),
                }
            }
            Ok(())
        })?;
        Ok(())
    }

    /// Demotes every registered cursor to its cached key before a mutating
    /// tree operation.
    fn uncouple_all(&mut self) -> Result<()> {
        let ids: Vec<u64> = self.cursors.keys().copied().collect();
        for id in ids {
            let mut cursor = self.cursors.remove(&id).expect("id just listed");
            let result = cursor.btree.uncouple(&mut self.pm);
            self.cursors.insert(id, cursor);
            result?;
        }
        Ok(())
    }

    fn ctx<'a>(
        pm: &'a mut PageManager,
        tree: &'a mut BTree,
        txns: &'a mut TxnStore,
        config: &Config,
    ) -> CursorContext<'a> {
        CursorContext {
            pm,
            tree,
            txns,
            duplicates_enabled: config.enable_duplicates,
        }
    }

    fn with_cursor<T>(
        &mut self,
        handle: CursorHandle,
        f: impl FnOnce(&mut Cursor, &mut CursorContext<'_>) -> Result<T>,
    ) -> Result<T> {
        let mut cursor = self
            .cursors
            .remove(&handle.0)
            .ok_or(Error::InvParameter)?;
        let mut ctx = Self::ctx(&mut self.pm, &mut self.tree, &mut self.txns, &self.config);
        let result = f(&mut cursor, &mut ctx);
        self.cursors.insert(handle.0, cursor);
        result
    }

    /// Persists the index root when a split moved it.
    fn sync_root(&mut self) -> Result<()> {
        if self.pm.root_page()? != self.tree.root_page() {
            self.pm.set_root_page(self.tree.root_page())?;
        }
        Ok(())
    }

    fn btree_lookup(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.next_cursor += 1;
        let mut scratch = BTreeCursor::new(self.next_cursor);
        let result = (|| {
            match self.tree.find(&mut self.pm, &mut scratch, key, FindMode::Exact) {
                Ok(_) => {
                    let table = self.tree.get_duplicate_table(&mut self.pm, &mut scratch)?;
                    let rref = *table.first().ok_or(Error::KeyNotFound)?;
                    Ok(Some(read_record(&mut self.pm, rref)?))
                }
                Err(Error::KeyNotFound) => Ok(None),
                Err(e) => Err(e),
            }
        })();
        scratch.set_to_nil(self.pm.cache_mut());
        result
    }

    /// Does the key exist in the merged view of `viewer`?
    fn exists_merged(&mut self, viewer: Option<TxnId>, key: &[u8]) -> Result<bool> {
        match self.txns.node_status(key, viewer) {
            NodeStatus::Present(_) => Ok(true),
            NodeStatus::Erased(_) => Ok(false),
            NodeStatus::Conflict(_) => Err(Error::TxnConflict),
            NodeStatus::Absent => Ok(self.btree_lookup(key)?.is_some()),
        }
    }

    fn insert(
        &mut self,
        txn: Option<TxnId>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        self.guard_writable()?;
        self.purge()?;

        if let Some(txn) = txn {
            if !flags.overwrite && !flags.duplicate && self.exists_merged(Some(txn), key)? {
                return Err(Error::DuplicateKey);
            }
            let (kind, referenced) = if flags.duplicate {
                let referenced = match flags.position {
                    DupePosition::Before(r) | DupePosition::After(r) => r,
                    _ => 0,
                };
                (OpKind::InsertDuplicate(flags.position), referenced)
            } else if flags.overwrite {
                (OpKind::InsertOverwrite, 0)
            } else {
                (OpKind::Insert, 0)
            };
            self.txns
                .insert_op(txn, key, kind, referenced, record.to_vec())?;
        } else {
            self.uncouple_all()?;
            let rref = write_record(&mut self.pm, record)?;
            match self.tree.insert(&mut self.pm, key, rref, flags) {
                Ok(replaced) => {
                    if let Some(old) = replaced {
                        free_record(&mut self.pm, old)?;
                    }
                }
                Err(e) => {
                    // release the record allocated for the failed insert
                    free_record(&mut self.pm, rref)?;
                    return Err(e);
                }
            }
            self.sync_root()?;
        }

        self.log("insert", &escape(key));
        Ok(())
    }

    fn find(&mut self, txn: Option<TxnId>, key: &[u8]) -> Result<Vec<u8>> {
        self.purge()?;

        match self.txns.node_status(key, txn) {
            NodeStatus::Present(op_id) => {
                let op = self
                    .txns
                    .op(key, op_id)
                    .ok_or(Error::KeyNotFound)?;
                debug_assert!(op.kind.is_insert());
                Ok(op.record.clone())
            }
            NodeStatus::Erased(_) => Err(Error::KeyNotFound),
            NodeStatus::Conflict(_) => Err(Error::TxnConflict),
            NodeStatus::Absent => self.btree_lookup(key)?.ok_or(Error::KeyNotFound),
        }
    }

    fn erase(&mut self, txn: Option<TxnId>, key: &[u8]) -> Result<()> {
        self.guard_writable()?;
        self.purge()?;

        if let Some(txn) = txn {
            if !self.exists_merged(Some(txn), key)? {
                return Err(Error::KeyNotFound);
            }
            self.txns
                .insert_op(txn, key, OpKind::Erase, 0, Vec::new())?;
        } else {
            self.uncouple_all()?;
            let table = self.tree.erase(&mut self.pm, key)?;
            for rref in table {
                free_record(&mut self.pm, rref)?;
            }
        }

        self.log("erase", &escape(key));
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        for (_, mut cursor) in self.cursors.drain() {
            cursor.btree.set_to_nil(self.pm.cache_mut());
        }
        if !self.config.read_only && !self.config.in_memory {
            self.sync_root()?;
        }
        self.pm.close()?;
        self.log("close", "");
        if let Some(log) = &self.eventlog {
            log.close(&self.log_name);
        }
        debug!("database closed");
        Ok(())
    }
}

impl Database {
    pub fn builder() -> DatabaseBuilder {
        DatabaseBuilder::default()
    }

    /// Opens (or creates) a database at `path` with default options.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::builder().path(path).open()
    }

    /// Creates a database that lives entirely in memory.
    pub fn in_memory() -> Result<Self> {
        Self::builder().in_memory().open()
    }

    pub fn txn_begin(&self) -> Result<TxnHandle> {
        let mut inner = self.inner.lock();
        inner.guard_writable()?;
        let id = inner.txns.begin();
        inner.log("txn_begin", &id.to_string());
        Ok(TxnHandle(id))
    }

    pub fn txn_commit(&self, txn: TxnHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.txns.commit(txn.0)?;
        inner.log("txn_commit", &txn.0.to_string());
        Ok(())
    }

    pub fn txn_abort(&self, txn: TxnHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.txns.abort(txn.0)?;
        inner.log("txn_abort", &txn.0.to_string());
        Ok(())
    }

    pub fn insert(
        &self,
        txn: Option<&TxnHandle>,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        self.inner
            .lock()
            .insert(txn.map(|t| t.0), key, record, flags)
    }

    pub fn find(&self, txn: Option<&TxnHandle>, key: &[u8]) -> Result<Vec<u8>> {
        self.inner.lock().find(txn.map(|t| t.0), key)
    }

    pub fn erase(&self, txn: Option<&TxnHandle>, key: &[u8]) -> Result<()> {
        self.inner.lock().erase(txn.map(|t| t.0), key)
    }

    pub fn cursor(&self, txn: Option<&TxnHandle>) -> Result<CursorHandle> {
        let mut inner = self.inner.lock();
        inner.next_cursor += 1;
        let id = inner.next_cursor;
        inner.cursors.insert(id, Cursor::new(id, txn.map(|t| t.0)));
        Ok(CursorHandle(id))
    }

    pub fn cursor_move(
        &self,
        cursor: CursorHandle,
        flags: MoveFlags,
    ) -> Result<(Vec<u8>, Vec<u8>)> {
        let mut inner = self.inner.lock();
        inner.purge()?;
        inner.with_cursor(cursor, |cursor, ctx| cursor.move_cursor(ctx, flags))
    }

    /// Inserts through a cursor, leaving it positioned on the new record.
    pub fn cursor_insert(
        &self,
        cursor: CursorHandle,
        key: &[u8],
        record: &[u8],
        flags: InsertFlags,
    ) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.guard_writable()?;
        inner.purge()?;

        let txn = {
            let entry = inner.cursors.get(&cursor.0).ok_or(Error::InvParameter)?;
            entry.txn()
        };

        if let Some(txn) = txn {
            if !flags.overwrite && !flags.duplicate && inner.exists_merged(Some(txn), key)? {
                return Err(Error::DuplicateKey);
            }
            let (kind, referenced) = if flags.duplicate {
                let referenced = match flags.position {
                    DupePosition::Before(r) | DupePosition::After(r) => r,
                    _ => 0,
                };
                (OpKind::InsertDuplicate(flags.position), referenced)
            } else if flags.overwrite {
                (OpKind::InsertOverwrite, 0)
            } else {
                (OpKind::Insert, 0)
            };
            let op = inner
                .txns
                .insert_op(txn, key, kind, referenced, record.to_vec())?;
            inner.with_cursor(cursor, |cursor, ctx| {
                cursor.set_to_nil(ctx);
                cursor.txn_cursor.couple_to_op(key.to_vec(), op);
                cursor.couple_to_txnop();
                cursor.set_lastop_lookup();
                Ok(())
            })?;
        } else {
            inner.uncouple_all()?;
            let rref = write_record(&mut inner.pm, record)?;
            let result = inner.with_cursor(cursor, |cursor, ctx| {
                cursor.set_to_nil(ctx);
                let replaced =
                    ctx.tree
                        .insert_cursor(ctx.pm, key, rref, flags, Some(&mut cursor.btree))?;
                cursor.couple_to_btree();
                cursor.set_lastop_lookup();
                Ok(replaced)
            });
            match result {
                Ok(replaced) => {
                    if let Some(old) = replaced {
                        free_record(&mut inner.pm, old)?;
                    }
                }
                Err(e) => {
                    free_record(&mut inner.pm, rref)?;
                    return Err(e);
                }
            }
            inner.sync_root()?;
        }

        inner.log("cursor_insert", &escape(key));
        Ok(())
    }

    pub fn cursor_overwrite(&self, cursor: CursorHandle, record: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.guard_writable()?;
        inner.purge()?;
        inner.with_cursor(cursor, |cursor, ctx| cursor.overwrite(ctx, record))
    }

    pub fn cursor_erase(&self, cursor: CursorHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.guard_writable()?;
        inner.purge()?;
        inner.uncouple_all()?;
        inner.with_cursor(cursor, |cursor, ctx| cursor.erase(ctx))
    }

    pub fn cursor_duplicate_count(&self, cursor: CursorHandle) -> Result<usize> {
        let mut inner = self.inner.lock();
        inner.purge()?;
        inner.with_cursor(cursor, |cursor, ctx| cursor.duplicate_count(ctx))
    }

    pub fn cursor_close(&self, cursor: CursorHandle) -> Result<()> {
        let mut inner = self.inner.lock();
        let mut entry = inner
            .cursors
            .remove(&cursor.0)
            .ok_or(Error::InvParameter)?;
        entry.btree.set_to_nil(inner.pm.cache_mut());
        Ok(())
    }

    pub fn metrics(&self) -> Metrics {
        let inner = self.inner.lock();
        let mut metrics = Metrics::default();
        inner.pm.fill_metrics(&mut metrics);
        metrics
    }

    /// Flushes and closes the database: final state store, optional
    /// end-of-file reclamation, full page flush.
    pub fn close(self) -> Result<()> {
        let mut inner = self.inner.into_inner();
        inner.close()
    }
}
