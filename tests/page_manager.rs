//! Page-manager integration: allocation reuse, multi-page blob runs, state
//! chain persistence and overflow, end-of-file reclamation, purge budget.

use burrowdb::config::{Config, PAGE_SIZE, PURGE_AT_LEAST};
use burrowdb::storage::{AllocFlags, FileDevice, Metrics, PageManager, PageType};

const P: u64 = PAGE_SIZE as u64;

fn manager_with(config: Config) -> (tempfile::TempDir, PageManager) {
    let dir = tempfile::tempdir().unwrap();
    let device = FileDevice::create(dir.path().join("pm.db")).unwrap();
    let mut pm = PageManager::new(Box::new(device), config);
    pm.setup_header_page().unwrap();
    (dir, pm)
}

fn manager() -> (tempfile::TempDir, PageManager) {
    manager_with(Config::default())
}

#[test]
fn empty_database_allocates_right_after_the_header() {
    let (_dir, mut pm) = manager();

    let page = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    assert_eq!(page, P);

    pm.del(page, 1).unwrap();
    let again = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();

    assert_eq!(again, page);
    assert!(pm.free_runs().is_empty());
}

#[test]
fn multi_page_blob_run_and_partial_reuse() {
    let (_dir, mut pm) = manager();

    let base = pm.alloc_multi_blob(3).unwrap();
    assert_eq!(base % P, 0);
    assert!(!pm.cached(base).unwrap().is_without_header());
    assert!(pm.cached(base + P).unwrap().is_without_header());
    assert!(pm.cached(base + 2 * P).unwrap().is_without_header());

    pm.del(base, 3).unwrap();
    assert_eq!(pm.free_runs(), vec![(base, 3)]);

    let again = pm.alloc_multi_blob(2).unwrap();
    assert_eq!(again, base);
    assert_eq!(pm.free_runs(), vec![(base + 2 * P, 1)]);
}

#[test]
fn state_chain_overflows_into_a_second_page() {
    let (_dir, mut pm) = manager();

    // 2,048 isolated single-page runs whose encoded width is the practical
    // maximum (7 compact bytes); the first state page then holds ~2,041
    // entries and the chain needs exactly one overflow page
    let base_unit = 1u64 << 48;
    let mut expected = Vec::new();
    for i in 0..2048u64 {
        let address = (base_unit + 2 * i) * P;
        pm.del(address, 1).unwrap();
        expected.push((address, 1u32));
    }

    let state = pm.store_state().unwrap();
    assert_ne!(state, 0);

    let mut metrics = Metrics::default();
    pm.fill_metrics(&mut metrics);
    assert_eq!(
        metrics.page_count_type_page_manager, 2,
        "state page plus exactly one overflow page"
    );

    pm.flush_all().unwrap();
    pm.initialize(state).unwrap();

    assert_eq!(pm.free_runs(), expected);
}

#[test]
fn state_round_trip_preserves_runs_and_blob_hint() {
    let (_dir, mut pm) = manager();

    let blob = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    pm.set_last_blob_page(Some(blob));

    for address in [2u64, 3, 4, 9, 20, 21] {
        pm.del(address * P, 1).unwrap();
    }
    let before = pm.free_runs();
    // adjacent deletions coalesce into runs
    assert!(before.len() < 6);

    let state = pm.store_state().unwrap();
    pm.flush_all().unwrap();
    pm.initialize(state).unwrap();

    assert_eq!(pm.free_runs(), before);
    assert_eq!(pm.last_blob_page_id(), blob);
    for (base, run) in pm.free_runs() {
        assert_eq!(base % P, 0);
        assert!((1..=15).contains(&run));
    }
}

#[test]
fn long_runs_split_at_the_encoded_cap() {
    let (_dir, mut pm) = manager();

    pm.del(2 * P, 40).unwrap();
    assert_eq!(pm.free_runs(), vec![(2 * P, 15), (17 * P, 15), (32 * P, 10)]);

    let state = pm.store_state().unwrap();
    pm.flush_all().unwrap();
    pm.initialize(state).unwrap();

    let total: u64 = pm.free_runs().iter().map(|&(_, r)| r as u64).sum();
    assert_eq!(total, 40);
    for (_, run) in pm.free_runs() {
        assert!(run <= 15);
    }
}

#[test]
fn reclaim_truncates_the_free_tail() {
    let (_dir, mut pm) = manager();

    let a = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    let b = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    let c = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    assert_eq!(pm.file_size().unwrap(), 4 * P);

    pm.del(b, 1).unwrap();
    pm.del(c, 1).unwrap();
    pm.reclaim_space().unwrap();

    assert_eq!(pm.file_size().unwrap(), 2 * P);
    assert!(pm.free_runs().is_empty());
    assert!(!pm.is_page_free(a));
}

#[test]
fn reclaim_with_recovery_updates_the_persisted_state() {
    let config = Config {
        enable_recovery: true,
        ..Config::default()
    };
    let (_dir, mut pm) = manager_with(config);

    // establish a state page low in the file: free a page, persist, reuse
    let a = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    pm.del(a, 1).unwrap();
    let state = pm.store_state().unwrap();
    assert_ne!(state, 0);
    let _a2 = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();

    // two trailing free pages
    let b = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    let c = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    let end = pm.file_size().unwrap();
    assert_eq!(c + P, end);

    pm.del(b, 1).unwrap();
    pm.del(c, 1).unwrap();
    pm.changeset_mut().clear();

    pm.reclaim_space().unwrap();

    assert_eq!(pm.file_size().unwrap(), end - 2 * P);
    assert!(pm.free_runs().is_empty());
    // the rewritten chain was enlisted for recovery
    assert!(pm.changeset().contains(state));
}

#[test]
fn reclaim_leaves_interior_free_pages_alone() {
    let (_dir, mut pm) = manager();

    let a = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    let _b = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();

    pm.del(a, 1).unwrap();
    pm.reclaim_space().unwrap();

    assert_eq!(pm.file_size().unwrap(), 3 * P);
    assert!(pm.is_page_free(a));
}

#[test]
fn purge_honours_the_byte_budget() {
    let config = Config {
        cache_capacity: 8 * PAGE_SIZE,
        ..Config::default()
    };
    let (_dir, mut pm) = manager_with(config);

    for _ in 0..64 {
        pm.alloc(None, PageType::Blob, AllocFlags::default())
            .unwrap();
    }
    assert!(pm.is_cache_full());

    let evicted = pm.purge_cache(|_| Ok(())).unwrap();

    assert!(evicted >= PURGE_AT_LEAST);
    assert!(!pm.is_cache_full());
}

#[test]
fn close_persists_the_freelist_for_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("close.db");

    let device = FileDevice::create(&path).unwrap();
    let mut pm = PageManager::new(Box::new(device), Config::default());
    pm.setup_header_page().unwrap();

    let a = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    let b = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    pm.del(b, 1).unwrap();
    // the forced store at close appends the state page, so the freed page
    // is no longer at the tail and survives reclamation
    pm.close().unwrap();
    drop(pm);

    let device = FileDevice::open(&path, false).unwrap();
    let mut pm = PageManager::new(Box::new(device), Config::default());
    pm.load_header_page().unwrap();
    let state = pm.page_manager_blobid().unwrap();
    assert_ne!(state, 0);
    pm.initialize(state).unwrap();

    assert!(pm.is_page_free(b));
    assert!(!pm.is_page_free(a));

    // and the freed page is the first one handed out again
    let again = pm
        .alloc(None, PageType::Blob, AllocFlags::default())
        .unwrap();
    assert_eq!(again, b);
}
