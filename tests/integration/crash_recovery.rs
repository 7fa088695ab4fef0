#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::{all_rows, insert, insert_with, live_rows, small_options};
use rawstore::primitives::io::MemStorage;
use rawstore::store::log_record::LogBody;
use rawstore::store::ops::InsertFlags;
use rawstore::{ContainerKey, Field, InsertRequest, RawStore, StoreError, StoreOptions};

fn open(storage: &MemStorage) -> RawStore {
    open_with(storage, small_options())
}

fn open_with(storage: &MemStorage, options: StoreOptions) -> RawStore {
    RawStore::open_with_storage(Arc::new(storage.clone()), options).unwrap()
}

/// Commits a container whose first page holds rows `r0`, `r1`, `r2`.
fn three_rows(store: &RawStore) -> (ContainerKey, u64) {
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    let mut handle = txn.open_container(key).unwrap();
    let mut page = handle.add_page().unwrap();
    for (slot, value) in [&b"r0"[..], b"r1", b"r2"].into_iter().enumerate() {
        insert(&mut handle, &mut page, slot, value);
    }
    let page_no = page.key().page_number;
    drop(page);
    drop(handle);
    txn.commit().unwrap();
    (key, page_no)
}

/// Inserts at slot 3 with purge-on-undo in a transaction left running, and
/// returns the page version before the insert. With `checkpoint_after`, the
/// page is written with the insert applied before the crash.
fn crash_mid_insert(storage: &MemStorage, checkpoint_after: bool) -> (ContainerKey, u64, u64) {
    let store = open(storage);
    let (key, page_no) = three_rows(&store);
    store.checkpoint().unwrap();

    let mut txn = store.begin();
    let before = {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.get_page(page_no).unwrap();
        let before = page.version();
        let row = [Field::value(&b"R"[..])];
        insert_with(
            &mut handle,
            &mut page,
            InsertRequest::new(3, &row).flags(InsertFlags::UNDO_WITH_PURGE),
        );
        assert_eq!(page.version(), before + 1);
        before
    };
    if checkpoint_after {
        store.checkpoint().unwrap();
    } else {
        store.flush_log(true).unwrap();
    }
    std::mem::forget(txn);
    (key, page_no, before)
}

#[test]
fn abort_purges_and_bumps_the_version_again() {
    common::init_tracing();
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, page_no) = three_rows(&store);
    let mut txn = store.begin();
    let before = {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.get_page(page_no).unwrap();
        let before = page.version();
        let row = [Field::value(&b"R"[..])];
        insert_with(
            &mut handle,
            &mut page,
            InsertRequest::new(3, &row).flags(InsertFlags::UNDO_WITH_PURGE),
        );
        before
    };
    txn.abort().unwrap();
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    assert_eq!(page.version(), before + 2);
    assert_eq!(page.records().len(), 3);
}

#[test]
fn redo_skips_an_insert_the_page_already_holds() {
    let storage = MemStorage::new();
    let (key, page_no, before) = crash_mid_insert(&storage, true);
    let store = open(&storage);
    let stats = store.last_recovery();
    assert_eq!(stats.redo_applied, 0);
    assert_eq!(stats.losers_rolled_back, 1);
    assert_eq!(stats.clrs_written, 1);
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    assert_eq!(page.version(), before + 2);
    assert_eq!(
        all_rows(&page),
        vec![(b"r0".to_vec(), false), (b"r1".to_vec(), false), (b"r2".to_vec(), false)]
    );
}

#[test]
fn redo_reapplies_an_insert_missing_from_an_older_image() {
    let storage = MemStorage::new();
    let (key, page_no, before) = crash_mid_insert(&storage, false);
    let store = open(&storage);
    let stats = store.last_recovery();
    assert_eq!(stats.redo_applied, 1);
    assert_eq!(stats.losers_rolled_back, 1);
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    assert_eq!(page.version(), before + 2);
    assert_eq!(page.records().len(), 3);
}

#[test]
fn committed_work_survives_and_unfinished_work_does_not() {
    let storage = MemStorage::new();
    let (key, page_no, loser) = {
        let store = open(&storage);
        let (key, page_no) = three_rows(&store);
        let mut txn = store.begin();
        {
            let mut handle = txn.open_container(key).unwrap();
            let mut page = handle.get_page(page_no).unwrap();
            insert(&mut handle, &mut page, 3, b"uncommitted");
        }
        let loser = txn.id();
        store.flush_log(true).unwrap();
        std::mem::forget(txn);
        (key, page_no, loser)
    };

    let store = open(&storage);
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    let live: Vec<_> = live_rows(&page).into_iter().map(|(_, v)| v).collect();
    assert_eq!(live, vec![b"r0".to_vec(), b"r1".to_vec(), b"r2".to_vec()]);
    drop(page);

    let records = store.log_records().unwrap();
    assert!(matches!(
        records.last(),
        Some((_, r)) if r.txn == loser && r.body == LogBody::End { aborted: true }
    ));
    // Transaction ids keep growing across restarts.
    assert!(store.begin().id() > loser);
}

#[test]
fn recovery_resumes_a_partial_rollback() {
    let storage = MemStorage::new();
    let (key, page_no) = {
        let store = open(&storage);
        let (key, page_no) = three_rows(&store);
        let mut txn = store.begin();
        {
            let mut handle = txn.open_container(key).unwrap();
            let mut page = handle.get_page(page_no).unwrap();
            insert(&mut handle, &mut page, 3, b"first");
        }
        txn.set_savepoint("half").unwrap();
        {
            let mut handle = txn.open_container(key).unwrap();
            let mut page = handle.get_page(page_no).unwrap();
            insert(&mut handle, &mut page, 4, b"second");
            insert(&mut handle, &mut page, 5, b"third");
        }
        txn.rollback_to_savepoint("half").unwrap();
        store.flush_log(true).unwrap();
        std::mem::forget(txn);
        (key, page_no)
    };

    let store = open(&storage);
    let stats = store.last_recovery();
    // The two compensated inserts are skipped through undo_next.
    assert_eq!(stats.clrs_written, 1);
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    assert_eq!(live_rows(&page).len(), 3);
    assert_eq!(page.records().len(), 6);
}

#[test]
fn a_second_restart_finds_nothing_to_undo() {
    let storage = MemStorage::new();
    crash_mid_insert(&storage, false);
    let first = open(&storage);
    assert_eq!(first.last_recovery().losers_rolled_back, 1);
    drop(first);
    let second = open(&storage);
    let stats = second.last_recovery();
    assert_eq!(stats.losers_rolled_back, 0);
    assert_eq!(stats.clrs_written, 0);
    assert!(stats.max_txn >= 2);
}

#[test]
fn dropped_container_is_removed_after_restart() {
    let storage = MemStorage::new();
    let key = {
        let store = open(&storage);
        let (key, _) = three_rows(&store);
        let mut txn = store.begin();
        txn.drop_container(key).unwrap();
        txn.commit().unwrap();
        assert_eq!(store.run_pending_reclaims(), 1);
        key
    };
    let store = open(&storage);
    assert!(store.container(key).is_none());
}

#[test]
fn drop_committed_before_a_crash_is_reclaimed_after_restart() {
    let storage = MemStorage::new();
    let key = {
        let store = open(&storage);
        let (key, _) = three_rows(&store);
        let mut txn = store.begin();
        txn.drop_container(key).unwrap();
        txn.commit().unwrap();
        store.flush_log(true).unwrap();
        assert_eq!(store.pending_reclaims(), 1);
        key
    };
    let store = open(&storage);
    assert!(store.container(key).unwrap().is_dropped());
    assert_eq!(store.pending_reclaims(), 1);
    assert_eq!(store.run_pending_reclaims(), 1);
    assert!(store.container(key).is_none());
}

#[test]
fn refused_changes_leave_nothing_for_redo() {
    common::init_tracing();
    let storage = MemStorage::new();
    let (key, page_no) = {
        let store = open(&storage);
        let (key, page_no) = three_rows(&store);
        store.checkpoint().unwrap();
        let logged = store.log_records().unwrap().len();

        let mut txn = store.begin();
        {
            let mut handle = txn.open_container(key).unwrap();
            let mut page = handle.get_page(page_no).unwrap();
            let before = page.version();
            let actions = handle.page_actions();
            let (txn, container) = handle.parts();
            let wide = [Field::Value(vec![7u8; 2000])];
            assert!(matches!(
                actions.action_update(txn, &mut page, container, 0, 0, &wide),
                Err(StoreError::NoSpace { .. })
            ));
            assert!(matches!(
                actions.action_update_field(txn, &mut page, container, 1, 0, wide[0].clone(), None),
                Err(StoreError::NoSpace { .. })
            ));
            let row = [Field::value(&b"late"[..])];
            assert!(matches!(
                actions.action_insert(txn, &mut page, container, InsertRequest::new(9, &row)),
                Err(StoreError::Invalid(_))
            ));
            assert_eq!(page.version(), before);
        }
        assert_eq!(store.log_records().unwrap().len(), logged);
        txn.abort().unwrap();
        store.flush_log(true).unwrap();
        (key, page_no)
    };

    let store = open(&storage);
    assert_eq!(store.last_recovery().redo_applied, 0);
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    assert_eq!(
        all_rows(&page),
        vec![(b"r0".to_vec(), false), (b"r1".to_vec(), false), (b"r2".to_vec(), false)]
    );
}

#[test]
fn on_disk_store_reopens_with_its_rows() {
    let dir = tempfile::tempdir().unwrap();
    let (key, page_no) = {
        let store = RawStore::open_dir(dir.path(), small_options()).unwrap();
        let (key, page_no) = three_rows(&store);
        let mut txn = store.begin();
        {
            let mut handle = txn.open_container(key).unwrap();
            let mut page = handle.get_page(page_no).unwrap();
            insert(&mut handle, &mut page, 3, b"after checkpoint");
        }
        store.checkpoint().unwrap();
        txn.commit().unwrap();
        (key, page_no)
    };
    let store = RawStore::open_dir(dir.path(), small_options()).unwrap();
    assert_eq!(store.last_recovery().losers_rolled_back, 0);
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    assert_eq!(live_rows(&page).len(), 4);
}
