#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::{insert, live_rows, small_options};
use rawstore::primitives::io::{ContainerStorage, MemStorage};
use rawstore::store::log_record::LogBody;
use rawstore::store::ops::Loggable;
use rawstore::{ContainerKey, RawStore, StoreError};

fn store_over(storage: &MemStorage) -> RawStore {
    RawStore::open_with_storage(Arc::new(storage.clone()), small_options()).unwrap()
}

/// Commits a logged container holding one row.
fn committed_container(store: &RawStore) -> (ContainerKey, u64) {
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    let mut handle = txn.open_container(key).unwrap();
    let mut page = handle.add_page().unwrap();
    insert(&mut handle, &mut page, 0, b"row");
    let page_no = page.key().page_number;
    drop(page);
    drop(handle);
    txn.commit().unwrap();
    (key, page_no)
}

#[test]
fn drop_on_commit_drops_and_queues_removal() {
    common::init_tracing();
    let storage = MemStorage::new();
    let store = store_over(&storage);
    let (key, _) = committed_container(&store);

    let mut txn = store.begin();
    txn.drop_on_commit(key).unwrap();
    assert_eq!(txn.pending_hooks(), 1);
    txn.commit().unwrap();

    let container = store.container(key).unwrap();
    assert!(container.is_dropped());
    assert_eq!(store.pending_reclaims(), 1);
    assert_eq!(store.run_pending_reclaims(), 1);
    assert!(store.container(key).is_none());
    assert!(!storage.list().unwrap().contains(&key));
}

#[test]
fn drop_on_commit_logs_the_drop_inside_the_committing_transaction() {
    let storage = MemStorage::new();
    let key = {
        let store = store_over(&storage);
        let (key, _) = committed_container(&store);
        let mut txn = store.begin();
        let txn_id = txn.id();
        txn.drop_on_commit(key).unwrap();
        txn.commit().unwrap();

        let bodies: Vec<_> = store
            .log_records()
            .unwrap()
            .into_iter()
            .filter(|(_, r)| r.txn == txn_id)
            .map(|(_, r)| r.body)
            .collect();
        assert_eq!(bodies.len(), 3);
        assert!(matches!(&bodies[1], LogBody::Op { op, .. } if op.name() == "container_drop"));
        assert_eq!(bodies[2], LogBody::End { aborted: false });
        key
    };
    // The drop survives a restart even though its removal never ran.
    let store = store_over(&storage);
    assert!(store.container(key).unwrap().is_dropped());
    assert_eq!(store.run_pending_reclaims(), 1);
    assert!(store.container(key).is_none());
}

#[test]
fn drop_on_commit_leaves_a_logged_container_on_abort() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, page_no) = committed_container(&store);

    let mut txn = store.begin();
    txn.drop_on_commit(key).unwrap();
    txn.abort().unwrap();

    let container = store.container(key).unwrap();
    assert!(!container.is_dropped());
    assert_eq!(live_rows(&container.latch_page(page_no).unwrap()).len(), 1);
    assert_eq!(store.pending_reclaims(), 0);
}

#[test]
fn drop_on_commit_removes_a_temporary_container_on_abort() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let mut txn = store.begin();
    let key = txn.create_container(true).unwrap();
    txn.drop_on_commit(key).unwrap();
    txn.abort().unwrap();
    assert!(store.container(key).is_none());
}

#[test]
fn sync_on_commit_writes_dirty_pages() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, page_no) = committed_container(&store);
    let container = store.container(key).unwrap();
    assert!(container.latch_page(page_no).unwrap().is_dirty());

    let mut txn = store.begin();
    {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.get_page(page_no).unwrap();
        insert(&mut handle, &mut page, 1, b"synced");
    }
    txn.sync_on_commit(key).unwrap();
    txn.commit().unwrap();

    let page = container.latch_page(page_no).unwrap();
    assert!(!page.is_dirty());
    assert_eq!(live_rows(&page).len(), 2);
}

#[test]
fn truncate_on_commit_fires_once_on_savepoint_rollback() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let mut txn = store.begin();
    let key = txn.create_container(true).unwrap();
    txn.truncate_on_commit(key, false).unwrap();
    txn.set_savepoint("scratch").unwrap();
    {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.add_page().unwrap();
        insert(&mut handle, &mut page, 0, b"temp");
    }
    let container = store.container(key).unwrap();
    assert_eq!(container.cached_pages(), vec![0, 1]);

    txn.rollback_to_savepoint("scratch").unwrap();
    assert_eq!(container.cached_pages(), vec![0]);
    assert_eq!(txn.pending_hooks(), 0);

    // The hook is gone: new work survives commit.
    {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.add_page().unwrap();
        insert(&mut handle, &mut page, 0, b"kept");
    }
    txn.commit().unwrap();
    let page = container.latch_page(1).unwrap();
    assert_eq!(live_rows(&page).len(), 1);
}

#[test]
fn truncate_on_commit_with_commit_as_well_empties_at_commit() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let mut txn = store.begin();
    let key = txn.create_container(true).unwrap();
    {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.add_page().unwrap();
        insert(&mut handle, &mut page, 0, b"gone");
    }
    txn.truncate_on_commit(key, true).unwrap();
    txn.commit().unwrap();
    assert_eq!(store.container(key).unwrap().cached_pages(), vec![0]);
}

#[test]
fn truncate_on_commit_needs_a_temporary_container() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, _) = committed_container(&store);
    let mut txn = store.begin();
    assert!(matches!(
        txn.truncate_on_commit(key, true),
        Err(StoreError::Invalid(_))
    ));
    assert!(matches!(
        txn.sync_on_commit(ContainerKey::new(0, 999)),
        Err(StoreError::ContainerNotFound(_))
    ));
}

#[test]
fn dropping_the_container_retires_its_hooks() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, _) = committed_container(&store);
    let mut txn = store.begin();
    txn.sync_on_commit(key).unwrap();
    txn.sync_on_commit(key).unwrap();
    assert_eq!(txn.pending_hooks(), 1);
    txn.drop_container(key).unwrap();
    assert_eq!(txn.pending_hooks(), 0);
    txn.commit().unwrap();
    assert_eq!(store.run_pending_reclaims(), 1);
    assert!(store.container(key).is_none());
}

#[test]
fn temporary_containers_write_no_log() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let before = store.log_stats().records_appended;
    let mut txn = store.begin();
    let key = txn.create_container(true).unwrap();
    {
        let mut handle = txn.open_container(key).unwrap();
        assert!(!handle.page_actions().is_logged());
        let mut page = handle.add_page().unwrap();
        insert(&mut handle, &mut page, 0, b"scratch");
    }
    txn.commit().unwrap();
    assert_eq!(store.log_stats().records_appended, before);
    assert!(store.metrics().snapshot().ops_direct >= 3);
}
