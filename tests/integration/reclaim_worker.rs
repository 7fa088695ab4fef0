#![allow(missing_docs)]

mod common;

use std::thread;
use std::time::{Duration, Instant};

use common::{insert, small_options};
use rawstore::store::alloc::AllocStatus;
use rawstore::store::container::FIRST_ALLOC_PAGE;
use rawstore::{ContainerKey, Field, RawStore, ReclaimRequest};

fn alloc_status(store: &RawStore, key: ContainerKey, page_no: u64) -> AllocStatus {
    let container = store.container(key).unwrap();
    let alloc = container.latch_page(FIRST_ALLOC_PAGE).unwrap();
    alloc.extent().unwrap().status(page_no).unwrap()
}

fn logged_container(store: &RawStore) -> ContainerKey {
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    txn.commit().unwrap();
    key
}

/// Commits an overflow page whose only row is deleted.
fn emptied_overflow_page(store: &RawStore, key: ContainerKey) -> u64 {
    let mut txn = store.begin();
    let mut handle = txn.open_container(key).unwrap();
    let mut page = handle.add_overflow_page().unwrap();
    insert(&mut handle, &mut page, 0, b"portion");
    let actions = handle.page_actions();
    let (txn_ref, container) = handle.parts();
    actions.action_delete(txn_ref, &mut page, container, 0, true, None).unwrap();
    let page_no = page.key().page_number;
    drop(page);
    drop(handle);
    txn.commit().unwrap();
    page_no
}

fn queue(store: &RawStore, request: ReclaimRequest) {
    let mut txn = store.begin();
    txn.queue_reclaim(request).unwrap();
    txn.commit().unwrap();
}

#[test]
fn background_worker_removes_dropped_containers() {
    common::init_tracing();
    let mut options = small_options().background_reclaim(true);
    options.reclaim.idle_wait_ms = 5;
    let store = RawStore::open_in_memory(options).unwrap();
    let key = logged_container(&store);

    let mut txn = store.begin();
    txn.drop_container(key).unwrap();
    txn.commit().unwrap();

    let deadline = Instant::now() + Duration::from_secs(5);
    while store.metrics().snapshot().reclaims_done == 0 && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(store.container(key).is_none());
    assert_eq!(store.metrics().snapshot().reclaims_done, 1);
}

#[test]
fn empty_overflow_pages_are_freed() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let key = logged_container(&store);
    let page_no = emptied_overflow_page(&store, key);
    assert_eq!(alloc_status(&store, key, page_no), AllocStatus::Allocated);

    queue(&store, ReclaimRequest::page(key, page_no));
    assert_eq!(store.pending_reclaims(), 1);
    assert_eq!(store.run_pending_reclaims(), 1);
    assert_eq!(alloc_status(&store, key, page_no), AllocStatus::Free);
    let container = store.container(key).unwrap();
    assert!(!container.latch_page(page_no).unwrap().is_valid());
}

#[test]
fn pages_still_in_use_are_left_alone() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let key = logged_container(&store);
    let mut txn = store.begin();
    let page_no = {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.add_page().unwrap();
        insert(&mut handle, &mut page, 0, b"live");
        page.key().page_number
    };
    txn.commit().unwrap();

    queue(&store, ReclaimRequest::page(key, page_no));
    assert_eq!(store.run_pending_reclaims(), 1);
    assert_eq!(alloc_status(&store, key, page_no), AllocStatus::Allocated);
}

#[test]
fn busy_pages_are_retried_then_given_up() {
    let store = RawStore::open_in_memory(small_options().reclaim_max_attempts(2)).unwrap();
    let key = logged_container(&store);
    let page_no = emptied_overflow_page(&store, key);
    queue(&store, ReclaimRequest::page(key, page_no));

    let container = store.container(key).unwrap();
    let held = container.latch_page(page_no).unwrap();
    assert_eq!(store.run_pending_reclaims(), 0);
    assert_eq!(store.pending_reclaims(), 1);
    assert_eq!(store.metrics().snapshot().reclaims_requeued, 1);

    assert_eq!(store.run_pending_reclaims(), 0);
    assert_eq!(store.pending_reclaims(), 0);
    assert_eq!(store.metrics().snapshot().reclaims_dropped, 1);
    drop(held);
    assert_eq!(alloc_status(&store, key, page_no), AllocStatus::Allocated);
}

#[test]
fn busy_page_is_served_once_released() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let key = logged_container(&store);
    let page_no = emptied_overflow_page(&store, key);
    queue(&store, ReclaimRequest::page(key, page_no));

    let container = store.container(key).unwrap();
    let held = container.latch_page(page_no).unwrap();
    assert_eq!(store.run_pending_reclaims(), 0);
    drop(held);
    assert_eq!(store.run_pending_reclaims(), 1);
    assert_eq!(alloc_status(&store, key, page_no), AllocStatus::Free);
}

#[test]
fn asap_requests_run_at_commit() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let mut txn = store.begin();
    let key = txn.create_container(true).unwrap();
    let (page_no, record) = {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.add_page().unwrap();
        let record = insert(&mut handle, &mut page, 0, b"grows later");
        // Room an access method held back for the row to grow in place.
        page.set_reserved_space(None, 0, 24).unwrap();
        (page.key().page_number, record)
    };
    txn.queue_reclaim(ReclaimRequest::row_reserve(key, page_no, record).asap())
        .unwrap();
    txn.commit().unwrap();

    assert_eq!(store.pending_reclaims(), 0);
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    assert_eq!(page.record_at(0).unwrap().reserved, 0);
}

#[test]
fn long_column_chains_are_freed_page_by_page() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let key = logged_container(&store);
    let bytes = vec![0xAB; 2500];
    let mut txn = store.begin();
    let head = txn.open_container(key).unwrap().store_long_column(&bytes).unwrap();
    txn.commit().unwrap();
    let Field::Long { page, record } = head else {
        panic!("expected a long column, got {head:?}");
    };

    let container = store.container(key).unwrap();
    let chain: Vec<u64> = {
        let alloc = container.latch_page(FIRST_ALLOC_PAGE).unwrap();
        alloc.extent().unwrap().pages_with(AllocStatus::Allocated).collect()
    };
    assert!(chain.len() > 1);

    queue(&store, ReclaimRequest::column_chain(key, page, record));
    assert_eq!(store.run_pending_reclaims(), 1);
    for page_no in chain {
        assert_eq!(alloc_status(&store, key, page_no), AllocStatus::Free);
    }
}

#[test]
fn container_requests_skip_live_containers() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let key = logged_container(&store);
    queue(&store, ReclaimRequest::container(key));
    assert_eq!(store.run_pending_reclaims(), 1);
    assert!(store.container(key).is_some());
}
