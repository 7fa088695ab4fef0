#![allow(missing_docs)]

mod common;

use std::collections::BTreeSet;
use std::sync::Arc;

use proptest::prelude::*;
use rawstore::primitives::io::MemStorage;
use rawstore::store::alloc::AllocStatus;
use rawstore::store::container::FIRST_ALLOC_PAGE;
use rawstore::{Container, ContainerKey, RawStore, StoreError, StoreOptions, Transaction};

fn wide_options() -> StoreOptions {
    StoreOptions::default().page_size(1024).alloc_extent_pages(48)
}

/// Pages with `status` across the whole allocation chain.
fn pages_with(container: &Container, status: AllocStatus) -> BTreeSet<u64> {
    let mut pages = BTreeSet::new();
    let mut alloc_no = Some(FIRST_ALLOC_PAGE);
    while let Some(no) = alloc_no {
        let alloc = container.latch_page(no).unwrap();
        let extent = alloc.extent().unwrap();
        pages.extend(extent.pages_with(status));
        alloc_no = extent.next_alloc_page();
    }
    pages
}

fn extent_len(container: &Container) -> usize {
    container.latch_page(FIRST_ALLOC_PAGE).unwrap().extent().unwrap().len()
}

/// Commits a container with 40 pages of which only the first 10 stay in use.
fn forty_then_ten(store: &RawStore) -> ContainerKey {
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    let mut handle = txn.open_container(key).unwrap();
    for expected in 1..=40 {
        assert_eq!(handle.add_page().unwrap().key().page_number, expected);
    }
    drop(handle);
    txn.commit().unwrap();

    let mut txn = store.begin();
    let mut handle = txn.open_container(key).unwrap();
    for page_no in 11..=40 {
        let page = handle.get_page(page_no).unwrap();
        handle.remove_page(page).unwrap();
    }
    drop(handle);
    // Released pages stay deallocated until the commit makes them free.
    let container = store.container(key).unwrap();
    assert_eq!(pages_with(&container, AllocStatus::Deallocated).len(), 30);
    txn.commit().unwrap();
    assert_eq!(pages_with(&container, AllocStatus::Free), (11..=40).collect());
    key
}

#[test]
fn compress_then_abort_restores_the_extent() {
    common::init_tracing();
    let store = RawStore::open_in_memory(wide_options()).unwrap();
    let key = forty_then_ten(&store);
    let container = store.container(key).unwrap();

    let mut txn = store.begin();
    let truncated = txn.open_container(key).unwrap().compress_space().unwrap();
    assert_eq!(truncated, 30);
    assert_eq!(extent_len(&container), 10);
    assert!(container.cached_pages().iter().all(|p| *p <= 10));
    txn.abort().unwrap();

    assert_eq!(extent_len(&container), 40);
    assert_eq!(pages_with(&container, AllocStatus::Allocated), (1..=10).collect());
    assert_eq!(pages_with(&container, AllocStatus::Free), (11..=40).collect());
}

#[test]
fn crash_during_compress_is_undone_by_recovery() {
    let storage = MemStorage::new();
    let key = {
        let store = RawStore::open_with_storage(Arc::new(storage.clone()), wide_options()).unwrap();
        let key = forty_then_ten(&store);
        store.checkpoint().unwrap();
        let mut txn = store.begin();
        assert_eq!(txn.open_container(key).unwrap().compress_space().unwrap(), 30);
        // The cut file survives the crash; the pages it held are not needed.
        store.checkpoint().unwrap();
        std::mem::forget(txn);
        key
    };

    let store = RawStore::open_with_storage(Arc::new(storage), wide_options()).unwrap();
    assert_eq!(store.last_recovery().losers_rolled_back, 1);
    let container = store.container(key).unwrap();
    assert_eq!(extent_len(&container), 40);
    assert_eq!(pages_with(&container, AllocStatus::Free), (11..=40).collect());

    // Freed pages come back blank and usable.
    let mut txn = store.begin();
    let mut handle = txn.open_container(key).unwrap();
    let page = handle.add_page().unwrap();
    assert_eq!(page.key().page_number, 11);
    assert!(page.is_valid());
    assert!(page.records().is_empty());
    drop(page);
    drop(handle);
    txn.commit().unwrap();
}

#[test]
fn committed_compress_survives_restart() {
    let storage = MemStorage::new();
    let key = {
        let store = RawStore::open_with_storage(Arc::new(storage.clone()), wide_options()).unwrap();
        let key = forty_then_ten(&store);
        let mut txn = store.begin();
        txn.open_container(key).unwrap().compress_space().unwrap();
        txn.commit().unwrap();
        key
    };
    let store = RawStore::open_with_storage(Arc::new(storage), wide_options()).unwrap();
    let container = store.container(key).unwrap();
    assert_eq!(extent_len(&container), 10);
    assert_eq!(pages_with(&container, AllocStatus::Allocated), (1..=10).collect());
}

#[test]
fn nothing_to_compress_logs_nothing() {
    let store = RawStore::open_in_memory(wide_options()).unwrap();
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    txn.open_container(key).unwrap().add_page().unwrap();
    txn.commit().unwrap();

    let before = store.log_stats();
    let mut txn = store.begin();
    assert_eq!(txn.open_container(key).unwrap().compress_space().unwrap(), 0);
    txn.commit().unwrap();
    assert_eq!(store.log_stats(), before);
}

#[derive(Clone, Debug)]
enum AllocStep {
    Add,
    Remove(usize),
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn allocation_never_hands_out_a_page_in_use(
        steps in prop::collection::vec(
            prop_oneof![2 => Just(AllocStep::Add), 1 => any::<usize>().prop_map(AllocStep::Remove)],
            1..60,
        )
    ) {
        let store = RawStore::open_in_memory(common::small_options()).unwrap();
        let mut txn = store.begin();
        let key = txn.create_container(false).unwrap();
        txn.commit().unwrap();
        let mut in_use = BTreeSet::new();

        for step in steps {
            let mut txn = store.begin();
            let mut handle = txn.open_container(key).unwrap();
            match step {
                AllocStep::Add => {
                    let page_no = handle.add_page().unwrap().key().page_number;
                    prop_assert!(in_use.insert(page_no), "page {} handed out twice", page_no);
                }
                AllocStep::Remove(i) if !in_use.is_empty() => {
                    let page_no = *in_use.iter().nth(i % in_use.len()).unwrap();
                    let page = handle.get_page(page_no).unwrap();
                    handle.remove_page(page).unwrap();
                    in_use.remove(&page_no);
                }
                AllocStep::Remove(_) => {}
            }
            drop(handle);
            txn.commit().unwrap();
        }

        let container = store.container(key).unwrap();
        prop_assert_eq!(pages_with(&container, AllocStatus::Allocated), in_use);
        prop_assert!(pages_with(&container, AllocStatus::Deallocated).is_empty());
    }
}

fn any_status() -> impl Strategy<Value = AllocStatus> {
    prop_oneof![
        Just(AllocStatus::Allocated),
        Just(AllocStatus::Deallocated),
        Just(AllocStatus::Free),
    ]
}

/// Sets `page` to `do_status` through the first allocation page.
fn allocate(
    txn: &mut Transaction,
    key: ContainerKey,
    page: u64,
    do_status: AllocStatus,
    undo_status: AllocStatus,
) -> rawstore::Result<()> {
    let mut handle = txn.open_container(key)?;
    let actions = handle.alloc_actions();
    let mut alloc = handle.container().latch_page(FIRST_ALLOC_PAGE)?;
    let (txn, container) = handle.parts();
    actions.action_allocate_page(txn, &mut alloc, container, page, do_status, undo_status)
}

fn status_of(container: &Container, page: u64) -> AllocStatus {
    container
        .latch_page(FIRST_ALLOC_PAGE)
        .unwrap()
        .extent()
        .unwrap()
        .status(page)
        .unwrap()
}

#[test]
fn allocating_outside_the_extent_logs_nothing() {
    let store = RawStore::open_in_memory(common::small_options()).unwrap();
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    txn.commit().unwrap();
    let container = store.container(key).unwrap();
    let beyond = {
        let alloc = container.latch_page(FIRST_ALLOC_PAGE).unwrap();
        alloc.extent().unwrap().last_managed_page() + 1
    };

    let before = store.log_stats();
    let mut txn = store.begin();
    assert!(matches!(
        allocate(&mut txn, key, beyond, AllocStatus::Allocated, AllocStatus::Free),
        Err(StoreError::Invalid(_))
    ));
    txn.abort().unwrap();
    assert_eq!(store.log_stats(), before);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn allocate_page_rolls_back_to_its_undo_status(
        prior in any_status(),
        do_status in any_status(),
        undo_status in any_status(),
        offset in 0u64..8,
    ) {
        let store = RawStore::open_in_memory(common::small_options()).unwrap();
        let mut txn = store.begin();
        let key = txn.create_container(false).unwrap();
        txn.commit().unwrap();
        let container = store.container(key).unwrap();
        let page = {
            let alloc = container.latch_page(FIRST_ALLOC_PAGE).unwrap();
            let extent = alloc.extent().unwrap();
            extent.first_page() + offset % u64::from(extent.capacity())
        };

        let mut txn = store.begin();
        allocate(&mut txn, key, page, prior, prior).unwrap();
        txn.commit().unwrap();
        prop_assert_eq!(status_of(&container, page), prior);

        // Paired with the status it replaces, rollback lands on that status.
        let mut txn = store.begin();
        allocate(&mut txn, key, page, do_status, prior).unwrap();
        prop_assert_eq!(status_of(&container, page), do_status);
        txn.abort().unwrap();
        prop_assert_eq!(status_of(&container, page), prior);

        // Otherwise it lands on the undo status given, not on the inverse.
        let mut txn = store.begin();
        allocate(&mut txn, key, page, do_status, undo_status).unwrap();
        txn.abort().unwrap();
        prop_assert_eq!(status_of(&container, page), undo_status);
    }
}
