#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::{all_rows, insert};
use proptest::prelude::*;
use rawstore::primitives::io::MemStorage;
use rawstore::{ContainerKey, Field, RawStore, StoreOptions};

#[derive(Clone, Debug)]
enum Step {
    Insert(Vec<u8>),
    Delete(usize),
    Update(usize, Vec<u8>),
    Checkpoint,
}

fn arb_step() -> impl Strategy<Value = Step> {
    prop_oneof![
        3 => prop::collection::vec(any::<u8>(), 1..24).prop_map(Step::Insert),
        1 => any::<usize>().prop_map(Step::Delete),
        2 => (any::<usize>(), prop::collection::vec(any::<u8>(), 1..24))
            .prop_map(|(i, v)| Step::Update(i, v)),
        1 => Just(Step::Checkpoint),
    ]
}

fn options() -> StoreOptions {
    StoreOptions::default().page_size(4096).alloc_extent_pages(16)
}

fn open(storage: &MemStorage) -> RawStore {
    RawStore::open_with_storage(Arc::new(storage.clone()), options()).unwrap()
}

fn setup(store: &RawStore) -> (ContainerKey, u64) {
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    let mut handle = txn.open_container(key).unwrap();
    let page_no = handle.add_page().unwrap().key().page_number;
    drop(handle);
    txn.commit().unwrap();
    (key, page_no)
}

/// Runs `step` in its own committed transaction and mirrors it in `model`.
fn apply(store: &RawStore, key: ContainerKey, page_no: u64, step: &Step, model: &mut Vec<(Vec<u8>, bool)>) {
    if let Step::Checkpoint = step {
        store.checkpoint().unwrap();
        return;
    }
    let mut txn = store.begin();
    let mut handle = txn.open_container(key).unwrap();
    let mut page = handle.get_page(page_no).unwrap();
    let actions = handle.page_actions();
    match step {
        Step::Insert(value) => {
            insert(&mut handle, &mut page, model.len(), value);
            model.push((value.clone(), false));
        }
        Step::Delete(i) if !model.is_empty() => {
            let slot = i % model.len();
            let (txn, container) = handle.parts();
            actions.action_delete(txn, &mut page, container, slot, true, None).unwrap();
            model[slot].1 = true;
        }
        Step::Update(i, value) if !model.is_empty() => {
            let slot = i % model.len();
            let (txn, container) = handle.parts();
            actions
                .action_update_field(txn, &mut page, container, slot, 0, Field::value(value.clone()), None)
                .unwrap();
            model[slot].0 = value.clone();
        }
        _ => {}
    }
    drop(page);
    drop(handle);
    txn.commit().unwrap();
}

fn rows(store: &RawStore, key: ContainerKey, page_no: u64) -> Vec<(Vec<u8>, bool)> {
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    all_rows(&page)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn replaying_the_log_is_idempotent(steps in prop::collection::vec(arb_step(), 1..40)) {
        let storage = MemStorage::new();
        let mut model = Vec::new();
        let (key, page_no) = {
            let store = open(&storage);
            let (key, page_no) = setup(&store);
            for step in &steps {
                apply(&store, key, page_no, step, &mut model);
            }
            (key, page_no)
        };

        // First restart redoes whatever the last checkpoint missed.
        let first = open(&storage);
        prop_assert_eq!(rows(&first, key, page_no), model.clone());
        prop_assert_eq!(first.last_recovery().losers_rolled_back, 0);
        drop(first);

        // A second restart over the same files must land on the same state.
        let second = open(&storage);
        prop_assert_eq!(rows(&second, key, page_no), model.clone());
        second.checkpoint().unwrap();
        drop(second);

        // Once everything is on disk, the version gate skips every record.
        let third = open(&storage);
        prop_assert_eq!(rows(&third, key, page_no), model);
        let stats = third.last_recovery();
        prop_assert_eq!(stats.redo_applied, 0);
        prop_assert_eq!(stats.redo_skipped, stats.records_scanned - count_bookends(&third));
    }
}

/// Begin and end records are scanned but never redone.
fn count_bookends(store: &RawStore) -> u64 {
    use rawstore::store::log_record::LogBody;
    store
        .log_records()
        .unwrap()
        .iter()
        .filter(|(_, r)| matches!(r.body, LogBody::Begin | LogBody::End { .. }))
        .count() as u64
}

#[test]
fn redo_restores_pages_never_written() {
    common::init_tracing();
    let storage = MemStorage::new();
    let (key, page_no) = {
        let store = open(&storage);
        let (key, page_no) = setup(&store);
        let mut model = Vec::new();
        for value in [&b"a"[..], b"b", b"c"] {
            apply(&store, key, page_no, &Step::Insert(value.to_vec()), &mut model);
        }
        (key, page_no)
    };
    let store = open(&storage);
    let stats = store.last_recovery();
    assert!(stats.redo_applied > 0);
    assert_eq!(
        rows(&store, key, page_no),
        vec![(b"a".to_vec(), false), (b"b".to_vec(), false), (b"c".to_vec(), false)]
    );
    assert_eq!(store.metrics().snapshot().redo_applied, stats.redo_applied);
}
