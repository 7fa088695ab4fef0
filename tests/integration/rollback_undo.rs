#![allow(missing_docs)]

mod common;

use common::{all_rows, insert, live_rows, small_options};
use rawstore::store::log_record::LogBody;
use rawstore::{Field, RawStore, XactState};

/// Commits a container holding one page with the rows `values`.
fn seeded(store: &RawStore, values: &[&[u8]]) -> (rawstore::ContainerKey, u64) {
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    let mut handle = txn.open_container(key).unwrap();
    let mut page = handle.add_page().unwrap();
    for (slot, value) in values.iter().enumerate() {
        insert(&mut handle, &mut page, slot, value);
    }
    let page_no = page.key().page_number;
    drop(page);
    drop(handle);
    txn.commit().unwrap();
    (key, page_no)
}

#[test]
fn abort_restores_committed_rows() {
    common::init_tracing();
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, page_no) = seeded(&store, &[b"alpha", b"beta"]);

    let mut txn = store.begin();
    let mut handle = txn.open_container(key).unwrap();
    let mut page = handle.get_page(page_no).unwrap();
    let actions = handle.page_actions();
    insert(&mut handle, &mut page, 2, b"gamma");
    {
        let (txn, container) = handle.parts();
        actions
            .action_update_field(txn, &mut page, container, 0, 0, Field::value(&b"ALPHA"[..]), None)
            .unwrap();
        actions.action_delete(txn, &mut page, container, 1, true, None).unwrap();
    }
    assert_eq!(
        all_rows(&page),
        vec![
            (b"ALPHA".to_vec(), false),
            (b"beta".to_vec(), true),
            (b"gamma".to_vec(), false)
        ]
    );
    drop(page);
    drop(handle);
    let before = store.metrics().snapshot().clrs_written;
    txn.abort().unwrap();

    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    // The insert is undone by marking the new row deleted.
    assert_eq!(
        all_rows(&page),
        vec![
            (b"alpha".to_vec(), false),
            (b"beta".to_vec(), false),
            (b"gamma".to_vec(), true)
        ]
    );
    assert_eq!(store.metrics().snapshot().clrs_written - before, 3);
}

#[test]
fn compensation_records_skip_what_they_undid() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, page_no) = seeded(&store, &[b"one"]);

    let mut txn = store.begin();
    let txn_id = txn.id();
    let mut handle = txn.open_container(key).unwrap();
    let mut page = handle.get_page(page_no).unwrap();
    insert(&mut handle, &mut page, 1, b"two");
    insert(&mut handle, &mut page, 2, b"three");
    drop(page);
    drop(handle);
    txn.abort().unwrap();

    let records: Vec<_> = store
        .log_records()
        .unwrap()
        .into_iter()
        .filter(|(_, r)| r.txn == txn_id)
        .collect();
    let ops: Vec<_> = records
        .iter()
        .filter(|(_, r)| matches!(r.body, LogBody::Op { .. }))
        .map(|(lsn, r)| (*lsn, r.prev))
        .collect();
    let clrs: Vec<_> = records
        .iter()
        .filter_map(|(_, r)| match r.body {
            LogBody::Clr { undone, undo_next, .. } => Some((undone, undo_next)),
            _ => None,
        })
        .collect();
    assert_eq!(ops.len(), 2);
    // Newest first, each pointing past the record it compensates.
    assert_eq!(clrs, vec![(ops[1].0, ops[1].1), (ops[0].0, ops[0].1)]);
    assert!(matches!(
        records.last().map(|(_, r)| &r.body),
        Some(LogBody::End { aborted: true })
    ));
}

#[test]
fn savepoint_rollback_keeps_earlier_work() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, page_no) = seeded(&store, &[]);

    let mut txn = store.begin();
    {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.get_page(page_no).unwrap();
        insert(&mut handle, &mut page, 0, b"kept");
    }
    txn.set_savepoint("sp").unwrap();
    {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.get_page(page_no).unwrap();
        insert(&mut handle, &mut page, 1, b"undone");
    }
    txn.rollback_to_savepoint("sp").unwrap();
    assert_eq!(txn.state(), XactState::Active);
    {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.get_page(page_no).unwrap();
        insert(&mut handle, &mut page, 2, b"after");
    }
    // Rolling back to the same savepoint again undoes only the new work.
    txn.rollback_to_savepoint("sp").unwrap();
    txn.commit().unwrap();

    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    let live: Vec<_> = live_rows(&page).into_iter().map(|(_, v)| v).collect();
    assert_eq!(live, vec![b"kept".to_vec()]);
}

#[test]
fn dropping_an_active_transaction_rolls_it_back() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, page_no) = seeded(&store, &[b"base"]);
    {
        let mut txn = store.begin();
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.get_page(page_no).unwrap();
        insert(&mut handle, &mut page, 1, b"lost");
    }
    let page = store.container(key).unwrap().latch_page(page_no).unwrap();
    assert_eq!(live_rows(&page).len(), 1);
    assert_eq!(store.metrics().snapshot().aborts, 1);
}

#[test]
fn aborted_create_removes_the_container() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    {
        let mut handle = txn.open_container(key).unwrap();
        let page = handle.add_page().unwrap();
        assert!(page.is_valid());
    }
    txn.abort().unwrap();
    assert!(store.container(key).is_none());
    assert!(store.container_keys().is_empty());
}

#[test]
fn aborted_drop_brings_the_container_back() {
    let store = RawStore::open_in_memory(small_options()).unwrap();
    let (key, page_no) = seeded(&store, &[b"still here"]);
    let mut txn = store.begin();
    txn.drop_container(key).unwrap();
    assert!(store.container(key).unwrap().is_dropped());
    assert!(txn.open_container(key).is_err());
    txn.abort().unwrap();

    let container = store.container(key).unwrap();
    assert!(!container.is_dropped());
    let page = container.latch_page(page_no).unwrap();
    assert_eq!(live_rows(&page).len(), 1);
    assert_eq!(store.pending_reclaims(), 0);
}
