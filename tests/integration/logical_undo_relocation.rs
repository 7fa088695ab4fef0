#![allow(missing_docs)]

mod common;

use std::sync::Arc;

use common::{all_rows, insert_with, small_options};
use rawstore::primitives::io::MemStorage;
use rawstore::store::log_record::LogBody;
use rawstore::store::ops::Operation;
use rawstore::{
    Container, ContainerKey, Field, InsertRequest, LogicalUndo, PageLatch, RawStore, RecordId, Result,
    StoreError, StoredRecord, UndoRegistry,
};

const MOVABLE: u32 = 7;

/// Finds a record by id and contents on any page of the container, the way
/// an index would after a split moved its rows.
struct FindById;

impl LogicalUndo for FindById {
    fn find_undo(
        &self,
        container: &Arc<Container>,
        original: PageLatch,
        record: RecordId,
        row: &StoredRecord,
    ) -> Result<(PageLatch, RecordId)> {
        if original.find_record_by_id(record).is_some() {
            return Ok((original, record));
        }
        let key = original.key();
        drop(original);
        for page_no in 1..64 {
            let Some(page) = container.latch_if_present(page_no)? else {
                break;
            };
            let found = page.is_valid()
                && page
                    .records()
                    .iter()
                    .any(|r| r.id == record && r.fields == row.fields);
            if found {
                return Ok((page, record));
            }
        }
        Err(StoreError::RecordNotFound {
            page: key,
            record,
            op: "find_undo",
        })
    }
}

fn undo_registry() -> UndoRegistry {
    let registry = UndoRegistry::default();
    registry.register(MOVABLE, Arc::new(FindById));
    registry
}

/// A committed container with two empty record pages.
fn two_pages(store: &RawStore) -> (ContainerKey, u64, u64) {
    let mut txn = store.begin();
    let key = txn.create_container(false).unwrap();
    let mut handle = txn.open_container(key).unwrap();
    let first = handle.add_page().unwrap().key().page_number;
    let second = handle.add_page().unwrap().key().page_number;
    drop(handle);
    txn.commit().unwrap();
    (key, first, second)
}

/// Moves every row of `from` onto `to` in a committed transaction.
fn move_rows(store: &RawStore, key: ContainerKey, from: u64, to: u64) {
    let mut txn = store.begin();
    let mut handle = txn.open_container(key).unwrap();
    let mut src = handle.get_page(from).unwrap();
    let mut dest = handle.get_page(to).unwrap();
    let num = src.records().len();
    let actions = handle.page_actions();
    let (txn_ref, container) = handle.parts();
    actions
        .action_copy_rows(txn_ref, &src, 0, num, &mut dest, container, 0)
        .unwrap();
    actions.action_purge(txn_ref, &mut src, container, 0, num).unwrap();
    drop(src);
    drop(dest);
    drop(handle);
    txn.commit().unwrap();
}

fn logical_clr_pages(store: &RawStore) -> Vec<u64> {
    store
        .log_records()
        .unwrap()
        .into_iter()
        .filter_map(|(_, r)| match r.body {
            LogBody::Clr {
                op: Operation::LogicalUndo(clr),
                ..
            } => Some(clr.header.page.page_number),
            _ => None,
        })
        .collect()
}

#[test]
fn undo_follows_a_row_to_its_new_page() {
    common::init_tracing();
    let store = RawStore::open_with_undo(Arc::new(MemStorage::new()), small_options(), undo_registry()).unwrap();
    let (key, first, second) = two_pages(&store);

    let mut txn = store.begin();
    {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.get_page(first).unwrap();
        let row = [Field::value(&b"moving"[..])];
        insert_with(&mut handle, &mut page, InsertRequest::new(0, &row).undo_id(MOVABLE));
    }
    move_rows(&store, key, first, second);
    txn.abort().unwrap();

    let container = store.container(key).unwrap();
    assert!(all_rows(&container.latch_page(first).unwrap()).is_empty());
    assert_eq!(
        all_rows(&container.latch_page(second).unwrap()),
        vec![(b"moving".to_vec(), true)]
    );
    assert_eq!(logical_clr_pages(&store), vec![second]);
}

#[test]
fn undo_without_a_move_stays_on_the_original_page() {
    let store = RawStore::open_with_undo(Arc::new(MemStorage::new()), small_options(), undo_registry()).unwrap();
    let (key, first, _) = two_pages(&store);

    let mut txn = store.begin();
    {
        let mut handle = txn.open_container(key).unwrap();
        let mut page = handle.get_page(first).unwrap();
        let row = [Field::value(&b"still"[..])];
        insert_with(&mut handle, &mut page, InsertRequest::new(0, &row).undo_id(MOVABLE));
    }
    txn.abort().unwrap();
    let container = store.container(key).unwrap();
    assert_eq!(
        all_rows(&container.latch_page(first).unwrap()),
        vec![(b"still".to_vec(), true)]
    );
    assert_eq!(logical_clr_pages(&store), vec![first]);
}

#[test]
fn recovery_undoes_a_moved_row_of_an_unfinished_transaction() {
    let storage = MemStorage::new();
    let (key, first, second) = {
        let store =
            RawStore::open_with_undo(Arc::new(storage.clone()), small_options(), undo_registry()).unwrap();
        let (key, first, second) = two_pages(&store);
        let mut txn = store.begin();
        {
            let mut handle = txn.open_container(key).unwrap();
            let mut page = handle.get_page(first).unwrap();
            let row = [Field::value(&b"orphan"[..])];
            insert_with(&mut handle, &mut page, InsertRequest::new(0, &row).undo_id(MOVABLE));
        }
        // The mover's commit forces the unfinished insert to the log as well.
        move_rows(&store, key, first, second);
        // Crash with the inserting transaction still running.
        std::mem::forget(txn);
        (key, first, second)
    };

    let store = RawStore::open_with_undo(Arc::new(storage), small_options(), undo_registry()).unwrap();
    let stats = store.last_recovery();
    assert_eq!(stats.losers_rolled_back, 1);
    assert_eq!(stats.clrs_written, 1);
    let container = store.container(key).unwrap();
    assert!(all_rows(&container.latch_page(first).unwrap()).is_empty());
    assert_eq!(
        all_rows(&container.latch_page(second).unwrap()),
        vec![(b"orphan".to_vec(), true)]
    );
}
