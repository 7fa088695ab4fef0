#![allow(dead_code)]

use rawstore::store::page::RowLogOutcome;
use rawstore::{ContainerHandle, Field, InsertRequest, Page, RecordId, StoreOptions};

/// Routes store tracing to the test output when `RUST_LOG` is set.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Small pages so a handful of rows exercise every path.
pub fn small_options() -> StoreOptions {
    StoreOptions::default().page_size(1024).alloc_extent_pages(8)
}

/// Inserts a one-column row at `slot` and returns its id.
pub fn insert(handle: &mut ContainerHandle<'_>, page: &mut Page, slot: usize, value: &[u8]) -> RecordId {
    insert_with(handle, page, InsertRequest::new(slot, &[Field::value(value)]))
}

pub fn insert_with(handle: &mut ContainerHandle<'_>, page: &mut Page, req: InsertRequest<'_>) -> RecordId {
    let actions = handle.page_actions();
    let (txn, container) = handle.parts();
    let (outcome, id) = actions.action_insert(txn, page, container, req).unwrap();
    assert!(matches!(outcome, RowLogOutcome::Complete));
    id.unwrap()
}

/// Live rows of `page` as `(id, first column)`, in slot order.
pub fn live_rows(page: &Page) -> Vec<(RecordId, Vec<u8>)> {
    page.records()
        .iter()
        .filter(|r| !r.deleted)
        .map(|r| {
            let value = r.fields.first().and_then(Field::as_bytes).unwrap_or_default();
            (r.id, value.to_vec())
        })
        .collect()
}

/// Every row of `page` as `(first column, deleted)`.
pub fn all_rows(page: &Page) -> Vec<(Vec<u8>, bool)> {
    page.records()
        .iter()
        .map(|r| {
            let value = r.fields.first().and_then(Field::as_bytes).unwrap_or_default();
            (value.to_vec(), r.deleted)
        })
        .collect()
}
