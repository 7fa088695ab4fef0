//! A page and log layer for a transactional storage engine.
//!
//! Containers are files of fixed-size pages. Every change to a page is an
//! [`Operation`](store::ops::Operation) that is appended to the write-ahead
//! log before it touches the page, and every operation knows how to redo
//! itself and how to produce the compensation record that undoes it.
//! Recovery replays the log and rolls back whatever did not commit.
//!
//! ```no_run
//! use rawstore::{RawStore, StoreOptions};
//!
//! # fn main() -> rawstore::Result<()> {
//! let store = RawStore::open_dir("data", StoreOptions::default())?;
//! let mut txn = store.begin();
//! let key = txn.create_container(false)?;
//! let mut handle = txn.open_container(key)?;
//! let page = handle.add_page()?;
//! drop(page);
//! drop(handle);
//! txn.commit()?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

pub mod options;
pub mod primitives;
pub mod store;
pub mod types;

pub use options::{ConfigError, ReclaimOptions, StoreOptions, Synchronous};
pub use store::actions::{AllocationActions, InsertRequest, PageActions};
pub use store::container::{Container, CreateInfo};
pub use store::hooks::{CommitAction, XactEvent};
pub use store::metrics::{MetricsSnapshot, StoreMetrics};
pub use store::ops::{LogicalUndo, UndoRegistry};
pub use store::page::{Field, Page, PageLatch, StoredRecord};
pub use store::reclaim::{ReclaimKind, ReclaimRequest};
pub use store::recovery::RecoveryStats;
pub use store::xact::{ContainerHandle, Transaction, XactState};
pub use store::{CheckpointStats, RawStore};
pub use types::{ContainerKey, Lsn, PageKey, RecordId, Result, StoreError, TxnId};
