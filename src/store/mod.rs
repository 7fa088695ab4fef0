#![forbid(unsafe_code)]
//! The page and log store.
//!
//! [`RawStore`] ties the container registry, the write-ahead log, the logical
//! undo registry, and the reclamation queue together. Opening a store over
//! existing files runs recovery before the first transaction can begin.

use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use crate::options::StoreOptions;
use crate::primitives::io::{ContainerStorage, DirStorage, MemStorage};
use crate::primitives::wal::{LogFile, LogStats};
use crate::types::{ContainerKey, Lsn, Result, TxnId};

pub mod actions;
pub mod alloc;
pub mod container;
pub mod hooks;
pub mod log_record;
pub mod metrics;
pub mod ops;
pub mod page;
pub mod reclaim;
pub mod recovery;
pub mod xact;

use container::{Container, ContainerRegistry};
use log_record::LogRecord;
use metrics::StoreMetrics;
use ops::{LogicalUndo, OpContext, UndoRegistry};
use reclaim::{ReclaimRequest, Reclaimer};
use recovery::RecoveryStats;
use xact::Transaction;

pub(crate) struct StoreInner {
    pub(crate) options: StoreOptions,
    pub(crate) log: LogFile,
    pub(crate) registry: ContainerRegistry,
    pub(crate) undo: UndoRegistry,
    pub(crate) metrics: StoreMetrics,
    pub(crate) reclaimer: Reclaimer,
    next_txn: AtomicU64,
    pub(crate) backup_blockers: AtomicUsize,
    recovery: RecoveryStats,
}

impl StoreInner {
    pub(crate) fn ctx(&self) -> OpContext<'_> {
        OpContext {
            registry: &self.registry,
            undo: &self.undo,
        }
    }
}

/// Result of [`RawStore::checkpoint`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointStats {
    /// Containers visited.
    pub containers: u64,
    /// Page images written.
    pub pages_written: u64,
}

/// Handle to an open store. Cloning shares the same store.
#[derive(Clone)]
pub struct RawStore {
    pub(crate) inner: Arc<StoreInner>,
}

impl std::fmt::Debug for RawStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RawStore")
            .field("options", &self.inner.options)
            .field("end_lsn", &self.inner.log.end_lsn())
            .finish()
    }
}

impl RawStore {
    /// Opens a store whose files live in memory.
    pub fn open_in_memory(options: StoreOptions) -> Result<Self> {
        Self::open_with_storage(Arc::new(MemStorage::new()), options)
    }

    /// Opens (creating if needed) a store under the directory `path`.
    pub fn open_dir(path: impl AsRef<Path>, options: StoreOptions) -> Result<Self> {
        Self::open_with_storage(Arc::new(DirStorage::new(path.as_ref())?), options)
    }

    /// Opens a store over `storage`, running recovery on whatever the log holds.
    pub fn open_with_storage(storage: Arc<dyn ContainerStorage>, options: StoreOptions) -> Result<Self> {
        Self::open_with_undo(storage, options, UndoRegistry::default())
    }

    /// Like [`RawStore::open_with_storage`], with logical undo callbacks
    /// registered up front so recovery can roll back logical operations.
    pub fn open_with_undo(
        storage: Arc<dyn ContainerStorage>,
        options: StoreOptions,
        undo: UndoRegistry,
    ) -> Result<Self> {
        options.validate()?;
        let registry = ContainerRegistry::open(storage.clone())?;
        let log = LogFile::open(storage.open_log()?)?;
        let reclaimer = Reclaimer::new(options.reclaim.clone());
        let mut inner = StoreInner {
            options,
            log,
            registry,
            undo,
            metrics: StoreMetrics::default(),
            reclaimer,
            next_txn: AtomicU64::new(1),
            backup_blockers: AtomicUsize::new(0),
            recovery: RecoveryStats::default(),
        };
        let stats = recovery::recover(&inner)?;
        *inner.next_txn.get_mut() = stats.max_txn + 1;
        inner.recovery = stats;
        info!(
            end_lsn = %inner.log.end_lsn(),
            containers = inner.registry.all().len(),
            "store.open"
        );
        let store = Self {
            inner: Arc::new(inner),
        };
        // Reclaim requests are not logged; a committed drop still needs its remove.
        for container in store.inner.registry.all() {
            if container.is_dropped() && !container.is_removed() && !container.is_temporary() {
                store
                    .inner
                    .reclaimer
                    .enqueue(&store, ReclaimRequest::container(container.key()));
            }
        }
        Ok(store)
    }

    /// Options the store was opened with.
    pub fn options(&self) -> &StoreOptions {
        &self.inner.options
    }

    /// Starts a transaction.
    pub fn begin(&self) -> Transaction {
        let id = TxnId(self.inner.next_txn.fetch_add(1, Ordering::SeqCst));
        debug!(txn = %id, "xact.begin");
        Transaction::new(self.clone(), id)
    }

    /// Forces the log, then writes every dirty page and container header.
    pub fn checkpoint(&self) -> Result<CheckpointStats> {
        self.inner.log.flush_all(true)?;
        let mut stats = CheckpointStats::default();
        for container in self.inner.registry.all() {
            stats.containers += 1;
            stats.pages_written += container.flush(&self.inner.log)?.pages_written;
        }
        info!(
            containers = stats.containers,
            pages = stats.pages_written,
            "store.checkpoint"
        );
        Ok(stats)
    }

    /// Writes buffered log records to the file.
    pub fn flush_log(&self, sync: bool) -> Result<()> {
        self.inner.log.flush_all(sync)
    }

    /// Registers a logical undo callback under `id`.
    pub fn register_logical_undo(&self, id: u32, callback: Arc<dyn LogicalUndo>) {
        self.inner.undo.register(id, callback);
    }

    /// Open container for `key`, for read-only inspection.
    pub fn container(&self, key: ContainerKey) -> Option<Arc<Container>> {
        self.inner.registry.find(key)
    }

    /// Keys of every open container.
    pub fn container_keys(&self) -> Vec<ContainerKey> {
        self.inner.registry.all().iter().map(|c| c.key()).collect()
    }

    /// Serves every queued reclamation request once on the calling thread.
    /// Returns how many completed.
    pub fn run_pending_reclaims(&self) -> usize {
        self.inner.reclaimer.run_pending(self)
    }

    /// Requests still waiting in the reclamation queue.
    pub fn pending_reclaims(&self) -> usize {
        self.inner.reclaimer.pending()
    }

    /// True while any transaction blocks backups.
    pub fn backup_blocked(&self) -> bool {
        self.inner.backup_blockers.load(Ordering::SeqCst) > 0
    }

    /// Store-wide counters.
    pub fn metrics(&self) -> &StoreMetrics {
        &self.inner.metrics
    }

    /// Log counters since open.
    pub fn log_stats(&self) -> LogStats {
        self.inner.log.stats()
    }

    /// What recovery did when the store was opened.
    pub fn last_recovery(&self) -> RecoveryStats {
        self.inner.recovery
    }

    /// Every record in the log, decoded, in log order.
    pub fn log_records(&self) -> Result<Vec<(Lsn, LogRecord)>> {
        let mut scan = self.inner.log.scan();
        let mut records = Vec::new();
        while let Some((lsn, payload)) = scan.next_record()? {
            records.push((lsn, LogRecord::decode(&payload)?));
        }
        Ok(records)
    }
}
