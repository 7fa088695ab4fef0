#![forbid(unsafe_code)]
//! Counters for the log, rollback, recovery, and reclamation paths.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

use crate::types::Result;

/// Thread-safe counters. Every counter only grows.
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Operations appended through log-and-do.
    pub ops_logged: AtomicU64,
    /// Operations applied without logging.
    pub ops_direct: AtomicU64,
    /// Compensation records written.
    pub clrs_written: AtomicU64,
    /// Transactions committed.
    pub commits: AtomicU64,
    /// Transactions rolled back.
    pub aborts: AtomicU64,
    /// Records re-applied during recovery.
    pub redo_applied: AtomicU64,
    /// Records recovery found already applied.
    pub redo_skipped: AtomicU64,
    /// Reclamation requests completed.
    pub reclaims_done: AtomicU64,
    /// Reclamation requests put back because a latch was busy.
    pub reclaims_requeued: AtomicU64,
    /// Reclamation requests given up on.
    pub reclaims_dropped: AtomicU64,
}

impl StoreMetrics {
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            ops_logged: load(&self.ops_logged),
            ops_direct: load(&self.ops_direct),
            clrs_written: load(&self.clrs_written),
            commits: load(&self.commits),
            aborts: load(&self.aborts),
            redo_applied: load(&self.redo_applied),
            redo_skipped: load(&self.redo_skipped),
            reclaims_done: load(&self.reclaims_done),
            reclaims_requeued: load(&self.reclaims_requeued),
            reclaims_dropped: load(&self.reclaims_dropped),
        }
    }
}

/// Plain copy of [`StoreMetrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[allow(missing_docs)]
pub struct MetricsSnapshot {
    pub ops_logged: u64,
    pub ops_direct: u64,
    pub clrs_written: u64,
    pub commits: u64,
    pub aborts: u64,
    pub redo_applied: u64,
    pub redo_skipped: u64,
    pub reclaims_done: u64,
    pub reclaims_requeued: u64,
    pub reclaims_dropped: u64,
}

impl MetricsSnapshot {
    /// JSON rendering for diagnostics output.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|err| crate::types::StoreError::consistency(format!("metrics encoding: {err}")))
    }
}
