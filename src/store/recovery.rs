#![forbid(unsafe_code)]
//! Restart recovery.
//!
//! Recovery runs in two passes over the log. Redo replays every operation
//! and compensation record from the start of the log; the version gate in
//! each operation's `needs_redo` skips changes the files already hold.
//! Undo then rolls back every transaction without an end record, newest
//! record first across all of them, writing compensation records exactly
//! as a live rollback does. A rollback cut short by an earlier crash picks
//! up at the `undo_next` of its last compensation record.

use std::collections::BTreeMap;

use serde::Serialize;
use tracing::{debug, info, trace};

use crate::store::log_record::{encode_end, LogBody, LogRecord};
use crate::store::metrics::StoreMetrics;
use crate::store::ops::{Loggable, Operation};
use crate::store::xact::undo_record;
use crate::store::StoreInner;
use crate::types::{Lsn, Result, StoreError, TxnId};

/// What recovery did.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryStats {
    /// Log records read.
    pub records_scanned: u64,
    /// Records re-applied to pages or containers.
    pub redo_applied: u64,
    /// Records the version gate found already applied.
    pub redo_skipped: u64,
    /// Transactions rolled back because they had not ended.
    pub losers_rolled_back: u64,
    /// Compensation records written while rolling back.
    pub clrs_written: u64,
    /// Highest transaction id in the log.
    pub max_txn: u64,
}

#[derive(Debug, Default)]
struct TxnEntry {
    /// Chain tail; compensation records written here link to it.
    last: Option<Lsn>,
    /// Next record to undo.
    undo_next: Option<Lsn>,
    ended: bool,
}

/// Redoes the log, then rolls back unfinished transactions.
pub(crate) fn recover(inner: &StoreInner) -> Result<RecoveryStats> {
    let mut stats = RecoveryStats::default();
    let mut txns: BTreeMap<TxnId, TxnEntry> = BTreeMap::new();

    let mut scan = inner.log.scan();
    while let Some((lsn, payload)) = scan.next_record()? {
        let record = LogRecord::decode(&payload)?;
        stats.records_scanned += 1;
        stats.max_txn = stats.max_txn.max(record.txn.0);
        let entry = txns.entry(record.txn).or_default();
        entry.last = Some(lsn);
        match record.body {
            LogBody::Begin => entry.undo_next = None,
            LogBody::End { .. } => entry.ended = true,
            LogBody::Op { op, data } => {
                entry.undo_next = Some(lsn);
                redo(inner, &mut stats, lsn, &op, &data)?;
            }
            LogBody::Clr {
                mut op,
                undone,
                undo_next,
            } => {
                entry.undo_next = undo_next;
                let LogBody::Op { op: original, data } = LogRecord::decode(&inner.log.read(undone)?)?.body
                else {
                    return Err(StoreError::consistency(format!(
                        "compensation record {lsn} undoes {undone}, which is not an operation"
                    )));
                };
                op.attach_undo_op(original)?;
                redo(inner, &mut stats, lsn, &op, &data)?;
            }
        }
    }
    info!(
        records = stats.records_scanned,
        applied = stats.redo_applied,
        skipped = stats.redo_skipped,
        "recovery.redo.done"
    );

    let mut losers: Vec<(TxnId, TxnEntry)> = txns.into_iter().filter(|(_, entry)| !entry.ended).collect();
    stats.losers_rolled_back = losers.len() as u64;
    // Always undo the newest outstanding record of any loser next.
    while let Some(pos) = losers
        .iter()
        .enumerate()
        .filter_map(|(i, (_, entry))| entry.undo_next.map(|lsn| (lsn, i)))
        .max()
        .map(|(_, i)| i)
    {
        let (txn, entry) = &mut losers[pos];
        let Some(lsn) = entry.undo_next else {
            continue;
        };
        let record = LogRecord::decode(&inner.log.read(lsn)?)?;
        entry.undo_next = match record.body {
            LogBody::Begin => None,
            LogBody::Clr { undo_next, .. } => undo_next,
            LogBody::End { .. } => {
                return Err(StoreError::consistency(format!(
                    "end record {lsn} on the chain of unfinished {txn}"
                )))
            }
            LogBody::Op { op, data } => {
                if undo_record(inner, *txn, &mut entry.last, lsn, &op, &data, record.prev)? {
                    stats.clrs_written += 1;
                }
                record.prev
            }
        };
    }
    for (txn, entry) in &losers {
        inner.log.append(&encode_end(*txn, entry.last, true))?;
        debug!(%txn, "recovery.undo.txn_done");
    }
    if !losers.is_empty() {
        inner.log.flush_all(true)?;
    }
    info!(
        losers = stats.losers_rolled_back,
        clrs = stats.clrs_written,
        "recovery.done"
    );
    Ok(stats)
}

fn redo(inner: &StoreInner, stats: &mut RecoveryStats, lsn: Lsn, op: &Operation, data: &[u8]) -> Result<()> {
    let mut resolved = op.resolve(&inner.ctx())?;
    let result = match op.needs_redo(&resolved) {
        Ok(true) => match resolved.target(&inner.registry) {
            Ok(target) => op.do_me(target, Some(lsn), data).map(|()| true),
            Err(err) => Err(err),
        },
        Ok(false) => Ok(false),
        Err(err) => Err(err),
    };
    op.release_resource(&mut resolved);
    if result? {
        stats.redo_applied += 1;
        StoreMetrics::bump(&inner.metrics.redo_applied);
        trace!(op = op.name(), %lsn, "recovery.redo");
    } else {
        stats.redo_skipped += 1;
        StoreMetrics::bump(&inner.metrics.redo_skipped);
    }
    Ok(())
}
