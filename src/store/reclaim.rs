#![forbid(unsafe_code)]
//! Deferred space reclamation.
//!
//! Committed transactions leave behind space nobody can use yet: dropped
//! container files, overflow pages whose records are all deleted, reserved
//! row space, and long-column chains. A [`ReclaimRequest`] names one such
//! piece of work. Requests live only in memory; losing them in a crash only
//! leaves space unreclaimed.
//!
//! A request that finds a latch held is put back and retried until it runs
//! out of attempts. No failure here ever reaches a user transaction.

use std::collections::VecDeque;
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::options::ReclaimOptions;
use crate::store::metrics::StoreMetrics;
use crate::store::ops::{ContainerAction, ContainerOp, Operation, Target};
use crate::store::page::Field;
use crate::store::{RawStore, StoreInner};
use crate::types::{ContainerKey, RecordId, Result, StoreError};

/// What a request reclaims.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReclaimKind {
    /// Remove the file of a dropped container.
    Container,
    /// Deallocate an overflow page whose records are all deleted.
    Page {
        /// Page to check.
        page: u64,
    },
    /// Give the reserved space of a record back to its page.
    RowReserve {
        /// Page holding the record.
        page: u64,
        /// The record.
        record: RecordId,
    },
    /// Deallocate every page of a long-column chain.
    ColumnChain {
        /// Page of the chain's first portion.
        page: u64,
        /// Record holding that portion.
        record: RecordId,
    },
}

/// One unit of deferred reclamation work.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ReclaimRequest {
    /// Container the work belongs to.
    pub container: ContainerKey,
    /// What to reclaim.
    pub kind: ReclaimKind,
    /// Times the request found its target busy.
    pub attempts: u32,
    /// Try on the committing thread before handing it to the worker.
    pub service_asap: bool,
}

impl ReclaimRequest {
    fn new(container: ContainerKey, kind: ReclaimKind) -> Self {
        Self {
            container,
            kind,
            attempts: 0,
            service_asap: false,
        }
    }

    /// Removes a committed-dropped container.
    pub fn container(container: ContainerKey) -> Self {
        Self::new(container, ReclaimKind::Container)
    }

    /// Frees `page` once all its records are deleted.
    pub fn page(container: ContainerKey, page: u64) -> Self {
        Self::new(container, ReclaimKind::Page { page })
    }

    /// Gives back the reserved space of `record` on `page`.
    pub fn row_reserve(container: ContainerKey, page: u64, record: RecordId) -> Self {
        Self::new(container, ReclaimKind::RowReserve { page, record })
    }

    /// Frees the chain a long column points at.
    pub fn column_chain(container: ContainerKey, page: u64, record: RecordId) -> Self {
        Self::new(container, ReclaimKind::ColumnChain { page, record })
    }

    /// Serve on the committing thread first.
    pub fn asap(mut self) -> Self {
        self.service_asap = true;
        self
    }
}

#[derive(Default)]
struct ReclaimState {
    queue: VecDeque<ReclaimRequest>,
    worker_running: bool,
}

/// Queue and wakeup shared with the worker, which must not keep the store
/// alive while it waits.
#[derive(Default)]
struct ReclaimQueue {
    state: Mutex<ReclaimState>,
    wakeup: Condvar,
}

/// Queue of reclamation requests and its optional worker thread.
pub struct Reclaimer {
    queue: Arc<ReclaimQueue>,
    options: ReclaimOptions,
}

enum Served {
    Done,
    Requeued,
    Dropped,
}

impl Reclaimer {
    pub(crate) fn new(options: ReclaimOptions) -> Self {
        Self {
            queue: Arc::new(ReclaimQueue::default()),
            options,
        }
    }

    /// Requests waiting to be served.
    pub fn pending(&self) -> usize {
        self.queue.state.lock().queue.len()
    }

    /// Queues `request`, starting the worker if background reclamation is on
    /// and no worker is running.
    pub(crate) fn enqueue(&self, store: &RawStore, request: ReclaimRequest) {
        let mut state = self.queue.state.lock();
        state.queue.push_back(request);
        debug!(
            container = %request.container,
            kind = ?request.kind,
            pending = state.queue.len(),
            worker_running = state.worker_running,
            "reclaim.enqueue"
        );
        if !self.options.background {
            return;
        }
        if state.worker_running {
            self.queue.wakeup.notify_one();
        } else {
            state.worker_running = true;
            let queue = self.queue.clone();
            let idle_wait = self.options.idle_wait();
            let store = Arc::downgrade(&store.inner);
            thread::spawn(move || Self::worker_loop(&queue, &store, idle_wait));
        }
    }

    /// Serves `request` on the calling thread, queueing it if it is busy.
    pub(crate) fn serve_now(&self, store: &RawStore, request: ReclaimRequest) {
        self.process(store, request);
    }

    /// Serves each request queued at the time of the call once.
    pub(crate) fn run_pending(&self, store: &RawStore) -> usize {
        let batch: Vec<_> = self.queue.state.lock().queue.drain(..).collect();
        batch
            .into_iter()
            .filter(|request| matches!(self.process(store, *request), Served::Done))
            .count()
    }

    fn process(&self, store: &RawStore, mut request: ReclaimRequest) -> Served {
        let metrics = &store.inner.metrics;
        match serve(store, &request) {
            Ok(()) => {
                StoreMetrics::bump(&metrics.reclaims_done);
                debug!(container = %request.container, kind = ?request.kind, "reclaim.done");
                Served::Done
            }
            Err(StoreError::Busy) => {
                request.attempts += 1;
                if request.attempts >= self.options.max_attempts {
                    StoreMetrics::bump(&metrics.reclaims_dropped);
                    warn!(
                        container = %request.container,
                        kind = ?request.kind,
                        attempts = request.attempts,
                        "reclaim.dropped"
                    );
                    return Served::Dropped;
                }
                StoreMetrics::bump(&metrics.reclaims_requeued);
                debug!(
                    container = %request.container,
                    kind = ?request.kind,
                    attempts = request.attempts,
                    "reclaim.requeue"
                );
                self.enqueue(store, request);
                Served::Requeued
            }
            Err(err) => {
                StoreMetrics::bump(&metrics.reclaims_dropped);
                warn!(
                    container = %request.container,
                    kind = ?request.kind,
                    error = %err,
                    "reclaim.failed"
                );
                Served::Dropped
            }
        }
    }

    fn worker_loop(queue: &ReclaimQueue, store: &Weak<StoreInner>, idle_wait: Duration) {
        loop {
            let request = {
                let mut state = queue.state.lock();
                if state.queue.is_empty() {
                    queue.wakeup.wait_for(&mut state, idle_wait);
                }
                match state.queue.pop_front() {
                    Some(request) => request,
                    None => {
                        state.worker_running = false;
                        debug!("reclaim.worker_exit");
                        break;
                    }
                }
            };
            let Some(inner) = store.upgrade() else {
                queue.state.lock().worker_running = false;
                debug!("reclaim.worker_exit.store_closed");
                break;
            };
            let store = RawStore { inner };
            let requeued = matches!(store.inner.reclaimer.process(&store, request), Served::Requeued);
            drop(store);
            if requeued {
                thread::sleep(idle_wait);
            }
        }
    }
}

/// Carries out one request in its own transaction.
fn serve(store: &RawStore, request: &ReclaimRequest) -> Result<()> {
    let inner = &store.inner;
    let Some(container) = inner.registry.find(request.container) else {
        return Ok(());
    };
    match request.kind {
        ReclaimKind::Container => {
            if !container.is_dropped() && !container.is_temporary() {
                // The drop was rolled back.
                return Ok(());
            }
            if container.is_temporary() {
                return inner.registry.remove(request.container);
            }
            let mut txn = store.begin();
            let op = Operation::Container(ContainerOp {
                key: request.container,
                container_version: container.version(),
                action: ContainerAction::Remove,
                create_info: None,
            });
            txn.log_buffer().clear();
            txn.log_and_do(
                &op,
                Target::Container {
                    container: Some(&container),
                    registry: &inner.registry,
                },
            )?;
            txn.commit()
        }
        _ if container.is_dropped() => Ok(()),
        // Begin before latching: on error the latch drops before the rollback.
        ReclaimKind::Page { page } => {
            let mut txn = store.begin();
            let latch = container.try_latch_page(page)?;
            if !latch.is_valid() || !latch.is_overflow() || !latch.all_deleted() {
                return Ok(());
            }
            txn.open_container(request.container)?.remove_page(latch)?;
            txn.commit()
        }
        ReclaimKind::RowReserve { page, record } => {
            let mut txn = store.begin();
            let mut latch = container.try_latch_page(page)?;
            let Some(slot) = latch.find_record_by_id(record) else {
                return Ok(());
            };
            if latch.record_at(slot)?.reserved == 0 {
                return Ok(());
            }
            let mut handle = txn.open_container(request.container)?;
            let actions = handle.page_actions();
            let (txn_ref, container_ref) = handle.parts();
            actions.action_shrink_reserved_space(txn_ref, &mut latch, container_ref, slot, 0)?;
            drop(handle);
            drop(latch);
            txn.commit()
        }
        ReclaimKind::ColumnChain { page, record } => {
            let mut txn = store.begin();
            let mut handle = txn.open_container(request.container)?;
            let mut next = Field::Long { page, record };
            while let Field::Long { page, record } = next {
                let latch = container.try_latch_page(page)?;
                let Some(slot) = latch.find_record_by_id(record) else {
                    break;
                };
                next = latch
                    .record_at(slot)?
                    .fields
                    .get(1)
                    .cloned()
                    .unwrap_or(Field::Null);
                handle.remove_page(latch)?;
            }
            drop(handle);
            txn.commit()
        }
    }
}
