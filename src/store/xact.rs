#![forbid(unsafe_code)]
//! Transactions.
//!
//! A transaction owns its chain of log records, its savepoints, its commit
//! hooks, and the reclamation work it queues for after commit. Every logged
//! change goes through [`Transaction::log_and_do`]: the record is appended
//! first and only then applied, so the log always covers the page.
//!
//! Rollback walks the chain backwards from the last record. Each undone
//! operation produces exactly one compensation record whose `undo_next`
//! skips past it, so a rollback interrupted by a crash resumes where it left
//! off and never undoes anything twice.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::options::Synchronous;
use crate::primitives::bytes::ByteHolder;
use crate::store::actions::{alloc_actions_for, page_actions_for, AllocationActions, InsertRequest, PageActions};
use crate::store::alloc::AllocStatus;
use crate::store::container::{Container, CreateInfo, FIRST_ALLOC_PAGE};
use crate::store::hooks::{CommitAction, CommitHook, HookList, XactEvent};
use crate::store::log_record::{encode_begin, encode_clr, encode_end, encode_op, LogBody, LogRecord};
use crate::store::metrics::StoreMetrics;
use crate::store::ops::{
    ContainerAction, ContainerOp, Group, Loggable, Operation, PendingUndo, Resolved, Target,
};
use crate::store::page::{Field, Page, PageFormat, PageLatch, RowLogOutcome};
use crate::store::reclaim::ReclaimRequest;
use crate::store::{RawStore, StoreInner};
use crate::types::page::PageKind;
use crate::types::{ContainerKey, Lsn, PageKey, RecordId, Result, StoreError, TxnId};

/// Room a long-column chunk leaves for its value header and chain pointer.
const LONG_CHUNK_OVERHEAD: usize = 32;

/// Where a transaction is in its lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XactState {
    /// Still accepting work.
    Active,
    /// Ended by a commit.
    Committed,
    /// Ended by a rollback.
    Aborted,
}

#[derive(Debug)]
struct Savepoint {
    name: String,
    /// Last record logged before the savepoint was set.
    lsn: Option<Lsn>,
}

/// A unit of work against the store.
///
/// Dropping an active transaction rolls it back.
pub struct Transaction {
    store: RawStore,
    id: TxnId,
    state: XactState,
    first_lsn: Option<Lsn>,
    last_lsn: Option<Lsn>,
    savepoints: Vec<Savepoint>,
    hooks: HookList,
    post_commit: Vec<ReclaimRequest>,
    log_buffer: ByteHolder,
    backup_blocked: bool,
    pending_frees: Vec<PageKey>,
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("last_lsn", &self.last_lsn)
            .finish()
    }
}

impl Transaction {
    pub(crate) fn new(store: RawStore, id: TxnId) -> Self {
        Self {
            store,
            id,
            state: XactState::Active,
            first_lsn: None,
            last_lsn: None,
            savepoints: Vec::new(),
            hooks: HookList::default(),
            post_commit: Vec::new(),
            log_buffer: ByteHolder::new(),
            backup_blocked: false,
            pending_frees: Vec::new(),
        }
    }

    /// Id of this transaction.
    pub fn id(&self) -> TxnId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> XactState {
        self.state
    }

    /// LSN of the transaction's most recent record.
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_lsn
    }

    /// The store this transaction runs against.
    pub fn store(&self) -> &RawStore {
        &self.store
    }

    /// Scratch buffer holding the optional data of the next logged change.
    pub fn log_buffer(&mut self) -> &mut ByteHolder {
        &mut self.log_buffer
    }

    pub(crate) fn take_log_buffer(&mut self) -> ByteHolder {
        std::mem::take(&mut self.log_buffer)
    }

    pub(crate) fn restore_log_buffer(&mut self, mut buffer: ByteHolder) {
        buffer.clear();
        self.log_buffer = buffer;
    }

    /// Store-wide counters.
    pub fn metrics(&self) -> &StoreMetrics {
        &self.store.inner.metrics
    }

    /// Registered hooks that have not fired yet.
    pub fn pending_hooks(&self) -> usize {
        self.hooks.len()
    }

    fn inner(&self) -> Arc<StoreInner> {
        self.store.inner.clone()
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state {
            XactState::Active => Ok(()),
            _ => Err(StoreError::Transaction("transaction is no longer active")),
        }
    }

    fn ensure_begun(&mut self) -> Result<()> {
        if self.first_lsn.is_none() {
            let lsn = self.store.inner.log.append(&encode_begin(self.id))?;
            self.first_lsn = Some(lsn);
            self.last_lsn = Some(lsn);
        }
        Ok(())
    }

    /// Appends `op` with the optional data in the log buffer, then applies it
    /// to `target`. Returns the LSN of the new record.
    ///
    /// The caller holds the latch on a page target and has marked it
    /// pre-dirty. Compensation records are refused: they are only written by
    /// rollback.
    pub fn log_and_do(&mut self, op: &Operation, target: Target<'_>) -> Result<Lsn> {
        self.ensure_active()?;
        if op.group().contains(Group::COMPENSATION) {
            return Err(StoreError::consistency(format!(
                "{} is a compensation record and cannot be logged directly",
                op.name()
            )));
        }
        self.ensure_begun()?;
        let data = self.take_log_buffer();
        let result = self.append_and_apply(op, target, data.as_slice());
        self.restore_log_buffer(data);
        let lsn = result?;
        StoreMetrics::bump(&self.store.inner.metrics.ops_logged);
        trace!(txn = %self.id, op = op.name(), %lsn, "xact.log_and_do");
        Ok(lsn)
    }

    fn append_and_apply(&mut self, op: &Operation, target: Target<'_>, data: &[u8]) -> Result<Lsn> {
        let payload = encode_op(self.id, self.last_lsn, op, data);
        let lsn = self.store.inner.log.append(&payload)?;
        self.last_lsn = Some(lsn);
        // Actions check every precondition before this point; a failure here
        // leaves a record in the log that redo cannot apply either.
        if let Err(err) = op.do_me(target, Some(lsn), data) {
            error!(txn = %self.id, op = op.name(), %lsn, error = %err, "xact.apply_after_log_failed");
            return Err(err);
        }
        Ok(lsn)
    }

    /// Undoes every record after `stop`, or all of them.
    fn undo_to(&mut self, stop: Option<Lsn>) -> Result<()> {
        let inner = self.inner();
        let mut next = self.last_lsn;
        while let Some(lsn) = next {
            if stop.map_or(false, |stop| lsn <= stop) {
                break;
            }
            let record = LogRecord::decode(&inner.log.read(lsn)?)?;
            if record.txn != self.id {
                return Err(StoreError::consistency(format!(
                    "record {lsn} on the chain of {} belongs to {}",
                    self.id, record.txn
                )));
            }
            next = match record.body {
                LogBody::Begin => None,
                LogBody::End { .. } => {
                    return Err(StoreError::consistency(format!(
                        "end record {lsn} inside active transaction {}",
                        self.id
                    )))
                }
                LogBody::Clr { undo_next, .. } => undo_next,
                LogBody::Op { op, data } => {
                    undo_record(&inner, self.id, &mut self.last_lsn, lsn, &op, &data, record.prev)?;
                    record.prev
                }
            };
        }
        Ok(())
    }

    /// Commits. Hooks run first, then pages this transaction released
    /// become free, then the end record is written and forced according to
    /// the store's [`Synchronous`] mode. Reclamation work queued by the
    /// transaction runs last.
    pub fn commit(mut self) -> Result<()> {
        self.ensure_active()?;
        // Hooks run inside the transaction: a drop-on-commit logs its Drop
        // ahead of the end record, so the drop commits or recovery undoes it.
        self.fire_hooks(XactEvent::Commit)?;
        self.free_released_pages()?;
        let inner = self.inner();
        if self.first_lsn.is_some() {
            let end = inner.log.append(&encode_end(self.id, self.last_lsn, false))?;
            self.last_lsn = Some(end);
            match inner.options.synchronous {
                Synchronous::Full => inner.log.flush_to(end, true)?,
                Synchronous::Normal => inner.log.flush_to(end, false)?,
                Synchronous::Off => {}
            }
        }
        self.state = XactState::Committed;
        self.release_backup_block();
        StoreMetrics::bump(&inner.metrics.commits);
        debug!(txn = %self.id, lsn = ?self.last_lsn, "xact.commit");

        for request in std::mem::take(&mut self.post_commit) {
            if request.service_asap {
                inner.reclaimer.serve_now(&self.store, request);
            } else {
                inner.reclaimer.enqueue(&self.store, request);
            }
        }
        Ok(())
    }

    /// Rolls back every change and ends the transaction.
    pub fn abort(mut self) -> Result<()> {
        self.ensure_active()?;
        self.rollback()
    }

    fn rollback(&mut self) -> Result<()> {
        let hooks = self.fire_hooks(XactEvent::Abort);
        self.undo_to(None)?;
        let inner = self.inner();
        if self.first_lsn.is_some() {
            let end = inner.log.append(&encode_end(self.id, self.last_lsn, true))?;
            self.last_lsn = Some(end);
            if inner.options.synchronous != Synchronous::Off {
                inner.log.flush_to(end, false)?;
            }
        }
        self.state = XactState::Aborted;
        self.post_commit.clear();
        self.pending_frees.clear();
        self.hooks.clear();
        self.savepoints.clear();
        self.release_backup_block();
        StoreMetrics::bump(&inner.metrics.aborts);
        debug!(txn = %self.id, "xact.abort");
        hooks
    }

    /// Marks a point that [`Transaction::rollback_to_savepoint`] can return to.
    pub fn set_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_active()?;
        if self.savepoints.iter().any(|sp| sp.name == name) {
            return Err(StoreError::Invalid("savepoint already exists"));
        }
        self.savepoints.push(Savepoint {
            name: name.to_owned(),
            lsn: self.last_lsn,
        });
        Ok(())
    }

    fn savepoint_position(&self, name: &str) -> Result<usize> {
        self.savepoints
            .iter()
            .position(|sp| sp.name == name)
            .ok_or(StoreError::Invalid("no such savepoint"))
    }

    /// Undoes everything logged after the savepoint `name`, which stays set.
    /// Savepoints set after it are discarded.
    pub fn rollback_to_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_active()?;
        let pos = self.savepoint_position(name)?;
        let stop = self.savepoints[pos].lsn;
        self.undo_to(stop)?;
        self.savepoints.truncate(pos + 1);
        debug!(txn = %self.id, savepoint = name, "xact.savepoint.rollback");
        self.fire_hooks(XactEvent::SavepointRollback)
    }

    /// Forgets the savepoint `name` and every later one.
    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.ensure_active()?;
        let pos = self.savepoint_position(name)?;
        self.savepoints.truncate(pos);
        Ok(())
    }

    fn fire_hooks(&mut self, event: XactEvent) -> Result<()> {
        let fired = self.hooks.take_triggered(event);
        let mut first_err = None;
        for hook in fired {
            let temporary = self
                .store
                .inner
                .registry
                .find(hook.container)
                .map_or(false, |c| c.is_temporary());
            if !hook.has_work(event, temporary) {
                trace!(txn = %self.id, container = %hook.container, "xact.hook.deregistered");
                continue;
            }
            if let Err(err) = self.run_hook(hook, event) {
                warn!(
                    txn = %self.id,
                    container = %hook.container,
                    event = ?event,
                    error = %err,
                    "xact.hook.failed"
                );
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn run_hook(&mut self, hook: CommitHook, event: XactEvent) -> Result<()> {
        let inner = self.inner();
        debug!(txn = %self.id, container = %hook.container, action = ?hook.action, "xact.hook.fire");
        match hook.action {
            CommitAction::DropOnCommit if event == XactEvent::Commit => self.drop_container(hook.container),
            CommitAction::DropOnCommit => inner.registry.remove(hook.container),
            CommitAction::SyncOnCommit => {
                if let Some(container) = inner.registry.find(hook.container) {
                    container.flush(&inner.log)?;
                }
                Ok(())
            }
            CommitAction::TruncateOnCommit { .. } => match inner.registry.find(hook.container) {
                Some(container) => container.truncate_unlogged(),
                None => Ok(()),
            },
        }
    }

    fn register_hook(&mut self, container: ContainerKey, action: CommitAction) -> Result<()> {
        self.ensure_active()?;
        self.store.inner.registry.get(container)?;
        self.hooks.register(CommitHook { container, action });
        Ok(())
    }

    /// Drops `container` when this transaction commits.
    pub fn drop_on_commit(&mut self, container: ContainerKey) -> Result<()> {
        self.register_hook(container, CommitAction::DropOnCommit)
    }

    /// Writes the dirty pages of `container` when this transaction commits.
    pub fn sync_on_commit(&mut self, container: ContainerKey) -> Result<()> {
        self.register_hook(container, CommitAction::SyncOnCommit)
    }

    /// Empties the temporary `container` on abort or savepoint rollback, and
    /// on commit too when `commit_as_well` is set.
    pub fn truncate_on_commit(&mut self, container: ContainerKey, commit_as_well: bool) -> Result<()> {
        if !self.store.inner.registry.get(container)?.is_temporary() {
            return Err(StoreError::Invalid("truncate on commit needs a temporary container"));
        }
        self.register_hook(container, CommitAction::TruncateOnCommit { commit_as_well })
    }

    /// Queues `request` to run after this transaction commits. Discarded on
    /// abort.
    pub fn queue_reclaim(&mut self, request: ReclaimRequest) -> Result<()> {
        self.ensure_active()?;
        self.post_commit.push(request);
        Ok(())
    }

    /// Holds off backups until this transaction ends.
    pub fn block_backup(&mut self) -> Result<()> {
        self.ensure_active()?;
        if !self.backup_blocked {
            self.store.inner.backup_blockers.fetch_add(1, Ordering::SeqCst);
            self.backup_blocked = true;
        }
        Ok(())
    }

    fn release_backup_block(&mut self) {
        if self.backup_blocked {
            self.store.inner.backup_blockers.fetch_sub(1, Ordering::SeqCst);
            self.backup_blocked = false;
        }
    }

    /// Creates a container. Temporary containers are never logged and
    /// vanish with the store.
    pub fn create_container(&mut self, temporary: bool) -> Result<ContainerKey> {
        self.ensure_active()?;
        let inner = self.inner();
        let options = &inner.options;
        let info = CreateInfo {
            page_size: options.page_size,
            alloc_extent_pages: options.alloc_extent_pages,
            overflow_threshold: options.overflow_threshold,
            temporary,
        };
        let key = inner.registry.allocate_key(temporary);
        if temporary {
            inner.registry.create_at(key, info)?;
        } else {
            let op = Operation::Container(ContainerOp {
                key,
                container_version: 0,
                action: ContainerAction::Create,
                create_info: Some(info),
            });
            self.log_buffer.clear();
            self.log_and_do(
                &op,
                Target::Container {
                    container: None,
                    registry: &inner.registry,
                },
            )?;
        }
        debug!(txn = %self.id, container = %key, temporary, "xact.container.create");
        Ok(key)
    }

    /// Drops `container`. The file is removed by a reclamation request after
    /// commit; until then the drop can be rolled back.
    pub fn drop_container(&mut self, key: ContainerKey) -> Result<()> {
        self.ensure_active()?;
        let inner = self.inner();
        let container = inner.registry.get(key)?;
        if container.is_dropped() {
            return Err(StoreError::ContainerNotFound(key));
        }
        self.fire_hooks(XactEvent::ContainerDropped(key))?;
        if container.is_temporary() {
            return inner.registry.remove(key);
        }
        let op = Operation::Container(ContainerOp {
            key,
            container_version: container.version(),
            action: ContainerAction::Drop,
            create_info: None,
        });
        self.log_buffer.clear();
        self.log_and_do(
            &op,
            Target::Container {
                container: Some(&container),
                registry: &inner.registry,
            },
        )?;
        self.post_commit.push(ReclaimRequest::container(key));
        debug!(txn = %self.id, container = %key, "xact.container.drop");
        Ok(())
    }

    /// Opens `key` for page-level work within this transaction.
    pub fn open_container(&mut self, key: ContainerKey) -> Result<ContainerHandle<'_>> {
        self.ensure_active()?;
        let container = self.store.inner.registry.get(key)?;
        if container.is_dropped() {
            return Err(StoreError::ContainerNotFound(key));
        }
        Ok(ContainerHandle {
            txn: self,
            container,
        })
    }

    /// Turns pages this transaction deallocated into free pages. Runs at
    /// commit, when the deallocation can no longer be rolled back.
    fn free_released_pages(&mut self) -> Result<()> {
        let inner = self.inner();
        for key in std::mem::take(&mut self.pending_frees) {
            let Some(container) = inner.registry.find(key.container) else {
                continue;
            };
            let mut alloc = latch_alloc_for(&container, key.page_number)?;
            if alloc.extent()?.status(key.page_number)? != AllocStatus::Deallocated {
                continue;
            }
            alloc_actions_for(&container).action_allocate_page(
                self,
                &mut alloc,
                &container,
                key.page_number,
                AllocStatus::Free,
                AllocStatus::Deallocated,
            )?;
        }
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state != XactState::Active {
            return;
        }
        if let Err(err) = self.rollback() {
            warn!(txn = %self.id, error = %err, "xact.drop.rollback_failed");
        }
        self.release_backup_block();
    }
}

/// Rolls back one operation record: latches its undo target, logs the
/// compensation record, applies it, and lets go of the target.
///
/// `last` is the transaction's chain tail and moves to the new record.
/// Returns false when the operation has nothing to undo.
pub(crate) fn undo_record(
    inner: &StoreInner,
    txn: TxnId,
    last: &mut Option<Lsn>,
    undone: Lsn,
    op: &Operation,
    data: &[u8],
    undo_next: Option<Lsn>,
) -> Result<bool> {
    let undoable = op.as_undoable().ok_or_else(|| {
        StoreError::consistency(format!("compensation record {undone} reached through an undo chain"))
    })?;
    let Some(PendingUndo { clr, mut resolved }) = undoable.generate_undo(&inner.ctx(), data)? else {
        debug!(%txn, op = op.name(), lsn = %undone, "xact.undo.skip");
        return Ok(false);
    };
    let result = log_compensation(inner, txn, last, &clr, &mut resolved, undone, undo_next, data);
    clr.release_resource(&mut resolved);
    result?;
    StoreMetrics::bump(&inner.metrics.clrs_written);
    trace!(%txn, op = op.name(), lsn = %undone, "xact.undo");
    Ok(true)
}

#[allow(clippy::too_many_arguments)]
fn log_compensation(
    inner: &StoreInner,
    txn: TxnId,
    last: &mut Option<Lsn>,
    clr: &Operation,
    resolved: &mut Resolved,
    undone: Lsn,
    undo_next: Option<Lsn>,
    data: &[u8],
) -> Result<()> {
    let lsn = inner
        .log
        .append(&encode_clr(txn, *last, clr, undone, undo_next))?;
    *last = Some(lsn);
    clr.do_me(resolved.target(&inner.registry)?, Some(lsn), data)
}

/// Latches the allocation page whose extent manages `page_no`.
pub(crate) fn latch_alloc_for(container: &Container, page_no: u64) -> Result<PageLatch> {
    let mut alloc_no = FIRST_ALLOC_PAGE;
    loop {
        let alloc = container.latch_page(alloc_no)?;
        let extent = alloc.extent()?;
        if extent.manages(page_no) {
            return Ok(alloc);
        }
        alloc_no = extent
            .next_alloc_page()
            .ok_or_else(|| StoreError::PageNotFound(PageKey::new(container.key(), page_no)))?;
    }
}

/// A container opened by a transaction. Page latches handed out by the
/// handle are released by dropping them.
pub struct ContainerHandle<'t> {
    txn: &'t mut Transaction,
    container: Arc<Container>,
}

impl std::fmt::Debug for ContainerHandle<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerHandle")
            .field("txn", &self.txn.id)
            .field("container", &self.container.key())
            .finish()
    }
}

impl ContainerHandle<'_> {
    /// Key of the open container.
    pub fn key(&self) -> ContainerKey {
        self.container.key()
    }

    /// The open container.
    pub fn container(&self) -> &Arc<Container> {
        &self.container
    }

    /// The owning transaction and the container, for calling actions.
    pub fn parts(&mut self) -> (&mut Transaction, &Container) {
        (&mut *self.txn, &self.container)
    }

    /// Record-level strategy: logged unless the container is temporary.
    pub fn page_actions(&self) -> &'static dyn PageActions {
        page_actions_for(&self.container)
    }

    /// Allocation strategy, chosen like [`ContainerHandle::page_actions`].
    pub fn alloc_actions(&self) -> &'static dyn AllocationActions {
        alloc_actions_for(&self.container)
    }

    /// Allocates and formats a page for row heads.
    pub fn add_page(&mut self) -> Result<PageLatch> {
        self.add_page_with(false)
    }

    /// Allocates and formats a page for overflow portions.
    pub fn add_overflow_page(&mut self) -> Result<PageLatch> {
        self.add_page_with(true)
    }

    fn add_page_with(&mut self, overflow: bool) -> Result<PageLatch> {
        let container = self.container.clone();
        let actions = alloc_actions_for(&container);
        let mut alloc_no = FIRST_ALLOC_PAGE;
        let page_no = loop {
            let mut alloc = container.latch_page(alloc_no)?;
            let extent = alloc.extent()?;
            if let Some(page_no) = extent.find_free() {
                let prev = extent.status(page_no)?;
                actions.action_allocate_page(
                    self.txn,
                    &mut alloc,
                    &container,
                    page_no,
                    AllocStatus::Allocated,
                    prev,
                )?;
                break page_no;
            }
            if let Some(next) = extent.next_alloc_page() {
                alloc_no = next;
                continue;
            }
            let next = extent.last_managed_page() + 1;
            let mut new_alloc = container.latch_or_blank(next)?;
            let base_version = self.base_version(&new_alloc);
            actions.action_init_page(
                self.txn,
                &mut new_alloc,
                &container,
                PageFormat::Alloc {
                    first_page: next + 1,
                    capacity: container.info().alloc_extent_pages,
                },
                false,
                base_version,
            )?;
            drop(new_alloc);
            let offset = (next + 1) * u64::from(container.page_size());
            actions.action_chain_alloc_page(self.txn, &mut alloc, &container, next, offset)?;
            debug!(container = %container.key(), alloc_page = next, "xact.alloc.chain");
            alloc_no = next;
        };

        let mut page = container.latch_or_blank(page_no)?;
        let reuse = page.version() > 0;
        let next_record_id = match page.kind() {
            PageKind::Stored => page.next_record_id().unwrap_or(RecordId::FIRST).max(RecordId::FIRST),
            _ => RecordId::FIRST,
        };
        let base_version = self.base_version(&page);
        actions.action_init_page(
            self.txn,
            &mut page,
            &container,
            PageFormat::Stored {
                overflow,
                next_record_id,
            },
            reuse,
            base_version,
        )?;
        trace!(page = %page.key(), reuse, overflow, "xact.page.add");
        Ok(page)
    }

    /// Floor for the version of a page about to be formatted. A page with no
    /// history in memory may still have one in the log, so it starts past
    /// every LSN handed out so far.
    fn base_version(&self, page: &Page) -> u64 {
        if page.version() > 0 || self.container.is_temporary() {
            0
        } else {
            self.txn.store.inner.log.end_lsn().0
        }
    }

    /// Latches a valid record page.
    pub fn get_page(&self, page_no: u64) -> Result<PageLatch> {
        let page = self.container.latch_page(page_no)?;
        if !page.is_valid() || page.kind() != PageKind::Stored {
            return Err(StoreError::PageNotFound(page.key()));
        }
        Ok(page)
    }

    /// Invalidates `page` and deallocates it. The page becomes free for
    /// reuse when the transaction commits.
    pub fn remove_page(&mut self, mut page: PageLatch) -> Result<()> {
        let key = page.key();
        if key.container != self.container.key() {
            return Err(StoreError::Invalid("page belongs to another container"));
        }
        let container = self.container.clone();
        let actions = alloc_actions_for(&container);
        actions.action_invalidate_page(self.txn, &mut page, &container)?;
        drop(page);
        let mut alloc = latch_alloc_for(&container, key.page_number)?;
        if actions.is_logged() {
            actions.action_allocate_page(
                self.txn,
                &mut alloc,
                &container,
                key.page_number,
                AllocStatus::Deallocated,
                AllocStatus::Allocated,
            )?;
            self.txn.pending_frees.push(key);
        } else {
            actions.action_allocate_page(
                self.txn,
                &mut alloc,
                &container,
                key.page_number,
                AllocStatus::Free,
                AllocStatus::Allocated,
            )?;
        }
        trace!(page = %key, "xact.page.remove");
        Ok(())
    }

    /// Gives trailing free pages of the last allocation extent back to the
    /// file system. Returns how many pages were cut.
    pub fn compress_space(&mut self) -> Result<u64> {
        let container = self.container.clone();
        let mut alloc_no = FIRST_ALLOC_PAGE;
        let mut alloc = loop {
            let alloc = container.latch_page(alloc_no)?;
            match alloc.extent()?.next_alloc_page() {
                Some(next) => alloc_no = next,
                None => break alloc,
            }
        };
        let extent = alloc.extent()?;
        let new_highest = extent.highest_in_use();
        let truncated = extent.len() as u64 - (new_highest + 1) as u64;
        if truncated == 0 {
            return Ok(0);
        }
        alloc_actions_for(&container).action_compress_space(
            self.txn,
            &mut alloc,
            &container,
            new_highest,
            truncated,
        )?;
        debug!(container = %container.key(), new_highest, truncated, "xact.compress_space");
        Ok(truncated)
    }

    /// Writes `bytes` to a chain of overflow pages and returns the column
    /// pointing at its head.
    pub fn store_long_column(&mut self, bytes: &[u8]) -> Result<Field> {
        let info = self.container.info();
        let blank = Page::blank(PageKey::new(self.container.key(), 0), info.page_size);
        let chunk = blank
            .max_inline_column(info.overflow_threshold)
            .saturating_sub(LONG_CHUNK_OVERHEAD);
        if chunk == 0 {
            return Err(StoreError::Invalid("page too small for long columns"));
        }
        let container = self.container.clone();
        let actions = page_actions_for(&container);
        let mut next = Field::Null;
        // Written tail first so each portion can point at the one after it.
        for part in bytes.chunks(chunk).rev() {
            let mut page = self.add_overflow_page()?;
            let row = [Field::value(part), next];
            let (outcome, id) =
                actions.action_insert(self.txn, &mut page, &container, InsertRequest::new(0, &row))?;
            let (RowLogOutcome::Complete, Some(record)) = (outcome, id) else {
                return Err(StoreError::consistency(format!(
                    "long column portion did not fit on {}",
                    page.key()
                )));
            };
            next = Field::Long {
                page: page.key().page_number,
                record,
            };
        }
        Ok(next)
    }

    /// Reads back a column written by [`ContainerHandle::store_long_column`].
    pub fn fetch_long_column(&self, head: &Field) -> Result<Vec<u8>> {
        fetch_long_column(&self.container, head)
    }
}

/// Follows a long-column chain from `head` and concatenates its portions.
pub(crate) fn fetch_long_column(container: &Container, head: &Field) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut next = head.clone();
    loop {
        let (page_no, record) = match next {
            Field::Long { page, record } => (page, record),
            Field::Null => return Ok(out),
            Field::Value(_) => return Err(StoreError::Invalid("not a long column")),
        };
        let page = container.latch_page(page_no)?;
        let slot = page
            .find_record_by_id(record)
            .ok_or(StoreError::RecordNotFound {
                page: page.key(),
                record,
                op: "fetch_long_column",
            })?;
        let stored = page.record_at(slot)?;
        let [Field::Value(part), tail] = stored.fields.as_slice() else {
            return Err(StoreError::Corruption("malformed long column portion"));
        };
        out.extend_from_slice(part);
        next = tail.clone();
    }
}
