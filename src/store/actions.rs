#![forbid(unsafe_code)]
//! Page and allocation actions.
//!
//! Access methods change pages only through these traits. Each action builds
//! the matching [`Operation`], prepares its optional data in the
//! transaction's log buffer, and hands both to [`PageActions::apply`]. The
//! logged strategy drives the operation through log-and-do; the direct
//! strategy applies it in memory and writes nothing, for temporary
//! containers whose contents never need recovery.
//!
//! Every precondition the operation's apply step depends on (slot range,
//! record ids, free space, extent bounds) is checked here, before anything
//! is logged. Once a record is in the log its apply step must succeed, at
//! runtime and again when recovery redoes it.

use tracing::trace;

use crate::primitives::bytes::buf::Cursor;
use crate::store::alloc::AllocStatus;
use crate::store::container::Container;
use crate::store::metrics::StoreMetrics;
use crate::store::ops::{
    encode_images, put_row_image, AllocPage, ChainAllocPage, CompressSpace, CopyRows, Delete,
    InitPage, Insert, InsertFlags, InvalidatePage, Loggable, Operation, PageOpHeader, Purge,
    SetReservedSpace, Target, Update, UpdateField,
};
use crate::store::page::{Field, Page, PageFormat, RowLogOutcome, RowResume, StoredRecord};
use crate::store::xact::Transaction;
use crate::types::{RecordId, Result, StoreError};

/// A row insert, possibly continuing a row split across pages.
#[derive(Debug)]
pub struct InsertRequest<'r> {
    /// Slot to insert at.
    pub slot: usize,
    /// The whole row.
    pub row: &'r [Field],
    /// First column to store on this page.
    pub start_column: usize,
    /// Columns already encoded by an earlier attempt that hit a long column.
    pub resume: Option<RowResume>,
    /// Insert behavior flags.
    pub flags: InsertFlags,
    /// Logical undo callback for the new record.
    pub undo_id: Option<u32>,
}

impl<'r> InsertRequest<'r> {
    /// Inserts all of `row` at `slot`.
    pub fn new(slot: usize, row: &'r [Field]) -> Self {
        Self {
            slot,
            row,
            start_column: 0,
            resume: None,
            flags: InsertFlags::empty(),
            undo_id: None,
        }
    }

    /// Sets the insert flags.
    pub fn flags(mut self, flags: InsertFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Undoes the insert through the logical undo registered under `undo_id`.
    pub fn undo_id(mut self, undo_id: u32) -> Self {
        self.undo_id = Some(undo_id);
        self
    }

    /// Continues a row from `start_column`.
    pub fn start_column(mut self, start_column: usize) -> Self {
        self.start_column = start_column;
        self
    }

    /// Continues after a long column was moved off the page.
    pub fn resume(mut self, resume: RowResume) -> Self {
        self.resume = Some(resume);
        self
    }
}

fn prepare(txn: &mut Transaction, data: &[u8]) -> Result<()> {
    let buffer = txn.log_buffer();
    buffer.clear();
    buffer.write_slice(data)
}

fn slot_u32(slot: usize) -> Result<u32> {
    u32::try_from(slot).map_err(|_| StoreError::Invalid("slot out of range"))
}

/// Record-level changes to a latched page.
pub trait PageActions: Send + Sync {
    /// Applies `op` to `page` with the optional data prepared in the
    /// transaction's log buffer. The caller holds the page latch.
    fn apply(&self, txn: &mut Transaction, op: Operation, page: &mut Page, container: &Container) -> Result<()>;

    /// Whether changes made through this strategy are logged.
    fn is_logged(&self) -> bool;

    /// Sets or clears the delete mark of the record at `slot`.
    fn action_delete(
        &self,
        txn: &mut Transaction,
        page: &mut Page,
        container: &Container,
        slot: usize,
        delete: bool,
        undo_id: Option<u32>,
    ) -> Result<()> {
        let record = page.record_at(slot)?;
        let op = Operation::Delete(Delete {
            header: PageOpHeader::for_page(page),
            slot: slot_u32(slot)?,
            record: record.id,
            delete,
            undo_id,
        });
        let mut data = Vec::new();
        put_row_image(record, &mut data);
        prepare(txn, &data)?;
        self.apply(txn, op, page, container)
    }

    /// Replaces the columns of the record at `slot` from `start_column` on.
    fn action_update(
        &self,
        txn: &mut Transaction,
        page: &mut Page,
        container: &Container,
        slot: usize,
        start_column: usize,
        new_columns: &[Field],
    ) -> Result<()> {
        let record = page.record_at(slot)?;
        page.check_update_space(slot, start_column, new_columns)?;
        let op = Operation::Update(Update {
            header: PageOpHeader::for_page(page),
            slot: slot_u32(slot)?,
            record: record.id,
            start_column: u32::try_from(start_column)
                .map_err(|_| StoreError::Invalid("column out of range"))?,
        });
        let mut data = Vec::new();
        Update::optional_data(&record.fields, new_columns, &mut data);
        prepare(txn, &data)?;
        self.apply(txn, op, page, container)
    }

    /// Replaces one column of the record at `slot`.
    fn action_update_field(
        &self,
        txn: &mut Transaction,
        page: &mut Page,
        container: &Container,
        slot: usize,
        field_id: usize,
        field: Field,
        undo_id: Option<u32>,
    ) -> Result<()> {
        let record = page.record_at(slot)?;
        page.check_field_space(slot, field_id, &field)?;
        let op = Operation::UpdateField(UpdateField {
            header: PageOpHeader::for_page(page),
            slot: slot_u32(slot)?,
            record: record.id,
            field_id: u32::try_from(field_id).map_err(|_| StoreError::Invalid("column out of range"))?,
            undo_id,
        });
        let mut data = Vec::new();
        put_row_image(record, &mut data);
        field.encode(&mut data);
        prepare(txn, &data)?;
        self.apply(txn, op, page, container)
    }

    /// Removes `num` records starting at `slot`.
    fn action_purge(
        &self,
        txn: &mut Transaction,
        page: &mut Page,
        container: &Container,
        slot: usize,
        num: usize,
    ) -> Result<()> {
        let records = page
            .records()
            .get(slot..slot + num)
            .ok_or(StoreError::Invalid("purge range out of range"))?;
        let op = Operation::Purge(Purge {
            header: PageOpHeader::for_page(page),
            slot: slot_u32(slot)?,
            ids: records.iter().map(|r| r.id).collect(),
        });
        let mut data = Vec::new();
        encode_images(records, &mut data);
        prepare(txn, &data)?;
        self.apply(txn, op, page, container)
    }

    /// Copies `num` records from `src` starting at `src_slot` onto `dest`
    /// at `dest_slot`, keeping their ids. The source is left untouched.
    #[allow(clippy::too_many_arguments)]
    fn action_copy_rows(
        &self,
        txn: &mut Transaction,
        src: &Page,
        src_slot: usize,
        num: usize,
        dest: &mut Page,
        container: &Container,
        dest_slot: usize,
    ) -> Result<()> {
        let records = src
            .records()
            .get(src_slot..src_slot + num)
            .ok_or(StoreError::Invalid("copy range out of range"))?;
        dest.check_insert_space(dest_slot, records)?;
        let op = Operation::CopyRows(CopyRows {
            header: PageOpHeader::for_page(dest),
            dest_slot: slot_u32(dest_slot)?,
            num: slot_u32(num)?,
        });
        let mut data = Vec::new();
        encode_images(records, &mut data);
        prepare(txn, &data)?;
        self.apply(txn, op, dest, container)
    }

    /// Lays out `req.row` on `page` and inserts what fits.
    ///
    /// Returns the outcome of laying out the row and the id of the new
    /// record. A [`RowLogOutcome::LongColumn`] outcome stores nothing; the
    /// caller moves the long column elsewhere and retries with the returned
    /// resume state.
    fn action_insert(
        &self,
        txn: &mut Transaction,
        page: &mut Page,
        container: &Container,
        req: InsertRequest<'_>,
    ) -> Result<(RowLogOutcome, Option<RecordId>)> {
        let threshold = container.info().overflow_threshold;
        let mut columns = Vec::new();
        let (outcome, logged) =
            page.log_row(req.row, req.start_column, req.resume, threshold, &mut columns)?;
        if let RowLogOutcome::LongColumn(_) = outcome {
            trace!(page = %page.key(), "actions.insert.long_column");
            return Ok((outcome, None));
        }
        let mut cur = Cursor::new(&columns);
        let fields = (0..logged)
            .map(|_| Field::decode(&mut cur))
            .collect::<Result<Vec<_>>>()?;
        cur.finish()?;
        let id = page.next_record_id()?;
        let record = StoredRecord::new(id, fields);
        page.check_insert_space(req.slot, std::slice::from_ref(&record))?;
        let op = Operation::Insert(Insert {
            header: PageOpHeader::for_page(page),
            slot: slot_u32(req.slot)?,
            record: id,
            flags: req.flags,
            undo_id: req.undo_id,
        });
        let mut data = Vec::new();
        put_row_image(&record, &mut data);
        prepare(txn, &data)?;
        self.apply(txn, op, page, container)?;
        Ok((outcome, Some(id)))
    }

    /// Marks the page invalid; it no longer holds records.
    fn action_invalidate_page(&self, txn: &mut Transaction, page: &mut Page, container: &Container) -> Result<()> {
        let op = Operation::InvalidatePage(InvalidatePage {
            header: PageOpHeader::for_page(page),
        });
        txn.log_buffer().clear();
        self.apply(txn, op, page, container)
    }

    /// Formats the page. Its version afterwards is above `base_version`.
    #[allow(clippy::too_many_arguments)]
    fn action_init_page(
        &self,
        txn: &mut Transaction,
        page: &mut Page,
        container: &Container,
        format: PageFormat,
        reuse: bool,
        base_version: u64,
    ) -> Result<()> {
        let op = Operation::InitPage(InitPage {
            header: PageOpHeader::for_page(page),
            format,
            reuse,
            base_version,
        });
        txn.log_buffer().clear();
        self.apply(txn, op, page, container)
    }

    /// Lowers the reserved space of the record at `slot`.
    fn action_shrink_reserved_space(
        &self,
        txn: &mut Transaction,
        page: &mut Page,
        container: &Container,
        slot: usize,
        new_reserved: u32,
    ) -> Result<()> {
        let record = page.record_at(slot)?;
        if new_reserved > record.reserved {
            return Err(StoreError::Invalid("reserved space can only shrink"));
        }
        let op = Operation::SetReservedSpace(SetReservedSpace {
            header: PageOpHeader::for_page(page),
            slot: slot_u32(slot)?,
            record: record.id,
            new_reserved,
            old_reserved: record.reserved,
        });
        txn.log_buffer().clear();
        self.apply(txn, op, page, container)
    }
}

/// Changes to an allocation page.
pub trait AllocationActions: PageActions {
    /// Sets the status of `page_number`; undo restores `undo_status`.
    fn action_allocate_page(
        &self,
        txn: &mut Transaction,
        alloc_page: &mut Page,
        container: &Container,
        page_number: u64,
        do_status: AllocStatus,
        undo_status: AllocStatus,
    ) -> Result<()> {
        alloc_page.extent()?.status(page_number)?;
        let op = Operation::AllocPage(AllocPage {
            header: PageOpHeader::for_page(alloc_page),
            page_number,
            do_status,
            undo_status,
        });
        txn.log_buffer().clear();
        self.apply(txn, op, alloc_page, container)
    }

    /// Links the next allocation page.
    fn action_chain_alloc_page(
        &self,
        txn: &mut Transaction,
        alloc_page: &mut Page,
        container: &Container,
        next_page: u64,
        next_offset: u64,
    ) -> Result<()> {
        alloc_page.extent()?;
        let op = Operation::ChainAllocPage(ChainAllocPage {
            header: PageOpHeader::for_page(alloc_page),
            next_page,
            next_offset,
        });
        txn.log_buffer().clear();
        self.apply(txn, op, alloc_page, container)
    }

    /// Cuts `truncated` trailing free pages, keeping `new_highest`.
    fn action_compress_space(
        &self,
        txn: &mut Transaction,
        alloc_page: &mut Page,
        container: &Container,
        new_highest: i64,
        truncated: u64,
    ) -> Result<()> {
        alloc_page.extent()?.check_compress(new_highest, truncated)?;
        let op = Operation::CompressSpace(CompressSpace::new(
            PageOpHeader::for_page(alloc_page),
            new_highest,
            truncated,
        ));
        txn.log_buffer().clear();
        self.apply(txn, op, alloc_page, container)
    }
}

/// Applies changes in memory without logging.
#[derive(Clone, Copy, Debug, Default)]
pub struct DirectActions;

impl PageActions for DirectActions {
    fn apply(&self, txn: &mut Transaction, op: Operation, page: &mut Page, container: &Container) -> Result<()> {
        let data = txn.take_log_buffer();
        let result = op.do_me(Target::Page { page, container }, None, data.as_slice());
        txn.restore_log_buffer(data);
        result?;
        StoreMetrics::bump(&txn.metrics().ops_direct);
        trace!(op = op.name(), txn = %txn.id(), "actions.direct");
        Ok(())
    }

    fn is_logged(&self) -> bool {
        false
    }
}

impl AllocationActions for DirectActions {}

/// Logs every change before applying it.
#[derive(Clone, Copy, Debug, Default)]
pub struct LoggedActions;

impl PageActions for LoggedActions {
    fn apply(&self, txn: &mut Transaction, op: Operation, page: &mut Page, container: &Container) -> Result<()> {
        let before = page.version();
        page.pre_dirty();
        let lsn = txn.log_and_do(&op, Target::Page { page: &mut *page, container })?;
        if page.version() <= before || page.last_lsn() != Some(lsn) {
            return Err(StoreError::consistency(format!(
                "{} on {} did not advance the page: version {} -> {}, lsn {}",
                op.name(),
                page.key(),
                before,
                page.version(),
                lsn
            )));
        }
        Ok(())
    }

    fn is_logged(&self) -> bool {
        true
    }
}

impl AllocationActions for LoggedActions {}

static DIRECT: DirectActions = DirectActions;
static LOGGED: LoggedActions = LoggedActions;

/// Allocation strategy for `container`: temporary containers are never logged.
pub fn alloc_actions_for(container: &Container) -> &'static dyn AllocationActions {
    if container.is_temporary() {
        &DIRECT
    } else {
        &LOGGED
    }
}

/// Record-level strategy for `container`.
pub fn page_actions_for(container: &Container) -> &'static dyn PageActions {
    if container.is_temporary() {
        &DIRECT
    } else {
        &LOGGED
    }
}
