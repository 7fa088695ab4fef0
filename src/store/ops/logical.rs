#![forbid(unsafe_code)]
//! Logical page operations.
//!
//! These name their record by id rather than slot, and their undo may land on
//! a different page than the one they were applied to: the access method that
//! owns the record can register a [`LogicalUndo`] callback that finds where
//! the record lives now. Optional data always starts with a record image so
//! the callback has the row's key to search for.

use std::collections::HashMap;
use std::sync::Arc;

use bitflags::bitflags;
use parking_lot::RwLock;

use super::page::{expect_record_at, slot_of};
use super::{
    page_needs_redo, resolve_page, type_id, Group, Loggable, LogicalUndoOp, OpContext, Operation,
    PageOpHeader, PendingUndo, Resolved, Target, Undoable,
};
use crate::primitives::bytes::{buf::Cursor, var};
use crate::store::container::Container;
use crate::store::page::{Field, PageLatch, StoredRecord};
use crate::types::{Lsn, RecordId, Result, StoreError};

/// Locates the record a logical undo must act on.
///
/// `original` is the latched page the operation was applied to. The
/// callback returns the latched page now holding the record and the
/// record's id there, releasing any other latch it took.
pub trait LogicalUndo: Send + Sync {
    /// Finds the current home of `record`, whose image is `row`.
    fn find_undo(
        &self,
        container: &Arc<Container>,
        original: PageLatch,
        record: RecordId,
        row: &StoredRecord,
    ) -> Result<(PageLatch, RecordId)>;
}

/// Logical undo callbacks, keyed by the id operations persist.
#[derive(Default)]
pub struct UndoRegistry {
    callbacks: RwLock<HashMap<u32, Arc<dyn LogicalUndo>>>,
}

impl UndoRegistry {
    /// Registers `callback` under `id`, replacing any previous one.
    pub fn register(&self, id: u32, callback: Arc<dyn LogicalUndo>) {
        self.callbacks.write().insert(id, callback);
    }

    /// Removes the callback under `id`.
    pub fn unregister(&self, id: u32) {
        self.callbacks.write().remove(&id);
    }

    /// Callback for `id`.
    pub fn get(&self, id: u32) -> Result<Arc<dyn LogicalUndo>> {
        self.callbacks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StoreError::consistency(format!("logical undo {id} is not registered")))
    }
}

fn encode_undo_id(undo_id: Option<u32>, out: &mut Vec<u8>) {
    // Zero marks "no callback"; registered ids are shifted by one.
    var::encode_u64(undo_id.map_or(0, |id| u64::from(id) + 1), out);
}

fn decode_undo_id(cur: &mut Cursor<'_>) -> Result<Option<u32>> {
    match cur.read_var_u64()? {
        0 => Ok(None),
        raw => u32::try_from(raw - 1)
            .map(Some)
            .map_err(|_| StoreError::Corruption("logical undo id out of range")),
    }
}

/// Writes the leading record image of a logical operation's optional data.
pub(crate) fn put_row_image(record: &StoredRecord, out: &mut Vec<u8>) {
    var::put_bytes(&record.to_bytes(), out);
}

fn read_row_image<'a>(data: &'a [u8]) -> Result<(StoredRecord, Cursor<'a>)> {
    let mut cur = Cursor::new(data);
    let record = StoredRecord::from_bytes(cur.read_bytes()?)?;
    Ok((record, cur))
}

/// Latches the page a logical undo applies to and wraps `original` in a
/// logical compensation record.
fn logical_undo(
    ctx: &OpContext<'_>,
    header: &PageOpHeader,
    record: RecordId,
    undo_id: Option<u32>,
    original: Operation,
    data: &[u8],
) -> Result<Option<PendingUndo>> {
    let container = ctx.registry.get(header.page.container)?;
    let page = container.latch_page(header.page.page_number)?;
    let (mut page, record) = match undo_id {
        Some(id) => {
            let (row, _) = read_row_image(data)?;
            ctx.undo.get(id)?.find_undo(&container, page, record, &row)?
        }
        None => {
            slot_of(&page, record, original.name())?;
            (page, record)
        }
    };
    page.pre_dirty();
    let clr = LogicalUndoOp::new(PageOpHeader::for_page(&page), record, original);
    Ok(Some(PendingUndo {
        clr: Operation::LogicalUndo(clr),
        resolved: Resolved::page(container, page),
    }))
}

bitflags! {
    /// Insert behaviour switches.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct InsertFlags: u8 {
        /// Undo removes the record instead of marking it deleted.
        const UNDO_WITH_PURGE = 0x01;
    }
}

/// Stores a new record.
///
/// Optional data: the record image.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Insert {
    /// Page the record is inserted on.
    pub header: PageOpHeader,
    /// Slot at insert time.
    pub slot: u32,
    /// Id the new record gets.
    pub record: RecordId,
    /// Insert behavior, including how undo removes the record.
    pub flags: InsertFlags,
    /// Logical undo callback, if any.
    pub undo_id: Option<u32>,
}

impl Insert {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            slot: cur.read_var_u32()?,
            record: RecordId(cur.read_var_u32()?),
            flags: InsertFlags::from_bits(cur.read_u8()?)
                .ok_or(StoreError::Corruption("unknown insert flags"))?,
            undo_id: decode_undo_id(cur)?,
        })
    }
}

impl Loggable for Insert {
    fn type_id(&self) -> u16 {
        type_id::INSERT
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "insert"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(u64::from(self.slot), out);
        var::encode_u64(u64::from(self.record.0), out);
        out.push(self.flags.bits());
        encode_undo_id(self.undo_id, out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let (row, cur) = read_row_image(data)?;
        cur.finish()?;
        if row.id != self.record {
            return Err(StoreError::consistency(format!(
                "insert image carries record {}, log expects {}",
                row.id, self.record
            )));
        }
        page.store_record(lsn, self.slot as usize, row)
    }
}

impl Undoable for Insert {
    fn generate_undo(&self, ctx: &OpContext<'_>, data: &[u8]) -> Result<Option<PendingUndo>> {
        logical_undo(ctx, &self.header, self.record, self.undo_id, Operation::Insert(self.clone()), data)
    }

    fn undo_me(&self, target: Target<'_>, record: Option<RecordId>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let slot = slot_of(page, record.unwrap_or(self.record), self.name())?;
        if self.flags.contains(InsertFlags::UNDO_WITH_PURGE) {
            page.purge_record(lsn, slot).map(|_| ())
        } else {
            page.set_delete_status(lsn, slot, true)
        }
    }
}

/// Sets or clears a record's delete mark.
///
/// Optional data: the record image at the time of the change.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Delete {
    /// Page the record was on.
    pub header: PageOpHeader,
    /// Slot at delete time.
    pub slot: u32,
    /// Id of the record.
    pub record: RecordId,
    /// `true` deletes, `false` undeletes.
    pub delete: bool,
    /// Logical undo callback, if any.
    pub undo_id: Option<u32>,
}

impl Delete {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            slot: cur.read_var_u32()?,
            record: RecordId(cur.read_var_u32()?),
            delete: cur.read_u8()? != 0,
            undo_id: decode_undo_id(cur)?,
        })
    }
}

impl Loggable for Delete {
    fn type_id(&self) -> u16 {
        type_id::DELETE
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "delete"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(u64::from(self.slot), out);
        var::encode_u64(u64::from(self.record.0), out);
        out.push(u8::from(self.delete));
        encode_undo_id(self.undo_id, out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        expect_record_at(page, self.slot as usize, self.record)?;
        page.set_delete_status(lsn, self.slot as usize, self.delete)
    }
}

impl Undoable for Delete {
    fn generate_undo(&self, ctx: &OpContext<'_>, data: &[u8]) -> Result<Option<PendingUndo>> {
        logical_undo(ctx, &self.header, self.record, self.undo_id, Operation::Delete(self.clone()), data)
    }

    fn undo_me(&self, target: Target<'_>, record: Option<RecordId>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let slot = slot_of(page, record.unwrap_or(self.record), self.name())?;
        page.set_delete_status(lsn, slot, !self.delete)
    }
}

/// Replaces one column of a record.
///
/// Optional data: the record image before the change, then the new column.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UpdateField {
    /// Page the record was on.
    pub header: PageOpHeader,
    /// Slot at update time.
    pub slot: u32,
    /// Id of the record.
    pub record: RecordId,
    /// Column replaced.
    pub field_id: u32,
    /// Logical undo callback, if any.
    pub undo_id: Option<u32>,
}

impl UpdateField {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            slot: cur.read_var_u32()?,
            record: RecordId(cur.read_var_u32()?),
            field_id: cur.read_var_u32()?,
            undo_id: decode_undo_id(cur)?,
        })
    }

    fn split_data(data: &[u8]) -> Result<(StoredRecord, Field)> {
        let (old, mut cur) = read_row_image(data)?;
        let field = Field::decode(&mut cur)?;
        cur.finish()?;
        Ok((old, field))
    }
}

impl Loggable for UpdateField {
    fn type_id(&self) -> u16 {
        type_id::UPDATE_FIELD
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "update_field"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(u64::from(self.slot), out);
        var::encode_u64(u64::from(self.record.0), out);
        var::encode_u64(u64::from(self.field_id), out);
        encode_undo_id(self.undo_id, out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        expect_record_at(page, self.slot as usize, self.record)?;
        let (_, field) = Self::split_data(data)?;
        page.store_field(lsn, self.slot as usize, self.field_id as usize, field)
    }
}

impl Undoable for UpdateField {
    fn generate_undo(&self, ctx: &OpContext<'_>, data: &[u8]) -> Result<Option<PendingUndo>> {
        logical_undo(
            ctx,
            &self.header,
            self.record,
            self.undo_id,
            Operation::UpdateField(self.clone()),
            data,
        )
    }

    fn undo_me(&self, target: Target<'_>, record: Option<RecordId>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let slot = slot_of(page, record.unwrap_or(self.record), self.name())?;
        let (old, _) = Self::split_data(data)?;
        let field_id = self.field_id as usize;
        let mut fields = page.record_at(slot)?.fields.clone();
        match old.fields.get(field_id) {
            Some(previous) if field_id < fields.len() => fields[field_id] = previous.clone(),
            // The update padded the record out to `field_id`.
            _ => fields.truncate(old.fields.len()),
        }
        page.set_fields(lsn, slot, fields)
    }
}
