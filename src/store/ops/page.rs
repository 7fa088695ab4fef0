#![forbid(unsafe_code)]
//! Physical page operations: undone on the same page, byte for byte.

use smallvec::SmallVec;

use super::{
    page_needs_redo, physical_undo, resolve_page, type_id, Group, Loggable, OpContext, Operation,
    PageOpHeader, PendingUndo, Resolved, Target, Undoable,
};
use crate::primitives::bytes::{buf::Cursor, var};
use crate::store::page::{decode_fields, encode_fields, Field, Page, PageFormat, StoredRecord};
use crate::types::{Lsn, RecordId, Result, StoreError};

const FORMAT_STORED: u8 = 1;
const FORMAT_ALLOC: u8 = 2;

fn encode_format(format: &PageFormat, out: &mut Vec<u8>) {
    match format {
        PageFormat::Stored {
            overflow,
            next_record_id,
        } => {
            out.push(FORMAT_STORED);
            out.push(u8::from(*overflow));
            var::encode_u64(u64::from(next_record_id.0), out);
        }
        PageFormat::Alloc {
            first_page,
            capacity,
        } => {
            out.push(FORMAT_ALLOC);
            var::encode_u64(*first_page, out);
            var::encode_u64(u64::from(*capacity), out);
        }
    }
}

fn decode_format(cur: &mut Cursor<'_>) -> Result<PageFormat> {
    match cur.read_u8()? {
        FORMAT_STORED => Ok(PageFormat::Stored {
            overflow: cur.read_u8()? != 0,
            next_record_id: RecordId(cur.read_var_u32()?),
        }),
        FORMAT_ALLOC => Ok(PageFormat::Alloc {
            first_page: cur.read_var_u64()?,
            capacity: cur.read_var_u32()?,
        }),
        _ => Err(StoreError::Corruption("unknown page format")),
    }
}

/// Encodes record images as optional data.
pub(crate) fn encode_images<'a>(records: impl IntoIterator<Item = &'a StoredRecord>, out: &mut Vec<u8>) {
    let mut image = Vec::new();
    for record in records {
        image.clear();
        record.encode(&mut image);
        var::put_bytes(&image, out);
    }
}

/// Reads `num` record images.
pub(crate) fn decode_images(cur: &mut Cursor<'_>, num: usize) -> Result<Vec<StoredRecord>> {
    (0..num)
        .map(|_| StoredRecord::from_bytes(cur.read_bytes()?))
        .collect()
}

/// Slot holding `record`, or the error an undo raises when it is gone.
pub(crate) fn slot_of(page: &Page, record: RecordId, op: &'static str) -> Result<usize> {
    page.find_record_by_id(record)
        .ok_or(StoreError::RecordNotFound {
            page: page.key(),
            record,
            op,
        })
}

/// Checks that `slot` still holds `record` before a redo or do applies.
pub(crate) fn expect_record_at(page: &Page, slot: usize, record: RecordId) -> Result<()> {
    let found = page.record_at(slot)?.id;
    if found != record {
        return Err(StoreError::consistency(format!(
            "{} slot {slot} holds record {found}, log expects {record}",
            page.key()
        )));
    }
    Ok(())
}

/// Formats a page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitPage {
    /// The page.
    pub header: PageOpHeader,
    /// Layout the page gets.
    pub format: PageFormat,
    /// The page was in use before and is being recycled.
    pub reuse: bool,
    /// Lowest version the page starts from. A page cut off by a compress
    /// and added again must not share versions with its earlier life, so
    /// fresh pages start above every version the log has handed out.
    pub base_version: u64,
}

impl InitPage {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            format: decode_format(cur)?,
            reuse: cur.read_u8()? != 0,
            base_version: cur.read_var_u64()?,
        })
    }
}

impl Loggable for InitPage {
    fn type_id(&self) -> u16 {
        type_id::INIT_PAGE
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "init_page"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        encode_format(&self.format, out);
        out.push(u8::from(self.reuse));
        var::encode_u64(self.base_version, out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        // The page may never have reached the file.
        resolve_page(ctx, &self.header, true)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        if self.base_version <= self.header.page_version {
            return page_needs_redo(&self.header, resolved);
        }
        // A page recreated after a compress may still carry versions from its
        // earlier life. Formatting replaces all of it, so redo whenever the
        // live page is short of what this init produces.
        Ok(resolved
            .latched_page()
            .map_or(false, |page| page.version() <= self.base_version))
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        page.raise_version(self.base_version);
        page.init_page(lsn, &self.format)
    }
}

impl Undoable for InitPage {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        physical_undo(ctx, &self.header, Operation::InitPage(self.clone()))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        page.set_page_status(lsn, false)
    }
}

/// Marks a page invalid so it can be deallocated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvalidatePage {
    /// The page.
    pub header: PageOpHeader,
}

impl InvalidatePage {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
        })
    }
}

impl Loggable for InvalidatePage {
    fn type_id(&self) -> u16 {
        type_id::INVALIDATE_PAGE
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "invalidate_page"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        page.set_page_status(lsn, false)
    }
}

impl Undoable for InvalidatePage {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        physical_undo(ctx, &self.header, Operation::InvalidatePage(self.clone()))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        page.set_page_status(lsn, true)
    }
}

/// Replaces the columns of a record from `start_column` on.
///
/// Optional data: the new columns, then the record's full column list
/// before the update.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Update {
    /// The page.
    pub header: PageOpHeader,
    /// Slot at update time.
    pub slot: u32,
    /// Id of the record.
    pub record: RecordId,
    /// First column replaced.
    pub start_column: u32,
}

impl Update {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            slot: cur.read_var_u32()?,
            record: RecordId(cur.read_var_u32()?),
            start_column: cur.read_var_u32()?,
        })
    }

    /// Builds the optional data for an update of `old` with `new_columns`.
    pub fn optional_data(old: &[Field], new_columns: &[Field], out: &mut Vec<u8>) {
        encode_fields(new_columns, out);
        encode_fields(old, out);
    }

    fn split_data(data: &[u8]) -> Result<(Vec<Field>, Vec<Field>)> {
        let mut cur = Cursor::new(data);
        let new_columns = decode_fields(&mut cur)?;
        let old = decode_fields(&mut cur)?;
        cur.finish()?;
        Ok((new_columns, old))
    }
}

impl Loggable for Update {
    fn type_id(&self) -> u16 {
        type_id::UPDATE
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "update"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(u64::from(self.slot), out);
        var::encode_u64(u64::from(self.record.0), out);
        var::encode_u64(u64::from(self.start_column), out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let slot = self.slot as usize;
        expect_record_at(page, slot, self.record)?;
        let (new_columns, _) = Self::split_data(data)?;
        let fields = page.updated_columns(slot, self.start_column as usize, &new_columns)?;
        page.set_fields(lsn, slot, fields)
    }
}

impl Undoable for Update {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        physical_undo(ctx, &self.header, Operation::Update(self.clone()))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let slot = slot_of(page, self.record, self.name())?;
        let (_, old) = Self::split_data(data)?;
        page.set_fields(lsn, slot, old)
    }
}

/// Removes records from a page outright.
///
/// Optional data: the purged record images, so undo can put them back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Purge {
    /// The page.
    pub header: PageOpHeader,
    /// First slot purged.
    pub slot: u32,
    /// Ids of the purged records, in slot order.
    pub ids: SmallVec<[RecordId; 4]>,
}

impl Purge {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let header = PageOpHeader::decode(cur)?;
        let slot = cur.read_var_u32()?;
        let num = cur.read_var_u64()?;
        if num > cur.remaining() as u64 {
            return Err(StoreError::Corruption("purge count exceeds record"));
        }
        let ids = (0..num)
            .map(|_| cur.read_var_u32().map(RecordId))
            .collect::<Result<_>>()?;
        Ok(Self { header, slot, ids })
    }
}

impl Loggable for Purge {
    fn type_id(&self) -> u16 {
        type_id::PURGE
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "purge"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(u64::from(self.slot), out);
        var::encode_u64(self.ids.len() as u64, out);
        for id in &self.ids {
            var::encode_u64(u64::from(id.0), out);
        }
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let slot = self.slot as usize;
        for (offset, id) in self.ids.iter().enumerate() {
            expect_record_at(page, slot + offset, *id)?;
        }
        page.purge_records(lsn, slot, self.ids.len()).map(|_| ())
    }
}

impl Undoable for Purge {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        physical_undo(ctx, &self.header, Operation::Purge(self.clone()))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let mut cur = Cursor::new(data);
        let images = decode_images(&mut cur, self.ids.len())?;
        cur.finish()?;
        page.store_records(lsn, self.slot as usize, images)
    }
}

/// Copies records onto this page, keeping their ids.
///
/// Optional data: the copied record images.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CopyRows {
    /// Destination page.
    pub header: PageOpHeader,
    /// First slot the copies land in.
    pub dest_slot: u32,
    /// Records copied.
    pub num: u32,
}

impl CopyRows {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            dest_slot: cur.read_var_u32()?,
            num: cur.read_var_u32()?,
        })
    }
}

impl Loggable for CopyRows {
    fn type_id(&self) -> u16 {
        type_id::COPY_ROWS
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "copy_rows"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(u64::from(self.dest_slot), out);
        var::encode_u64(u64::from(self.num), out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let mut cur = Cursor::new(data);
        let images = decode_images(&mut cur, self.num as usize)?;
        cur.finish()?;
        page.store_records(lsn, self.dest_slot as usize, images)
    }
}

impl Undoable for CopyRows {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        physical_undo(ctx, &self.header, Operation::CopyRows(self.clone()))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let mut cur = Cursor::new(data);
        let images = decode_images(&mut cur, self.num as usize)?;
        let slot = self.dest_slot as usize;
        for (offset, image) in images.iter().enumerate() {
            expect_record_at(page, slot + offset, image.id)?;
        }
        page.purge_records(lsn, slot, images.len()).map(|_| ())
    }
}

/// Changes the space held back for a record's growth.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SetReservedSpace {
    /// The page.
    pub header: PageOpHeader,
    /// Slot of the record.
    pub slot: u32,
    /// Id of the record.
    pub record: RecordId,
    /// Reserved bytes after the change.
    pub new_reserved: u32,
    /// Reserved bytes before it.
    pub old_reserved: u32,
}

impl SetReservedSpace {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            slot: cur.read_var_u32()?,
            record: RecordId(cur.read_var_u32()?),
            new_reserved: cur.read_var_u32()?,
            old_reserved: cur.read_var_u32()?,
        })
    }
}

impl Loggable for SetReservedSpace {
    fn type_id(&self) -> u16 {
        type_id::SET_RESERVED_SPACE
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "set_reserved_space"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(u64::from(self.slot), out);
        var::encode_u64(u64::from(self.record.0), out);
        var::encode_u64(u64::from(self.new_reserved), out);
        var::encode_u64(u64::from(self.old_reserved), out);
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
        page.set_reserved_space(lsn, self.slot as usize, self.new_reserved)
    }
}

impl Undoable for SetReservedSpace {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        physical_undo(ctx, &self.header, Operation::SetReservedSpace(self.clone()))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        let slot = slot_of(page, self.record, self.name())?;
        page.set_reserved_space(lsn, slot, self.old_reserved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::primitives::io::MemFileIo;
    use crate::store::container::{Container, CreateInfo};
    use crate::types::{ContainerKey, PageKey};
    use std::sync::Arc;

    fn container() -> Arc<Container> {
        Container::create(
            ContainerKey::new(0, 1),
            Arc::new(MemFileIo::new()),
            CreateInfo {
                page_size: 1024,
                alloc_extent_pages: 16,
                overflow_threshold: 50,
                temporary: false,
            },
        )
        .unwrap()
    }

    fn stored_page(container: &Container) -> Page {
        let mut page = Page::blank(PageKey::new(container.key(), 1), 1024);
        page.init_page(
            None,
            &PageFormat::Stored {
                overflow: false,
                next_record_id: RecordId::FIRST,
            },
        )
        .unwrap();
        for (slot, value) in [b"a", b"b", b"c"].iter().enumerate() {
            page.store_record(
                None,
                slot,
                StoredRecord::new(RecordId(6 + slot as u32), vec![Field::value(value.to_vec())]),
            )
            .unwrap();
        }
        page
    }

    fn apply_then_undo(op: &dyn Undoable, page: &mut Page, container: &Container, data: &[u8]) {
        let before = page.body_image();
        let version = page.version();
        op.do_me(Target::Page { page: &mut *page, container }, Some(Lsn(100)), data)
            .unwrap();
        assert_eq!(page.version(), version + 1);
        assert_ne!(page.body_image(), before);
        op.undo_me(Target::Page { page: &mut *page, container }, None, Some(Lsn(200)), data)
            .unwrap();
        assert_eq!(page.version(), version + 2);
        assert_eq!(page.body_image(), before);
    }

    #[test]
    fn purge_undo_restores_records() {
        let container = container();
        let mut page = stored_page(&container);
        let mut data = Vec::new();
        encode_images(&page.records()[1..3], &mut data);
        let op = Purge {
            header: PageOpHeader::for_page(&page),
            slot: 1,
            ids: SmallVec::from_slice(&[RecordId(7), RecordId(8)]),
        };
        apply_then_undo(&op, &mut page, &container, &data);
    }

    #[test]
    fn update_undo_restores_columns() {
        let container = container();
        let mut page = stored_page(&container);
        let old = page.record_at(0).unwrap().fields.clone();
        let mut data = Vec::new();
        Update::optional_data(&old, &[Field::Null, Field::value(b"zz".to_vec())], &mut data);
        let op = Update {
            header: PageOpHeader::for_page(&page),
            slot: 0,
            record: RecordId(6),
            start_column: 1,
        };
        apply_then_undo(&op, &mut page, &container, &data);
    }

    #[test]
    fn copy_rows_and_reserved_space_undo() {
        let container = container();
        let source = stored_page(&container);
        let mut dest = Page::blank(PageKey::new(container.key(), 2), 1024);
        dest.init_page(
            None,
            &PageFormat::Stored {
                overflow: false,
                next_record_id: RecordId::FIRST,
            },
        )
        .unwrap();
        let mut data = Vec::new();
        encode_images(&source.records()[..2], &mut data);
        let op = CopyRows {
            header: PageOpHeader::for_page(&dest),
            dest_slot: 0,
            num: 2,
        };
        apply_then_undo(&op, &mut dest, &container, &data);

        let mut page = stored_page(&container);
        let op = SetReservedSpace {
            header: PageOpHeader::for_page(&page),
            slot: 2,
            record: RecordId(8),
            new_reserved: 40,
            old_reserved: 0,
        };
        apply_then_undo(&op, &mut page, &container, &[]);
    }

    #[test]
    fn do_me_rejects_shifted_slot() {
        let container = container();
        let mut page = stored_page(&container);
        let op = SetReservedSpace {
            header: PageOpHeader::for_page(&page),
            slot: 0,
            record: RecordId(8),
            new_reserved: 4,
            old_reserved: 0,
        };
        let err = op
            .do_me(Target::Page { page: &mut page, container: &container }, None, &[])
            .unwrap_err();
        assert!(matches!(err, StoreError::Consistency(_)));
    }

    #[test]
    fn invalidate_round_trips_status() {
        let container = container();
        let mut page = stored_page(&container);
        let op = InvalidatePage {
            header: PageOpHeader::for_page(&page),
        };
        op.do_me(Target::Page { page: &mut page, container: &container }, None, &[])
            .unwrap();
        assert!(!page.is_valid());
        op.undo_me(Target::Page { page: &mut page, container: &container }, None, None, &[])
            .unwrap();
        assert!(page.is_valid());
    }
}
