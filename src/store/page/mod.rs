#![forbid(unsafe_code)]
//! In-memory pages.
//!
//! Every mutator takes the LSN of the log record it applies (`None` for
//! unlogged changes) and finishes through [`Page::log_action`], which bumps
//! the page version by one, records the LSN, and clears the pre-dirty mark.
//! Callers must hold the page latch for the whole call.

use std::sync::Arc;

use parking_lot::{lock_api::ArcMutexGuard, Mutex, RawMutex};

use crate::primitives::bytes::{buf::Cursor, var, ByteHolder};
use crate::store::alloc::{AllocExtent, AllocStatus};
use crate::types::page::{clear_crc32, PageHeader, PageKind, PAGE_HDR_LEN};
use crate::types::{page_crc32, Lsn, PageKey, RecordId, Result, StoreError};

mod record;

pub use record::{
    decode_fields, encode_fields, Field, RowLogOutcome, RowResume, StoredRecord, SLOT_SIZE,
};

/// Bytes reserved for the slot-table preamble of a stored page.
const STORED_BODY_OVERHEAD: usize = 16;
/// Room one record needs before its first column.
const RECORD_HEADER_ESTIMATE: usize = 16;

const STATUS_INVALID: u8 = 0;
const STATUS_VALID: u8 = 1;

/// Shared, latchable page frame.
pub type PageFrame = Arc<Mutex<Page>>;

/// Exclusive latch on a page. Dropping it unlatches.
pub type PageLatch = ArcMutexGuard<RawMutex, Page>;

/// Slot table of a stored page.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SlotTable {
    records: Vec<StoredRecord>,
    next_record_id: u32,
    overflow: bool,
}

impl SlotTable {
    fn new(next_record_id: RecordId, overflow: bool) -> Self {
        Self {
            records: Vec::new(),
            next_record_id: next_record_id.0,
            overflow,
        }
    }

    fn encode(&self, out: &mut Vec<u8>) {
        var::encode_u64(u64::from(self.next_record_id), out);
        out.push(u8::from(self.overflow));
        var::encode_u64(self.records.len() as u64, out);
        for record in &self.records {
            record.encode(out);
        }
    }

    fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let next_record_id = cur.read_var_u32()?;
        let overflow = match cur.read_u8()? {
            0 => false,
            1 => true,
            _ => return Err(StoreError::Corruption("bad overflow flag")),
        };
        let count = cur.read_var_u64()?;
        if count > cur.remaining() as u64 {
            return Err(StoreError::Corruption("slot count exceeds page"));
        }
        let records = (0..count)
            .map(|_| StoredRecord::decode(cur))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            records,
            next_record_id,
            overflow,
        })
    }

    fn used(&self) -> usize {
        self.records.iter().map(StoredRecord::space_used).sum()
    }
}

/// What a page holds.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageBody {
    /// Records.
    Stored(SlotTable),
    /// Allocation bookkeeping.
    Alloc(AllocExtent),
}

impl PageBody {
    fn kind(&self) -> PageKind {
        match self {
            PageBody::Stored(_) => PageKind::Stored,
            PageBody::Alloc(_) => PageKind::Alloc,
        }
    }
}

/// How [`Page::init_page`] formats a page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageFormat {
    /// Empty slotted page.
    Stored {
        /// Page holds overflow portions rather than row heads.
        overflow: bool,
        /// First record id to hand out.
        next_record_id: RecordId,
    },
    /// Empty allocation page.
    Alloc {
        /// First page managed.
        first_page: u64,
        /// Pages managed.
        capacity: u32,
    },
}

/// One page held in memory.
#[derive(Clone, Debug)]
pub struct Page {
    key: PageKey,
    page_size: u32,
    version: u64,
    last_lsn: Option<Lsn>,
    valid: bool,
    dirty: bool,
    pre_dirty: bool,
    body: PageBody,
}

impl Page {
    /// An invalid, never-written page at version 0.
    pub fn blank(key: PageKey, page_size: u32) -> Self {
        Self {
            key,
            page_size,
            version: 0,
            last_lsn: None,
            valid: false,
            dirty: false,
            pre_dirty: false,
            body: PageBody::Stored(SlotTable::default()),
        }
    }

    /// Key of this page.
    pub fn key(&self) -> PageKey {
        self.key
    }

    /// Page size in bytes.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Number of changes applied since the page was first created.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// LSN of the last logged change, if any.
    pub fn last_lsn(&self) -> Option<Lsn> {
        self.last_lsn
    }

    /// Whether the page is formatted and in use.
    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Stored or allocation page.
    pub fn kind(&self) -> PageKind {
        self.body.kind()
    }

    /// Changed since last written.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    /// About to change under a log record not yet applied.
    pub fn is_pre_dirty(&self) -> bool {
        self.pre_dirty
    }

    /// Marks the page as about to change. Must precede the log append.
    pub fn pre_dirty(&mut self) {
        self.pre_dirty = true;
    }

    pub(crate) fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Lifts the version to at least `floor` without counting a change.
    pub(crate) fn raise_version(&mut self, floor: u64) {
        self.version = self.version.max(floor);
    }

    /// Records that a change was applied.
    pub fn log_action(&mut self, lsn: Option<Lsn>) {
        self.version += 1;
        if lsn.is_some() {
            self.last_lsn = lsn;
        }
        self.dirty = true;
        self.pre_dirty = false;
    }

    /// Page body.
    pub fn body(&self) -> &PageBody {
        &self.body
    }

    fn slots(&self) -> Result<&SlotTable> {
        match &self.body {
            PageBody::Stored(slots) => Ok(slots),
            PageBody::Alloc(_) => Err(StoreError::Invalid("not a stored page")),
        }
    }

    fn slots_mut(&mut self) -> Result<&mut SlotTable> {
        match &mut self.body {
            PageBody::Stored(slots) => Ok(slots),
            PageBody::Alloc(_) => Err(StoreError::Invalid("not a stored page")),
        }
    }

    /// Allocation extent of an allocation page.
    pub fn extent(&self) -> Result<&AllocExtent> {
        match &self.body {
            PageBody::Alloc(extent) => Ok(extent),
            PageBody::Stored(_) => Err(StoreError::Invalid("not an allocation page")),
        }
    }

    fn extent_mut(&mut self) -> Result<&mut AllocExtent> {
        match &mut self.body {
            PageBody::Alloc(extent) => Ok(extent),
            PageBody::Stored(_) => Err(StoreError::Invalid("not an allocation page")),
        }
    }

    // ---- slot queries ----

    /// Number of records, deleted ones included.
    pub fn slot_count(&self) -> usize {
        self.slots().map(|s| s.records.len()).unwrap_or(0)
    }

    /// Records in slot order.
    pub fn records(&self) -> &[StoredRecord] {
        self.slots().map(|s| s.records.as_slice()).unwrap_or(&[])
    }

    /// Record at `slot`.
    pub fn record_at(&self, slot: usize) -> Result<&StoredRecord> {
        self.slots()?
            .records
            .get(slot)
            .ok_or(StoreError::Invalid("slot out of range"))
    }

    /// Slot currently holding `id`.
    pub fn find_record_by_id(&self, id: RecordId) -> Option<usize> {
        self.records().iter().position(|r| r.id == id)
    }

    /// Id the next inserted record should receive.
    pub fn next_record_id(&self) -> Result<RecordId> {
        Ok(RecordId(self.slots()?.next_record_id))
    }

    /// Whether the page holds overflow portions.
    pub fn is_overflow(&self) -> bool {
        self.slots().map(|s| s.overflow).unwrap_or(false)
    }

    /// True when every record on the page carries the delete mark.
    pub fn all_deleted(&self) -> bool {
        self.records().iter().all(|r| r.deleted)
    }

    /// Bytes still available for records.
    pub fn free_space(&self) -> usize {
        match &self.body {
            PageBody::Stored(slots) => self.usable_space().saturating_sub(slots.used()),
            PageBody::Alloc(_) => 0,
        }
    }

    /// Largest column a row starting on this page can keep inline: bounded
    /// by the free space and by the long-column threshold.
    pub fn max_inline_column(&self, overflow_threshold: u8) -> usize {
        let space = self
            .free_space()
            .saturating_sub(SLOT_SIZE + RECORD_HEADER_ESTIMATE);
        space.min(self.usable_space() * usize::from(overflow_threshold) / 100)
    }

    fn usable_space(&self) -> usize {
        (self.page_size as usize).saturating_sub(PAGE_HDR_LEN + STORED_BODY_OVERHEAD)
    }

    fn ensure_space(&self, needed: usize) -> Result<()> {
        let available = self.free_space();
        if needed > available {
            return Err(StoreError::NoSpace {
                page: self.key,
                needed,
                available,
            });
        }
        Ok(())
    }

    /// Checks that `records` could be inserted at `slot` without changing
    /// anything: the slot is in range, no id is already on the page, and the
    /// page has room.
    pub fn check_insert_space(&self, slot: usize, records: &[StoredRecord]) -> Result<()> {
        if slot > self.slot_count() {
            return Err(StoreError::Invalid("insert slot out of range"));
        }
        if let Some(dup) = records.iter().find(|r| self.find_record_by_id(r.id).is_some()) {
            return Err(StoreError::consistency(format!(
                "record id {} already on {}",
                dup.id, self.key
            )));
        }
        self.ensure_space(records.iter().map(StoredRecord::space_used).sum())
    }

    /// Columns of the record at `slot` once those from `start_column` on
    /// are replaced by `new_columns`.
    pub fn updated_columns(&self, slot: usize, start_column: usize, new_columns: &[Field]) -> Result<Vec<Field>> {
        let mut fields = self.record_at(slot)?.fields.clone();
        fields.resize(start_column, Field::Null);
        fields.extend_from_slice(new_columns);
        Ok(fields)
    }

    /// Columns of the record at `slot` with column `field_id` replaced,
    /// padded with nulls if the record is shorter.
    pub fn updated_field(&self, slot: usize, field_id: usize, field: &Field) -> Result<Vec<Field>> {
        let mut fields = self.record_at(slot)?.fields.clone();
        if field_id >= fields.len() {
            fields.resize(field_id + 1, Field::Null);
        }
        fields[field_id] = field.clone();
        Ok(fields)
    }

    /// Checks that the record at `slot` could take `fields` as its columns.
    pub fn check_fields_space(&self, slot: usize, fields: &[Field]) -> Result<()> {
        let record = self.record_at(slot)?;
        let mut updated = record.clone();
        updated.fields = fields.to_vec();
        self.ensure_space(updated.space_used().saturating_sub(record.space_used()))
    }

    /// Checks a row update from `start_column` on.
    pub fn check_update_space(&self, slot: usize, start_column: usize, new_columns: &[Field]) -> Result<()> {
        self.check_fields_space(slot, &self.updated_columns(slot, start_column, new_columns)?)
    }

    /// Checks a single column update.
    pub fn check_field_space(&self, slot: usize, field_id: usize, field: &Field) -> Result<()> {
        self.check_fields_space(slot, &self.updated_field(slot, field_id, field)?)
    }

    // ---- slot mutators ----

    /// Inserts `record` at `slot`, shifting later slots up.
    pub fn store_record(&mut self, lsn: Option<Lsn>, slot: usize, record: StoredRecord) -> Result<()> {
        self.check_insert_space(slot, std::slice::from_ref(&record))?;
        let slots = self.slots_mut()?;
        slots.next_record_id = slots.next_record_id.max(record.id.0 + 1);
        slots.records.insert(slot, record);
        self.log_action(lsn);
        Ok(())
    }

    /// Removes the record at `slot`, shifting later slots down.
    pub fn purge_record(&mut self, lsn: Option<Lsn>, slot: usize) -> Result<StoredRecord> {
        self.record_at(slot)?;
        let record = self.slots_mut()?.records.remove(slot);
        self.log_action(lsn);
        Ok(record)
    }

    /// Inserts `records` at `slot` onwards as a single change.
    pub fn store_records(&mut self, lsn: Option<Lsn>, slot: usize, records: Vec<StoredRecord>) -> Result<()> {
        self.check_insert_space(slot, &records)?;
        let slots = self.slots_mut()?;
        for (offset, record) in records.into_iter().enumerate() {
            slots.next_record_id = slots.next_record_id.max(record.id.0 + 1);
            slots.records.insert(slot + offset, record);
        }
        self.log_action(lsn);
        Ok(())
    }

    /// Removes `num` records from `slot` onwards as a single change.
    pub fn purge_records(&mut self, lsn: Option<Lsn>, slot: usize, num: usize) -> Result<Vec<StoredRecord>> {
        if slot + num > self.slot_count() {
            return Err(StoreError::Invalid("purge range out of range"));
        }
        let removed = self.slots_mut()?.records.drain(slot..slot + num).collect();
        self.log_action(lsn);
        Ok(removed)
    }

    /// Sets or clears the delete mark.
    pub fn set_delete_status(&mut self, lsn: Option<Lsn>, slot: usize, deleted: bool) -> Result<()> {
        self.record_at(slot)?;
        self.slots_mut()?.records[slot].deleted = deleted;
        self.log_action(lsn);
        Ok(())
    }

    /// Replaces one column, padding with nulls if the record is shorter.
    pub fn store_field(&mut self, lsn: Option<Lsn>, slot: usize, field_id: usize, field: Field) -> Result<()> {
        let fields = self.updated_field(slot, field_id, &field)?;
        self.set_fields(lsn, slot, fields)
    }

    /// Replaces the whole column list of a record.
    pub fn set_fields(&mut self, lsn: Option<Lsn>, slot: usize, fields: Vec<Field>) -> Result<()> {
        self.check_fields_space(slot, &fields)?;
        self.slots_mut()?.records[slot].fields = fields;
        self.log_action(lsn);
        Ok(())
    }

    /// Sets the reserved space of a record.
    pub fn set_reserved_space(&mut self, lsn: Option<Lsn>, slot: usize, reserved: u32) -> Result<()> {
        let current = self.record_at(slot)?.reserved;
        self.ensure_space(reserved.saturating_sub(current) as usize)?;
        self.slots_mut()?.records[slot].reserved = reserved;
        self.log_action(lsn);
        Ok(())
    }

    // ---- page-level mutators ----

    /// Formats the page and marks it valid.
    pub fn init_page(&mut self, lsn: Option<Lsn>, format: &PageFormat) -> Result<()> {
        self.body = match format {
            PageFormat::Stored {
                overflow,
                next_record_id,
            } => PageBody::Stored(SlotTable::new(*next_record_id, *overflow)),
            PageFormat::Alloc {
                first_page,
                capacity,
            } => PageBody::Alloc(AllocExtent::new(*first_page, *capacity)),
        };
        self.valid = true;
        self.log_action(lsn);
        Ok(())
    }

    /// Marks the page valid or invalid.
    pub fn set_page_status(&mut self, lsn: Option<Lsn>, valid: bool) -> Result<()> {
        self.valid = valid;
        self.log_action(lsn);
        Ok(())
    }

    // ---- allocation mutators ----

    /// Sets the status of a page tracked here. Returns the previous status.
    pub fn set_alloc_status(&mut self, lsn: Option<Lsn>, page: u64, status: AllocStatus) -> Result<AllocStatus> {
        let prev = self.extent_mut()?.set_status(page, status)?;
        self.log_action(lsn);
        Ok(prev)
    }

    /// Links the next allocation page.
    pub fn chain_alloc_page(&mut self, lsn: Option<Lsn>, next_page: u64, next_offset: u64) -> Result<()> {
        self.extent_mut()?.chain(next_page, next_offset);
        self.log_action(lsn);
        Ok(())
    }

    /// Removes the link to the next allocation page.
    pub fn unchain_alloc_page(&mut self, lsn: Option<Lsn>) -> Result<()> {
        self.extent_mut()?.unchain();
        self.log_action(lsn);
        Ok(())
    }

    /// Shrinks the extent. See [`AllocExtent::compress`].
    pub fn compress_alloc(&mut self, lsn: Option<Lsn>, new_highest: i64, truncated: u64) -> Result<()> {
        self.extent_mut()?.compress(new_highest, truncated)?;
        self.log_action(lsn);
        Ok(())
    }

    /// Regrows the extent. See [`AllocExtent::undo_compress`].
    pub fn undo_compress_alloc(&mut self, lsn: Option<Lsn>, new_highest: i64, truncated: u64) -> Result<()> {
        self.extent_mut()?.undo_compress(new_highest, truncated)?;
        self.log_action(lsn);
        Ok(())
    }

    // ---- log encoders ----

    /// Image of the record at `slot`, as carried in log records.
    pub fn log_record(&self, slot: usize) -> Result<Vec<u8>> {
        Ok(self.record_at(slot)?.to_bytes())
    }

    /// One column of the record at `slot`; missing columns read as null.
    pub fn log_field(&self, slot: usize, field_id: usize) -> Result<Field> {
        Ok(self
            .record_at(slot)?
            .fields
            .get(field_id)
            .cloned()
            .unwrap_or(Field::Null))
    }

    /// Lays out `row[start_column..]` against the free space on this page.
    ///
    /// `space_for_record` is the room the record may take, normally
    /// [`Page::free_space`]. Columns are encoded into `out` until one does not
    /// fit. A column longer than `overflow_threshold` percent of the page
    /// yields [`RowLogOutcome::LongColumn`], carrying the columns encoded so
    /// far. When `resume` is given its buffered columns are reused verbatim
    /// and encoding continues at its `next_column`.
    ///
    /// Returns the outcome and the number of columns written to `out`.
    pub fn log_row(
        &self,
        row: &[Field],
        start_column: usize,
        resume: Option<RowResume>,
        overflow_threshold: u8,
        out: &mut Vec<u8>,
    ) -> Result<(RowLogOutcome, usize)> {
        let mut space = self
            .free_space()
            .saturating_sub(SLOT_SIZE + RECORD_HEADER_ESTIMATE);
        let long_limit = self.usable_space() * usize::from(overflow_threshold) / 100;
        let mut column = start_column;
        let mut logged = 0usize;
        if let Some(resume) = resume {
            let prefix = resume.buffer.as_slice();
            if prefix.len() > space {
                return Err(StoreError::NoSpace {
                    page: self.key,
                    needed: prefix.len(),
                    available: space,
                });
            }
            out.extend_from_slice(prefix);
            space -= prefix.len();
            logged = resume.next_column.saturating_sub(start_column);
            column = resume.next_column;
        }
        while column < row.len() {
            let len = row[column].encoded_len();
            if len > long_limit {
                let mut buffer = ByteHolder::with_capacity(out.len());
                buffer.write_slice(out)?;
                return Ok((
                    RowLogOutcome::LongColumn(RowResume {
                        buffer,
                        next_column: column,
                        remaining_space: space,
                    }),
                    logged,
                ));
            }
            if len > space {
                if logged == 0 {
                    return Err(StoreError::NoSpace {
                        page: self.key,
                        needed: len + SLOT_SIZE + RECORD_HEADER_ESTIMATE,
                        available: self.free_space(),
                    });
                }
                return Ok((RowLogOutcome::Split { next_column: column }, logged));
            }
            row[column].encode(out);
            space -= len;
            logged += 1;
            column += 1;
        }
        Ok((RowLogOutcome::Complete, logged))
    }

    // ---- images ----

    /// Encoded contents without version, LSN, or the record id counter,
    /// which only ever moves forward.
    pub fn body_image(&self) -> Vec<u8> {
        let mut out = vec![u8::from(self.valid)];
        match &self.body {
            PageBody::Stored(slots) => {
                out.push(u8::from(slots.overflow));
                for record in &slots.records {
                    record.encode(&mut out);
                }
            }
            PageBody::Alloc(extent) => extent.encode(&mut out),
        }
        out
    }

    /// Full on-disk image, `page_size` bytes long.
    pub fn encode_image(&self) -> Result<Vec<u8>> {
        let mut body = Vec::new();
        match &self.body {
            PageBody::Stored(slots) => slots.encode(&mut body),
            PageBody::Alloc(extent) => extent.encode(&mut body),
        }
        let page_size = self.page_size as usize;
        if PAGE_HDR_LEN + body.len() > page_size {
            return Err(StoreError::consistency(format!(
                "{} body of {} bytes overflows the page",
                self.key,
                body.len()
            )));
        }
        let mut image = vec![0u8; page_size];
        let header = PageHeader {
            kind: self.body.kind(),
            status: if self.valid { STATUS_VALID } else { STATUS_INVALID },
            page_size: self.page_size,
            page_no: self.key.page_number,
            version: self.version,
            last_lsn: self.last_lsn,
            body_len: body.len() as u32,
            crc32: 0,
        };
        header.encode(&mut image)?;
        image[PAGE_HDR_LEN..PAGE_HDR_LEN + body.len()].copy_from_slice(&body);
        let crc = page_crc32(self.key.container, self.key.page_number, &image);
        PageHeader { crc32: crc, ..header }.encode(&mut image)?;
        Ok(image)
    }

    /// Parses an on-disk image.
    pub fn decode_image(key: PageKey, image: &[u8]) -> Result<Self> {
        let header = PageHeader::decode(image)?;
        if header.page_size as usize != image.len() {
            return Err(StoreError::Corruption("page size mismatch"));
        }
        if header.page_no != key.page_number {
            return Err(StoreError::Corruption("page number mismatch"));
        }
        let mut scratch = image.to_vec();
        clear_crc32(&mut scratch)?;
        if page_crc32(key.container, key.page_number, &scratch) != header.crc32 {
            return Err(StoreError::Corruption("page crc mismatch"));
        }
        let body_end = PAGE_HDR_LEN + header.body_len as usize;
        let body = image
            .get(PAGE_HDR_LEN..body_end)
            .ok_or(StoreError::Corruption("page body length out of range"))?;
        let mut cur = Cursor::new(body);
        let body = match header.kind {
            PageKind::Stored => PageBody::Stored(SlotTable::decode(&mut cur)?),
            PageKind::Alloc => PageBody::Alloc(AllocExtent::decode(&mut cur)?),
        };
        cur.finish()?;
        let valid = match header.status {
            STATUS_VALID => true,
            STATUS_INVALID => false,
            _ => return Err(StoreError::Corruption("unknown page status")),
        };
        Ok(Self {
            key,
            page_size: header.page_size,
            version: header.version,
            last_lsn: header.last_lsn,
            valid,
            dirty: false,
            pre_dirty: false,
            body,
        })
    }
}
