#![forbid(unsafe_code)]
//! Allocation page operations.

use core::convert::TryFrom;

use super::{
    page_needs_redo, physical_undo, resolve_page, type_id, Group, Loggable, OpContext, Operation,
    PageOpHeader, PendingUndo, Resolved, Target, Undoable,
};
use crate::primitives::bytes::{buf::Cursor, var};
use crate::store::alloc::AllocStatus;
use crate::types::{Lsn, RecordId, Result, StoreError};

/// Changes the status of one page tracked by an allocation page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AllocPage {
    /// The allocation page.
    pub header: PageOpHeader,
    /// The tracked page.
    pub page_number: u64,
    /// Status the operation sets.
    pub do_status: AllocStatus,
    /// Status undo restores.
    pub undo_status: AllocStatus,
}

impl AllocPage {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            page_number: cur.read_var_u64()?,
            do_status: AllocStatus::try_from(cur.read_u8()?)?,
            undo_status: AllocStatus::try_from(cur.read_u8()?)?,
        })
    }
}

impl Loggable for AllocPage {
    fn type_id(&self) -> u16 {
        type_id::ALLOC_PAGE
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "alloc_page"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(self.page_number, out);
        out.push(self.do_status as u8);
        out.push(self.undo_status as u8);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        page.set_alloc_status(lsn, self.page_number, self.do_status)
            .map(|_| ())
    }
}

impl Undoable for AllocPage {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        physical_undo(ctx, &self.header, Operation::AllocPage(self.clone()))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        page.set_alloc_status(lsn, self.page_number, self.undo_status)
            .map(|_| ())
    }
}

/// Links a new allocation page after a full one.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChainAllocPage {
    /// The allocation page being linked from.
    pub header: PageOpHeader,
    /// Page number of the new allocation page.
    pub next_page: u64,
    /// File offset of the new allocation page.
    pub next_offset: u64,
}

impl ChainAllocPage {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            next_page: cur.read_var_u64()?,
            next_offset: cur.read_var_u64()?,
        })
    }
}

impl Loggable for ChainAllocPage {
    fn type_id(&self) -> u16 {
        type_id::CHAIN_ALLOC_PAGE
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "chain_alloc_page"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(self.next_page, out);
        var::encode_u64(self.next_offset, out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        page.chain_alloc_page(lsn, self.next_page, self.next_offset)
    }
}

impl Undoable for ChainAllocPage {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        physical_undo(ctx, &self.header, Operation::ChainAllocPage(self.clone()))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        page.unchain_alloc_page(lsn)
    }
}

/// Cuts trailing free pages off the last allocation extent and the file.
///
/// `new_highest` is relative to the extent's first page; -1 means no page
/// is kept. The legacy encoding stores it unsigned and cannot express -1.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CompressSpace {
    /// The last allocation page of the container.
    pub header: PageOpHeader,
    /// Last page kept, relative to the extent; -1 keeps none.
    pub new_highest: i64,
    /// Pages cut.
    pub truncated: u64,
    legacy: bool,
}

impl CompressSpace {
    /// A record in the current format.
    pub fn new(header: PageOpHeader, new_highest: i64, truncated: u64) -> Self {
        Self {
            header,
            new_highest,
            truncated,
            legacy: false,
        }
    }

    /// A record in the legacy format, as older logs hold.
    pub fn legacy(header: PageOpHeader, new_highest: i64, truncated: u64) -> Result<Self> {
        if new_highest < 0 {
            return Err(StoreError::Invalid("legacy compress cannot encode a negative page"));
        }
        Ok(Self {
            legacy: true,
            ..Self::new(header, new_highest, truncated)
        })
    }

    /// Whether the record uses the legacy encoding.
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    pub(crate) fn decode(cur: &mut Cursor<'_>, legacy: bool) -> Result<Self> {
        let header = PageOpHeader::decode(cur)?;
        let new_highest = if legacy {
            i64::try_from(cur.read_var_u64()?)
                .map_err(|_| StoreError::Corruption("compress page index out of range"))?
        } else {
            cur.read_var_i64()?
        };
        if new_highest < -1 {
            return Err(StoreError::Corruption("compress page index below -1"));
        }
        Ok(Self {
            header,
            new_highest,
            truncated: cur.read_var_u64()?,
            legacy,
        })
    }
}

impl Loggable for CompressSpace {
    fn type_id(&self) -> u16 {
        if self.legacy {
            type_id::COMPRESS_SPACE_LEGACY
        } else {
            type_id::COMPRESS_SPACE
        }
    }

    fn group(&self) -> Group {
        Group::RAWSTORE
    }

    fn name(&self) -> &'static str {
        "compress_space"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        if self.legacy {
            var::encode_u64(self.new_highest.max(0) as u64, out);
        } else {
            var::encode_i64(self.new_highest, out);
        }
        var::encode_u64(self.truncated, out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, container) = target.page(self.name())?;
        let extent = page.extent()?;
        if extent.next_alloc_page().is_some() {
            return Err(StoreError::consistency(format!(
                "compress of {} which is not the last allocation page",
                page.key()
            )));
        }
        let first_gone = extent.first_page() + (self.new_highest + 1) as u64;
        page.compress_alloc(lsn, self.new_highest, self.truncated)?;
        container.discard_pages_from(first_gone);
        Ok(())
    }
}

impl Undoable for CompressSpace {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        physical_undo(ctx, &self.header, Operation::CompressSpace(self.clone()))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let (page, _) = target.page(self.name())?;
        page.undo_compress_alloc(lsn, self.new_highest, self.truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::ops::PageOpHeader;
    use crate::types::{ContainerKey, PageKey};

    fn header() -> PageOpHeader {
        PageOpHeader {
            page: PageKey::new(ContainerKey::new(0, 2), 0),
            page_version: 3,
        }
    }

    #[test]
    fn legacy_compress_decodes_with_new_semantics() {
        let legacy = CompressSpace::legacy(header(), 10, 30).unwrap();
        let mut out = Vec::new();
        Operation::CompressSpace(legacy.clone()).encode(&mut out);
        let decoded = Operation::decode(&mut Cursor::new(&out)).unwrap();
        let Operation::CompressSpace(decoded) = decoded else {
            panic!("expected compress space");
        };
        assert!(decoded.is_legacy());
        assert_eq!(decoded.new_highest, 10);
        assert_eq!(decoded.truncated, 30);
        assert_eq!(decoded.type_id(), type_id::COMPRESS_SPACE_LEGACY);
    }

    #[test]
    fn legacy_rejects_negative_index() {
        assert!(CompressSpace::legacy(header(), -1, 4).is_err());
        let current = CompressSpace::new(header(), -1, 4);
        let mut out = Vec::new();
        current.encode_fields(&mut out);
        let decoded = CompressSpace::decode(&mut Cursor::new(&out), false).unwrap();
        assert_eq!(decoded.new_highest, -1);
    }
}
