#![forbid(unsafe_code)]
//! Loggable operations.
//!
//! Every change to a page or container is an [`Operation`]: it is encoded
//! into the log, applied with [`Loggable::do_me`], replayed during recovery
//! when [`Loggable::needs_redo`] says so, and rolled back through a
//! compensation record built by [`Undoable::generate_undo`].
//!
//! Operations capture the version of their target *before* they apply.
//! Applying bumps the version by exactly one, so during redo
//! `live == logged` means "not yet applied" and `live > logged` means
//! "already there".
//!
//! Optional data (row images and the like) travels next to the operation in
//! the log record rather than inside it, and is handed to `do_me` and
//! `undo_me` as a byte slice.

use std::sync::Arc;

use bitflags::bitflags;
use tracing::error;

use crate::primitives::bytes::{buf::Cursor, var};
use crate::store::container::{Container, ContainerRegistry};
use crate::store::page::{Page, PageLatch};
use crate::types::{ContainerKey, Lsn, PageKey, RecordId, Result, StoreError, VersionedObject};

mod alloc;
mod compensation;
mod container;
mod logical;
mod page;

pub use alloc::{AllocPage, ChainAllocPage, CompressSpace};
pub use compensation::{ContainerUndoOp, LogicalUndoOp, PhysicalUndoOp};
pub use container::{ContainerAction, ContainerOp};
pub use logical::{Delete, Insert, InsertFlags, LogicalUndo, UndoRegistry, UpdateField};
pub use page::{CopyRows, InitPage, InvalidatePage, Purge, SetReservedSpace, Update};

pub(crate) use logical::put_row_image;
pub(crate) use page::encode_images;

/// Wire identifiers, one per operation format.
pub mod type_id {
    #![allow(missing_docs)]

    pub const INIT_PAGE: u16 = 101;
    pub const INVALIDATE_PAGE: u16 = 102;
    pub const INSERT: u16 = 103;
    pub const DELETE: u16 = 104;
    pub const UPDATE_FIELD: u16 = 105;
    pub const UPDATE: u16 = 106;
    pub const PURGE: u16 = 107;
    pub const COPY_ROWS: u16 = 108;
    pub const SET_RESERVED_SPACE: u16 = 109;
    pub const ALLOC_PAGE: u16 = 120;
    pub const CHAIN_ALLOC_PAGE: u16 = 121;
    /// Compress-space record that cannot express a negative page index.
    pub const COMPRESS_SPACE_LEGACY: u16 = 122;
    pub const COMPRESS_SPACE: u16 = 123;
    pub const CONTAINER: u16 = 130;
    pub const PHYSICAL_UNDO: u16 = 140;
    pub const LOGICAL_UNDO: u16 = 141;
    pub const CONTAINER_UNDO: u16 = 142;
}

bitflags! {
    /// Classification the log uses to decide what to do with a record.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Group: u32 {
        /// Belongs to the page and container layer.
        const RAWSTORE = 0x01;
        /// A compensation record; never undone.
        const COMPENSATION = 0x02;
        /// Creates or deletes files.
        const FILE_RESOURCE = 0x04;
    }
}

/// Identity and captured version of the page an operation targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageOpHeader {
    /// Target page.
    pub page: PageKey,
    /// Page version before the operation applied.
    pub page_version: u64,
}

impl PageOpHeader {
    /// Header for a change about to be applied to `page`.
    pub fn for_page(page: &Page) -> Self {
        Self {
            page: page.key(),
            page_version: page.version(),
        }
    }

    pub(crate) fn encode(&self, out: &mut Vec<u8>) {
        encode_container_key(self.page.container, out);
        var::encode_u64(self.page.page_number, out);
        var::encode_u64(self.page_version, out);
    }

    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let container = decode_container_key(cur)?;
        Ok(Self {
            page: PageKey::new(container, cur.read_var_u64()?),
            page_version: cur.read_var_u64()?,
        })
    }
}

pub(crate) fn encode_container_key(key: ContainerKey, out: &mut Vec<u8>) {
    var::encode_u64(u64::from(key.segment), out);
    var::encode_u64(key.container, out);
}

pub(crate) fn decode_container_key(cur: &mut Cursor<'_>) -> Result<ContainerKey> {
    Ok(ContainerKey::new(cur.read_var_u32()?, cur.read_var_u64()?))
}

/// Collaborators an operation needs to find its target.
#[derive(Clone, Copy)]
pub struct OpContext<'a> {
    /// Open containers.
    pub registry: &'a ContainerRegistry,
    /// Logical undo callbacks.
    pub undo: &'a UndoRegistry,
}

/// What an operation is applied to. Borrowed for exactly one call.
pub enum Target<'a> {
    /// A latched page and its container.
    Page {
        /// The page; its latch is held by the caller.
        page: &'a mut Page,
        /// Owning container.
        container: &'a Container,
    },
    /// A container, absent when it has not been created yet.
    Container {
        /// The container, if open.
        container: Option<&'a Arc<Container>>,
        /// Registry for creating and removing containers.
        registry: &'a ContainerRegistry,
    },
}

impl<'a> Target<'a> {
    pub(crate) fn page(self, op: &'static str) -> Result<(&'a mut Page, &'a Container)> {
        match self {
            Target::Page { page, container } => Ok((page, container)),
            Target::Container { .. } => Err(StoreError::consistency(format!(
                "{op} applied to a container target"
            ))),
        }
    }
}

/// Handles an operation opened while resolving its target. Dropping or
/// [`Resolved::release`]-ing it unlatches the page and lets go of the
/// container; releasing twice is harmless.
#[derive(Default)]
pub struct Resolved {
    container: Option<Arc<Container>>,
    page: Option<PageLatch>,
}

impl Resolved {
    /// Nothing resolved: the target no longer exists.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A container without a page.
    pub fn container(container: Arc<Container>) -> Self {
        Self {
            container: Some(container),
            page: None,
        }
    }

    /// A latched page in `container`.
    pub fn page(container: Arc<Container>, page: PageLatch) -> Self {
        Self {
            container: Some(container),
            page: Some(page),
        }
    }

    /// The latched page, for page operations.
    pub fn latched_page(&self) -> Option<&Page> {
        self.page.as_deref()
    }

    /// The container the target lives in.
    pub fn open_container(&self) -> Option<&Arc<Container>> {
        self.container.as_ref()
    }

    /// Borrows the resolved target.
    pub fn target<'a>(&'a mut self, registry: &'a ContainerRegistry) -> Result<Target<'a>> {
        match (&mut self.page, &self.container) {
            (Some(page), Some(container)) => Ok(Target::Page {
                page: &mut **page,
                container: container.as_ref(),
            }),
            (Some(_), None) => Err(StoreError::consistency("page resolved without its container")),
            (None, container) => Ok(Target::Container {
                container: container.as_ref(),
                registry,
            }),
        }
    }

    /// Unlatches and closes whatever was opened.
    pub fn release(&mut self) {
        self.page = None;
        self.container = None;
    }
}

/// A compensation record ready to be logged, with its target latched and
/// marked pre-dirty.
pub struct PendingUndo {
    /// The compensation record; carries the operation it undoes.
    pub clr: Operation,
    /// Latched target for the compensation's `do_me`.
    pub resolved: Resolved,
}

/// A recoverable unit of change.
pub trait Loggable {
    /// Wire identifier.
    fn type_id(&self) -> u16;
    /// Log classification.
    fn group(&self) -> Group;
    /// Short name for log events.
    fn name(&self) -> &'static str;
    /// Encodes the fixed fields, without the type id.
    fn encode_fields(&self, out: &mut Vec<u8>);
    /// Opens and latches the target for redo.
    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved>;
    /// Whether the resolved target still lacks this change.
    fn needs_redo(&self, resolved: &Resolved) -> Result<bool>;
    /// Applies the change. The caller has checked versions where needed.
    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, data: &[u8]) -> Result<()>;
    /// Lets go of anything `resolve` or `generate_undo` opened.
    fn release_resource(&self, resolved: &mut Resolved) {
        resolved.release();
    }
}

/// An operation that can be rolled back.
pub trait Undoable: Loggable {
    /// Latches the undo target and builds the compensation record. Returns
    /// `None` for operations whose effect cannot be taken back.
    fn generate_undo(&self, ctx: &OpContext<'_>, data: &[u8]) -> Result<Option<PendingUndo>>;
    /// Reverses the change on `target`. Logical operations receive the
    /// record id they were re-resolved to.
    fn undo_me(
        &self,
        target: Target<'_>,
        record: Option<RecordId>,
        lsn: Option<Lsn>,
        data: &[u8],
    ) -> Result<()>;
}

/// Every operation the log can hold.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Operation {
    /// Formats a page.
    InitPage(InitPage),
    /// Marks a page invalid.
    InvalidatePage(InvalidatePage),
    /// Inserts a record.
    Insert(Insert),
    /// Sets or clears a delete mark.
    Delete(Delete),
    /// Replaces one column.
    UpdateField(UpdateField),
    /// Replaces columns from a start column on.
    Update(Update),
    /// Removes records outright.
    Purge(Purge),
    /// Copies records onto a page.
    CopyRows(CopyRows),
    /// Changes reserved space of a record.
    SetReservedSpace(SetReservedSpace),
    /// Changes an allocation status.
    AllocPage(AllocPage),
    /// Links the next allocation page.
    ChainAllocPage(ChainAllocPage),
    /// Cuts trailing free pages.
    CompressSpace(CompressSpace),
    /// Create, drop or remove of a whole container.
    Container(ContainerOp),
    /// Compensation for a physical page operation.
    PhysicalUndo(PhysicalUndoOp),
    /// Compensation for a logical page operation.
    LogicalUndo(LogicalUndoOp),
    /// Compensation for a container operation.
    ContainerUndo(ContainerUndoOp),
}

macro_rules! dispatch {
    ($self:expr, $op:ident => $body:expr) => {
        match $self {
            Operation::InitPage($op) => $body,
            Operation::InvalidatePage($op) => $body,
            Operation::Insert($op) => $body,
            Operation::Delete($op) => $body,
            Operation::UpdateField($op) => $body,
            Operation::Update($op) => $body,
            Operation::Purge($op) => $body,
            Operation::CopyRows($op) => $body,
            Operation::SetReservedSpace($op) => $body,
            Operation::AllocPage($op) => $body,
            Operation::ChainAllocPage($op) => $body,
            Operation::CompressSpace($op) => $body,
            Operation::Container($op) => $body,
            Operation::PhysicalUndo($op) => $body,
            Operation::LogicalUndo($op) => $body,
            Operation::ContainerUndo($op) => $body,
        }
    };
}

impl Operation {
    /// Appends the type id and fields.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.type_id().to_be_bytes());
        self.encode_fields(out);
    }

    /// Reads one operation.
    pub fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(match cur.read_u16()? {
            type_id::INIT_PAGE => Operation::InitPage(InitPage::decode(cur)?),
            type_id::INVALIDATE_PAGE => Operation::InvalidatePage(InvalidatePage::decode(cur)?),
            type_id::INSERT => Operation::Insert(Insert::decode(cur)?),
            type_id::DELETE => Operation::Delete(Delete::decode(cur)?),
            type_id::UPDATE_FIELD => Operation::UpdateField(UpdateField::decode(cur)?),
            type_id::UPDATE => Operation::Update(Update::decode(cur)?),
            type_id::PURGE => Operation::Purge(Purge::decode(cur)?),
            type_id::COPY_ROWS => Operation::CopyRows(CopyRows::decode(cur)?),
            type_id::SET_RESERVED_SPACE => {
                Operation::SetReservedSpace(SetReservedSpace::decode(cur)?)
            }
            type_id::ALLOC_PAGE => Operation::AllocPage(AllocPage::decode(cur)?),
            type_id::CHAIN_ALLOC_PAGE => Operation::ChainAllocPage(ChainAllocPage::decode(cur)?),
            type_id::COMPRESS_SPACE => Operation::CompressSpace(CompressSpace::decode(cur, false)?),
            type_id::COMPRESS_SPACE_LEGACY => {
                Operation::CompressSpace(CompressSpace::decode(cur, true)?)
            }
            type_id::CONTAINER => Operation::Container(ContainerOp::decode(cur)?),
            type_id::PHYSICAL_UNDO => Operation::PhysicalUndo(PhysicalUndoOp::decode(cur)?),
            type_id::LOGICAL_UNDO => Operation::LogicalUndo(LogicalUndoOp::decode(cur)?),
            type_id::CONTAINER_UNDO => Operation::ContainerUndo(ContainerUndoOp::decode(cur)?),
            _ => return Err(StoreError::Corruption("unknown operation type")),
        })
    }

    /// The undo side of this operation, `None` for compensation records.
    pub fn as_undoable(&self) -> Option<&dyn Undoable> {
        let op: &dyn Undoable = match self {
            Operation::InitPage(op) => op,
            Operation::InvalidatePage(op) => op,
            Operation::Insert(op) => op,
            Operation::Delete(op) => op,
            Operation::UpdateField(op) => op,
            Operation::Update(op) => op,
            Operation::Purge(op) => op,
            Operation::CopyRows(op) => op,
            Operation::SetReservedSpace(op) => op,
            Operation::AllocPage(op) => op,
            Operation::ChainAllocPage(op) => op,
            Operation::CompressSpace(op) => op,
            Operation::Container(op) => op,
            Operation::PhysicalUndo(_) | Operation::LogicalUndo(_) | Operation::ContainerUndo(_) => {
                return None
            }
        };
        Some(op)
    }

    /// Attaches the operation a compensation record undoes. Needed after a
    /// compensation record is read back from the log, since only the LSN of
    /// the undone record is persisted.
    pub fn attach_undo_op(&mut self, undone: Operation) -> Result<()> {
        match self {
            Operation::PhysicalUndo(clr) => clr.undo_op = Some(Box::new(undone)),
            Operation::LogicalUndo(clr) => clr.undo_op = Some(Box::new(undone)),
            Operation::ContainerUndo(clr) => clr.undo_op = Some(Box::new(undone)),
            _ => return Err(StoreError::Invalid("not a compensation record")),
        }
        Ok(())
    }

    /// Page this operation targets, if it is page-scoped.
    pub fn page_key(&self) -> Option<PageKey> {
        match self {
            Operation::InitPage(op) => Some(op.header.page),
            Operation::InvalidatePage(op) => Some(op.header.page),
            Operation::Insert(op) => Some(op.header.page),
            Operation::Delete(op) => Some(op.header.page),
            Operation::UpdateField(op) => Some(op.header.page),
            Operation::Update(op) => Some(op.header.page),
            Operation::Purge(op) => Some(op.header.page),
            Operation::CopyRows(op) => Some(op.header.page),
            Operation::SetReservedSpace(op) => Some(op.header.page),
            Operation::AllocPage(op) => Some(op.header.page),
            Operation::ChainAllocPage(op) => Some(op.header.page),
            Operation::CompressSpace(op) => Some(op.header.page),
            Operation::PhysicalUndo(op) => Some(op.header.page),
            Operation::LogicalUndo(op) => Some(op.header.page),
            Operation::Container(_) | Operation::ContainerUndo(_) => None,
        }
    }
}

impl Loggable for Operation {
    fn type_id(&self) -> u16 {
        dispatch!(self, op => op.type_id())
    }

    fn group(&self) -> Group {
        dispatch!(self, op => op.group())
    }

    fn name(&self) -> &'static str {
        dispatch!(self, op => op.name())
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        dispatch!(self, op => op.encode_fields(out))
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        dispatch!(self, op => op.resolve(ctx))
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        dispatch!(self, op => op.needs_redo(resolved))
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        dispatch!(self, op => op.do_me(target, lsn, data))
    }

    fn release_resource(&self, resolved: &mut Resolved) {
        dispatch!(self, op => op.release_resource(resolved))
    }
}

/// Redo decision from a logged and a live version.
pub(crate) fn version_gate(object: VersionedObject, logged: u64, live: u64) -> Result<bool> {
    match live.cmp(&logged) {
        std::cmp::Ordering::Equal => Ok(true),
        std::cmp::Ordering::Greater => Ok(false),
        std::cmp::Ordering::Less => {
            error!(%object, logged, live, "ops.redo.missing_log_record");
            Err(StoreError::MissingLogRecord {
                object,
                logged,
                live,
            })
        }
    }
}

/// Latches the page named by `header` for redo. A container that no longer
/// exists resolves to nothing, which skips the record.
pub(crate) fn resolve_page(ctx: &OpContext<'_>, header: &PageOpHeader, may_be_blank: bool) -> Result<Resolved> {
    let Some(container) = ctx.registry.find(header.page.container) else {
        return Ok(Resolved::empty());
    };
    let page = if may_be_blank {
        container.latch_or_blank(header.page.page_number)?
    } else {
        container.latch_page(header.page.page_number)?
    };
    Ok(Resolved::page(container, page))
}

pub(crate) fn page_needs_redo(header: &PageOpHeader, resolved: &Resolved) -> Result<bool> {
    match resolved.latched_page() {
        Some(page) => version_gate(
            VersionedObject::Page(header.page),
            header.page_version,
            page.version(),
        ),
        None => Ok(false),
    }
}

/// Latches the original page for a physical undo and builds the
/// compensation record around `original`.
pub(crate) fn physical_undo(
    ctx: &OpContext<'_>,
    header: &PageOpHeader,
    original: Operation,
) -> Result<Option<PendingUndo>> {
    let container = ctx.registry.get(header.page.container)?;
    let mut page = container.latch_page(header.page.page_number)?;
    page.pre_dirty();
    let clr = PhysicalUndoOp::new(PageOpHeader::for_page(&page), original);
    Ok(Some(PendingUndo {
        clr: Operation::PhysicalUndo(clr),
        resolved: Resolved::page(container, page),
    }))
}
