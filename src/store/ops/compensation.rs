#![forbid(unsafe_code)]
//! Compensation records.
//!
//! A compensation record (CLR) is written for every operation rolled back.
//! Applying it runs the original operation's `undo_me`; it is redone during
//! recovery like any other record but never undone itself. Only the target
//! and its version are persisted. The operation being undone is found again
//! through the CLR's `undone` LSN and attached before the CLR is applied.

use tracing::trace;

use super::{
    decode_container_key, encode_container_key, page_needs_redo, resolve_page, type_id,
    version_gate, Group, Loggable, OpContext, Operation, PageOpHeader, Resolved, Target,
};
use crate::primitives::bytes::{buf::Cursor, var};
use crate::types::{ContainerKey, Lsn, RecordId, Result, StoreError, VersionedObject};

fn attached<'a>(undo_op: &'a Option<Box<Operation>>, clr: &'static str) -> Result<&'a Operation> {
    undo_op
        .as_deref()
        .ok_or_else(|| StoreError::consistency(format!("{clr} applied without the undone operation")))
}

fn run_undo(
    undo_op: &Option<Box<Operation>>,
    clr: &'static str,
    target: Target<'_>,
    record: Option<RecordId>,
    lsn: Option<Lsn>,
    data: &[u8],
) -> Result<()> {
    let op = attached(undo_op, clr)?;
    let undoable = op
        .as_undoable()
        .ok_or_else(|| StoreError::consistency(format!("{clr} wraps another compensation record")))?;
    trace!(clr, undone = op.name(), "ops.compensation.apply");
    undoable.undo_me(target, record, lsn, data)
}

/// Undoes a physical operation on the page it was applied to.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PhysicalUndoOp {
    /// Same page as the undone operation, at its version when undone.
    pub header: PageOpHeader,
    pub(crate) undo_op: Option<Box<Operation>>,
}

impl PhysicalUndoOp {
    /// Compensates `undo_op`.
    pub fn new(header: PageOpHeader, undo_op: Operation) -> Self {
        Self {
            header,
            undo_op: Some(Box::new(undo_op)),
        }
    }

    /// Operation this record compensates, once attached.
    pub fn undo_op(&self) -> Option<&Operation> {
        self.undo_op.as_deref()
    }

    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            undo_op: None,
        })
    }
}

impl Loggable for PhysicalUndoOp {
    fn type_id(&self) -> u16 {
        type_id::PHYSICAL_UNDO
    }

    fn group(&self) -> Group {
        Group::RAWSTORE | Group::COMPENSATION
    }

    fn name(&self) -> &'static str {
        "physical_undo"
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

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        run_undo(&self.undo_op, self.name(), target, None, lsn, data)
    }
}

/// Undoes a logical operation on whichever page now holds its record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LogicalUndoOp {
    /// Page the record was found on, at its version when undone.
    pub header: PageOpHeader,
    /// Id of the record on that page.
    pub record: RecordId,
    pub(crate) undo_op: Option<Box<Operation>>,
}

impl LogicalUndoOp {
    /// Compensates `undo_op` for `record`, found on the page in `header`.
    pub fn new(header: PageOpHeader, record: RecordId, undo_op: Operation) -> Self {
        Self {
            header,
            record,
            undo_op: Some(Box::new(undo_op)),
        }
    }

    /// The operation being undone, once attached.
    pub fn undo_op(&self) -> Option<&Operation> {
        self.undo_op.as_deref()
    }

    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            header: PageOpHeader::decode(cur)?,
            record: RecordId(cur.read_var_u32()?),
            undo_op: None,
        })
    }
}

impl Loggable for LogicalUndoOp {
    fn type_id(&self) -> u16 {
        type_id::LOGICAL_UNDO
    }

    fn group(&self) -> Group {
        Group::RAWSTORE | Group::COMPENSATION
    }

    fn name(&self) -> &'static str {
        "logical_undo"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        self.header.encode(out);
        var::encode_u64(u64::from(self.record.0), out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        resolve_page(ctx, &self.header, false)
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        page_needs_redo(&self.header, resolved)
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        run_undo(&self.undo_op, self.name(), target, Some(self.record), lsn, data)
    }
}

/// Undoes a container create or drop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerUndoOp {
    /// The container.
    pub key: ContainerKey,
    /// Container version when undone.
    pub container_version: u64,
    pub(crate) undo_op: Option<Box<Operation>>,
}

impl ContainerUndoOp {
    /// Compensates the container operation `undo_op`.
    pub fn new(key: ContainerKey, container_version: u64, undo_op: Operation) -> Self {
        Self {
            key,
            container_version,
            undo_op: Some(Box::new(undo_op)),
        }
    }

    /// The operation being undone, once attached.
    pub fn undo_op(&self) -> Option<&Operation> {
        self.undo_op.as_deref()
    }

    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        Ok(Self {
            key: decode_container_key(cur)?,
            container_version: cur.read_var_u64()?,
            undo_op: None,
        })
    }
}

impl Loggable for ContainerUndoOp {
    fn type_id(&self) -> u16 {
        type_id::CONTAINER_UNDO
    }

    fn group(&self) -> Group {
        Group::RAWSTORE | Group::COMPENSATION | Group::FILE_RESOURCE
    }

    fn name(&self) -> &'static str {
        "container_undo"
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        encode_container_key(self.key, out);
        var::encode_u64(self.container_version, out);
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        Ok(ctx
            .registry
            .find(self.key)
            .map(Resolved::container)
            .unwrap_or_default())
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        // An undone create leaves nothing behind to redo against.
        match resolved.open_container() {
            Some(container) => version_gate(
                VersionedObject::Container(self.key),
                self.container_version,
                container.version(),
            ),
            None => Ok(false),
        }
    }

    fn do_me(&self, target: Target<'_>, lsn: Option<Lsn>, data: &[u8]) -> Result<()> {
        run_undo(&self.undo_op, self.name(), target, None, lsn, data)
    }
}
