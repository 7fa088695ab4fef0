#![forbid(unsafe_code)]
//! Container lifecycle operations.

use tracing::debug;

use super::{
    decode_container_key, encode_container_key, type_id, version_gate, ContainerUndoOp, Group,
    Loggable, OpContext, Operation, PendingUndo, Resolved, Target, Undoable,
};
use crate::primitives::bytes::buf::Cursor;
use crate::primitives::bytes::var;
use crate::store::container::CreateInfo;
use crate::types::{ContainerKey, Lsn, RecordId, Result, StoreError, VersionedObject};

/// What a container operation does.
#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContainerAction {
    /// Creates the container.
    Create = 1,
    /// Marks the container dropped; the file stays until it is removed.
    Drop = 2,
    /// Deletes the file of a dropped container. Cannot be undone.
    Remove = 3,
}

impl TryFrom<u8> for ContainerAction {
    type Error = StoreError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(ContainerAction::Create),
            2 => Ok(ContainerAction::Drop),
            3 => Ok(ContainerAction::Remove),
            _ => Err(StoreError::Corruption("unknown container action")),
        }
    }
}

/// Creates, drops, or removes a container.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContainerOp {
    /// The container.
    pub key: ContainerKey,
    /// Container version before the operation applied.
    pub container_version: u64,
    /// What happens to it.
    pub action: ContainerAction,
    /// Present for [`ContainerAction::Create`].
    pub create_info: Option<CreateInfo>,
}

impl ContainerOp {
    pub(crate) fn decode(cur: &mut Cursor<'_>) -> Result<Self> {
        let key = decode_container_key(cur)?;
        let container_version = cur.read_var_u64()?;
        let action = ContainerAction::try_from(cur.read_u8()?)?;
        let create_info = match action {
            ContainerAction::Create => Some(CreateInfo::decode(cur)?),
            _ => None,
        };
        Ok(Self {
            key,
            container_version,
            action,
            create_info,
        })
    }
}

impl Loggable for ContainerOp {
    fn type_id(&self) -> u16 {
        type_id::CONTAINER
    }

    fn group(&self) -> Group {
        Group::RAWSTORE | Group::FILE_RESOURCE
    }

    fn name(&self) -> &'static str {
        match self.action {
            ContainerAction::Create => "container_create",
            ContainerAction::Drop => "container_drop",
            ContainerAction::Remove => "container_remove",
        }
    }

    fn encode_fields(&self, out: &mut Vec<u8>) {
        encode_container_key(self.key, out);
        var::encode_u64(self.container_version, out);
        out.push(self.action as u8);
        if let Some(info) = &self.create_info {
            info.encode(out);
        }
    }

    fn resolve(&self, ctx: &OpContext<'_>) -> Result<Resolved> {
        Ok(ctx
            .registry
            .find(self.key)
            .map(Resolved::container)
            .unwrap_or_default())
    }

    fn needs_redo(&self, resolved: &Resolved) -> Result<bool> {
        match resolved.open_container() {
            Some(container) => version_gate(
                VersionedObject::Container(self.key),
                self.container_version,
                container.version(),
            ),
            // Only a create can bring a missing container back.
            None => Ok(self.action == ContainerAction::Create),
        }
    }

    fn do_me(&self, target: Target<'_>, _lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let Target::Container {
            container,
            registry,
        } = target
        else {
            return Err(StoreError::consistency("container operation applied to a page"));
        };
        match self.action {
            ContainerAction::Create => {
                let container = match container {
                    Some(existing) => existing.clone(),
                    None => {
                        let info = self
                            .create_info
                            .ok_or(StoreError::Corruption("container create without create info"))?;
                        registry.create_at(self.key, info)?
                    }
                };
                container.bump_version();
            }
            ContainerAction::Drop => {
                let container = container.ok_or(StoreError::ContainerNotFound(self.key))?;
                container.set_dropped(true);
                container.bump_version();
            }
            ContainerAction::Remove => registry.remove(self.key)?,
        }
        debug!(container = %self.key, op = self.name(), "ops.container.do");
        Ok(())
    }
}

impl Undoable for ContainerOp {
    fn generate_undo(&self, ctx: &OpContext<'_>, _data: &[u8]) -> Result<Option<PendingUndo>> {
        if self.action == ContainerAction::Remove {
            return Ok(None);
        }
        let container = ctx.registry.get(self.key)?;
        let clr = ContainerUndoOp::new(self.key, container.version(), Operation::Container(self.clone()));
        Ok(Some(PendingUndo {
            clr: Operation::ContainerUndo(clr),
            resolved: Resolved::container(container),
        }))
    }

    fn undo_me(&self, target: Target<'_>, _record: Option<RecordId>, _lsn: Option<Lsn>, _data: &[u8]) -> Result<()> {
        let Target::Container {
            container,
            registry,
        } = target
        else {
            return Err(StoreError::consistency("container undo applied to a page"));
        };
        match self.action {
            ContainerAction::Create => registry.remove(self.key),
            ContainerAction::Drop => {
                let container = container.ok_or(StoreError::ContainerNotFound(self.key))?;
                container.set_dropped(false);
                container.bump_version();
                Ok(())
            }
            ContainerAction::Remove => Err(StoreError::consistency(format!(
                "removal of container {} cannot be undone",
                self.key
            ))),
        }
    }
}
