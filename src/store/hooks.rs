#![forbid(unsafe_code)]
//! Commit and abort actions registered on a transaction.
//!
//! A hook is registered against one container and fires on the first
//! lifecycle event it reacts to. Firing removes it from the transaction, so
//! each registration runs at most once. The work itself is carried out by
//! the transaction; this module only decides who fires when.

use smallvec::SmallVec;

use crate::types::ContainerKey;

/// Lifecycle transition a transaction notifies its hooks of.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum XactEvent {
    /// The transaction commits.
    Commit,
    /// The transaction aborts.
    Abort,
    /// The transaction rolls back to a savepoint.
    SavepointRollback,
    /// The named container is being dropped by this transaction.
    ContainerDropped(ContainerKey),
}

/// What a hook does when it fires.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommitAction {
    /// Drop the container when the transaction commits. On abort only a
    /// temporary container is removed; a logged one is restored by undo.
    DropOnCommit,
    /// Write the container's dirty pages when the transaction commits.
    SyncOnCommit,
    /// Empty a temporary container on abort or savepoint rollback, and on
    /// commit as well when `commit_as_well` is set.
    TruncateOnCommit { commit_as_well: bool },
}

/// One registered action.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CommitHook {
    /// Container the action applies to.
    pub container: ContainerKey,
    /// What to do.
    pub action: CommitAction,
}

impl CommitHook {
    /// Whether `event` triggers this hook. A hook that fires is removed
    /// even when there is nothing for it to do.
    pub fn fires_on(&self, event: XactEvent) -> bool {
        if let XactEvent::ContainerDropped(key) = event {
            return key == self.container;
        }
        match self.action {
            CommitAction::DropOnCommit | CommitAction::SyncOnCommit => {
                matches!(event, XactEvent::Commit | XactEvent::Abort)
            }
            CommitAction::TruncateOnCommit { commit_as_well } => match event {
                XactEvent::Abort | XactEvent::SavepointRollback => true,
                XactEvent::Commit => commit_as_well,
                XactEvent::ContainerDropped(_) => false,
            },
        }
    }

    /// Whether firing on `event` has work to do beyond deregistering.
    pub fn has_work(&self, event: XactEvent, temporary: bool) -> bool {
        match (self.action, event) {
            (_, XactEvent::ContainerDropped(_)) => false,
            (CommitAction::DropOnCommit, XactEvent::Commit) => true,
            (CommitAction::DropOnCommit, XactEvent::Abort) => temporary,
            (CommitAction::SyncOnCommit, XactEvent::Commit) => true,
            (CommitAction::TruncateOnCommit { .. }, _) => true,
            _ => false,
        }
    }
}

/// Hooks of one transaction, in registration order.
#[derive(Debug, Default)]
pub struct HookList {
    hooks: SmallVec<[CommitHook; 4]>,
}

impl HookList {
    /// Registers `hook`. Registering the same hook twice keeps one copy.
    pub fn register(&mut self, hook: CommitHook) -> bool {
        if self.hooks.contains(&hook) {
            return false;
        }
        self.hooks.push(hook);
        true
    }

    /// Registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// True when no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Removes and returns every hook `event` triggers.
    pub fn take_triggered(&mut self, event: XactEvent) -> SmallVec<[CommitHook; 4]> {
        let mut fired = SmallVec::new();
        self.hooks.retain(|hook| {
            if hook.fires_on(event) {
                fired.push(*hook);
                false
            } else {
                true
            }
        });
        fired
    }

    /// Forgets every hook without firing.
    pub fn clear(&mut self) {
        self.hooks.clear();
    }
}
