//! Dispatch operations and their options.

use crate::entity::{Entity, Patch};
use crate::error::CoreError;
use crate::ticket::Ticket;
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A mutation dispatched against a collection.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    /// Seeds one entity into the cache without persisting it.
    Hydrate(Entity),
    /// Seeds several entities into the cache without persisting them.
    HydrateMany(Vec<Entity>),
    /// Adds an entity with a client-assigned id (a temp id if none is set).
    Add(Entity),
    /// Creates an entity whose id the authority assigns.
    Create(Entity),
    /// Merges fields into an existing entity.
    Update {
        /// Target entity.
        id: String,
        /// Fields to overwrite.
        changes: Map<String, Value>,
    },
    /// Inserts an entity, or merges into / replaces an existing one.
    Upsert {
        /// Entity value. Must carry an id.
        value: Entity,
        /// Merge into the existing entity instead of replacing it.
        merge: bool,
    },
    /// Soft-deletes an entity.
    Remove {
        /// Target entity.
        id: String,
    },
    /// Hard-deletes an entity.
    ForceRemove {
        /// Target entity.
        id: String,
    },
    /// Applies a precomputed structural diff (undo/redo replay).
    Patches {
        /// Forward patches.
        patches: Vec<Patch>,
        /// Patches undoing `patches`.
        inverse: Vec<Patch>,
    },
}

/// Discriminant of an [`Operation`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    /// [`Operation::Hydrate`].
    Hydrate,
    /// [`Operation::HydrateMany`].
    HydrateMany,
    /// [`Operation::Add`].
    Add,
    /// [`Operation::Create`].
    Create,
    /// [`Operation::Update`].
    Update,
    /// [`Operation::Upsert`].
    Upsert,
    /// [`Operation::Remove`].
    Remove,
    /// [`Operation::ForceRemove`].
    ForceRemove,
    /// [`Operation::Patches`].
    Patches,
}

impl OperationKind {
    /// Returns true for cache seeding operations.
    pub fn is_hydrate(&self) -> bool {
        matches!(self, OperationKind::Hydrate | OperationKind::HydrateMany)
    }

    /// Returns the operation name.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Hydrate => "hydrate",
            OperationKind::HydrateMany => "hydrateMany",
            OperationKind::Add => "add",
            OperationKind::Create => "create",
            OperationKind::Update => "update",
            OperationKind::Upsert => "upsert",
            OperationKind::Remove => "remove",
            OperationKind::ForceRemove => "forceRemove",
            OperationKind::Patches => "patches",
        }
    }
}

impl Operation {
    /// Returns the operation kind.
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Hydrate(_) => OperationKind::Hydrate,
            Operation::HydrateMany(_) => OperationKind::HydrateMany,
            Operation::Add(_) => OperationKind::Add,
            Operation::Create(_) => OperationKind::Create,
            Operation::Update { .. } => OperationKind::Update,
            Operation::Upsert { .. } => OperationKind::Upsert,
            Operation::Remove { .. } => OperationKind::Remove,
            Operation::ForceRemove { .. } => OperationKind::ForceRemove,
            Operation::Patches { .. } => OperationKind::Patches,
        }
    }
}

/// How a segment's write intents are persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum PersistMode {
    /// Executed against the remote authority now.
    #[default]
    Direct,
    /// Appended to the collection's outbox for later replay.
    Outbox,
}

impl PersistMode {
    /// Returns the mode name.
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistMode::Direct => "direct",
            PersistMode::Outbox => "outbox",
        }
    }
}

/// Logical transaction boundary. Consecutive operations with equal keys
/// are planned together.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct TxKey {
    /// Transaction scope.
    pub scope: Option<String>,
    /// Origin of the operation (user, sync, history, ...).
    pub origin: Option<String>,
    /// Action identifier.
    pub action_id: Option<String>,
}

impl TxKey {
    /// Creates a key with the given action id.
    pub fn action(action_id: impl Into<String>) -> Self {
        Self {
            action_id: Some(action_id.into()),
            ..Self::default()
        }
    }

    /// Sets the scope.
    pub fn with_scope(mut self, scope: impl Into<String>) -> Self {
        self.scope = Some(scope.into());
        self
    }

    /// Sets the origin.
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// Context attached by an external sequencer such as a history manager.
///
/// When present, the segment reports its patches back instead of invoking
/// success callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpContext {
    /// Free-form label of the originating action.
    pub label: String,
}

impl OpContext {
    /// Creates an operation context.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
        }
    }
}

/// When a dispatch future resolves.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Completion {
    /// After the local commit.
    #[default]
    Optimistic,
    /// After the authority confirmed the write, or the timeout elapsed.
    Strict {
        /// Confirmation deadline.
        timeout: Duration,
    },
}

/// Success callback. Receives the finalized entity, if one exists.
pub type OnSuccess = Box<dyn FnOnce(Option<Arc<Entity>>) + Send>;
/// Failure callback.
pub type OnFail = Box<dyn FnOnce(&CoreError) + Send>;

/// Per-dispatch options.
#[derive(Default)]
pub struct DispatchOptions {
    /// Persistence strategy. `None` uses the collection default.
    pub persist: Option<PersistMode>,
    /// Transaction boundary.
    pub tx: TxKey,
    /// Completion ticket. A fresh one is created when absent.
    pub ticket: Option<Ticket>,
    /// External sequencing context.
    pub op_context: Option<OpContext>,
    /// Completion mode. `None` uses the collection default.
    pub completion: Option<Completion>,
    /// Invoked once with the finalized entity on success.
    pub on_success: Option<OnSuccess>,
    /// Invoked once with the error on failure.
    pub on_fail: Option<OnFail>,
}

impl DispatchOptions {
    /// Creates default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the persistence strategy.
    pub fn with_persist(mut self, persist: PersistMode) -> Self {
        self.persist = Some(persist);
        self
    }

    /// Sets the transaction key.
    pub fn with_tx(mut self, tx: TxKey) -> Self {
        self.tx = tx;
        self
    }

    /// Uses the given ticket.
    pub fn with_ticket(mut self, ticket: Ticket) -> Self {
        self.ticket = Some(ticket);
        self
    }

    /// Attaches an external sequencing context.
    pub fn with_op_context(mut self, context: OpContext) -> Self {
        self.op_context = Some(context);
        self
    }

    /// Sets the completion mode.
    pub fn with_completion(mut self, completion: Completion) -> Self {
        self.completion = Some(completion);
        self
    }

    /// Sets the success callback.
    pub fn on_success(mut self, f: impl FnOnce(Option<Arc<Entity>>) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Sets the failure callback.
    pub fn on_fail(mut self, f: impl FnOnce(&CoreError) + Send + 'static) -> Self {
        self.on_fail = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for DispatchOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchOptions")
            .field("persist", &self.persist)
            .field("tx", &self.tx)
            .field("ticket", &self.ticket)
            .field("op_context", &self.op_context)
            .field("completion", &self.completion)
            .field("on_success", &self.on_success.is_some())
            .field("on_fail", &self.on_fail.is_some())
            .finish()
    }
}

/// Result of a settled dispatch.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    /// The finalized entity (absent for deletes and hydration).
    Entity(Option<Arc<Entity>>),
    /// Patch information, for dispatches carrying an [`OpContext`].
    Patches {
        /// Forward patches of the segment.
        patches: Vec<Patch>,
        /// Inverse patches of the segment.
        inverse: Vec<Patch>,
        /// Ids touched by the segment.
        changed_ids: Vec<String>,
    },
}

impl DispatchOutcome {
    /// Returns the entity, if this outcome carries one.
    pub fn entity(&self) -> Option<&Arc<Entity>> {
        match self {
            DispatchOutcome::Entity(entity) => entity.as_ref(),
            DispatchOutcome::Patches { .. } => None,
        }
    }

    /// Consumes the outcome, returning the entity if present.
    pub fn into_entity(self) -> Option<Arc<Entity>> {
        match self {
            DispatchOutcome::Entity(entity) => entity,
            DispatchOutcome::Patches { .. } => None,
        }
    }
}
