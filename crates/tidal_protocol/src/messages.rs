//! Remote operations, results and change records.

use crate::write::{WriteAction, WriteItem, WriteOptions};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Error code the authority uses for a failed version precondition.
pub const CONFLICT_CODE: &str = "CONFLICT";

/// Opaque position in the remote change stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(String);

impl Cursor {
    /// Wraps a raw cursor value.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Returns the raw cursor value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Request for changes after a cursor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    /// Cursor of the last fully applied batch. `None` pulls from the start.
    pub cursor: Option<Cursor>,
    /// Maximum number of changes to return.
    pub limit: u32,
    /// Collections of interest. Empty means all.
    pub collections: Vec<String>,
}

impl PullRequest {
    /// Creates a pull request.
    pub fn new(cursor: Option<Cursor>, limit: u32) -> Self {
        Self {
            cursor,
            limit,
            collections: Vec::new(),
        }
    }

    /// Restricts the request to the given collections.
    pub fn with_collections(mut self, collections: Vec<String>) -> Self {
        self.collections = collections;
        self
    }
}

/// A batch of changes returned by a pull.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PullResponse {
    /// Changes after the request cursor, in stream order.
    pub changes: Vec<Change>,
    /// Cursor to store once `changes` are applied.
    pub next_cursor: Option<Cursor>,
    /// Whether more changes are available.
    pub has_more: bool,
}

impl PullResponse {
    /// Creates a pull response.
    pub fn new(changes: Vec<Change>, next_cursor: Option<Cursor>, has_more: bool) -> Self {
        Self {
            changes,
            next_cursor,
            has_more,
        }
    }
}

/// A change observed on the remote authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Change {
    /// Entity was created or replaced. `value` carries `id` and `version`.
    Upsert {
        /// Collection name.
        collection: String,
        /// Canonical entity value.
        value: Value,
    },
    /// Entity was removed.
    Delete {
        /// Collection name.
        collection: String,
        /// Entity id.
        entity_id: String,
        /// Version at deletion, if known.
        version: Option<i64>,
    },
}

impl Change {
    /// Returns the collection this change belongs to.
    pub fn collection(&self) -> &str {
        match self {
            Change::Upsert { collection, .. } | Change::Delete { collection, .. } => collection,
        }
    }

    /// Returns the entity id this change targets.
    pub fn entity_id(&self) -> Option<&str> {
        match self {
            Change::Upsert { value, .. } => value.get("id").and_then(Value::as_str),
            Change::Delete { entity_id, .. } => Some(entity_id),
        }
    }
}

/// Changes pushed over a live subscription.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangeBatch {
    /// Changes in stream order.
    pub changes: Vec<Change>,
    /// Cursor positioned after these changes, if the stream reports one.
    pub cursor: Option<Cursor>,
}

/// One operation of a batched remote call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteOp {
    /// Reads entities of a collection.
    Query {
        /// Collection name.
        collection: String,
        /// Restricts the result to these ids. `None` reads everything.
        ids: Option<Vec<String>>,
    },
    /// Applies write items sharing one action and option set.
    Write {
        /// Collection name.
        collection: String,
        /// Write action shared by all items.
        action: WriteAction,
        /// Write options shared by all items.
        options: WriteOptions,
        /// The items.
        items: Vec<WriteItem>,
    },
    /// Reads changes after a cursor (`changes.pull`).
    PullChanges(PullRequest),
}

/// Successful output of a remote operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum OpOutput {
    /// Entities read by a query.
    Query {
        /// Entity values.
        entities: Vec<Value>,
    },
    /// Per-item outcomes of a write, in item order.
    Write {
        /// Item outcomes.
        outcomes: Vec<WriteItemOutcome>,
    },
    /// Changes read by a pull.
    Changes(PullResponse),
}

/// Result of one remote operation.
pub type RemoteOpResult = Result<OpOutput, RemoteError>;

/// Error reported by the remote authority for an operation or item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    /// Machine-readable code, e.g. `CONFLICT`.
    pub code: String,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Creates a remote error.
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates a version conflict error.
    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(CONFLICT_CODE, message)
    }

    /// Returns true if this is a version conflict.
    pub fn is_conflict(&self) -> bool {
        self.code == CONFLICT_CODE
    }
}

impl fmt::Display for RemoteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

/// The authority's current copy of an entity, reported with a reject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CurrentSnapshot {
    /// Current version on the authority.
    pub version: Option<i64>,
    /// Current value. `None` when the entity no longer exists.
    pub value: Option<Value>,
}

/// Acknowledgement of an applied write item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAck {
    /// Id of the written entity (authority-assigned for creates).
    pub entity_id: String,
    /// Version assigned by the authority.
    pub version: i64,
    /// Canonical value, when the authority returns one.
    pub data: Option<Value>,
}

/// Rejection of a write item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteReject {
    /// Why the item was rejected.
    pub error: RemoteError,
    /// The authority's current copy, sent with conflicts.
    pub current: Option<CurrentSnapshot>,
}

/// Outcome of a single write item.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WriteItemOutcome {
    /// The item was applied.
    Ok(WriteAck),
    /// The item was rejected.
    Err(WriteReject),
}

impl WriteItemOutcome {
    /// Creates a successful outcome.
    pub fn ok(entity_id: impl Into<String>, version: i64, data: Option<Value>) -> Self {
        WriteItemOutcome::Ok(WriteAck {
            entity_id: entity_id.into(),
            version,
            data,
        })
    }

    /// Creates a rejected outcome.
    pub fn rejected(error: RemoteError, current: Option<CurrentSnapshot>) -> Self {
        WriteItemOutcome::Err(WriteReject { error, current })
    }
}
