//! Persistence strategies for planned writes.

mod direct;
mod outbox;

pub use direct::{batch_writes, unbatch_outcomes, DirectPersister};
pub(crate) use direct::execute_with_timeout;
pub use outbox::OutboxPersister;

use crate::entity::Entity;
use crate::error::CoreResult;
use crate::operation::PersistMode;
use crate::plan::PlannedWrite;
use async_trait::async_trait;

/// Whether the authority has seen a segment's writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStatus {
    /// The authority applied the writes.
    Confirmed,
    /// The writes are queued for later replay.
    Enqueued,
}

/// An entity created by a segment, as the authority returned it.
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedEntity {
    /// Index of the creating operation in the segment.
    pub op_index: usize,
    /// Id the entity had locally, absent for server-assigned creates.
    pub client_id: Option<String>,
    /// The confirmed entity.
    pub entity: Entity,
}

/// Authority-assigned version for an entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionUpdate {
    /// Entity id.
    pub key: String,
    /// New version.
    pub version: i64,
}

/// Confirmed data to merge back into the cache.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Writeback {
    /// Canonical values returned by the authority.
    pub upserts: Vec<Entity>,
    /// Ids the authority reports as gone.
    pub deletes: Vec<String>,
    /// Version bumps without a canonical value.
    pub version_updates: Vec<VersionUpdate>,
}

impl Writeback {
    /// Returns true if there is nothing to merge.
    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.deletes.is_empty() && self.version_updates.is_empty()
    }
}

/// Outcome of persisting a segment.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistResult {
    /// Strategy that ran.
    pub mode: PersistMode,
    /// Whether the writes are confirmed or only queued.
    pub status: PersistStatus,
    /// Entities created by the segment.
    pub created: Vec<CreatedEntity>,
    /// Data to merge back.
    pub writeback: Writeback,
}

impl PersistResult {
    /// A result with nothing to merge back.
    pub fn empty(mode: PersistMode, status: PersistStatus) -> Self {
        Self {
            mode,
            status,
            created: Vec::new(),
            writeback: Writeback::default(),
        }
    }

    /// Returns the created entity of an operation.
    pub fn created_for(&self, op_index: usize) -> Option<&CreatedEntity> {
        self.created.iter().find(|c| c.op_index == op_index)
    }
}

/// Executes a segment's writes.
///
/// Failing is all-or-nothing from the caller's view: an error means the
/// segment's optimistic state is rolled back.
#[async_trait]
pub trait Persister: Send + Sync {
    /// Persists `writes` for `collection`.
    async fn persist(&self, collection: &str, writes: &[PlannedWrite]) -> CoreResult<PersistResult>;
}
