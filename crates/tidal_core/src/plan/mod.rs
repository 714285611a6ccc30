//! Local mutation planning and write-intent translation.
//!
//! A segment is planned in one synchronous step: hydration, exclusivity
//! check, optimistic state, then translation of the operations into write
//! intents. Any error here is raised before state is touched.

mod encoder;
mod planner;

pub use encoder::encode;
pub use planner::plan;

use crate::entity::{EntityMap, Patch};
use crate::error::CoreError;
use crate::operation::Operation;
use crate::ticket::Ticket;
use tidal_protocol::WriteIntent;

/// One operation of a segment, as seen by the planner.
#[derive(Debug, Clone, Copy)]
pub struct SegmentOp<'a> {
    /// The operation.
    pub operation: &'a Operation,
    /// Its completion ticket; supplies the idempotency metadata.
    pub ticket: &'a Ticket,
}

/// What kind of writes a segment holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentKind {
    /// Only hydration: nothing to persist.
    Hydrate,
    /// Only server-assigned creates.
    Create,
    /// Only structural patches.
    Patches,
    /// Any mix of add, update, upsert, remove and forceRemove.
    Mixed,
}

/// The planned effect of a segment.
#[derive(Debug, Clone)]
pub struct Plan {
    /// Segment kind.
    pub kind: SegmentKind,
    /// Current state plus hydration. Rollback restores this map.
    pub base: EntityMap,
    /// State after the segment's optimistic changes.
    pub optimistic: EntityMap,
    /// Patches from `base` to `optimistic`.
    pub patches: Vec<Patch>,
    /// Patches from `optimistic` back to `base`.
    pub inverse: Vec<Patch>,
    /// Ids touched by hydration or the optimistic changes.
    pub changed_ids: Vec<String>,
    /// Entity id each operation targets, by operation index.
    pub targets: Vec<Option<String>>,
    /// Operations that failed on their own, with their errors.
    pub failed: Vec<(usize, CoreError)>,
}

impl Plan {
    /// Returns the error of an operation that failed during planning.
    pub fn failure(&self, op_index: usize) -> Option<&CoreError> {
        self.failed
            .iter()
            .find(|(i, _)| *i == op_index)
            .map(|(_, e)| e)
    }

    /// Returns true if the optimistic state differs from the base.
    pub fn changes_state(&self) -> bool {
        !self.optimistic.ptr_eq(&self.base)
    }
}

/// A write intent together with the operation it came from.
#[derive(Debug, Clone)]
pub struct PlannedWrite {
    /// Index of the originating operation in the segment.
    pub op_index: usize,
    /// The intent.
    pub intent: WriteIntent,
    /// Ticket of the originating operation.
    pub ticket: Ticket,
    /// True if the write creates an entity.
    pub creates: bool,
    /// Client id of a created entity, absent for server-assigned creates.
    pub client_id: Option<String>,
}
