//! Per-collection operation queue.
//!
//! Dispatches are appended synchronously and drained by a single task per
//! collection. The drain task yields once before taking the queue, so
//! operations dispatched in the same tick are planned together. Segments
//! run strictly one after another.

use super::{executor, CollectionInner};
use crate::entity::Entity;
use crate::error::{CoreError, CoreResult};
use crate::events::guarded;
use crate::operation::{DispatchOutcome, OnFail, OnSuccess, OpContext, Operation, PersistMode, TxKey};
use crate::ticket::Ticket;
use parking_lot::Mutex;
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::trace;

/// An accepted dispatch waiting to be planned.
pub(super) struct PendingOp {
    pub operation: Operation,
    pub persist: PersistMode,
    pub tx: TxKey,
    pub ticket: Ticket,
    pub op_context: Option<OpContext>,
    pub on_success: Option<OnSuccess>,
    pub on_fail: Option<OnFail>,
    pub done: oneshot::Sender<CoreResult<DispatchOutcome>>,
}

impl PendingOp {
    fn segment_key(&self) -> (&TxKey, PersistMode) {
        (&self.tx, self.persist)
    }

    /// Fails the operation: ticket, callback, then the waiting future.
    pub fn fail(self, error: CoreError) {
        self.ticket.fail(error.clone());
        if let Some(on_fail) = self.on_fail {
            guarded("on_fail", || on_fail(&error));
        }
        // the caller may have dropped its future
        let _ = self.done.send(Err(error));
    }

    /// Completes the operation with its finalized entity.
    pub fn succeed(self, entity: Option<Arc<Entity>>) {
        if let Some(on_success) = self.on_success {
            let entity = entity.clone();
            guarded("on_success", move || on_success(entity));
        }
        let _ = self.done.send(Ok(DispatchOutcome::Entity(entity)));
    }

    /// Completes an operation owned by an external sequencer.
    pub fn report(self, outcome: DispatchOutcome) {
        let _ = self.done.send(Ok(outcome));
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<PendingOp>,
    draining: bool,
}

/// Queue of accepted dispatches.
#[derive(Default)]
pub(super) struct Scheduler {
    state: Mutex<QueueState>,
}

/// Queues `op` and makes sure a drain task is running.
///
/// Returns the operation back if there is no runtime to drain it on.
pub(super) fn enqueue(inner: &Arc<CollectionInner>, op: PendingOp) -> Result<(), PendingOp> {
    let handle = match Handle::try_current() {
        Ok(handle) => handle,
        Err(_) => return Err(op),
    };
    let spawn = {
        let mut state = inner.scheduler.state.lock();
        state.pending.push_back(op);
        !std::mem::replace(&mut state.draining, true)
    };
    if spawn {
        let inner = Arc::clone(inner);
        handle.spawn(async move { drain(inner).await });
    }
    Ok(())
}

/// Resets the drain flag if the drain task is dropped mid-flight, failing
/// whatever is still queued.
struct DrainGuard {
    inner: Arc<CollectionInner>,
    finished: bool,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        let orphans: Vec<PendingOp> = {
            let mut state = self.inner.scheduler.state.lock();
            state.draining = false;
            state.pending.drain(..).collect()
        };
        for op in orphans {
            op.fail(CoreError::Closed);
        }
    }
}

async fn drain(inner: Arc<CollectionInner>) {
    let mut guard = DrainGuard {
        inner: Arc::clone(&inner),
        finished: false,
    };
    tokio::task::yield_now().await;

    loop {
        let batch: Vec<PendingOp> = {
            let mut state = inner.scheduler.state.lock();
            if state.pending.is_empty() {
                state.draining = false;
                guard.finished = true;
                return;
            }
            state.pending.drain(..).collect()
        };

        for segment in split_segments(batch) {
            trace!(collection = inner.name(), ops = segment.len(), "running segment");
            executor::run_segment(&inner, segment).await;
        }
    }
}

/// Entity an operation writes, when known before planning.
fn write_target(operation: &Operation) -> Option<&str> {
    match operation {
        Operation::Add(entity) => entity.id(),
        Operation::Upsert { value, .. } => value.id(),
        Operation::Update { id, .. } | Operation::Remove { id } | Operation::ForceRemove { id } => {
            Some(id.as_str())
        }
        Operation::Hydrate(_)
        | Operation::HydrateMany(_)
        | Operation::Create(_)
        | Operation::Patches { .. } => None,
    }
}

/// Splits a batch into runs of consecutive operations sharing a
/// transaction key and persistence strategy.
///
/// A run also ends before a second write to the same entity, so that write
/// is planned against the version the first one produced.
fn split_segments(batch: Vec<PendingOp>) -> Vec<Vec<PendingOp>> {
    let mut segments: Vec<Vec<PendingOp>> = Vec::new();
    let mut written: HashSet<String> = HashSet::new();
    for op in batch {
        let target = write_target(&op.operation).map(String::from);
        let joins = match segments.last() {
            Some(segment) => {
                segment[0].segment_key() == op.segment_key()
                    && target.as_ref().map_or(true, |id| !written.contains(id))
            }
            None => false,
        };
        if !joins {
            written.clear();
        }
        if let Some(id) = target {
            written.insert(id);
        }
        match segments.last_mut() {
            Some(segment) if joins => segment.push(op),
            _ => segments.push(vec![op]),
        }
    }
    segments
}
