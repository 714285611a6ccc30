//! Runs one segment through plan, optimistic commit, persistence and
//! writeback or rollback.

use super::scheduler::PendingOp;
use super::CollectionInner;
use crate::entity::{Entity, EntityMap};
use crate::error::{CoreError, CoreResult};
use crate::events::MutationEvent;
use crate::operation::{DispatchOutcome, OperationKind, PersistMode};
use crate::persist::{PersistResult, PersistStatus, Persister};
use crate::plan::{self, Plan, PlannedWrite, SegmentOp};
use crate::writeback;
use std::sync::Arc;
use tidal_protocol::WriteIntent;
use tracing::{debug, warn};

struct Prepared {
    plan: Plan,
    writes: Vec<PlannedWrite>,
}

/// Plans and encodes the segment against `current`. Nothing is applied.
fn prepare(
    inner: &CollectionInner,
    ops: &[PendingOp],
    persist: PersistMode,
    current: &EntityMap,
) -> CoreResult<Prepared> {
    let name = inner.name();
    let segment: Vec<SegmentOp<'_>> = ops
        .iter()
        .map(|op| SegmentOp {
            operation: &op.operation,
            ticket: &op.ticket,
        })
        .collect();
    let plan = plan::plan(name, &segment, current)?;
    let writes = plan::encode(name, &segment, &plan, persist)?;

    if !writes.is_empty() {
        match persist {
            PersistMode::Outbox if inner.outbox.is_none() => {
                return Err(CoreError::OutboxNotConfigured {
                    collection: name.to_string(),
                })
            }
            PersistMode::Direct if inner.direct.is_none() => {
                return Err(CoreError::NoRemote {
                    collection: name.to_string(),
                })
            }
            _ => {}
        }
    }
    Ok(Prepared { plan, writes })
}

pub(super) async fn run_segment(inner: &CollectionInner, ops: Vec<PendingOp>) {
    let Some(persist) = ops.first().map(|op| op.persist) else {
        return;
    };
    let segment = inner.next_segment();

    // listeners see the plan before its optimistic state is applied
    let base = inner.snapshot();
    let prepared = prepare(inner, &ops, persist, &base).map(|prepared| {
        inner.events.emit(&MutationEvent::Planned {
            collection: inner.name().to_string(),
            segment,
            changed_ids: prepared.plan.changed_ids.clone(),
            intents: prepared.writes.len(),
        });
        prepared
    });
    let prepared = prepared.and_then(|prepared| {
        inner.transact(|current| {
            if current.ptr_eq(&base) {
                return (Some(prepared.plan.optimistic.clone()), Ok(prepared));
            }
            // a remote change landed while listeners ran
            debug!(collection = inner.name(), segment, "replanning segment on moved state");
            match prepare(inner, &ops, persist, current) {
                Ok(prepared) => (Some(prepared.plan.optimistic.clone()), Ok(prepared)),
                Err(err) => (None, Err(err)),
            }
        })
    });
    let Prepared { plan, mut writes } = match prepared {
        Ok(prepared) => prepared,
        Err(err) => {
            debug!(collection = inner.name(), segment, error = %err, "segment rejected before apply");
            for op in ops {
                op.fail(err.clone());
            }
            return;
        }
    };

    let result = match run_before_persist(inner, persist, &mut writes) {
        Ok(()) => persist_writes(inner, persist, &writes).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(result) => commit(inner, segment, ops, &plan, &writes, &result),
        Err(err) => rollback(inner, segment, ops, &plan, err),
    }
}

fn run_before_persist(
    inner: &CollectionInner,
    persist: PersistMode,
    writes: &mut [PlannedWrite],
) -> CoreResult<()> {
    if writes.is_empty() {
        return Ok(());
    }
    let mut intents: Vec<WriteIntent> = writes.iter().map(|w| w.intent.clone()).collect();
    inner
        .middleware
        .before_persist(inner.name(), persist, &mut intents)?;
    if intents.len() != writes.len() {
        return Err(CoreError::config(
            "before-persist middleware must not add or drop write intents",
        ));
    }
    for (write, intent) in writes.iter_mut().zip(intents) {
        write.intent = intent;
    }
    Ok(())
}

async fn persist_writes(
    inner: &CollectionInner,
    persist: PersistMode,
    writes: &[PlannedWrite],
) -> CoreResult<PersistResult> {
    if writes.is_empty() {
        return Ok(PersistResult::empty(persist, PersistStatus::Confirmed));
    }
    let name = inner.name();
    match persist {
        PersistMode::Direct => match &inner.direct {
            Some(direct) => direct.persist(name, writes).await,
            None => Err(CoreError::NoRemote {
                collection: name.to_string(),
            }),
        },
        PersistMode::Outbox => match &inner.outbox {
            Some(outbox) => outbox.persist(name, writes).await,
            None => Err(CoreError::OutboxNotConfigured {
                collection: name.to_string(),
            }),
        },
    }
}

fn commit(
    inner: &CollectionInner,
    segment: u64,
    ops: Vec<PendingOp>,
    plan: &Plan,
    writes: &[PlannedWrite],
    result: &PersistResult,
) {
    let written = inner.commit(|current| writeback::apply_persist_result(current, result));
    let mut changed_ids = plan.changed_ids.clone();
    for id in written {
        if !changed_ids.contains(&id) {
            changed_ids.push(id);
        }
    }
    debug!(
        collection = inner.name(),
        segment,
        mode = result.mode.as_str(),
        changed = changed_ids.len(),
        "segment committed"
    );
    inner.events.emit(&MutationEvent::Committed {
        collection: inner.name().to_string(),
        segment,
        mode: result.mode,
        status: result.status,
        changed_ids: changed_ids.clone(),
    });

    let snapshot = inner.snapshot();
    for (index, op) in ops.into_iter().enumerate() {
        if let Some(err) = plan.failure(index) {
            op.fail(err.clone());
            continue;
        }

        op.ticket.mark_enqueued();
        let queued = result.status == PersistStatus::Enqueued
            && writes.iter().any(|w| w.op_index == index);
        if !queued {
            op.ticket.confirm();
        }

        if op.op_context.is_some() {
            op.report(DispatchOutcome::Patches {
                patches: plan.patches.clone(),
                inverse: plan.inverse.clone(),
                changed_ids: changed_ids.clone(),
            });
            continue;
        }
        let entity = final_entity(index, op.operation.kind(), plan, result, &snapshot);
        op.succeed(entity);
    }
}

/// Looks up the entity an operation ended up producing.
fn final_entity(
    index: usize,
    kind: OperationKind,
    plan: &Plan,
    result: &PersistResult,
    snapshot: &EntityMap,
) -> Option<Arc<Entity>> {
    let target = plan.targets.get(index).and_then(Option::as_deref);
    let id = match kind {
        OperationKind::Add | OperationKind::Create => result
            .created_for(index)
            .and_then(|created| created.entity.id())
            .or(target),
        OperationKind::Update
        | OperationKind::Upsert
        | OperationKind::Remove
        | OperationKind::Hydrate => target,
        OperationKind::ForceRemove | OperationKind::HydrateMany | OperationKind::Patches => None,
    }?;
    snapshot.get(id).cloned()
}

fn rollback(inner: &CollectionInner, segment: u64, ops: Vec<PendingOp>, plan: &Plan, err: CoreError) {
    if plan.changes_state() {
        inner.transact(|current| {
            let restored = if current.ptr_eq(&plan.optimistic) {
                plan.base.clone()
            } else {
                match current.apply_patches(&plan.inverse) {
                    Ok(map) => map,
                    Err(patch_err) => {
                        warn!(
                            collection = inner.name(),
                            segment,
                            error = %patch_err,
                            "inverse patches no longer apply, restoring pre-segment state"
                        );
                        plan.base.clone()
                    }
                }
            };
            (Some(restored), ())
        });
    }
    warn!(collection = inner.name(), segment, error = %err, "segment rolled back");
    inner.events.emit(&MutationEvent::RolledBack {
        collection: inner.name().to_string(),
        segment,
        error: err.clone(),
    });

    for (index, op) in ops.into_iter().enumerate() {
        match plan.failure(index) {
            Some(own) => op.fail(own.clone()),
            None => op.fail(err.clone()),
        }
    }
}
