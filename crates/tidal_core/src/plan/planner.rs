//! Derives the optimistic state of a segment.

use super::{Plan, SegmentKind, SegmentOp};
use crate::entity::{
    now_ms, temp_id, Draft, Entity, EntityMap, Patch, DELETED_AT_FIELD, DELETED_FIELD,
    UPDATED_AT_FIELD,
};
use crate::error::{CoreError, CoreResult};
use crate::operation::{Operation, OperationKind};
use serde_json::Value;
use std::collections::HashSet;

/// Plans a segment against the current map.
///
/// Steps, in order:
/// 1. hydrate ids not already cached (never overwriting)
/// 2. check that creates and patches are not mixed with other kinds
/// 3. derive the optimistic state
/// 4. collect the changed ids
///
/// Operations that target a missing entity fail on their own and are
/// reported in [`Plan::failed`]; the rest of the segment proceeds.
pub fn plan(collection: &str, ops: &[SegmentOp<'_>], current: &EntityMap) -> CoreResult<Plan> {
    let mut targets = vec![None; ops.len()];
    let mut failed = Vec::new();

    let mut hydration = current.draft();
    for (index, op) in ops.iter().enumerate() {
        let seeded = match op.operation {
            Operation::Hydrate(entity) => seed(&mut hydration, std::slice::from_ref(entity)),
            Operation::HydrateMany(entities) => seed(&mut hydration, entities),
            _ => continue,
        };
        match seeded {
            Ok(target) => targets[index] = target,
            Err(err) => failed.push((index, err)),
        }
    }
    let hydrated = hydration.finish();
    let base = hydrated.map;

    let writes: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| !op.operation.kind().is_hydrate())
        .map(|(i, _)| i)
        .collect();
    let kind = classify(ops, &writes)?;

    let (optimistic, patches, inverse) = match kind {
        SegmentKind::Hydrate | SegmentKind::Create => (base.clone(), Vec::new(), Vec::new()),
        SegmentKind::Patches => {
            let mut patches = Vec::new();
            let mut inverse = Vec::new();
            for &index in &writes {
                if let Operation::Patches {
                    patches: forward,
                    inverse: backward,
                } = ops[index].operation
                {
                    patches.extend(forward.iter().cloned());
                    inverse.splice(0..0, backward.iter().cloned());
                }
            }
            (base.apply_patches(&patches)?, patches, inverse)
        }
        SegmentKind::Mixed => {
            let mut draft = base.draft();
            let now = now_ms();
            for &index in &writes {
                match apply_op(collection, &mut draft, ops[index].operation, now) {
                    Ok(target) => targets[index] = Some(target),
                    Err(err) => failed.push((index, err)),
                }
            }
            let result = draft.finish();
            (result.map, result.patches, result.inverse)
        }
    };

    let changed_ids = changed_ids(&hydrated.changed_ids, &patches);
    failed.sort_by_key(|(i, _)| *i);

    Ok(Plan {
        kind,
        base,
        optimistic,
        patches,
        inverse,
        changed_ids,
        targets,
        failed,
    })
}

/// Seeds entities absent from the draft. All entities need an id.
fn seed(draft: &mut Draft, entities: &[Entity]) -> CoreResult<Option<String>> {
    if entities.iter().any(|e| e.id().is_none()) {
        return Err(CoreError::invalid_entity("hydrated entity has no id"));
    }
    let mut target = None;
    for entity in entities {
        if let Some(id) = entity.id() {
            target = Some(id.to_string());
            if !draft.contains(id) {
                draft.insert(entity.clone())?;
            }
        }
    }
    Ok(if entities.len() == 1 { target } else { None })
}

fn classify(ops: &[SegmentOp<'_>], writes: &[usize]) -> CoreResult<SegmentKind> {
    if writes.is_empty() {
        return Ok(SegmentKind::Hydrate);
    }
    let count = |kind: OperationKind| {
        writes
            .iter()
            .filter(|&&i| ops[i].operation.kind() == kind)
            .count()
    };
    let creates = count(OperationKind::Create);
    let patches = count(OperationKind::Patches);

    if creates == writes.len() {
        Ok(SegmentKind::Create)
    } else if patches == writes.len() {
        Ok(SegmentKind::Patches)
    } else if creates > 0 {
        Err(CoreError::batching_conflict(
            "create cannot be batched with other operation kinds",
        ))
    } else if patches > 0 {
        Err(CoreError::batching_conflict(
            "patches cannot be batched with other operation kinds",
        ))
    } else {
        Ok(SegmentKind::Mixed)
    }
}

/// Applies one add/update/upsert/remove/forceRemove to the draft and
/// returns the targeted id.
fn apply_op(collection: &str, draft: &mut Draft, op: &Operation, now: i64) -> CoreResult<String> {
    match op {
        Operation::Add(entity) => {
            let mut entity = entity.clone();
            let id = match entity.id() {
                Some(id) => id.to_string(),
                None => {
                    let id = temp_id();
                    entity.set_id(id.clone());
                    id
                }
            };
            draft.insert(entity)?;
            Ok(id)
        }
        Operation::Upsert { value, merge } => {
            let id = value
                .id()
                .ok_or_else(|| CoreError::invalid_entity("upsert value has no id"))?
                .to_string();
            if *merge && draft.contains(&id) {
                draft.update(&id, |existing| {
                    existing.merge(value.fields());
                    existing.set(UPDATED_AT_FIELD, Value::from(now));
                });
            } else {
                draft.insert(value.clone())?;
            }
            Ok(id)
        }
        Operation::Update { id, changes } => {
            if !draft.update(id, |existing| existing.merge(changes)) {
                return Err(CoreError::not_found(collection, id));
            }
            Ok(id.clone())
        }
        Operation::Remove { id } => {
            let marked = draft.update(id, |existing| {
                existing.set(DELETED_FIELD, Value::Bool(true));
                existing.set(DELETED_AT_FIELD, Value::from(now));
            });
            if !marked {
                return Err(CoreError::not_found(collection, id));
            }
            Ok(id.clone())
        }
        Operation::ForceRemove { id } => {
            if draft.remove(id).is_none() {
                return Err(CoreError::not_found(collection, id));
            }
            Ok(id.clone())
        }
        Operation::Hydrate(_)
        | Operation::HydrateMany(_)
        | Operation::Create(_)
        | Operation::Patches { .. } => Err(CoreError::batching_conflict(format!(
            "{} is not valid in a mixed segment",
            op.kind().as_str()
        ))),
    }
}

fn changed_ids(hydrated: &[String], patches: &[Patch]) -> Vec<String> {
    let mut seen = HashSet::new();
    hydrated
        .iter()
        .map(String::as_str)
        .chain(patches.iter().filter_map(Patch::root))
        .filter(|id| seen.insert(*id))
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticket::Ticket;
    use serde_json::{json, Map};
    use std::sync::Arc;

    fn entity(value: Value) -> Entity {
        Entity::from_value(value).unwrap()
    }

    fn cached() -> EntityMap {
        EntityMap::from_entities([
            entity(json!({"id": "a", "version": 1, "title": "one"})),
            entity(json!({"id": "b", "version": 2, "title": "two"})),
        ])
        .unwrap()
    }

    fn run(ops: &[Operation], current: &EntityMap) -> CoreResult<Plan> {
        let tickets: Vec<Ticket> = ops.iter().map(|_| Ticket::new()).collect();
        let segment: Vec<SegmentOp<'_>> = ops
            .iter()
            .zip(&tickets)
            .map(|(operation, ticket)| SegmentOp { operation, ticket })
            .collect();
        plan("todos", &segment, current)
    }

    fn changes(value: Value) -> Map<String, Value> {
        value.as_object().unwrap().clone()
    }

    #[test]
    fn hydration_never_overwrites() {
        let current = cached();
        let plan = run(
            &[
                Operation::Hydrate(entity(json!({"id": "a", "version": 9, "title": "stale"}))),
                Operation::HydrateMany(vec![entity(json!({"id": "c", "version": 1}))]),
            ],
            &current,
        )
        .unwrap();
        assert_eq!(plan.kind, SegmentKind::Hydrate);
        assert_eq!(plan.base.get("a").unwrap().get("title"), Some(&json!("one")));
        assert!(plan.base.contains("c"));
        assert_eq!(plan.changed_ids, vec!["c"]);
        assert!(!plan.changes_state());
    }

    #[test]
    fn mixing_creates_is_a_batching_conflict() {
        let result = run(
            &[
                Operation::Create(entity(json!({"title": "x"}))),
                Operation::Remove { id: "a".into() },
            ],
            &cached(),
        );
        assert!(matches!(result, Err(CoreError::BatchingConflict { .. })));

        let result = run(
            &[
                Operation::Patches {
                    patches: vec![],
                    inverse: vec![],
                },
                Operation::Add(entity(json!({"title": "x"}))),
            ],
            &cached(),
        );
        assert!(matches!(result, Err(CoreError::BatchingConflict { .. })));
    }

    #[test]
    fn create_segment_keeps_state() {
        let current = cached();
        let plan = run(&[Operation::Create(entity(json!({"title": "x"})))], &current).unwrap();
        assert_eq!(plan.kind, SegmentKind::Create);
        assert!(plan.optimistic.ptr_eq(&current));
    }

    #[test]
    fn mixed_operations_apply_in_order() {
        let current = cached();
        let untouched = Arc::clone(current.get("b").unwrap());
        let plan = run(
            &[
                Operation::Add(entity(json!({"title": "new"}))),
                Operation::Update {
                    id: "a".into(),
                    changes: changes(json!({"title": "uno"})),
                },
                Operation::Remove { id: "a".into() },
                Operation::Upsert {
                    value: entity(json!({"id": "z", "n": 1})),
                    merge: true,
                },
            ],
            &current,
        )
        .unwrap();

        let temp = plan.targets[0].clone().unwrap();
        assert!(temp.starts_with("tmp_"));
        let a = plan.optimistic.get("a").unwrap();
        assert_eq!(a.get("title"), Some(&json!("uno")));
        assert!(a.is_deleted());
        assert!(a.get(DELETED_AT_FIELD).is_some());
        assert!(plan.optimistic.contains("z"));
        assert!(Arc::ptr_eq(plan.optimistic.get("b").unwrap(), &untouched));
        assert_eq!(plan.changed_ids, vec![temp, "a".to_string(), "z".to_string()]);
        assert_eq!(plan.base, current);
    }

    #[test]
    fn upsert_merge_stamps_and_replace_overwrites() {
        let current = cached();
        let merged = run(
            &[Operation::Upsert {
                value: entity(json!({"id": "a", "done": true})),
                merge: true,
            }],
            &current,
        )
        .unwrap();
        let a = merged.optimistic.get("a").unwrap();
        assert_eq!(a.get("title"), Some(&json!("one")));
        assert!(a.get(UPDATED_AT_FIELD).is_some());

        let replaced = run(
            &[Operation::Upsert {
                value: entity(json!({"id": "a", "done": true})),
                merge: false,
            }],
            &current,
        )
        .unwrap();
        assert_eq!(
            replaced.optimistic.get("a").unwrap().to_value(),
            json!({"id": "a", "done": true})
        );
    }

    #[test]
    fn missing_targets_fail_alone() {
        let plan = run(
            &[
                Operation::Update {
                    id: "ghost".into(),
                    changes: changes(json!({"x": 1})),
                },
                Operation::ForceRemove { id: "b".into() },
            ],
            &cached(),
        )
        .unwrap();
        assert!(matches!(plan.failure(0), Some(CoreError::EntityNotFound { .. })));
        assert!(plan.failure(1).is_none());
        assert!(!plan.optimistic.contains("b"));
    }

    #[test]
    fn patches_segment_uses_supplied_diff() {
        let current = cached();
        let plan = run(
            &[Operation::Patches {
                patches: vec![Patch::replace(vec!["a".into(), "title".into()], json!("patched"))],
                inverse: vec![Patch::replace(vec!["a".into(), "title".into()], json!("one"))],
            }],
            &current,
        )
        .unwrap();
        assert_eq!(plan.kind, SegmentKind::Patches);
        assert_eq!(plan.changed_ids, vec!["a"]);
        assert_eq!(plan.optimistic.apply_patches(&plan.inverse).unwrap(), current);
    }
}
