//! Translates planned operations into write intents.

use super::{Plan, PlannedWrite, SegmentKind, SegmentOp};
use crate::entity::{Entity, PatchOp, ID_FIELD};
use crate::error::{CoreError, CoreResult};
use crate::operation::{Operation, PersistMode};
use serde_json::Value;
use std::collections::HashSet;
use tidal_protocol::{WriteAction, WriteIntent, WriteItem, WriteMeta, WriteOptions};

/// Produces the write intents of a planned segment.
///
/// Every intent is validated against the version and identity rules; the
/// first violation fails the whole segment. Under outbox persistence a
/// server-assigned create is rejected here, before anything is queued.
pub fn encode(
    collection: &str,
    ops: &[SegmentOp<'_>],
    plan: &Plan,
    persist: PersistMode,
) -> CoreResult<Vec<PlannedWrite>> {
    let mut encoder = Encoder {
        collection,
        ops,
        plan,
        writes: Vec::new(),
        per_op: vec![0; ops.len()],
    };
    match plan.kind {
        SegmentKind::Hydrate => {}
        SegmentKind::Patches => encoder.patches()?,
        SegmentKind::Create | SegmentKind::Mixed => encoder.operations()?,
    }

    let queued = persist == PersistMode::Outbox;
    for write in &encoder.writes {
        write.intent.validate(queued)?;
    }
    Ok(encoder.writes)
}

struct Encoder<'a, 'o> {
    collection: &'a str,
    ops: &'a [SegmentOp<'o>],
    plan: &'a Plan,
    writes: Vec<PlannedWrite>,
    per_op: Vec<usize>,
}

impl Encoder<'_, '_> {
    fn push(
        &mut self,
        op_index: usize,
        action: WriteAction,
        options: WriteOptions,
        entity_id: Option<String>,
        base_version: Option<i64>,
        value: Option<Value>,
    ) {
        let ticket = self.ops[op_index].ticket;
        // an operation may fan out (patches); keep keys distinct and stable
        let n = self.per_op[op_index];
        self.per_op[op_index] += 1;
        let key = match n {
            0 => ticket.idempotency_key().to_string(),
            n => format!("{}:{n}", ticket.idempotency_key()),
        };

        let creates = action == WriteAction::Create;
        let client_id = if creates { entity_id.clone() } else { None };
        self.writes.push(PlannedWrite {
            op_index,
            intent: WriteIntent::new(
                self.collection,
                action,
                options,
                WriteItem {
                    entity_id,
                    base_version,
                    value,
                    meta: WriteMeta::new(key, ticket.client_time_ms()),
                },
            ),
            ticket: ticket.clone(),
            creates,
            client_id,
        });
    }

    fn base_version(&self, id: &str) -> Option<i64> {
        self.plan.base.get(id).and_then(|e| e.base_version())
    }

    fn optimistic_value(&self, id: &str) -> CoreResult<Value> {
        self.plan
            .optimistic
            .get(id)
            .map(|e| e.to_value())
            .ok_or_else(|| CoreError::not_found(self.collection, id))
    }

    fn operations(&mut self) -> CoreResult<()> {
        for index in 0..self.ops.len() {
            if self.plan.failure(index).is_some() {
                continue;
            }
            let target = self.plan.targets[index].clone();
            let operation = self.ops[index].operation;
            match operation {
                Operation::Hydrate(_) | Operation::HydrateMany(_) | Operation::Patches { .. } => {}
                Operation::Add(_) => {
                    let id = target.ok_or_else(|| CoreError::invalid_entity("add without target"))?;
                    let value = self.optimistic_value(&id)?;
                    self.push(
                        index,
                        WriteAction::Create,
                        WriteOptions::default(),
                        Some(id),
                        None,
                        Some(value),
                    );
                }
                Operation::Create(entity) => {
                    let mut value = entity.clone();
                    value.remove(ID_FIELD);
                    self.push(
                        index,
                        WriteAction::Create,
                        WriteOptions::default(),
                        None,
                        None,
                        Some(value.into_value()),
                    );
                }
                Operation::Update { id, changes } => {
                    let base = self.base_version(id);
                    self.push(
                        index,
                        WriteAction::Update,
                        WriteOptions::default(),
                        Some(id.clone()),
                        base,
                        Some(Value::Object(changes.clone())),
                    );
                }
                Operation::Upsert { value, merge } => {
                    let id = target.ok_or_else(|| CoreError::invalid_entity("upsert without id"))?;
                    let base = self.base_version(&id);
                    let options = WriteOptions {
                        replace: !merge,
                        ..WriteOptions::default()
                    };
                    self.push(
                        index,
                        WriteAction::Upsert,
                        options,
                        Some(id),
                        base,
                        Some(value.to_value()),
                    );
                }
                Operation::Remove { id } => {
                    let base = self.base_version(id);
                    let options = WriteOptions {
                        soft_delete: true,
                        ..WriteOptions::default()
                    };
                    self.push(index, WriteAction::Delete, options, Some(id.clone()), base, None);
                }
                Operation::ForceRemove { id } => {
                    let base = self.base_version(id);
                    self.push(
                        index,
                        WriteAction::Delete,
                        WriteOptions::default(),
                        Some(id.clone()),
                        base,
                        None,
                    );
                }
            }
        }
        Ok(())
    }

    /// Diffs a patches segment per touched entity.
    ///
    /// An entity that appears is created, one that disappears is deleted
    /// under the version held by the inverse patch, and one that changes
    /// is updated under its cached version.
    fn patches(&mut self) -> CoreResult<()> {
        let mut seen = HashSet::new();
        let mut touched = Vec::new();
        for (index, op) in self.ops.iter().enumerate() {
            if let Operation::Patches { patches, .. } = op.operation {
                for id in patches.iter().filter_map(|p| p.root()) {
                    if seen.insert(id.to_string()) {
                        touched.push((index, id.to_string()));
                    }
                }
            }
        }

        for (index, id) in touched {
            let before = self.plan.base.get(&id).cloned();
            let after = self.plan.optimistic.get(&id).cloned();
            match (before, after) {
                (None, None) => {}
                (None, Some(after)) => self.push(
                    index,
                    WriteAction::Create,
                    WriteOptions::default(),
                    Some(id),
                    None,
                    Some(after.to_value()),
                ),
                (Some(before), Some(after)) => {
                    if before == after {
                        continue;
                    }
                    let base = before.base_version().or_else(|| after.base_version());
                    self.push(
                        index,
                        WriteAction::Update,
                        WriteOptions::default(),
                        Some(id),
                        base,
                        Some(after.to_value()),
                    );
                }
                (Some(before), None) => {
                    let base = self.deleted_version(&id).or_else(|| before.base_version());
                    self.push(
                        index,
                        WriteAction::Delete,
                        WriteOptions::default(),
                        Some(id),
                        base,
                        None,
                    );
                }
            }
        }
        Ok(())
    }

    /// Version of a deleted entity as recorded by the inverse patch that
    /// re-adds it.
    fn deleted_version(&self, id: &str) -> Option<i64> {
        self.plan
            .inverse
            .iter()
            .filter(|p| p.is_root() && p.root() == Some(id) && p.op != PatchOp::Remove)
            .filter_map(|p| p.value.clone())
            .filter_map(|v| Entity::from_value(v).ok())
            .find_map(|e| e.base_version())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityMap, Patch};
    use crate::plan::plan;
    use crate::ticket::Ticket;
    use serde_json::json;
    use tidal_protocol::ProtocolError;

    fn entity(value: Value) -> Entity {
        Entity::from_value(value).unwrap()
    }

    fn cached() -> EntityMap {
        EntityMap::from_entities([
            entity(json!({"id": "a", "version": 3, "title": "one"})),
            entity(json!({"id": "nv", "title": "unversioned"})),
        ])
        .unwrap()
    }

    fn translate(ops: &[Operation], current: &EntityMap, persist: PersistMode) -> CoreResult<Vec<PlannedWrite>> {
        let tickets: Vec<Ticket> = ops.iter().map(|_| Ticket::with_key("key", 7)).collect();
        let segment: Vec<SegmentOp<'_>> = ops
            .iter()
            .zip(&tickets)
            .map(|(operation, ticket)| SegmentOp { operation, ticket })
            .collect();
        let plan = plan("todos", &segment, current)?;
        encode("todos", &segment, &plan, persist)
    }

    #[test]
    fn base_versions_come_from_the_cache() {
        let writes = translate(
            &[
                Operation::Update {
                    id: "a".into(),
                    changes: json!({"title": "x"}).as_object().unwrap().clone(),
                },
                Operation::Remove { id: "a".into() },
            ],
            &cached(),
            PersistMode::Direct,
        )
        .unwrap();

        assert_eq!(writes[0].intent.action, WriteAction::Update);
        assert_eq!(writes[0].intent.item.base_version, Some(3));
        assert_eq!(writes[0].intent.item.value, Some(json!({"title": "x"})));
        assert_eq!(writes[1].intent.action, WriteAction::Delete);
        assert!(writes[1].intent.options.soft_delete);
        assert_eq!(writes[1].intent.item.base_version, Some(3));
        assert_eq!(writes[0].intent.item.meta.client_time_ms, 7);
    }

    #[test]
    fn missing_base_version_is_a_hard_error() {
        for op in [
            Operation::Update {
                id: "nv".into(),
                changes: json!({"title": "x"}).as_object().unwrap().clone(),
            },
            Operation::ForceRemove { id: "nv".into() },
        ] {
            let err = translate(&[op], &cached(), PersistMode::Direct).unwrap_err();
            assert!(matches!(
                err,
                CoreError::Validation(ProtocolError::MissingBaseVersion { .. })
            ));
            assert!(err.to_string().contains("[requires baseVersion]"));
        }
    }

    #[test]
    fn upsert_version_is_optional() {
        let writes = translate(
            &[Operation::Upsert {
                value: entity(json!({"id": "nv", "title": "blind"})),
                merge: false,
            }],
            &cached(),
            PersistMode::Outbox,
        )
        .unwrap();
        assert_eq!(writes[0].intent.item.base_version, None);
        assert!(writes[0].intent.options.replace);
    }

    #[test]
    fn add_carries_client_id_and_create_does_not() {
        let writes = translate(&[Operation::Add(entity(json!({"title": "a"})))], &cached(), PersistMode::Outbox)
            .unwrap();
        let id = writes[0].intent.entity_id().unwrap();
        assert!(id.starts_with("tmp_"));
        assert_eq!(writes[0].client_id.as_deref(), Some(id));
        assert!(writes[0].creates);

        let writes = translate(
            &[Operation::Create(entity(json!({"id": "ignored", "title": "a"})))],
            &cached(),
            PersistMode::Direct,
        )
        .unwrap();
        assert!(writes[0].intent.is_server_assigned_create());
        assert_eq!(writes[0].intent.item.value, Some(json!({"title": "a"})));
    }

    #[test]
    fn server_assigned_create_is_forbidden_in_outbox() {
        let err = translate(
            &[Operation::Create(entity(json!({"title": "a"})))],
            &cached(),
            PersistMode::Outbox,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            CoreError::Validation(ProtocolError::UnreplayableCreate { .. })
        ));
    }

    #[test]
    fn patches_map_to_root_actions() {
        let current = cached();
        let ops = [Operation::Patches {
            patches: vec![
                Patch::add(vec!["n".into()], json!({"id": "n", "title": "new"})),
                Patch::replace(vec!["a".into(), "title".into()], json!("changed")),
                Patch::remove(vec!["a".into()]),
                Patch::add(vec!["a".into()], json!({"id": "a", "version": 3, "title": "back"})),
            ],
            inverse: vec![],
        }];
        let writes = translate(&ops, &current, PersistMode::Direct).unwrap();
        let actions: Vec<_> = writes
            .iter()
            .map(|w| (w.intent.entity_id().unwrap().to_string(), w.intent.action, w.intent.item.base_version))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("n".to_string(), WriteAction::Create, None),
                ("a".to_string(), WriteAction::Update, Some(3)),
            ]
        );
        assert_eq!(writes[0].intent.idempotency_key(), "key");
        assert_eq!(writes[1].intent.idempotency_key(), "key:1");
    }

    #[test]
    fn patch_delete_takes_version_from_inverse() {
        let current = cached();
        let ops = [Operation::Patches {
            patches: vec![Patch::remove(vec!["a".into()])],
            inverse: vec![Patch::add(
                vec!["a".into()],
                json!({"id": "a", "version": 3, "title": "one"}),
            )],
        }];
        let writes = translate(&ops, &current, PersistMode::Outbox).unwrap();
        assert_eq!(writes[0].intent.action, WriteAction::Delete);
        assert_eq!(writes[0].intent.item.base_version, Some(3));

        let ops = [Operation::Patches {
            patches: vec![Patch::remove(vec!["nv".into()])],
            inverse: vec![],
        }];
        assert!(translate(&ops, &current, PersistMode::Outbox).is_err());
    }
}
