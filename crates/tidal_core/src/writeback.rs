//! Merges confirmed and remote data back into an entity map.
//!
//! All functions stage their changes in a [`Draft`], so entities whose
//! content did not change keep their reference.
//!
//! Server data for an entity that still has queued writes is never taken
//! as is: the queued intents are re-applied on top of it, oldest first, so
//! local edits stay visible until the authority has seen them.

use crate::entity::{Draft, DraftResult, Entity, EntityMap, DELETED_AT_FIELD, DELETED_FIELD};
use crate::persist::PersistResult;
use serde_json::Value;
use tidal_protocol::{Change, CurrentSnapshot, WriteAck, WriteAction, WriteIntent};
use tracing::{debug, warn};

/// Applies a segment's persist result.
///
/// Created entities replace their client temp id when the authority
/// confirmed a different id. Version updates only touch cached entities.
pub fn apply_persist_result(current: &EntityMap, result: &PersistResult) -> DraftResult {
    let mut draft = current.draft();
    for created in &result.created {
        place_confirmed(&mut draft, created.client_id.as_deref(), &created.entity);
    }
    for entity in &result.writeback.upserts {
        insert(&mut draft, entity.clone());
    }
    for id in &result.writeback.deletes {
        draft.remove(id);
    }
    for update in &result.writeback.version_updates {
        set_version(&mut draft, &update.key, update.version);
    }
    draft.finish()
}

/// Applies the acknowledgement of a replayed outbox write.
///
/// `pending` holds the intents still queued behind the acknowledged one.
pub fn apply_ack(
    current: &EntityMap,
    intent: &WriteIntent,
    ack: &WriteAck,
    pending: &[WriteIntent],
) -> DraftResult {
    let mut draft = current.draft();
    let confirmed = ack
        .data
        .clone()
        .and_then(|data| Entity::from_value(data).ok())
        .map(|mut entity| {
            entity.set_id(ack.entity_id.clone());
            entity
        });

    match (intent.action, confirmed) {
        (WriteAction::Create, Some(entity)) => {
            match overlay(&ack.entity_id, Some(entity), pending) {
                Some(entity) => place_confirmed(&mut draft, intent.entity_id(), &entity),
                None => {
                    if let Some(client_id) = intent.entity_id() {
                        draft.remove(client_id);
                    }
                    draft.remove(&ack.entity_id);
                }
            }
        }
        (WriteAction::Create, None) => {
            if let Some(client_id) = intent.entity_id().filter(|id| *id != ack.entity_id) {
                if let Some(existing) = draft.remove(client_id) {
                    let mut moved = (*existing).clone();
                    moved.set_id(ack.entity_id.clone());
                    insert(&mut draft, moved);
                }
            }
            set_version(&mut draft, &ack.entity_id, ack.version);
        }
        (WriteAction::Delete, _) if !intent.options.soft_delete => {}
        (_, Some(entity)) => {
            if draft.contains(&ack.entity_id) {
                match overlay(&ack.entity_id, Some(entity), pending) {
                    Some(entity) => insert(&mut draft, entity),
                    None => {
                        draft.remove(&ack.entity_id);
                    }
                }
            }
        }
        (_, None) => set_version(&mut draft, &ack.entity_id, ack.version),
    }
    draft.finish()
}

/// Replaces the cached entity with the authority's copy. A snapshot without
/// a value removes the entity.
pub fn apply_server_copy(current: &EntityMap, entity_id: &str, snapshot: &CurrentSnapshot) -> DraftResult {
    let mut draft = current.draft();
    match &snapshot.value {
        Some(value) => match Entity::from_value(value.clone()) {
            Ok(mut entity) => {
                entity.set_id(entity_id);
                if let (None, Some(version)) = (entity.version(), snapshot.version) {
                    entity.set_version(version);
                }
                insert(&mut draft, entity);
            }
            Err(err) => warn!(entity_id, error = %err, "ignoring malformed server copy"),
        },
        None => {
            draft.remove(entity_id);
        }
    }
    draft.finish()
}

/// Applies pulled or pushed remote changes of one collection.
///
/// Changes not newer than the cached version are skipped, so replaying a
/// batch is harmless. `pending` holds the collection's queued intents.
pub fn apply_changes(
    current: &EntityMap,
    collection: &str,
    changes: &[Change],
    pending: &[WriteIntent],
) -> DraftResult {
    let mut draft = current.draft();
    for change in changes.iter().filter(|c| c.collection() == collection) {
        match change {
            Change::Upsert { value, .. } => {
                let entity = match Entity::from_value(value.clone()) {
                    Ok(entity) if entity.id().is_some() => entity,
                    _ => {
                        warn!(collection, "skipping remote change without an entity id");
                        continue;
                    }
                };
                let id = entity.id().unwrap_or_default().to_string();
                if is_stale(&draft, &id, entity.version()) {
                    debug!(collection, entity_id = %id, "skipping stale remote change");
                    continue;
                }
                match overlay(&id, Some(entity), pending) {
                    Some(entity) => insert(&mut draft, entity),
                    None => {
                        draft.remove(&id);
                    }
                }
            }
            Change::Delete {
                entity_id, version, ..
            } => {
                if is_stale(&draft, entity_id, *version) {
                    debug!(collection, entity_id = %entity_id, "skipping stale remote delete");
                    continue;
                }
                match overlay(entity_id, None, pending) {
                    Some(entity) => insert(&mut draft, entity),
                    None => {
                        draft.remove(entity_id);
                    }
                }
            }
        }
    }
    draft.finish()
}

fn is_stale(draft: &Draft, id: &str, incoming: Option<i64>) -> bool {
    match (draft.get(id).and_then(|e| e.version()), incoming) {
        (Some(cached), Some(incoming)) => incoming <= cached,
        _ => false,
    }
}

/// Re-applies the queued intents of `id` on top of `base`, oldest first.
/// The result keeps the version of `base`.
fn overlay(id: &str, base: Option<Entity>, pending: &[WriteIntent]) -> Option<Entity> {
    let mut queued = pending
        .iter()
        .filter(|intent| intent.entity_id() == Some(id))
        .peekable();
    if queued.peek().is_none() {
        return base;
    }

    let version = base.as_ref().and_then(Entity::version);
    let mut entity = queued.fold(base, reapply)?;
    entity.set_id(id);
    if let Some(version) = version {
        entity.set_version(version);
    }
    debug!(entity_id = id, "kept queued local changes over server data");
    Some(entity)
}

fn reapply(entity: Option<Entity>, intent: &WriteIntent) -> Option<Entity> {
    let changes = intent.item.value.as_ref().and_then(Value::as_object);
    match intent.action {
        WriteAction::Delete if intent.options.soft_delete => entity.map(|mut entity| {
            entity.set(DELETED_FIELD, Value::Bool(true));
            entity.set(DELETED_AT_FIELD, Value::from(intent.item.meta.client_time_ms));
            entity
        }),
        WriteAction::Delete => None,
        WriteAction::Update => entity.map(|mut entity| {
            if let Some(changes) = changes {
                entity.merge(changes);
            }
            entity
        }),
        WriteAction::Create | WriteAction::Upsert => {
            let merge = intent.action == WriteAction::Upsert && !intent.options.replace;
            match (entity, changes) {
                (Some(mut entity), Some(changes)) if merge => {
                    entity.merge(changes);
                    Some(entity)
                }
                (_, Some(changes)) => Some(Entity::from(changes.clone())),
                (entity, None) => entity,
            }
        }
    }
}

/// Inserts a confirmed entity, dropping the temp entry it replaces.
fn place_confirmed(draft: &mut Draft, client_id: Option<&str>, entity: &Entity) {
    if let (Some(client_id), Some(id)) = (client_id, entity.id()) {
        if client_id != id {
            draft.remove(client_id);
        }
    }
    insert(draft, entity.clone());
}

fn insert(draft: &mut Draft, entity: Entity) {
    if let Err(err) = draft.insert(entity) {
        warn!(error = %err, "ignoring writeback value");
    }
}

fn set_version(draft: &mut Draft, id: &str, version: i64) {
    let current = draft.get(id).and_then(|e| e.version());
    if current != Some(version) {
        draft.update(id, |e| e.set_version(version));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::PersistMode;
    use crate::persist::{CreatedEntity, PersistStatus, VersionUpdate};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tidal_protocol::{WriteItem, WriteMeta, WriteOptions};

    fn entity(value: Value) -> Entity {
        Entity::from_value(value).unwrap()
    }

    fn map(values: Vec<Value>) -> EntityMap {
        EntityMap::from_entities(values.into_iter().map(entity)).unwrap()
    }

    #[test]
    fn temp_ids_are_rewritten() {
        let current = map(vec![
            json!({"id": "tmp_1", "title": "a"}),
            json!({"id": "b", "version": 1}),
        ]);
        let mut result = PersistResult::empty(PersistMode::Direct, PersistStatus::Confirmed);
        result.created.push(CreatedEntity {
            op_index: 0,
            client_id: Some("tmp_1".into()),
            entity: entity(json!({"id": "s1", "version": 1, "title": "a"})),
        });
        result.writeback.version_updates.push(VersionUpdate {
            key: "b".into(),
            version: 2,
        });

        let applied = apply_persist_result(&current, &result);
        assert!(!applied.map.contains("tmp_1"));
        assert_eq!(applied.map.get("s1").unwrap().get("title"), Some(&json!("a")));
        assert_eq!(applied.map.get("b").unwrap().version(), Some(2));
        assert_eq!(applied.map.len(), 2);
    }

    #[test]
    fn unchanged_upsert_keeps_reference() {
        let current = map(vec![json!({"id": "a", "version": 2, "title": "x"})]);
        let before = Arc::clone(current.get("a").unwrap());
        let mut result = PersistResult::empty(PersistMode::Direct, PersistStatus::Confirmed);
        result
            .writeback
            .upserts
            .push(entity(json!({"id": "a", "version": 2, "title": "x"})));
        let applied = apply_persist_result(&current, &result);
        assert!(applied.map.ptr_eq(&current));
        assert!(Arc::ptr_eq(applied.map.get("a").unwrap(), &before));
    }

    #[test]
    fn remote_changes_are_idempotent_and_skip_stale() {
        let current = map(vec![json!({"id": "a", "version": 5, "title": "new"})]);
        let changes = vec![
            Change::Upsert {
                collection: "todos".into(),
                value: json!({"id": "a", "version": 4, "title": "old"}),
            },
            Change::Upsert {
                collection: "todos".into(),
                value: json!({"id": "b", "version": 1}),
            },
            Change::Upsert {
                collection: "other".into(),
                value: json!({"id": "c", "version": 1}),
            },
        ];
        let first = apply_changes(&current, "todos", &changes, &[]);
        assert_eq!(first.map.get("a").unwrap().get("title"), Some(&json!("new")));
        assert!(first.map.contains("b"));
        assert!(!first.map.contains("c"));
        assert_eq!(first.changed_ids, vec!["b"]);

        let again = apply_changes(&first.map, "todos", &changes, &[]);
        assert!(again.changed_ids.is_empty());
        assert!(again.map.ptr_eq(&first.map));

        let deleted = apply_changes(
            &again.map,
            "todos",
            &[Change::Delete {
                collection: "todos".into(),
                entity_id: "b".into(),
                version: Some(2),
            }],
            &[],
        );
        assert!(!deleted.map.contains("b"));
    }

    #[test]
    fn server_copy_replaces_or_removes() {
        let current = map(vec![json!({"id": "a", "version": 1, "title": "local"})]);
        let replaced = apply_server_copy(
            &current,
            "a",
            &CurrentSnapshot {
                version: Some(3),
                value: Some(json!({"title": "server"})),
            },
        );
        let a = replaced.map.get("a").unwrap();
        assert_eq!(a.get("title"), Some(&json!("server")));
        assert_eq!(a.version(), Some(3));

        let removed = apply_server_copy(&current, "a", &CurrentSnapshot { version: None, value: None });
        assert!(removed.map.is_empty());
    }

    #[test]
    fn ack_bumps_version() {
        let current = map(vec![json!({"id": "a", "version": 1, "title": "x"})]);
        let intent = WriteIntent::new(
            "todos",
            WriteAction::Update,
            WriteOptions::default(),
            WriteItem {
                entity_id: Some("a".into()),
                base_version: Some(1),
                value: Some(json!({"title": "x"})),
                meta: WriteMeta::new("k", 0),
            },
        );
        let ack = WriteAck {
            entity_id: "a".into(),
            version: 2,
            data: None,
        };
        let applied = apply_ack(&current, &intent, &ack, &[]);
        assert_eq!(applied.map.get("a").unwrap().version(), Some(2));
        assert_eq!(applied.changed_ids, vec!["a"]);
    }

    fn update(id: &str, base: i64, changes: Value) -> WriteIntent {
        WriteIntent::new(
            "todos",
            WriteAction::Update,
            WriteOptions::default(),
            WriteItem {
                entity_id: Some(id.into()),
                base_version: Some(base),
                value: Some(changes),
                meta: WriteMeta::new(format!("k-{id}-{base}"), 0),
            },
        )
    }

    #[test]
    fn same_version_change_is_skipped() {
        let current = map(vec![json!({"id": "a", "version": 3, "title": "mine"})]);
        let applied = apply_changes(
            &current,
            "todos",
            &[Change::Upsert {
                collection: "todos".into(),
                value: json!({"id": "a", "version": 3, "title": "theirs"}),
            }],
            &[],
        );
        assert!(applied.changed_ids.is_empty());
        assert_eq!(applied.map.get("a").unwrap().get("title"), Some(&json!("mine")));
    }

    #[test]
    fn queued_writes_survive_newer_remote_changes() {
        let current = map(vec![
            json!({"id": "a", "version": 1, "title": "local", "done": false}),
            json!({"id": "b", "version": 1, "title": "kept"}),
        ]);
        let pending = vec![update("a", 1, json!({"title": "local"})), update("b", 1, json!({"title": "kept"}))];
        let applied = apply_changes(
            &current,
            "todos",
            &[
                Change::Upsert {
                    collection: "todos".into(),
                    value: json!({"id": "a", "version": 2, "title": "remote", "done": true}),
                },
                Change::Delete {
                    collection: "todos".into(),
                    entity_id: "b".into(),
                    version: Some(2),
                },
            ],
            &pending,
        );
        let a = applied.map.get("a").unwrap();
        assert_eq!(a.get("title"), Some(&json!("local")));
        assert_eq!(a.get("done"), Some(&json!(true)));
        assert_eq!(a.version(), Some(2));
        // an update cannot resurrect a deleted entity
        assert!(!applied.map.contains("b"));
    }

    #[test]
    fn ack_data_keeps_later_queued_edits() {
        let current = map(vec![json!({"id": "a", "version": 1, "title": "c"})]);
        let acked = update("a", 1, json!({"title": "b"}));
        let ack = WriteAck {
            entity_id: "a".into(),
            version: 2,
            data: Some(json!({"id": "a", "version": 2, "title": "b"})),
        };
        let applied = apply_ack(&current, &acked, &ack, &[update("a", 2, json!({"title": "c"}))]);
        let a = applied.map.get("a").unwrap();
        assert_eq!(a.get("title"), Some(&json!("c")));
        assert_eq!(a.version(), Some(2));

        let alone = apply_ack(&current, &acked, &ack, &[]);
        assert_eq!(alone.map.get("a").unwrap().get("title"), Some(&json!("b")));
    }
}
