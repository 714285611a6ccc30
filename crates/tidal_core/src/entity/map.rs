//! Copy-on-write entity map with forward and inverse patches.
//!
//! An `EntityMap` is never mutated in place. Changes are staged in a
//! [`Draft`], and finishing the draft yields a new map together with the
//! patches that lead to it and the inverse patches that undo it. Entities
//! that did not change keep their `Arc`, so readers comparing references
//! can tell what moved.
//!
//! Patch paths have at most two segments: `[id]` addresses a whole entity,
//! `[id, field]` a single top-level field.

use super::Entity;
use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

/// Structural patch operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchOp {
    /// Path did not exist and now holds `value`.
    Add,
    /// Path held something else and now holds `value`.
    Replace,
    /// Path was removed.
    Remove,
}

/// A structural change to an entity map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Patch {
    /// Operation.
    pub op: PatchOp,
    /// `[id]` or `[id, field]`.
    pub path: Vec<String>,
    /// New value for `Add`/`Replace`.
    pub value: Option<Value>,
}

impl Patch {
    /// Creates an `Add` patch.
    pub fn add(path: Vec<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Add,
            path,
            value: Some(value),
        }
    }

    /// Creates a `Replace` patch.
    pub fn replace(path: Vec<String>, value: Value) -> Self {
        Self {
            op: PatchOp::Replace,
            path,
            value: Some(value),
        }
    }

    /// Creates a `Remove` patch.
    pub fn remove(path: Vec<String>) -> Self {
        Self {
            op: PatchOp::Remove,
            path,
            value: None,
        }
    }

    /// Returns the entity id the patch touches.
    pub fn root(&self) -> Option<&str> {
        self.path.first().map(String::as_str)
    }

    /// Returns true if the patch addresses a whole entity.
    pub fn is_root(&self) -> bool {
        self.path.len() == 1
    }
}

/// Immutable map of entities keyed by id.
#[derive(Debug, Clone, Default)]
pub struct EntityMap {
    entries: Arc<BTreeMap<String, Arc<Entity>>>,
}

impl EntityMap {
    /// Creates an empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a map from entities. Every entity needs an id.
    pub fn from_entities(entities: impl IntoIterator<Item = Entity>) -> CoreResult<Self> {
        let mut draft = Self::new().draft();
        for entity in entities {
            draft.insert(entity)?;
        }
        Ok(draft.finish().map)
    }

    /// Returns the entity with the given id.
    pub fn get(&self, id: &str) -> Option<&Arc<Entity>> {
        self.entries.get(id)
    }

    /// Returns true if the id is present.
    pub fn contains(&self, id: &str) -> bool {
        self.entries.contains_key(id)
    }

    /// Returns the number of entities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over ids in order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Iterates over entries in id order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<Entity>)> {
        self.entries.iter().map(|(id, e)| (id.as_str(), e))
    }

    /// Returns true if both maps are the same snapshot.
    pub fn ptr_eq(&self, other: &EntityMap) -> bool {
        Arc::ptr_eq(&self.entries, &other.entries)
    }

    /// Starts staging changes on top of this map.
    pub fn draft(&self) -> Draft {
        Draft {
            base: self.clone(),
            working: (*self.entries).clone(),
            touched: Vec::new(),
            touched_set: HashSet::new(),
        }
    }

    /// Applies patches and returns the resulting map.
    ///
    /// Fails without producing a partial map when a patch does not fit.
    pub fn apply_patches(&self, patches: &[Patch]) -> CoreResult<EntityMap> {
        if patches.is_empty() {
            return Ok(self.clone());
        }
        let mut working = (*self.entries).clone();
        for patch in patches {
            apply_patch(&mut working, patch)?;
        }
        Ok(EntityMap {
            entries: Arc::new(working),
        })
    }
}

impl PartialEq for EntityMap {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.entries == other.entries
    }
}

fn apply_patch(working: &mut BTreeMap<String, Arc<Entity>>, patch: &Patch) -> CoreResult<()> {
    let (id, field) = match patch.path.as_slice() {
        [id] => (id, None),
        [id, field] => (id, Some(field)),
        [] => return Err(CoreError::invalid_patch("empty patch path")),
        _ => {
            return Err(CoreError::invalid_patch(format!(
                "path {:?} is deeper than entity fields",
                patch.path
            )))
        }
    };

    let value = || {
        patch
            .value
            .clone()
            .ok_or_else(|| CoreError::invalid_patch(format!("{:?} patch without value", patch.op)))
    };

    match (field, patch.op) {
        (None, PatchOp::Add | PatchOp::Replace) => {
            let entity = Entity::from_value(value()?)?;
            working.insert(id.clone(), Arc::new(entity));
        }
        (None, PatchOp::Remove) => {
            if working.remove(id).is_none() {
                return Err(CoreError::invalid_patch(format!("remove of absent entity {id}")));
            }
        }
        (Some(field), op) => {
            let entity = working
                .get_mut(id)
                .ok_or_else(|| CoreError::invalid_patch(format!("field patch on absent entity {id}")))?;
            let entity = Arc::make_mut(entity);
            match op {
                PatchOp::Add | PatchOp::Replace => entity.set(field.clone(), value()?),
                PatchOp::Remove => {
                    entity.remove(field);
                }
            }
        }
    }
    Ok(())
}

/// Staged changes over a base map.
pub struct Draft {
    base: EntityMap,
    working: BTreeMap<String, Arc<Entity>>,
    touched: Vec<String>,
    touched_set: HashSet<String>,
}

/// Outcome of finishing a draft.
#[derive(Debug, Clone)]
pub struct DraftResult {
    /// The new map. Pointer-equal to the base when nothing changed.
    pub map: EntityMap,
    /// Patches from base to `map`.
    pub patches: Vec<Patch>,
    /// Patches from `map` back to base.
    pub inverse: Vec<Patch>,
    /// Ids whose entity changed, in first-touch order.
    pub changed_ids: Vec<String>,
}

impl Draft {
    /// Returns the staged entity with the given id.
    pub fn get(&self, id: &str) -> Option<&Arc<Entity>> {
        self.working.get(id)
    }

    /// Returns true if the id is present in the staged state.
    pub fn contains(&self, id: &str) -> bool {
        self.working.contains_key(id)
    }

    /// Inserts or replaces an entity. The entity needs an id.
    pub fn insert(&mut self, entity: Entity) -> CoreResult<()> {
        let id = entity
            .id()
            .ok_or_else(|| CoreError::invalid_entity("entity has no id"))?
            .to_string();
        self.insert_shared(id, Arc::new(entity));
        Ok(())
    }

    /// Inserts an already shared entity under `id`.
    pub fn insert_shared(&mut self, id: String, entity: Arc<Entity>) {
        self.touch(&id);
        self.working.insert(id, entity);
    }

    /// Mutates an entity in place. Returns false if the id is absent.
    pub fn update(&mut self, id: &str, f: impl FnOnce(&mut Entity)) -> bool {
        if !self.working.contains_key(id) {
            return false;
        }
        self.touch(id);
        if let Some(entity) = self.working.get_mut(id) {
            f(Arc::make_mut(entity));
        }
        true
    }

    /// Removes an entity.
    pub fn remove(&mut self, id: &str) -> Option<Arc<Entity>> {
        let removed = self.working.remove(id);
        if removed.is_some() {
            self.touch(id);
        }
        removed
    }

    fn touch(&mut self, id: &str) {
        if self.touched_set.insert(id.to_string()) {
            self.touched.push(id.to_string());
        }
    }

    /// Finishes the draft, producing the new map and its patches.
    pub fn finish(mut self) -> DraftResult {
        let mut patches = Vec::new();
        let mut inverse = Vec::new();
        let mut changed_ids = Vec::new();

        for id in &self.touched {
            let before = self.base.get(id).cloned();
            let after = self.working.get(id).cloned();
            let changed = match (before, after) {
                (None, None) => false,
                (None, Some(after)) => {
                    patches.push(Patch::add(vec![id.clone()], after.to_value()));
                    inverse.push(Patch::remove(vec![id.clone()]));
                    true
                }
                (Some(before), None) => {
                    patches.push(Patch::remove(vec![id.clone()]));
                    inverse.push(Patch::add(vec![id.clone()], before.to_value()));
                    true
                }
                (Some(before), Some(after)) => {
                    if Arc::ptr_eq(&before, &after) {
                        false
                    } else if before == after {
                        // keep the original reference for unchanged content
                        self.working.insert(id.clone(), before);
                        false
                    } else {
                        diff_fields(id, &before, &after, &mut patches, &mut inverse);
                        true
                    }
                }
            };
            if changed {
                changed_ids.push(id.clone());
            }
        }

        inverse.reverse();
        let map = if changed_ids.is_empty() {
            self.base.clone()
        } else {
            EntityMap {
                entries: Arc::new(self.working),
            }
        };

        DraftResult {
            map,
            patches,
            inverse,
            changed_ids,
        }
    }
}

fn diff_fields(
    id: &str,
    before: &Entity,
    after: &Entity,
    patches: &mut Vec<Patch>,
    inverse: &mut Vec<Patch>,
) {
    let path = |field: &str| vec![id.to_string(), field.to_string()];

    for (field, value) in after.fields() {
        match before.get(field) {
            None => {
                patches.push(Patch::add(path(field), value.clone()));
                inverse.push(Patch::remove(path(field)));
            }
            Some(old) if old != value => {
                patches.push(Patch::replace(path(field), value.clone()));
                inverse.push(Patch::replace(path(field), old.clone()));
            }
            Some(_) => {}
        }
    }
    for (field, old) in before.fields() {
        if after.get(field).is_none() {
            patches.push(Patch::remove(path(field)));
            inverse.push(Patch::add(path(field), old.clone()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn entity(value: Value) -> Entity {
        Entity::from_value(value).unwrap()
    }

    fn sample() -> EntityMap {
        EntityMap::from_entities([
            entity(json!({"id": "a", "version": 1, "title": "one"})),
            entity(json!({"id": "b", "version": 2, "title": "two", "done": false})),
        ])
        .unwrap()
    }

    #[test]
    fn untouched_draft_keeps_snapshot() {
        let map = sample();
        let result = map.draft().finish();
        assert!(result.map.ptr_eq(&map));
        assert!(result.patches.is_empty());
    }

    #[test]
    fn same_content_keeps_reference() {
        let map = sample();
        let original = Arc::clone(map.get("a").unwrap());
        let mut draft = map.draft();
        draft.insert(entity(json!({"id": "a", "version": 1, "title": "one"}))).unwrap();
        let result = draft.finish();
        assert!(result.changed_ids.is_empty());
        assert!(Arc::ptr_eq(result.map.get("a").unwrap(), &original));
    }

    #[test]
    fn field_level_patches_and_inverse() {
        let map = sample();
        let untouched = Arc::clone(map.get("a").unwrap());
        let mut draft = map.draft();
        draft.update("b", |e| {
            e.set("title", json!("deux"));
            e.remove("done");
            e.set("tag", json!("x"));
        });
        let result = draft.finish();

        assert_eq!(result.changed_ids, vec!["b".to_string()]);
        assert!(result.patches.iter().all(|p| p.path.len() == 2));
        assert!(Arc::ptr_eq(result.map.get("a").unwrap(), &untouched));
        assert_eq!(result.map.get("b").unwrap().get("title"), Some(&json!("deux")));

        let restored = result.map.apply_patches(&result.inverse).unwrap();
        assert_eq!(restored, map);
    }

    #[test]
    fn root_add_and_remove() {
        let map = sample();
        let mut draft = map.draft();
        draft.remove("a");
        draft.insert(entity(json!({"id": "c", "title": "three"}))).unwrap();
        let result = draft.finish();

        assert_eq!(result.changed_ids, vec!["a".to_string(), "c".to_string()]);
        assert!(result.patches.iter().all(Patch::is_root));
        assert!(!result.map.contains("a"));
        assert!(result.map.contains("c"));
        assert!(map.contains("a"), "base snapshot is never mutated");

        let replayed = map.apply_patches(&result.patches).unwrap();
        assert_eq!(replayed, result.map);
    }

    #[test]
    fn invalid_patches_fail_whole() {
        let map = sample();
        let patches = vec![
            Patch::replace(vec!["a".into(), "title".into()], json!("changed")),
            Patch::remove(vec!["zzz".into()]),
        ];
        assert!(matches!(
            map.apply_patches(&patches),
            Err(CoreError::InvalidPatch { .. })
        ));
        assert!(map
            .apply_patches(&[Patch::remove(vec!["a".into(), "b".into(), "c".into()])])
            .is_err());
    }

    proptest! {
        #[test]
        fn inverse_restores_base(
            edits in prop::collection::vec((0u8..6, 0u8..4, any::<i32>()), 0..24)
        ) {
            let base = sample();
            let mut draft = base.draft();
            for (slot, action, n) in edits {
                let id = format!("e{slot}");
                match action {
                    0 => {
                        draft
                            .insert(entity(json!({"id": id, "version": 1, "n": n})))
                            .unwrap();
                    }
                    1 => {
                        draft.update(&id, |e| e.set("n", json!(n)));
                    }
                    2 => {
                        draft.remove(&id);
                    }
                    _ => {
                        draft.update("b", |e| e.set(format!("f{slot}"), json!(n)));
                    }
                }
            }
            let result = draft.finish();
            let restored = result.map.apply_patches(&result.inverse).unwrap();
            prop_assert_eq!(restored, base.clone());
            let replayed = base.apply_patches(&result.patches).unwrap();
            prop_assert_eq!(replayed, result.map);
        }
    }
}
