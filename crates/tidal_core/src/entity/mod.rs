//! Entity model and the copy-on-write entity map.

mod id;
mod map;

pub use id::{idempotency_key, now_ms, temp_id, TEMP_ID_PREFIX};
pub use map::{Draft, DraftResult, EntityMap, Patch, PatchOp};

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Field holding the entity id.
pub const ID_FIELD: &str = "id";
/// Field holding the optimistic-concurrency version.
pub const VERSION_FIELD: &str = "version";
/// Soft-delete marker field.
pub const DELETED_FIELD: &str = "deleted";
/// Soft-delete timestamp field.
pub const DELETED_AT_FIELD: &str = "deletedAt";
/// Local modification stamp written by merging upserts.
pub const UPDATED_AT_FIELD: &str = "updatedAt";

/// An application record: a JSON object with an `id` and a `version`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Entity {
    fields: Map<String, Value>,
}

impl Entity {
    /// Creates an empty entity.
    pub fn new() -> Self {
        Self::default()
    }

    /// Converts a JSON value into an entity. The value must be an object.
    pub fn from_value(value: Value) -> CoreResult<Self> {
        match value {
            Value::Object(fields) => Ok(Self { fields }),
            other => Err(CoreError::invalid_entity(format!(
                "expected a JSON object, got {other}"
            ))),
        }
    }

    /// Returns the entity id.
    pub fn id(&self) -> Option<&str> {
        self.fields.get(ID_FIELD).and_then(Value::as_str)
    }

    /// Sets the entity id.
    pub fn set_id(&mut self, id: impl Into<String>) {
        self.fields.insert(ID_FIELD.into(), Value::String(id.into()));
    }

    /// Returns the version, if present and integral.
    pub fn version(&self) -> Option<i64> {
        self.fields.get(VERSION_FIELD).and_then(Value::as_i64)
    }

    /// Returns the version if it is a usable precondition (positive).
    pub fn base_version(&self) -> Option<i64> {
        self.version().filter(|v| *v > 0)
    }

    /// Sets the version.
    pub fn set_version(&mut self, version: i64) {
        self.fields.insert(VERSION_FIELD.into(), Value::from(version));
    }

    /// Returns true if the entity carries the soft-delete marker.
    pub fn is_deleted(&self) -> bool {
        self.fields
            .get(DELETED_FIELD)
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Returns a field value.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field)
    }

    /// Sets a field value.
    pub fn set(&mut self, field: impl Into<String>, value: Value) {
        self.fields.insert(field.into(), value);
    }

    /// Removes a field.
    pub fn remove(&mut self, field: &str) -> Option<Value> {
        self.fields.remove(field)
    }

    /// Returns all fields.
    pub fn fields(&self) -> &Map<String, Value> {
        &self.fields
    }

    /// Shallow field union: every field of `changes` overwrites ours.
    pub fn merge(&mut self, changes: &Map<String, Value>) {
        for (field, value) in changes {
            self.fields.insert(field.clone(), value.clone());
        }
    }

    /// Returns the entity as a JSON value.
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Converts the entity into a JSON value.
    pub fn into_value(self) -> Value {
        Value::Object(self.fields)
    }
}

impl From<Map<String, Value>> for Entity {
    fn from(fields: Map<String, Value>) -> Self {
        Self { fields }
    }
}

impl TryFrom<Value> for Entity {
    type Error = CoreError;

    fn try_from(value: Value) -> CoreResult<Self> {
        Entity::from_value(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn accessors() {
        let mut entity = Entity::from_value(json!({"id": "a", "version": 3, "title": "x"})).unwrap();
        assert_eq!(entity.id(), Some("a"));
        assert_eq!(entity.version(), Some(3));
        assert_eq!(entity.base_version(), Some(3));
        assert!(!entity.is_deleted());

        entity.set_version(0);
        assert_eq!(entity.base_version(), None);

        entity.set(DELETED_FIELD, json!(true));
        assert!(entity.is_deleted());
    }

    #[test]
    fn non_objects_are_rejected() {
        assert!(Entity::from_value(json!([1, 2])).is_err());
        assert!(Entity::try_from(json!("a")).is_err());
    }

    #[test]
    fn merge_is_shallow() {
        let mut entity = Entity::from_value(json!({"id": "a", "meta": {"x": 1}, "n": 1})).unwrap();
        let changes = json!({"meta": {"y": 2}, "extra": true});
        entity.merge(changes.as_object().unwrap());
        assert_eq!(
            entity.to_value(),
            json!({"id": "a", "meta": {"y": 2}, "n": 1, "extra": true})
        );
    }
}
