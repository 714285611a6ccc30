//! Property-based test generators using proptest.
//!
//! Provides strategies for generating entities and operation batches that
//! respect the pipeline's identity and version rules.

use proptest::prelude::*;
use serde_json::{json, Map, Value};
use tidal_core::{Entity, EntityMap, Operation};

/// Strategy for generating entity ids from a small pool, so generated
/// operations collide often.
pub fn entity_id_strategy() -> impl Strategy<Value = String> {
    (0u8..8).prop_map(|n| format!("e{n}"))
}

/// Strategy for generating valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-z][a-z0-9_]{0,15}").expect("Invalid regex")
}

/// Strategy for generating scalar field values.
pub fn field_value_strategy() -> impl Strategy<Value = Value> {
    prop_oneof![
        any::<bool>().prop_map(Value::Bool),
        any::<i32>().prop_map(|n| json!(n)),
        "[a-z ]{0,12}".prop_map(Value::String),
        Just(Value::Null),
    ]
}

/// Strategy for generating a small set of user fields.
pub fn fields_strategy() -> impl Strategy<Value = Map<String, Value>> {
    prop::collection::btree_map("[a-d]", field_value_strategy(), 0..4)
        .prop_map(|fields| fields.into_iter().collect())
}

/// Strategy for generating a stored entity with a positive version.
pub fn entity_strategy() -> impl Strategy<Value = Entity> {
    (entity_id_strategy(), 1i64..20, fields_strategy()).prop_map(|(id, version, fields)| {
        let mut entity = Entity::new();
        for (field, value) in fields {
            entity.set(field, value);
        }
        entity.set_id(id);
        entity.set_version(version);
        entity
    })
}

/// Strategy for generating a populated entity map.
pub fn entity_map_strategy() -> impl Strategy<Value = EntityMap> {
    prop::collection::vec(entity_strategy(), 0..6).prop_map(|entities| {
        EntityMap::from_entities(entities).expect("generated entities carry ids")
    })
}

/// Strategy for generating operations that may share one segment:
/// any mix of add, update, upsert, remove and forceRemove.
pub fn mixed_operation_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        fields_strategy().prop_map(|fields| {
            let mut entity = Entity::new();
            for (field, value) in fields {
                entity.set(field, value);
            }
            Operation::Add(entity)
        }),
        (entity_id_strategy(), fields_strategy())
            .prop_map(|(id, changes)| Operation::Update { id, changes }),
        (entity_strategy(), any::<bool>()).prop_map(|(value, merge)| Operation::Upsert { value, merge }),
        entity_id_strategy().prop_map(|id| Operation::Remove { id }),
        entity_id_strategy().prop_map(|id| Operation::ForceRemove { id }),
    ]
}

/// Strategy for generating a batch of mixed operations.
pub fn mixed_batch_strategy(max: usize) -> impl Strategy<Value = Vec<Operation>> {
    prop::collection::vec(mixed_operation_strategy(), 1..max.max(2))
}
