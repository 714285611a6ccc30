//! Test fixtures and collection helpers.
//!
//! Provides convenience functions for building collections wired to a
//! [`MemoryAuthority`] and for durable storage that cleans up after itself.

use crate::authority::MemoryAuthority;
use serde_json::{json, Value};
use std::sync::Arc;
use tempfile::TempDir;
use tidal_core::{
    Collection, CollectionConfig, DurableStorage, EntityMap, FileStorage, MemoryStorage,
    OutboxConfig,
};

/// File-backed storage in a temporary directory.
pub struct TempStorage {
    /// The storage instance.
    pub storage: Arc<FileStorage>,
    /// The temporary directory (kept alive to prevent cleanup).
    dir: TempDir,
}

impl TempStorage {
    /// Creates storage in a fresh temporary directory.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("Failed to create temp directory");
        let storage = Arc::new(FileStorage::open(dir.path()).expect("Failed to open file storage"));
        Self { storage, dir }
    }

    /// Opens a second handle on the same directory, as a restarted process
    /// would.
    pub fn reopen(&self) -> Arc<FileStorage> {
        Arc::new(FileStorage::open(self.dir.path()).expect("Failed to reopen file storage"))
    }

    /// Returns the storage as a trait object.
    pub fn shared(&self) -> Arc<dyn DurableStorage> {
        self.storage.clone()
    }
}

impl Default for TempStorage {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns a todo value without an id.
pub fn todo(title: &str) -> Value {
    json!({ "title": title, "done": false })
}

/// Returns a todo value with an id and version, as the authority stores it.
pub fn stored_todo(id: &str, version: i64, title: &str) -> Value {
    json!({ "id": id, "version": version, "title": title, "done": false })
}

/// Builds a collection that persists directly against `authority`.
pub fn direct_collection(name: &str, authority: Arc<MemoryAuthority>) -> Collection {
    Collection::builder(name)
        .remote(authority)
        .build()
        .expect("Failed to build collection")
}

/// Builds an outbox-backed collection over in-memory storage.
pub fn outbox_collection(
    name: &str,
    authority: Arc<MemoryAuthority>,
    config: OutboxConfig,
) -> (Collection, Arc<MemoryStorage>) {
    let storage = Arc::new(MemoryStorage::new());
    let collection = outbox_collection_with(name, authority, storage.clone(), config);
    (collection, storage)
}

/// Builds an outbox-backed collection over the given storage.
pub fn outbox_collection_with(
    name: &str,
    authority: Arc<MemoryAuthority>,
    storage: Arc<dyn DurableStorage>,
    config: OutboxConfig,
) -> Collection {
    Collection::builder(name)
        .remote(authority)
        .outbox(storage, config)
        .build()
        .expect("Failed to build outbox collection")
}

/// Builds a collection with the given configuration and no remote.
pub fn local_collection(config: CollectionConfig) -> Collection {
    Collection::builder(config.name.clone())
        .config(config)
        .build()
        .expect("Failed to build collection")
}

/// Seeds entities into a collection without persisting them.
pub async fn seed(collection: &Collection, values: Vec<Value>) {
    collection
        .hydrate_many(values)
        .await
        .expect("Failed to hydrate collection");
}

/// Returns the map's entities as JSON values, ordered by id.
pub fn values(map: &EntityMap) -> Vec<Value> {
    map.iter().map(|(_, entity)| entity.to_value()).collect()
}

/// Returns the value of `field` for every entity, ordered by id.
pub fn field_values(map: &EntityMap, field: &str) -> Vec<Value> {
    map.iter()
        .map(|(_, entity)| entity.get(field).cloned().unwrap_or(Value::Null))
        .collect()
}
