//! In-memory storage backend.

use super::DurableStorage;
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::HashMap;

/// A volatile [`DurableStorage`] for tests and ephemeral sessions.
///
/// Clones of the map can be taken with [`MemoryStorage::snapshot`] to
/// simulate a restart with the same persisted state.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStorage {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a new store holding a copy of this store's values.
    #[must_use]
    pub fn snapshot(&self) -> Self {
        Self {
            values: RwLock::new(self.values.read().clone()),
        }
    }

    /// Returns the number of stored keys.
    pub fn len(&self) -> usize {
        self.values.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.values.read().is_empty()
    }
}

impl DurableStorage for MemoryStorage {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        Ok(self.values.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        self.values.write().insert(key.to_string(), value.to_vec());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.values.write().remove(key);
        Ok(())
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StorageResult<bool> {
        let mut values = self.values.write();
        if values.get(key).map(Vec::as_slice) != expected {
            return Ok(false);
        }
        match new {
            Some(bytes) => values.insert(key.to_string(), bytes.to_vec()),
            None => values.remove(key),
        };
        Ok(true)
    }
}
