//! Durable key-value storage for the outbox, cursor and sync lock.
//!
//! Backends are opaque byte stores keyed by string. Callers own the value
//! format; the helpers here encode values as CBOR.

mod file;
mod memory;

pub use file::FileStorage;
pub use memory::MemoryStorage;

use crate::error::{StorageError, StorageResult};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A crash-durable key-value store.
///
/// # Invariants
///
/// - `set` returns only after the value survives process termination
/// - `compare_and_swap` is atomic with respect to other calls on the same
///   backend instance
pub trait DurableStorage: Send + Sync {
    /// Reads the value stored under `key`.
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()>;

    /// Removes `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Replaces the value under `key` with `new` if it currently equals
    /// `expected`. `None` stands for "absent" on both sides.
    ///
    /// Returns true if the swap happened.
    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StorageResult<bool>;
}

/// Reads and decodes a CBOR value.
pub fn load<T: DeserializeOwned>(storage: &dyn DurableStorage, key: &str) -> StorageResult<Option<T>> {
    match storage.get(key)? {
        Some(bytes) => tidal_protocol::decode(&bytes)
            .map(Some)
            .map_err(|e| StorageError::Corrupted(format!("{key}: {e}"))),
        None => Ok(None),
    }
}

/// Encodes a value as CBOR and stores it.
pub fn store<T: Serialize>(storage: &dyn DurableStorage, key: &str, value: &T) -> StorageResult<()> {
    let bytes = tidal_protocol::encode(value).map_err(|e| StorageError::Corrupted(e.to_string()))?;
    storage.set(key, &bytes)
}
