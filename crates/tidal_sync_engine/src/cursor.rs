//! Durable remote cursor.

use crate::error::SyncResult;
use parking_lot::Mutex;
use std::sync::Arc;
use tidal_core::storage::{load, store};
use tidal_core::DurableStorage;
use tidal_protocol::Cursor;
use tracing::debug;

/// Position of the engine in the remote change stream.
///
/// The cursor is written through to storage on every advance and cached in
/// memory. It only moves after the changes before it were applied.
pub struct CursorStore {
    storage: Arc<dyn DurableStorage>,
    key: String,
    cached: Mutex<Option<Option<Cursor>>>,
}

impl CursorStore {
    /// Creates a store reading and writing `key`.
    pub fn new(storage: Arc<dyn DurableStorage>, key: impl Into<String>) -> Self {
        Self {
            storage,
            key: key.into(),
            cached: Mutex::new(None),
        }
    }

    /// Returns the stored cursor.
    pub fn get(&self) -> SyncResult<Option<Cursor>> {
        let mut cached = self.cached.lock();
        if let Some(cursor) = cached.as_ref() {
            return Ok(cursor.clone());
        }
        let cursor: Option<Cursor> = load(self.storage.as_ref(), &self.key)?;
        *cached = Some(cursor.clone());
        Ok(cursor)
    }

    /// Stores `cursor`. Storing the current value is a no-op.
    pub fn advance(&self, cursor: &Cursor) -> SyncResult<()> {
        let mut cached = self.cached.lock();
        if matches!(cached.as_ref(), Some(Some(current)) if current == cursor) {
            return Ok(());
        }
        store(self.storage.as_ref(), &self.key, cursor)?;
        debug!(key = %self.key, cursor = %cursor, "advanced cursor");
        *cached = Some(Some(cursor.clone()));
        Ok(())
    }

    /// Forgets the cursor, so the next pull starts from the beginning.
    pub fn reset(&self) -> SyncResult<()> {
        let mut cached = self.cached.lock();
        self.storage.remove(&self.key)?;
        *cached = Some(None);
        Ok(())
    }
}

impl std::fmt::Debug for CursorStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CursorStore").field("key", &self.key).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tidal_core::MemoryStorage;

    #[test]
    fn cursor_survives_a_new_store() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let store = CursorStore::new(Arc::clone(&storage), "sync:test:cursor");
        assert_eq!(store.get().unwrap(), None);

        store.advance(&Cursor::new("12")).unwrap();
        assert_eq!(store.get().unwrap(), Some(Cursor::new("12")));

        let reopened = CursorStore::new(storage, "sync:test:cursor");
        assert_eq!(reopened.get().unwrap(), Some(Cursor::new("12")));

        reopened.reset().unwrap();
        assert_eq!(reopened.get().unwrap(), None);
    }
}
