//! Cross-instance sync lock.
//!
//! The lock is a small CBOR record in durable storage, taken and renewed with
//! compare-and-swap. It is advisory and expires on its own, so a crashed
//! holder blocks others for at most one TTL.

use crate::config::LockConfig;
use crate::error::SyncResult;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tidal_core::{now_ms, DurableStorage, StorageError};
use tracing::{debug, info, warn};

/// The stored lock record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    /// Owner id of the holder.
    pub owner: String,
    /// Wall-clock expiry in milliseconds since the epoch.
    pub expires_at_ms: i64,
}

impl LockRecord {
    /// Returns true if the record no longer protects anything at `now_ms`.
    pub fn is_expired(&self, now_ms: i64) -> bool {
        self.expires_at_ms <= now_ms
    }
}

/// Outcome of an acquire attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// This instance holds the lock.
    Acquired,
    /// Another live instance holds it.
    Held(LockRecord),
}

/// Handle on the sync lock of one scope.
pub struct SyncLock {
    storage: Arc<dyn DurableStorage>,
    key: String,
    config: LockConfig,
}

impl SyncLock {
    /// Creates a handle for `key`.
    pub fn new(storage: Arc<dyn DurableStorage>, key: impl Into<String>, config: LockConfig) -> Self {
        Self {
            storage,
            key: key.into(),
            config,
        }
    }

    /// Returns this instance's owner id.
    pub fn owner(&self) -> &str {
        &self.config.owner
    }

    /// Returns the lock configuration.
    pub fn config(&self) -> &LockConfig {
        &self.config
    }

    fn read(&self) -> SyncResult<(Option<Vec<u8>>, Option<LockRecord>)> {
        let raw = self.storage.get(&self.key)?;
        let record = match raw.as_deref() {
            Some(bytes) => match tidal_protocol::decode::<LockRecord>(bytes) {
                Ok(record) => Some(record),
                Err(err) => {
                    // an unreadable record is treated as free and overwritten
                    warn!(key = %self.key, error = %err, "ignoring corrupted sync lock");
                    None
                }
            },
            None => None,
        };
        Ok((raw, record))
    }

    fn record(&self, now: i64) -> SyncResult<Vec<u8>> {
        let record = LockRecord {
            owner: self.config.owner.clone(),
            expires_at_ms: now + self.config.ttl.as_millis() as i64,
        };
        tidal_protocol::encode(&record)
            .map_err(|e| StorageError::Corrupted(e.to_string()).into())
    }

    /// Takes the lock if it is free, expired or already ours.
    pub fn try_acquire(&self) -> SyncResult<Acquire> {
        loop {
            let now = now_ms();
            let (raw, current) = self.read()?;
            if let Some(record) = current {
                if record.owner != self.config.owner && !record.is_expired(now) {
                    debug!(key = %self.key, holder = %record.owner, "sync lock busy");
                    return Ok(Acquire::Held(record));
                }
            }

            let new = self.record(now)?;
            if self.storage.compare_and_swap(&self.key, raw.as_deref(), Some(&new))? {
                info!(key = %self.key, owner = %self.config.owner, "acquired sync lock");
                return Ok(Acquire::Acquired);
            }
            // the record changed underneath us; look again
        }
    }

    /// Extends the lock. Returns false if it is no longer ours.
    pub fn renew(&self) -> SyncResult<bool> {
        let (raw, current) = self.read()?;
        match current {
            Some(record) if record.owner == self.config.owner => {
                let new = self.record(now_ms())?;
                let renewed = self
                    .storage
                    .compare_and_swap(&self.key, raw.as_deref(), Some(&new))?;
                if !renewed {
                    warn!(key = %self.key, "sync lock changed during renewal");
                }
                Ok(renewed)
            }
            _ => {
                warn!(key = %self.key, owner = %self.config.owner, "sync lock lost");
                Ok(false)
            }
        }
    }

    /// Releases the lock if this instance holds it.
    pub fn release(&self) -> SyncResult<bool> {
        let (raw, current) = self.read()?;
        match current {
            Some(record) if record.owner == self.config.owner => {
                let released = self.storage.compare_and_swap(&self.key, raw.as_deref(), None)?;
                if released {
                    debug!(key = %self.key, "released sync lock");
                }
                Ok(released)
            }
            _ => Ok(false),
        }
    }

    /// Returns the current live holder, if any.
    pub fn holder(&self) -> SyncResult<Option<LockRecord>> {
        let now = now_ms();
        Ok(self.read()?.1.filter(|record| !record.is_expired(now)))
    }

    /// Returns true if this instance holds a live lock.
    pub fn is_held(&self) -> SyncResult<bool> {
        Ok(self
            .holder()?
            .is_some_and(|record| record.owner == self.config.owner))
    }
}

impl std::fmt::Debug for SyncLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncLock")
            .field("key", &self.key)
            .field("owner", &self.config.owner)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tidal_core::MemoryStorage;

    fn lock(storage: &Arc<dyn DurableStorage>, owner: &str, ttl: Duration) -> SyncLock {
        SyncLock::new(
            Arc::clone(storage),
            "sync:test:lock",
            LockConfig::new().with_owner(owner).with_ttl(ttl),
        )
    }

    #[test]
    fn second_instance_is_excluded_until_release() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let first = lock(&storage, "tab-1", Duration::from_secs(10));
        let second = lock(&storage, "tab-2", Duration::from_secs(10));

        assert_eq!(first.try_acquire().unwrap(), Acquire::Acquired);
        assert!(matches!(
            second.try_acquire().unwrap(),
            Acquire::Held(LockRecord { ref owner, .. }) if owner == "tab-1"
        ));
        assert!(first.renew().unwrap());
        assert!(!second.renew().unwrap());

        assert!(first.release().unwrap());
        assert_eq!(second.try_acquire().unwrap(), Acquire::Acquired);
        assert!(!first.is_held().unwrap());
        assert!(second.is_held().unwrap());
    }

    #[test]
    fn expired_lock_is_taken_over() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let crashed = lock(&storage, "tab-1", Duration::ZERO);
        let survivor = lock(&storage, "tab-2", Duration::from_secs(10));

        assert_eq!(crashed.try_acquire().unwrap(), Acquire::Acquired);
        assert_eq!(survivor.try_acquire().unwrap(), Acquire::Acquired);
        assert!(!crashed.renew().unwrap());
        assert!(!crashed.release().unwrap());
    }

    #[test]
    fn reacquiring_an_owned_lock_succeeds() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        let holder = lock(&storage, "tab-1", Duration::from_secs(10));
        assert_eq!(holder.try_acquire().unwrap(), Acquire::Acquired);
        assert_eq!(holder.try_acquire().unwrap(), Acquire::Acquired);
    }

    #[test]
    fn corrupted_record_is_overwritten() {
        let storage: Arc<dyn DurableStorage> = Arc::new(MemoryStorage::new());
        storage.set("sync:test:lock", b"not cbor").unwrap();
        let holder = lock(&storage, "tab-1", Duration::from_secs(10));
        assert_eq!(holder.try_acquire().unwrap(), Acquire::Acquired);
    }
}
