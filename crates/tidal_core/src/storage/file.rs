//! File-based storage backend.

use super::DurableStorage;
use crate::error::StorageResult;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

/// A [`DurableStorage`] keeping one file per key in a directory.
///
/// # Durability
///
/// Values are written to a temporary file, flushed with `sync_all` and
/// renamed over the previous value, so a crash leaves either the old or the
/// new value, never a torn one.
///
/// # Thread Safety
///
/// Writes and compare-and-swap are serialized by an internal lock. Separate
/// processes sharing the directory see each other's values but must not
/// rely on `compare_and_swap` being atomic across processes.
#[derive(Debug)]
pub struct FileStorage {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStorage {
    /// Opens a store in `dir`, creating the directory if needed.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created.
    pub fn open(dir: impl AsRef<Path>) -> StorageResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            write_lock: Mutex::new(()),
        })
    }

    /// Returns the directory holding the values.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.bin", file_name(key)))
    }

    fn read(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        match fs::read(self.path_for(key)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn write(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("tmp");
        {
            let mut file = File::create(&tmp)?;
            file.write_all(value)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn delete(&self, key: &str) -> StorageResult<()> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// Maps a key to a portable file name. Bytes outside `[A-Za-z0-9._-]` are
/// percent-encoded.
fn file_name(key: &str) -> String {
    let mut name = String::with_capacity(key.len());
    for byte in key.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            name.push(byte as char);
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    name
}

impl DurableStorage for FileStorage {
    fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.read(key)
    }

    fn set(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        self.write(key, value)
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let _guard = self.write_lock.lock();
        self.delete(key)
    }

    fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Option<&[u8]>,
    ) -> StorageResult<bool> {
        let _guard = self.write_lock.lock();
        if self.read(key)?.as_deref() != expected {
            return Ok(false);
        }
        match new {
            Some(bytes) => self.write(key, bytes)?,
            None => self.delete(key)?,
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let storage = FileStorage::open(dir.path()).unwrap();
            storage.set("outbox:todos", b"queued").unwrap();
            storage.set("cursor", b"42").unwrap();
        }
        let storage = FileStorage::open(dir.path()).unwrap();
        assert_eq!(storage.get("outbox:todos").unwrap(), Some(b"queued".to_vec()));
        assert_eq!(storage.get("cursor").unwrap(), Some(b"42".to_vec()));
        assert_eq!(storage.get("missing").unwrap(), None);
    }

    #[test]
    fn overwrite_and_remove() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path().join("nested")).unwrap();
        storage.set("k", b"one").unwrap();
        storage.set("k", b"two").unwrap();
        assert_eq!(storage.get("k").unwrap(), Some(b"two".to_vec()));
        storage.remove("k").unwrap();
        storage.remove("k").unwrap();
        assert_eq!(storage.get("k").unwrap(), None);
    }

    #[test]
    fn compare_and_swap_on_disk() {
        let dir = tempdir().unwrap();
        let storage = FileStorage::open(dir.path()).unwrap();
        assert!(storage.compare_and_swap("lock", None, Some(b"a")).unwrap());
        assert!(!storage.compare_and_swap("lock", None, Some(b"b")).unwrap());
        assert!(storage.compare_and_swap("lock", Some(b"a"), Some(b"b")).unwrap());
        assert_eq!(storage.get("lock").unwrap(), Some(b"b".to_vec()));
    }

    #[test]
    fn keys_are_escaped() {
        assert_eq!(file_name("outbox:todos"), "outbox%3Atodos");
        assert_eq!(file_name("a/b"), "a%2Fb");
        assert_eq!(file_name("plain-key_1.x"), "plain-key_1.x");
    }
}
