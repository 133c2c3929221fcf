//! Key-value storage for persisted sync state.
//!
//! The engine keeps its change tokens and subscription flags in an
//! injectable [`KeyValueStore`] owned by whoever constructs the engine.
//! Two implementations ship with the crate:
//!
//! - [`MemoryKeyValueStore`] for tests and ephemeral sessions
//! - [`FileKeyValueStore`], a single CBOR file rewritten atomically on
//!   every mutation
//!
//! ```text
//! <state_path>          # CBOR map of key -> bytes
//! <state_path>.lock     # Advisory lock, one process at a time
//! <state_path>.tmp      # Temporary file for atomic writes
//! ```

use crate::error::{SyncError, SyncResult};
use fs2::FileExt;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Durable byte storage under string keys.
///
/// Implementations must be safe to call from any thread and must make a
/// `set` or `remove` durable before returning. The engine issues writes
/// from the blocking pool; reads run on runtime workers and must not
/// touch the disk.
pub trait KeyValueStore: Send + Sync {
    /// Reads a value.
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>>;

    /// Writes a value, replacing any previous one.
    fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()>;

    /// Removes a value. Removing a missing key succeeds.
    fn remove(&self, key: &str) -> SyncResult<()>;

    /// Lists every stored key in ascending order.
    fn keys(&self) -> SyncResult<Vec<String>>;
}

/// An in-memory key-value store.
#[derive(Debug, Default)]
pub struct MemoryKeyValueStore {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryKeyValueStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl KeyValueStore for MemoryKeyValueStore {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()> {
        self.entries.write().insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn keys(&self) -> SyncResult<Vec<String>> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        Ok(keys)
    }
}

/// A key-value store persisted as a single CBOR file.
///
/// The whole map is loaded when the store opens and rewritten with a
/// write-then-rename sequence on every mutation. The store holds an
/// exclusive advisory lock on `<path>.lock` for its whole lifetime, so a
/// second process opening the same file gets an error instead of silently
/// racing on tokens.
#[derive(Debug)]
pub struct FileKeyValueStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, Vec<u8>>>,
    _lock_file: File,
}

impl FileKeyValueStore {
    /// Opens the store at `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Another process holds the lock
    /// - The existing file is not a valid state file
    /// - I/O errors occur
    pub fn open(path: impl AsRef<Path>) -> SyncResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(with_suffix(&path, "lock"))?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(SyncError::storage(format!(
                "state file is locked by another process: {}",
                path.display()
            )));
        }

        let entries = Self::load(&path)?;
        Ok(Self {
            path,
            entries: Mutex::new(entries),
            _lock_file: lock_file,
        })
    }

    /// Returns the path of the state file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(path: &Path) -> SyncResult<BTreeMap<String, Vec<u8>>> {
        if !path.exists() {
            return Ok(BTreeMap::new());
        }

        let data = fs::read(path)?;
        if data.is_empty() {
            return Ok(BTreeMap::new());
        }

        ciborium::from_reader(data.as_slice()).map_err(|e| {
            SyncError::Codec(format!("invalid state file {}: {e}", path.display()))
        })
    }

    /// Writes the map to a temporary file, syncs it, and renames it over
    /// the state file.
    fn persist(&self, entries: &BTreeMap<String, Vec<u8>>) -> SyncResult<()> {
        let mut data = Vec::new();
        ciborium::into_writer(entries, &mut data)
            .map_err(|e| SyncError::Codec(format!("failed to encode state: {e}")))?;

        let temp_path = with_suffix(&self.path, "tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(&data)?;
        file.sync_all()?;
        drop(file);

        fs::rename(&temp_path, &self.path)?;
        self.sync_directory()
    }

    #[cfg(unix)]
    fn sync_directory(&self) -> SyncResult<()> {
        if let Some(parent) = self.path.parent() {
            let dir = if parent.as_os_str().is_empty() {
                File::open(".")?
            } else {
                File::open(parent)?
            };
            dir.sync_all()?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn sync_directory(&self) -> SyncResult<()> {
        // NTFS journals metadata updates
        Ok(())
    }
}

impl KeyValueStore for FileKeyValueStore {
    fn get(&self, key: &str) -> SyncResult<Option<Vec<u8>>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn set(&self, key: &str, value: Vec<u8>) -> SyncResult<()> {
        let mut entries = self.entries.lock();
        let previous = entries.insert(key.to_string(), value);
        if let Err(e) = self.persist(&entries) {
            match previous {
                Some(previous) => entries.insert(key.to_string(), previous),
                None => entries.remove(key),
            };
            return Err(e);
        }
        Ok(())
    }

    fn remove(&self, key: &str) -> SyncResult<()> {
        let mut entries = self.entries.lock();
        let Some(previous) = entries.remove(key) else {
            return Ok(());
        };
        if let Err(e) = self.persist(&entries) {
            entries.insert(key.to_string(), previous);
            return Err(e);
        }
        Ok(())
    }

    fn keys(&self) -> SyncResult<Vec<String>> {
        Ok(self.entries.lock().keys().cloned().collect())
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(suffix);
    PathBuf::from(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn memory_store_basic() {
        let store = MemoryKeyValueStore::new();
        assert!(store.is_empty());

        store.set("b", vec![2]).unwrap();
        store.set("a", vec![1]).unwrap();
        assert_eq!(store.get("a").unwrap(), Some(vec![1]));
        assert_eq!(store.keys().unwrap(), vec!["a".to_string(), "b".to_string()]);

        store.remove("a").unwrap();
        store.remove("missing").unwrap();
        assert_eq!(store.get("a").unwrap(), None);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn file_store_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state").join("tokens.cbor");

        {
            let store = FileKeyValueStore::open(&path).unwrap();
            store.set("database_change_token", vec![0, 0, 0, 7]).unwrap();
            store.set("zone_change_token/DogZone", vec![9]).unwrap();
            store.remove("zone_change_token/DogZone").unwrap();
        }

        let store = FileKeyValueStore::open(&path).unwrap();
        assert_eq!(
            store.get("database_change_token").unwrap(),
            Some(vec![0, 0, 0, 7])
        );
        assert_eq!(store.get("zone_change_token/DogZone").unwrap(), None);
        assert_eq!(store.keys().unwrap(), vec!["database_change_token".to_string()]);
    }

    #[test]
    fn file_store_is_exclusive() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.cbor");

        let _first = FileKeyValueStore::open(&path).unwrap();
        let second = FileKeyValueStore::open(&path);
        assert!(matches!(second, Err(SyncError::Storage(_))));
    }

    #[test]
    fn file_store_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tokens.cbor");
        fs::write(&path, b"\xff\xff not cbor").unwrap();

        let result = FileKeyValueStore::open(&path);
        assert!(matches!(result, Err(SyncError::Codec(_))));
    }
}
