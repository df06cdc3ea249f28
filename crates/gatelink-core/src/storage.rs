//! Persistent key/value storage abstraction
//!
//! The client persists three records across restarts: the device identity,
//! the client settings, and the offline queue. All three go through the
//! `StateStore` trait so the storage medium stays a collaborator concern;
//! the core only ever reads and writes whole values by key. Values are
//! opaque byte blobs; callers serialize with serde_json.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{Result, StorageError};

// ----------------------------------------------------------------------------
// Well-Known Keys
// ----------------------------------------------------------------------------

/// Store key for the persisted device identity record
pub const KEY_DEVICE_IDENTITY: &str = "device_identity";
/// Store key for the persisted client settings
pub const KEY_SETTINGS: &str = "settings";
/// Store key for the durable offline queue
pub const KEY_OFFLINE_QUEUE: &str = "offline_queue";

// ----------------------------------------------------------------------------
// Storage Trait
// ----------------------------------------------------------------------------

/// Key-value storage abstraction for client state
pub trait StateStore: Send {
    /// Store a value under a key, replacing any previous value
    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Retrieve a value by key
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete a value by key (absent keys are not an error)
    fn remove(&mut self, key: &str) -> Result<()>;

    /// List all stored keys
    fn keys(&self) -> Result<Vec<String>>;

    /// Check if the store is available and accessible
    fn is_available(&self) -> bool;
}

// ----------------------------------------------------------------------------
// Memory Store Implementation
// ----------------------------------------------------------------------------

/// In-memory store for tests and fallback operation
#[derive(Debug, Default)]
pub struct MemoryStore {
    data: BTreeMap<String, Vec<u8>>,
}

impl MemoryStore {
    /// Create a new empty memory store
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
        }
    }
}

impl StateStore for MemoryStore {
    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        self.data.insert(key.to_string(), value);
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.get(key).cloned())
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        self.data.remove(key);
        Ok(())
    }

    fn keys(&self) -> Result<Vec<String>> {
        Ok(self.data.keys().cloned().collect())
    }

    fn is_available(&self) -> bool {
        true
    }
}

// ----------------------------------------------------------------------------
// File Store Implementation
// ----------------------------------------------------------------------------

/// Directory-backed store: one file per key
///
/// Writes go to a sibling temp file first and are renamed into place, so a
/// crash mid-write never leaves a half-written record behind.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    /// Open (creating if needed) a file store rooted at `dir`
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| StorageError::Unavailable {
            reason: format!("cannot create {}: {}", dir.display(), e),
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        // Keys are well-known identifiers, but sanitize anyway so a stray
        // separator cannot escape the store directory.
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }
}

impl StateStore for FileStore {
    fn set(&mut self, key: &str, value: Vec<u8>) -> Result<()> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, &value).map_err(|e| StorageError::WriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        std::fs::rename(&tmp, &path).map_err(|e| StorageError::WriteFailed {
            key: key.to_string(),
            reason: e.to_string(),
        })?;
        Ok(())
    }

    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let path = self.path_for(key);
        match std::fs::read(&path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::ReadFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    fn remove(&mut self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        match std::fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StorageError::WriteFailed {
                key: key.to_string(),
                reason: e.to_string(),
            }
            .into()),
        }
    }

    fn keys(&self) -> Result<Vec<String>> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| StorageError::ReadFailed {
            key: String::new(),
            reason: e.to_string(),
        })?;
        let mut keys = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(stem) = name.strip_suffix(".json") {
                keys.push(stem.to_string());
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn is_available(&self) -> bool {
        self.dir.is_dir()
    }
}

// ----------------------------------------------------------------------------
// Typed Helpers
// ----------------------------------------------------------------------------

/// Read and deserialize a JSON record, treating absence as `None`
pub fn load_json<T: serde::de::DeserializeOwned>(
    store: &dyn StateStore,
    key: &str,
) -> Result<Option<T>> {
    match store.get(key)? {
        Some(bytes) => {
            let value = serde_json::from_slice(&bytes).map_err(|e| StorageError::Decode {
                key: key.to_string(),
                reason: e.to_string(),
            })?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize and persist a JSON record
pub fn save_json<T: serde::Serialize>(
    store: &mut dyn StateStore,
    key: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.set(key, bytes)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_store_roundtrip() {
        let mut store = MemoryStore::new();
        assert!(store.is_available());

        store.set("a", vec![1, 2, 3]).unwrap();
        assert_eq!(store.get("a").unwrap().unwrap(), vec![1, 2, 3]);

        assert_eq!(store.keys().unwrap(), vec!["a".to_string()]);

        store.remove("a").unwrap();
        assert!(store.get("a").unwrap().is_none());
        // Removing an absent key is fine
        store.remove("a").unwrap();
    }

    #[test]
    fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();

        {
            let mut store = FileStore::open(dir.path()).unwrap();
            store.set("settings", b"{\"x\":1}".to_vec()).unwrap();
        }

        // A fresh handle over the same directory sees the value
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.get("settings").unwrap().unwrap(), b"{\"x\":1}");
        assert_eq!(store.keys().unwrap(), vec!["settings".to_string()]);
    }

    #[test]
    fn test_file_store_missing_key_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.get("nothing").unwrap().is_none());
    }

    #[test]
    fn test_json_helpers() {
        #[derive(serde::Serialize, serde::Deserialize, PartialEq, Debug)]
        struct Rec {
            n: u32,
        }

        let mut store = MemoryStore::new();
        save_json(&mut store, "rec", &Rec { n: 7 }).unwrap();
        let loaded: Option<Rec> = load_json(&store, "rec").unwrap();
        assert_eq!(loaded, Some(Rec { n: 7 }));

        // Corrupt bytes surface as a decode error, not a panic
        store.set("rec", b"not-json".to_vec()).unwrap();
        let res: Result<Option<Rec>> = load_json(&store, "rec");
        assert!(res.is_err());
    }
}
