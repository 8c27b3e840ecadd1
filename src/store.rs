//! Persisted local state.
//!
//! The engine mirrors its in-memory state into a handful of named JSON
//! documents: the canonical URL list (plus the legacy mirror key older
//! clients watch), the outbound queue snapshot, the URL health map, the
//! transfer ledger, and the remote-base hints. [`Storage`] is the seam;
//! [`MemStorage`] backs tests and ephemeral sessions, [`FsStorage`] persists
//! across restarts.
//!
//! Storage failures are never fatal to the engine: callers log and continue,
//! the in-memory state stays authoritative for the session.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::PathBuf;

use parking_lot::RwLock;
use serde_json::Value;

/// Canonical persisted URL list.
pub const REGISTRY_URLS_KEY: &str = "kai:sigils:v1";
/// Legacy mirror URL list older composer clients read and write.
pub const REGISTRY_URLS_MIRROR_KEY: &str = "sigil:urls";
/// Outbound queue snapshot, an ordered list of `[url, record]` pairs.
pub const OUTBOUND_QUEUE_KEY: &str = "kai:inhaleQueue:v1";
/// URL health score map.
pub const URL_HEALTH_KEY: &str = "kai:urlHealth:v1";
/// Transfer ledger map.
pub const TRANSFER_LEDGER_KEY: &str = "kai:sigil-transfer:v1";
/// Sticky preferred-remote-base hint.
pub const BASE_HINT_KEY: &str = "kai:lahmahtorBase:v1";
/// Backup-suppressed-until timestamp (ms since the Unix epoch).
pub const BACKUP_DEAD_UNTIL_KEY: &str = "kai:lahmahtorBackupDeadUntil:v1";

/// Persistence failure. Swallowed (with a warning) everywhere except tests.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("storage io: {0}")]
    Io(#[from] std::io::Error),
    #[error("storage serialization: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key → JSON document store shared by all engine instances on a device.
pub trait Storage: Send + Sync + fmt::Debug {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError>;
    fn put(&self, key: &str, value: &Value) -> Result<(), StoreError>;
}

/// In-memory storage, the default for tests and throwaway sessions.
#[derive(Debug, Default)]
pub struct MemStorage {
    map: RwLock<HashMap<String, Value>>,
}

impl Storage for MemStorage {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        Ok(self.map.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        self.map.write().insert(key.to_string(), value.clone());
        Ok(())
    }
}

/// One JSON file per key inside a directory.
#[derive(Debug)]
pub struct FsStorage {
    dir: PathBuf,
}

impl FsStorage {
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let name: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
            .collect();
        self.dir.join(format!("{name}.json"))
    }
}

impl Storage for FsStorage {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        let path = self.path_for(key);
        match fs::read(&path) {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn put(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let path = self.path_for(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_vec(value)?)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

/// Read a key, tolerating both absence and corruption.
pub(crate) fn read_or_null(storage: &dyn Storage, key: &str) -> Value {
    match storage.get(key) {
        Ok(Some(v)) => v,
        Ok(None) => Value::Null,
        Err(err) => {
            tracing::warn!(%key, "storage read failed: {err}");
            Value::Null
        }
    }
}

/// Write a key, swallowing failures (the session keeps its memory state).
pub(crate) fn write_quietly(storage: &dyn Storage, key: &str, value: &Value) {
    if let Err(err) = storage.put(key, value) {
        tracing::warn!(%key, "storage write failed: {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn mem_roundtrip() {
        let s = MemStorage::default();
        assert!(s.get(REGISTRY_URLS_KEY).unwrap().is_none());
        s.put(REGISTRY_URLS_KEY, &json!(["a", "b"])).unwrap();
        assert_eq!(s.get(REGISTRY_URLS_KEY).unwrap(), Some(json!(["a", "b"])));
    }

    #[test]
    fn fs_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let s = FsStorage::new(dir.path()).unwrap();
        assert!(s.get(OUTBOUND_QUEUE_KEY).unwrap().is_none());
        s.put(OUTBOUND_QUEUE_KEY, &json!([["u", {"pulse": 1}]]))
            .unwrap();
        let reopened = FsStorage::new(dir.path()).unwrap();
        assert_eq!(
            reopened.get(OUTBOUND_QUEUE_KEY).unwrap(),
            Some(json!([["u", {"pulse": 1}]]))
        );
    }

    #[test]
    fn keys_become_distinct_files() {
        let dir = tempfile::tempdir().unwrap();
        let s = FsStorage::new(dir.path()).unwrap();
        s.put(REGISTRY_URLS_KEY, &json!(["x"])).unwrap();
        s.put(REGISTRY_URLS_MIRROR_KEY, &json!(["y"])).unwrap();
        assert_eq!(s.get(REGISTRY_URLS_KEY).unwrap(), Some(json!(["x"])));
        assert_eq!(s.get(REGISTRY_URLS_MIRROR_KEY).unwrap(), Some(json!(["y"])));
    }
}
