//! Best-effort recovery cache for the editor text.
//!
//! The session mirrors its text here on a fixed interval and clears the
//! entry on a clean exit. Nothing ever reads it back as truth: a cached
//! text found at session start is only offered to the user.
//!
//! Entries are bincode-encoded and LZ4-compressed (size-prepended).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::CacheError;
use crate::protocol::RoomId;

/// One cached editor text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub text: String,
    /// Unix milliseconds at which the entry was written
    pub saved_at_ms: u64,
}

impl CacheEntry {
    pub fn new(key: impl Into<String>, text: impl Into<String>) -> Self {
        let saved_at_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        Self {
            key: key.into(),
            text: text.into(),
            saved_at_ms,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CacheError> {
        let raw = bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        Ok(lz4_flex::compress_prepend_size(&raw))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CacheError> {
        let raw = lz4_flex::decompress_size_prepended(bytes)
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        let (entry, _) = bincode::serde::decode_from_slice(&raw, bincode::config::standard())
            .map_err(|e| CacheError::Corrupt(e.to_string()))?;
        Ok(entry)
    }
}

/// Cache key of one participant's text in one room.
pub fn cache_key(room: &RoomId, user_id: &str) -> String {
    format!("collab-{room}-{user_id}")
}

/// Durable store for the advisory editor text.
pub trait RecoveryCache: Send + Sync {
    fn store(&self, key: &str, text: &str) -> Result<(), CacheError>;
    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;
    fn clear(&self, key: &str) -> Result<(), CacheError>;
}

// ───────────────────────────────────────────────────────────────────
// In-memory
// ───────────────────────────────────────────────────────────────────

/// Process-local cache. Clones share entries.
#[derive(Clone, Default)]
pub struct MemoryRecoveryCache {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryRecoveryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl RecoveryCache for MemoryRecoveryCache {
    fn store(&self, key: &str, text: &str) -> Result<(), CacheError> {
        let bytes = CacheEntry::new(key, text).encode()?;
        self.entries.lock().insert(key.to_string(), bytes);
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let bytes = self.entries.lock().get(key).cloned();
        bytes.map(|b| CacheEntry::decode(&b)).transpose()
    }

    fn clear(&self, key: &str) -> Result<(), CacheError> {
        self.entries.lock().remove(key);
        Ok(())
    }
}

// ───────────────────────────────────────────────────────────────────
// File-backed
// ───────────────────────────────────────────────────────────────────

/// One compressed file per key under a directory.
pub struct FileRecoveryCache {
    dir: PathBuf,
}

impl FileRecoveryCache {
    /// Open (creating if needed) a cache rooted at `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, CacheError> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn path_for(&self, key: &str) -> PathBuf {
        let file: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{file}.cache"))
    }
}

impl RecoveryCache for FileRecoveryCache {
    fn store(&self, key: &str, text: &str) -> Result<(), CacheError> {
        let bytes = CacheEntry::new(key, text).encode()?;
        let path = self.path_for(key);
        let tmp = path.with_extension("cache.tmp");
        std::fs::write(&tmp, &bytes)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        match std::fs::read(self.path_for(key)) {
            Ok(bytes) => {
                let entry = CacheEntry::decode(&bytes)?;
                if entry.key != key {
                    return Err(CacheError::Corrupt(format!(
                        "entry for {} found under {key}",
                        entry.key
                    )));
                }
                Ok(Some(entry))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn clear(&self, key: &str) -> Result<(), CacheError> {
        match std::fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_codec() {
        let entry = CacheEntry::new("k", "def solve():\n    pass\n".repeat(50));
        let bytes = entry.encode().unwrap();
        assert!(bytes.len() < entry.text.len());
        assert_eq!(CacheEntry::decode(&bytes).unwrap(), entry);
    }

    #[test]
    fn test_corrupt_entry() {
        assert!(matches!(
            CacheEntry::decode(&[1, 2, 3]),
            Err(CacheError::Corrupt(_))
        ));
    }

    #[test]
    fn test_memory_cache_lifecycle() {
        let cache = MemoryRecoveryCache::new();
        assert!(cache.load("k").unwrap().is_none());
        cache.store("k", "one").unwrap();
        cache.store("k", "two").unwrap();
        assert_eq!(cache.load("k").unwrap().unwrap().text, "two");
        cache.clear("k").unwrap();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_file_cache_lifecycle() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileRecoveryCache::open(dir.path()).unwrap();
        let key = cache_key(&RoomId::new("r1"), "user/1");

        cache.store(&key, "print('hi')").unwrap();
        let reopened = FileRecoveryCache::open(dir.path()).unwrap();
        assert_eq!(reopened.load(&key).unwrap().unwrap().text, "print('hi')");

        reopened.clear(&key).unwrap();
        assert!(cache.load(&key).unwrap().is_none());
        // Clearing twice is fine.
        cache.clear(&key).unwrap();
    }

    #[test]
    fn test_file_cache_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FileRecoveryCache::open(dir.path()).unwrap();
        std::fs::write(cache.path_for("k"), [5u8, 0, 0, 0, 0xFF, 0xFF]).unwrap();
        assert!(cache.load("k").is_err());
    }

    #[test]
    fn test_cache_key_format() {
        assert_eq!(cache_key(&RoomId::new("m-42"), "u7"), "collab-m-42-u7");
    }
}
