//! Storage backends
//!
//! Synchronous key-value stores the async engine executes against. Keys and
//! values are opaque byte sequences; backends never interpret them.

use std::collections::BTreeMap;
use std::path::Path;

use crate::storage::WriteBatch;
use crate::{Result, TickloomError};

/// A synchronous key-value store. Backend failures are wrapped as
/// [`TickloomError::StorageFailed`] before they reach the protocol layer.
pub trait StorageBackend {
    /// Read one key.
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Write one key.
    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()>;

    /// Apply a batch of writes.
    fn put_batch(&mut self, batch: &WriteBatch) -> Result<()>;

    /// All entries with `start <= key < end`, in key order.
    fn read_range(&self, start: &[u8], end: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>>;

    /// The greatest key strictly less than `upper_bound`.
    fn lower_key(&self, upper_bound: &[u8]) -> Result<Option<Vec<u8>>>;

    /// Force durability of prior writes.
    fn sync(&mut self) -> Result<()>;
}

/// In-memory backend for simulation and tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemoryBackend {
    /// An empty store.
    pub fn new() -> Self {
        MemoryBackend {
            entries: BTreeMap::new(),
        }
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.get(key).cloned())
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.entries.insert(key.to_vec(), value.to_vec());
        Ok(())
    }

    fn put_batch(&mut self, batch: &WriteBatch) -> Result<()> {
        for (key, value) in batch.entries() {
            self.entries.insert(key.clone(), value.clone());
        }
        Ok(())
    }

    fn read_range(&self, start: &[u8], end: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        Ok(self
            .entries
            .range(start.to_vec()..end.to_vec())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn lower_key(&self, upper_bound: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .entries
            .range(..upper_bound.to_vec())
            .next_back()
            .map(|(k, _)| k.clone()))
    }

    fn sync(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Sled-backed persistent store. The embedded LSM gives `lower_key` directly
/// via `get_lt` and durability via `flush`.
pub struct SledBackend {
    db: sled::Db,
}

impl SledBackend {
    /// Open (or create) a database under `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let db = sled::open(path).map_err(wrap)?;
        Ok(SledBackend { db })
    }
}

fn wrap(err: sled::Error) -> TickloomError {
    TickloomError::StorageFailed(err.to_string())
}

impl StorageBackend for SledBackend {
    fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self.db.get(key).map_err(wrap)?.map(|v| v.to_vec()))
    }

    fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.db.insert(key, value).map_err(wrap)?;
        Ok(())
    }

    fn put_batch(&mut self, batch: &WriteBatch) -> Result<()> {
        let mut sled_batch = sled::Batch::default();
        for (key, value) in batch.entries() {
            sled_batch.insert(key.as_slice(), value.as_slice());
        }
        self.db.apply_batch(sled_batch).map_err(wrap)
    }

    fn read_range(&self, start: &[u8], end: &[u8]) -> Result<BTreeMap<Vec<u8>, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for entry in self.db.range(start..end) {
            let (key, value) = entry.map_err(wrap)?;
            out.insert(key.to_vec(), value.to_vec());
        }
        Ok(out)
    }

    fn lower_key(&self, upper_bound: &[u8]) -> Result<Option<Vec<u8>>> {
        Ok(self
            .db
            .get_lt(upper_bound)
            .map_err(wrap)?
            .map(|(k, _)| k.to_vec()))
    }

    fn sync(&mut self) -> Result<()> {
        self.db.flush().map_err(wrap)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filled() -> MemoryBackend {
        let mut backend = MemoryBackend::new();
        for key in [b"a".as_slice(), b"c", b"e"] {
            backend.put(key, b"v").unwrap();
        }
        backend
    }

    #[test]
    fn test_memory_get_put() {
        let mut backend = MemoryBackend::new();
        assert_eq!(backend.get(b"k").unwrap(), None);
        backend.put(b"k", b"v").unwrap();
        assert_eq!(backend.get(b"k").unwrap(), Some(b"v".to_vec()));
    }

    #[test]
    fn test_memory_range_is_end_exclusive() {
        let backend = filled();
        let range = backend.read_range(b"a", b"e").unwrap();
        assert_eq!(
            range.keys().cloned().collect::<Vec<_>>(),
            vec![b"a".to_vec(), b"c".to_vec()]
        );
    }

    #[test]
    fn test_memory_lower_key_is_strict() {
        let backend = filled();
        assert_eq!(backend.lower_key(b"c").unwrap(), Some(b"a".to_vec()));
        assert_eq!(backend.lower_key(b"d").unwrap(), Some(b"c".to_vec()));
        assert_eq!(backend.lower_key(b"a").unwrap(), None);
    }

    #[test]
    fn test_sled_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let mut backend = SledBackend::open(dir.path()).unwrap();
        backend.put(b"k1", b"v1").unwrap();
        let mut batch = WriteBatch::new();
        batch.put(b"k2".to_vec(), b"v2".to_vec());
        batch.put(b"k3".to_vec(), b"v3".to_vec());
        backend.put_batch(&batch).unwrap();
        backend.sync().unwrap();

        assert_eq!(backend.get(b"k2").unwrap(), Some(b"v2".to_vec()));
        assert_eq!(backend.lower_key(b"k3").unwrap(), Some(b"k2".to_vec()));
        let range = backend.read_range(b"k1", b"k3").unwrap();
        assert_eq!(range.len(), 2);
    }
}
