//! Shared in-memory byte store.

use crate::backend::{check_range, StorageBackend};
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// Bytes of one database held in memory.
///
/// Clones share the same bytes, so a clone behaves like a second open of
/// the same file: a test can crash a database, drop it and attach a fresh
/// one to whatever reached the store. Syncing is a no-op.
///
/// ```rust
/// use slabdb_storage::{InMemoryBackend, StorageBackend};
///
/// let mut backend = InMemoryBackend::new();
/// backend.set_len(8).unwrap();
/// backend.write_at(2, b"slab").unwrap();
///
/// let reopened = backend.clone();
/// assert_eq!(reopened.read_at(2, 4).unwrap(), b"slab");
/// assert_eq!(reopened.data(), b"\0\0slab\0\0");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store holding `image`, e.g. a prebuilt database file.
    #[must_use]
    pub fn with_data(image: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(image)),
        }
    }

    /// Copies out the whole store.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.read();
        let size = bytes.len() as u64;
        match check_range(offset, len, size) {
            Some(end) => Ok(bytes[offset as usize..end as usize].to_vec()),
            None => Err(StorageError::ReadPastEnd { offset, len, size }),
        }
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut bytes = self.bytes.write();
        let size = bytes.len() as u64;
        let end = check_range(offset, data.len(), size).ok_or(StorageError::WritePastEnd {
            offset,
            len: data.len(),
            size,
        })?;
        bytes[offset as usize..end as usize].copy_from_slice(data);
        Ok(())
    }

    fn set_len(&mut self, len: u64) -> StorageResult<()> {
        self.bytes.write().resize(len as usize, 0);
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grown_bytes_read_as_zero() {
        let mut backend = InMemoryBackend::new();
        backend.set_len(16).unwrap();
        assert_eq!(backend.read_at(0, 16).unwrap(), vec![0; 16]);
    }

    #[test]
    fn writes_stay_inside_the_store() {
        let mut backend = InMemoryBackend::with_data(b"header|chunk".to_vec());
        backend.write_at(7, b"CHUNK").unwrap();
        assert_eq!(backend.data(), b"header|CHUNK");

        let err = backend.write_at(10, b"xyz").unwrap_err();
        assert!(matches!(err, StorageError::WritePastEnd { size: 12, .. }));
        assert_eq!(backend.size().unwrap(), 12);
    }

    #[test]
    fn reads_past_the_end_fail() {
        let backend = InMemoryBackend::with_data(vec![1; 4]);
        assert!(matches!(
            backend.read_at(2, 4),
            Err(StorageError::ReadPastEnd { .. })
        ));
        assert!(backend.read_at(u64::MAX, 1).is_err());
        assert!(backend.read_at(4, 0).unwrap().is_empty());
    }

    #[test]
    fn shrinking_cuts_the_tail() {
        let mut backend = InMemoryBackend::with_data(b"keep|tail".to_vec());
        backend.set_len(4).unwrap();
        assert_eq!(backend.data(), b"keep");
    }

    #[test]
    fn clones_see_each_others_writes() {
        let mut backend = InMemoryBackend::new();
        let reopened = backend.clone();
        backend.set_len(3).unwrap();
        backend.write_at(0, b"abc").unwrap();
        assert_eq!(reopened.data(), b"abc");
    }
}
