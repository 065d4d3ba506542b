//! Volatile backend.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use parking_lot::RwLock;
use std::sync::Arc;

/// Keeps the log in a shared `Vec<u8>`.
///
/// Engines started without a state directory use this, and so do tests.
/// Every clone points at the same buffer: hand one clone to a
/// [`crate::RecordLog`] and keep another to look at the raw bytes or to
/// simulate a torn write.
///
/// ```rust
/// use fhirsync_storage::{InMemoryBackend, StorageBackend};
///
/// let peek = InMemoryBackend::new();
/// let mut writer = peek.clone();
/// writer.append(b"staged").unwrap();
/// assert_eq!(peek.data(), b"staged");
/// ```
#[derive(Debug, Default, Clone)]
pub struct InMemoryBackend {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl InMemoryBackend {
    /// Empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from existing bytes, typically a log damaged on purpose.
    #[must_use]
    pub fn with_data(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }

    /// Snapshot of the buffer.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.bytes.read().clone()
    }
}

impl StorageBackend for InMemoryBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let bytes = self.bytes.read();
        let size = bytes.len() as u64;
        match offset.checked_add(len as u64) {
            Some(end) if end <= size => Ok(bytes[offset as usize..end as usize].to_vec()),
            _ => Err(StorageError::ReadPastEnd { offset, len, size }),
        }
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let mut bytes = self.bytes.write();
        let at = bytes.len() as u64;
        bytes.extend_from_slice(data);
        Ok(at)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.bytes.read().len() as u64)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(())
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let mut bytes = self.bytes.write();
        if new_size > bytes.len() as u64 {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("buffer holds {} bytes, cannot truncate to {new_size}", bytes.len()),
            )));
        }
        bytes.truncate(new_size as usize);
        Ok(())
    }
}
