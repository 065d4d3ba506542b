//! File backend for durable engine state.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use fs2::FileExt;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Open handle plus the length the backend believes the file has.
///
/// Both sit under one mutex so an append can never be observed with a stale
/// length.
#[derive(Debug)]
struct OpenFile {
    handle: File,
    len: u64,
}

/// A backend over one file on disk.
///
/// The file stays under an exclusive advisory lock while the backend lives,
/// so two engine processes pointed at the same state directory fail fast
/// instead of interleaving appends to one ledger.
///
/// `flush()` hands buffered bytes to the OS; `sync()` waits until they are
/// on disk.
///
/// # Example
///
/// ```no_run
/// use fhirsync_storage::{FileBackend, StorageBackend};
/// use std::path::Path;
///
/// let mut ledger = FileBackend::open(Path::new("state/ledger.log"))?;
/// ledger.append(b"entry")?;
/// ledger.sync()?;
/// # Ok::<(), fhirsync_storage::StorageError>(())
/// ```
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    inner: Mutex<OpenFile>,
}

impl FileBackend {
    /// Opens `path`, creating an empty file if there is none.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Locked`] when another handle already holds the
    /// file, or the I/O error that prevented opening it.
    pub fn open(path: &Path) -> StorageResult<Self> {
        let handle = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        if handle.try_lock_exclusive().is_err() {
            return Err(StorageError::Locked(path.display().to_string()));
        }
        let len = handle.metadata()?.len();

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(OpenFile { handle, len }),
        })
    }

    /// Same as [`FileBackend::open`], creating missing parent directories
    /// first.
    ///
    /// # Errors
    ///
    /// Returns an error if a directory cannot be created or the file cannot
    /// be opened.
    pub fn open_with_create_dirs(path: &Path) -> StorageResult<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        Self::open(path)
    }

    /// Location of the file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileBackend {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        let _ = FileExt::unlock(&inner.handle);
    }
}

impl StorageBackend for FileBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        let mut inner = self.inner.lock();
        let size = inner.len;
        if offset.saturating_add(len as u64) > size {
            return Err(StorageError::ReadPastEnd { offset, len, size });
        }

        let mut buf = vec![0u8; len];
        if len > 0 {
            inner.handle.seek(SeekFrom::Start(offset))?;
            inner.handle.read_exact(&mut buf)?;
        }
        Ok(buf)
    }

    fn append(&mut self, data: &[u8]) -> StorageResult<u64> {
        let inner = self.inner.get_mut();
        let offset = inner.len;
        if !data.is_empty() {
            // Opened in append mode: every write lands at the end.
            inner.handle.write_all(data)?;
            inner.len += data.len() as u64;
        }
        Ok(offset)
    }

    fn flush(&mut self) -> StorageResult<()> {
        Ok(self.inner.get_mut().handle.flush()?)
    }

    fn size(&self) -> StorageResult<u64> {
        Ok(self.inner.lock().len)
    }

    fn sync(&mut self) -> StorageResult<()> {
        Ok(self.inner.get_mut().handle.sync_all()?)
    }

    fn truncate(&mut self, new_size: u64) -> StorageResult<()> {
        let inner = self.inner.get_mut();
        if new_size > inner.len {
            return Err(StorageError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("cannot grow {} to {new_size} bytes by truncation", self.path.display()),
            )));
        }
        inner.handle.set_len(new_size)?;
        inner.handle.sync_all()?;
        inner.len = new_size;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn appends_are_addressed_by_offset() {
        let dir = tempdir().unwrap();
        let mut ledger = FileBackend::open(&dir.path().join("ledger.log")).unwrap();

        assert_eq!(ledger.append(b"cfg/Patient/1").unwrap(), 0);
        assert_eq!(ledger.append(b"|v2").unwrap(), 13);
        assert_eq!(ledger.read_at(4, 9).unwrap(), b"Patient/1");
        assert_eq!(ledger.read_at(16, 0).unwrap(), b"");
        assert!(matches!(
            ledger.read_at(14, 5),
            Err(StorageError::ReadPastEnd { size: 16, .. })
        ));
    }

    #[test]
    fn contents_outlive_the_handle() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("staging.log");
        {
            let mut staging = FileBackend::open(&path).unwrap();
            staging.append(b"payload").unwrap();
            staging.sync().unwrap();
        }

        let mut staging = FileBackend::open(&path).unwrap();
        assert_eq!(staging.size().unwrap(), 7);
        assert_eq!(staging.append(b"!").unwrap(), 7);
        assert_eq!(staging.read_at(0, 8).unwrap(), b"payload!");
    }

    #[test]
    fn one_process_per_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.log");

        let held = FileBackend::open(&path).unwrap();
        assert!(matches!(FileBackend::open(&path), Err(StorageError::Locked(_))));
        drop(held);
        assert!(FileBackend::open(&path).is_ok());
    }

    #[test]
    fn state_directory_is_created() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine").join("state").join("ledger.log");

        let backend = FileBackend::open_with_create_dirs(&path).unwrap();
        assert_eq!(backend.path(), path);
        assert!(path.is_file());
    }

    #[test]
    fn torn_tail_can_be_cut() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.log");
        let mut backend = FileBackend::open(&path).unwrap();
        backend.append(b"complete|torn").unwrap();

        backend.truncate(8).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
        assert_eq!(backend.append(b"|next").unwrap(), 8);
        assert_eq!(backend.read_at(0, 13).unwrap(), b"complete|next");
        assert!(backend.truncate(100).is_err());
    }
}
