//! Durable key/value record log.
//!
//! The log is append-only. Opening it replays every record into an ordered
//! in-memory index. A torn record at the tail, left by a crash in the middle
//! of an append, is cut off during replay so the next append starts on a
//! clean boundary.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::record::LogRecord;
use parking_lot::RwLock;
use std::collections::BTreeMap;

/// What replay found when the log was opened.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records replayed.
    pub records: usize,
    /// Bytes removed from the tail.
    pub truncated_bytes: u64,
    /// Why the tail was removed, if it was.
    pub reason: Option<String>,
}

/// Result of a read-only integrity scan.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Valid records before the first problem.
    pub records: usize,
    /// Live keys after applying those records.
    pub live_keys: usize,
    /// Bytes covered by valid records.
    pub valid_bytes: u64,
    /// Total bytes in the backend.
    pub total_bytes: u64,
    /// First problem found, if any.
    pub problem: Option<String>,
}

impl VerifyReport {
    /// Returns true if every byte belongs to a valid record.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.problem.is_none() && self.valid_bytes == self.total_bytes
    }
}

struct LogInner {
    backend: Box<dyn StorageBackend>,
    index: BTreeMap<String, Vec<u8>>,
}

/// An append-only key/value store with an in-memory index.
///
/// Keys are UTF-8 strings so callers can scope them with prefixes
/// (`"<configuration>/<entry>"`) and list a scope with
/// [`RecordLog::entries_with_prefix`].
///
/// # Thread Safety
///
/// All operations go through one `RwLock`. Writes append to the backend and
/// update the index under the same guard, so the index never runs ahead of
/// the log.
pub struct RecordLog {
    inner: RwLock<LogInner>,
    recovery: RecoveryReport,
}

impl std::fmt::Debug for RecordLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordLog")
            .field("keys", &self.inner.read().index.len())
            .field("recovery", &self.recovery)
            .finish()
    }
}

/// Reads every valid record from `backend`, stopping at the first problem.
fn scan(
    backend: &dyn StorageBackend,
) -> StorageResult<(Vec<LogRecord>, u64, u64, Option<String>)> {
    let total = backend.size()?;
    let bytes = backend.read_at(0, total as usize)?;

    let mut records = Vec::new();
    let mut offset = 0usize;
    let mut problem = None;

    while offset < bytes.len() {
        match LogRecord::decode(&bytes[offset..], offset as u64) {
            Ok(Some((record, len))) => {
                records.push(record);
                offset += len;
            }
            Ok(None) => {
                problem = Some(format!("incomplete record at offset {offset}"));
                break;
            }
            Err(StorageError::Corrupted { offset, message }) => {
                problem = Some(format!("offset {offset}: {message}"));
                break;
            }
            Err(e) => return Err(e),
        }
    }

    Ok((records, offset as u64, total, problem))
}

fn apply(index: &mut BTreeMap<String, Vec<u8>>, record: LogRecord) {
    match record {
        LogRecord::Put { key, value } => {
            index.insert(key, value);
        }
        LogRecord::Delete { key } => {
            index.remove(&key);
        }
    }
}

impl RecordLog {
    /// Opens a log over `backend`, replaying it and cutting off a bad tail.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read or truncated.
    pub fn open(mut backend: Box<dyn StorageBackend>) -> StorageResult<Self> {
        let (records, valid, total, reason) = scan(backend.as_ref())?;

        let mut index = BTreeMap::new();
        let count = records.len();
        for record in records {
            apply(&mut index, record);
        }

        let truncated_bytes = total - valid;
        if truncated_bytes > 0 {
            backend.truncate(valid)?;
        }

        Ok(Self {
            inner: RwLock::new(LogInner { backend, index }),
            recovery: RecoveryReport {
                records: count,
                truncated_bytes,
                reason,
            },
        })
    }

    /// Scans `backend` without modifying it.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be read.
    pub fn verify(backend: &dyn StorageBackend) -> StorageResult<VerifyReport> {
        let (records, valid, total, problem) = scan(backend)?;
        let count = records.len();
        let mut index = BTreeMap::new();
        for record in records {
            apply(&mut index, record);
        }
        Ok(VerifyReport {
            records: count,
            live_keys: index.len(),
            valid_bytes: valid,
            total_bytes: total,
            problem,
        })
    }

    /// Returns what replay found when the log was opened.
    #[must_use]
    pub fn recovery(&self) -> &RecoveryReport {
        &self.recovery
    }

    fn append(inner: &mut LogInner, record: LogRecord) -> StorageResult<()> {
        let encoded = record.encode()?;
        inner.backend.append(&encoded)?;
        inner.backend.flush()?;
        apply(&mut inner.index, record);
        Ok(())
    }

    /// Sets `key` to `value`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or appended.
    pub fn put(&self, key: &str, value: &[u8]) -> StorageResult<()> {
        let mut inner = self.inner.write();
        Self::append(
            &mut inner,
            LogRecord::Put {
                key: key.to_string(),
                value: value.to_vec(),
            },
        )
    }

    /// Sets `key` only if it is not present. Returns `false` if it was.
    ///
    /// The check and the append happen under one write guard, so concurrent
    /// callers racing on the same key see exactly one `true`.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be encoded or appended.
    pub fn put_if_absent(&self, key: &str, value: &[u8]) -> StorageResult<bool> {
        let mut inner = self.inner.write();
        if inner.index.contains_key(key) {
            return Ok(false);
        }
        Self::append(
            &mut inner,
            LogRecord::Put {
                key: key.to_string(),
                value: value.to_vec(),
            },
        )?;
        Ok(true)
    }

    /// Removes `key`. Returns `false` if it was not present.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be appended.
    pub fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut inner = self.inner.write();
        if !inner.index.contains_key(key) {
            return Ok(false);
        }
        Self::append(
            &mut inner,
            LogRecord::Delete {
                key: key.to_string(),
            },
        )?;
        Ok(true)
    }

    /// Returns the value stored under `key`.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.inner.read().index.get(key).cloned()
    }

    /// Returns true if `key` is present.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.inner.read().index.contains_key(key)
    }

    /// Returns all live entries whose key starts with `prefix`, in key order.
    #[must_use]
    pub fn entries_with_prefix(&self, prefix: &str) -> Vec<(String, Vec<u8>)> {
        self.inner
            .read()
            .index
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Returns the number of live keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.read().index.len()
    }

    /// Returns true if no keys are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Syncs the backend to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails.
    pub fn sync(&self) -> StorageResult<()> {
        self.inner.write().backend.sync()
    }

    /// Writes one `Put` per live key into `target` and syncs it.
    ///
    /// Returns the number of records written. The caller swaps `target` in
    /// for the original file.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or writing fails.
    pub fn compact_into(&self, target: &mut dyn StorageBackend) -> StorageResult<usize> {
        let inner = self.inner.read();
        for (key, value) in &inner.index {
            let encoded = LogRecord::Put {
                key: key.clone(),
                value: value.clone(),
            }
            .encode()?;
            target.append(&encoded)?;
        }
        target.sync()?;
        Ok(inner.index.len())
    }
}
