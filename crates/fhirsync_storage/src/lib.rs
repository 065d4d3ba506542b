//! Durable state for the fhirsync engine.
//!
//! The dedup ledger and the inbound staging store both persist through a
//! [`RecordLog`]: an append-only sequence of checksummed put/delete records,
//! replayed into a key index on open. A torn record at the tail is cut off
//! during replay; damage anywhere else is reported as
//! [`StorageError::Corrupted`].
//!
//! The log writes through a [`StorageBackend`]. Use [`FileBackend`] for a
//! state directory on disk and [`InMemoryBackend`] when nothing has to
//! survive a restart.
//!
//! ```rust
//! use fhirsync_storage::{InMemoryBackend, RecordLog};
//!
//! let ledger = RecordLog::open(Box::new(InMemoryBackend::new())).unwrap();
//! ledger.put("dhis/Patient/1", b"8f3a").unwrap();
//! assert!(ledger.contains("dhis/Patient/1"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
mod error;
mod file;
mod log;
mod memory;
mod record;

pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use log::{RecordLog, RecoveryReport, VerifyReport};
pub use memory::InMemoryBackend;
pub use record::{compute_crc32, LogRecord, LogRecordType, RECORD_MAGIC};
