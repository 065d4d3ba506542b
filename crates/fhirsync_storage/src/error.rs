use std::io;
use thiserror::Error;

/// Shorthand for results in this crate.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures while reading or writing durable engine state.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The operating system refused a read, write or sync.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// `offset + len` reaches past the last byte written.
    #[error("read of {len} bytes at offset {offset} runs past end ({size} bytes stored)")]
    ReadPastEnd {
        #[allow(missing_docs)]
        offset: u64,
        #[allow(missing_docs)]
        len: usize,
        /// Bytes stored when the read was attempted.
        size: u64,
    },

    /// A log record failed its magic or checksum check.
    #[error("corrupt record at offset {offset}: {message}")]
    Corrupted {
        /// Where the bad record starts.
        offset: u64,
        #[allow(missing_docs)]
        message: String,
    },

    /// The state file is held by another engine process.
    #[error("{0} is in use by another process")]
    Locked(String),

    /// A key or payload exceeds what a record length field can express.
    #[error("record too large: {0}")]
    RecordTooLarge(String),
}

impl StorageError {
    /// Builds [`StorageError::Corrupted`].
    pub fn corrupted(offset: u64, message: impl Into<String>) -> Self {
        Self::Corrupted {
            offset,
            message: message.into(),
        }
    }
}
