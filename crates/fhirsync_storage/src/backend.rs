use crate::error::StorageResult;

/// Where a [`crate::RecordLog`] keeps its bytes.
///
/// A backend is a flat, growing byte sequence. It never looks at what it
/// stores; record framing, checksums and key indexing all live in the log.
///
/// Implementations must satisfy the following:
///
/// - `append` writes at the current end and returns that offset, which is
///   also what `size` reported just before.
/// - `read_at` returns the bytes an earlier `append` put there.
/// - once `sync` returns, everything appended so far survives a crash.
pub trait StorageBackend: Send + Sync {
    /// Copies `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// [`crate::StorageError::ReadPastEnd`] when the range is not fully
    /// written yet.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Writes `data` at the end and returns its starting offset.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Hands buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    fn flush(&mut self) -> StorageResult<()>;

    /// Number of bytes stored.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    fn size(&self) -> StorageResult<u64>;

    /// Blocks until appended bytes are durable.
    ///
    /// # Errors
    ///
    /// Any I/O failure.
    fn sync(&mut self) -> StorageResult<()>;

    /// Shrinks the store to `new_size` bytes. Replay uses this to drop a
    /// record that was only partly written.
    ///
    /// # Errors
    ///
    /// Fails when `new_size` is larger than the current size.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;
}
