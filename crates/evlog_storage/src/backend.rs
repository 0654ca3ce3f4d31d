//! The byte-store contract every backend implements.

use crate::error::StorageResult;

/// An append-only byte store.
///
/// Offsets are absolute from the start of the store. `append` returns the
/// offset the data landed at, and `read_at` returns exactly what was appended
/// there. Callers own every format decision; a backend never inspects bytes.
///
/// Durability comes in two strengths: `flush` pushes buffered bytes to the OS
/// and `sync` forces data and metadata to stable storage.
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes at `offset`.
    ///
    /// # Errors
    ///
    /// [`crate::StorageError::ReadPastEnd`] when the range is not fully
    /// written, or an I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Appends `data` and returns the offset it was written at.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the write fails.
    fn append(&mut self, data: &[u8]) -> StorageResult<u64>;

    /// Pushes buffered writes to the operating system.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the flush fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Forces all appended bytes to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the sync fails.
    fn sync(&mut self) -> StorageResult<()>;

    /// Current size in bytes; the offset of the next append.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Drops every byte at or after `new_size`.
    ///
    /// Used by recovery to cut a torn tail.
    ///
    /// # Errors
    ///
    /// [`crate::StorageError::InvalidTruncate`] if `new_size` exceeds the
    /// current size, or an I/O error.
    fn truncate(&mut self, new_size: u64) -> StorageResult<()>;

    /// Reads everything from `offset` to the end.
    ///
    /// # Errors
    ///
    /// Same as [`StorageBackend::read_at`].
    fn read_from(&self, offset: u64) -> StorageResult<Vec<u8>> {
        let size = self.size()?;
        let len = usize::try_from(size.saturating_sub(offset)).unwrap_or(usize::MAX);
        self.read_at(offset, len)
    }
}
