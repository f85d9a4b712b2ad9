//! Storage backend trait definition.

use crate::error::StorageResult;

/// The byte store under one database file.
///
/// Backends know nothing about nodes or versions. The allocator decides
/// where every byte goes, so the interface is positional only:
///
/// 1. a commit first sizes the store with [`StorageBackend::set_len`],
/// 2. then writes its chunks with [`StorageBackend::write_at`],
/// 3. syncs, flips the header in place, syncs again,
/// 4. and finally cuts a free tail with `set_len`.
///
/// # Invariants
///
/// - `write_at` never changes the size; writes must land inside it
/// - bytes added by `set_len` read as zero
/// - `read_at` returns exactly the bytes last written at that offset
/// - nothing written after a `sync` becomes durable before what was
///   written ahead of it
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - shared bytes, used by tests and
///   in-memory databases
/// - [`super::FileBackend`] - a file on disk
pub trait StorageBackend: Send + Sync {
    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns `ReadPastEnd` if the range is not inside the store, or an
    /// I/O error.
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>>;

    /// Overwrites the bytes at `offset` with `data`.
    ///
    /// # Errors
    ///
    /// Returns `WritePastEnd` if the range is not inside the store, or an
    /// I/O error.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()>;

    /// Grows (zero-filled) or shrinks the store to `len` bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be changed.
    fn set_len(&mut self, len: u64) -> StorageResult<()>;

    /// Returns the current size of the store in bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the size cannot be determined.
    fn size(&self) -> StorageResult<u64>;

    /// Hands buffered writes to the OS. Called when a database closes.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush operation fails.
    fn flush(&mut self) -> StorageResult<()>;

    /// Makes everything written so far durable. This is the ordering
    /// barrier of the commit protocol.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync operation fails.
    fn sync(&mut self) -> StorageResult<()>;
}

/// Checks that `offset..offset + len` lies inside a store of `size` bytes.
pub(crate) fn check_range(offset: u64, len: usize, size: u64) -> Option<u64> {
    let end = offset.checked_add(len as u64)?;
    (end <= size).then_some(end)
}
