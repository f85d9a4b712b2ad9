//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Attempted to read beyond the end of storage.
    #[error("read beyond end of storage: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// The requested read offset.
        offset: u64,
        /// The requested read length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// Attempted to write outside the current size of the storage.
    #[error("write beyond end of storage: offset {offset}, len {len}, size {size}")]
    WritePastEnd {
        /// The requested write offset.
        offset: u64,
        /// The requested write length.
        len: usize,
        /// The current storage size.
        size: u64,
    },

    /// The storage file is corrupted.
    #[error("storage corrupted: {0}")]
    Corrupted(String),

    /// A ref does not point at a valid node.
    #[error("invalid ref {ref_} (image size {size})")]
    InvalidRef {
        /// The offending ref.
        ref_: u64,
        /// Size of the image the ref was resolved against.
        size: u64,
    },

    /// A snapshot does not fit inside the current mapping.
    #[error("snapshot of {file_size} bytes does not fit mapping of {mapped} bytes")]
    MappingTooSmall {
        /// File size recorded for the snapshot.
        file_size: u64,
        /// Bytes currently mapped.
        mapped: u64,
    },

    /// A write-side allocator call was made outside a write transaction.
    #[error("allocator is not in a write transaction")]
    NotWriting,
}
