//! # SlabDB Storage
//!
//! The allocator boundary of SlabDB.
//!
//! This crate provides everything below the transaction layer:
//!
//! - [`StorageBackend`] - opaque byte stores ([`InMemoryBackend`], [`FileBackend`])
//! - [`node`] - the storage-tree node encoding (arrays, blobs, tagged integers)
//! - [`FileHeader`] - the dual top-ref file header used for atomic publication
//! - [`SlabAlloc`] - the shared in-memory image of the file with free-space
//!   tracking, copy-on-write allocation and commit batching
//!
//! The allocator knows nothing about versions beyond the numbers it is
//! handed: deciding which versions are still pinned is the job of the read
//! lock registry in `slabdb_core`.
//!
//! ## Example
//!
//! ```rust
//! use slabdb_storage::{StorageBackend, InMemoryBackend};
//!
//! let mut backend = InMemoryBackend::new();
//! backend.set_len(32).unwrap();
//! backend.write_at(16, b"hello world").unwrap();
//! assert_eq!(backend.read_at(16, 11).unwrap(), b"hello world");
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod alloc;
mod backend;
mod error;
mod file;
mod header;
mod memory;
pub mod node;

pub use alloc::{CommitBatch, SlabAlloc};
pub use backend::StorageBackend;
pub use error::{StorageError, StorageResult};
pub use file::FileBackend;
pub use header::{FileHeader, FILE_HEADER_SIZE, FILE_MAGIC};
pub use memory::InMemoryBackend;
pub use node::{Node, NodeHeader, NodeKind, Ref, RefOrTagged};
