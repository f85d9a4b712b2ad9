//! Crash simulation for SlabDB storage.
//!
//! [`CrashableBackend`] wraps another backend and starts failing once a
//! budget of successful syncs is used up. Publishing a version costs two
//! syncs (data, then the header flip), so a budget of `2 * n` lets exactly
//! `n` commits become durable before every further write fails. Whatever
//! the wrapped backend holds at that point is what a process that died
//! there would have left on disk.
//!
//! ## Usage
//!
//! ```rust
//! use slabdb_storage::{InMemoryBackend, StorageBackend};
//! use slabdb_testkit::CrashableBackend;
//!
//! let disk = InMemoryBackend::new();
//! let mut backend = CrashableBackend::new(Box::new(disk.clone()));
//! let control = backend.controller();
//! control.crash_after_syncs(1);
//!
//! backend.set_len(7).unwrap();
//! backend.write_at(0, b"durable").unwrap();
//! backend.sync().unwrap();
//! assert!(backend.write_at(0, b"lost").is_err());
//! assert!(control.has_crashed());
//! assert_eq!(disk.data(), b"durable");
//! ```

use slabdb_storage::{StorageBackend, StorageError, StorageResult};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Debug)]
struct CrashState {
    sync_budget: AtomicUsize,
    syncs: AtomicUsize,
    crashed: AtomicBool,
}

/// Handle for arming and inspecting a [`CrashableBackend`] after it has
/// been handed to a database.
#[derive(Debug, Clone)]
pub struct CrashController {
    state: Arc<CrashState>,
}

impl CrashController {
    /// Lets `syncs` more syncs succeed, counted from the start.
    pub fn crash_after_syncs(&self, syncs: usize) {
        self.state.sync_budget.store(syncs, Ordering::SeqCst);
    }

    /// Fails every write and sync from now on.
    pub fn fail_now(&self) {
        let used = self.state.syncs.load(Ordering::SeqCst);
        self.state.sync_budget.store(used, Ordering::SeqCst);
    }

    /// Lifts the budget and clears the crashed flag.
    pub fn reset(&self) {
        self.state.sync_budget.store(usize::MAX, Ordering::SeqCst);
        self.state.crashed.store(false, Ordering::SeqCst);
    }

    /// Returns whether an operation has been refused.
    #[must_use]
    pub fn has_crashed(&self) -> bool {
        self.state.crashed.load(Ordering::SeqCst)
    }

    /// Number of successful syncs so far.
    #[must_use]
    pub fn syncs(&self) -> usize {
        self.state.syncs.load(Ordering::SeqCst)
    }
}

/// A storage backend wrapper that can simulate crashes.
pub struct CrashableBackend {
    inner: Box<dyn StorageBackend>,
    state: Arc<CrashState>,
}

impl CrashableBackend {
    /// Creates a new crashable backend wrapping an inner backend. Nothing
    /// fails until a budget is set.
    pub fn new(inner: Box<dyn StorageBackend>) -> Self {
        Self {
            inner,
            state: Arc::new(CrashState {
                sync_budget: AtomicUsize::new(usize::MAX),
                syncs: AtomicUsize::new(0),
                crashed: AtomicBool::new(false),
            }),
        }
    }

    /// Creates a backend that crashes once `syncs` syncs have succeeded.
    pub fn with_sync_budget(inner: Box<dyn StorageBackend>, syncs: usize) -> Self {
        let backend = Self::new(inner);
        backend.controller().crash_after_syncs(syncs);
        backend
    }

    /// Returns a handle sharing this backend's crash state.
    #[must_use]
    pub fn controller(&self) -> CrashController {
        CrashController {
            state: Arc::clone(&self.state),
        }
    }

    fn check(&self, operation: &str) -> StorageResult<()> {
        let used = self.state.syncs.load(Ordering::SeqCst);
        if used >= self.state.sync_budget.load(Ordering::SeqCst) {
            self.state.crashed.store(true, Ordering::SeqCst);
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                format!("simulated crash during {operation}"),
            )));
        }
        Ok(())
    }
}

impl StorageBackend for CrashableBackend {
    fn read_at(&self, offset: u64, len: usize) -> StorageResult<Vec<u8>> {
        self.inner.read_at(offset, len)
    }

    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        self.check("write")?;
        self.inner.write_at(offset, data)
    }

    fn set_len(&mut self, len: u64) -> StorageResult<()> {
        self.check("resize")?;
        self.inner.set_len(len)
    }

    fn flush(&mut self) -> StorageResult<()> {
        if self.state.crashed.load(Ordering::SeqCst) {
            return Err(StorageError::Io(io::Error::new(
                io::ErrorKind::Other,
                "simulated crash during flush",
            )));
        }
        self.inner.flush()
    }

    fn size(&self) -> StorageResult<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> StorageResult<()> {
        self.check("sync")?;
        self.inner.sync()?;
        self.state.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
