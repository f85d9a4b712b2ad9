//! Advisory file lock held for the lifetime of an open database.
//!
//! A database file `data.slab` is guarded by `data.slab.lock`. Only one
//! process may hold the lock; a second open fails with `DatabaseLocked`.

use crate::error::{CoreError, CoreResult};
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

/// Exclusive lock on a database file.
///
/// The lock is released when the value is dropped.
#[derive(Debug)]
pub struct FileLock {
    path: PathBuf,
    _file: File,
}

impl FileLock {
    /// Returns the lock path for a database file.
    #[must_use]
    pub fn lock_path(db_path: &Path) -> PathBuf {
        let mut name = db_path.as_os_str().to_owned();
        name.push(".lock");
        PathBuf::from(name)
    }

    /// Acquires the lock for `db_path` without blocking.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another handle holds the lock, or an I/O
    /// error if the lock file cannot be created.
    pub fn acquire(db_path: &Path) -> CoreResult<Self> {
        let path = Self::lock_path(db_path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        if file.try_lock_exclusive().is_err() {
            return Err(CoreError::DatabaseLocked);
        }

        Ok(Self { path, _file: file })
    }

    /// Returns the path of the lock file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}
