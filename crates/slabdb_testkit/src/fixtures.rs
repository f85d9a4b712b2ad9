//! Test fixtures and database helpers.
//!
//! Provides convenience functions for setting up test databases, reopening
//! them the way a new process would, and turning on log output.

use slabdb_core::{Config, CoreResult, Db};
use slabdb_storage::InMemoryBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

/// Installs a `tracing` subscriber that writes through the test harness.
///
/// The filter comes from `RUST_LOG` and defaults to `warn`. Calling it more
/// than once is harmless.
pub fn init_test_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

enum Storage {
    Memory(InMemoryBackend),
    File(TempDir),
}

/// A test database with automatic cleanup.
///
/// Dereferences to the shared [`Db`] handle, so transactions are started
/// directly on it.
pub struct TestDb {
    db: Option<Arc<Db>>,
    config: Config,
    storage: Storage,
}

impl TestDb {
    /// Creates a new in-memory test database.
    pub fn memory() -> Self {
        Self::memory_with(Config::default())
    }

    /// Creates a new in-memory test database with `config`.
    pub fn memory_with(config: Config) -> Self {
        Self::from_backend(InMemoryBackend::new(), config)
            .expect("Failed to open in-memory database")
    }

    /// Opens a database over the bytes of an existing image.
    ///
    /// # Errors
    ///
    /// Returns whatever [`Db::open_with_backend`] returns.
    pub fn from_image(image: Vec<u8>, config: Config) -> CoreResult<Self> {
        Self::from_backend(InMemoryBackend::with_data(image), config)
    }

    fn from_backend(backend: InMemoryBackend, config: Config) -> CoreResult<Self> {
        let db = Db::open_with_backend(Box::new(backend.clone()), config.clone())?;
        Ok(Self {
            db: Some(db),
            config,
            storage: Storage::Memory(backend),
        })
    }

    /// Creates a new file-based test database in a temporary directory.
    pub fn file() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let config = Config::default();
        let db = Db::open(&temp_dir.path().join("test.slabdb"), config.clone())
            .expect("Failed to open file database");
        Self {
            db: Some(db),
            config,
            storage: Storage::File(temp_dir),
        }
    }

    /// Returns the database path if file-based, None if in-memory.
    pub fn path(&self) -> Option<PathBuf> {
        match &self.storage {
            Storage::File(dir) => Some(dir.path().join("test.slabdb")),
            Storage::Memory(_) => None,
        }
    }

    /// Returns the shared backend if in-memory. It stays readable after the
    /// database is dropped.
    pub fn backend(&self) -> Option<&InMemoryBackend> {
        match &self.storage {
            Storage::Memory(backend) => Some(backend),
            Storage::File(_) => None,
        }
    }

    /// Closes the database and opens the same storage again.
    ///
    /// # Errors
    ///
    /// Returns whatever opening the database returns.
    pub fn reopen(&mut self) -> CoreResult<()> {
        if let Some(db) = self.db.take() {
            db.close()?;
        }
        let db = match &self.storage {
            Storage::Memory(backend) => {
                Db::open_with_backend(Box::new(backend.clone()), self.config.clone())?
            }
            Storage::File(dir) => Db::open(&dir.path().join("test.slabdb"), self.config.clone())?,
        };
        self.db = Some(db);
        Ok(())
    }

    /// Returns the shared database handle.
    pub fn handle(&self) -> Arc<Db> {
        Arc::clone(&**self)
    }
}

impl std::ops::Deref for TestDb {
    type Target = Arc<Db>;

    fn deref(&self) -> &Self::Target {
        self.db.as_ref().expect("database is open")
    }
}

/// Runs a test with a temporary in-memory database.
///
/// # Example
///
/// ```rust
/// use slabdb_testkit::with_temp_db;
///
/// with_temp_db(|db| {
///     let mut tr = db.start_write().unwrap();
///     tr.add_table("t").unwrap();
///     tr.commit().unwrap();
/// });
/// ```
pub fn with_temp_db<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<Db>) -> R,
{
    let db = TestDb::memory();
    f(&*db)
}

/// Runs a test with a temporary file-based database.
pub fn with_temp_file_db<F, R>(f: F) -> R
where
    F: FnOnce(&Arc<Db>) -> R,
{
    let db = TestDb::file();
    f(&*db)
}
