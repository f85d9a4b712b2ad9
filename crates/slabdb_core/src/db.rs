//! Database handle: opening, creating and attaching files, and the
//! durable half of the commit pipeline.

use crate::config::{Config, Durability};
use crate::error::{CoreError, CoreResult};
use crate::group::{
    Group, SLOT_FILE_FORMAT, SLOT_FILE_SIZE, SLOT_VERSION, TOP_SLOTS,
};
use crate::history::{ChangesetHistory, Replication};
#[cfg(feature = "std")]
use crate::lock::FileLock;
use crate::registry::{ReadLockInfo, ReadLockRegistry};
use crate::stats::DatabaseStats;
use crate::transaction::Transaction;
use crate::types::{TransactStage, Version, VersionId};
use crate::upgrade::upgrade_file_format;
use parking_lot::{Condvar, Mutex};
use slabdb_storage::{
    CommitBatch, FileHeader, InMemoryBackend, Node, Ref, RefOrTagged, SlabAlloc,
    StorageBackend, FILE_HEADER_SIZE,
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Oldest file format that can be upgraded.
pub const OLDEST_UPGRADABLE_FILE_FORMAT: u32 = 6;

/// Process-wide mutex serialising write transactions.
///
/// Unlike a guard-based mutex it can be released from a different call
/// than the one that acquired it, which is what a transaction that stays
/// `Writing` across several calls needs.
#[derive(Debug, Default)]
pub(crate) struct WriteMutex {
    held: Mutex<bool>,
    released: Condvar,
}

impl WriteMutex {
    pub(crate) fn lock(&self) {
        let mut held = self.held.lock();
        while *held {
            self.released.wait(&mut held);
        }
        *held = true;
    }

    pub(crate) fn try_lock(&self) -> bool {
        let mut held = self.held.lock();
        if *held {
            return false;
        }
        *held = true;
        true
    }

    pub(crate) fn unlock(&self) {
        let mut held = self.held.lock();
        debug_assert!(*held, "write mutex released while not held");
        *held = false;
        drop(held);
        self.released.notify_one();
    }
}

/// Result of the in-memory and durable publication of one commit.
pub(crate) struct Published {
    pub(crate) info: ReadLockInfo,
    pub(crate) persisted: CoreResult<()>,
}

/// An open database.
///
/// `Db` is shared behind an [`Arc`]; every [`Transaction`] holds a clone.
///
/// ```rust
/// use slabdb_core::{Db, VersionId};
///
/// let db = Db::open_in_memory()?;
/// let mut tr = db.start_write()?;
/// let people = tr.add_table("people")?;
/// tr.create_object(people)?;
/// let version = tr.commit()?;
///
/// let reader = db.start_read(VersionId::Latest)?;
/// assert_eq!(reader.version(), version);
/// assert_eq!(reader.table_size(people)?, 1);
/// # Ok::<(), slabdb_core::CoreError>(())
/// ```
pub struct Db {
    pub(crate) config: Config,
    pub(crate) alloc: SlabAlloc,
    backend: Mutex<Box<dyn StorageBackend>>,
    header: Mutex<FileHeader>,
    pub(crate) registry: Arc<ReadLockRegistry>,
    pub(crate) write_mutex: WriteMutex,
    pub(crate) replication: Option<Arc<dyn Replication>>,
    pub(crate) stats: Arc<DatabaseStats>,
    durable_version: AtomicU64,
    /// Set after a failed durable publish: the backend may be missing
    /// ranges of versions that are already visible in memory.
    needs_full_write: AtomicBool,
    closed: AtomicBool,
    #[cfg(feature = "std")]
    _lock: Option<FileLock>,
}

impl Db {
    /// Opens or creates the database file at `path`.
    ///
    /// The file is guarded by an advisory lock on `<path>.lock` for as
    /// long as the handle lives.
    ///
    /// # Errors
    ///
    /// Returns `DatabaseLocked` if another handle holds the lock,
    /// `InvalidFormat` if the file is not a database or is missing while
    /// `create_if_missing` is false, and `FileFormatUpgradeRequired` if the
    /// file is old and upgrades are disabled.
    #[cfg(feature = "std")]
    pub fn open(path: &std::path::Path, config: Config) -> CoreResult<Arc<Self>> {
        use slabdb_storage::FileBackend;

        if !config.create_if_missing && !path.exists() {
            return Err(CoreError::invalid_format(format!(
                "database {} does not exist and create_if_missing is false",
                path.display()
            )));
        }
        let lock = FileLock::acquire(path)?;
        let backend = FileBackend::open(path)?;
        info!(path = %path.display(), "opening database");
        Self::open_inner(Box::new(backend), config, Some(lock))
    }

    /// Opens a database over an arbitrary backend.
    ///
    /// # Errors
    ///
    /// Same as [`Db::open`], minus locking.
    pub fn open_with_backend(
        backend: Box<dyn StorageBackend>,
        config: Config,
    ) -> CoreResult<Arc<Self>> {
        #[cfg(feature = "std")]
        {
            Self::open_inner(backend, config, None)
        }
        #[cfg(not(feature = "std"))]
        {
            Self::open_inner(backend, config)
        }
    }

    /// Creates a fresh database that lives in memory only.
    ///
    /// # Errors
    ///
    /// Returns an error only if creating the initial version fails.
    pub fn open_in_memory() -> CoreResult<Arc<Self>> {
        Self::open_with_backend(Box::new(InMemoryBackend::new()), Config::default())
    }

    fn open_inner(
        mut backend: Box<dyn StorageBackend>,
        config: Config,
        #[cfg(feature = "std")] lock: Option<FileLock>,
    ) -> CoreResult<Arc<Self>> {
        let size = backend.size()?;
        let existing = if size >= FILE_HEADER_SIZE {
            let header = FileHeader::read_from(backend.as_ref())?;
            (header.top_ref() != 0).then_some(header)
        } else {
            None
        };

        let (alloc, header, top_ref) = match existing {
            Some(header) => {
                let (alloc, top_ref) = Self::attach(backend.as_ref(), &header, size)?;
                (alloc, header, top_ref)
            }
            None => {
                if !config.create_if_missing {
                    return Err(CoreError::invalid_format(
                        "database does not exist and create_if_missing is false",
                    ));
                }
                if size > 0 {
                    warn!(size, "discarding file without a published version");
                    backend.set_len(0)?;
                }
                let (alloc, header, top_ref) = Self::create(backend.as_mut(), &config)?;
                (alloc, header, top_ref)
            }
        };

        let group = Group::load(&alloc, top_ref)?;
        let version = group.version().max(1);
        let registry = ReadLockRegistry::new(version, top_ref, alloc.logical_size());
        let replication = config.enable_history.then(|| {
            Arc::new(ChangesetHistory::new(config.max_history_entries)) as Arc<dyn Replication>
        });

        let db = Arc::new(Self {
            config,
            alloc,
            backend: Mutex::new(backend),
            header: Mutex::new(header),
            registry,
            write_mutex: WriteMutex::default(),
            replication,
            stats: Arc::new(DatabaseStats::new()),
            durable_version: AtomicU64::new(version),
            needs_full_write: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            #[cfg(feature = "std")]
            _lock: lock,
        });
        debug!(version, top_ref, file_format = group.file_format_version(), "attached");

        db.upgrade_if_needed(group.file_format_version())?;

        let mut tr = db.start_read(VersionId::Latest)?;
        if tr.check_consistency()? {
            info!("cleared asymmetric tables left over from the previous session");
        }
        tr.close()?;
        Ok(db)
    }

    fn create(
        backend: &mut dyn StorageBackend,
        config: &Config,
    ) -> CoreResult<(SlabAlloc, FileHeader, Ref)> {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0)?;

        let mut group = Group::default();
        for _ in 0..TOP_SLOTS {
            group.push_slot(RefOrTagged::make_tagged(0));
        }
        group.set_slot(
            SLOT_FILE_FORMAT,
            RefOrTagged::make_tagged(u64::from(config.target_file_format)),
        );
        group.set_slot(SLOT_VERSION, RefOrTagged::make_tagged(1));
        group.flush_children(&alloc)?;
        let top_ref = group.write_top(&alloc)?;

        let batch = alloc.prepare_commit(1)?;
        let mut header = FileHeader::new();
        alloc.persist(backend, &mut header, &batch, top_ref)?;
        info!(
            file_format = config.target_file_format,
            size = batch.logical_size,
            "created database"
        );
        Ok((alloc, header, top_ref))
    }

    fn attach(
        backend: &dyn StorageBackend,
        header: &FileHeader,
        size: u64,
    ) -> CoreResult<(SlabAlloc, Ref)> {
        let top_ref = header.top_ref();
        let image = backend.read_at(0, size as usize)?;
        let top = image
            .get(top_ref as usize..)
            .ok_or_else(|| CoreError::invalid_format(format!("top ref {top_ref} beyond file end")))
            .and_then(|bytes| Ok(Node::decode(bytes)?))?;

        let logical = match top.slot(SLOT_FILE_SIZE).as_int() {
            0 => size,
            logical if logical > size => {
                return Err(CoreError::invalid_format(format!(
                    "file is {size} bytes but its top array records {logical}"
                )));
            }
            logical => logical,
        };
        let alloc = SlabAlloc::from_image(image, logical);
        alloc.rebuild_free_space(top_ref)?;
        debug!(
            top_ref,
            logical,
            free = alloc.free_bytes(),
            "rebuilt free space"
        );
        Ok((alloc, top_ref))
    }

    fn upgrade_if_needed(self: &Arc<Self>, current: u32) -> CoreResult<()> {
        let target = self.config.target_file_format;
        if current == target {
            return Ok(());
        }
        if current < OLDEST_UPGRADABLE_FILE_FORMAT || current > target {
            return Err(CoreError::invalid_format(format!(
                "unsupported file format {current}"
            )));
        }
        if !self.config.allow_file_format_upgrade {
            return Err(CoreError::FileFormatUpgradeRequired { current, target });
        }

        info!(current, target, "upgrading file format");
        let mut tr = self.start_write()?;
        // Another session may have finished the upgrade in the meantime.
        if tr.file_format_version() >= target {
            return tr.rollback();
        }
        upgrade_file_format(&mut tr, target)?;
        tr.commit()?;
        self.stats.record_upgrade_commit();
        info!(target, version = tr.version(), "file format upgraded");
        Ok(())
    }

    fn check_open(&self) -> CoreResult<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(CoreError::DatabaseClosed)
        } else {
            Ok(())
        }
    }

    // === Transactions ===

    /// Starts a read transaction pinned at `version`.
    ///
    /// # Errors
    ///
    /// Returns `BadVersion` if an explicit version is no longer retained.
    pub fn start_read(self: &Arc<Self>, version: VersionId) -> CoreResult<Transaction> {
        self.check_open()?;
        let pin = self.registry.grab_read_lock(version)?;
        let tr = Transaction::attach(Arc::clone(self), TransactStage::Reading, pin)?;
        self.stats.record_read_start();
        Ok(tr)
    }

    /// Starts a frozen transaction pinned at `version`.
    ///
    /// # Errors
    ///
    /// Returns `BadVersion` if an explicit version is no longer retained.
    pub fn start_frozen(self: &Arc<Self>, version: VersionId) -> CoreResult<Transaction> {
        self.check_open()?;
        let pin = self.registry.grab_read_lock(version)?;
        let tr = Transaction::attach(Arc::clone(self), TransactStage::Frozen, pin)?;
        self.stats.record_frozen_start();
        Ok(tr)
    }

    /// Starts a write transaction on the latest version, waiting for the
    /// current writer to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the database is closed or the latest version
    /// cannot be attached.
    pub fn start_write(self: &Arc<Self>) -> CoreResult<Transaction> {
        self.check_open()?;
        self.write_mutex.lock();
        self.begin_write_locked()
    }

    /// Like [`Db::start_write`], but returns `None` instead of waiting.
    ///
    /// # Errors
    ///
    /// Same as [`Db::start_write`].
    pub fn try_start_write(self: &Arc<Self>) -> CoreResult<Option<Transaction>> {
        self.check_open()?;
        if !self.write_mutex.try_lock() {
            return Ok(None);
        }
        self.begin_write_locked().map(Some)
    }

    fn begin_write_locked(self: &Arc<Self>) -> CoreResult<Transaction> {
        let result = self
            .registry
            .grab_read_lock(VersionId::Latest)
            .and_then(|pin| Transaction::attach(Arc::clone(self), TransactStage::Reading, pin));
        let mut tr = match result {
            Ok(tr) => tr,
            Err(err) => {
                self.write_mutex.unlock();
                return Err(err);
            }
        };
        tr.begin_writing()?;
        self.stats.record_write_start();
        Ok(tr)
    }

    // === Commit ===

    /// Publishes a prepared commit: first in memory, then durably.
    ///
    /// The in-memory publication cannot be undone; a durable failure is
    /// reported in [`Published::persisted`].
    pub(crate) fn do_commit(&self, new_version: Version, top_ref: Ref) -> CoreResult<Published> {
        let batch = self.alloc.prepare_commit(new_version)?;
        let info = self
            .registry
            .publish(new_version, top_ref, batch.logical_size);
        self.stats.record_commit(batch.bytes);

        let persisted = match self.config.durability {
            Durability::Full => self.persist(&batch, top_ref),
            Durability::MemOnly => Ok(()),
        };
        match &persisted {
            Ok(()) if self.config.durability == Durability::Full => {
                self.durable_version.store(new_version, Ordering::Release);
            }
            Ok(()) => {}
            Err(err) => {
                warn!(version = new_version, error = %err, "durable publish failed");
                self.stats.record_durability_failure();
                self.needs_full_write.store(true, Ordering::Release);
            }
        }
        debug!(
            version = new_version,
            top_ref,
            bytes = batch.bytes,
            size = batch.logical_size,
            "committed"
        );
        Ok(Published { info, persisted })
    }

    fn persist(&self, batch: &CommitBatch, top_ref: Ref) -> CoreResult<()> {
        let mut backend = self.backend.lock();
        let mut header = self.header.lock();
        if self.needs_full_write.load(Ordering::Acquire) {
            // The flags byte may or may not have reached the file.
            *header = FileHeader::read_from(backend.as_ref())?;
            let full = CommitBatch {
                ranges: vec![(FILE_HEADER_SIZE, batch.logical_size - FILE_HEADER_SIZE)],
                ..batch.clone()
            };
            self.alloc
                .persist(backend.as_mut(), &mut header, &full, top_ref)?;
            self.needs_full_write.store(false, Ordering::Release);
            return Ok(());
        }
        self.alloc
            .persist(backend.as_mut(), &mut header, batch, top_ref)?;
        Ok(())
    }

    // === Accessors ===

    /// Latest committed version (visible to new readers).
    #[must_use]
    pub fn latest_version(&self) -> Version {
        self.registry.latest().version
    }

    /// Latest version known to have reached the backend.
    #[must_use]
    pub fn durable_version(&self) -> Version {
        self.durable_version.load(Ordering::Acquire)
    }

    /// Runtime counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<DatabaseStats> {
        &self.stats
    }

    /// The attached replication, if any.
    #[must_use]
    pub fn get_replication(&self) -> Option<&Arc<dyn Replication>> {
        self.replication.as_ref()
    }

    /// The database configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// The live version registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<ReadLockRegistry> {
        &self.registry
    }

    /// The shared allocator.
    #[must_use]
    pub fn alloc(&self) -> &SlabAlloc {
        &self.alloc
    }

    /// Returns true once [`Db::close`] has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Refuses new transactions. Transactions already started keep working
    /// until they end.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend cannot be flushed.
    pub fn close(&self) -> CoreResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.backend.lock().flush()?;
        info!(version = self.latest_version(), "database closed");
        Ok(())
    }
}

impl fmt::Debug for Db {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Db")
            .field("latest_version", &self.latest_version())
            .field("durable_version", &self.durable_version())
            .field("durability", &self.config.durability)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::{SLOT_EVACUATION_POINT, SLOT_HISTORY_SCHEMA_VERSION};
    use crate::upgrade::TARGET_FILE_FORMAT;

    #[test]
    fn new_database_is_at_target_format_and_version_one() {
        let db = Db::open_in_memory().unwrap();
        assert_eq!(db.latest_version(), 1);
        assert_eq!(db.durable_version(), 1);

        let tr = db.start_read(VersionId::Latest).unwrap();
        assert_eq!(tr.file_format_version(), TARGET_FILE_FORMAT);
        assert_eq!(tr.top_size(), TOP_SLOTS);
        assert!(tr.top_slot(SLOT_HISTORY_SCHEMA_VERSION).is_tagged());
        assert_eq!(tr.top_slot(SLOT_EVACUATION_POINT).as_int(), 0);
        assert!(tr.get_table_keys().is_empty());
    }

    #[test]
    fn reopen_sees_committed_data() {
        let backend = InMemoryBackend::new();
        let db = Db::open_with_backend(Box::new(backend.clone()), Config::default()).unwrap();
        let mut tr = db.start_write().unwrap();
        let t = tr.add_table("things").unwrap();
        let obj = tr.create_object(t).unwrap();
        assert_eq!(tr.commit().unwrap(), 2);
        drop(tr);
        drop(db);

        let db = Db::open_with_backend(Box::new(backend), Config::default()).unwrap();
        assert_eq!(db.latest_version(), 2);
        let tr = db.start_read(VersionId::Latest).unwrap();
        assert_eq!(tr.find_table("things"), Some(t));
        assert_eq!(tr.object_keys(t).unwrap(), vec![obj]);
    }

    #[test]
    fn mem_only_writes_nothing_after_creation() {
        let backend = InMemoryBackend::new();
        let config = Config::default().durability(Durability::MemOnly);
        let db = Db::open_with_backend(Box::new(backend.clone()), config).unwrap();
        let created = backend.data();

        let mut tr = db.start_write().unwrap();
        tr.add_table("t").unwrap();
        tr.commit().unwrap();
        assert_eq!(db.latest_version(), 2);
        assert_eq!(db.durable_version(), 1);
        assert_eq!(backend.data(), created);
    }

    #[test]
    fn missing_database_is_not_created_when_disabled() {
        let config = Config::default().create_if_missing(false);
        let result = Db::open_with_backend(Box::new(InMemoryBackend::new()), config);
        assert!(matches!(result, Err(CoreError::InvalidFormat { .. })));
    }

    #[test]
    fn try_start_write_does_not_wait() {
        let db = Db::open_in_memory().unwrap();
        let writer = db.start_write().unwrap();
        assert!(db.try_start_write().unwrap().is_none());
        drop(writer);
        assert!(db.try_start_write().unwrap().is_some());
    }

    #[test]
    fn writers_are_serialised() {
        let db = Db::open_in_memory().unwrap();
        let mut first = db.start_write().unwrap();
        let handle = {
            let db = Arc::clone(&db);
            std::thread::spawn(move || {
                let mut tr = db.start_write().unwrap();
                tr.add_table("second").unwrap();
                tr.commit().unwrap()
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        first.add_table("first").unwrap();
        assert_eq!(first.commit().unwrap(), 2);
        assert_eq!(handle.join().unwrap(), 3);
    }

    #[test]
    fn closed_database_refuses_transactions() {
        let db = Db::open_in_memory().unwrap();
        db.close().unwrap();
        assert!(matches!(
            db.start_read(VersionId::Latest),
            Err(CoreError::DatabaseClosed)
        ));
        assert!(matches!(db.start_write(), Err(CoreError::DatabaseClosed)));
    }

    #[test]
    fn file_database_is_locked_while_open() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.slab");
        let db = Db::open(&path, Config::default()).unwrap();
        assert!(matches!(
            Db::open(&path, Config::default()),
            Err(CoreError::DatabaseLocked)
        ));
        drop(db);
        let db = Db::open(&path, Config::default()).unwrap();
        assert_eq!(db.latest_version(), 1);
    }
}
