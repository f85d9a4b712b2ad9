//! Transaction state and stage transitions.

use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::evacuation::{copy_on_write, get_outliers, NodeTree};
use crate::group::{
    Group, SLOT_EVACUATION_POINT, SLOT_FILE_FORMAT, SLOT_HISTORY, SLOT_TABLES, SLOT_TABLE_NAMES,
};
use crate::history::{Changeset, HistoryRead, HistoryWrite, Instruction};
use crate::registry::{ReadLockGuard, ReadLockInfo};
use crate::types::{TransactStage, Version, VersionId};
use slabdb_storage::{Ref, RefOrTagged};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// History access bound to a transaction, matching its stage.
pub enum HistoryBinding {
    /// Not bound yet, or no replication attached.
    None,
    /// Bound by a reading or frozen transaction.
    Read(Box<dyn HistoryRead>),
    /// Bound by a writing transaction.
    Write(Arc<dyn HistoryWrite>),
}

impl HistoryBinding {
    /// Returns true if nothing is bound.
    #[must_use]
    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }

    /// Returns true if the write side is bound.
    #[must_use]
    pub fn is_write(&self) -> bool {
        matches!(self, Self::Write(_))
    }

    fn changesets(
        &self,
        db: &Db,
        history_ref: Ref,
        after_version: Version,
    ) -> CoreResult<Vec<Changeset>> {
        match self {
            Self::None => Ok(Vec::new()),
            Self::Read(history) => history.changesets(&db.alloc, history_ref, after_version),
            Self::Write(history) => history.changesets(&db.alloc, history_ref, after_version),
        }
    }
}

impl fmt::Debug for HistoryBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Read(_) => f.write_str("Read"),
            Self::Write(_) => f.write_str("Write"),
        }
    }
}

/// A transaction pinned to one version of the database.
#[derive(Debug)]
pub struct Transaction {
    /// `None` once closed.
    pub(crate) db: Option<Arc<Db>>,
    pub(crate) stage: TransactStage,
    pub(crate) read_lock: ReadLockInfo,
    pub(crate) pin: Option<ReadLockGuard>,
    /// Pin on the last durable version, kept after a failed durable
    /// publish so its storage is not reused before it is replaced on disk.
    pub(crate) oldest_version_not_persisted: Option<ReadLockGuard>,
    pub(crate) async_commit_has_failed: bool,
    pub(crate) history: HistoryBinding,
    pub(crate) group: Group,
    pub(crate) holds_write_mutex: bool,
    pub(crate) replication_disabled: bool,
}

impl Transaction {
    /// Attaches a transaction to the snapshot pinned by `pin`.
    pub(crate) fn attach(db: Arc<Db>, stage: TransactStage, pin: ReadLockGuard) -> CoreResult<Self> {
        let info = pin.info();
        db.alloc.attach_shared(info.top_ref, info.file_size)?;
        let group = Group::load(&db.alloc, info.top_ref)?;
        db.alloc.note_reader_start();
        debug!(version = info.version, %stage, "transaction attached");
        Ok(Self {
            db: Some(db),
            stage,
            read_lock: info,
            pin: Some(pin),
            oldest_version_not_persisted: None,
            async_commit_has_failed: false,
            history: HistoryBinding::None,
            group,
            holds_write_mutex: false,
            replication_disabled: false,
        })
    }

    /// Returns the database, or a state error naming `operation` if the
    /// transaction was closed.
    pub(crate) fn attached(&self, operation: &'static str) -> CoreResult<Arc<Db>> {
        self.db
            .clone()
            .ok_or(CoreError::wrong_transact_state(operation, TransactStage::Ready))
    }

    /// Like [`Transaction::attached`], additionally requiring `Writing`.
    pub(crate) fn require_writing(&self, operation: &'static str) -> CoreResult<Arc<Db>> {
        let db = self.attached(operation)?;
        if self.stage != TransactStage::Writing {
            return Err(CoreError::wrong_transact_state(operation, self.stage));
        }
        Ok(db)
    }

    /// Like [`Transaction::attached`], additionally requiring a pinned
    /// snapshot.
    pub(crate) fn require_snapshot(&self, operation: &'static str) -> CoreResult<Arc<Db>> {
        let db = self.attached(operation)?;
        if self.stage == TransactStage::Ready {
            return Err(CoreError::wrong_transact_state(operation, self.stage));
        }
        Ok(db)
    }

    /// Enters `Writing`. The caller holds the write mutex; it is released
    /// again if entering fails.
    pub(crate) fn begin_writing(&mut self) -> CoreResult<()> {
        let db = self.attached("start write")?;
        db.alloc
            .begin_write(db.registry.oldest_live_version())
            .map_err(CoreError::from)
            .and_then(|()| {
                let result = self.init_write_state(&db);
                if result.is_err() {
                    db.alloc.reset_free_space_tracking();
                }
                result
            })
            .map_err(|err| {
                db.write_mutex.unlock();
                err
            })?;
        self.stage = TransactStage::Writing;
        self.holds_write_mutex = true;
        self.history = HistoryBinding::None;
        Ok(())
    }

    /// Applies the snapshot's evacuation point and opens a transact
    /// boundary on the replication.
    pub(crate) fn init_write_state(&self, db: &Db) -> CoreResult<()> {
        let point = self.group.evacuation_point();
        if point != 0 {
            db.alloc.set_evacuation_limit(Some(point))?;
        }
        if let Some(replication) = &db.replication {
            replication.initiate_transact(self.read_lock.version)?;
        }
        Ok(())
    }

    // === Accessors ===

    /// Current stage.
    #[must_use]
    pub fn stage(&self) -> TransactStage {
        self.stage
    }

    /// Returns false once the transaction has been closed.
    #[must_use]
    pub fn is_attached(&self) -> bool {
        self.db.is_some()
    }

    /// Version of the pinned snapshot.
    #[must_use]
    pub fn version(&self) -> Version {
        self.read_lock.version
    }

    /// Id that pins exactly the snapshot of this transaction.
    #[must_use]
    pub fn version_id(&self) -> VersionId {
        self.read_lock.version_id()
    }

    /// Descriptor of the pinned snapshot.
    #[must_use]
    pub fn read_lock(&self) -> ReadLockInfo {
        self.read_lock
    }

    /// File format recorded in the snapshot.
    #[must_use]
    pub fn file_format_version(&self) -> u32 {
        self.group.file_format_version()
    }

    pub(crate) fn set_file_format_version(&mut self, version: u32) {
        self.group
            .set_slot(SLOT_FILE_FORMAT, RefOrTagged::make_tagged(u64::from(version)));
    }

    /// Number of slots in the top array.
    #[must_use]
    pub fn top_size(&self) -> usize {
        self.group.top_size()
    }

    /// Raw value of top-array slot `ndx`; tagged zero when absent.
    #[must_use]
    pub fn top_slot(&self, ndx: usize) -> RefOrTagged {
        self.group.slot(ndx)
    }

    /// Returns true if a commit of this transaction was published in memory
    /// but failed to reach the backend.
    #[must_use]
    pub fn async_commit_has_failed(&self) -> bool {
        self.async_commit_has_failed
    }

    /// The database this transaction belongs to, unless closed.
    #[must_use]
    pub fn db(&self) -> Option<&Arc<Db>> {
        self.db.as_ref()
    }

    // === Stage transitions ===

    /// Releases the snapshot of a reading or frozen transaction. Does
    /// nothing when already `Ready`.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` while `Writing`.
    pub fn end_read(&mut self) -> CoreResult<()> {
        match self.stage {
            TransactStage::Ready => Ok(()),
            TransactStage::Writing => Err(CoreError::wrong_transact_state("end read", self.stage)),
            TransactStage::Reading | TransactStage::Frozen => {
                self.do_end_read();
                Ok(())
            }
        }
    }

    pub(crate) fn do_end_read(&mut self) {
        if let Some(db) = &self.db {
            db.alloc.note_reader_end();
        }
        self.pin = None;
        self.group = Group::default();
        self.history = HistoryBinding::None;
        self.stage = TransactStage::Ready;
    }

    /// Rolls back or ends the transaction and detaches it from the
    /// database. Safe to call more than once.
    ///
    /// A pin kept after a failed durable publish is leaked here: the last
    /// durable version stays reserved until the file is reopened.
    ///
    /// # Errors
    ///
    /// Returns an error if rolling back fails.
    pub fn close(&mut self) -> CoreResult<()> {
        let Some(db) = self.db.clone() else {
            return Ok(());
        };
        match self.stage {
            TransactStage::Writing => self.rollback()?,
            TransactStage::Reading | TransactStage::Frozen => self.do_end_read(),
            TransactStage::Ready => {}
        }
        if let Some(pin) = self.oldest_version_not_persisted.take() {
            pin.leak();
            db.stats.record_read_lock_leak();
        }
        self.db = None;
        Ok(())
    }

    /// Starts a new frozen transaction on the same version.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Reading` or `Frozen`.
    pub fn freeze(&self) -> CoreResult<Transaction> {
        let db = self.attached("freeze")?;
        match self.stage {
            TransactStage::Reading | TransactStage::Frozen => db.start_frozen(self.version_id()),
            stage => Err(CoreError::wrong_transact_state("freeze", stage)),
        }
    }

    /// Starts a new transaction in the same stage on the same version.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Reading` or `Frozen`.
    pub fn duplicate(&self) -> CoreResult<Transaction> {
        let db = self.attached("duplicate")?;
        match self.stage {
            TransactStage::Reading => db.start_read(self.version_id()),
            TransactStage::Frozen => db.start_frozen(self.version_id()),
            stage => Err(CoreError::wrong_transact_state("duplicate", stage)),
        }
    }

    /// Turns a reading transaction into the write transaction, moving it to
    /// the latest version. Blocks while another transaction is writing.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Reading`.
    pub fn promote_to_write(&mut self) -> CoreResult<()> {
        let db = self.attached("promote to write")?;
        if self.stage != TransactStage::Reading {
            return Err(CoreError::wrong_transact_state("promote to write", self.stage));
        }
        db.write_mutex.lock();
        if let Err(err) = self.move_to(&db, VersionId::Latest) {
            db.write_mutex.unlock();
            return Err(err);
        }
        self.begin_writing()?;
        db.stats.record_write_start();
        debug!(version = self.read_lock.version, "promoted to write");
        Ok(())
    }

    /// Moves a reading transaction to a newer version.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Reading`, and `BadVersion` if
    /// `version` is not retained or older than the current one.
    pub fn advance_read(&mut self, version: VersionId) -> CoreResult<()> {
        let db = self.attached("advance read")?;
        if self.stage != TransactStage::Reading {
            return Err(CoreError::wrong_transact_state("advance read", self.stage));
        }
        if let VersionId::At { version, .. } = version {
            if version < self.read_lock.version {
                return Err(CoreError::BadVersion { version });
            }
        }
        self.move_to(&db, version)
    }

    /// Re-pins the transaction at `version` and reloads its accessors.
    fn move_to(&mut self, db: &Db, version: VersionId) -> CoreResult<()> {
        let pin = db.registry.grab_read_lock(version)?;
        let info = pin.info();
        db.alloc.attach_shared(info.top_ref, info.file_size)?;
        let group = Group::load(&db.alloc, info.top_ref)?;
        self.read_lock = info;
        self.pin = Some(pin);
        self.group = group;
        self.history = HistoryBinding::None;
        Ok(())
    }

    /// Returns true if a newer version than the pinned one exists.
    #[must_use]
    pub fn has_changed(&self) -> bool {
        match &self.db {
            Some(db) if self.stage != TransactStage::Ready => {
                db.registry.latest().version != self.read_lock.version
            }
            _ => false,
        }
    }

    /// Blocks until a version newer than the pinned one is published.
    /// Returns false if `timeout` elapsed first.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` when no snapshot is pinned.
    pub fn wait_for_change(&self, timeout: Option<Duration>) -> CoreResult<bool> {
        let db = self.require_snapshot("wait for change")?;
        Ok(db.registry.wait_for_change(self.read_lock.version, timeout))
    }

    // === History ===

    /// Binds the history variant matching the current stage, once.
    pub fn get_history(&mut self) -> &HistoryBinding {
        if self.history.is_none() {
            if let Some(replication) = self.db.as_ref().and_then(|db| db.replication.clone()) {
                self.history = match self.stage {
                    TransactStage::Writing => HistoryBinding::Write(replication.history_write()),
                    TransactStage::Reading | TransactStage::Frozen => {
                        HistoryBinding::Read(replication.create_history_read())
                    }
                    TransactStage::Ready => HistoryBinding::None,
                };
            }
        }
        &self.history
    }

    /// Committed changesets visible in this snapshot with a version after
    /// `after_version`.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` when no snapshot is pinned and
    /// `HistoryCorrupted` if the stored history cannot be decoded.
    pub fn changesets_since(&mut self, after_version: Version) -> CoreResult<Vec<Changeset>> {
        let db = self.require_snapshot("read history")?;
        let history_ref = self.group.slot(SLOT_HISTORY).as_ref().unwrap_or(0);
        self.get_history()
            .changesets(&db, history_ref, after_version)
    }

    /// Opens a new transact boundary on the replication. Returns true if
    /// the history was changed by someone else. Does nothing unless
    /// `Writing`.
    ///
    /// # Errors
    ///
    /// Returns an error if the replication fails to prepare.
    pub fn initialize_replication(&mut self) -> CoreResult<bool> {
        let Some(db) = &self.db else {
            return Ok(false);
        };
        match (&db.replication, self.stage) {
            (Some(replication), TransactStage::Writing) => {
                replication.initiate_transact(self.read_lock.version)
            }
            _ => Ok(false),
        }
    }

    /// Runs `f` with change recording disabled.
    pub fn without_replication<R>(
        &mut self,
        f: impl FnOnce(&mut Self) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let previous = std::mem::replace(&mut self.replication_disabled, true);
        let result = f(self);
        self.replication_disabled = previous;
        result
    }

    pub(crate) fn record(&self, instruction: Instruction) {
        if self.replication_disabled {
            return;
        }
        if let Some(replication) = self.db.as_ref().and_then(|db| db.replication.as_ref()) {
            replication.record(instruction);
        }
    }

    /// Clears every non-empty asymmetric table. A reading transaction is
    /// promoted and committed only if something had to be cleared; a
    /// writing transaction is left uncommitted. Returns true if anything
    /// was cleared.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Reading` or `Writing`.
    pub fn check_consistency(&mut self) -> CoreResult<bool> {
        let db = self.attached("check consistency")?;
        match self.stage {
            TransactStage::Reading => {
                if self.dirty_asymmetric_tables(&db)?.is_empty() {
                    return Ok(false);
                }
                self.promote_to_write()?;
                let cleared = self.clear_asymmetric_tables(&db)?;
                self.commit()?;
                Ok(cleared)
            }
            TransactStage::Writing => self.clear_asymmetric_tables(&db),
            stage => Err(CoreError::wrong_transact_state("check consistency", stage)),
        }
    }

    fn dirty_asymmetric_tables(&self, db: &Db) -> CoreResult<Vec<usize>> {
        let mut out = Vec::new();
        for pos in 0..self.group.table_count() {
            let table = self.group.table(&db.alloc, pos)?;
            if table.is_asymmetric() && table.size() > 0 {
                out.push(pos);
            }
        }
        Ok(out)
    }

    fn clear_asymmetric_tables(&mut self, db: &Db) -> CoreResult<bool> {
        let positions = self.dirty_asymmetric_tables(db)?;
        for &pos in &positions {
            let table = self.group.table_mut(&db.alloc, pos)?;
            table.clear();
            if let Some(key) = table.key() {
                self.record(Instruction::ClearTable { table: key });
            }
        }
        Ok(!positions.is_empty())
    }

    // === Evacuation ===

    /// Sets the offset above which nodes should be moved; 0 clears it.
    /// Allocations of this transaction prefer space below the point.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Writing`.
    pub fn set_evacuation_point(&mut self, point: u64) -> CoreResult<()> {
        let db = self.require_writing("set evacuation point")?;
        self.group
            .set_slot(SLOT_EVACUATION_POINT, RefOrTagged::make_tagged(point));
        db.alloc
            .set_evacuation_limit((point != 0).then_some(point))?;
        Ok(())
    }

    /// The evacuation point recorded in the snapshot; 0 if none.
    #[must_use]
    pub fn evacuation_point(&self) -> u64 {
        self.group.evacuation_point()
    }

    /// Plans the nodes that end beyond the evacuation point. Uncommitted
    /// changes of a writing transaction are written out first so the plan
    /// covers them.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` when no snapshot is pinned.
    pub fn get_outliers(&mut self) -> CoreResult<NodeTree> {
        let db = self.require_snapshot("get outliers")?;
        let limit = self.evacuation_point();
        if limit == 0 {
            return Ok(NodeTree::default());
        }
        let top_ref = if self.stage == TransactStage::Writing && self.group.is_dirty() {
            self.group.flush_children(&db.alloc)?;
            self.group.write_top(&db.alloc)?
        } else {
            self.group.top_ref()
        };
        get_outliers(&db.alloc, top_ref, limit)
    }

    /// Moves the nodes of `plan` and their ancestors under top slots 0, 1
    /// and 8 to newly allocated space. Returns the number of nodes copied.
    /// The top array itself moves at commit.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Writing`.
    pub fn evacuate(&mut self, plan: &NodeTree) -> CoreResult<usize> {
        let db = self.require_writing("evacuate")?;
        self.group.flush_children(&db.alloc)?;

        let mut copied = 0;
        let mut moved: [Option<Ref>; 2] = [None, None];
        for (i, slot) in [SLOT_TABLE_NAMES, SLOT_TABLES].into_iter().enumerate() {
            if let Some(new_ref) = self.evacuate_slot(&db, plan, slot, &mut copied)? {
                moved[i] = Some(new_ref);
            }
        }
        if let Some(new_ref) = self.evacuate_slot(&db, plan, SLOT_HISTORY, &mut copied)? {
            self.group
                .set_slot(SLOT_HISTORY, RefOrTagged::make_ref(new_ref));
        }
        self.group.replace_children(&db.alloc, moved[0], moved[1])?;

        db.stats.record_evacuation(copied as u64);
        info!(
            copied,
            limit = self.evacuation_point(),
            "evacuated nodes"
        );
        Ok(copied)
    }

    fn evacuate_slot(
        &self,
        db: &Db,
        plan: &NodeTree,
        slot: usize,
        copied: &mut usize,
    ) -> CoreResult<Option<Ref>> {
        let Some(sub) = plan.child(slot as u32) else {
            return Ok(None);
        };
        let Some(old) = self.group.slot(slot).as_ref() else {
            return Ok(None);
        };
        let (new_ref, n) = copy_on_write(&db.alloc, old, sub)?;
        *copied += n;
        Ok((new_ref != old).then_some(new_ref))
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!(error = %err, "failed to close transaction");
        }
    }
}
