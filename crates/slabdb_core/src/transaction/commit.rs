//! Commit pipeline.
//!
//! A commit writes the changed accessors bottom-up (tables, names and
//! tables arrays, history, top array), hands the new top ref to
//! [`Db::do_commit`] which publishes it in memory and then durably, and
//! finally pins the new version in place of the old one.
//!
//! If the durable publish fails the version stays visible in memory. The
//! transaction keeps the pin of the last durable version so its storage
//! cannot be reused, completes its stage transition, and reports
//! `DurabilityFailed`.

use super::state::{HistoryBinding, Transaction};
use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::group::{SLOT_HISTORY, SLOT_HISTORY_SCHEMA_VERSION, SLOT_HISTORY_TYPE, SLOT_VERSION};
use crate::types::{TransactStage, Version};
use slabdb_storage::RefOrTagged;
use std::sync::Arc;
use tracing::{debug, warn};

impl Transaction {
    /// Commits the write transaction and continues reading at the new
    /// version. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Writing`. Returns
    /// `DurabilityFailed` if the version was published in memory but could
    /// not be made durable; the transaction is `Reading` at the new version
    /// either way.
    pub fn commit(&mut self) -> CoreResult<Version> {
        let db = self.require_writing("commit")?;
        let (version, persisted) = self.publish(&db)?;

        db.write_mutex.unlock();
        self.holds_write_mutex = false;
        self.stage = TransactStage::Reading;
        db.alloc.remap(self.read_lock.file_size)?;
        debug!(version, "commit");

        persisted
            .map(|()| version)
            .map_err(|err| CoreError::durability_failed(version, err))
    }

    /// Commits and immediately continues writing on top of the new version,
    /// keeping the write mutex. Returns the new version.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Writing`, and
    /// `DurabilityFailed` as for [`Transaction::commit`]; the transaction
    /// stays `Writing` at the new version either way.
    pub fn commit_and_continue_writing(&mut self) -> CoreResult<Version> {
        let db = self.require_writing("commit and continue writing")?;
        let (version, persisted) = self.publish(&db)?;

        db.alloc.begin_write(db.registry.oldest_live_version())?;
        db.alloc.remap(self.read_lock.file_size)?;
        self.init_write_state(&db)?;
        debug!(version, "commit and continue writing");

        persisted
            .map(|()| version)
            .map_err(|err| CoreError::durability_failed(version, err))
    }

    /// Discards the changes of the write transaction and ends it. Does
    /// nothing on a closed or `Ready` transaction.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` when `Reading` or `Frozen`.
    pub fn rollback(&mut self) -> CoreResult<()> {
        let Some(db) = self.db.clone() else {
            return Ok(());
        };
        match self.stage {
            TransactStage::Ready => return Ok(()),
            TransactStage::Writing => {}
            stage => return Err(CoreError::wrong_transact_state("rollback", stage)),
        }

        db.alloc.reset_free_space_tracking();
        if let Some(replication) = &db.replication {
            replication.abort_transact();
        }
        db.write_mutex.unlock();
        self.holds_write_mutex = false;
        db.stats.record_rollback();
        debug!(version = self.read_lock.version, "rollback");
        self.do_end_read();
        Ok(())
    }

    /// Bytes the commit would write: what the transaction has allocated
    /// so far plus the encoded size of its pending table changes. The
    /// history changeset is not counted. Zero unless `Writing`.
    #[must_use]
    pub fn get_commit_size(&self) -> u64 {
        match &self.db {
            Some(db) if self.stage == TransactStage::Writing => {
                let staged = self.group.staged_size().unwrap_or_else(|err| {
                    warn!(%err, "could not size pending changes");
                    0
                });
                db.alloc.get_commit_size() + staged
            }
            _ => 0,
        }
    }

    /// Writes everything out, publishes the new version and moves the pin
    /// to it. The second element reports the durable publish.
    fn publish(&mut self, db: &Arc<Db>) -> CoreResult<(Version, CoreResult<()>)> {
        let new_version = self.read_lock.version + 1;
        self.write_history(db, new_version)?;
        self.group
            .set_slot(SLOT_VERSION, RefOrTagged::make_tagged(new_version));
        self.group.flush_children(&db.alloc)?;
        let top_ref = self.group.write_top(&db.alloc)?;

        let published = db.do_commit(new_version, top_ref)?;
        let pin = db.registry.grab_read_lock(published.info.version_id())?;
        let previous = self.pin.replace(pin);
        self.read_lock = published.info;
        self.history = HistoryBinding::None;

        if published.persisted.is_err() {
            self.async_commit_has_failed = true;
            match previous {
                Some(previous)
                    if self.oldest_version_not_persisted.is_none()
                        && previous.info().version == db.durable_version() =>
                {
                    self.oldest_version_not_persisted = Some(previous);
                }
                _ => {}
            }
        }
        Ok((new_version, published.persisted))
    }

    fn write_history(&mut self, db: &Db, new_version: Version) -> CoreResult<()> {
        let Some(replication) = &db.replication else {
            return Ok(());
        };
        let history_ref = self.group.slot(SLOT_HISTORY).as_ref().unwrap_or(0);
        let new_ref = replication
            .history_write()
            .prepare_commit(&db.alloc, history_ref, new_version)?;
        self.group
            .set_slot(SLOT_HISTORY, RefOrTagged::make_ref(new_ref));
        self.group.set_slot(
            SLOT_HISTORY_TYPE,
            RefOrTagged::make_tagged(replication.history_type()),
        );
        if self.group.top_size() > SLOT_HISTORY_SCHEMA_VERSION {
            self.group.set_slot(
                SLOT_HISTORY_SCHEMA_VERSION,
                RefOrTagged::make_tagged(replication.history_schema_version()),
            );
        }
        Ok(())
    }
}
