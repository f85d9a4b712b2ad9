//! Replication boundary and the built-in changeset history.
//!
//! A [`Replication`] observes write transactions: it is told when a write
//! transaction begins (`initiate_transact`), receives every change as an
//! [`Instruction`], and contributes a history tree to each commit through
//! its [`HistoryWrite`] side. Readers consult committed history through a
//! [`HistoryRead`].
//!
//! [`ChangesetHistory`] keeps one CBOR-encoded changeset blob per commit in
//! an inner array stored in top-array slot 8:
//!
//! ```text
//! [ tagged base_version, changeset(base_version), changeset(base_version + 1), ... ]
//! ```

use crate::error::{CoreError, CoreResult};
use crate::table::{ColumnType, Value};
use crate::types::{ColKey, ObjKey, TableKey, Version};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use slabdb_storage::{Node, Ref, RefOrTagged, SlabAlloc};
use std::fmt;
use std::sync::Arc;

/// History type stamped in the top array by [`ChangesetHistory`].
pub const HISTORY_TYPE_CHANGESETS: u64 = 2;

/// Schema version of the changeset history layout.
pub const CHANGESET_HISTORY_SCHEMA_VERSION: u64 = 1;

/// One recorded change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Instruction {
    /// A table was added.
    AddTable {
        /// New table.
        table: TableKey,
        /// Its name.
        name: String,
        /// Whether the table is asymmetric.
        asymmetric: bool,
    },
    /// A table was removed.
    RemoveTable {
        /// Removed table.
        table: TableKey,
    },
    /// A column was added.
    AddColumn {
        /// Table of the column.
        table: TableKey,
        /// New column.
        col: ColKey,
        /// Its name.
        name: String,
        /// Its type.
        col_type: ColumnType,
    },
    /// An object was created.
    CreateObject {
        /// Table of the object.
        table: TableKey,
        /// New object.
        obj: ObjKey,
    },
    /// A value was set.
    Set {
        /// Table of the object.
        table: TableKey,
        /// Modified object.
        obj: ObjKey,
        /// Modified column.
        col: ColKey,
        /// New value.
        value: Value,
    },
    /// An object was removed.
    RemoveObject {
        /// Table of the object.
        table: TableKey,
        /// Removed object.
        obj: ObjKey,
    },
    /// All objects of a table were removed.
    ClearTable {
        /// Cleared table.
        table: TableKey,
    },
    /// A search index was added.
    AddSearchIndex {
        /// Table of the column.
        table: TableKey,
        /// Indexed column.
        col: ColKey,
    },
}

/// The changes of one commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Changeset {
    /// Version produced by the commit.
    pub version: Version,
    /// Changes in the order they were made.
    pub instructions: Vec<Instruction>,
}

/// Read access to committed history.
pub trait HistoryRead: Send + Sync + fmt::Debug {
    /// Returns the changesets of versions after `after_version`.
    ///
    /// # Errors
    ///
    /// Returns `HistoryCorrupted` if the stored history cannot be decoded.
    fn changesets(
        &self,
        alloc: &SlabAlloc,
        history_ref: Ref,
        after_version: Version,
    ) -> CoreResult<Vec<Changeset>>;
}

/// Write access used by the commit pipeline.
pub trait HistoryWrite: HistoryRead {
    /// Appends the changes recorded since `initiate_transact` as the
    /// changeset of `new_version` and returns the new history root.
    ///
    /// # Errors
    ///
    /// Returns an error if the history cannot be read or written.
    fn prepare_commit(
        &self,
        alloc: &SlabAlloc,
        history_ref: Ref,
        new_version: Version,
    ) -> CoreResult<Ref>;
}

/// Observer of write transactions.
pub trait Replication: Send + Sync + fmt::Debug {
    /// Value stamped in the history-type slot of the top array.
    fn history_type(&self) -> u64;

    /// Value stamped in the history-schema-version slot of the top array.
    fn history_schema_version(&self) -> u64;

    /// Creates a reader over committed history.
    fn create_history_read(&self) -> Box<dyn HistoryRead>;

    /// Returns the writer used by commits.
    fn history_write(&self) -> Arc<dyn HistoryWrite>;

    /// Starts a new transact boundary at `version`. Returns true if the
    /// history was changed by someone else and accessors must be refreshed.
    ///
    /// # Errors
    ///
    /// Returns an error if the history cannot be prepared.
    fn initiate_transact(&self, version: Version) -> CoreResult<bool>;

    /// Records one change of the current write transaction.
    fn record(&self, instruction: Instruction);

    /// Discards the changes of the current write transaction.
    fn abort_transact(&self);
}

#[derive(Debug)]
struct ChangesetWriter {
    max_entries: usize,
    pending: Mutex<Vec<Instruction>>,
}

impl ChangesetWriter {
    fn read_array(alloc: &SlabAlloc, history_ref: Ref) -> CoreResult<Option<(Version, Vec<Ref>)>> {
        if history_ref == 0 {
            return Ok(None);
        }
        let node = alloc.read_node(history_ref)?;
        let base = node.slot(0);
        if !base.is_tagged() {
            return Err(CoreError::history_corrupted("missing base version"));
        }
        let refs = node.child_refs().map(|(_, r)| r).collect::<Vec<_>>();
        if refs.len() + 1 != node.values().len() {
            return Err(CoreError::history_corrupted("history entry is not a ref"));
        }
        Ok(Some((base.as_int(), refs)))
    }
}

impl HistoryRead for ChangesetWriter {
    fn changesets(
        &self,
        alloc: &SlabAlloc,
        history_ref: Ref,
        after_version: Version,
    ) -> CoreResult<Vec<Changeset>> {
        let Some((base, refs)) = Self::read_array(alloc, history_ref)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        for (i, r) in refs.into_iter().enumerate() {
            if base + i as u64 <= after_version {
                continue;
            }
            let Node::Blob(bytes) = alloc.read_node(r)? else {
                return Err(CoreError::history_corrupted("changeset is not a blob"));
            };
            let changeset: Changeset = ciborium::from_reader(bytes.as_slice())
                .map_err(|e| CoreError::history_corrupted(e.to_string()))?;
            out.push(changeset);
        }
        Ok(out)
    }
}

impl HistoryWrite for ChangesetWriter {
    fn prepare_commit(
        &self,
        alloc: &SlabAlloc,
        history_ref: Ref,
        new_version: Version,
    ) -> CoreResult<Ref> {
        let changeset = Changeset {
            version: new_version,
            instructions: std::mem::take(&mut *self.pending.lock()),
        };
        let mut bytes = Vec::new();
        ciborium::into_writer(&changeset, &mut bytes)
            .map_err(|e| CoreError::history_corrupted(e.to_string()))?;
        let blob = alloc.alloc_node(&Node::Blob(bytes))?;

        let (mut base, mut refs) = match Self::read_array(alloc, history_ref)? {
            Some((base, refs)) if base + refs.len() as u64 == new_version => {
                alloc.free(history_ref)?;
                (base, refs)
            }
            // A gap in the version sequence: history starts over.
            Some(_) => {
                alloc.free_tree(history_ref)?;
                (new_version, Vec::new())
            }
            None => (new_version, Vec::new()),
        };
        refs.push(blob);

        let excess = refs.len().saturating_sub(self.max_entries.max(1));
        for old in refs.drain(..excess) {
            alloc.free(old)?;
        }
        base += excess as u64;

        let mut slots = Vec::with_capacity(refs.len() + 1);
        slots.push(RefOrTagged::make_tagged(base));
        slots.extend(refs.into_iter().map(RefOrTagged::make_ref));
        Ok(alloc.alloc_node(&Node::inner(slots))?)
    }
}

/// Replication that stores one changeset per commit in the file.
#[derive(Debug, Clone)]
pub struct ChangesetHistory {
    writer: Arc<ChangesetWriter>,
}

impl ChangesetHistory {
    /// Creates a history that keeps the last `max_entries` changesets.
    #[must_use]
    pub fn new(max_entries: usize) -> Self {
        Self {
            writer: Arc::new(ChangesetWriter {
                max_entries,
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Number of changes recorded in the current write transaction.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.writer.pending.lock().len()
    }
}

impl Replication for ChangesetHistory {
    fn history_type(&self) -> u64 {
        HISTORY_TYPE_CHANGESETS
    }

    fn history_schema_version(&self) -> u64 {
        CHANGESET_HISTORY_SCHEMA_VERSION
    }

    fn create_history_read(&self) -> Box<dyn HistoryRead> {
        Box::new(ChangesetReader {
            writer: Arc::clone(&self.writer),
        })
    }

    fn history_write(&self) -> Arc<dyn HistoryWrite> {
        Arc::clone(&self.writer) as Arc<dyn HistoryWrite>
    }

    fn initiate_transact(&self, _version: Version) -> CoreResult<bool> {
        self.writer.pending.lock().clear();
        Ok(false)
    }

    fn record(&self, instruction: Instruction) {
        self.writer.pending.lock().push(instruction);
    }

    fn abort_transact(&self) {
        self.writer.pending.lock().clear();
    }
}

#[derive(Debug)]
struct ChangesetReader {
    writer: Arc<ChangesetWriter>,
}

impl HistoryRead for ChangesetReader {
    fn changesets(
        &self,
        alloc: &SlabAlloc,
        history_ref: Ref,
        after_version: Version,
    ) -> CoreResult<Vec<Changeset>> {
        self.writer.changesets(alloc, history_ref, after_version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn commit(history: &ChangesetHistory, alloc: &SlabAlloc, root: Ref, version: Version) -> Ref {
        alloc.begin_write(version - 1).unwrap();
        let root = history
            .history_write()
            .prepare_commit(alloc, root, version)
            .unwrap();
        alloc.prepare_commit(version).unwrap();
        root
    }

    #[test]
    fn changesets_are_appended_per_commit() {
        let alloc = SlabAlloc::new_empty();
        let history = ChangesetHistory::new(10);

        history.initiate_transact(1).unwrap();
        history.record(Instruction::ClearTable { table: TableKey(0) });
        let root = commit(&history, &alloc, 0, 2);

        history.initiate_transact(2).unwrap();
        history.record(Instruction::RemoveTable { table: TableKey(0) });
        let root = commit(&history, &alloc, root, 3);

        let reader = history.create_history_read();
        let all = reader.changesets(&alloc, root, 0).unwrap();
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].version, 2);
        assert_eq!(
            all[1].instructions,
            vec![Instruction::RemoveTable { table: TableKey(0) }]
        );

        let newer = reader.changesets(&alloc, root, 2).unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].version, 3);
    }

    #[test]
    fn old_entries_are_trimmed() {
        let alloc = SlabAlloc::new_empty();
        let history = ChangesetHistory::new(2);
        let mut root = 0;
        for version in 2..=5 {
            history.initiate_transact(version - 1).unwrap();
            root = commit(&history, &alloc, root, version);
        }
        let all = history.create_history_read().changesets(&alloc, root, 0).unwrap();
        let versions: Vec<_> = all.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![4, 5]);
    }

    #[test]
    fn abort_discards_pending_changes() {
        let history = ChangesetHistory::new(10);
        history.record(Instruction::ClearTable { table: TableKey(1) });
        assert_eq!(history.pending_len(), 1);
        history.abort_transact();
        assert_eq!(history.pending_len(), 0);
    }
}
