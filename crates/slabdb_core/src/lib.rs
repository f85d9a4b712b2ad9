//! # SlabDB Core
//!
//! Transactional core of SlabDB, an embedded MVCC database that keeps
//! every committed version as an immutable tree inside one file.
//!
//! This crate provides:
//! - [`Db`] - opening, creating and attaching database files
//! - [`Transaction`] - snapshot transactions (`Reading`, `Writing`,
//!   `Frozen`) with commit, rollback, promotion and freezing
//! - [`ReadLockRegistry`] - the live-version registry that decides which
//!   storage may be reused
//! - [`upgrade`] - resumable file format upgrades up to format 22
//! - [`evacuation`] - moving nodes below a limit so the file can shrink
//! - [`history`] - the replication boundary and the built-in changeset
//!   history
//!
//! ## Example
//!
//! ```rust
//! use slabdb_core::{ColumnType, Db, Value, VersionId};
//!
//! let db = Db::open_in_memory()?;
//!
//! let mut tr = db.start_write()?;
//! let (users, id) = tr.add_table_with_primary_key("users", "id", ColumnType::Int)?;
//! let alice = tr.create_object_with_primary_key(users, Value::Int(1))?;
//! tr.commit()?;
//!
//! let reader = db.start_read(VersionId::Latest)?;
//! assert_eq!(reader.find_first(users, id, &Value::Int(1))?, Some(alice));
//! # Ok::<(), slabdb_core::CoreError>(())
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod db;
mod error;
pub mod evacuation;
mod group;
pub mod history;
#[cfg(feature = "std")]
mod lock;
mod registry;
mod stats;
pub mod table;
mod transaction;
mod types;
pub mod upgrade;

pub use config::{Config, Durability};
pub use db::{Db, OLDEST_UPGRADABLE_FILE_FORMAT};
pub use error::{CoreError, CoreResult};
pub use evacuation::NodeTree;
pub use history::{Changeset, ChangesetHistory, Instruction, Replication};
#[cfg(feature = "std")]
pub use lock::FileLock;
pub use registry::{ReadLockGuard, ReadLockInfo, ReadLockRegistry};
pub use stats::{DatabaseStats, StatsSnapshot};
pub use table::{ColumnSpec, ColumnType, LinkTarget, Row, TableData, Value};
pub use transaction::{HistoryBinding, Transaction};
pub use types::{ColKey, ObjKey, TableKey, TransactStage, Version, VersionId};
pub use upgrade::{upgrade_file_format, TARGET_FILE_FORMAT};
