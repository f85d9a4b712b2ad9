//! Error types for SlabDB core.

use crate::types::TransactStage;
use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in SlabDB core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage or allocator error.
    #[error("storage error: {0}")]
    Storage(#[from] slabdb_storage::StorageError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// An operation was called from a stage that does not allow it.
    #[error("wrong transact state: cannot {operation} while {stage}")]
    WrongTransactState {
        /// The rejected operation.
        operation: &'static str,
        /// Stage of the transaction at the time of the call.
        stage: TransactStage,
    },

    /// An explicitly requested version is no longer retained.
    #[error("version {version} is no longer available")]
    BadVersion {
        /// The requested version.
        version: u64,
    },

    /// The new version was published in memory but could not be made durable.
    #[error("commit of version {version} could not be made durable: {source}")]
    DurabilityFailed {
        /// The version that is visible in memory only.
        version: u64,
        /// The underlying storage failure.
        #[source]
        source: Box<CoreError>,
    },

    /// The file needs a format upgrade and upgrades are disabled.
    #[error("file format {current} must be upgraded to {target}")]
    FileFormatUpgradeRequired {
        /// Format stamped in the file.
        current: u32,
        /// Format this build writes.
        target: u32,
    },

    /// Invalid database format or version.
    #[error("invalid database format: {message}")]
    InvalidFormat {
        /// Description of the format issue.
        message: String,
    },

    /// Database is already open or locked.
    #[error("database locked: another process has exclusive access")]
    DatabaseLocked,

    /// Database is closed.
    #[error("database is closed")]
    DatabaseClosed,

    /// Table not found.
    #[error("table not found: {name}")]
    TableNotFound {
        /// Name or key of the table.
        name: String,
    },

    /// A table with the same name already exists.
    #[error("table name in use: {name}")]
    TableNameInUse {
        /// The requested name.
        name: String,
    },

    /// Column not found.
    #[error("column not found: {name}")]
    ColumnNotFound {
        /// Name or key of the column.
        name: String,
    },

    /// Object not found.
    #[error("object {key} not found in table {table}")]
    ObjectNotFound {
        /// Table searched.
        table: String,
        /// The missing object key.
        key: i64,
    },

    /// An object with the same primary key already exists.
    #[error("duplicate primary key in table {table}")]
    DuplicatePrimaryKey {
        /// Table the object was created in.
        table: String,
    },

    /// A value does not match the column type.
    #[error("type mismatch: {message}")]
    TypeMismatch {
        /// Description of the mismatch.
        message: String,
    },

    /// The history store could not be decoded.
    #[error("history corrupted: {message}")]
    HistoryCorrupted {
        /// Description of the corruption.
        message: String,
    },
}

impl CoreError {
    /// Creates a wrong-transact-state error.
    pub fn wrong_transact_state(operation: &'static str, stage: TransactStage) -> Self {
        Self::WrongTransactState { operation, stage }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates a durability failure for `version`.
    pub fn durability_failed(version: u64, source: CoreError) -> Self {
        Self::DurabilityFailed {
            version,
            source: Box::new(source),
        }
    }

    /// Creates a table not found error.
    pub fn table_not_found(name: impl Into<String>) -> Self {
        Self::TableNotFound { name: name.into() }
    }

    /// Creates a column not found error.
    pub fn column_not_found(name: impl Into<String>) -> Self {
        Self::ColumnNotFound { name: name.into() }
    }

    /// Creates a type mismatch error.
    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::TypeMismatch {
            message: message.into(),
        }
    }

    /// Creates a history corruption error.
    pub fn history_corrupted(message: impl Into<String>) -> Self {
        Self::HistoryCorrupted {
            message: message.into(),
        }
    }

    /// Returns true for state errors.
    #[must_use]
    pub fn is_wrong_transact_state(&self) -> bool {
        matches!(self, Self::WrongTransactState { .. })
    }
}
