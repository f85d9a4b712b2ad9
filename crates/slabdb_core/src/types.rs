//! Core type definitions for SlabDB.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A committed version number. Versions only ever increase.
pub type Version = u64;

/// Selects the snapshot a transaction should pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VersionId {
    /// The latest committed version.
    #[default]
    Latest,
    /// A specific version, located at `index` in the read-lock registry.
    At {
        /// The version number.
        version: Version,
        /// Registry slot holding the version.
        index: usize,
    },
}

impl VersionId {
    /// Returns an explicit version id.
    #[must_use]
    pub const fn new(version: Version, index: usize) -> Self {
        Self::At { version, index }
    }
}

/// Lifecycle stage of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactStage {
    /// No snapshot pinned.
    Ready,
    /// Pinned, read-only.
    Reading,
    /// Pinned, mutable, holding the write mutex.
    Writing,
    /// Pinned, read-only, never advances.
    Frozen,
}

impl fmt::Display for TransactStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ready => "ready",
            Self::Reading => "reading",
            Self::Writing => "writing",
            Self::Frozen => "frozen",
        };
        f.write_str(name)
    }
}

/// Stable identifier of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TableKey(pub u32);

impl fmt::Display for TableKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table:{}", self.0)
    }
}

/// Stable identifier of a column: a per-table tag plus the column position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ColKey(pub u64);

impl ColKey {
    const INDEX_BITS: u32 = 16;

    /// Packs a column position and tag.
    #[must_use]
    pub const fn new(index: usize, tag: u64) -> Self {
        Self((tag << Self::INDEX_BITS) | (index as u64 & 0xFFFF))
    }

    /// Position of the column in its table.
    #[must_use]
    pub const fn index(self) -> usize {
        (self.0 & 0xFFFF) as usize
    }

    /// Per-table unique tag.
    #[must_use]
    pub const fn tag(self) -> u64 {
        self.0 >> Self::INDEX_BITS
    }
}

impl fmt::Display for ColKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col:{}.{}", self.tag(), self.index())
    }
}

/// Identifier of an object within its table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObjKey(pub i64);

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obj:{}", self.0)
    }
}
