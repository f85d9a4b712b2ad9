//! Database statistics.
//!
//! One [`DatabaseStats`] is shared by every transaction of a database.
//!
//! ```rust,ignore
//! let db = Db::open_in_memory()?;
//! let mut tr = db.start_write()?;
//! tr.add_table("people")?;
//! tr.commit()?;
//!
//! let stats = db.stats().snapshot();
//! assert_eq!(stats.commits, 1);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Database statistics.
///
/// All counters are atomic and only ever increase.
#[derive(Debug, Default)]
pub struct DatabaseStats {
    read_transactions: AtomicU64,
    write_transactions: AtomicU64,
    frozen_transactions: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
    bytes_committed: AtomicU64,
    durability_failures: AtomicU64,
    read_locks_leaked: AtomicU64,
    nodes_evacuated: AtomicU64,
    upgrade_commits: AtomicU64,
}

impl DatabaseStats {
    /// Creates a new stats instance.
    pub fn new() -> Self {
        Self::default()
    }

    // === Increment methods (internal use) ===

    pub(crate) fn record_read_start(&self) {
        self.read_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_write_start(&self) {
        self.write_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_frozen_start(&self) {
        self.frozen_transactions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_commit(&self, bytes: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.bytes_committed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_rollback(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_durability_failure(&self) {
        self.durability_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_read_lock_leak(&self) {
        self.read_locks_leaked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_evacuation(&self, nodes: u64) {
        self.nodes_evacuated.fetch_add(nodes, Ordering::Relaxed);
    }

    pub(crate) fn record_upgrade_commit(&self) {
        self.upgrade_commits.fetch_add(1, Ordering::Relaxed);
    }

    // === Getter methods (public API) ===

    /// Returns the number of read transactions started.
    pub fn read_transactions(&self) -> u64 {
        self.read_transactions.load(Ordering::Relaxed)
    }

    /// Returns the number of write transactions started.
    pub fn write_transactions(&self) -> u64 {
        self.write_transactions.load(Ordering::Relaxed)
    }

    /// Returns the number of frozen transactions created.
    pub fn frozen_transactions(&self) -> u64 {
        self.frozen_transactions.load(Ordering::Relaxed)
    }

    /// Returns the number of commits, including continued-writing commits.
    pub fn commits(&self) -> u64 {
        self.commits.load(Ordering::Relaxed)
    }

    /// Returns the number of rollbacks.
    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    /// Returns the number of bytes allocated by committed transactions.
    pub fn bytes_committed(&self) -> u64 {
        self.bytes_committed.load(Ordering::Relaxed)
    }

    /// Returns the number of commits that failed to become durable.
    pub fn durability_failures(&self) -> u64 {
        self.durability_failures.load(Ordering::Relaxed)
    }

    /// Returns the number of read locks deliberately leaked.
    ///
    /// Each leak pins a version's storage until the database is reopened.
    pub fn read_locks_leaked(&self) -> u64 {
        self.read_locks_leaked.load(Ordering::Relaxed)
    }

    /// Returns the number of nodes copied by evacuation.
    pub fn nodes_evacuated(&self) -> u64 {
        self.nodes_evacuated.load(Ordering::Relaxed)
    }

    /// Returns the number of commits made by file-format upgrades.
    pub fn upgrade_commits(&self) -> u64 {
        self.upgrade_commits.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all stats.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            read_transactions: self.read_transactions(),
            write_transactions: self.write_transactions(),
            frozen_transactions: self.frozen_transactions(),
            commits: self.commits(),
            rollbacks: self.rollbacks(),
            bytes_committed: self.bytes_committed(),
            durability_failures: self.durability_failures(),
            read_locks_leaked: self.read_locks_leaked(),
            nodes_evacuated: self.nodes_evacuated(),
            upgrade_commits: self.upgrade_commits(),
        }
    }
}

/// A point-in-time copy of [`DatabaseStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Read transactions started.
    pub read_transactions: u64,
    /// Write transactions started.
    pub write_transactions: u64,
    /// Frozen transactions created.
    pub frozen_transactions: u64,
    /// Commits.
    pub commits: u64,
    /// Rollbacks.
    pub rollbacks: u64,
    /// Bytes allocated by commits.
    pub bytes_committed: u64,
    /// Commits that failed to become durable.
    pub durability_failures: u64,
    /// Read locks leaked.
    pub read_locks_leaked: u64,
    /// Nodes copied by evacuation.
    pub nodes_evacuated: u64,
    /// Commits made by file-format upgrades.
    pub upgrade_commits: u64,
}
