//! Database configuration.

use crate::upgrade::TARGET_FILE_FORMAT;

/// How commits reach the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Durability {
    /// Write changed ranges, then flip the header slot, syncing in between.
    Full,
    /// Keep all versions in memory; nothing is written after creation.
    MemOnly,
}

/// Configuration for opening a database.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether to create the database if it doesn't exist.
    pub create_if_missing: bool,

    /// How commits are made durable.
    pub durability: Durability,

    /// Whether an old file format may be upgraded on open.
    pub allow_file_format_upgrade: bool,

    /// Whether to attach the built-in changeset history.
    pub enable_history: bool,

    /// Number of changesets retained in the file.
    pub max_history_entries: usize,

    /// File format written for new databases and produced by upgrades.
    pub target_file_format: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            durability: Durability::Full,
            allow_file_format_upgrade: true,
            enable_history: true,
            max_history_entries: 1000,
            target_file_format: TARGET_FILE_FORMAT,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the database if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets the durability mode.
    #[must_use]
    pub const fn durability(mut self, value: Durability) -> Self {
        self.durability = value;
        self
    }

    /// Sets whether old file formats are upgraded on open.
    #[must_use]
    pub const fn allow_file_format_upgrade(mut self, value: bool) -> Self {
        self.allow_file_format_upgrade = value;
        self
    }

    /// Sets whether the changeset history is attached.
    #[must_use]
    pub const fn enable_history(mut self, value: bool) -> Self {
        self.enable_history = value;
        self
    }

    /// Sets how many changesets are retained.
    #[must_use]
    pub const fn max_history_entries(mut self, value: usize) -> Self {
        self.max_history_entries = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = Config::default();
        assert!(config.create_if_missing);
        assert!(config.allow_file_format_upgrade);
        assert_eq!(config.durability, Durability::Full);
        assert_eq!(config.target_file_format, 22);
    }

    #[test]
    fn builder_pattern() {
        let config = Config::new()
            .create_if_missing(false)
            .durability(Durability::MemOnly)
            .max_history_entries(4);

        assert!(!config.create_if_missing);
        assert_eq!(config.durability, Durability::MemOnly);
        assert_eq!(config.max_history_entries, 4);
    }
}
