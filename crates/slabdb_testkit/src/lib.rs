//! # SlabDB Testkit
//!
//! Test utilities for SlabDB.
//!
//! This crate provides:
//! - Test fixtures: temporary databases and logging setup
//! - [`LegacyFileBuilder`] for images in the pre-cluster file formats
//! - [`CrashableBackend`] for cutting a session off after a number of syncs
//! - [`dump_layout`] for comparing the logical content of two snapshots
//! - Property-based test generators using proptest
//!
//! ## Usage
//!
//! ```rust
//! use slabdb_testkit::prelude::*;
//!
//! let db = TestDb::memory();
//! let mut tr = db.start_write().unwrap();
//! tr.add_table("things").unwrap();
//! tr.commit().unwrap();
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod crash;
pub mod dump;
pub mod fixtures;
pub mod generators;
pub mod legacy;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::crash::*;
    pub use crate::dump::*;
    pub use crate::fixtures::*;
    pub use crate::generators::*;
    pub use crate::legacy::*;
}

pub use crash::{CrashController, CrashableBackend};
pub use dump::dump_layout;
pub use fixtures::*;
pub use generators::*;
pub use legacy::{sample_legacy_file, LegacyFileBuilder, LegacyTable};
