//! File header with dual top refs.
//!
//! ```text
//! +-------------+-------------+--------+----------+-------+
//! | top_ref[0]  | top_ref[1]  | "SLDB" | reserved | flags |
//! | u64 LE      | u64 LE      | 4      | 3        | 1     |
//! +-------------+-------------+--------+----------+-------+
//! ```
//!
//! Bit 0 of `flags` selects the live slot. A new version is published by
//! writing its top ref into the inactive slot, syncing, then flipping the
//! select bit with a single-byte write and syncing again. A crash before the
//! flip leaves the previous version live.

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::node::Ref;

/// Size of the file header in bytes. The first node starts here.
pub const FILE_HEADER_SIZE: u64 = 24;

/// Magic bytes identifying a SlabDB file.
pub const FILE_MAGIC: [u8; 4] = *b"SLDB";

const FLAGS_OFFSET: u64 = 23;
const SELECT_BIT: u8 = 0x01;

/// Decoded file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileHeader {
    /// The two top-ref slots.
    pub top_refs: [Ref; 2],
    /// Index of the live slot (0 or 1).
    pub select: u8,
}

impl FileHeader {
    /// Creates a header with no published version.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the top ref of the live slot.
    #[must_use]
    pub fn top_ref(&self) -> Ref {
        self.top_refs[usize::from(self.select & SELECT_BIT)]
    }

    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; FILE_HEADER_SIZE as usize] {
        let mut buf = [0u8; FILE_HEADER_SIZE as usize];
        buf[0..8].copy_from_slice(&self.top_refs[0].to_le_bytes());
        buf[8..16].copy_from_slice(&self.top_refs[1].to_le_bytes());
        buf[16..20].copy_from_slice(&FILE_MAGIC);
        buf[FLAGS_OFFSET as usize] = self.select & SELECT_BIT;
        buf
    }

    /// Decodes a header.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the bytes are too short or the magic is wrong.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < FILE_HEADER_SIZE as usize {
            return Err(StorageError::Corrupted("file header truncated".into()));
        }
        if bytes[16..20] != FILE_MAGIC {
            return Err(StorageError::Corrupted("not a SlabDB file (bad magic)".into()));
        }
        let mut slot = [0u8; 8];
        slot.copy_from_slice(&bytes[0..8]);
        let first = u64::from_le_bytes(slot);
        slot.copy_from_slice(&bytes[8..16]);
        let second = u64::from_le_bytes(slot);
        Ok(Self {
            top_refs: [first, second],
            select: bytes[FLAGS_OFFSET as usize] & SELECT_BIT,
        })
    }

    /// Reads the header from the start of a backend.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend is too short or the header is invalid.
    pub fn read_from(backend: &dyn StorageBackend) -> StorageResult<Self> {
        let bytes = backend.read_at(0, FILE_HEADER_SIZE as usize)?;
        Self::decode(&bytes)
    }

    /// Durably switches the live slot to `top_ref`.
    ///
    /// All node data the new version references must already be written to
    /// `backend`; the first sync here covers it.
    ///
    /// # Errors
    ///
    /// Returns an error if any write or sync fails. The in-memory header is
    /// only updated once the flip is durable.
    pub fn publish(&mut self, backend: &mut dyn StorageBackend, top_ref: Ref) -> StorageResult<()> {
        let inactive = (self.select & SELECT_BIT) ^ SELECT_BIT;
        backend.write_at(u64::from(inactive) * 8, &top_ref.to_le_bytes())?;
        backend.sync()?;
        backend.write_at(FLAGS_OFFSET, &[inactive])?;
        backend.sync()?;

        self.top_refs[usize::from(inactive)] = top_ref;
        self.select = inactive;
        Ok(())
    }
}
