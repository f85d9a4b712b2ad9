//! Storage-tree node encoding.
//!
//! Every node in a SlabDB file starts with an 8-byte header:
//!
//! ```text
//! +----------------+------+-------+--------+
//! | size (u32 LE)  | kind | width | "AA"   |
//! +----------------+------+-------+--------+
//! ```
//!
//! followed by its payload. Arrays hold `size` 64-bit elements; blobs hold
//! `size` raw bytes padded to 8-byte alignment. Elements of inner arrays are
//! either refs (even, non-zero), tagged integers (odd) or null (zero), so a
//! tree walker can find children without knowing what the array means.

use crate::error::{StorageError, StorageResult};

/// Byte offset of a node inside the file.
pub type Ref = u64;

/// Size of a node header in bytes.
pub const NODE_HEADER_SIZE: u64 = 8;

/// All nodes start on this alignment.
pub const NODE_ALIGNMENT: u64 = 8;

const HEADER_MARKER: [u8; 2] = *b"AA";

/// Rounds `n` up to the node alignment.
#[must_use]
pub const fn align(n: u64) -> u64 {
    (n + NODE_ALIGNMENT - 1) & !(NODE_ALIGNMENT - 1)
}

/// What a node's payload contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// Array of plain 64-bit integers.
    Leaf,
    /// Array whose elements are refs, tagged integers or null.
    Inner,
    /// Raw bytes.
    Blob,
}

impl NodeKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Leaf),
            1 => Some(Self::Inner),
            2 => Some(Self::Blob),
            _ => None,
        }
    }

    const fn as_byte(self) -> u8 {
        match self {
            Self::Leaf => 0,
            Self::Inner => 1,
            Self::Blob => 2,
        }
    }

    const fn width(self) -> u8 {
        match self {
            Self::Blob => 1,
            Self::Leaf | Self::Inner => 8,
        }
    }

    /// Returns true if elements of this node may be refs to child nodes.
    #[must_use]
    pub const fn has_refs(self) -> bool {
        matches!(self, Self::Inner)
    }
}

/// Decoded node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Payload kind.
    pub kind: NodeKind,
    /// Element count (arrays) or byte length (blobs).
    pub size: u32,
}

impl NodeHeader {
    /// Encodes the header.
    #[must_use]
    pub fn encode(&self) -> [u8; NODE_HEADER_SIZE as usize] {
        let mut buf = [0u8; NODE_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&self.size.to_le_bytes());
        buf[4] = self.kind.as_byte();
        buf[5] = self.kind.width();
        buf[6..8].copy_from_slice(&HEADER_MARKER);
        buf
    }

    /// Decodes a header from the first 8 bytes of `bytes`.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the bytes are too short, the marker is wrong
    /// or the kind/width combination is unknown.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        if bytes.len() < NODE_HEADER_SIZE as usize {
            return Err(StorageError::Corrupted("truncated node header".into()));
        }
        if bytes[6..8] != HEADER_MARKER {
            return Err(StorageError::Corrupted("bad node header marker".into()));
        }
        let kind = NodeKind::from_byte(bytes[4])
            .ok_or_else(|| StorageError::Corrupted(format!("unknown node kind {}", bytes[4])))?;
        if bytes[5] != kind.width() {
            return Err(StorageError::Corrupted(format!(
                "node width {} does not match kind {:?}",
                bytes[5], kind
            )));
        }
        let size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        Ok(Self { kind, size })
    }

    /// Total number of bytes the node occupies, header included.
    #[must_use]
    pub const fn byte_size(&self) -> u64 {
        let payload = match self.kind {
            NodeKind::Blob => align(self.size as u64),
            NodeKind::Leaf | NodeKind::Inner => self.size as u64 * 8,
        };
        NODE_HEADER_SIZE + payload
    }
}

/// A decoded node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    /// Array of plain integers.
    Leaf(Vec<u64>),
    /// Array of refs / tagged integers.
    Inner(Vec<u64>),
    /// Raw bytes.
    Blob(Vec<u8>),
}

impl Node {
    /// Creates an inner array from ref-or-tagged slots.
    #[must_use]
    pub fn inner(slots: impl IntoIterator<Item = RefOrTagged>) -> Self {
        Self::Inner(slots.into_iter().map(RefOrTagged::raw).collect())
    }

    /// Returns the node kind.
    #[must_use]
    pub fn kind(&self) -> NodeKind {
        match self {
            Self::Leaf(_) => NodeKind::Leaf,
            Self::Inner(_) => NodeKind::Inner,
            Self::Blob(_) => NodeKind::Blob,
        }
    }

    /// Returns the header describing this node.
    #[must_use]
    pub fn header(&self) -> NodeHeader {
        let size = match self {
            Self::Leaf(values) | Self::Inner(values) => values.len(),
            Self::Blob(bytes) => bytes.len(),
        };
        NodeHeader {
            kind: self.kind(),
            size: u32::try_from(size).unwrap_or(u32::MAX),
        }
    }

    /// Total encoded size in bytes.
    #[must_use]
    pub fn byte_size(&self) -> u64 {
        self.header().byte_size()
    }

    /// Array elements; empty for blobs.
    #[must_use]
    pub fn values(&self) -> &[u64] {
        match self {
            Self::Leaf(values) | Self::Inner(values) => values,
            Self::Blob(_) => &[],
        }
    }

    /// Element `ndx` of an inner array as a [`RefOrTagged`].
    #[must_use]
    pub fn slot(&self, ndx: usize) -> RefOrTagged {
        RefOrTagged::from_raw(self.values().get(ndx).copied().unwrap_or(0))
    }

    /// Iterates `(index, ref)` over the children of an inner array.
    pub fn child_refs(&self) -> impl Iterator<Item = (usize, Ref)> + '_ {
        let values: &[u64] = match self {
            Self::Inner(values) => values,
            Self::Leaf(_) | Self::Blob(_) => &[],
        };
        values
            .iter()
            .enumerate()
            .filter_map(|(i, &raw)| RefOrTagged::from_raw(raw).as_ref().map(|r| (i, r)))
    }

    /// Encodes header and payload, padded to alignment.
    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let header = self.header();
        let mut buf = Vec::with_capacity(header.byte_size() as usize);
        buf.extend_from_slice(&header.encode());
        match self {
            Self::Leaf(values) | Self::Inner(values) => {
                for value in values {
                    buf.extend_from_slice(&value.to_le_bytes());
                }
            }
            Self::Blob(bytes) => buf.extend_from_slice(bytes),
        }
        buf.resize(header.byte_size() as usize, 0);
        buf
    }

    /// Decodes a node from bytes starting at its header.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if the header is invalid or the payload is
    /// truncated.
    pub fn decode(bytes: &[u8]) -> StorageResult<Self> {
        let header = NodeHeader::decode(bytes)?;
        let total = header.byte_size() as usize;
        if bytes.len() < total {
            return Err(StorageError::Corrupted(format!(
                "node payload truncated: need {total} bytes, have {}",
                bytes.len()
            )));
        }
        let payload = &bytes[NODE_HEADER_SIZE as usize..total];
        Ok(match header.kind {
            NodeKind::Blob => Self::Blob(payload[..header.size as usize].to_vec()),
            NodeKind::Leaf | NodeKind::Inner => {
                let values = payload
                    .chunks_exact(8)
                    .map(|chunk| {
                        let mut word = [0u8; 8];
                        word.copy_from_slice(chunk);
                        u64::from_le_bytes(word)
                    })
                    .collect();
                if header.kind == NodeKind::Leaf {
                    Self::Leaf(values)
                } else {
                    Self::Inner(values)
                }
            }
        })
    }
}

/// An inner-array element: null, a ref, or a tagged integer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RefOrTagged(u64);

impl RefOrTagged {
    /// The null element.
    pub const NULL: Self = Self(0);

    /// Wraps a raw element.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Returns the raw element.
    #[must_use]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Makes an element from a ref. Refs are always aligned, so even.
    #[must_use]
    pub const fn make_ref(r: Ref) -> Self {
        Self(r)
    }

    /// Makes a tagged unsigned integer. The top bit is lost.
    #[must_use]
    pub const fn make_tagged(value: u64) -> Self {
        Self((value << 1) | 1)
    }

    /// Makes a tagged signed integer.
    #[must_use]
    pub const fn make_signed(value: i64) -> Self {
        Self(((value as u64) << 1) | 1)
    }

    /// Returns true for the null element.
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Returns true if the element is a ref.
    #[must_use]
    pub const fn is_ref(self) -> bool {
        self.0 != 0 && self.0 & 1 == 0
    }

    /// Returns true if the element is a tagged integer.
    #[must_use]
    pub const fn is_tagged(self) -> bool {
        self.0 & 1 == 1
    }

    /// Returns the ref, if this element is one.
    #[must_use]
    pub const fn as_ref(self) -> Option<Ref> {
        if self.is_ref() {
            Some(self.0)
        } else {
            None
        }
    }

    /// Returns the tagged value as unsigned; null reads as zero.
    #[must_use]
    pub const fn as_int(self) -> u64 {
        self.0 >> 1
    }

    /// Returns the tagged value as signed; null reads as zero.
    #[must_use]
    pub const fn as_signed(self) -> i64 {
        (self.0 as i64) >> 1
    }
}
