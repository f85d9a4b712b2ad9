//! Slab allocator over a shared in-memory image of the file.
//!
//! Every reader and the writer of a database share one image. Committed
//! nodes are never modified in place: the writer copies on write into free
//! chunks, and a chunk freed by the commit that produces version `V` stays
//! reserved until no pinned snapshot is older than `V`.
//!
//! Free-space state has three parts:
//!
//! - `free` - chunks that can be handed out now (sorted, coalesced)
//! - `pending` - chunks freed by a commit, tagged with the version that freed them
//! - the per-transaction write state - chunks allocated and committed chunks
//!   freed since `begin_write`, plus a snapshot used to roll back

use crate::backend::StorageBackend;
use crate::error::{StorageError, StorageResult};
use crate::header::{FileHeader, FILE_HEADER_SIZE};
use crate::node::{align, Node, NodeHeader, Ref, NODE_HEADER_SIZE};
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Chunk {
    ref_: Ref,
    size: u64,
}

impl Chunk {
    const fn end(self) -> u64 {
        self.ref_ + self.size
    }
}

#[derive(Debug, Clone, Copy)]
struct PendingChunk {
    chunk: Chunk,
    version: u64,
}

#[derive(Debug, Clone, Default)]
struct FreeSpace {
    free: Vec<Chunk>,
    pending: Vec<PendingChunk>,
    logical_size: u64,
}

impl FreeSpace {
    fn insert_free(&mut self, chunk: Chunk) {
        let pos = self.free.partition_point(|c| c.ref_ < chunk.ref_);
        self.free.insert(pos, chunk);
        if pos + 1 < self.free.len() && self.free[pos].end() == self.free[pos + 1].ref_ {
            self.free[pos].size += self.free[pos + 1].size;
            self.free.remove(pos + 1);
        }
        if pos > 0 && self.free[pos - 1].end() == self.free[pos].ref_ {
            self.free[pos - 1].size += self.free[pos].size;
            self.free.remove(pos);
        }
    }

    fn take(&mut self, size: u64, limit: Option<u64>) -> Option<Ref> {
        let fits = |c: &Chunk| c.size >= size && limit.map_or(true, |l| c.ref_ + size <= l);
        let pos = self.free.iter().position(fits)?;
        let chunk = &mut self.free[pos];
        let ref_ = chunk.ref_;
        chunk.ref_ += size;
        chunk.size -= size;
        if chunk.size == 0 {
            self.free.remove(pos);
        }
        Some(ref_)
    }

    fn trim_tail(&mut self) {
        if let Some(last) = self.free.last().copied() {
            if last.end() == self.logical_size {
                self.logical_size = last.ref_;
                self.free.pop();
            }
        }
    }
}

#[derive(Debug)]
struct WriteState {
    saved: FreeSpace,
    allocated: BTreeMap<Ref, u64>,
    freed: Vec<Chunk>,
    evacuation_limit: Option<u64>,
}

#[derive(Debug, Default)]
struct AllocState {
    space: FreeSpace,
    write: Option<WriteState>,
}

/// Data a commit must make durable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBatch {
    /// Written ranges `(ref, len)`, sorted and coalesced.
    pub ranges: Vec<(Ref, u64)>,
    /// Logical file size of the new version.
    pub logical_size: u64,
    /// Number of bytes allocated by the transaction.
    pub bytes: u64,
}

/// The shared slab allocator.
///
/// # Thread Safety
///
/// Readers only touch the image through a read lock and only read nodes
/// reachable from a pinned snapshot. The single writer mutates the image
/// only inside chunks it allocated, which no pinned snapshot can reach.
#[derive(Debug)]
pub struct SlabAlloc {
    image: RwLock<Vec<u8>>,
    state: Mutex<AllocState>,
    readers: AtomicUsize,
}

impl SlabAlloc {
    /// Creates an allocator for a brand-new file containing only a header.
    #[must_use]
    pub fn new_empty() -> Self {
        Self::from_image(FileHeader::new().encode().to_vec(), FILE_HEADER_SIZE)
    }

    /// Creates an allocator over the bytes of an existing file.
    ///
    /// Bytes beyond `logical_size` are ignored. Free space is empty until
    /// [`SlabAlloc::rebuild_free_space`] is called.
    #[must_use]
    pub fn from_image(mut image: Vec<u8>, logical_size: u64) -> Self {
        if (image.len() as u64) < logical_size {
            image.resize(logical_size as usize, 0);
        }
        Self {
            image: RwLock::new(image),
            state: Mutex::new(AllocState {
                space: FreeSpace {
                    logical_size,
                    ..FreeSpace::default()
                },
                write: None,
            }),
            readers: AtomicUsize::new(0),
        }
    }

    /// Logical size of the file as seen by the writer.
    #[must_use]
    pub fn logical_size(&self) -> u64 {
        self.state.lock().space.logical_size
    }

    /// Number of bytes currently mapped.
    #[must_use]
    pub fn mapped_size(&self) -> u64 {
        self.image.read().len() as u64
    }

    // === Reader side ===

    /// Reads the header of the node at `ref_`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRef` if the ref is misaligned or out of bounds.
    pub fn read_header(&self, ref_: Ref) -> StorageResult<NodeHeader> {
        let image = self.image.read();
        let start = Self::check_ref(&image, ref_)?;
        let header = NodeHeader::decode(&image[start..start + NODE_HEADER_SIZE as usize])?;
        if start as u64 + header.byte_size() > image.len() as u64 {
            return Err(StorageError::InvalidRef {
                ref_,
                size: image.len() as u64,
            });
        }
        Ok(header)
    }

    /// Reads the node at `ref_`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ref is invalid or the node is corrupted.
    pub fn read_node(&self, ref_: Ref) -> StorageResult<Node> {
        let image = self.image.read();
        let start = Self::check_ref(&image, ref_)?;
        Node::decode(&image[start..])
    }

    fn check_ref(image: &[u8], ref_: Ref) -> StorageResult<usize> {
        let size = image.len() as u64;
        if ref_ < FILE_HEADER_SIZE || ref_ % 8 != 0 || ref_ + NODE_HEADER_SIZE > size {
            return Err(StorageError::InvalidRef { ref_, size });
        }
        Ok(ref_ as usize)
    }

    /// Verifies that a snapshot of `file_size` bytes rooted at `top_ref` is
    /// fully mapped.
    ///
    /// # Errors
    ///
    /// Returns `MappingTooSmall` or `InvalidRef`.
    pub fn attach_shared(&self, top_ref: Ref, file_size: u64) -> StorageResult<()> {
        self.remap(file_size)?;
        if top_ref != 0 {
            self.read_header(top_ref)?;
        }
        Ok(())
    }

    /// Makes sure the mapping covers `file_size` bytes.
    ///
    /// # Errors
    ///
    /// Returns `MappingTooSmall` if the file has not grown that far.
    pub fn remap(&self, file_size: u64) -> StorageResult<()> {
        let mapped = self.mapped_size();
        if file_size > mapped {
            return Err(StorageError::MappingTooSmall { file_size, mapped });
        }
        Ok(())
    }

    /// Records that a transaction started using the mapping.
    pub fn note_reader_start(&self) {
        self.readers.fetch_add(1, Ordering::SeqCst);
    }

    /// Records that a transaction stopped using the mapping.
    pub fn note_reader_end(&self) {
        self.readers.fetch_sub(1, Ordering::SeqCst);
    }

    /// Number of transactions currently using the mapping.
    #[must_use]
    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::SeqCst)
    }

    // === Writer side ===

    /// Starts a write transaction.
    ///
    /// Chunks freed by versions up to `oldest_live_version` become reusable,
    /// and a free tail is cut from the logical file size.
    ///
    /// # Errors
    ///
    /// Returns `NotWriting` if a write transaction is already active.
    pub fn begin_write(&self, oldest_live_version: u64) -> StorageResult<()> {
        let mut state = self.state.lock();
        if state.write.is_some() {
            return Err(StorageError::NotWriting);
        }

        let space = &mut state.space;
        let (released, kept): (Vec<_>, Vec<_>) = space
            .pending
            .drain(..)
            .partition(|p| p.version <= oldest_live_version);
        space.pending = kept;
        for pending in released {
            space.insert_free(pending.chunk);
        }
        space.trim_tail();

        let saved = state.space.clone();
        state.write = Some(WriteState {
            saved,
            allocated: BTreeMap::new(),
            freed: Vec::new(),
            evacuation_limit: None,
        });
        Ok(())
    }

    /// Returns true while a write transaction is active.
    #[must_use]
    pub fn is_writing(&self) -> bool {
        self.state.lock().write.is_some()
    }

    /// Restricts allocations of the current write transaction to chunks
    /// ending at or below `limit`, where possible.
    ///
    /// # Errors
    ///
    /// Returns `NotWriting` outside a write transaction.
    pub fn set_evacuation_limit(&self, limit: Option<u64>) -> StorageResult<()> {
        let mut state = self.state.lock();
        let write = state.write.as_mut().ok_or(StorageError::NotWriting)?;
        write.evacuation_limit = limit;
        Ok(())
    }

    /// Allocates `size` bytes (rounded up to alignment).
    ///
    /// # Errors
    ///
    /// Returns `NotWriting` outside a write transaction.
    pub fn alloc(&self, size: u64) -> StorageResult<Ref> {
        let size = align(size.max(NODE_HEADER_SIZE));
        let mut state = self.state.lock();
        let AllocState { space, write } = &mut *state;
        let write = write.as_mut().ok_or(StorageError::NotWriting)?;

        let ref_ = match space.take(size, write.evacuation_limit) {
            Some(ref_) => ref_,
            None => {
                let ref_ = space.logical_size;
                space.logical_size += size;
                if let Some(limit) = write.evacuation_limit {
                    debug!(ref_, size, limit, "no free space below evacuation limit");
                }
                let mut image = self.image.write();
                if (image.len() as u64) < space.logical_size {
                    image.resize(space.logical_size as usize, 0);
                }
                ref_
            }
        };
        write.allocated.insert(ref_, size);
        Ok(ref_)
    }

    /// Writes `node` into a chunk allocated by the current transaction.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRef` if the chunk was not allocated by this
    /// transaction or is too small.
    pub fn write_node(&self, ref_: Ref, node: &Node) -> StorageResult<()> {
        let bytes = node.encode();
        {
            let state = self.state.lock();
            let write = state.write.as_ref().ok_or(StorageError::NotWriting)?;
            match write.allocated.get(&ref_) {
                Some(&size) if size >= bytes.len() as u64 => {}
                _ => {
                    return Err(StorageError::InvalidRef {
                        ref_,
                        size: state.space.logical_size,
                    })
                }
            }
        }
        let mut image = self.image.write();
        let start = ref_ as usize;
        image[start..start + bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    /// Allocates space for `node`, writes it and returns its ref.
    ///
    /// # Errors
    ///
    /// Returns `NotWriting` outside a write transaction.
    pub fn alloc_node(&self, node: &Node) -> StorageResult<Ref> {
        let ref_ = self.alloc(node.byte_size())?;
        self.write_node(ref_, node)?;
        Ok(ref_)
    }

    /// Frees the node at `ref_`.
    ///
    /// Chunks allocated by the current transaction are reusable at once;
    /// committed chunks are held back until the commit's version is no
    /// longer older than every pinned snapshot.
    ///
    /// # Errors
    ///
    /// Returns an error outside a write transaction or for an invalid ref.
    pub fn free(&self, ref_: Ref) -> StorageResult<()> {
        let header = self.read_header(ref_)?;
        let mut state = self.state.lock();
        let AllocState { space, write } = &mut *state;
        let write = write.as_mut().ok_or(StorageError::NotWriting)?;

        if let Some(size) = write.allocated.remove(&ref_) {
            space.insert_free(Chunk { ref_, size });
        } else {
            let chunk = Chunk {
                ref_,
                size: header.byte_size(),
            };
            debug_assert!(!write.freed.contains(&chunk), "double free of {ref_}");
            write.freed.push(chunk);
        }
        Ok(())
    }

    /// Frees the node at `ref_` and every node reachable from it.
    ///
    /// # Errors
    ///
    /// Returns an error outside a write transaction or for an invalid ref.
    pub fn free_tree(&self, ref_: Ref) -> StorageResult<()> {
        let mut stack = vec![ref_];
        while let Some(next) = stack.pop() {
            let node = self.read_node(next)?;
            stack.extend(node.child_refs().map(|(_, child)| child));
            self.free(next)?;
        }
        Ok(())
    }

    /// Bytes allocated by the current write transaction; zero otherwise.
    #[must_use]
    pub fn get_commit_size(&self) -> u64 {
        self.state
            .lock()
            .write
            .as_ref()
            .map_or(0, |w| w.allocated.values().sum())
    }

    /// Ends the write transaction as committed at `version`.
    ///
    /// Committed chunks freed by the transaction become pending under
    /// `version`. The returned batch lists what must be made durable.
    ///
    /// # Errors
    ///
    /// Returns `NotWriting` outside a write transaction.
    pub fn prepare_commit(&self, version: u64) -> StorageResult<CommitBatch> {
        let mut state = self.state.lock();
        let write = state.write.take().ok_or(StorageError::NotWriting)?;

        let bytes = write.allocated.values().sum();
        let mut ranges: Vec<(Ref, u64)> = Vec::new();
        for (&ref_, &size) in &write.allocated {
            match ranges.last_mut() {
                Some((start, len)) if *start + *len == ref_ => *len += size,
                _ => ranges.push((ref_, size)),
            }
        }
        state.space.pending.extend(
            write
                .freed
                .into_iter()
                .map(|chunk| PendingChunk { chunk, version }),
        );

        Ok(CommitBatch {
            ranges,
            logical_size: state.space.logical_size,
            bytes,
        })
    }

    /// Discards everything the current write transaction allocated or
    /// freed. Calling it outside a write transaction does nothing.
    pub fn reset_free_space_tracking(&self) {
        let mut state = self.state.lock();
        if let Some(write) = state.write.take() {
            state.space = write.saved;
        }
    }

    /// Writes a commit batch to `backend` and durably publishes `top_ref`.
    ///
    /// # Errors
    ///
    /// Returns an error if any backend write or sync fails. The header is
    /// only flipped after all data is synced.
    pub fn persist(
        &self,
        backend: &mut dyn StorageBackend,
        header: &mut FileHeader,
        batch: &CommitBatch,
        top_ref: Ref,
    ) -> StorageResult<()> {
        {
            let image = self.image.read();
            let on_disk = backend.size()?;
            let logical = batch.logical_size;
            if on_disk < logical {
                backend.set_len(logical)?;
            }
            for &(ref_, len) in &batch.ranges {
                let end = (ref_ + len).min(on_disk);
                if ref_ < end {
                    backend.write_at(ref_, &image[ref_ as usize..end as usize])?;
                }
            }
            if on_disk < logical {
                backend.write_at(on_disk, &image[on_disk as usize..logical as usize])?;
            }
        }

        header.publish(backend, top_ref)?;

        if backend.size()? > batch.logical_size {
            backend.set_len(batch.logical_size)?;
        }
        Ok(())
    }

    // === Free-space bookkeeping ===

    /// Recomputes free space from reachability.
    ///
    /// Everything between the file header and the logical size that is not
    /// reachable from `top_ref` becomes free. Only valid when no other
    /// snapshot is in use, i.e. when a file is opened.
    ///
    /// # Errors
    ///
    /// Returns `Corrupted` if reachable nodes overlap or exceed the logical
    /// size.
    pub fn rebuild_free_space(&self, top_ref: Ref) -> StorageResult<()> {
        let mut used = Vec::new();
        if top_ref != 0 {
            let mut stack = vec![top_ref];
            while let Some(ref_) = stack.pop() {
                let node = self.read_node(ref_)?;
                used.push(Chunk {
                    ref_,
                    size: node.byte_size(),
                });
                stack.extend(node.child_refs().map(|(_, child)| child));
            }
        }
        used.sort_by_key(|c| c.ref_);

        let mut state = self.state.lock();
        let logical = state.space.logical_size;
        let mut free = FreeSpace {
            logical_size: logical,
            ..FreeSpace::default()
        };
        let mut cursor = FILE_HEADER_SIZE;
        for chunk in used {
            if chunk.ref_ < cursor || chunk.end() > logical {
                return Err(StorageError::Corrupted(format!(
                    "node at {} ({} bytes) overlaps another node or the file end",
                    chunk.ref_, chunk.size
                )));
            }
            if chunk.ref_ > cursor {
                free.insert_free(Chunk {
                    ref_: cursor,
                    size: chunk.ref_ - cursor,
                });
            }
            cursor = chunk.end();
        }
        if cursor < logical {
            free.insert_free(Chunk {
                ref_: cursor,
                size: logical - cursor,
            });
        }
        state.space = free;
        Ok(())
    }

    /// Bytes that can be allocated without growing the file.
    #[must_use]
    pub fn free_bytes(&self) -> u64 {
        self.state.lock().space.free.iter().map(|c| c.size).sum()
    }

    /// Bytes freed by commits and still reserved for older snapshots.
    #[must_use]
    pub fn pending_bytes(&self) -> u64 {
        self.state
            .lock()
            .space
            .pending
            .iter()
            .map(|p| p.chunk.size)
            .sum()
    }
}
