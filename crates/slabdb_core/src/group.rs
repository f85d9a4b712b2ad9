//! Accessor state of one snapshot: the top array, table names and tables.
//!
//! Top array layout:
//!
//! ```text
//!  0 table names          (inner array of string blobs)
//!  1 tables               (inner array of table refs)
//!  2 logical file size
//!  3 file format version
//!  4 version
//!  5 history type
//!  6 sync file ident
//!  7 schema version
//!  8 history root
//!  9 history schema version   (format 7 and later)
//! 10 evacuation point          (0 = none)
//! ```

use crate::error::{CoreError, CoreResult};
use crate::table::{read_string, TableData};
use crate::types::TableKey;
use slabdb_storage::{Node, Ref, RefOrTagged, SlabAlloc};
use std::borrow::Cow;
use std::sync::{Arc, OnceLock};

pub(crate) const SLOT_TABLE_NAMES: usize = 0;
pub(crate) const SLOT_TABLES: usize = 1;
pub(crate) const SLOT_FILE_SIZE: usize = 2;
pub(crate) const SLOT_FILE_FORMAT: usize = 3;
pub(crate) const SLOT_VERSION: usize = 4;
pub(crate) const SLOT_HISTORY_TYPE: usize = 5;
pub(crate) const SLOT_SYNC_FILE_IDENT: usize = 6;
pub(crate) const SLOT_SCHEMA_VERSION: usize = 7;
pub(crate) const SLOT_HISTORY: usize = 8;
pub(crate) const SLOT_HISTORY_SCHEMA_VERSION: usize = 9;
pub(crate) const SLOT_EVACUATION_POINT: usize = 10;

/// Number of top slots written for a new file.
pub(crate) const TOP_SLOTS: usize = 11;

/// A table of the snapshot. Clean tables are decoded on first access and
/// kept for the lifetime of the snapshot.
#[derive(Debug, Clone)]
enum TableSlot {
    Clean {
        ref_: Ref,
        decoded: OnceLock<Arc<TableData>>,
    },
    Dirty {
        old: Option<Ref>,
        data: Box<TableData>,
    },
}

impl TableSlot {
    fn clean(ref_: Ref) -> Self {
        Self::Clean {
            ref_,
            decoded: OnceLock::new(),
        }
    }
}

/// In-memory view of one snapshot, mutable while writing.
#[derive(Debug, Clone, Default)]
pub(crate) struct Group {
    top_ref: Ref,
    top: Vec<u64>,
    names: Vec<String>,
    keys: Vec<Option<TableKey>>,
    tables: Vec<TableSlot>,
    names_dirty: bool,
    tables_dirty: bool,
    top_dirty: bool,
}

impl Group {
    /// Loads the snapshot rooted at `top_ref`.
    pub(crate) fn load(alloc: &SlabAlloc, top_ref: Ref) -> CoreResult<Self> {
        if top_ref == 0 {
            return Ok(Self::default());
        }
        let top = match alloc.read_node(top_ref)? {
            Node::Inner(values) => values,
            _ => return Err(CoreError::invalid_format("top array is not an inner array")),
        };
        let mut group = Self {
            top_ref,
            top,
            ..Self::default()
        };
        group.load_children(alloc)?;
        Ok(group)
    }

    fn load_children(&mut self, alloc: &SlabAlloc) -> CoreResult<()> {
        self.names = match self.slot(SLOT_TABLE_NAMES).as_ref() {
            Some(r) => alloc
                .read_node(r)?
                .values()
                .iter()
                .map(|&raw| read_string(alloc, raw))
                .collect::<CoreResult<_>>()?,
            None => Vec::new(),
        };
        let table_refs: Vec<Ref> = match self.slot(SLOT_TABLES).as_ref() {
            Some(r) => alloc.read_node(r)?.child_refs().map(|(_, t)| t).collect(),
            None => Vec::new(),
        };
        if table_refs.len() != self.names.len() {
            return Err(CoreError::invalid_format(
                "table names and tables differ in length",
            ));
        }
        self.keys = table_refs
            .iter()
            .map(|&r| TableData::read_key(alloc, r))
            .collect::<CoreResult<_>>()?;
        self.tables = table_refs.into_iter().map(TableSlot::clean).collect();
        self.names_dirty = false;
        self.tables_dirty = false;
        Ok(())
    }

    /// Root this group was loaded from or last written to.
    pub(crate) fn top_ref(&self) -> Ref {
        self.top_ref
    }

    // === Top array ===

    pub(crate) fn top_size(&self) -> usize {
        self.top.len()
    }

    pub(crate) fn slot(&self, ndx: usize) -> RefOrTagged {
        RefOrTagged::from_raw(self.top.get(ndx).copied().unwrap_or(0))
    }

    /// Sets a top slot, padding with tagged zeros as needed.
    pub(crate) fn set_slot(&mut self, ndx: usize, value: RefOrTagged) {
        if self.top.len() <= ndx {
            self.top.resize(ndx + 1, RefOrTagged::make_tagged(0).raw());
        }
        self.top[ndx] = value.raw();
        self.top_dirty = true;
    }

    /// Appends a tagged slot.
    pub(crate) fn push_slot(&mut self, value: RefOrTagged) {
        self.top.push(value.raw());
        self.top_dirty = true;
    }

    pub(crate) fn file_format_version(&self) -> u32 {
        u32::try_from(self.slot(SLOT_FILE_FORMAT).as_int()).unwrap_or(u32::MAX)
    }

    pub(crate) fn version(&self) -> u64 {
        self.slot(SLOT_VERSION).as_int()
    }

    pub(crate) fn evacuation_point(&self) -> u64 {
        self.slot(SLOT_EVACUATION_POINT).as_int()
    }

    // === Tables ===

    pub(crate) fn table_count(&self) -> usize {
        self.names.len()
    }

    pub(crate) fn names(&self) -> &[String] {
        &self.names
    }

    pub(crate) fn position_by_name(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub(crate) fn position_by_key(&self, key: TableKey) -> CoreResult<usize> {
        (0..self.tables.len())
            .find(|&pos| self.key_at(pos) == Some(key))
            .ok_or_else(|| CoreError::table_not_found(key.to_string()))
    }

    /// Key of the table at `pos`. Keys of tables changed in this
    /// transaction come from the changed data.
    pub(crate) fn key_at(&self, pos: usize) -> Option<TableKey> {
        match self.tables.get(pos)? {
            TableSlot::Dirty { data, .. } => data.key,
            TableSlot::Clean { .. } => self.keys.get(pos).copied().flatten(),
        }
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = TableKey> + '_ {
        (0..self.tables.len()).filter_map(|pos| self.key_at(pos))
    }

    /// Key for a new table: above every existing key and position.
    pub(crate) fn next_table_key(&self) -> TableKey {
        let above_keys = self.keys().map(|k| k.0 + 1).max().unwrap_or(0);
        let above_positions = u32::try_from(self.tables.len()).unwrap_or(u32::MAX);
        TableKey(above_keys.max(above_positions))
    }

    pub(crate) fn table(&self, alloc: &SlabAlloc, pos: usize) -> CoreResult<Cow<'_, TableData>> {
        match self.tables.get(pos) {
            Some(TableSlot::Clean { ref_, decoded }) => {
                if decoded.get().is_none() {
                    let _ = decoded.set(Arc::new(TableData::read(alloc, *ref_)?));
                }
                decoded
                    .get()
                    .map(|data| Cow::Borrowed(&**data))
                    .ok_or_else(|| CoreError::table_not_found(format!("position {pos}")))
            }
            Some(TableSlot::Dirty { data, .. }) => Ok(Cow::Borrowed(&**data)),
            None => Err(CoreError::table_not_found(format!("position {pos}"))),
        }
    }

    pub(crate) fn table_mut(&mut self, alloc: &SlabAlloc, pos: usize) -> CoreResult<&mut TableData> {
        let slot = self
            .tables
            .get_mut(pos)
            .ok_or_else(|| CoreError::table_not_found(format!("position {pos}")))?;
        if let TableSlot::Clean { ref_, decoded } = slot {
            let old = *ref_;
            let data = match decoded.take() {
                Some(cached) => Arc::unwrap_or_clone(cached),
                None => TableData::read(alloc, old)?,
            };
            *slot = TableSlot::Dirty {
                old: Some(old),
                data: Box::new(data),
            };
        }
        self.tables_dirty = true;
        match &mut self.tables[pos] {
            TableSlot::Dirty { data, .. } => Ok(data.as_mut()),
            TableSlot::Clean { .. } => {
                Err(CoreError::table_not_found(format!("position {pos}")))
            }
        }
    }

    pub(crate) fn add_table(&mut self, name: &str, data: TableData) -> usize {
        self.names.push(name.to_string());
        self.keys.push(data.key);
        self.tables.push(TableSlot::Dirty {
            old: None,
            data: Box::new(data),
        });
        self.names_dirty = true;
        self.tables_dirty = true;
        self.tables.len() - 1
    }

    pub(crate) fn remove_table(&mut self, alloc: &SlabAlloc, pos: usize) -> CoreResult<()> {
        if pos >= self.tables.len() {
            return Err(CoreError::table_not_found(format!("position {pos}")));
        }
        let old = match self.tables.remove(pos) {
            TableSlot::Clean { ref_, .. } => Some(ref_),
            TableSlot::Dirty { old, .. } => old,
        };
        if let Some(r) = old {
            alloc.free_tree(r)?;
        }
        self.names.remove(pos);
        self.keys.remove(pos);
        self.names_dirty = true;
        self.tables_dirty = true;
        Ok(())
    }

    // === Writing ===

    /// Returns true if anything differs from the loaded snapshot.
    pub(crate) fn is_dirty(&self) -> bool {
        self.names_dirty || self.tables_dirty || self.top_dirty
    }

    /// Bytes that writing the pending changes would allocate: dirty
    /// tables, the names and tables arrays if they changed, and the top
    /// array. The changes are encoded into a scratch allocator, so nothing
    /// in `alloc`-owned storage moves.
    pub(crate) fn staged_size(&self) -> CoreResult<u64> {
        if !self.is_dirty() {
            return Ok(0);
        }
        let scratch = SlabAlloc::new_empty();
        scratch.begin_write(0)?;
        for slot in &self.tables {
            if let TableSlot::Dirty { data, .. } = slot {
                data.write(&scratch)?;
            }
        }
        if self.names_dirty {
            for name in &self.names {
                scratch.alloc_node(&Node::Blob(name.as_bytes().to_vec()))?;
            }
            scratch.alloc(Node::Inner(vec![0; self.names.len()]).byte_size())?;
        }
        if self.tables_dirty {
            scratch.alloc(Node::Inner(vec![0; self.tables.len()]).byte_size())?;
        }
        scratch.alloc(Node::Inner(self.top.clone()).byte_size())?;
        Ok(scratch.get_commit_size())
    }

    /// Writes dirty tables, the names array and the tables array, and
    /// points top slots 0 and 1 at them. The top array itself is not
    /// written.
    pub(crate) fn flush_children(&mut self, alloc: &SlabAlloc) -> CoreResult<()> {
        if self.names_dirty || self.slot(SLOT_TABLE_NAMES).as_ref().is_none() {
            if let Some(old) = self.slot(SLOT_TABLE_NAMES).as_ref() {
                alloc.free_tree(old)?;
            }
            let mut blobs = Vec::with_capacity(self.names.len());
            for name in &self.names {
                blobs.push(alloc.alloc_node(&Node::Blob(name.as_bytes().to_vec()))?);
            }
            let names = alloc.alloc_node(&Node::Inner(blobs))?;
            self.set_slot(SLOT_TABLE_NAMES, RefOrTagged::make_ref(names));
            self.names_dirty = false;
        }

        if self.tables_dirty || self.slot(SLOT_TABLES).as_ref().is_none() {
            let mut refs = Vec::with_capacity(self.tables.len());
            for (pos, slot) in self.tables.iter_mut().enumerate() {
                if let TableSlot::Dirty { old, data } = slot {
                    if let Some(old) = old.take() {
                        alloc.free_tree(old)?;
                    }
                    self.keys[pos] = data.key;
                    *slot = TableSlot::clean(data.write(alloc)?);
                }
                if let TableSlot::Clean { ref_, .. } = slot {
                    refs.push(*ref_);
                }
            }
            if let Some(old) = self.slot(SLOT_TABLES).as_ref() {
                alloc.free(old)?;
            }
            let tables = alloc.alloc_node(&Node::Inner(refs))?;
            self.set_slot(SLOT_TABLES, RefOrTagged::make_ref(tables));
            self.tables_dirty = false;
        }
        Ok(())
    }

    /// Points slots 0 and 1 at new trees, e.g. after evacuation, and
    /// reloads the table cache from them.
    pub(crate) fn replace_children(
        &mut self,
        alloc: &SlabAlloc,
        names: Option<Ref>,
        tables: Option<Ref>,
    ) -> CoreResult<()> {
        if let Some(r) = names {
            self.set_slot(SLOT_TABLE_NAMES, RefOrTagged::make_ref(r));
        }
        if let Some(r) = tables {
            self.set_slot(SLOT_TABLES, RefOrTagged::make_ref(r));
        }
        self.load_children(alloc)
    }

    /// Writes the top array. The file-size slot records the logical size
    /// after the top array itself has been allocated. The previously
    /// written top array is freed.
    pub(crate) fn write_top(&mut self, alloc: &SlabAlloc) -> CoreResult<Ref> {
        if self.top.len() <= SLOT_FILE_SIZE {
            self.set_slot(SLOT_FILE_SIZE, RefOrTagged::make_tagged(0));
        }
        let node = Node::Inner(self.top.clone());
        let new_ref = alloc.alloc(node.byte_size())?;
        self.top[SLOT_FILE_SIZE] = RefOrTagged::make_tagged(alloc.logical_size()).raw();
        alloc.write_node(new_ref, &Node::Inner(self.top.clone()))?;
        if self.top_ref != 0 {
            alloc.free(self.top_ref)?;
        }
        self.top_ref = new_ref;
        self.top_dirty = false;
        Ok(new_ref)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{ColumnSpec, ColumnType};

    #[test]
    fn empty_group_writes_a_full_top() {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0).unwrap();
        let mut group = Group::default();
        for _ in 0..TOP_SLOTS {
            group.push_slot(RefOrTagged::make_tagged(0));
        }
        group.set_slot(SLOT_FILE_FORMAT, RefOrTagged::make_tagged(22));
        group.flush_children(&alloc).unwrap();
        let top = group.write_top(&alloc).unwrap();

        let loaded = Group::load(&alloc, top).unwrap();
        assert_eq!(loaded.top_size(), TOP_SLOTS);
        assert_eq!(loaded.file_format_version(), 22);
        assert_eq!(loaded.table_count(), 0);
        assert_eq!(loaded.slot(SLOT_FILE_SIZE).as_int(), alloc.logical_size());
    }

    #[test]
    fn tables_survive_a_flush() {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0).unwrap();
        let mut group = Group::default();
        let key = group.next_table_key();
        let mut table = TableData::new(key, false);
        table.add_column(ColumnSpec::new("n", ColumnType::Int));
        table.create_object();
        group.add_table("numbers", table);
        group.flush_children(&alloc).unwrap();
        let top = group.write_top(&alloc).unwrap();

        let loaded = Group::load(&alloc, top).unwrap();
        assert_eq!(loaded.names(), ["numbers".to_string()]);
        assert_eq!(loaded.position_by_key(key).unwrap(), 0);
        assert_eq!(loaded.table(&alloc, 0).unwrap().size(), 1);
    }

    #[test]
    fn clean_tables_are_decoded_once_per_snapshot() {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0).unwrap();
        let mut group = Group::default();
        let mut table = TableData::new(TableKey(0), false);
        table.add_column(ColumnSpec::new("n", ColumnType::Int));
        table.create_object();
        group.add_table("numbers", table);
        group.flush_children(&alloc).unwrap();
        let top = group.write_top(&alloc).unwrap();

        let mut loaded = Group::load(&alloc, top).unwrap();
        let first = loaded.table(&alloc, 0).unwrap();
        let second = loaded.table(&alloc, 0).unwrap();
        assert!(matches!(first, Cow::Borrowed(_)));
        assert!(std::ptr::eq(&*first, &*second));
        assert_eq!(loaded.staged_size().unwrap(), 0);

        loaded.table_mut(&alloc, 0).unwrap().create_object();
        assert_eq!(loaded.table(&alloc, 0).unwrap().size(), 2);
        assert!(loaded.staged_size().unwrap() > 0);
    }

    #[test]
    fn removed_table_is_freed() {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0).unwrap();
        let mut group = Group::default();
        group.add_table("a", TableData::new(TableKey(0), false));
        group.flush_children(&alloc).unwrap();
        let before = alloc.free_bytes();

        group.remove_table(&alloc, 0).unwrap();
        assert!(alloc.free_bytes() > before);
        assert_eq!(group.table_count(), 0);
        assert!(group.position_by_key(TableKey(0)).is_err());
    }
}
