//! Tables and their storage layout.
//!
//! A table is one inner array in the file:
//!
//! ```text
//! 0 spec | 1 legacy columns | 2 cluster | 3 primary key | 4 table key |
//! 5 flags | 6 next object key | 7 search indexes
//! ```
//!
//! Tables written before format 10 have slots 0 and 1 only. Their spec is
//! `[names, types, attrs, link targets]` with targets given as table
//! positions, and their rows are stored column by column in slot 1. The
//! migration operations on [`TableData`] turn such a table into the current
//! layout one step at a time; every step checks whether its work is already
//! done so an interrupted upgrade can run them again.
//!
//! Tables are decoded whole, mutated in memory and written back whole. The
//! previous version of a rewritten table is freed as a tree.

use crate::error::{CoreError, CoreResult};
use crate::types::{ColKey, ObjKey, TableKey};
use serde::{Deserialize, Serialize};
use slabdb_storage::{Node, Ref, RefOrTagged, SlabAlloc};

/// Column attribute: the column had a search index in the legacy layout.
pub const ATTR_INDEXED: u64 = 1;
/// Column attribute: values are unique.
pub const ATTR_UNIQUE: u64 = 2;
/// Column attribute: the column accepts null.
pub const ATTR_NULLABLE: u64 = 16;

const FLAG_ASYMMETRIC: u64 = 1;

const SLOT_SPEC: usize = 0;
const SLOT_LEGACY_COLUMNS: usize = 1;
const SLOT_CLUSTER: usize = 2;
const SLOT_PRIMARY_KEY: usize = 3;
const SLOT_TABLE_KEY: usize = 4;
const SLOT_FLAGS: usize = 5;
const SLOT_NEXT_OBJ_KEY: usize = 6;
const SLOT_SEARCH_INDEXES: usize = 7;
const TABLE_SLOTS: usize = 8;

/// Type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColumnType {
    /// Signed integer.
    Int,
    /// Boolean.
    Bool,
    /// UTF-8 string.
    String,
    /// Link to an object in another table.
    Link,
}

impl ColumnType {
    const fn code(self) -> u64 {
        match self {
            Self::Int => 0,
            Self::Bool => 1,
            Self::String => 2,
            Self::Link => 12,
        }
    }

    fn from_code(code: u64) -> CoreResult<Self> {
        match code {
            0 => Ok(Self::Int),
            1 => Ok(Self::Bool),
            2 => Ok(Self::String),
            12 => Ok(Self::Link),
            other => Err(CoreError::invalid_format(format!(
                "unknown column type {other}"
            ))),
        }
    }
}

/// A stored value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// No value.
    Null,
    /// Integer.
    Int(i64),
    /// Boolean.
    Bool(bool),
    /// String.
    String(String),
    /// Link to an object of the column's target table.
    Link(ObjKey),
}

impl Value {
    fn matches(&self, col: &ColumnSpec) -> bool {
        match self {
            Self::Null => col.is_nullable() || col.col_type == ColumnType::Link,
            Self::Int(_) => col.col_type == ColumnType::Int,
            Self::Bool(_) => col.col_type == ColumnType::Bool,
            Self::String(_) => col.col_type == ColumnType::String,
            Self::Link(_) => col.col_type == ColumnType::Link,
        }
    }

    fn write(&self, alloc: &SlabAlloc) -> CoreResult<u64> {
        let slot = match self {
            Self::Null => RefOrTagged::NULL,
            Self::Int(v) => RefOrTagged::make_signed(*v),
            Self::Bool(b) => RefOrTagged::make_tagged(u64::from(*b)),
            Self::Link(key) => RefOrTagged::make_signed(key.0),
            Self::String(s) => {
                RefOrTagged::make_ref(alloc.alloc_node(&Node::Blob(s.as_bytes().to_vec()))?)
            }
        };
        Ok(slot.raw())
    }

    fn read(alloc: &SlabAlloc, col_type: ColumnType, raw: u64) -> CoreResult<Self> {
        let slot = RefOrTagged::from_raw(raw);
        if slot.is_null() {
            return Ok(Self::Null);
        }
        Ok(match col_type {
            ColumnType::Int => Self::Int(slot.as_signed()),
            ColumnType::Bool => Self::Bool(slot.as_int() != 0),
            ColumnType::Link => Self::Link(ObjKey(slot.as_signed())),
            ColumnType::String => Self::String(read_string(alloc, raw)?),
        })
    }
}

/// Where a link column points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkTarget {
    /// Not a link column.
    None,
    /// Legacy layout: position of the target table in the group.
    Position(usize),
    /// Key of the target table.
    Table(TableKey),
}

/// Description of one column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    /// Column name.
    pub name: String,
    /// Value type.
    pub col_type: ColumnType,
    /// Attribute bits (`ATTR_*`).
    pub attrs: u64,
    /// Link target, for link columns.
    pub target: LinkTarget,
    /// Column key; `None` until the table is migrated.
    pub key: Option<ColKey>,
}

impl ColumnSpec {
    /// Creates a column without attributes.
    pub fn new(name: impl Into<String>, col_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            col_type,
            attrs: 0,
            target: LinkTarget::None,
            key: None,
        }
    }

    /// Adds attribute bits.
    #[must_use]
    pub fn with_attrs(mut self, attrs: u64) -> Self {
        self.attrs |= attrs;
        self
    }

    /// Sets the link target.
    #[must_use]
    pub fn with_target(mut self, target: LinkTarget) -> Self {
        self.target = target;
        self
    }

    /// Returns true if the column accepts null.
    #[must_use]
    pub fn is_nullable(&self) -> bool {
        self.attrs & ATTR_NULLABLE != 0
    }

    fn default_value(&self) -> Value {
        if self.is_nullable() {
            return Value::Null;
        }
        match self.col_type {
            ColumnType::Int => Value::Int(0),
            ColumnType::Bool => Value::Bool(false),
            ColumnType::String => Value::String(String::new()),
            ColumnType::Link => Value::Null,
        }
    }
}

/// One object of a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Object key.
    pub key: ObjKey,
    /// One value per column.
    pub values: Vec<Value>,
}

/// A decoded table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableData {
    pub(crate) key: Option<TableKey>,
    pub(crate) columns: Vec<ColumnSpec>,
    pub(crate) legacy_columns: Option<Vec<Vec<Value>>>,
    pub(crate) rows: Option<Vec<Row>>,
    pub(crate) primary_key: Option<ColKey>,
    pub(crate) flags: u64,
    pub(crate) next_obj_key: i64,
    pub(crate) search_indexes: Vec<ColKey>,
}

impl TableData {
    /// Creates an empty table in the current layout.
    #[must_use]
    pub fn new(key: TableKey, asymmetric: bool) -> Self {
        Self {
            key: Some(key),
            columns: Vec::new(),
            legacy_columns: None,
            rows: Some(Vec::new()),
            primary_key: None,
            flags: if asymmetric { FLAG_ASYMMETRIC } else { 0 },
            next_obj_key: 0,
            search_indexes: Vec::new(),
        }
    }

    /// Creates a table in the pre-format-10 layout.
    ///
    /// `values[c][r]` is the value of column `c` in row `r`. Link values
    /// hold the target row number.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if the column count or lengths disagree.
    pub fn legacy(columns: Vec<ColumnSpec>, values: Vec<Vec<Value>>) -> CoreResult<Self> {
        if values.len() != columns.len() {
            return Err(CoreError::invalid_format("legacy column count mismatch"));
        }
        let rows = values.first().map_or(0, Vec::len);
        if values.iter().any(|column| column.len() != rows) {
            return Err(CoreError::invalid_format("legacy columns differ in length"));
        }
        Ok(Self {
            key: None,
            columns,
            legacy_columns: Some(values),
            rows: None,
            primary_key: None,
            flags: 0,
            next_obj_key: 0,
            search_indexes: Vec::new(),
        })
    }

    // === Storage ===

    /// Reads the key of the table at `ref_` without decoding the rest.
    pub(crate) fn read_key(alloc: &SlabAlloc, ref_: Ref) -> CoreResult<Option<TableKey>> {
        let node = alloc.read_node(ref_)?;
        Ok(key_from_slot(node.slot(SLOT_TABLE_KEY), node.values().len()))
    }

    /// Decodes the table at `ref_`.
    ///
    /// # Errors
    ///
    /// Returns an error if any node of the table is invalid.
    pub fn read(alloc: &SlabAlloc, ref_: Ref) -> CoreResult<Self> {
        let node = alloc.read_node(ref_)?;
        let slots = node.values().len();
        let key = key_from_slot(node.slot(SLOT_TABLE_KEY), slots);
        let columns = read_spec(alloc, node.slot(SLOT_SPEC).as_ref(), key.is_some())?;

        let legacy_columns = match node.slot(SLOT_LEGACY_COLUMNS).as_ref() {
            Some(columns_ref) => {
                let list = alloc.read_node(columns_ref)?;
                if list.values().len() != columns.len() {
                    return Err(CoreError::invalid_format("legacy column count mismatch"));
                }
                let mut values = Vec::with_capacity(columns.len());
                for (col, (_, column_ref)) in columns.iter().zip(list.child_refs()) {
                    let raw = alloc.read_node(column_ref)?;
                    values.push(
                        raw.values()
                            .iter()
                            .map(|&v| Value::read(alloc, col.col_type, v))
                            .collect::<CoreResult<Vec<_>>>()?,
                    );
                }
                let rows = values.first().map_or(0, Vec::len);
                if values.iter().any(|column| column.len() != rows) {
                    return Err(CoreError::invalid_format("legacy columns differ in length"));
                }
                Some(values)
            }
            None => None,
        };

        let rows = match node.slot(SLOT_CLUSTER).as_ref() {
            Some(cluster_ref) => {
                let cluster = alloc.read_node(cluster_ref)?;
                let mut rows = Vec::with_capacity(cluster.values().len());
                for (_, row_ref) in cluster.child_refs() {
                    let row = alloc.read_node(row_ref)?;
                    let raw = row.values();
                    if raw.len() != columns.len() + 1 {
                        return Err(CoreError::invalid_format("row width mismatch"));
                    }
                    let values = columns
                        .iter()
                        .zip(&raw[1..])
                        .map(|(col, &v)| Value::read(alloc, col.col_type, v))
                        .collect::<CoreResult<Vec<_>>>()?;
                    rows.push(Row {
                        key: ObjKey(row.slot(0).as_signed()),
                        values,
                    });
                }
                Some(rows)
            }
            None => None,
        };

        let primary_key = match node.slot(SLOT_PRIMARY_KEY) {
            slot if slot.is_tagged() => Some(ColKey(slot.as_int())),
            _ => None,
        };
        let search_indexes = match node.slot(SLOT_SEARCH_INDEXES).as_ref() {
            Some(r) => alloc.read_node(r)?.values().iter().map(|&k| ColKey(k)).collect(),
            None => Vec::new(),
        };

        Ok(Self {
            key,
            columns,
            legacy_columns,
            rows,
            primary_key,
            flags: node.slot(SLOT_FLAGS).as_int(),
            next_obj_key: node.slot(SLOT_NEXT_OBJ_KEY).as_signed(),
            search_indexes,
        })
    }

    /// Writes the table and returns its ref.
    ///
    /// # Errors
    ///
    /// Returns an error if allocation fails.
    pub fn write(&self, alloc: &SlabAlloc) -> CoreResult<Ref> {
        let spec = self.write_spec(alloc)?;
        let legacy = match &self.legacy_columns {
            Some(columns) => {
                let mut refs = Vec::with_capacity(columns.len());
                for column in columns {
                    let raw = column
                        .iter()
                        .map(|v| v.write(alloc))
                        .collect::<CoreResult<Vec<_>>>()?;
                    refs.push(alloc.alloc_node(&Node::Inner(raw))?);
                }
                alloc.alloc_node(&Node::Inner(refs))?
            }
            None => 0,
        };

        let Some(key) = self.key else {
            return Ok(alloc.alloc_node(&Node::Inner(vec![spec, legacy]))?);
        };

        let cluster = match &self.rows {
            Some(rows) => {
                let mut refs = Vec::with_capacity(rows.len());
                for row in rows {
                    let mut raw = Vec::with_capacity(row.values.len() + 1);
                    raw.push(RefOrTagged::make_signed(row.key.0).raw());
                    for value in &row.values {
                        raw.push(value.write(alloc)?);
                    }
                    refs.push(alloc.alloc_node(&Node::Inner(raw))?);
                }
                alloc.alloc_node(&Node::Inner(refs))?
            }
            None => 0,
        };
        let indexes = alloc.alloc_node(&Node::Leaf(
            self.search_indexes.iter().map(|k| k.0).collect(),
        ))?;

        let mut slots = vec![0u64; TABLE_SLOTS];
        slots[SLOT_SPEC] = spec;
        slots[SLOT_LEGACY_COLUMNS] = legacy;
        slots[SLOT_CLUSTER] = cluster;
        slots[SLOT_PRIMARY_KEY] = self
            .primary_key
            .map_or(RefOrTagged::NULL, |k| RefOrTagged::make_tagged(k.0))
            .raw();
        slots[SLOT_TABLE_KEY] = RefOrTagged::make_tagged(u64::from(key.0)).raw();
        slots[SLOT_FLAGS] = RefOrTagged::make_tagged(self.flags).raw();
        slots[SLOT_NEXT_OBJ_KEY] = RefOrTagged::make_signed(self.next_obj_key).raw();
        slots[SLOT_SEARCH_INDEXES] = indexes;
        Ok(alloc.alloc_node(&Node::Inner(slots))?)
    }

    fn write_spec(&self, alloc: &SlabAlloc) -> CoreResult<Ref> {
        let mut names = Vec::with_capacity(self.columns.len());
        for col in &self.columns {
            names.push(alloc.alloc_node(&Node::Blob(col.name.as_bytes().to_vec()))?);
        }
        let types = self.columns.iter().map(|c| c.col_type.code()).collect();
        let attrs = self.columns.iter().map(|c| c.attrs).collect();
        let targets = self
            .columns
            .iter()
            .map(|c| match c.target {
                LinkTarget::None => 0,
                LinkTarget::Position(p) => p as u64,
                LinkTarget::Table(k) => u64::from(k.0),
            })
            .collect();

        let mut spec = vec![
            alloc.alloc_node(&Node::Inner(names))?,
            alloc.alloc_node(&Node::Leaf(types))?,
            alloc.alloc_node(&Node::Leaf(attrs))?,
            alloc.alloc_node(&Node::Leaf(targets))?,
        ];
        if self.key.is_some() {
            let keys = self
                .columns
                .iter()
                .enumerate()
                .map(|(i, c)| c.key.unwrap_or(ColKey::new(i, 0)).0)
                .collect();
            spec.push(alloc.alloc_node(&Node::Leaf(keys))?);
        }
        Ok(alloc.alloc_node(&Node::Inner(spec))?)
    }

    // === Accessors ===

    /// Table key; `None` for a table in the legacy layout.
    #[must_use]
    pub fn key(&self) -> Option<TableKey> {
        self.key
    }

    /// Column descriptions.
    #[must_use]
    pub fn columns(&self) -> &[ColumnSpec] {
        &self.columns
    }

    /// Returns true for a table in the legacy layout.
    #[must_use]
    pub fn is_legacy(&self) -> bool {
        self.key.is_none()
    }

    /// Returns true for an asymmetric (write-only) table.
    #[must_use]
    pub fn is_asymmetric(&self) -> bool {
        self.flags & FLAG_ASYMMETRIC != 0
    }

    /// Primary key column, if any.
    #[must_use]
    pub fn primary_key(&self) -> Option<ColKey> {
        self.primary_key
    }

    /// Columns with a search index.
    #[must_use]
    pub fn search_indexes(&self) -> &[ColKey] {
        &self.search_indexes
    }

    /// Objects in the current layout.
    #[must_use]
    pub fn rows(&self) -> &[Row] {
        self.rows.as_deref().unwrap_or(&[])
    }

    /// Number of objects.
    #[must_use]
    pub fn size(&self) -> usize {
        match (&self.rows, &self.legacy_columns) {
            (Some(rows), _) if !rows.is_empty() => rows.len(),
            (_, Some(columns)) => columns.first().map_or(0, Vec::len),
            (Some(rows), None) => rows.len(),
            (None, None) => 0,
        }
    }

    /// Values of a legacy column.
    #[must_use]
    pub fn legacy_values(&self, index: usize) -> Option<&[Value]> {
        self.legacy_columns
            .as_ref()
            .and_then(|columns| columns.get(index))
            .map(Vec::as_slice)
    }

    /// Position of the column named `name`.
    #[must_use]
    pub fn column_index_by_name(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Key of the column named `name`.
    #[must_use]
    pub fn column_key_by_name(&self, name: &str) -> Option<ColKey> {
        self.columns.iter().find(|c| c.name == name).and_then(|c| c.key)
    }

    /// Resolves a column key to its position.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for a stale or unknown key.
    pub fn column_index(&self, col: ColKey) -> CoreResult<usize> {
        match self.columns.get(col.index()) {
            Some(spec) if spec.key == Some(col) => Ok(col.index()),
            _ => Err(CoreError::column_not_found(col.to_string())),
        }
    }

    fn row_index(&self, obj: ObjKey) -> Option<usize> {
        self.rows().iter().position(|r| r.key == obj)
    }

    fn rows_mut(&mut self) -> &mut Vec<Row> {
        self.rows.get_or_insert_with(Vec::new)
    }

    fn table_label(&self) -> String {
        self.key.map_or_else(|| "legacy".to_string(), |k| k.to_string())
    }

    // === Mutation ===

    /// Adds a column and returns its key.
    pub fn add_column(&mut self, spec: ColumnSpec) -> ColKey {
        let tag = self
            .columns
            .iter()
            .filter_map(|c| c.key.map(ColKey::tag))
            .max()
            .unwrap_or(0)
            + 1;
        let key = ColKey::new(self.columns.len(), tag);
        let default = spec.default_value();
        self.columns.push(ColumnSpec {
            key: Some(key),
            ..spec
        });
        for row in self.rows_mut() {
            row.values.push(default.clone());
        }
        key
    }

    /// Creates an object with default values.
    pub fn create_object(&mut self) -> ObjKey {
        let key = ObjKey(self.next_obj_key);
        self.next_obj_key += 1;
        let values = self.columns.iter().map(ColumnSpec::default_value).collect();
        self.rows_mut().push(Row { key, values });
        key
    }

    /// Creates an object whose primary key column holds `pk`.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` if the table has no primary key,
    /// `TypeMismatch` for a wrongly typed value and `DuplicatePrimaryKey`
    /// if the value is taken.
    pub fn create_object_with_primary_key(&mut self, pk: Value) -> CoreResult<ObjKey> {
        let col = self
            .primary_key
            .ok_or_else(|| CoreError::column_not_found("primary key"))?;
        let index = self.column_index(col)?;
        if !pk.matches(&self.columns[index]) {
            return Err(CoreError::type_mismatch(format!(
                "primary key of {} cannot hold {pk:?}",
                self.table_label()
            )));
        }
        if self.rows().iter().any(|r| r.values[index] == pk) {
            return Err(CoreError::DuplicatePrimaryKey {
                table: self.table_label(),
            });
        }
        let key = self.create_object();
        if let Some(row) = self.rows_mut().last_mut() {
            row.values[index] = pk;
        }
        Ok(key)
    }

    /// Sets one value.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown object or column, or a value of the
    /// wrong type.
    pub fn set(&mut self, obj: ObjKey, col: ColKey, value: Value) -> CoreResult<()> {
        let index = self.column_index(col)?;
        if !value.matches(&self.columns[index]) {
            return Err(CoreError::type_mismatch(format!(
                "column {} cannot hold {value:?}",
                self.columns[index].name
            )));
        }
        let row = self.row_index(obj).ok_or_else(|| CoreError::ObjectNotFound {
            table: self.table_label(),
            key: obj.0,
        })?;
        self.rows_mut()[row].values[index] = value;
        Ok(())
    }

    /// Reads one value.
    ///
    /// # Errors
    ///
    /// Returns an error for an unknown object or column.
    pub fn get(&self, obj: ObjKey, col: ColKey) -> CoreResult<Value> {
        let index = self.column_index(col)?;
        let row = self.row_index(obj).ok_or_else(|| CoreError::ObjectNotFound {
            table: self.table_label(),
            key: obj.0,
        })?;
        Ok(self.rows()[row].values[index].clone())
    }

    /// Removes an object.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if the object does not exist.
    pub fn remove_object(&mut self, obj: ObjKey) -> CoreResult<()> {
        let row = self.row_index(obj).ok_or_else(|| CoreError::ObjectNotFound {
            table: self.table_label(),
            key: obj.0,
        })?;
        self.rows_mut().remove(row);
        Ok(())
    }

    /// Nulls every link to `obj` of table `target`. Returns true if any
    /// value changed.
    pub fn nullify_links_to(&mut self, target: TableKey, obj: ObjKey) -> bool {
        let link_columns: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.target == LinkTarget::Table(target))
            .map(|(i, _)| i)
            .collect();
        let mut changed = false;
        for row in self.rows_mut() {
            for &i in &link_columns {
                if row.values[i] == Value::Link(obj) {
                    row.values[i] = Value::Null;
                    changed = true;
                }
            }
        }
        changed
    }

    /// Removes every object.
    pub fn clear(&mut self) {
        self.rows_mut().clear();
    }

    /// Returns the first object whose column `col` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for an unknown column.
    pub fn find_first(&self, col: ColKey, value: &Value) -> CoreResult<Option<ObjKey>> {
        let index = self.column_index(col)?;
        Ok(self
            .rows()
            .iter()
            .find(|r| &r.values[index] == value)
            .map(|r| r.key))
    }

    /// Adds a search index on `col`. Returns false if it already existed.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for an unknown column.
    pub fn add_search_index(&mut self, col: ColKey) -> CoreResult<bool> {
        self.column_index(col)?;
        if self.search_indexes.contains(&col) {
            return Ok(false);
        }
        self.search_indexes.push(col);
        Ok(true)
    }

    /// Returns true if `col` has a search index.
    #[must_use]
    pub fn has_search_index(&self, col: ColKey) -> bool {
        self.search_indexes.contains(&col)
    }

    /// Marks `col` as the primary key column.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for an unknown column.
    pub fn set_primary_key(&mut self, col: ColKey) -> CoreResult<()> {
        self.column_index(col)?;
        self.primary_key = Some(col);
        Ok(())
    }

    // === Legacy migration ===

    /// Assigns the table key and column keys.
    pub fn migrate_column_info(&mut self, key: TableKey) {
        if self.key.is_some() {
            return;
        }
        self.key = Some(key);
        for (i, col) in self.columns.iter_mut().enumerate() {
            col.key = Some(ColKey::new(i, i as u64 + 1));
        }
    }

    /// Turns legacy index attributes into search indexes. The primary key
    /// column is left alone.
    pub fn migrate_indexes(&mut self, pk: Option<&str>) {
        let indexed: Vec<ColKey> = self
            .columns
            .iter()
            .filter(|c| c.attrs & ATTR_INDEXED != 0 && Some(c.name.as_str()) != pk)
            .filter_map(|c| c.key)
            .collect();
        for key in indexed {
            if !self.search_indexes.contains(&key) {
                self.search_indexes.push(key);
            }
        }
    }

    /// Replaces link targets given as table positions with table keys.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if a position has no key.
    pub fn migrate_subspec(
        &mut self,
        key_of: impl Fn(usize) -> Option<TableKey>,
    ) -> CoreResult<()> {
        for col in &mut self.columns {
            if let LinkTarget::Position(p) = col.target {
                let key = key_of(p)
                    .ok_or_else(|| CoreError::table_not_found(format!("position {p}")))?;
                col.target = LinkTarget::Table(key);
            }
        }
        Ok(())
    }

    /// Creates the (empty) object cluster.
    pub fn create_columns(&mut self) {
        if self.rows.is_none() {
            self.rows = Some(Vec::new());
        }
    }

    /// Copies legacy rows into the cluster, leaving links null. Object keys
    /// are the legacy row numbers. Returns true if the table has no link
    /// columns, so there is nothing left for [`TableData::migrate_links`].
    pub fn migrate_objects(&mut self) -> bool {
        let no_links = !self.columns.iter().any(|c| c.col_type == ColumnType::Link);
        let Some(legacy) = self.legacy_columns.take() else {
            return no_links;
        };
        let count = legacy.first().map_or(0, Vec::len);
        if self.rows().is_empty() {
            let columns = &self.columns;
            let rows = (0..count)
                .map(|r| Row {
                    key: ObjKey(r as i64),
                    values: columns
                        .iter()
                        .zip(&legacy)
                        .map(|(col, values)| match col.col_type {
                            ColumnType::Link => Value::Null,
                            _ => values[r].clone(),
                        })
                        .collect(),
                })
                .collect();
            self.rows = Some(rows);
        }
        self.next_obj_key = self.next_obj_key.max(count as i64);
        self.legacy_columns = Some(legacy);
        no_links
    }

    /// Copies legacy link values into the cluster.
    pub fn migrate_links(&mut self) {
        let Some(legacy) = self.legacy_columns.take() else {
            return;
        };
        let links: Vec<usize> = self
            .columns
            .iter()
            .enumerate()
            .filter(|(_, c)| c.col_type == ColumnType::Link)
            .map(|(i, _)| i)
            .collect();
        for row in self.rows_mut() {
            let r = row.key.0 as usize;
            for &c in &links {
                if let Some(value) = legacy[c].get(r) {
                    row.values[c] = value.clone();
                }
            }
        }
        self.legacy_columns = Some(legacy);
    }

    /// Makes every column key agree with its column position. Returns true
    /// if any key was fixed.
    pub fn verify_column_keys(&mut self) -> bool {
        let mut fixed = false;
        for i in 0..self.columns.len() {
            let Some(old) = self.columns[i].key else {
                continue;
            };
            if old.index() == i {
                continue;
            }
            let new = ColKey::new(i, old.tag());
            self.columns[i].key = Some(new);
            for key in self.search_indexes.iter_mut().filter(|k| **k == old) {
                *key = new;
            }
            if self.primary_key == Some(old) {
                self.primary_key = Some(new);
            }
            fixed = true;
        }
        fixed
    }

    /// Drops the legacy columns and records the primary key column.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` if `pk` names no column.
    pub fn finalize_migration(&mut self, pk: Option<&str>) -> CoreResult<()> {
        self.legacy_columns = None;
        self.create_columns();
        if let Some(name) = pk {
            let col = self
                .column_key_by_name(name)
                .ok_or_else(|| CoreError::column_not_found(name))?;
            self.primary_key = Some(col);
        }
        Ok(())
    }
}

fn key_from_slot(slot: RefOrTagged, slots: usize) -> Option<TableKey> {
    if slots > SLOT_TABLE_KEY && slot.is_tagged() {
        u32::try_from(slot.as_int()).ok().map(TableKey)
    } else {
        None
    }
}

/// Reads a UTF-8 string stored as a blob.
pub(crate) fn read_string(alloc: &SlabAlloc, raw: u64) -> CoreResult<String> {
    let Some(r) = RefOrTagged::from_raw(raw).as_ref() else {
        return Ok(String::new());
    };
    match alloc.read_node(r)? {
        Node::Blob(bytes) => String::from_utf8(bytes)
            .map_err(|_| CoreError::invalid_format("string is not valid UTF-8")),
        _ => Err(CoreError::invalid_format("expected a string blob")),
    }
}

fn read_spec(alloc: &SlabAlloc, spec_ref: Option<Ref>, keyed: bool) -> CoreResult<Vec<ColumnSpec>> {
    let Some(spec_ref) = spec_ref else {
        return Ok(Vec::new());
    };
    let spec = alloc.read_node(spec_ref)?;
    let part = |ndx: usize| -> CoreResult<Vec<u64>> {
        match spec.slot(ndx).as_ref() {
            Some(r) => Ok(alloc.read_node(r)?.values().to_vec()),
            None => Ok(Vec::new()),
        }
    };
    let names = part(0)?;
    let types = part(1)?;
    let attrs = part(2)?;
    let targets = part(3)?;
    let keys = if keyed { part(4)? } else { Vec::new() };
    if types.len() != names.len() || attrs.len() != names.len() || targets.len() != names.len() {
        return Err(CoreError::invalid_format("table spec arrays differ in length"));
    }

    let mut columns = Vec::with_capacity(names.len());
    for i in 0..names.len() {
        let col_type = ColumnType::from_code(types[i])?;
        let target = match (col_type, keyed) {
            (ColumnType::Link, false) => LinkTarget::Position(targets[i] as usize),
            (ColumnType::Link, true) => LinkTarget::Table(TableKey(targets[i] as u32)),
            _ => LinkTarget::None,
        };
        columns.push(ColumnSpec {
            name: read_string(alloc, names[i])?,
            col_type,
            attrs: attrs[i],
            target,
            key: keys.get(i).map(|&k| ColKey(k)),
        });
    }
    Ok(columns)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn writing_alloc() -> SlabAlloc {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0).unwrap();
        alloc
    }

    fn legacy_people() -> TableData {
        TableData::legacy(
            vec![
                ColumnSpec::new("name", ColumnType::String).with_attrs(ATTR_INDEXED),
                ColumnSpec::new("age", ColumnType::Int),
                ColumnSpec::new("friend", ColumnType::Link).with_target(LinkTarget::Position(0)),
            ],
            vec![
                vec![Value::String("ann".into()), Value::String("bob".into())],
                vec![Value::Int(31), Value::Int(42)],
                vec![Value::Link(ObjKey(1)), Value::Null],
            ],
        )
        .unwrap()
    }

    #[test]
    fn table_round_trip() {
        let alloc = writing_alloc();
        let mut table = TableData::new(TableKey(3), false);
        let name = table.add_column(ColumnSpec::new("name", ColumnType::String));
        let score = table.add_column(
            ColumnSpec::new("score", ColumnType::Int).with_attrs(ATTR_NULLABLE),
        );
        let obj = table.create_object();
        table.set(obj, name, Value::String("ann".into())).unwrap();
        table.add_search_index(name).unwrap();
        table.create_object();

        let r = table.write(&alloc).unwrap();
        let decoded = TableData::read(&alloc, r).unwrap();
        assert_eq!(decoded, table);
        assert_eq!(decoded.get(obj, score).unwrap(), Value::Null);
        assert_eq!(TableData::read_key(&alloc, r).unwrap(), Some(TableKey(3)));
    }

    #[test]
    fn ragged_legacy_columns_are_invalid() {
        let alloc = writing_alloc();
        let mut table = legacy_people();
        if let Some(columns) = table.legacy_columns.as_mut() {
            columns[1].pop();
        }
        let r = table.write(&alloc).unwrap();
        assert!(matches!(
            TableData::read(&alloc, r),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn legacy_round_trip() {
        let alloc = writing_alloc();
        let table = legacy_people();
        let r = table.write(&alloc).unwrap();
        assert_eq!(alloc.read_node(r).unwrap().values().len(), 2);
        let decoded = TableData::read(&alloc, r).unwrap();
        assert_eq!(decoded, table);
        assert!(decoded.is_legacy());
        assert_eq!(decoded.size(), 2);
    }

    #[test]
    fn set_rejects_wrong_type() {
        let mut table = TableData::new(TableKey(0), false);
        let age = table.add_column(ColumnSpec::new("age", ColumnType::Int));
        let obj = table.create_object();
        let err = table.set(obj, age, Value::Bool(true)).unwrap_err();
        assert!(matches!(err, CoreError::TypeMismatch { .. }));
        assert!(table.set(obj, age, Value::Null).is_err());
    }

    #[test]
    fn duplicate_primary_key_is_rejected() {
        let mut table = TableData::new(TableKey(0), false);
        let id = table.add_column(ColumnSpec::new("id", ColumnType::Int));
        table.set_primary_key(id).unwrap();
        table.create_object_with_primary_key(Value::Int(7)).unwrap();
        let err = table
            .create_object_with_primary_key(Value::Int(7))
            .unwrap_err();
        assert!(matches!(err, CoreError::DuplicatePrimaryKey { .. }));
    }

    #[test]
    fn migration_steps_produce_current_layout() {
        let mut table = legacy_people();
        table.migrate_column_info(TableKey(0));
        table.migrate_indexes(None);
        table.migrate_subspec(|p| Some(TableKey(p as u32))).unwrap();
        table.create_columns();

        assert!(!table.migrate_objects());
        let friend = table.columns()[2].key.unwrap();
        assert_eq!(table.get(ObjKey(0), friend).unwrap(), Value::Null);

        table.migrate_links();
        assert_eq!(table.get(ObjKey(0), friend).unwrap(), Value::Link(ObjKey(1)));

        assert!(!table.verify_column_keys());
        table.finalize_migration(Some("name")).unwrap();

        let name = table.column_key_by_name("name").unwrap();
        assert_eq!(table.primary_key(), Some(name));
        assert!(table.has_search_index(name));
        assert_eq!(table.columns()[2].target, LinkTarget::Table(TableKey(0)));
        assert!(table.legacy_values(0).is_none());
        assert_eq!(table.next_obj_key, 2);
    }

    #[test]
    fn migrate_objects_is_idempotent() {
        let mut table = legacy_people();
        table.migrate_column_info(TableKey(0));
        table.create_columns();
        table.migrate_objects();
        let once = table.clone();
        table.migrate_objects();
        assert_eq!(table, once);
    }

    #[test]
    fn verify_column_keys_fixes_positions() {
        let mut table = TableData::new(TableKey(0), false);
        let a = table.add_column(ColumnSpec::new("a", ColumnType::Int));
        table.add_search_index(a).unwrap();
        table.columns[0].key = Some(ColKey::new(5, a.tag()));
        table.search_indexes[0] = ColKey::new(5, a.tag());

        assert!(table.verify_column_keys());
        assert_eq!(table.columns[0].key, Some(a));
        assert!(table.has_search_index(a));
    }

    #[test]
    fn removing_object_can_nullify_links() {
        let mut table = TableData::new(TableKey(1), false);
        let link = table.add_column(
            ColumnSpec::new("owner", ColumnType::Link).with_target(LinkTarget::Table(TableKey(0))),
        );
        let obj = table.create_object();
        table.set(obj, link, Value::Link(ObjKey(4))).unwrap();

        assert!(table.nullify_links_to(TableKey(0), ObjKey(4)));
        assert_eq!(table.get(obj, link).unwrap(), Value::Null);
        assert!(!table.nullify_links_to(TableKey(0), ObjKey(4)));
    }
}
