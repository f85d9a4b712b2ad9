//! Images of files written in the pre-cluster file formats.
//!
//! Formats before 10 store every table column by column, without table or
//! column keys, and point link columns at table positions. Format 6 also
//! lacks the history schema version slot. [`LegacyFileBuilder`] writes such
//! an image so the upgrade path can be exercised without shipping binary
//! fixtures.

use slabdb_core::table::{ATTR_INDEXED, ATTR_NULLABLE};
use slabdb_core::upgrade::LEGACY_PK_TABLE;
use slabdb_core::{ColumnSpec, ColumnType, CoreResult, LinkTarget, ObjKey, TableData, Value};
use slabdb_storage::{FileHeader, InMemoryBackend, Node, RefOrTagged, SlabAlloc};
use tracing::debug;

/// One table in column-major form.
#[derive(Debug, Clone, Default)]
pub struct LegacyTable {
    /// Table name.
    pub name: String,
    /// Column descriptions.
    pub columns: Vec<ColumnSpec>,
    /// `values[c][r]` is the value of column `c` in row `r`.
    pub values: Vec<Vec<Value>>,
}

impl LegacyTable {
    /// Creates a table without columns.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Appends a column with its values.
    #[must_use]
    pub fn column(mut self, spec: ColumnSpec, values: Vec<Value>) -> Self {
        self.columns.push(spec);
        self.values.push(values);
        self
    }
}

/// Builds the image of a legacy database file.
#[derive(Debug, Clone)]
pub struct LegacyFileBuilder {
    file_format: u32,
    version: u64,
    tables: Vec<LegacyTable>,
    primary_keys: Vec<(String, String)>,
}

impl LegacyFileBuilder {
    /// Starts an empty file in `file_format`, which must be below 10.
    pub fn new(file_format: u32) -> Self {
        assert!(file_format < 10, "format {file_format} is not a legacy format");
        Self {
            file_format,
            version: 1,
            tables: Vec::new(),
            primary_keys: Vec::new(),
        }
    }

    /// Sets the version recorded in the top array.
    #[must_use]
    pub fn version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    /// Appends a table.
    #[must_use]
    pub fn table(mut self, table: LegacyTable) -> Self {
        self.tables.push(table);
        self
    }

    /// Records `column` as the primary key of `table` in the legacy
    /// primary key table, which is written after all other tables.
    #[must_use]
    pub fn primary_key(mut self, table: &str, column: &str) -> Self {
        self.primary_keys.push((table.to_string(), column.to_string()));
        self
    }

    fn all_tables(&self) -> Vec<LegacyTable> {
        let mut tables = self.tables.clone();
        if !self.primary_keys.is_empty() {
            let (names, columns): (Vec<Value>, Vec<Value>) = self
                .primary_keys
                .iter()
                .map(|(t, c)| (Value::String(t.clone()), Value::String(c.clone())))
                .unzip();
            tables.push(
                LegacyTable::new(LEGACY_PK_TABLE)
                    .column(ColumnSpec::new("pk_table", ColumnType::String), names)
                    .column(ColumnSpec::new("pk_property", ColumnType::String), columns),
            );
        }
        tables
    }

    /// Writes the image and returns the file bytes.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if a table's columns differ in length.
    pub fn build(&self) -> CoreResult<Vec<u8>> {
        Ok(self.build_backend()?.data())
    }

    /// Writes the image into a fresh in-memory backend.
    ///
    /// # Errors
    ///
    /// Returns `InvalidFormat` if a table's columns differ in length.
    pub fn build_backend(&self) -> CoreResult<InMemoryBackend> {
        let alloc = SlabAlloc::new_empty();
        alloc.begin_write(0)?;

        let tables = self.all_tables();
        let mut names = Vec::with_capacity(tables.len());
        let mut refs = Vec::with_capacity(tables.len());
        for table in tables {
            names.push(RefOrTagged::make_ref(
                alloc.alloc_node(&Node::Blob(table.name.into_bytes()))?,
            ));
            let data = TableData::legacy(table.columns, table.values)?;
            refs.push(RefOrTagged::make_ref(data.write(&alloc)?));
        }
        let names_ref = alloc.alloc_node(&Node::inner(names))?;
        let tables_ref = alloc.alloc_node(&Node::inner(refs))?;

        let slot_count = if self.file_format >= 7 { 10 } else { 9 };
        let top_size = Node::Inner(vec![0; slot_count]).byte_size();
        let top_ref = alloc.alloc(top_size)?;
        let mut top = vec![
            RefOrTagged::make_ref(names_ref),
            RefOrTagged::make_ref(tables_ref),
            RefOrTagged::make_tagged(alloc.logical_size()),
            RefOrTagged::make_tagged(u64::from(self.file_format)),
            RefOrTagged::make_tagged(self.version),
        ];
        top.resize(slot_count, RefOrTagged::make_tagged(0));
        alloc.write_node(top_ref, &Node::inner(top))?;

        let batch = alloc.prepare_commit(self.version)?;
        let mut backend = InMemoryBackend::new();
        let mut header = FileHeader::new();
        alloc.persist(&mut backend, &mut header, &batch, top_ref)?;
        debug!(
            file_format = self.file_format,
            size = batch.logical_size,
            "built legacy image"
        );
        Ok(backend)
    }
}

/// A small legacy file with links, a primary key, an indexed column and
/// a table without links:
///
/// | position | table    | columns                                           |
/// |----------|----------|---------------------------------------------------|
/// | 0        | `dogs`   | `name` (indexed, primary key), `age`              |
/// | 1        | `people` | `name` (indexed), `age`, `pet` -> `dogs`, `nick`? |
/// | 2        | `tags`   | `label`                                           |
/// | 3        | `pk`     | legacy primary key table                          |
pub fn sample_legacy_file(file_format: u32) -> LegacyFileBuilder {
    let s = |v: &str| Value::String(v.to_string());
    let dogs = LegacyTable::new("dogs")
        .column(
            ColumnSpec::new("name", ColumnType::String).with_attrs(ATTR_INDEXED),
            vec![s("rex"), s("fido"), s("bella")],
        )
        .column(
            ColumnSpec::new("age", ColumnType::Int),
            vec![Value::Int(3), Value::Int(5), Value::Int(2)],
        );
    let people = LegacyTable::new("people")
        .column(
            ColumnSpec::new("name", ColumnType::String).with_attrs(ATTR_INDEXED),
            vec![s("ann"), s("bob"), s("cy")],
        )
        .column(
            ColumnSpec::new("age", ColumnType::Int),
            vec![Value::Int(31), Value::Int(42), Value::Int(27)],
        )
        .column(
            ColumnSpec::new("pet", ColumnType::Link).with_target(LinkTarget::Position(0)),
            vec![Value::Link(ObjKey(1)), Value::Null, Value::Link(ObjKey(0))],
        )
        .column(
            ColumnSpec::new("nick", ColumnType::String).with_attrs(ATTR_NULLABLE),
            vec![Value::Null, s("bobby"), Value::Null],
        );
    let tags = LegacyTable::new("tags").column(
        ColumnSpec::new("label", ColumnType::String),
        vec![s("red"), s("blue")],
    );

    LegacyFileBuilder::new(file_format)
        .version(4)
        .table(dogs)
        .table(people)
        .table(tags)
        .primary_key("dogs", "name")
}

#[cfg(test)]
mod tests {
    use super::*;
    use slabdb_storage::{StorageBackend, FILE_HEADER_SIZE};

    #[test]
    fn image_has_a_published_top() {
        let backend = sample_legacy_file(6).build_backend().unwrap();
        let header = FileHeader::read_from(&backend).unwrap();
        assert_ne!(header.top_ref(), 0);
        assert!(backend.size().unwrap() > FILE_HEADER_SIZE);
    }

    #[test]
    fn format_six_has_nine_top_slots() {
        for (format, slots) in [(6, 9), (7, 10), (9, 10)] {
            let image = LegacyFileBuilder::new(format).build().unwrap();
            let backend = InMemoryBackend::with_data(image);
            let header = FileHeader::read_from(&backend).unwrap();
            let top_bytes = backend
                .read_at(header.top_ref(), (backend.size().unwrap() - header.top_ref()) as usize)
                .unwrap();
            let top = Node::decode(&top_bytes).unwrap();
            assert_eq!(top.values().len(), slots);
            assert_eq!(top.slot(3).as_int(), u64::from(format));
            assert_eq!(top.slot(2).as_int(), backend.size().unwrap());
        }
    }

    #[test]
    fn ragged_columns_are_rejected() {
        let builder = LegacyFileBuilder::new(6).table(
            LegacyTable::new("t")
                .column(ColumnSpec::new("a", ColumnType::Int), vec![Value::Int(1)])
                .column(ColumnSpec::new("b", ColumnType::Int), vec![]),
        );
        assert!(builder.build().is_err());
    }

    #[test]
    #[should_panic(expected = "not a legacy format")]
    fn cluster_formats_are_refused() {
        let _ = LegacyFileBuilder::new(10);
    }
}
