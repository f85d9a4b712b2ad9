//! Table and object access.
//!
//! Reads work in every stage with a pinned snapshot; changes require
//! `Writing` and are reported to the replication as [`Instruction`]s.

use super::state::Transaction;
use crate::error::{CoreError, CoreResult};
use crate::history::Instruction;
use crate::table::{ColumnSpec, ColumnType, LinkTarget, TableData, Value, ATTR_NULLABLE};
use crate::types::{ColKey, ObjKey, TableKey};

impl Transaction {
    fn with_table<R>(
        &self,
        operation: &'static str,
        table: TableKey,
        f: impl FnOnce(&TableData) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let db = self.require_snapshot(operation)?;
        let pos = self.group.position_by_key(table)?;
        let data = self.group.table(&db.alloc, pos)?;
        f(&data)
    }

    fn with_table_mut<R>(
        &mut self,
        operation: &'static str,
        table: TableKey,
        f: impl FnOnce(&mut TableData) -> CoreResult<R>,
    ) -> CoreResult<R> {
        let db = self.require_writing(operation)?;
        let pos = self.group.position_by_key(table)?;
        f(self.group.table_mut(&db.alloc, pos)?)
    }

    // === Tables ===

    /// Adds an empty table.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Writing` and `TableNameInUse`
    /// if the name is taken.
    pub fn add_table(&mut self, name: &str) -> CoreResult<TableKey> {
        self.insert_table(name, false)
    }

    /// Adds an asymmetric table. Objects of asymmetric tables do not
    /// survive reopening the database.
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::add_table`].
    pub fn add_asymmetric_table(&mut self, name: &str) -> CoreResult<TableKey> {
        self.insert_table(name, true)
    }

    /// Adds a table whose objects are identified by a unique, indexed
    /// primary key column.
    ///
    /// # Errors
    ///
    /// Same as [`Transaction::add_table`].
    pub fn add_table_with_primary_key(
        &mut self,
        name: &str,
        pk_name: &str,
        pk_type: ColumnType,
    ) -> CoreResult<(TableKey, ColKey)> {
        let table = self.insert_table(name, false)?;
        let col = self.add_column(table, pk_name, pk_type, false)?;
        self.with_table_mut("add table", table, |t| {
            t.set_primary_key(col)?;
            t.add_search_index(col).map(|_| ())
        })?;
        self.record(Instruction::AddSearchIndex { table, col });
        Ok((table, col))
    }

    fn insert_table(&mut self, name: &str, asymmetric: bool) -> CoreResult<TableKey> {
        self.require_writing("add table")?;
        if self.group.position_by_name(name).is_some() {
            return Err(CoreError::TableNameInUse {
                name: name.to_string(),
            });
        }
        let key = self.group.next_table_key();
        self.group.add_table(name, TableData::new(key, asymmetric));
        self.record(Instruction::AddTable {
            table: key,
            name: name.to_string(),
            asymmetric,
        });
        Ok(key)
    }

    /// Removes a table and all its objects.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Writing` and `TableNotFound`
    /// for an unknown key.
    pub fn remove_table(&mut self, table: TableKey) -> CoreResult<()> {
        let db = self.require_writing("remove table")?;
        let pos = self.group.position_by_key(table)?;
        self.group.remove_table(&db.alloc, pos)?;
        self.record(Instruction::RemoveTable { table });
        Ok(())
    }

    /// Key of the table called `name`.
    #[must_use]
    pub fn find_table(&self, name: &str) -> Option<TableKey> {
        self.group
            .position_by_name(name)
            .and_then(|pos| self.group.key_at(pos))
    }

    /// Keys of all tables in position order.
    #[must_use]
    pub fn get_table_keys(&self) -> Vec<TableKey> {
        self.group.keys().collect()
    }

    /// Name of a table.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` for an unknown key.
    pub fn table_name(&self, table: TableKey) -> CoreResult<String> {
        let pos = self.group.position_by_key(table)?;
        Ok(self.group.names()[pos].clone())
    }

    /// Returns true for an asymmetric table.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` for an unknown key.
    pub fn is_asymmetric(&self, table: TableKey) -> CoreResult<bool> {
        self.with_table("read table", table, |t| Ok(t.is_asymmetric()))
    }

    /// A copy of the whole table.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` for an unknown key.
    pub fn table_data(&self, table: TableKey) -> CoreResult<TableData> {
        self.with_table("read table", table, |t| Ok(t.clone()))
    }

    // === Columns ===

    /// Adds a column of a non-link type.
    ///
    /// # Errors
    ///
    /// Returns `TypeMismatch` for [`ColumnType::Link`]; use
    /// [`Transaction::add_link_column`] instead.
    pub fn add_column(
        &mut self,
        table: TableKey,
        name: &str,
        col_type: ColumnType,
        nullable: bool,
    ) -> CoreResult<ColKey> {
        if col_type == ColumnType::Link {
            return Err(CoreError::type_mismatch(format!(
                "link column {name} needs a target table"
            )));
        }
        let attrs = if nullable { ATTR_NULLABLE } else { 0 };
        let spec = ColumnSpec::new(name, col_type).with_attrs(attrs);
        self.insert_column(table, spec)
    }

    /// Adds a nullable link column pointing at objects of `target`.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` if either table is unknown.
    pub fn add_link_column(
        &mut self,
        table: TableKey,
        name: &str,
        target: TableKey,
    ) -> CoreResult<ColKey> {
        self.group.position_by_key(target)?;
        let spec = ColumnSpec::new(name, ColumnType::Link)
            .with_attrs(ATTR_NULLABLE)
            .with_target(LinkTarget::Table(target));
        self.insert_column(table, spec)
    }

    fn insert_column(&mut self, table: TableKey, spec: ColumnSpec) -> CoreResult<ColKey> {
        let name = spec.name.clone();
        let col_type = spec.col_type;
        let col = self.with_table_mut("add column", table, |t| {
            if t.column_index_by_name(&spec.name).is_some() {
                return Err(CoreError::type_mismatch(format!(
                    "column {} already exists",
                    spec.name
                )));
            }
            Ok(t.add_column(spec))
        })?;
        self.record(Instruction::AddColumn {
            table,
            col,
            name,
            col_type,
        });
        Ok(col)
    }

    /// Keys of the columns of a table in position order.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` for an unknown key.
    pub fn column_keys(&self, table: TableKey) -> CoreResult<Vec<ColKey>> {
        self.with_table("read columns", table, |t| {
            Ok(t.columns().iter().filter_map(|c| c.key).collect())
        })
    }

    /// Name of a column.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for an unknown column.
    pub fn column_name(&self, table: TableKey, col: ColKey) -> CoreResult<String> {
        self.with_table("read columns", table, |t| {
            Ok(t.columns()[t.column_index(col)?].name.clone())
        })
    }

    /// Type of a column.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for an unknown column.
    pub fn column_type(&self, table: TableKey, col: ColKey) -> CoreResult<ColumnType> {
        self.with_table("read columns", table, |t| {
            Ok(t.columns()[t.column_index(col)?].col_type)
        })
    }

    /// Primary key column of a table, if it has one.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` for an unknown key.
    pub fn get_primary_key_column(&self, table: TableKey) -> CoreResult<Option<ColKey>> {
        self.with_table("read columns", table, |t| Ok(t.primary_key()))
    }

    /// Adds a search index. Adding an existing index does nothing.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for an unknown column.
    pub fn add_search_index(&mut self, table: TableKey, col: ColKey) -> CoreResult<()> {
        if self.with_table_mut("add search index", table, |t| t.add_search_index(col))? {
            self.record(Instruction::AddSearchIndex { table, col });
        }
        Ok(())
    }

    /// Returns true if `col` has a search index.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` for an unknown key.
    pub fn has_search_index(&self, table: TableKey, col: ColKey) -> CoreResult<bool> {
        self.with_table("read columns", table, |t| Ok(t.has_search_index(col)))
    }

    // === Objects ===

    /// Creates an object with default values.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Writing`.
    pub fn create_object(&mut self, table: TableKey) -> CoreResult<ObjKey> {
        let obj = self.with_table_mut("create object", table, |t| Ok(t.create_object()))?;
        self.record(Instruction::CreateObject { table, obj });
        Ok(obj)
    }

    /// Creates an object identified by `pk`.
    ///
    /// # Errors
    ///
    /// Returns `DuplicatePrimaryKey` if an object with `pk` exists.
    pub fn create_object_with_primary_key(
        &mut self,
        table: TableKey,
        pk: Value,
    ) -> CoreResult<ObjKey> {
        let (obj, col) = self.with_table_mut("create object", table, |t| {
            let obj = t.create_object_with_primary_key(pk.clone())?;
            Ok((obj, t.primary_key()))
        })?;
        self.record(Instruction::CreateObject { table, obj });
        if let Some(col) = col {
            self.record(Instruction::Set {
                table,
                obj,
                col,
                value: pk,
            });
        }
        Ok(obj)
    }

    /// Sets one value. A link must point at an existing object.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` for an unknown object or link target and
    /// `TypeMismatch` for a value of the wrong type.
    pub fn set(&mut self, table: TableKey, obj: ObjKey, col: ColKey, value: Value) -> CoreResult<()> {
        if let Value::Link(target_obj) = value {
            let target = self.with_table("set", table, |t| {
                Ok(t.columns()[t.column_index(col)?].target)
            })?;
            if let LinkTarget::Table(target) = target {
                let exists = self.with_table("set", target, |t| {
                    Ok(t.rows().iter().any(|r| r.key == target_obj))
                })?;
                if !exists {
                    return Err(CoreError::ObjectNotFound {
                        table: target.to_string(),
                        key: target_obj.0,
                    });
                }
            }
        }
        self.with_table_mut("set", table, |t| t.set(obj, col, value.clone()))?;
        self.record(Instruction::Set {
            table,
            obj,
            col,
            value,
        });
        Ok(())
    }

    /// Reads one value.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` or `ColumnNotFound` for unknown keys.
    pub fn get(&self, table: TableKey, obj: ObjKey, col: ColKey) -> CoreResult<Value> {
        self.with_table("get", table, |t| t.get(obj, col))
    }

    /// Removes an object and nulls every link pointing at it.
    ///
    /// # Errors
    ///
    /// Returns `ObjectNotFound` if the object does not exist.
    pub fn remove_object(&mut self, table: TableKey, obj: ObjKey) -> CoreResult<()> {
        self.with_table_mut("remove object", table, |t| t.remove_object(obj))?;
        self.nullify_links(table, &[obj])?;
        self.record(Instruction::RemoveObject { table, obj });
        Ok(())
    }

    /// Removes every object of a table and nulls links pointing at them.
    ///
    /// # Errors
    ///
    /// Returns `WrongTransactState` unless `Writing`.
    pub fn clear_table(&mut self, table: TableKey) -> CoreResult<()> {
        let removed = self.with_table_mut("clear table", table, |t| {
            let keys: Vec<ObjKey> = t.rows().iter().map(|r| r.key).collect();
            t.clear();
            Ok(keys)
        })?;
        self.nullify_links(table, &removed)?;
        self.record(Instruction::ClearTable { table });
        Ok(())
    }

    fn nullify_links(&mut self, target: TableKey, objs: &[ObjKey]) -> CoreResult<()> {
        if objs.is_empty() {
            return Ok(());
        }
        let db = self.require_writing("remove object")?;
        for pos in 0..self.group.table_count() {
            let links_here = self
                .group
                .table(&db.alloc, pos)?
                .columns()
                .iter()
                .any(|c| c.target == LinkTarget::Table(target));
            if !links_here {
                continue;
            }
            let data = self.group.table_mut(&db.alloc, pos)?;
            for &obj in objs {
                data.nullify_links_to(target, obj);
            }
        }
        Ok(())
    }

    /// Number of objects in a table.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` for an unknown key.
    pub fn table_size(&self, table: TableKey) -> CoreResult<usize> {
        self.with_table("table size", table, |t| Ok(t.size()))
    }

    /// Keys of all objects in a table, in creation order.
    ///
    /// # Errors
    ///
    /// Returns `TableNotFound` for an unknown key.
    pub fn object_keys(&self, table: TableKey) -> CoreResult<Vec<ObjKey>> {
        self.with_table("object keys", table, |t| {
            Ok(t.rows().iter().map(|r| r.key).collect())
        })
    }

    /// First object whose `col` equals `value`.
    ///
    /// # Errors
    ///
    /// Returns `ColumnNotFound` for an unknown column.
    pub fn find_first(
        &self,
        table: TableKey,
        col: ColKey,
        value: &Value,
    ) -> CoreResult<Option<ObjKey>> {
        self.with_table("find first", table, |t| t.find_first(col, value))
    }
}
