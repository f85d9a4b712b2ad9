//! File format upgrades.
//!
//! [`upgrade_file_format`] brings a file from any format in 6..22 to 22
//! inside one write transaction. The long part, moving every legacy table
//! from its columnar layout into an object cluster, commits after each
//! step so an interrupted upgrade continues where it stopped. Progress is
//! kept in the `!UPDATE_PROGRESS` table, one object per table:
//!
//! | column             | type   |
//! |--------------------|--------|
//! | `table_name`       | String |
//! | `objects_migrated` | Bool   |
//! | `links_migrated`   | Bool   |
//!
//! The caller commits after the final stamp.

use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::group::{SLOT_EVACUATION_POINT, SLOT_HISTORY_SCHEMA_VERSION, TOP_SLOTS};
use crate::table::{ColumnSpec, ColumnType, TableData, Value};
use crate::transaction::Transaction;
use crate::types::{ColKey, ObjKey, TableKey};
use slabdb_storage::RefOrTagged;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// File format written by this version of the library.
pub const TARGET_FILE_FORMAT: u32 = 22;

/// Name of the table tracking an interrupted cluster migration.
pub const PROGRESS_TABLE: &str = "!UPDATE_PROGRESS";

/// Name of the legacy table mapping tables to their primary key column.
pub const LEGACY_PK_TABLE: &str = "pk";

const COL_TABLE_NAME: &str = "table_name";
const COL_OBJECTS_MIGRATED: &str = "objects_migrated";
const COL_LINKS_MIGRATED: &str = "links_migrated";

const COL_PK_TABLE: &str = "pk_table";
const COL_PK_PROPERTY: &str = "pk_property";

/// Upgrades the snapshot of the write transaction `tr` to `target`.
///
/// # Panics
///
/// Panics if `target` is not [`TARGET_FILE_FORMAT`] or the file is not
/// older than `target`.
///
/// # Errors
///
/// Returns `WrongTransactState` unless `tr` is writing, and any error of
/// the intermediate commits.
pub fn upgrade_file_format(tr: &mut Transaction, target: u32) -> CoreResult<()> {
    assert_eq!(
        target, TARGET_FILE_FORMAT,
        "no upgrade path to file format {target}"
    );
    let current = tr.file_format_version();
    assert!(
        current < target,
        "file format {current} is not older than {target}"
    );
    let db = tr.require_writing("upgrade file format")?;

    if current < 7 {
        if tr.group.top_size() <= SLOT_HISTORY_SCHEMA_VERSION {
            tr.group
                .set_slot(SLOT_HISTORY_SCHEMA_VERSION, RefOrTagged::make_tagged(0));
        }
        tr.set_file_format_version(7);
        commit_step(tr, &db, "history schema slot")?;
    }

    if current < 10 {
        tr.without_replication(|tr| migrate_clusters(tr, &db))?;
    }

    ensure_primary_key_search_indexes(tr, &db)?;

    if tr.group.top_size() < TOP_SLOTS {
        tr.group
            .set_slot(SLOT_EVACUATION_POINT, RefOrTagged::make_tagged(0));
    }
    tr.set_file_format_version(target);
    debug!(from = current, to = target, "file format stamped");
    Ok(())
}

fn commit_step(tr: &mut Transaction, db: &Db, step: &str) -> CoreResult<()> {
    let version = tr.commit_and_continue_writing()?;
    db.stats.record_upgrade_commit();
    debug!(version, step, "upgrade step committed");
    Ok(())
}

/// Legacy primary keys: table name to primary key column name.
fn read_legacy_primary_keys(tr: &Transaction, db: &Db) -> CoreResult<BTreeMap<String, String>> {
    let Some(pos) = tr.group.position_by_name(LEGACY_PK_TABLE) else {
        return Ok(BTreeMap::new());
    };
    let table = tr.group.table(&db.alloc, pos)?;
    let column = |name: &str| {
        table
            .column_index_by_name(name)
            .and_then(|i| table.legacy_values(i))
            .ok_or_else(|| CoreError::column_not_found(format!("{LEGACY_PK_TABLE}.{name}")))
    };
    let tables = column(COL_PK_TABLE)?;
    let properties = column(COL_PK_PROPERTY)?;
    Ok(tables
        .iter()
        .zip(properties)
        .filter_map(|(t, p)| match (t, p) {
            (Value::String(t), Value::String(p)) => Some((t.clone(), p.clone())),
            _ => None,
        })
        .collect())
}

struct Progress {
    obj: ObjKey,
    table_name: String,
    objects_migrated: bool,
    links_migrated: bool,
}

struct ProgressColumns {
    table: TableKey,
    table_name: ColKey,
    objects_migrated: ColKey,
    links_migrated: ColKey,
}

fn progress_columns(tr: &Transaction, db: &Db) -> CoreResult<ProgressColumns> {
    let pos = tr
        .group
        .position_by_name(PROGRESS_TABLE)
        .ok_or_else(|| CoreError::table_not_found(PROGRESS_TABLE))?;
    let table = tr.group.table(&db.alloc, pos)?;
    let col = |name: &str| {
        table
            .column_key_by_name(name)
            .ok_or_else(|| CoreError::column_not_found(format!("{PROGRESS_TABLE}.{name}")))
    };
    Ok(ProgressColumns {
        table: table
            .key()
            .ok_or_else(|| CoreError::invalid_format("progress table has no key"))?,
        table_name: col(COL_TABLE_NAME)?,
        objects_migrated: col(COL_OBJECTS_MIGRATED)?,
        links_migrated: col(COL_LINKS_MIGRATED)?,
    })
}

fn read_progress(tr: &Transaction, cols: &ProgressColumns) -> CoreResult<Vec<Progress>> {
    let flag = |obj, col| -> CoreResult<bool> {
        Ok(matches!(tr.get(cols.table, obj, col)?, Value::Bool(true)))
    };
    tr.object_keys(cols.table)?
        .into_iter()
        .map(|obj| {
            let Value::String(table_name) = tr.get(cols.table, obj, cols.table_name)? else {
                return Err(CoreError::invalid_format("progress entry without table name"));
            };
            Ok(Progress {
                obj,
                table_name,
                objects_migrated: flag(obj, cols.objects_migrated)?,
                links_migrated: flag(obj, cols.links_migrated)?,
            })
        })
        .collect()
}

fn position_of(tr: &Transaction, name: &str) -> CoreResult<usize> {
    tr.group
        .position_by_name(name)
        .ok_or_else(|| CoreError::table_not_found(name))
}

/// Positions of the tables that move into clusters.
fn user_table_positions(tr: &Transaction) -> Vec<usize> {
    tr.group
        .names()
        .iter()
        .enumerate()
        .filter(|(_, name)| name.as_str() != LEGACY_PK_TABLE && name.as_str() != PROGRESS_TABLE)
        .map(|(pos, _)| pos)
        .collect()
}

fn migrate_clusters(tr: &mut Transaction, db: &Db) -> CoreResult<()> {
    let primary_keys = read_legacy_primary_keys(tr, db)?;

    if tr.group.position_by_name(PROGRESS_TABLE).is_none() {
        info!(tables = tr.group.table_count(), "migrating tables to clusters");
        start_cluster_migration(tr, db, &primary_keys)?;
        commit_step(tr, db, "cluster setup")?;
    } else {
        info!("resuming interrupted cluster migration");
    }

    if repair_column_keys(tr, db)? {
        commit_step(tr, db, "column keys")?;
    }

    let cols = progress_columns(tr, db)?;

    for entry in read_progress(tr, &cols)? {
        if entry.objects_migrated {
            continue;
        }
        let pos = position_of(tr, &entry.table_name)?;
        let no_links = tr.group.table_mut(&db.alloc, pos)?.migrate_objects();
        tr.set(cols.table, entry.obj, cols.objects_migrated, Value::Bool(true))?;
        if no_links {
            tr.set(cols.table, entry.obj, cols.links_migrated, Value::Bool(true))?;
        }
        debug!(table = %entry.table_name, "objects migrated");
        commit_step(tr, db, "objects")?;
    }

    for entry in read_progress(tr, &cols)? {
        if entry.links_migrated {
            continue;
        }
        let pos = position_of(tr, &entry.table_name)?;
        tr.group.table_mut(&db.alloc, pos)?.migrate_links();
        tr.set(cols.table, entry.obj, cols.links_migrated, Value::Bool(true))?;
        debug!(table = %entry.table_name, "links migrated");
        commit_step(tr, db, "links")?;
    }

    for pos in user_table_positions(tr) {
        let name = tr.group.names()[pos].clone();
        tr.group
            .table_mut(&db.alloc, pos)?
            .finalize_migration(primary_keys.get(&name).map(String::as_str))?;
    }

    for name in [LEGACY_PK_TABLE, PROGRESS_TABLE] {
        if let Some(pos) = tr.group.position_by_name(name) {
            tr.group.remove_table(&db.alloc, pos)?;
        }
    }
    info!("cluster migration finished");
    Ok(())
}

/// Moves column keys that disagree with their column position back in
/// line. Tables that are already consistent are left untouched. Returns
/// true if anything changed.
fn repair_column_keys(tr: &mut Transaction, db: &Db) -> CoreResult<bool> {
    let mut repaired = false;
    for pos in user_table_positions(tr) {
        let mut table = tr.group.table(&db.alloc, pos)?.into_owned();
        if table.verify_column_keys() {
            debug!(table = %tr.group.names()[pos], "column keys repaired");
            *tr.group.table_mut(&db.alloc, pos)? = table;
            repaired = true;
        }
    }
    Ok(repaired)
}

/// Gives every legacy table its key and column keys, resolves link
/// targets and creates the empty clusters, then records one progress entry
/// per table.
fn start_cluster_migration(
    tr: &mut Transaction,
    db: &Db,
    primary_keys: &BTreeMap<String, String>,
) -> CoreResult<()> {
    let positions = user_table_positions(tr);
    for &pos in &positions {
        let name = tr.group.names()[pos].clone();
        let table = tr.group.table_mut(&db.alloc, pos)?;
        table.migrate_column_info(TableKey(pos as u32));
        table.migrate_indexes(primary_keys.get(&name).map(String::as_str));
    }

    let keys: Vec<Option<TableKey>> = (0..tr.group.table_count())
        .map(|pos| tr.group.key_at(pos))
        .collect();
    for &pos in &positions {
        let table = tr.group.table_mut(&db.alloc, pos)?;
        table.migrate_subspec(|p| keys.get(p).copied().flatten())?;
        table.create_columns();
    }

    let mut progress = TableData::new(tr.group.next_table_key(), false);
    let name_col = progress.add_column(ColumnSpec::new(COL_TABLE_NAME, ColumnType::String));
    progress.add_column(ColumnSpec::new(COL_OBJECTS_MIGRATED, ColumnType::Bool));
    progress.add_column(ColumnSpec::new(COL_LINKS_MIGRATED, ColumnType::Bool));
    for &pos in &positions {
        let obj = progress.create_object();
        progress.set(obj, name_col, Value::String(tr.group.names()[pos].clone()))?;
    }
    tr.group.add_table(PROGRESS_TABLE, progress);
    Ok(())
}

fn ensure_primary_key_search_indexes(tr: &mut Transaction, db: &Db) -> CoreResult<()> {
    for pos in 0..tr.group.table_count() {
        let missing = {
            let table = tr.group.table(&db.alloc, pos)?;
            table
                .primary_key()
                .filter(|&pk| !table.has_search_index(pk))
        };
        if let Some(pk) = missing {
            tr.group.table_mut(&db.alloc, pos)?.add_search_index(pk)?;
            debug!(table = %tr.group.names()[pos], "primary key index added");
        }
    }
    Ok(())
}
