//! Shrinking a file by moving nodes below an evacuation point.

use slabdb_core::{ColKey, ColumnType, Db, ObjKey, TableKey, Value, VersionId};
use slabdb_storage::StorageBackend;
use slabdb_testkit::{init_test_logging, TestDb};
use std::sync::Arc;

/// Builds a file with a large cleared table near the start and a small
/// live table after it. Returns the live table, its column and the logical
/// size before the live table was written.
fn fragmented(db: &Arc<Db>) -> (TableKey, ColKey, u64) {
    let mut tr = db.start_write().unwrap();
    let bulk = tr.add_table("bulk").unwrap();
    let text = tr.add_column(bulk, "text", ColumnType::String, false).unwrap();
    for i in 0..600 {
        let obj = tr.create_object(bulk).unwrap();
        tr.set(bulk, obj, text, Value::String(format!("{i:048}"))).unwrap();
    }
    tr.commit().unwrap();
    drop(tr);
    let limit = db.alloc().logical_size();

    let mut tr = db.start_write().unwrap();
    let tail = tr.add_table("tail").unwrap();
    let n = tr.add_column(tail, "n", ColumnType::Int, false).unwrap();
    for i in 0..60 {
        let obj = tr.create_object(tail).unwrap();
        tr.set(tail, obj, n, Value::Int(i)).unwrap();
    }
    tr.commit().unwrap();
    drop(tr);

    let mut tr = db.start_write().unwrap();
    tr.clear_table(bulk).unwrap();
    tr.commit().unwrap();
    (tail, n, limit)
}

/// Evacuates until a plan comes back empty; returns the number of rounds
/// that moved something.
fn evacuate_until_done(db: &Arc<Db>, point: u64) -> usize {
    for round in 0..5 {
        let mut tr = db.start_write().unwrap();
        if round == 0 {
            tr.set_evacuation_point(point).unwrap();
        }
        let plan = tr.get_outliers().unwrap();
        if plan.is_empty() {
            tr.commit().unwrap();
            return round;
        }
        assert!(tr.evacuate(&plan).unwrap() > 0);
        tr.commit().unwrap();
    }
    panic!("evacuation did not converge");
}

fn assert_tail_intact(db: &Arc<Db>, tail: TableKey, n: ColKey) {
    let tr = db.start_read(VersionId::Latest).unwrap();
    assert_eq!(tr.table_size(tail).unwrap(), 60);
    for i in 0..60 {
        assert_eq!(tr.get(tail, ObjKey(i), n).unwrap(), Value::Int(i));
    }
}

#[test]
fn evacuation_reaches_a_fixed_point_and_shrinks_the_file() {
    init_test_logging();
    let db = TestDb::memory();
    let (tail, n, limit) = fragmented(&db);
    let before = db.alloc().logical_size();
    assert!(before > limit);

    let rounds = evacuate_until_done(&db, limit);
    assert_eq!(rounds, 1);
    assert!(db.stats().nodes_evacuated() > 0);

    assert!(db.alloc().logical_size() <= limit);
    assert!(db.backend().unwrap().size().unwrap() <= limit);
    assert_tail_intact(&db, tail, n);

    let mut tr = db.start_write().unwrap();
    assert_eq!(tr.evacuation_point(), limit);
    assert!(tr.get_outliers().unwrap().is_empty());
    tr.rollback().unwrap();
}

#[test]
fn evacuated_file_reopens_intact() {
    let mut db = TestDb::memory();
    let (tail, n, limit) = fragmented(&db);
    evacuate_until_done(&db, limit);
    db.reopen().unwrap();

    assert_tail_intact(&db, tail, n);
    let mut tr = db.start_write().unwrap();
    assert_eq!(tr.evacuation_point(), limit);
    assert!(tr.get_outliers().unwrap().is_empty());

    tr.set_evacuation_point(0).unwrap();
    tr.commit().unwrap();
    let tr = db.start_read(VersionId::Latest).unwrap();
    assert_eq!(tr.evacuation_point(), 0);
}

#[test]
fn pinned_readers_hold_the_tail_until_they_end() {
    let db = TestDb::memory();
    let (tail, n, limit) = fragmented(&db);
    let reader = db.start_read(VersionId::Latest).unwrap();

    evacuate_until_done(&db, limit);
    // The reader's snapshot still lives above the point.
    assert!(db.alloc().logical_size() > limit);
    assert_eq!(reader.table_size(tail).unwrap(), 60);
    drop(reader);

    // The next two writes release the old nodes and cut the tail.
    for _ in 0..2 {
        let mut tr = db.start_write().unwrap();
        tr.commit().unwrap();
    }
    assert!(db.alloc().logical_size() <= limit);
    assert_tail_intact(&db, tail, n);
}

#[test]
fn without_a_point_nothing_is_an_outlier() {
    let db = TestDb::memory();
    fragmented(&db);
    let mut tr = db.start_read(VersionId::Latest).unwrap();
    assert_eq!(tr.evacuation_point(), 0);
    assert!(tr.get_outliers().unwrap().is_empty());
}
