//! Upgrades of legacy files, straight through and interrupted.

use slabdb_core::upgrade::{LEGACY_PK_TABLE, PROGRESS_TABLE};
use slabdb_core::{
    ColKey, ColumnType, Config, CoreError, Db, LinkTarget, ObjKey, TableKey, Transaction, Value,
    VersionId, TARGET_FILE_FORMAT,
};
use slabdb_storage::InMemoryBackend;
use slabdb_testkit::{
    dump_layout, init_test_logging, sample_legacy_file, CrashableBackend, LegacyFileBuilder,
    LegacyTable,
};
use std::sync::Arc;

fn column(tr: &Transaction, table: TableKey, name: &str) -> ColKey {
    tr.column_keys(table)
        .unwrap()
        .into_iter()
        .find(|&c| tr.column_name(table, c).unwrap() == name)
        .unwrap_or_else(|| panic!("no column {name}"))
}

fn upgrade_straight(format: u32) -> (Arc<Db>, InMemoryBackend) {
    let backend = sample_legacy_file(format).build_backend().unwrap();
    let db = Db::open_with_backend(Box::new(backend.clone()), Config::default()).unwrap();
    (db, backend)
}

#[test]
fn format_six_file_is_upgraded_to_clusters() {
    init_test_logging();
    let (db, _) = upgrade_straight(6);
    let tr = db.start_read(VersionId::Latest).unwrap();

    assert_eq!(tr.file_format_version(), TARGET_FILE_FORMAT);
    assert_eq!(tr.top_size(), 11);
    assert!(tr.version() > 4);
    assert!(tr.find_table(LEGACY_PK_TABLE).is_none());
    assert!(tr.find_table(PROGRESS_TABLE).is_none());

    // Table keys are the legacy table positions.
    let dogs = tr.find_table("dogs").unwrap();
    let people = tr.find_table("people").unwrap();
    let tags = tr.find_table("tags").unwrap();
    assert_eq!((dogs, people, tags), (TableKey(0), TableKey(1), TableKey(2)));

    let dog_name = column(&tr, dogs, "name");
    assert_eq!(tr.get_primary_key_column(dogs).unwrap(), Some(dog_name));
    assert!(tr.has_search_index(dogs, dog_name).unwrap());
    assert_eq!(
        tr.find_first(dogs, dog_name, &Value::String("fido".into())).unwrap(),
        Some(ObjKey(1))
    );

    let person_name = column(&tr, people, "name");
    let pet = column(&tr, people, "pet");
    let nick = column(&tr, people, "nick");
    assert!(tr.has_search_index(people, person_name).unwrap());
    assert_eq!(tr.get_primary_key_column(people).unwrap(), None);
    assert_eq!(tr.column_type(people, pet).unwrap(), ColumnType::Link);
    assert_eq!(
        tr.table_data(people).unwrap().columns()[pet.index()].target,
        LinkTarget::Table(dogs)
    );

    assert_eq!(
        tr.object_keys(people).unwrap(),
        vec![ObjKey(0), ObjKey(1), ObjKey(2)]
    );
    assert_eq!(tr.get(people, ObjKey(0), pet).unwrap(), Value::Link(ObjKey(1)));
    assert_eq!(tr.get(people, ObjKey(1), pet).unwrap(), Value::Null);
    assert_eq!(tr.get(people, ObjKey(2), pet).unwrap(), Value::Link(ObjKey(0)));
    assert_eq!(
        tr.get(people, ObjKey(1), nick).unwrap(),
        Value::String("bobby".into())
    );
    assert_eq!(tr.get(people, ObjKey(0), nick).unwrap(), Value::Null);
    assert_eq!(tr.table_size(tags).unwrap(), 2);

    assert!(db.stats().upgrade_commits() >= 2);
    assert_eq!(db.durable_version(), db.latest_version());
}

#[test]
fn upgraded_file_reopens_without_another_upgrade() {
    let (db, backend) = upgrade_straight(6);
    let version = db.latest_version();
    db.close().unwrap();
    drop(db);

    let db = Db::open_with_backend(Box::new(backend), Config::default()).unwrap();
    assert_eq!(db.latest_version(), version);
    assert_eq!(db.stats().upgrade_commits(), 0);
    let tr = db.start_read(VersionId::Latest).unwrap();
    assert_eq!(tr.table_size(tr.find_table("dogs").unwrap()).unwrap(), 3);
}

#[test]
fn every_legacy_format_reaches_the_same_layout() {
    let reference = {
        let (db, _) = upgrade_straight(6);
        let tr = db.start_read(VersionId::Latest).unwrap();
        dump_layout(&tr).unwrap()
    };
    for format in 7..10 {
        let (db, _) = upgrade_straight(format);
        let tr = db.start_read(VersionId::Latest).unwrap();
        assert_eq!(dump_layout(&tr).unwrap(), reference, "format {format}");
    }
}

#[test]
fn upgrade_is_refused_when_not_allowed() {
    let image = sample_legacy_file(6).build().unwrap();
    let backend = InMemoryBackend::with_data(image.clone());
    let err = Db::open_with_backend(
        Box::new(backend.clone()),
        Config::default().allow_file_format_upgrade(false),
    )
    .unwrap_err();

    assert!(matches!(
        err,
        CoreError::FileFormatUpgradeRequired {
            current: 6,
            target: TARGET_FILE_FORMAT
        }
    ));
    assert_eq!(backend.data(), image);
}

#[test]
fn formats_before_six_are_rejected() {
    let image = LegacyFileBuilder::new(5).build().unwrap();
    let err = Db::open_with_backend(
        Box::new(InMemoryBackend::with_data(image)),
        Config::default(),
    )
    .unwrap_err();
    assert!(matches!(err, CoreError::InvalidFormat { .. }));
}

#[test]
fn tables_without_primary_key_table_upgrade() {
    let image = LegacyFileBuilder::new(8)
        .table(LegacyTable::new("plain").column(
            slabdb_core::ColumnSpec::new("n", ColumnType::Int),
            vec![Value::Int(1), Value::Int(2), Value::Int(3)],
        ))
        .build()
        .unwrap();
    let db = Db::open_with_backend(
        Box::new(InMemoryBackend::with_data(image)),
        Config::default(),
    )
    .unwrap();
    let tr = db.start_read(VersionId::Latest).unwrap();
    let plain = tr.find_table("plain").unwrap();
    let n = column(&tr, plain, "n");
    assert_eq!(tr.get(plain, ObjKey(2), n).unwrap(), Value::Int(3));
    assert_eq!(tr.get_table_keys(), vec![plain]);
}

/// Opens `backend` with a crash after the first durable commit of every
/// session, until a session gets through. Returns the database and the
/// number of sessions that were cut off.
fn open_with_crashes(backend: &InMemoryBackend) -> (Arc<Db>, usize) {
    let mut crashed_sessions = 0;
    loop {
        let crashable = CrashableBackend::with_sync_budget(Box::new(backend.clone()), 2);
        let control = crashable.controller();
        match Db::open_with_backend(Box::new(crashable), Config::default()) {
            Ok(db) => {
                control.reset();
                return (db, crashed_sessions);
            }
            Err(err) => {
                assert!(control.has_crashed(), "open failed without a crash: {err}");
                crashed_sessions += 1;
                assert!(crashed_sessions < 50, "upgrade makes no progress");
            }
        }
    }
}

#[test]
fn interrupted_upgrade_resumes_to_the_same_result() {
    init_test_logging();
    let (straight, _) = upgrade_straight(6);
    let expected = dump_layout(&straight.start_read(VersionId::Latest).unwrap()).unwrap();

    let backend = sample_legacy_file(6).build_backend().unwrap();
    let (resumed, crashed_sessions) = open_with_crashes(&backend);

    // One session per intermediate commit: the history slot, the cluster
    // setup, and the object and link steps.
    assert!(crashed_sessions >= 3, "only {crashed_sessions} interrupted sessions");
    let tr = resumed.start_read(VersionId::Latest).unwrap();
    assert_eq!(dump_layout(&tr).unwrap(), expected);
    assert_eq!(resumed.latest_version(), straight.latest_version());
    assert!(tr.find_table(PROGRESS_TABLE).is_none());
}

#[test]
fn interrupted_upgrade_leaves_a_readable_file() {
    let backend = sample_legacy_file(6).build_backend().unwrap();
    let crashable = CrashableBackend::with_sync_budget(Box::new(backend.clone()), 4);
    assert!(Db::open_with_backend(Box::new(crashable), Config::default()).is_err());

    // Two commits made it: the history slot and the cluster setup. The
    // progress table is durable, but the file still needs the upgrade.
    let err = Db::open_with_backend(
        Box::new(backend.clone()),
        Config::default().allow_file_format_upgrade(false),
    )
    .unwrap_err();
    assert!(matches!(
        err,
        CoreError::FileFormatUpgradeRequired { current: 7, .. }
    ));

    let db = Db::open_with_backend(Box::new(backend), Config::default()).unwrap();
    let tr = db.start_read(VersionId::Latest).unwrap();
    assert_eq!(tr.file_format_version(), TARGET_FILE_FORMAT);
    assert_eq!(tr.get_table_keys().len(), 3);
}
