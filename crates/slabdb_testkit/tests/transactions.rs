//! Randomised transaction workloads checked against a simple model.

use proptest::prelude::*;
use slabdb_core::{Config, Durability, TransactStage, Transaction, Version, VersionId};
use slabdb_testkit::{tx_ops_strategy, TestDb, TxOp};
use std::collections::BTreeMap;
use std::thread;
use std::time::Duration;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn snapshots_stay_isolated(ops in tx_ops_strategy(40)) {
        let db = TestDb::memory_with(Config::default().durability(Durability::MemOnly));
        let mut setup = db.start_write().unwrap();
        let table = setup.add_table("items").unwrap();
        setup.commit().unwrap();
        drop(setup);

        // Object count of every committed version.
        let mut sizes: BTreeMap<Version, usize> = BTreeMap::new();
        sizes.insert(db.latest_version(), 0);
        let mut readers: Vec<Transaction> = Vec::new();

        for op in ops {
            let latest = db.latest_version();
            match op {
                TxOp::Write { inserts, commit } => {
                    let mut tr = db.start_write().unwrap();
                    let before = tr.table_size(table).unwrap();
                    for _ in 0..inserts {
                        tr.create_object(table).unwrap();
                    }
                    if commit {
                        let version = tr.commit().unwrap();
                        prop_assert_eq!(version, latest + 1);
                        sizes.insert(version, before + inserts);
                    } else {
                        tr.rollback().unwrap();
                        prop_assert_eq!(tr.stage(), TransactStage::Ready);
                        prop_assert_eq!(db.latest_version(), latest);
                    }
                }
                TxOp::OpenReader => readers.push(db.start_read(VersionId::Latest).unwrap()),
                TxOp::CloseReader(i) if !readers.is_empty() => {
                    let mut reader = readers.remove(i % readers.len());
                    reader.close().unwrap();
                    prop_assert!(!reader.is_attached());
                }
                TxOp::AdvanceReader(i) if !readers.is_empty() => {
                    let len = readers.len();
                    let reader = &mut readers[i % len];
                    if reader.stage() == TransactStage::Frozen {
                        prop_assert!(reader
                            .advance_read(VersionId::Latest)
                            .unwrap_err()
                            .is_wrong_transact_state());
                    } else {
                        reader.advance_read(VersionId::Latest).unwrap();
                        prop_assert_eq!(reader.version(), latest);
                    }
                }
                TxOp::FreezeReader(i) if !readers.is_empty() => {
                    let len = readers.len();
                    let frozen = readers[i % len].freeze().unwrap();
                    prop_assert_eq!(frozen.stage(), TransactStage::Frozen);
                    prop_assert_eq!(frozen.version(), readers[i % len].version());
                    readers.push(frozen);
                }
                TxOp::PromoteReader(i) if !readers.is_empty() => {
                    let len = readers.len();
                    let reader = &mut readers[i % len];
                    if reader.stage() == TransactStage::Frozen {
                        prop_assert!(reader
                            .promote_to_write()
                            .unwrap_err()
                            .is_wrong_transact_state());
                    } else {
                        reader.promote_to_write().unwrap();
                        prop_assert_eq!(reader.version(), latest);
                        let before = reader.table_size(table).unwrap();
                        reader.create_object(table).unwrap();
                        let version = reader.commit().unwrap();
                        prop_assert_eq!(reader.stage(), TransactStage::Reading);
                        sizes.insert(version, before + 1);
                    }
                }
                _ => {}
            }

            for reader in &readers {
                let expected = sizes[&reader.version()];
                prop_assert_eq!(reader.table_size(table).unwrap(), expected);
                prop_assert!(db.registry().pin_count(reader.version()) >= 1);
            }
            prop_assert_eq!(db.latest_version(), *sizes.keys().last().unwrap());
            prop_assert!(db.try_start_write().unwrap().is_some());
        }

        for mut reader in readers.drain(..) {
            reader.close().unwrap();
        }
        for &version in sizes.keys() {
            prop_assert_eq!(db.registry().pin_count(version), 0);
        }
        prop_assert_eq!(db.registry().oldest_live_version(), db.latest_version());
        prop_assert_eq!(db.registry().leaked(), 0);
    }
}

#[test]
fn duplicate_keeps_stage_and_version() {
    let db = TestDb::memory();
    let mut tr = db.start_write().unwrap();
    tr.add_table("t").unwrap();
    tr.commit().unwrap();

    let dup = tr.duplicate().unwrap();
    assert_eq!(dup.stage(), TransactStage::Reading);
    assert_eq!(dup.version(), tr.version());
    let frozen = dup.freeze().unwrap();
    let frozen_dup = frozen.duplicate().unwrap();
    assert_eq!(frozen_dup.stage(), TransactStage::Frozen);
    assert_eq!(db.registry().pin_count(tr.version()), 4);
}

#[test]
fn old_versions_stay_readable_by_explicit_id() {
    let db = TestDb::memory();
    let mut tr = db.start_write().unwrap();
    let t = tr.add_table("t").unwrap();
    tr.commit().unwrap();
    let pinned = tr.version_id();

    let mut writer = db.start_write().unwrap();
    writer.create_object(t).unwrap();
    writer.commit().unwrap();

    let again = db.start_read(pinned).unwrap();
    assert_eq!(again.version(), tr.version());
    assert_eq!(again.table_size(t).unwrap(), 0);
}

#[test]
fn writer_wakes_waiting_readers() {
    let db = TestDb::memory();
    let reader = db.start_read(VersionId::Latest).unwrap();
    assert!(!reader.has_changed());
    assert!(!reader.wait_for_change(Some(Duration::from_millis(10))).unwrap());

    let handle = db.handle();
    let writer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        let mut tr = handle.start_write().unwrap();
        tr.add_table("t").unwrap();
        tr.commit().unwrap()
    });
    assert!(reader.wait_for_change(Some(Duration::from_secs(10))).unwrap());
    let version = writer.join().unwrap();
    assert!(reader.has_changed());
    assert_eq!(db.latest_version(), version);
}
