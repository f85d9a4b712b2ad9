//! Benchmark utilities.

use rand::distributions::Alphanumeric;
use rand::Rng;
use slabdb_core::{ColKey, ColumnType, Config, Db, Durability, TableKey, Value};
use slabdb_storage::InMemoryBackend;
use std::sync::Arc;

/// Generate a random alphanumeric string of the specified length.
pub fn random_string(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Opens an in-memory database whose commits stop at the in-memory
/// publish.
pub fn mem_only_db() -> Arc<Db> {
    Db::open_with_backend(
        Box::new(InMemoryBackend::new()),
        Config::default()
            .durability(Durability::MemOnly)
            .enable_history(false),
    )
    .unwrap()
}

/// Opens an in-memory database with full durability.
pub fn durable_db() -> Arc<Db> {
    Db::open_with_backend(
        Box::new(InMemoryBackend::new()),
        Config::default().enable_history(false),
    )
    .unwrap()
}

/// Creates a table keyed by an integer primary key holding `count`
/// objects with a string payload of `payload` bytes.
pub fn populate(db: &Arc<Db>, count: usize, payload: usize) -> (TableKey, ColKey, ColKey) {
    let mut tr = db.start_write().unwrap();
    let (table, id) = tr
        .add_table_with_primary_key("bench", "id", ColumnType::Int)
        .unwrap();
    let text = tr.add_column(table, "text", ColumnType::String, false).unwrap();
    for i in 0..count {
        let obj = tr
            .create_object_with_primary_key(table, Value::Int(i as i64))
            .unwrap();
        tr.set(table, obj, text, Value::String(random_string(payload)))
            .unwrap();
    }
    tr.commit().unwrap();
    (table, id, text)
}
