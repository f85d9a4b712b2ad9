//! Commit pipeline benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use slabdb_bench::{durable_db, mem_only_db, random_string};
use slabdb_core::{ColumnType, Config, Db, Value};
use tempfile::TempDir;

/// Benchmark commits that change nothing.
fn bench_empty_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("empty_commit");

    group.bench_function("mem_only", |b| {
        let db = mem_only_db();
        b.iter(|| {
            let mut tr = db.start_write().unwrap();
            black_box(tr.commit().unwrap());
        });
    });

    group.bench_function("durable_in_memory", |b| {
        let db = durable_db();
        b.iter(|| {
            let mut tr = db.start_write().unwrap();
            black_box(tr.commit().unwrap());
        });
    });

    group.finish();
}

/// Benchmark committing batches of new objects into a fresh table.
fn bench_insert_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert_commit");

    for batch_size in [10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*batch_size as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(batch_size),
            batch_size,
            |b, &batch_size| {
                let db = durable_db();
                let payload: Vec<_> = (0..batch_size).map(|_| random_string(64)).collect();
                let mut round = 0u64;

                b.iter(|| {
                    let mut tr = db.start_write().unwrap();
                    let table = tr.add_table(&format!("t{round}")).unwrap();
                    let text = tr.add_column(table, "text", ColumnType::String, false).unwrap();
                    for value in &payload {
                        let obj = tr.create_object(table).unwrap();
                        tr.set(table, obj, text, Value::String(value.clone())).unwrap();
                    }
                    black_box(tr.commit().unwrap());
                    round += 1;
                });
            },
        );
    }
    group.finish();
}

/// Benchmark commits to a real file, including both syncs.
fn bench_file_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("file_commit");
    group.sample_size(20); // Sync is slow

    let temp_dir = TempDir::new().unwrap();
    let db = Db::open(&temp_dir.path().join("bench.slabdb"), Config::default()).unwrap();
    let mut tr = db.start_write().unwrap();
    let table = tr.add_table("t").unwrap();
    tr.commit().unwrap();
    drop(tr);

    group.bench_function("one_object", |b| {
        b.iter(|| {
            let mut tr = db.start_write().unwrap();
            tr.create_object(table).unwrap();
            black_box(tr.commit().unwrap());
        });
    });

    group.finish();
}

/// Benchmark rollback of a write transaction with pending allocations.
fn bench_rollback(c: &mut Criterion) {
    let mut group = c.benchmark_group("rollback");

    group.bench_function("100_objects", |b| {
        let db = mem_only_db();
        let mut tr = db.start_write().unwrap();
        let table = tr.add_table("t").unwrap();
        tr.commit().unwrap();
        drop(tr);

        b.iter(|| {
            let mut tr = db.start_write().unwrap();
            for _ in 0..100 {
                tr.create_object(table).unwrap();
            }
            tr.rollback().unwrap();
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_empty_commit,
    bench_insert_commit,
    bench_file_commit,
    bench_rollback,
);

criterion_main!(benches);
