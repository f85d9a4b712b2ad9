//! File format upgrade benchmarks.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use slabdb_bench::random_string;
use slabdb_core::{ColumnSpec, ColumnType, Config, Db, LinkTarget, ObjKey, Value};
use slabdb_storage::InMemoryBackend;
use slabdb_testkit::{LegacyFileBuilder, LegacyTable};

/// Build a format 6 image with two linked tables of `rows` rows each.
fn legacy_image(rows: usize) -> Vec<u8> {
    let targets = LegacyTable::new("targets").column(
        ColumnSpec::new("name", ColumnType::String),
        (0..rows).map(|_| Value::String(random_string(16))).collect(),
    );
    let sources = LegacyTable::new("sources")
        .column(
            ColumnSpec::new("n", ColumnType::Int),
            (0..rows as i64).map(Value::Int).collect(),
        )
        .column(
            ColumnSpec::new("target", ColumnType::Link).with_target(LinkTarget::Position(0)),
            (0..rows)
                .map(|r| Value::Link(ObjKey(((r * 7) % rows) as i64)))
                .collect(),
        );
    LegacyFileBuilder::new(6)
        .table(targets)
        .table(sources)
        .primary_key("targets", "name")
        .build()
        .unwrap()
}

/// Benchmark opening a legacy file, which runs the whole upgrade.
fn bench_upgrade_on_open(c: &mut Criterion) {
    let mut group = c.benchmark_group("upgrade_on_open");
    group.sample_size(20);

    for rows in [100, 1000, 10000].iter() {
        let image = legacy_image(*rows);
        group.throughput(Throughput::Elements(2 * *rows as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &image, |b, image| {
            b.iter_batched(
                || InMemoryBackend::with_data(image.clone()),
                |backend| {
                    let db = Db::open_with_backend(Box::new(backend), Config::default()).unwrap();
                    black_box(db.latest_version())
                },
                BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

criterion_group!(benches, bench_upgrade_on_open);

criterion_main!(benches);
