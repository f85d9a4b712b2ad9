//! Storage layer benchmarks: node encoding, allocation and publication.

use criterion::{
    black_box, criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion, Throughput,
};
use slabdb_storage::{
    FileBackend, FileHeader, InMemoryBackend, Node, RefOrTagged, SlabAlloc, StorageBackend,
};
use tempfile::TempDir;

/// Create an inner array of `len` tagged integers.
fn inner_node(len: usize) -> Node {
    Node::inner((0..len as u64).map(RefOrTagged::make_tagged))
}

/// Benchmark node encoding and decoding.
fn bench_node_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("node_codec");

    for len in [8, 64, 512].iter() {
        let node = inner_node(*len);
        let bytes = node.encode();
        group.throughput(Throughput::Bytes(bytes.len() as u64));

        group.bench_with_input(BenchmarkId::new("encode", len), &node, |b, node| {
            b.iter(|| black_box(node.encode()));
        });
        group.bench_with_input(BenchmarkId::new("decode", len), &bytes, |b, bytes| {
            b.iter(|| black_box(Node::decode(black_box(bytes)).unwrap()));
        });
    }

    group.finish();
}

/// Benchmark allocating and writing nodes inside one write transaction.
fn bench_alloc_nodes(c: &mut Criterion) {
    let mut group = c.benchmark_group("alloc_nodes");

    for count in [100, 1000].iter() {
        group.throughput(Throughput::Elements(*count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), count, |b, &count| {
            let node = inner_node(4);
            b.iter_batched(
                || {
                    let alloc = SlabAlloc::new_empty();
                    alloc.begin_write(0).unwrap();
                    alloc
                },
                |alloc| {
                    for _ in 0..count {
                        black_box(alloc.alloc_node(&node).unwrap());
                    }
                    alloc
                },
                BatchSize::SmallInput,
            );
        });
    }

    group.finish();
}

/// Benchmark reusing freed space across commits.
fn bench_free_and_reuse(c: &mut Criterion) {
    let mut group = c.benchmark_group("free_and_reuse");
    let alloc = SlabAlloc::new_empty();
    let node = inner_node(8);
    let mut version = 1;

    alloc.begin_write(0).unwrap();
    let mut live: Vec<_> = (0..256).map(|_| alloc.alloc_node(&node).unwrap()).collect();
    alloc.prepare_commit(version).unwrap();

    group.bench_function("256_nodes", |b| {
        b.iter(|| {
            alloc.begin_write(version).unwrap();
            for ref_ in live.iter_mut() {
                alloc.free(*ref_).unwrap();
                *ref_ = alloc.alloc_node(&node).unwrap();
            }
            version += 1;
            alloc.prepare_commit(version).unwrap();
        });
    });

    group.finish();
}

/// Benchmark making a commit durable.
fn bench_persist(c: &mut Criterion) {
    let mut group = c.benchmark_group("persist");
    group.sample_size(20); // Sync is slow on files

    group.bench_function("inmemory_100_nodes", |b| {
        let node = inner_node(8);
        b.iter_batched(
            || {
                let alloc = SlabAlloc::new_empty();
                alloc.begin_write(0).unwrap();
                let mut last = 0;
                for _ in 0..100 {
                    last = alloc.alloc_node(&node).unwrap();
                }
                let batch = alloc.prepare_commit(1).unwrap();
                (alloc, batch, last)
            },
            |(alloc, batch, top_ref)| {
                let mut backend = InMemoryBackend::new();
                let mut header = FileHeader::new();
                alloc
                    .persist(&mut backend, &mut header, &batch, top_ref)
                    .unwrap();
                black_box(backend.size().unwrap());
            },
            BatchSize::SmallInput,
        );
    });

    group.bench_function("file_100_nodes", |b| {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("bench.dat");
        let mut backend = FileBackend::open(&path).unwrap();
        let mut header = FileHeader::new();
        let alloc = SlabAlloc::new_empty();
        let node = inner_node(8);
        let mut version = 0;

        b.iter(|| {
            alloc.begin_write(version).unwrap();
            let mut last = 0;
            for _ in 0..100 {
                last = alloc.alloc_node(&node).unwrap();
            }
            version += 1;
            let batch = alloc.prepare_commit(version).unwrap();
            alloc
                .persist(&mut backend, &mut header, &batch, last)
                .unwrap();
        });
    });

    group.finish();
}

/// Benchmark reading nodes back from the shared image.
fn bench_read_node(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_node");
    let alloc = SlabAlloc::new_empty();
    alloc.begin_write(0).unwrap();
    let refs: Vec<_> = (0..1000)
        .map(|_| alloc.alloc_node(&inner_node(16)).unwrap())
        .collect();
    alloc.prepare_commit(1).unwrap();

    let mut idx = 0;
    group.bench_function("1000_nodes", |b| {
        b.iter(|| {
            // Read nodes in pseudo-random order
            let ref_ = refs[(idx * 7) % refs.len()];
            idx += 1;
            black_box(alloc.read_node(black_box(ref_)).unwrap());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_node_codec,
    bench_alloc_nodes,
    bench_free_and_reuse,
    bench_persist,
    bench_read_node,
);

criterion_main!(benches);
