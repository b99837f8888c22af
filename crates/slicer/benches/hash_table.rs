use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use rand::{rngs::StdRng, Rng, SeedableRng};
use slicer::join::{PageAllocator, StreamJoinHashTable};
use slicer::InsertStrategy;
use std::thread;

const SEED: [u8; 32] = [
    0x7f, 0xc3, 0x59, 0x18, 0x45, 0x19, 0xc0, 0xaa, 0xd2, 0xec, 0x31, 0x26, 0xbb, 0x74, 0x2f, 0x8b,
    0x11, 0x7d, 0xc, 0xe4, 0x64, 0xbf, 0x72, 0x17, 0x46, 0x28, 0x46, 0x42, 0xb2, 0x4b, 0x72, 0x18,
];

const RECORDS_PER_THREAD: usize = 50_000;
const BUCKETS: usize = 1024;
const PAGE_CAPACITY: usize = 128;

fn keys(threads: usize, distinct: u64) -> Vec<Vec<u64>> {
    let mut rng = StdRng::from_seed(SEED);
    (0..threads)
        .map(|_| {
            (0..RECORDS_PER_THREAD)
                .map(|_| rng.gen_range(0..distinct))
                .collect()
        })
        .collect()
}

fn build(strategy: InsertStrategy, keys: &[Vec<u64>]) -> StreamJoinHashTable<u64, u64> {
    let table = StreamJoinHashTable::new(BUCKETS, strategy, PageAllocator::unbounded(PAGE_CAPACITY));
    thread::scope(|scope| {
        for keys in keys {
            let table = &table;
            scope.spawn(move || {
                for (value, key) in keys.iter().enumerate() {
                    table.insert_record(*key, value as u64).unwrap();
                }
            });
        }
    });
    table
}

fn insert(c: &mut Criterion) {
    // Few distinct keys make threads collide on the same buckets.
    for (contention, distinct) in [("low contention", 1 << 20), ("high contention", 16)] {
        let mut group = c.benchmark_group(format!("insert/{contention}"));
        for threads in [1, 2, 4, 8] {
            let keys = keys(threads, distinct);
            group.throughput(Throughput::Elements((threads * RECORDS_PER_THREAD) as u64));
            for strategy in [InsertStrategy::Locking, InsertStrategy::LockFree] {
                group.bench_with_input(
                    BenchmarkId::new(strategy.to_string(), threads),
                    &keys,
                    |b, keys| b.iter(|| black_box(build(strategy, keys))),
                );
            }
        }
        group.finish();
    }
}

fn probe(c: &mut Criterion) {
    let keys = keys(4, 1 << 16);
    let sealed = build(InsertStrategy::LockFree, &keys).seal();
    let probes: Vec<u64> = keys[0].iter().take(10_000).copied().collect();

    let mut group = c.benchmark_group("probe");
    group.throughput(Throughput::Elements(probes.len() as u64));
    group.bench_function("sealed", |b| {
        b.iter(|| {
            probes
                .iter()
                .map(|key| sealed.probe(key).count())
                .sum::<usize>()
        })
    });
    group.finish();
}

criterion_group!(benches, insert, probe);
criterion_main!(benches);
