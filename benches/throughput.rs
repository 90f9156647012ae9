//! Throughput benchmarks
//!
//! Measures allocate/write/commit cycles, committed reads, and vacuum
//! cycles over a small pack file.

use std::collections::BTreeMap;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use tempfile::tempdir;

use blockpack::{Creator, Pack};

fn test_pack(dir: &std::path::Path, name: &str) -> Pack {
    let creator = Creator {
        page_size: 4096,
        alignment: 64,
        journal_headers: 8,
        address_pool_minimum: 1,
        static_blocks: BTreeMap::new(),
    };
    creator.create(dir.join(name)).unwrap()
}

fn bench_allocate_write_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("allocate_write_commit");
    for (name, size) in [("64B", 64usize), ("512B", 512), ("2KB", 2048)] {
        group.throughput(Throughput::Bytes(size as u64 * 16));
        group.bench_with_input(BenchmarkId::from_parameter(name), &size, |b, &size| {
            let dir = tempdir().unwrap();
            let pack = test_pack(dir.path(), "bench.pack");
            let payload = vec![0xABu8; size];
            b.iter(|| {
                let mut mutator = pack.mutate().unwrap();
                for _ in 0..16 {
                    let address = mutator.allocate(size as u64).unwrap();
                    mutator.write(address, &payload).unwrap();
                }
                mutator.commit().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_committed_reads(c: &mut Criterion) {
    let dir = tempdir().unwrap();
    let pack = test_pack(dir.path(), "reads.pack");
    let mut mutator = pack.mutate().unwrap();
    let addresses: Vec<u64> = (0..256)
        .map(|i| {
            let address = mutator.allocate(256).unwrap();
            mutator.write(address, &[i as u8; 256]).unwrap();
            address
        })
        .collect();
    mutator.commit().unwrap();
    c.bench_function("read_256_committed_blocks", |b| {
        let reader = pack.mutate().unwrap();
        b.iter(|| {
            for &address in &addresses {
                black_box(reader.read(address).unwrap());
            }
        });
    });
}

fn bench_vacuum_cycle(c: &mut Criterion) {
    c.bench_function("vacuum_fragmented_pages", |b| {
        b.iter_with_setup(
            || {
                let dir = tempdir().unwrap();
                let pack = test_pack(dir.path(), "vac.pack");
                let mut mutator = pack.mutate().unwrap();
                let addresses: Vec<u64> =
                    (0..128).map(|_| mutator.allocate(128).unwrap()).collect();
                mutator.commit().unwrap();
                let mut mutator = pack.mutate().unwrap();
                for address in addresses.iter().step_by(2) {
                    mutator.free(*address).unwrap();
                }
                mutator.commit().unwrap();
                (dir, pack)
            },
            |(_dir, pack)| {
                pack.vacuum().unwrap();
            },
        );
    });
}

criterion_group!(
    benches,
    bench_allocate_write_commit,
    bench_committed_reads,
    bench_vacuum_cycle
);
criterion_main!(benches);
