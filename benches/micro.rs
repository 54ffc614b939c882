//! Micro-benchmarks for stratumdb core operations.
//!
//! Uses Criterion for statistically rigorous measurement with
//! regression detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- put       # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};

use stratumdb::{Store, StoreConfig};
use tempfile::TempDir;

/// Default value payload (128 bytes).
const VALUE_128B: &[u8; 128] = &[0xAB; 128];

/// Format a zero-padded key.
fn make_key(i: u64) -> Vec<u8> {
    format!("key-{i:012}").into_bytes()
}

/// Open a store whose memtable comfortably holds the whole benchmark
/// working set (no flushes during measurement).
fn open_memtable_only(dir: &std::path::Path) -> Store {
    Store::open(StoreConfig {
        wal_flush_every_write: false,
        ..StoreConfig::new(dir)
    })
    .expect("open")
}

fn bench_put(c: &mut Criterion) {
    let mut group = c.benchmark_group("put");
    group.throughput(Throughput::Elements(1));

    group.bench_function("memtable_128b", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_memtable_only(tmp.path());
        let mut i = 0u64;
        b.iter(|| {
            i += 1;
            store.put(make_key(i), VALUE_128B.to_vec()).unwrap();
        });
    });

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("memtable_hit", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_memtable_only(tmp.path());
        for i in 0..10_000 {
            store.put(make_key(i), VALUE_128B.to_vec()).unwrap();
        }
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            black_box(store.get(&make_key(i)).unwrap());
        });
    });

    group.bench_function("sstable_hit", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_memtable_only(tmp.path());
        for i in 0..10_000 {
            store.put(make_key(i), VALUE_128B.to_vec()).unwrap();
        }
        store.flush_memtable().unwrap();
        let mut i = 0u64;
        b.iter(|| {
            i = (i + 1) % 10_000;
            black_box(store.get(&make_key(i)).unwrap());
        });
    });

    group.finish();
}

fn bench_range(c: &mut Criterion) {
    let mut group = c.benchmark_group("range");

    group.bench_function("scan_1k_of_10k", |b| {
        let tmp = TempDir::new().unwrap();
        let store = open_memtable_only(tmp.path());
        for i in 0..10_000 {
            store.put(make_key(i), VALUE_128B.to_vec()).unwrap();
        }
        store.flush_memtable().unwrap();
        let lo = make_key(4_000);
        let hi = make_key(5_000);
        b.iter(|| {
            black_box(store.range(Some(&lo), Some(&hi)).unwrap());
        });
    });

    group.finish();
}

criterion_group!(benches, bench_put, bench_get, bench_range);
criterion_main!(benches);
