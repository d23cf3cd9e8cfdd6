//! Performance benchmarks for veil-crypto.
//!
//! Run with: `cargo bench -p veil-crypto`
//!
//! The interesting comparison is the serial block driver against the
//! pool-parallel driver at bulk-transfer sizes.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use veil_crypto::block::{encrypt_parallel, SymmetricKey};
use veil_runtime::WorkerPool;

// ============================================================================
// Serial Block Cipher
// ============================================================================

fn bench_encrypt_serial(c: &mut Criterion) {
    let mut group = c.benchmark_group("encrypt_serial");

    let sizes = [1024, 16384, 262_144, 1_048_576];
    let key = SymmetricKey::new(&[0x42u8; 32]).unwrap();

    for size in sizes {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let mut data = vec![0xAAu8; size];
            b.iter(|| key.encrypt_in_place(black_box(&mut data), size, true));
        });
    }

    group.finish();
}

// ============================================================================
// Parallel Block Cipher
// ============================================================================

fn bench_encrypt_parallel(c: &mut Criterion) {
    let mut group = c.benchmark_group("encrypt_parallel_1mib");

    let size = 1_048_576;
    let key = Arc::new(SymmetricKey::new(&[0x42u8; 32]).unwrap());

    for n_jobs in [1usize, 2, 4, 8] {
        let pool = WorkerPool::new(n_jobs);
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(n_jobs), &n_jobs, |b, &n_jobs| {
            let mut data = vec![0xAAu8; size];
            b.iter(|| {
                encrypt_parallel(black_box(&mut data), size, &key, true, n_jobs, &pool)
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encrypt_serial, bench_encrypt_parallel);
criterion_main!(benches);
