//! Arena and recycler benchmarks: lease/return cost on the hot path
//!
//! Measures:
//! - raw page allocate/deallocate at several sizes
//! - pooled buffer allocate/release (arena + wrapper recycler)
//! - fragmentation churn with many live pages

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use netloom_core::alloc::Arena;
use netloom_core::buffer::PooledBuf;
use netloom_core::options::ArenaConfig;
use std::time::Duration;

const SIZES: &[usize] = &[64, 512, 4096, 16384];

fn arena() -> Arena {
    Arena::new(ArenaConfig::new(64 * 1024 * 1024, 1024 * 1024))
}

fn page_allocate_deallocate(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena/page");
    let arena = arena();
    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let page = arena.allocate(black_box(size), Duration::ZERO).unwrap();
                arena.deallocate(page).unwrap();
            });
        });
    }
    group.finish();
}

fn pooled_buf_allocate_release(c: &mut Criterion) {
    let mut group = c.benchmark_group("arena/pooled_buf");
    let arena = arena();
    let payload = vec![7u8; 16384];
    for &size in SIZES {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let mut buf = PooledBuf::allocate(&arena, size, Duration::ZERO).unwrap();
                buf.put_slice(black_box(&payload[..size])).unwrap();
                black_box(buf.readable_bytes());
            });
        });
    }
    group.finish();
}

fn fragmented_churn(c: &mut Criterion) {
    let arena = arena();
    // Keep a checkerboard of live pages so the free list has holes.
    let live: Vec<_> = (0..1024)
        .map(|i| arena.allocate(64 + (i % 7) * 128, Duration::ZERO).unwrap())
        .collect();
    let (keep, holes): (Vec<_>, Vec<_>) = live
        .into_iter()
        .enumerate()
        .partition(|(i, _)| i % 2 == 0);
    drop(holes);

    c.bench_function("arena/fragmented_churn", |b| {
        b.iter(|| {
            let pages: Vec<_> = (0..16)
                .map(|i| arena.allocate(black_box(96 + i * 32), Duration::ZERO).unwrap())
                .collect();
            for page in pages {
                arena.deallocate(page).unwrap();
            }
        });
    });
    drop(keep);
}

criterion_group!(
    name = benches;
    config = Criterion::default().sample_size(50);
    targets = page_allocate_deallocate, pooled_buf_allocate_release, fragmented_churn
);
criterion_main!(benches);
