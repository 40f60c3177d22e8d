//! Benchmark: cost-model arithmetic on a scattered extent layout.
//!
//! The slow scan prices hundreds of files per batch; the per-extent seek
//! accumulation is the hot loop.

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use dfd_cost::DriveGeometry;

/// A 10 MiB file in 100 extents strewn across a 2 GiB span.
fn make_layout() -> Vec<(u64, u64)> {
    let mut extents = Vec::with_capacity(100);
    let mut start = 1000_u64;
    for i in 0..100_u64 {
        extents.push((start, start + 25));
        // Deterministic scatter, alternating short and long hops.
        start = (start + 5_000 + (i % 7) * 70_000) % 524_288;
    }
    extents
}

fn bench_seek_accumulation(c: &mut Criterion) {
    let geo = DriveGeometry::default();
    let layout = make_layout();

    c.bench_function("accumulate_seeks_100_extents", |b| {
        b.iter(|| {
            let mut total = 0.0;
            let mut prev_end: Option<u64> = None;
            for &(start, end) in black_box(&layout) {
                if let Some(prev) = prev_end {
                    total += geo.seek_time(prev, start);
                }
                prev_end = Some(end);
            }
            black_box(geo.fragmentation_cost(10 << 20, total))
        });
    });
}

criterion_group!(benches, bench_seek_accumulation);
criterion_main!(benches);
