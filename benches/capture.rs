//! Benchmarks for capture strategies: full-copy vs trap-based sparse diff

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pagemirror::{page_size, AlignedRegion, Arena, ArenaDesc, UsageMode};

fn benchmark_full_copy_capture(c: &mut Criterion) {
    let ps = page_size();
    let mut group = c.benchmark_group("capture_full_copy");

    for pages in [16, 256, 1024].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(pages), pages, |b, &pages| {
            let region = AlignedRegion::new(pages * ps).unwrap();
            let mut arena = Arena::new(ArenaDesc::new(
                region.base(),
                region.len(),
                UsageMode::ReadWrite,
            ))
            .unwrap();
            let mut dest = vec![0u8; 12 + pages * ps];
            b.iter(|| {
                black_box(arena.capture_changes(&mut dest).unwrap());
            });
        });
    }

    group.finish();
}

fn benchmark_trap_diff_capture(c: &mut Criterion) {
    let ps = page_size();
    let mut group = c.benchmark_group("capture_trap_diff");

    // 1024-page arena with a varying number of dirtied pages per generation
    for dirty in [1, 16, 256].iter() {
        group.bench_with_input(BenchmarkId::from_parameter(dirty), dirty, |b, &dirty| {
            let region = AlignedRegion::new(1024 * ps).unwrap();
            let mut arena = Arena::new(ArenaDesc::new(
                region.base(),
                region.len(),
                UsageMode::ReadWriteDiff,
            ))
            .unwrap();
            let mut dest = vec![0u8; 12 + dirty * (4 + ps)];
            b.iter(|| {
                // Each touch traps once per generation; the capture then
                // re-protects and resets for the next iteration
                for page in 0..dirty {
                    unsafe {
                        std::ptr::write_volatile(region.base().add(page * 4 * ps), page as u8)
                    };
                }
                black_box(arena.capture_changes(&mut dest).unwrap());
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    benchmark_full_copy_capture,
    benchmark_trap_diff_capture
);
criterion_main!(benches);
