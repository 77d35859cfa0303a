// Benchmarks for arena sub-allocation

use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion};
use gpucheck_gpu::{CreationMethod, HeapKind, RegionId, SoftwareDevice};
use gpucheck_memory::{ArenaPool, BufferAllocator, BufferRequest};
use slotmap::SlotMap;
use std::sync::Arc;

fn bench_arena_pool(c: &mut Criterion) {
    c.bench_function("arena_pool_place_1k", |b| {
        b.iter_batched(
            || (ArenaPool::new(HeapKind::GpuLocal, false), SlotMap::<RegionId, u64>::with_key()),
            |(mut pool, mut regions)| {
                for i in 0..1_000u64 {
                    let size = black_box(256 + (i % 7) * 4096);
                    let placement = pool
                        .place(size, 64 * 1024, 4 * 1024 * 1024, |capacity| {
                            Ok(regions.insert(capacity))
                        })
                        .unwrap();
                    black_box(placement);
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_placed_buffers(c: &mut Criterion) {
    c.bench_function("allocator_placed_buffers_64", |b| {
        b.iter_batched(
            || BufferAllocator::with_defaults(Arc::new(SoftwareDevice::new())).unwrap(),
            |mut allocator| {
                let request = BufferRequest::new(HeapKind::Upload, CreationMethod::Placed, 1024);
                for _ in 0..64 {
                    black_box(allocator.create_buffer(&request).unwrap());
                }
                allocator
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_arena_pool, bench_placed_buffers);
criterion_main!(benches);
