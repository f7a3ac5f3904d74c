//! Allocation-path benchmarks against the emulated transport

use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use pulse_core::{ContextMode, Runtime};
use pulse_transport::EmulatedTransport;

fn bench_alloc_free(c: &mut Criterion) {
    let runtime = Runtime::new(Arc::new(EmulatedTransport::new(1))).unwrap();
    let ctx = runtime.ctx_create(0, ContextMode::Parallel).unwrap();

    let mut group = c.benchmark_group("alloc_free");
    for size in [256u64, 4096, 1 << 20] {
        group.throughput(Throughput::Bytes(size));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            b.iter(|| {
                let ptr = ctx.malloc(size, 0).unwrap();
                ctx.free(ptr, 0).unwrap();
                ctx.sync().unwrap();
            });
        });
    }
    group.finish();
}

fn bench_resolve(c: &mut Criterion) {
    let runtime = Runtime::new(Arc::new(EmulatedTransport::new(1))).unwrap();
    let ctx = runtime.ctx_create(0, ContextMode::Parallel).unwrap();

    let ptr = ctx.malloc(4096, 0).unwrap();
    ctx.sync().unwrap();

    c.bench_function("resolve_hot", |b| {
        b.iter(|| ctx.resolve(std::hint::black_box(ptr)).unwrap());
    });
}

fn bench_h2d_roundtrip(c: &mut Criterion) {
    let runtime = Runtime::new(Arc::new(EmulatedTransport::new(1))).unwrap();
    let ctx = runtime.ctx_create(0, ContextMode::Parallel).unwrap();

    let ptr = ctx.malloc(1 << 20, 0).unwrap();
    let payload = vec![0x5Au8; 1 << 20];
    let mut readback = vec![0u8; 1 << 20];

    let mut group = c.benchmark_group("copy");
    group.throughput(Throughput::Bytes(2 << 20));
    group.bench_function("h2d_d2h_1mib", |b| {
        b.iter(|| {
            ctx.memcpy_h2d(ptr, &payload, 0).unwrap();
            ctx.memcpy_d2h(&mut readback, ptr, 0).unwrap();
        });
    });
    group.finish();
}

criterion_group!(benches, bench_alloc_free, bench_resolve, bench_h2d_roundtrip);
criterion_main!(benches);
