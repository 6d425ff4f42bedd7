use criterion::{criterion_group, criterion_main, Criterion};
use edgefirst_isp::{
    image::{self, ImageSpec, SystemAllocator},
    pool::BufferPool,
};
use std::{sync::Arc, time::Duration};

pub fn benchmark_acquire(c: &mut Criterion) {
    let dims = [(640, 480), (1920, 1080), (3840, 2160)];

    let mut group = c.benchmark_group("pool/acquire_release");
    for dim in dims.iter() {
        let spec = ImageSpec::new(dim.0, dim.1, image::NV12).unwrap();
        let pool = BufferPool::new("bench", spec, Arc::new(SystemAllocator));
        pool.init(4, 4).unwrap();
        group.bench_with_input(format!("{}x{}", dim.0, dim.1), &pool, |b, pool| {
            b.iter(|| {
                let buf = pool.acquire(Duration::ZERO).unwrap();
                pool.release(buf.index).unwrap();
            })
        });
    }
    group.finish();

    let spec = ImageSpec::new(1920, 1080, image::NV12).unwrap();
    let pool = BufferPool::new("handles", spec, Arc::new(SystemAllocator));
    pool.init(4, 4).unwrap();
    c.bench_function("pool/handle", |b| {
        b.iter(|| drop(pool.acquire_handle(Duration::ZERO).unwrap()))
    });
}

criterion_group!(benches, benchmark_acquire);
criterion_main!(benches);
