use criterion::{criterion_group, criterion_main, Criterion};
use edgefirst_isp::{pipeline::SideInfo, store::TimeWindowedStore};

fn filled(capacity: usize) -> TimeWindowedStore<SideInfo> {
    let store = TimeWindowedStore::new(capacity, 4).unwrap();
    for ts in 0..capacity as u64 {
        let mut slot = store.edit(ts * 1000).unwrap();
        slot.seq = ts;
        slot.set("exposure_us", 10_000);
        slot.publish();
    }
    store
}

pub fn benchmark_store(c: &mut Criterion) {
    let capacities = [8, 32, 128];

    let mut group = c.benchmark_group("store/publish");
    for capacity in capacities.iter() {
        let store = filled(*capacity);
        let mut ts = *capacity as u64 * 1000;
        group.bench_with_input(format!("{}", capacity), &store, |b, store| {
            b.iter(|| {
                ts += 1000;
                let mut slot = store.edit(ts).unwrap();
                slot.set("analog_gain", 1.5);
                slot.publish();
            })
        });
    }
    group.finish();

    let mut group = c.benchmark_group("store/query_range");
    for capacity in capacities.iter() {
        let store = filled(*capacity);
        let end = *capacity as u64 * 1000;
        group.bench_with_input(format!("{}", capacity), &store, |b, store| {
            b.iter(|| store.query_range(end / 2..=end))
        });
    }
    group.finish();

    let mut group = c.benchmark_group("store/query_nearest");
    for capacity in capacities.iter() {
        let store = filled(*capacity);
        group.bench_with_input(format!("{}", capacity), &store, |b, store| {
            b.iter(|| store.query_nearest(*capacity as u64 * 500 + 17))
        });
    }
    group.finish();
}

criterion_group!(benches, benchmark_store);
criterion_main!(benches);
