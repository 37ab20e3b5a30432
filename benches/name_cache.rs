//! Benchmark for the volume name cache
//!
//! Target: list refreshes of 10K volumes well under the plugin request timeout

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use csi_volume_bridge::{NameCache, VolumeDescriptor, VolumeId};
use std::collections::BTreeMap;

fn descriptor(i: usize) -> VolumeDescriptor {
    let mut metadata = BTreeMap::new();
    metadata.insert("name".to_string(), format!("vol-{:05}", i));
    VolumeDescriptor {
        id: Some(VolumeId::new(format!("id-{:05}", i))),
        name: format!("vol-{:05}", i),
        metadata,
        ..Default::default()
    }
}

fn bench_get_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("name_cache");
    group.throughput(Throughput::Elements(1));

    let cache = NameCache::new();
    for i in 0..1000 {
        cache.set(&format!("vol-{:05}", i), descriptor(i));
    }

    group.bench_function("get_hit", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let name = format!("vol-{:05}", counter % 1000);
            black_box(cache.get(black_box(&name)));
        });
    });

    group.bench_function("set_existing", |b| {
        let mut counter = 0usize;
        b.iter(|| {
            counter += 1;
            let i = counter % 1000;
            cache.set(black_box(&format!("vol-{:05}", i)), descriptor(i));
        });
    });

    group.finish();
}

fn bench_replace_all(c: &mut Criterion) {
    let mut group = c.benchmark_group("name_cache");
    let volumes: Vec<VolumeDescriptor> = (0..10_000).map(descriptor).collect();
    group.throughput(Throughput::Elements(volumes.len() as u64));

    group.bench_function("replace_all_10k", |b| {
        let cache = NameCache::new();
        b.iter(|| {
            black_box(cache.replace_all(volumes.iter().cloned()));
        });
    });

    group.finish();
}

criterion_group!(benches, bench_get_set, bench_replace_all);
criterion_main!(benches);
