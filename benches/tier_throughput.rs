// Single-tier get/set throughput, grounded on the teacher's own
// `benches/` layout (criterion, one file per subsystem).

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use kbcache_engine::config::TierConfig;
use kbcache_engine::tier::{EvictionKind, TierStore};

fn bench_set(c: &mut Criterion) {
    let mut group = c.benchmark_group("tier_set");
    for kind in [EvictionKind::Lru, EvictionKind::Lfu, EvictionKind::Arc, EvictionKind::Adaptive] {
        let mut cfg = TierConfig::hot_defaults();
        cfg.eviction = kind;
        cfg.max_entries = 10_000;
        let store: TierStore<String> = TierStore::new(cfg);
        group.bench_with_input(BenchmarkId::from_parameter(format!("{kind:?}")), &kind, |b, _| {
            let mut i = 0u64;
            b.iter(|| {
                let key = i.to_be_bytes();
                store.set(&key, black_box("value".to_string()), None, vec![]);
                i += 1;
            });
        });
    }
    group.finish();
}

fn bench_get_hit(c: &mut Criterion) {
    let cfg = TierConfig::hot_defaults();
    let store: TierStore<String> = TierStore::new(cfg);
    for i in 0..1000u64 {
        store.set(&i.to_be_bytes(), "value".to_string(), None, vec![]);
    }
    c.bench_function("tier_get_hit", |b| {
        let mut i = 0u64;
        b.iter(|| {
            let key = (i % 1000).to_be_bytes();
            black_box(store.get(&key));
            i += 1;
        });
    });
}

criterion_group!(benches, bench_set, bench_get_hit);
criterion_main!(benches);
