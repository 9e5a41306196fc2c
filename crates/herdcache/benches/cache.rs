use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use herdcache::{BloomFilter, CacheConfig, CacheKey, HerdCache, ReadRequest};
use herdstore::MemoryBackend;
use tokio::runtime::Runtime;

fn bench_bloom(c: &mut Criterion) {
    let mut group = c.benchmark_group("bloom");
    group.throughput(Throughput::Elements(1));

    let filter = BloomFilter::new(100_000, 0.01);
    for i in 0..100_000 {
        filter.put(format!("member-{}", i));
    }

    let mut counter = 0u64;
    group.bench_function("put", |b| {
        b.iter(|| {
            filter.put(black_box(counter.to_be_bytes()));
            counter += 1;
        });
    });

    let mut counter = 0u64;
    group.bench_function("might_contain", |b| {
        b.iter(|| {
            black_box(filter.might_contain(counter.to_be_bytes()));
            counter += 1;
        });
    });

    group.finish();
}

fn bench_read_hit(c: &mut Criterion) {
    let mut group = c.benchmark_group("handle_read");
    group.sample_size(50);
    group.throughput(Throughput::Elements(1));

    let runtime = Runtime::new().unwrap();
    let cache = runtime.block_on(async {
        let mut config = CacheConfig::default();
        config.hotspot.promote_threshold = u64::MAX;
        HerdCache::new(Arc::new(MemoryBackend::new()), config).unwrap()
    });
    let requests: Vec<_> = (0..100)
        .map(|i| ReadRequest::new(CacheKey::new(&format!("user:{}", i), "bench")))
        .collect();

    // Warm the cache
    runtime.block_on(async {
        for (i, request) in requests.iter().enumerate() {
            let _: Option<usize> = cache
                .handle_read(request, move || async move { Ok(Some(i)) })
                .await
                .unwrap();
        }
    });

    let mut counter = 0;
    group.bench_function("cached", |b| {
        b.iter(|| {
            let request = &requests[counter % 100];
            let value: Option<usize> = runtime
                .block_on(cache.handle_read(request, || async { Ok(None) }))
                .unwrap();
            black_box(value);
            counter += 1;
        });
    });

    group.finish();
}

criterion_group!(benches, bench_bloom, bench_read_hit);
criterion_main!(benches);
