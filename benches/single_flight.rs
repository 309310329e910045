use criterion::Criterion;
use criterion::{criterion_group, criterion_main};
use futures::future::join_all;
use tokio::runtime;

use single_flight_cache::constants_for_benchmarking::{BURST, GET_MANY, KEYS};
use single_flight_cache::SingleFlightCache;

// Stands in for a call to another service, it yields once so concurrent callers pile up
async fn fetch(value: usize) -> usize {
    tokio::task::yield_now().await;
    value
}

async fn burst_one_key() {
    let cache: SingleFlightCache<usize, usize> = SingleFlightCache::new();

    join_all((0..BURST).map(|_| cache.get_or_insert(0, || fetch(105)))).await;
}

async fn burst_split_keys() {
    let cache: SingleFlightCache<usize, usize> = SingleFlightCache::new();

    join_all((0..BURST).map(|i| {
        let key = i % KEYS;
        cache.get_or_insert(key, move || fetch(100 + key))
    }))
    .await;
}

async fn get_or_insert_many(cache: &SingleFlightCache<usize, usize>) {
    for i in 0..GET_MANY {
        cache.get_or_insert(i, || async move { i }).await;
    }
}

fn bencher(c: &mut Criterion) {
    let rt = runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    c.bench_function("single flight burst on one key", |b| b.to_async(&rt).iter(burst_one_key));

    c.bench_function("single flight burst split across keys", |b| {
        b.to_async(&rt).iter(burst_split_keys)
    });

    let cache = SingleFlightCache::new();
    rt.block_on(get_or_insert_many(&cache));

    c.bench_function("single flight resolved lookups", |b| {
        b.to_async(&rt).iter(|| get_or_insert_many(&cache))
    });
}

criterion_group!(benches, bencher);
criterion_main!(benches);
