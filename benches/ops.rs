use std::sync::Arc;

use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use lfukit::builder::CacheBuilder;
use lfukit::cache::CacheCore;
use lfukit::traits::DirectExecutor;
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Zipf};

fn bounded(maximum: u64) -> CacheCore<u64, u64> {
    CacheBuilder::new()
        .maximum_size(maximum)
        .executor(Arc::new(DirectExecutor))
        .build::<u64, u64>()
}

fn bench_put_get(c: &mut Criterion) {
    c.bench_function("cache_put_get", |b| {
        b.iter_batched(
            || {
                let cache = bounded(1024);
                for i in 0..1024u64 {
                    cache.put(i, i);
                }
                cache.clean_up();
                cache
            },
            |cache| {
                for i in 0..1024u64 {
                    cache.put(std::hint::black_box(10_000 + i), i);
                    let _ = std::hint::black_box(cache.get_if_present(&std::hint::black_box(i)));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_read_heavy(c: &mut Criterion) {
    c.bench_function("cache_read_heavy_hits", |b| {
        b.iter_batched(
            || {
                let cache = bounded(4096);
                for i in 0..4096u64 {
                    cache.put(i, i);
                }
                cache.clean_up();
                cache
            },
            |cache| {
                for i in 0..16_384u64 {
                    let _ = std::hint::black_box(cache.get_if_present(&(i % 4096)));
                }
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_zipf_workload(c: &mut Criterion) {
    c.bench_function("cache_zipf_churn", |b| {
        let universe = 65_536u64;
        let zipf = Zipf::new(universe as f64, 1.0).unwrap();
        b.iter_batched(
            || {
                let mut rng = SmallRng::seed_from_u64(42);
                let keys: Vec<u64> = (0..32_768)
                    .map(|_| zipf.sample(&mut rng) as u64)
                    .collect();
                (bounded(4096), keys)
            },
            |(cache, keys)| {
                for key in keys {
                    match cache.get_if_present(&key) {
                        Some(value) => {
                            let _ = std::hint::black_box(value);
                        },
                        None => {
                            cache.put(key, key);
                        },
                    }
                }
                cache.clean_up();
            },
            BatchSize::SmallInput,
        )
    });
}

fn bench_contended_reads(c: &mut Criterion) {
    c.bench_function("cache_contended_reads_4_threads", |b| {
        let cache = Arc::new(bounded(4096));
        for i in 0..4096u64 {
            cache.put(i, i);
        }
        cache.clean_up();

        b.iter(|| {
            let mut rng = SmallRng::seed_from_u64(7);
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    let cache = Arc::clone(&cache);
                    let base: u64 = rng.random_range(0..4096);
                    std::thread::spawn(move || {
                        for i in 0..4096u64 {
                            let _ = std::hint::black_box(
                                cache.get_if_present(&((base + i) % 4096)),
                            );
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        })
    });
}

criterion_group!(
    benches,
    bench_put_get,
    bench_read_heavy,
    bench_zipf_workload,
    bench_contended_reads
);
criterion_main!(benches);
