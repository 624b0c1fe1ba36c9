//! Throughput Benchmark for slsm
//!
//! Measures the store facade over an in-memory substrate under various
//! workloads.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use serde_json::{json, Value};
use slsm::{
    Compression, ItemConfig, ManualClock, ManualScheduler, MemoryBackend, Scheduler, Store,
    StoreConfig, SyncPolicy,
};
use std::sync::Arc;
use std::time::Duration;

const ITEMS: usize = 1_000;

fn store_with(items: impl IntoIterator<Item = ItemConfig>) -> (Store, Arc<ManualScheduler>) {
    let clock = ManualClock::new(1_800_000_000_000);
    let scheduler = Arc::new(ManualScheduler::new(clock.clone()));
    let config = StoreConfig::builder()
        .persistent(MemoryBackend::new())
        .clock(clock)
        .scheduler(scheduler.clone() as Arc<dyn Scheduler>)
        .housekeeping(false)
        .build()
        .unwrap();
    (Store::new(config, items), scheduler)
}

fn plain_items() -> Vec<ItemConfig> {
    (0..ITEMS)
        .map(|i| ItemConfig::new(format!("item:{}", i), json!("")))
        .collect()
}

/// Benchmark SET operations
fn bench_set(c: &mut Criterion) {
    let (store, _scheduler) = store_with(plain_items());

    let mut group = c.benchmark_group("set");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_small", |b| {
        let mut i = 0usize;
        b.iter(|| {
            let name = format!("item:{}", i % ITEMS);
            store.set(&name, json!(format!("value:{}", i))).unwrap();
            i += 1;
        });
    });

    group.bench_function("set_medium", |b| {
        let mut i = 0usize;
        let value = "x".repeat(1024); // 1KB value
        b.iter(|| {
            let name = format!("item:{}", i % ITEMS);
            store.set(&name, json!(format!("{}{}", value, i))).unwrap();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark GET operations
fn bench_get(c: &mut Criterion) {
    let local = MemoryBackend::new();
    for i in 0..ITEMS {
        use slsm::Backend;
        local
            .set_item(&format!("slsm||item:{}", i), &format!("\"value:{}\"", i))
            .unwrap();
    }

    let mut group = c.benchmark_group("get");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_cached", |b| {
        let (store, _scheduler) = store_with(plain_items());
        for i in 0..ITEMS {
            store.set(&format!("item:{}", i), json!("warm")).unwrap();
        }
        let mut i = 0usize;
        b.iter(|| {
            black_box(store.get(&format!("item:{}", i % ITEMS)).unwrap());
            i += 1;
        });
    });

    group.bench_function("get_cold", |b| {
        b.iter_batched(
            || {
                let clock = ManualClock::new(1_800_000_000_000);
                let config = StoreConfig::builder()
                    .persistent(local.clone())
                    .clock(clock.clone())
                    .scheduler(Arc::new(ManualScheduler::new(clock)) as Arc<dyn Scheduler>)
                    .housekeeping(false)
                    .build()
                    .unwrap();
                Store::new(config, plain_items())
            },
            |store| {
                for i in 0..ITEMS {
                    black_box(store.get(&format!("item:{}", i)).unwrap());
                }
            },
            criterion::BatchSize::SmallInput,
        );
    });

    group.finish();
}

/// Benchmark writes that pass through the TTL and pruning engines
fn bench_policies(c: &mut Criterion) {
    let keep_last = |v: Value| match v {
        Value::Array(items) => {
            let skip = items.len().saturating_sub(50);
            Value::Array(items.into_iter().skip(skip).collect())
        }
        other => other,
    };
    let (store, _scheduler) = store_with([
        ItemConfig::new("ttl", json!(0)).ttl(Duration::from_secs(3600)),
        ItemConfig::new("pruned", json!([])).prune(keep_last),
        ItemConfig::new("compressed", json!("")).compress(Compression::zstd()),
    ]);

    let mut group = c.benchmark_group("policies");
    group.throughput(Throughput::Elements(1));

    group.bench_function("set_with_ttl", |b| {
        let mut i = 0u64;
        b.iter(|| {
            store.set("ttl", json!(i + 1)).unwrap();
            i += 1;
        });
    });

    group.bench_function("produce_pruned", |b| {
        let mut i = 0u64;
        b.iter(|| {
            store
                .produce("pruned", |v| {
                    if let Some(items) = v.as_array_mut() {
                        items.push(json!(i));
                    }
                })
                .unwrap();
            i += 1;
        });
    });

    group.bench_function("set_compressed", |b| {
        let text = "lorem ipsum dolor sit amet ".repeat(64);
        let mut i = 0u64;
        b.iter(|| {
            store
                .set("compressed", json!(format!("{}{}", text, i)))
                .unwrap();
            i += 1;
        });
    });

    group.finish();
}

/// Benchmark debounced writes (mutations coalesced into one flush)
fn bench_debounce(c: &mut Criterion) {
    let (store, scheduler) = store_with([ItemConfig::new("draft", json!(""))
        .sync(SyncPolicy::debounce(Duration::from_millis(300)))]);

    let mut group = c.benchmark_group("debounce");
    group.throughput(Throughput::Elements(100));

    group.bench_function("100_sets_one_flush", |b| {
        let mut i = 0u64;
        b.iter(|| {
            for _ in 0..100 {
                store.set("draft", json!(format!("draft {}", i))).unwrap();
                i += 1;
            }
            scheduler.advance(Duration::from_millis(300));
        });
    });

    group.finish();
}

/// Benchmark concurrent access
fn bench_concurrent(c: &mut Criterion) {
    use std::thread;

    let mut group = c.benchmark_group("concurrent");
    group.measurement_time(Duration::from_secs(10));

    group.bench_function("4_threads_mixed", |b| {
        b.iter(|| {
            let (store, _scheduler) = store_with(plain_items());
            let handles: Vec<_> = (0..4)
                .map(|t| {
                    let store = store.clone();
                    thread::spawn(move || {
                        for i in 0..2_500 {
                            let name = format!("item:{}", (t * 250 + i) % ITEMS);
                            store.set(&name, json!(i)).unwrap();
                            black_box(store.get(&name).unwrap());
                        }
                    })
                })
                .collect();

            for handle in handles {
                handle.join().unwrap();
            }

            black_box(store.stats());
        });
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_set,
    bench_get,
    bench_policies,
    bench_debounce,
    bench_concurrent,
);

criterion_main!(benches);
