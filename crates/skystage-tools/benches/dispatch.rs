//! Event dispatcher benchmarks.
//!
//! Delivery cost as the number of listeners for one event grows, and the
//! cost of registering and removing listeners.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use skystage_protocol::names;
use skystage_relay::EventDispatcher;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Benchmark fan-out to many listeners of one event.
fn bench_fanout(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_fanout");
    let payload = json!({
        "roomId": "show-42",
        "userId": "user-1",
        "position": { "x": 120.0, "y": 48.0 }
    });

    for size in [1, 10, 100, 1000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let dispatcher = EventDispatcher::new();
            let hits = Arc::new(AtomicU64::new(0));
            let _subs: Vec<_> = (0..size)
                .map(|_| {
                    let hits = Arc::clone(&hits);
                    dispatcher.on(names::CURSOR_MOVED, move |_| {
                        hits.fetch_add(1, Ordering::Relaxed);
                    })
                })
                .collect();

            b.iter(|| dispatcher.dispatch(black_box(names::CURSOR_MOVED), black_box(&payload)));
        });
    }

    group.finish();
}

/// Benchmark events nobody listens to.
fn bench_unheard(c: &mut Criterion) {
    let dispatcher = EventDispatcher::new();
    let _sub = dispatcher.on(names::SHOW_UPDATED, |_| {});
    let payload = json!({});

    c.bench_function("dispatch_unheard", |b| {
        b.iter(|| dispatcher.dispatch(black_box(names::CURSOR_MOVED), black_box(&payload)))
    });
}

/// Benchmark registering and dropping a listener next to existing ones.
fn bench_churn(c: &mut Criterion) {
    let dispatcher = EventDispatcher::new();
    let _existing: Vec<_> = (0..100)
        .map(|_| dispatcher.on(names::CURSOR_MOVED, |_| {}))
        .collect();

    c.bench_function("subscribe_unsubscribe", |b| {
        b.iter(|| {
            let sub = dispatcher.on(black_box(names::CURSOR_MOVED), |_| {});
            sub.unsubscribe()
        })
    });
}

criterion_group!(benches, bench_fanout, bench_unheard, bench_churn);
criterion_main!(benches);
