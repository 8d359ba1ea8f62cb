//! Throughput benchmarks for Relay.
//!
//! These benchmarks measure the raw item throughput of the buffering and
//! fan-out components.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use tenvis_relay_bench::stream_with_subscribers;
use tenvis_relay_core::{item, Inbox, OverflowPolicy};
use tokio::runtime::Runtime;

/// Benchmark inbox push and receive.
fn bench_inbox(c: &mut Criterion) {
    let mut group = c.benchmark_group("inbox");

    group.bench_function("push_pop", |b| {
        let inbox = Inbox::new(256, OverflowPolicy::DropOldest);
        b.iter(|| {
            inbox.push(black_box(1u64));
            inbox.try_recv()
        });
    });

    group.bench_function("push_full_drop_oldest", |b| {
        let inbox = Inbox::new(16, OverflowPolicy::DropOldest);
        for i in 0..16u64 {
            inbox.push(i);
        }
        b.iter(|| inbox.push(black_box(1u64)));
    });

    group.finish();
}

/// Benchmark fan-out to many subscribers.
fn bench_fanout(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("fanout");

    for size in [10, 100, 1000, 10000].iter() {
        group.throughput(Throughput::Elements(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, &size| {
            let (stream, _inboxes) = rt.block_on(stream_with_subscribers(size, 64));
            let payload = item(json!({"price": 101.5, "size": 3}));

            b.iter(|| rt.block_on(stream.fan_out(black_box(&payload))));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_inbox, bench_fanout);
criterion_main!(benches);
