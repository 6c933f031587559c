//! Criterion micro-benchmarks for the routing path.
//!
//! These benchmarks measure:
//! - murmur2 hashing and key-to-partition mapping
//! - State/event encoding through the JSON codec
//! - A full submit against the in-memory log (route, actor turn, append, commit)
//!
//! Run with: `cargo bench --bench routing_bench`

use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};
use serde::{Deserialize, Serialize};
use shardhold::engine::{
    Aggregate, Codec, Engine, EngineConfig, InMemoryLog, JsonCodec, Murmur2Partitioner,
    Partitioner, murmur2,
};
use shardhold::types::AggregateKey;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Incremented(u64);

#[derive(Debug, thiserror::Error)]
#[error("never")]
struct Never;

struct Counter;

impl Aggregate for Counter {
    type State = u64;
    type Command = u64;
    type Event = Incremented;
    type Error = Never;

    fn initial_state(&self) -> u64 {
        0
    }

    fn process_command(&self, _: &u64, amount: u64) -> Result<Vec<Incremented>, Never> {
        Ok(vec![Incremented(amount)])
    }

    fn apply_event(&self, total: u64, event: &Incremented) -> u64 {
        total + event.0
    }
}

/// Benchmark murmur2 over different key sizes.
fn bench_murmur2(c: &mut Criterion) {
    let mut group = c.benchmark_group("murmur2");

    for size in [8, 32, 128, 1_024].iter() {
        let key = vec![b'k'; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| murmur2(black_box(&key)));
        });
    }

    group.finish();
}

/// Benchmark key-to-partition mapping for typical partition counts.
fn bench_partition_of(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_of");
    let keys: Vec<AggregateKey> = (0..1_000)
        .map(|i| AggregateKey::from(format!("account-{}", i).as_str()))
        .collect();

    for partitions in [1u32, 16, 256].iter() {
        let partitioner = Murmur2Partitioner::new(*partitions);
        group.throughput(Throughput::Elements(keys.len() as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(partitions),
            partitions,
            |b, _| {
                b.iter(|| {
                    for key in &keys {
                        black_box(partitioner.partition_of(key));
                    }
                });
            },
        );
    }

    group.finish();
}

/// Benchmark the JSON codec on state and event payloads.
fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("json_codec");
    let state_codec = JsonCodec::<u64>::new();
    let event_codec = JsonCodec::<Incremented>::new();
    let encoded = event_codec.encode(&Incremented(42)).unwrap();

    group.bench_function("encode_state", |b| {
        b.iter(|| state_codec.encode(black_box(&123_456)).unwrap());
    });
    group.bench_function("encode_event", |b| {
        b.iter(|| event_codec.encode(black_box(&Incremented(42))).unwrap());
    });
    group.bench_function("decode_event", |b| {
        b.iter(|| event_codec.decode(black_box(&encoded)).unwrap());
    });

    group.finish();
}

/// Benchmark a full submit on a warm actor, and across many keys.
fn bench_submit(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap();

    let engine = runtime.block_on(async {
        let config = EngineConfig {
            engine_name: "routing-bench".to_string(),
            ..EngineConfig::default()
        };
        let engine = Engine::builder(Counter, Arc::new(InMemoryLog::new(16)))
            .config(config)
            .build()
            .unwrap();
        engine.start().await.unwrap();

        // Wait for the first assignment and warm every partition.
        for i in 0..64 {
            let key = format!("warm-{}", i);
            loop {
                if engine.submit(key.as_str(), 1).await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        }
        engine
    });

    let mut group = c.benchmark_group("submit");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_key", |b| {
        b.to_async(&runtime)
            .iter(|| async { engine.submit("warm-0", black_box(1)).await.unwrap() });
    });

    let mut next = 0usize;
    group.bench_function("round_robin_64_keys", |b| {
        b.to_async(&runtime).iter(|| {
            next = (next + 1) % 64;
            let key = format!("warm-{}", next);
            let engine = &engine;
            async move { engine.submit(key.as_str(), black_box(1)).await.unwrap() }
        });
    });

    group.finish();
    runtime.block_on(engine.stop()).unwrap();
}

criterion_group!(
    benches,
    bench_murmur2,
    bench_partition_of,
    bench_codec,
    bench_submit,
);
criterion_main!(benches);
