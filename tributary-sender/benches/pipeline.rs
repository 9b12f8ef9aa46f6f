//! Send pipeline throughput against the in-memory mock cluster.
//!
//! Measures end-to-end cost per record (serialization, dispatch through the
//! producer worker, acknowledgement and result delivery) for several
//! in-flight limits and batch sizes.

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use futures::StreamExt;
use tokio::runtime::Runtime;
use tributary_core::prelude::*;
use tributary_sender::KafkaSender;
use tributary_testkit::{MockCluster, MockProducerFactory};

const TOPIC: &str = "bench";

/// In-flight limits to compare.
const IN_FLIGHT_LIMITS: &[usize] = &[1, 16, 256];

/// Records per pipeline.
const BATCH_SIZES: &[usize] = &[100, 1000];

fn sender(runtime: &Runtime, max_in_flight: usize) -> KafkaSender<i32, String> {
    let factory = MockProducerFactory::new(MockCluster::new().with_topic(TOPIC, 8));
    let options = SenderOptions::new()
        .with_key_serializer(IntegerSerializer)
        .with_value_serializer(StringSerializer)
        .with_max_in_flight(max_in_flight)
        .with_scheduler(runtime.handle().clone());
    KafkaSender::create(factory, options).expect("valid benchmark options")
}

fn batch(size: usize) -> Vec<SenderRecord<i32, String, usize>> {
    (0..size)
        .map(|i| {
            let key = i32::try_from(i).unwrap_or(i32::MAX);
            SenderRecord::create(ProducerRecord::new(TOPIC, "x".repeat(256)).with_key(key), i)
        })
        .collect()
}

fn bench_pipeline_throughput(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("pipeline_throughput");

    for &limit in IN_FLIGHT_LIMITS {
        for &size in BATCH_SIZES {
            let sender = sender(&rt, limit);
            group.throughput(Throughput::Elements(size as u64));
            group.bench_with_input(
                BenchmarkId::new(format!("max_in_flight_{limit}"), size),
                &size,
                |b, &size| {
                    b.to_async(&rt).iter(|| async {
                        let results = sender.send_all(batch(size)).count().await;
                        criterion::black_box(results)
                    });
                },
            );
            rt.block_on(sender.close()).expect("close benchmark sender");
        }
    }

    group.finish();
}

fn bench_serialization(c: &mut Criterion) {
    let mut group = c.benchmark_group("serializers");

    group.bench_function("json_payload", |b| {
        let serializer = JsonSerializer::<Vec<u32>>::new();
        let payload: Vec<u32> = (0..64).collect();
        b.iter(|| criterion::black_box(serializer.serialize(TOPIC, &payload)));
    });

    group.bench_function("string_payload", |b| {
        let payload = "x".repeat(1024);
        b.iter(|| criterion::black_box(StringSerializer.serialize(TOPIC, &payload)));
    });

    group.finish();
}

criterion_group!(benches, bench_pipeline_throughput, bench_serialization);
criterion_main!(benches);
