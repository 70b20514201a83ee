use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use demand_broker::messaging::providers::{topic_matches, InMemoryBroker};
use demand_broker::messaging::{Broker, ExchangeKind, MessageEnvelope};
use serde_json::json;

fn benchmark_topic_matching(c: &mut Criterion) {
    c.bench_function("topic_match_exact", |b| {
        b.iter(|| topic_matches(black_box("order.generated"), black_box("order.generated")))
    });
    c.bench_function("topic_match_wildcards", |b| {
        b.iter(|| topic_matches(black_box("order.#.eu.*"), black_box("order.generated.west.eu.p1")))
    });
}

fn benchmark_envelope_stamping(c: &mut Criterion) {
    let payload = json!({"product_id": "P1", "total_quantity": 35, "request_ids": [1, 2, 3]});
    c.bench_function("envelope_stamp_to_bytes", |b| {
        b.iter(|| {
            MessageEnvelope::stamp(black_box(payload.clone()), "bench")
                .to_bytes()
                .ok()
        })
    });
}

fn benchmark_in_memory_publish(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().expect("tokio runtime");
    let memory = InMemoryBroker::new();
    let broker = Arc::new(Broker::new(Arc::new(memory.clone()), Duration::from_millis(10)));
    runtime.block_on(async {
        broker
            .create_exchange("bench", ExchangeKind::Topic, false)
            .await
            .expect("exchange");
        for i in 0..8 {
            let queue = format!("bench-{i}");
            broker.create_queue(&queue, false).await.expect("queue");
            broker.bind(&queue, "bench", "bench.#").await.expect("binding");
        }
    });

    c.bench_function("in_memory_publish_fanout_8", |b| {
        b.iter(|| {
            runtime.block_on(async {
                broker
                    .publish_message("bench", "bench.event", json!({"n": 1}))
                    .await
                    .ok()
            })
        })
    });
}

criterion_group!(
    benches,
    benchmark_topic_matching,
    benchmark_envelope_stamping,
    benchmark_in_memory_publish
);
criterion_main!(benches);
