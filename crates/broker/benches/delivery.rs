use criterion::{
    BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main,
};

use std::sync::Arc;
use std::time::Duration;

use courier_broker::{
    Broker, InMemoryDeadLetterQueue, InMemoryMessageStore, SubscriptionHandle, TopicHandle,
};
use courier_core::backoff::next_delay;
use courier_core::{
    Attributes, ManualClock, MaxRetries, RetryPolicy, SubscriptionConfig, TopicConfig,
};

type BenchBroker = Broker<Arc<InMemoryMessageStore>, Arc<InMemoryDeadLetterQueue>>;

fn broker_with_subscriptions(count: usize) -> (BenchBroker, TopicHandle, Vec<SubscriptionHandle>) {
    let broker = Broker::new(
        Arc::new(InMemoryMessageStore::new()),
        InMemoryDeadLetterQueue::arc(),
    );
    let topic = broker.create_topic("bench", TopicConfig::default()).unwrap();
    let subs = (0..count)
        .map(|i| {
            broker
                .create_subscription(&topic, &format!("sub-{i}"), SubscriptionConfig::default())
                .unwrap()
        })
        .collect();
    (broker, topic, subs)
}

/// One message through publish, deliver and ack on every subscription.
fn bench_publish_deliver_ack(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_deliver_ack");

    for fan_out in [1usize, 4, 16].iter() {
        group.throughput(Throughput::Elements(*fan_out as u64));
        group.bench_with_input(BenchmarkId::new("fan_out", fan_out), fan_out, |b, &n| {
            let (broker, topic, subs) = broker_with_subscriptions(n);
            let payload = vec![0u8; 256];

            b.iter(|| {
                broker.publish(&topic, payload.clone(), Attributes::new()).unwrap();
                for sub in &subs {
                    let delivery = broker.deliver(sub).unwrap().unwrap();
                    broker.ack(&delivery.lease).unwrap();
                }
                black_box(broker.sweep());
            });
        });
    }

    group.finish();
}

/// Sweep cost with many expired leases waiting to be rescheduled.
fn bench_sweep_expired(c: &mut Criterion) {
    let mut group = c.benchmark_group("sweep_expired");
    group.sample_size(20);

    for backlog in [100usize, 1_000, 10_000].iter() {
        group.throughput(Throughput::Elements(*backlog as u64));
        group.bench_with_input(BenchmarkId::new("backlog", backlog), backlog, |b, &n| {
            b.iter_batched(
                || {
                    let clock = Arc::new(ManualClock::starting_now());
                    let broker = Broker::new(
                        Arc::new(InMemoryMessageStore::new()),
                        InMemoryDeadLetterQueue::arc(),
                    )
                    .with_clock(clock.clone());
                    let topic = broker.create_topic("bench", TopicConfig::default()).unwrap();
                    let sub = broker
                        .create_subscription(
                            &topic,
                            "sweep",
                            SubscriptionConfig::new(Duration::from_secs(1)),
                        )
                        .unwrap();
                    for _ in 0..n {
                        broker.publish(&topic, b"x".to_vec(), Attributes::new()).unwrap();
                        broker.deliver(&sub).unwrap();
                    }
                    clock.advance(Duration::from_secs(2));
                    broker
                },
                |broker| black_box(broker.sweep()),
                criterion::BatchSize::LargeInput,
            );
        });
    }

    group.finish();
}

fn bench_next_delay(c: &mut Criterion) {
    let policy = RetryPolicy::new(
        Duration::from_secs(10),
        Duration::from_secs(600),
        MaxRetries::Infinite,
    );
    c.bench_function("next_delay", |b| {
        b.iter(|| {
            for attempt in 0..64u32 {
                black_box(next_delay(black_box(attempt), &policy));
            }
        });
    });
}

criterion_group!(
    benches,
    bench_publish_deliver_ack,
    bench_sweep_expired,
    bench_next_delay
);
criterion_main!(benches);
