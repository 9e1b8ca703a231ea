//! End-to-end retry, dead-letter and retention behaviour driven by a manual clock.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use proptest::prelude::*;

use courier_broker::{
    Broker, BrokerError, InMemoryDeadLetterQueue, InMemoryMessageStore, SubscriptionHandle,
    TopicHandle,
};
use courier_core::clock::elapsed_between;
use courier_core::{
    Attributes, Backoff, Clock, ManualClock, MaxRetries, RetryPolicy, SubscriptionConfig,
    TopicConfig,
};

type TestBroker = Broker<Arc<InMemoryMessageStore>, Arc<InMemoryDeadLetterQueue>>;

struct Harness {
    broker: TestBroker,
    clock: Arc<ManualClock>,
    dlq: Arc<InMemoryDeadLetterQueue>,
    topic: TopicHandle,
    sub: SubscriptionHandle,
}

fn harness(policy: RetryPolicy) -> Harness {
    courier_observability::init_for_tests();

    let clock = Arc::new(ManualClock::starting_now());
    let dlq = InMemoryDeadLetterQueue::arc();
    let broker = Broker::new(Arc::new(InMemoryMessageStore::new()), dlq.clone())
        .with_clock(clock.clone())
        .with_backoff(Backoff::exact());
    let topic = broker.create_topic("payments", TopicConfig::default()).unwrap();
    let sub = broker
        .create_subscription(
            &topic,
            "settlement",
            SubscriptionConfig::new(Duration::from_secs(30)).with_retry_policy(policy),
        )
        .unwrap();
    Harness {
        broker,
        clock,
        dlq,
        topic,
        sub,
    }
}

/// Deliver whenever possible, always fail, sweep, and step the clock one
/// second at a time. Returns the instants at which deliveries happened.
fn fail_until_dead_lettered(h: &Harness, max_steps: usize) -> Vec<DateTime<Utc>> {
    let mut deliveries = Vec::new();
    for _ in 0..max_steps {
        if let Some(delivery) = h.broker.deliver(&h.sub).unwrap() {
            assert_eq!(delivery.attempt as usize, deliveries.len() + 1);
            deliveries.push(h.clock.now());
            h.broker.nack(&delivery.lease).unwrap();
        }
        h.broker.sweep();
        if !h.dlq.is_empty() {
            break;
        }
        h.clock.advance(Duration::from_secs(1));
    }
    deliveries
}

#[test]
fn three_retries_then_dead_letter_with_exponential_gaps() {
    let policy = RetryPolicy::new(
        Duration::from_secs(10),
        Duration::from_secs(600),
        MaxRetries::finite(3),
    );
    let h = harness(policy);
    h.broker
        .publish(&h.topic, b"charge-42".to_vec(), Attributes::new())
        .unwrap();

    let deliveries = fail_until_dead_lettered(&h, 1_000);

    assert_eq!(deliveries.len(), 3);
    let gaps: Vec<Duration> = deliveries
        .windows(2)
        .map(|w| elapsed_between(w[0], w[1]))
        .collect();
    assert_eq!(gaps, vec![Duration::from_secs(10), Duration::from_secs(20)]);

    let entries = h.dlq.list("settlement");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].attempt_count, 3);
    assert_eq!(entries[0].message.payload, b"charge-42");

    // Terminal: never delivered again.
    h.clock.advance(Duration::from_secs(3600));
    h.broker.sweep();
    assert!(h.broker.deliver(&h.sub).unwrap().is_none());
}

#[test]
fn infinite_retries_keep_redelivering_at_capped_backoff() {
    let policy = RetryPolicy::new(
        Duration::from_secs(10),
        Duration::from_secs(60),
        MaxRetries::Infinite,
    );
    let h = harness(policy);
    h.broker.publish(&h.topic, b"x".to_vec(), Attributes::new()).unwrap();

    let deliveries = fail_until_dead_lettered(&h, 2_000);

    assert!(h.dlq.is_empty());
    assert!(deliveries.len() > 10);
    let [.., second_last, last] = deliveries.as_slice() else {
        panic!("expected at least two deliveries");
    };
    let last_gap = elapsed_between(*second_last, *last);
    assert_eq!(last_gap, Duration::from_secs(60));
}

#[test]
fn no_retries_dead_letters_after_single_attempt() {
    let h = harness(RetryPolicy::no_retries());
    h.broker.publish(&h.topic, b"x".to_vec(), Attributes::new()).unwrap();

    let deliveries = fail_until_dead_lettered(&h, 100);

    assert_eq!(deliveries.len(), 1);
    assert_eq!(h.dlq.list("settlement")[0].attempt_count, 1);
    assert!(h.broker.deliver(&h.sub).unwrap().is_none());
}

#[test]
fn unset_policy_dead_letters_after_default_budget() {
    let policy = RetryPolicy::new(
        Duration::from_secs(1),
        Duration::from_secs(1),
        MaxRetries::UseDefault,
    );
    let h = harness(policy);
    h.broker.publish(&h.topic, b"x".to_vec(), Attributes::new()).unwrap();

    let deliveries = fail_until_dead_lettered(&h, 10_000);

    assert_eq!(deliveries.len(), 100);
    assert_eq!(h.dlq.list("settlement")[0].attempt_count, 100);
}

#[test]
fn expired_lease_is_redelivered_without_nack() {
    let h = harness(RetryPolicy::default());
    h.broker.publish(&h.topic, b"x".to_vec(), Attributes::new()).unwrap();

    let first = h.broker.deliver(&h.sub).unwrap().unwrap();
    // The consumer vanished: no ack, no nack.
    h.clock.advance(Duration::from_secs(30));
    let report = h.broker.sweep();
    assert_eq!(report.expired, 1);
    assert_eq!(report.redelivery_scheduled, 1);

    h.clock.advance(Duration::from_secs(10));
    let second = h.broker.deliver(&h.sub).unwrap().unwrap();
    assert_eq!(second.attempt, 2);

    let late = h.broker.ack(&first.lease).unwrap_err();
    assert!(matches!(late, BrokerError::LeaseExpired(_)));
    h.broker.ack(&second.lease).unwrap();
}

#[test]
fn acked_message_is_never_redelivered() {
    let h = harness(RetryPolicy::default());
    h.broker.publish(&h.topic, b"x".to_vec(), Attributes::new()).unwrap();

    let delivery = h.broker.deliver(&h.sub).unwrap().unwrap();
    h.broker.ack(&delivery.lease).unwrap();

    for _ in 0..10 {
        h.clock.advance(Duration::from_secs(600));
        h.broker.sweep();
        assert!(h.broker.deliver(&h.sub).unwrap().is_none());
    }
    let stats = h.broker.subscription_stats(&h.sub);
    assert_eq!(stats.counters.delivered, 1);
    assert_eq!(stats.counters.redelivered, 0);
}

#[test]
fn retention_expiry_drops_waiting_redelivery() {
    let clock = Arc::new(ManualClock::starting_now());
    let broker = Broker::new(Arc::new(InMemoryMessageStore::new()), InMemoryDeadLetterQueue::arc())
        .with_clock(clock.clone())
        .with_backoff(Backoff::exact());
    let topic = broker.create_topic("payments", TopicConfig::default()).unwrap();
    let sub = broker
        .create_subscription(
            &topic,
            "settlement",
            SubscriptionConfig::new(Duration::from_secs(10))
                .with_retention(Duration::from_secs(60))
                .with_retry_policy(RetryPolicy::new(
                    Duration::from_secs(120),
                    Duration::from_secs(600),
                    MaxRetries::Infinite,
                )),
        )
        .unwrap();
    broker.publish(&topic, b"x".to_vec(), Attributes::new()).unwrap();

    let delivery = broker.deliver(&sub).unwrap().unwrap();
    broker.nack(&delivery.lease).unwrap();
    broker.sweep();

    // Backoff (120s) outlasts retention (60s).
    clock.advance(Duration::from_secs(61));
    let report = broker.sweep();
    assert_eq!(report.retention_expired, 1);

    clock.advance(Duration::from_secs(120));
    assert!(broker.deliver(&sub).unwrap().is_none());
    assert_eq!(broker.subscription_stats(&sub).counters.retention_expired, 1);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn dead_letter_attempt_count_matches_budget(max_retries in 1u32..12) {
        let policy = RetryPolicy::new(
            Duration::from_secs(1),
            Duration::from_secs(4),
            MaxRetries::finite(max_retries),
        );
        let h = harness(policy);
        h.broker.publish(&h.topic, b"x".to_vec(), Attributes::new()).unwrap();

        let deliveries = fail_until_dead_lettered(&h, 1_000);

        prop_assert_eq!(deliveries.len() as u32, max_retries);
        let entries = h.dlq.list("settlement");
        prop_assert_eq!(entries.len(), 1);
        prop_assert_eq!(entries[0].attempt_count, max_retries);
    }
}
