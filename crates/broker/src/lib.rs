//! `courier-broker`: the delivery engine.
//!
//! Wires the pure building blocks from `courier-core` into a running broker:
//! topics and subscriptions, at-least-once delivery with ack deadlines,
//! backoff-delayed redelivery and dead-lettering once a message runs out of
//! retries.

pub mod ack_tracker;
pub mod broker;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod pending;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod subscriber;
pub mod worker;

pub use broker::{Broker, Delivery, LeaseToken};
pub use config::{BrokerConfig, MIN_SWEEP_INTERVAL, WorkerConfig};
pub use dead_letter::{DeadLetterEntry, DeadLetterError, DeadLetterSink, InMemoryDeadLetterQueue};
pub use error::{BrokerError, BrokerResult};
pub use registry::{
    Registry, SubscriptionCounters, SubscriptionHandle, SubscriptionStats, TopicHandle,
};
pub use scheduler::{RedeliveryScheduler, SchedulerHandle, SchedulerStats, SweepReport};
pub use store::{InMemoryMessageStore, MessageStore, StoreError};
pub use subscriber::{DeliveryContext, FromMessage, Json, Subscriber, SubscriberError};
pub use worker::{Outcome, SubscriptionWorker, WorkerHandle, WorkerStats};
