//! Topic/subscription registry.
//!
//! Topics and subscriptions are validated once and frozen: handles expose
//! their configuration read-only and there is no API to change it. The only
//! mutable state hanging off a subscription is its delivery queue, guarded by
//! a per-subscription mutex so subscriptions never block each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tracing::info;

use courier_core::{
    MessageId, RetryPolicy, SubscriptionConfig, SubscriptionId, TopicConfig, TopicId,
    validate_name,
};

use crate::ack_tracker::AckTracker;
use crate::error::{BrokerError, BrokerResult};
use crate::pending::PendingIndex;
use crate::store::TopicIndex;

/// Cumulative per-subscription counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionCounters {
    pub delivered: u64,
    pub redelivered: u64,
    pub acked: u64,
    pub nacked: u64,
    pub dead_lettered: u64,
    pub retention_expired: u64,
}

/// Point-in-time view of a subscription.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SubscriptionStats {
    /// Waiting for delivery, including those inside a backoff window.
    pub pending: usize,
    /// Inside a backoff window.
    pub delayed: usize,
    /// Holding a lease.
    pub in_flight: usize,
    pub counters: SubscriptionCounters,
}

/// Mutable delivery state of one subscription.
#[derive(Debug, Default)]
pub(crate) struct SubscriptionQueue {
    pub(crate) pending: PendingIndex,
    pub(crate) tracker: AckTracker,
    pub(crate) counters: SubscriptionCounters,
}

#[derive(Debug)]
pub(crate) struct SubscriptionState {
    pub(crate) id: SubscriptionId,
    pub(crate) name: String,
    pub(crate) topic_id: TopicId,
    pub(crate) topic_name: String,
    pub(crate) config: SubscriptionConfig,
    pub(crate) retry_policy: RetryPolicy,
    topic_index: Arc<Mutex<TopicIndex>>,
    queue: Mutex<SubscriptionQueue>,
}

impl SubscriptionState {
    pub(crate) fn lock(&self) -> MutexGuard<'_, SubscriptionQueue> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record that this subscription is done with `id`.
    ///
    /// Called with the queue lock held; the topic index lock is always taken
    /// after a queue lock, never before.
    pub(crate) fn settle(&self, id: MessageId) {
        self.topic_index
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .settle(id);
    }

    pub(crate) fn stats(&self) -> SubscriptionStats {
        let queue = self.lock();
        SubscriptionStats {
            pending: queue.pending.len(),
            delayed: queue.pending.delayed(),
            in_flight: queue.tracker.in_flight(),
            counters: queue.counters,
        }
    }
}

#[derive(Debug)]
pub(crate) struct TopicState {
    pub(crate) id: TopicId,
    pub(crate) name: String,
    pub(crate) config: TopicConfig,
    pub(crate) index: Arc<Mutex<TopicIndex>>,
    pub(crate) subscriptions: RwLock<Vec<Arc<SubscriptionState>>>,
}

impl TopicState {
    pub(crate) fn lock_index(&self) -> MutexGuard<'_, TopicIndex> {
        self.index.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn subscriptions(&self) -> Vec<Arc<SubscriptionState>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Handle to a registered topic.
#[derive(Debug, Clone)]
pub struct TopicHandle(pub(crate) Arc<TopicState>);

impl TopicHandle {
    pub fn id(&self) -> TopicId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn config(&self) -> &TopicConfig {
        &self.0.config
    }
}

/// Handle to a registered subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionHandle(pub(crate) Arc<SubscriptionState>);

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.0.id
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn topic_id(&self) -> TopicId {
        self.0.topic_id
    }

    pub fn topic_name(&self) -> &str {
        &self.0.topic_name
    }

    pub fn config(&self) -> &SubscriptionConfig {
        &self.0.config
    }

    /// Retry policy with defaults substituted.
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.0.retry_policy
    }
}

#[derive(Debug, Default)]
struct SubscriptionTable {
    by_name: HashMap<String, SubscriptionId>,
    by_id: HashMap<SubscriptionId, Arc<SubscriptionState>>,
}

/// Holds every declared topic and subscription.
#[derive(Debug, Default)]
pub struct Registry {
    topics: RwLock<HashMap<String, Arc<TopicState>>>,
    subscriptions: RwLock<SubscriptionTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate `config` and register a new topic.
    pub fn create_topic(&self, name: &str, config: TopicConfig) -> BrokerResult<TopicHandle> {
        validate_name(name)?;
        config.validate()?;

        let mut topics = self.topics.write().unwrap_or_else(PoisonError::into_inner);
        if topics.contains_key(name) {
            return Err(BrokerError::TopicExists(name.to_string()));
        }

        let id = TopicId::new();
        let state = Arc::new(TopicState {
            id,
            name: name.to_string(),
            config,
            index: Arc::new(Mutex::new(TopicIndex::new(id))),
            subscriptions: RwLock::new(Vec::new()),
        });
        topics.insert(name.to_string(), state.clone());

        info!(topic = name, topic_id = %id, "topic created");
        Ok(TopicHandle(state))
    }

    /// Validate `config` and register a new subscription on `topic`.
    ///
    /// The subscription only sees messages published after this call returns.
    pub fn create_subscription(
        &self,
        topic: &TopicHandle,
        name: &str,
        config: SubscriptionConfig,
    ) -> BrokerResult<SubscriptionHandle> {
        validate_name(name)?;
        config.validate()?;

        let mut table = self.subscriptions.write().unwrap_or_else(PoisonError::into_inner);
        if table.by_name.contains_key(name) {
            return Err(BrokerError::SubscriptionExists(name.to_string()));
        }

        let topic_state = &topic.0;
        let id = SubscriptionId::new();
        let state = Arc::new(SubscriptionState {
            id,
            name: name.to_string(),
            topic_id: topic_state.id,
            topic_name: topic_state.name.clone(),
            retry_policy: config.effective_retry_policy(),
            config,
            topic_index: topic_state.index.clone(),
            queue: Mutex::new(SubscriptionQueue::default()),
        });

        topic_state
            .subscriptions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(state.clone());
        table.by_name.insert(name.to_string(), id);
        table.by_id.insert(id, state.clone());

        info!(
            topic = %topic_state.name,
            subscription = name,
            ack_deadline_ms = state.config.ack_deadline.as_millis() as u64,
            max_retries = i64::from(state.retry_policy.max_retries),
            "subscription created"
        );
        Ok(SubscriptionHandle(state))
    }

    pub fn topic(&self, name: &str) -> Option<TopicHandle> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .cloned()
            .map(TopicHandle)
    }

    pub fn subscription(&self, name: &str) -> Option<SubscriptionHandle> {
        let table = self.subscriptions.read().unwrap_or_else(PoisonError::into_inner);
        table
            .by_name
            .get(name)
            .and_then(|id| table.by_id.get(id))
            .cloned()
            .map(SubscriptionHandle)
    }

    pub(crate) fn subscription_by_id(&self, id: SubscriptionId) -> Option<Arc<SubscriptionState>> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .get(&id)
            .cloned()
    }

    pub(crate) fn topics(&self) -> Vec<Arc<TopicState>> {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Smallest ack deadline across registered subscriptions.
    pub fn min_ack_deadline(&self) -> Option<Duration> {
        self.subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .by_id
            .values()
            .map(|s| s.config.ack_deadline)
            .min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{ConfigError, DeliveryGuarantee};

    #[test]
    fn creates_topics_and_subscriptions() {
        let registry = Registry::new();
        let topic = registry.create_topic("orders", TopicConfig::default()).unwrap();
        let sub = registry
            .create_subscription(&topic, "billing", SubscriptionConfig::new(Duration::from_secs(5)))
            .unwrap();

        assert_eq!(sub.topic_id(), topic.id());
        assert_eq!(registry.topic("orders").unwrap().id(), topic.id());
        assert_eq!(registry.subscription("billing").unwrap().id(), sub.id());
        assert_eq!(registry.min_ack_deadline(), Some(Duration::from_secs(5)));
        assert_eq!(topic.0.subscriptions().len(), 1);
    }

    #[test]
    fn rejects_invalid_and_duplicate_declarations() {
        let registry = Registry::new();

        let err = registry
            .create_topic(
                "orders",
                TopicConfig {
                    delivery_guarantee: DeliveryGuarantee::ExactlyOnce,
                    ordering_key: None,
                },
            )
            .unwrap_err();
        assert!(matches!(
            err,
            BrokerError::InvalidConfig(ConfigError::UnsupportedDeliveryGuarantee(_))
        ));
        // Nothing was registered by the failed call.
        assert!(registry.topic("orders").is_none());

        let topic = registry.create_topic("orders", TopicConfig::default()).unwrap();
        assert!(matches!(
            registry.create_topic("orders", TopicConfig::default()),
            Err(BrokerError::TopicExists(_))
        ));

        assert!(matches!(
            registry.create_subscription(
                &topic,
                "billing",
                SubscriptionConfig::new(Duration::ZERO),
            ),
            Err(BrokerError::InvalidConfig(ConfigError::NonPositiveAckDeadline))
        ));
        assert!(registry.subscription("billing").is_none());
        assert!(topic.0.subscriptions().is_empty());

        registry
            .create_subscription(&topic, "billing", SubscriptionConfig::default())
            .unwrap();
        assert!(matches!(
            registry.create_subscription(&topic, "billing", SubscriptionConfig::default()),
            Err(BrokerError::SubscriptionExists(_))
        ));
    }

    #[test]
    fn rejects_bad_names() {
        let registry = Registry::new();
        assert!(matches!(
            registry.create_topic("bad name", TopicConfig::default()),
            Err(BrokerError::InvalidConfig(ConfigError::InvalidName(_)))
        ));
    }
}
