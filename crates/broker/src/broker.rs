//! The broker front door: publish, deliver, ack, nack.
//!
//! ## Concurrency
//!
//! Every delivery-state change for a subscription happens under that
//! subscription's lock, so `deliver`, `ack`, `nack` and the scheduler's sweep
//! are linearizable per subscription. Whichever of ack and sweep takes a
//! record first wins; the other observes the record gone (or re-leased) and
//! reports a lease race instead of acting twice.
//!
//! Lock order is subscription queue, then topic index. `publish` is the one
//! path that takes the topic index first, and it releases it before touching
//! any subscription queue.

use std::sync::{Arc, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use courier_core::clock::deadline_after;
use courier_core::{
    Attributes, Backoff, Clock, LeaseId, Message, MessageId, SubscriptionConfig, SubscriptionId,
    SystemClock, ThreadRandom, TopicConfig,
};

use crate::ack_tracker::LeaseStatus;
use crate::config::BrokerConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::{BrokerError, BrokerResult};
use crate::registry::{Registry, SubscriptionHandle, SubscriptionStats, TopicHandle};
use crate::scheduler::{self, SweepReport};
use crate::store::MessageStore;

/// Proof of a specific delivery, required to ack, nack or extend it.
///
/// A redelivery mints a new lease id, so a token from an earlier attempt is
/// rejected with [`BrokerError::LeaseExpired`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeaseToken {
    pub subscription: SubscriptionId,
    pub message_id: MessageId,
    pub lease_id: LeaseId,
}

/// A message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message: Message,
    pub lease: LeaseToken,
    /// 1 on first delivery.
    pub attempt: u32,
    /// The lease must be settled before this instant.
    pub deadline: DateTime<Utc>,
}

/// In-process publish/subscribe broker with at-least-once delivery.
pub struct Broker<S, D> {
    store: S,
    dead_letters: D,
    registry: Registry,
    clock: Arc<dyn Clock>,
    backoff: Backoff,
    config: BrokerConfig,
}

impl<S, D> std::fmt::Debug for Broker<S, D> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("registry", &self.registry)
            .field("backoff", &self.backoff)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<S: MessageStore, D: DeadLetterSink> Broker<S, D> {
    pub fn new(store: S, dead_letters: D) -> Self {
        Self::with_config(store, dead_letters, BrokerConfig::default())
    }

    pub fn with_config(store: S, dead_letters: D, config: BrokerConfig) -> Self {
        Self {
            store,
            dead_letters,
            registry: Registry::new(),
            clock: Arc::new(SystemClock::new()),
            backoff: Backoff::new(config.jitter, ThreadRandom),
            config,
        }
    }

    /// Replace the time source. Tests drive the broker with a `ManualClock`.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the backoff calculator, e.g. to seed jitter.
    pub fn with_backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn create_topic(&self, name: &str, config: TopicConfig) -> BrokerResult<TopicHandle> {
        self.registry.create_topic(name, config)
    }

    pub fn create_subscription(
        &self,
        topic: &TopicHandle,
        name: &str,
        config: SubscriptionConfig,
    ) -> BrokerResult<SubscriptionHandle> {
        self.registry.create_subscription(topic, name, config)
    }

    pub fn topic(&self, name: &str) -> Option<TopicHandle> {
        self.registry.topic(name)
    }

    pub fn subscription(&self, name: &str) -> Option<SubscriptionHandle> {
        self.registry.subscription(name)
    }

    /// Persist a message and make it pending on every current subscription
    /// of `topic`.
    ///
    /// Fails closed: if the store rejects the append nothing is enqueued.
    #[instrument(skip(self, topic, payload, attributes), fields(topic = %topic.name()), err)]
    pub fn publish(
        &self,
        topic: &TopicHandle,
        payload: impl Into<Vec<u8>>,
        attributes: Attributes,
    ) -> BrokerResult<MessageId> {
        let state = &topic.0;
        let subscriptions = state
            .subscriptions
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();

        // Append and track under the index lock so a concurrent purge can
        // never run past a message before it is counted.
        let message = {
            let mut index = state.lock_index();
            let message = self
                .store
                .append_message(state.id, payload.into(), attributes, now)?;
            index.track(message.id, subscriptions.len());
            message
        };

        for subscription in subscriptions.iter() {
            subscription
                .lock()
                .pending
                .insert(message.id, message.published_at);
        }

        debug!(
            message_id = %message.id,
            subscriptions = subscriptions.len(),
            "message published"
        );
        Ok(message.id)
    }

    /// Serialize `value` as JSON and publish it.
    pub fn publish_json<T: Serialize>(
        &self,
        topic: &TopicHandle,
        value: &T,
        attributes: Attributes,
    ) -> BrokerResult<MessageId> {
        let payload = serde_json::to_vec(value)?;
        self.publish(topic, payload, attributes)
    }

    /// Lease the oldest eligible message on `subscription`, if any.
    ///
    /// Never blocks waiting for messages; `Ok(None)` means nothing is
    /// eligible right now. Each eligible message is handed to exactly one
    /// caller.
    pub fn deliver(&self, subscription: &SubscriptionHandle) -> BrokerResult<Option<Delivery>> {
        let sub = &subscription.0;
        let mut queue = sub.lock();
        let now = self.clock.now();

        while let Some(next) = queue.pending.take_next(now) {
            let message = match self.store.read_message(next.message_id) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    queue.tracker.remove(next.message_id);
                    queue.counters.retention_expired += 1;
                    sub.settle(next.message_id);
                    debug!(
                        subscription = %sub.name,
                        message_id = %next.message_id,
                        "message no longer in store; dropped"
                    );
                    continue;
                }
                Err(err) => {
                    // Put it back; it was eligible, so no backoff window applies.
                    queue.pending.insert(next.message_id, next.published_at);
                    warn!(
                        subscription = %sub.name,
                        message_id = %next.message_id,
                        error = %err,
                        "failed to read message for delivery"
                    );
                    return Err(err.into());
                }
            };

            let ack_deadline = sub.config.ack_deadline;
            let record = queue
                .tracker
                .register(next.message_id, next.published_at, now, ack_deadline)
                .clone();

            queue.counters.delivered += 1;
            if record.attempt_count > 1 {
                queue.counters.redelivered += 1;
            }

            debug!(
                subscription = %sub.name,
                message_id = %record.message_id,
                attempt = record.attempt_count,
                "message delivered"
            );

            return Ok(Some(Delivery {
                message,
                lease: LeaseToken {
                    subscription: sub.id,
                    message_id: record.message_id,
                    lease_id: record.lease_id,
                },
                attempt: record.attempt_count,
                deadline: record.deadline,
            }));
        }

        Ok(None)
    }

    /// Acknowledge a delivery. The message is never delivered again on this
    /// subscription.
    pub fn ack(&self, lease: &LeaseToken) -> BrokerResult<()> {
        let sub = self
            .registry
            .subscription_by_id(lease.subscription)
            .ok_or(BrokerError::UnknownSubscription(lease.subscription))?;
        let mut queue = sub.lock();
        let now = self.clock.now();

        match queue.tracker.check_lease(lease.message_id, lease.lease_id, now) {
            LeaseStatus::Active => {
                queue.tracker.remove(lease.message_id);
                queue.counters.acked += 1;
                sub.settle(lease.message_id);
                debug!(subscription = %sub.name, message_id = %lease.message_id, "message acked");
                Ok(())
            }
            LeaseStatus::Expired | LeaseStatus::Superseded => {
                debug!(
                    subscription = %sub.name,
                    message_id = %lease.message_id,
                    "ack lost the race with lease expiry"
                );
                Err(BrokerError::LeaseExpired(lease.message_id))
            }
            LeaseStatus::Unknown => Err(BrokerError::LeaseNotFound(lease.message_id)),
        }
    }

    /// Give a delivery back early.
    ///
    /// The lease expires immediately and the next sweep decides between
    /// redelivery (after backoff) and dead-lettering. A nack on a lease whose
    /// deadline already passed is a no-op.
    pub fn nack(&self, lease: &LeaseToken) -> BrokerResult<()> {
        let sub = self
            .registry
            .subscription_by_id(lease.subscription)
            .ok_or(BrokerError::UnknownSubscription(lease.subscription))?;
        let mut queue = sub.lock();
        let now = self.clock.now();

        match queue.tracker.check_lease(lease.message_id, lease.lease_id, now) {
            LeaseStatus::Active => {
                queue.tracker.expire(lease.message_id, now);
                queue.counters.nacked += 1;
                debug!(subscription = %sub.name, message_id = %lease.message_id, "message nacked");
                Ok(())
            }
            LeaseStatus::Expired => Ok(()),
            LeaseStatus::Superseded => Err(BrokerError::LeaseExpired(lease.message_id)),
            LeaseStatus::Unknown => Err(BrokerError::LeaseNotFound(lease.message_id)),
        }
    }

    /// Move the deadline of an active lease to `now + extension`.
    ///
    /// A zero extension behaves like [`Broker::nack`]. Returns the new deadline.
    pub fn modify_ack_deadline(
        &self,
        lease: &LeaseToken,
        extension: Duration,
    ) -> BrokerResult<DateTime<Utc>> {
        let sub = self
            .registry
            .subscription_by_id(lease.subscription)
            .ok_or(BrokerError::UnknownSubscription(lease.subscription))?;
        let mut queue = sub.lock();
        let now = self.clock.now();

        match queue.tracker.check_lease(lease.message_id, lease.lease_id, now) {
            LeaseStatus::Active => {
                let deadline = deadline_after(now, extension);
                queue.tracker.extend(lease.message_id, deadline);
                if extension.is_zero() {
                    queue.counters.nacked += 1;
                }
                debug!(
                    subscription = %sub.name,
                    message_id = %lease.message_id,
                    extension_ms = extension.as_millis() as u64,
                    "ack deadline modified"
                );
                Ok(deadline)
            }
            LeaseStatus::Expired | LeaseStatus::Superseded => {
                Err(BrokerError::LeaseExpired(lease.message_id))
            }
            LeaseStatus::Unknown => Err(BrokerError::LeaseNotFound(lease.message_id)),
        }
    }

    /// Run one redelivery pass over every subscription.
    ///
    /// Expired leases are either scheduled for redelivery after backoff or
    /// dead-lettered; retention-expired messages are dropped; fully settled
    /// messages are purged from the store. Failures of the store or the
    /// dead-letter destination are logged and retried on the next pass.
    pub fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        for topic in self.registry.topics() {
            for subscription in topic.subscriptions() {
                report.merge(scheduler::sweep_subscription(
                    &subscription,
                    &self.store,
                    &self.dead_letters,
                    &self.backoff,
                    now,
                ));
            }
            report.purged += scheduler::purge_settled(&topic, &self.store);
        }

        report
    }

    pub fn subscription_stats(&self, subscription: &SubscriptionHandle) -> SubscriptionStats {
        subscription.0.stats()
    }
}
