//! Consumer-side contract.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;

use courier_core::{Message, MessageId};

use crate::broker::Delivery;

/// Per-delivery information passed to a [`Subscriber`].
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    subscription: String,
    message_id: MessageId,
    attempt: u32,
    deadline: DateTime<Utc>,
    cancelled: Arc<AtomicBool>,
}

impl DeliveryContext {
    pub(crate) fn new(subscription: &str, delivery: &Delivery, cancelled: Arc<AtomicBool>) -> Self {
        Self {
            subscription: subscription.to_string(),
            message_id: delivery.lease.message_id,
            attempt: delivery.attempt,
            deadline: delivery.deadline,
            cancelled,
        }
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn message_id(&self) -> MessageId {
        self.message_id
    }

    /// 1 on first delivery.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Work finishing after this instant will find its lease expired.
    pub fn deadline(&self) -> DateTime<Utc> {
        self.deadline
    }

    /// Set when the owning worker is shutting down. Long-running handlers
    /// should poll it and return early.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A message handler.
///
/// Returning `Ok` acknowledges the delivery; returning `Err` nacks it and the
/// message is retried with backoff until its retry budget runs out. Handlers
/// must tolerate duplicates: delivery is at least once.
pub trait Subscriber<M>: Send + Sync {
    fn handle(&self, ctx: &DeliveryContext, message: M) -> anyhow::Result<()>;
}

impl<M, F> Subscriber<M> for F
where
    F: Fn(&DeliveryContext, M) -> anyhow::Result<()> + Send + Sync,
{
    fn handle(&self, ctx: &DeliveryContext, message: M) -> anyhow::Result<()> {
        self(ctx, message)
    }
}

/// Conversion from a raw [`Message`] into the type a subscriber consumes.
pub trait FromMessage: Sized {
    fn from_message(message: Message) -> Result<Self, SubscriberError>;
}

impl FromMessage for Message {
    fn from_message(message: Message) -> Result<Self, SubscriberError> {
        Ok(message)
    }
}

/// JSON-decoded payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Json<T>(pub T);

impl<T: DeserializeOwned> FromMessage for Json<T> {
    fn from_message(message: Message) -> Result<Self, SubscriberError> {
        message
            .decode_json()
            .map(Json)
            .map_err(|source| SubscriberError::Decode {
                message_id: message.id,
                source,
            })
    }
}

/// Why a delivery was not processed successfully.
#[derive(Debug, thiserror::Error)]
pub enum SubscriberError {
    #[error("failed to decode message {message_id}: {source}")]
    Decode {
        message_id: MessageId,
        source: serde_json::Error,
    },

    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
}
