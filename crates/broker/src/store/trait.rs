use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;

use courier_core::{Attributes, Message, MessageId, TopicId};

/// Message store operation error.
///
/// The store could not give a definite answer; the broker treats this as
/// "storage unavailable" and fails closed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }
}

/// Durable, append-only message log, one log per topic.
///
/// The broker never assumes a storage technology: an object store, a log
/// service or a cloud queue can all sit behind this trait.
///
/// ## Append Semantics
///
/// `append_message()`:
/// - assigns the next sequence number of the topic (1, 2, 3, ...)
/// - returns only once the message is durable; an `Err` means nothing was stored
///
/// ## Read Semantics
///
/// `read_message()` returns `Ok(None)` for a message that has been purged.
///
/// ## Purge Semantics
///
/// `purge_expired()` drops every message of the topic whose sequence is
/// strictly below `watermark.sequence`. The broker only advances the watermark
/// past messages that every subscription has settled.
pub trait MessageStore: Send + Sync {
    fn append_message(
        &self,
        topic: TopicId,
        payload: Vec<u8>,
        attributes: Attributes,
        published_at: DateTime<Utc>,
    ) -> Result<Message, StoreError>;

    fn read_message(&self, id: MessageId) -> Result<Option<Message>, StoreError>;

    /// Returns the number of messages removed.
    fn purge_expired(&self, topic: TopicId, watermark: MessageId) -> Result<usize, StoreError>;
}

impl<S> MessageStore for Arc<S>
where
    S: MessageStore + ?Sized,
{
    fn append_message(
        &self,
        topic: TopicId,
        payload: Vec<u8>,
        attributes: Attributes,
        published_at: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        (**self).append_message(topic, payload, attributes, published_at)
    }

    fn read_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        (**self).read_message(id)
    }

    fn purge_expired(&self, topic: TopicId, watermark: MessageId) -> Result<usize, StoreError> {
        (**self).purge_expired(topic, watermark)
    }
}
