use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};

use chrono::{DateTime, Utc};

use courier_core::{Attributes, Message, MessageId, TopicId};

use super::r#trait::{MessageStore, StoreError};

#[derive(Debug, Default)]
struct TopicLog {
    next_sequence: u64,
    messages: BTreeMap<u64, Message>,
}

/// In-memory append-only message store.
///
/// Intended for tests/dev. `set_available(false)` makes every call fail with
/// [`StoreError::Unavailable`], which is how fail-closed behaviour is tested.
#[derive(Debug)]
pub struct InMemoryMessageStore {
    topics: RwLock<HashMap<TopicId, TopicLog>>,
    available: AtomicBool,
}

impl InMemoryMessageStore {
    pub fn new() -> Self {
        Self {
            topics: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of messages currently retained for `topic`.
    pub fn len(&self, topic: TopicId) -> usize {
        self.topics
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, |log| log.messages.len())
    }

    pub fn is_empty(&self, topic: TopicId) -> bool {
        self.len(topic) == 0
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::unavailable("in-memory store marked unavailable"))
        }
    }
}

impl Default for InMemoryMessageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageStore for InMemoryMessageStore {
    fn append_message(
        &self,
        topic: TopicId,
        payload: Vec<u8>,
        attributes: Attributes,
        published_at: DateTime<Utc>,
    ) -> Result<Message, StoreError> {
        self.check_available()?;

        let mut topics = self
            .topics
            .write()
            .map_err(|_| StoreError::unavailable("lock poisoned"))?;
        let log = topics.entry(topic).or_default();

        log.next_sequence += 1;
        let message = Message {
            id: MessageId::new(topic, log.next_sequence),
            payload,
            attributes,
            published_at,
        };
        log.messages.insert(log.next_sequence, message.clone());

        Ok(message)
    }

    fn read_message(&self, id: MessageId) -> Result<Option<Message>, StoreError> {
        self.check_available()?;

        let topics = self
            .topics
            .read()
            .map_err(|_| StoreError::unavailable("lock poisoned"))?;

        Ok(topics
            .get(&id.topic)
            .and_then(|log| log.messages.get(&id.sequence))
            .cloned())
    }

    fn purge_expired(&self, topic: TopicId, watermark: MessageId) -> Result<usize, StoreError> {
        self.check_available()?;

        let mut topics = self
            .topics
            .write()
            .map_err(|_| StoreError::unavailable("lock poisoned"))?;

        let Some(log) = topics.get_mut(&topic) else {
            return Ok(0);
        };

        // Keep everything at or above the watermark.
        let kept = log.messages.split_off(&watermark.sequence);
        let purged = log.messages.len();
        log.messages = kept;

        Ok(purged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn append(store: &InMemoryMessageStore, topic: TopicId, body: &str) -> Message {
        store
            .append_message(topic, body.as_bytes().to_vec(), Attributes::new(), Utc::now())
            .unwrap()
    }

    #[test]
    fn sequences_are_per_topic_and_monotonic() {
        let store = InMemoryMessageStore::new();
        let a = TopicId::new();
        let b = TopicId::new();

        assert_eq!(append(&store, a, "1").id.sequence, 1);
        assert_eq!(append(&store, a, "2").id.sequence, 2);
        assert_eq!(append(&store, b, "1").id.sequence, 1);
        assert_eq!(store.len(a), 2);
    }

    #[test]
    fn read_returns_stored_message() {
        let store = InMemoryMessageStore::new();
        let topic = TopicId::new();
        let stored = append(&store, topic, "hello");

        let read = store.read_message(stored.id).unwrap().unwrap();
        assert_eq!(read, stored);
        assert!(store.read_message(MessageId::new(topic, 99)).unwrap().is_none());
    }

    #[test]
    fn purge_drops_everything_below_watermark() {
        let store = InMemoryMessageStore::new();
        let topic = TopicId::new();
        for i in 0..5 {
            append(&store, topic, &i.to_string());
        }

        let purged = store.purge_expired(topic, MessageId::new(topic, 4)).unwrap();
        assert_eq!(purged, 3);
        assert_eq!(store.len(topic), 2);
        assert!(store.read_message(MessageId::new(topic, 3)).unwrap().is_none());
        assert!(store.read_message(MessageId::new(topic, 4)).unwrap().is_some());

        // Sequences keep counting after a purge.
        assert_eq!(append(&store, topic, "next").id.sequence, 6);
    }

    #[test]
    fn unavailable_store_fails_every_call() {
        let store = InMemoryMessageStore::new();
        let topic = TopicId::new();
        store.set_available(false);

        let err = store
            .append_message(topic, vec![], Attributes::new(), Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::Unavailable(_)));
        assert!(store.read_message(MessageId::new(topic, 1)).is_err());

        store.set_available(true);
        assert_eq!(append(&store, topic, "ok").id.sequence, 1);
    }

    #[test]
    fn len_survives_poisoned_lock() {
        let store = std::sync::Arc::new(InMemoryMessageStore::new());
        let topic = TopicId::new();
        append(&store, topic, "a");

        let poisoner = store.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.topics.write().unwrap();
            panic!("poison the lock");
        })
        .join();

        assert!(store.topics.is_poisoned());
        assert_eq!(store.len(topic), 1);
    }
}
