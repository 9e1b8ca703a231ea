use std::collections::BTreeMap;

use courier_core::{MessageId, TopicId};

/// Per-topic index of messages that some subscription has not yet settled.
///
/// Each tracked sequence carries the number of subscriptions that still owe it
/// an outcome (ack, dead-letter or retention expiry). Once the count reaches
/// zero the message is settled everywhere and may be purged from the store.
#[derive(Debug)]
pub struct TopicIndex {
    topic: TopicId,
    outstanding: BTreeMap<u64, usize>,
    next_sequence: u64,
    purged_below: u64,
}

impl TopicIndex {
    pub fn new(topic: TopicId) -> Self {
        Self {
            topic,
            outstanding: BTreeMap::new(),
            next_sequence: 1,
            purged_below: 1,
        }
    }

    /// Start tracking a freshly appended message owed to `subscriptions` subscriptions.
    ///
    /// With zero subscriptions the message is settled immediately.
    pub fn track(&mut self, id: MessageId, subscriptions: usize) {
        debug_assert_eq!(id.topic, self.topic);
        self.next_sequence = self.next_sequence.max(id.sequence + 1);
        if subscriptions > 0 {
            self.outstanding.insert(id.sequence, subscriptions);
        }
    }

    /// Record that one subscription settled `id`. Returns `true` when no
    /// subscription owes the message anything any more.
    pub fn settle(&mut self, id: MessageId) -> bool {
        let Some(count) = self.outstanding.get_mut(&id.sequence) else {
            return true;
        };
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.outstanding.remove(&id.sequence);
            true
        } else {
            false
        }
    }

    /// Everything strictly below this id is settled by every subscription.
    pub fn watermark(&self) -> MessageId {
        let sequence = self
            .outstanding
            .keys()
            .next()
            .copied()
            .unwrap_or(self.next_sequence);
        MessageId::new(self.topic, sequence)
    }

    /// Watermark to hand to the store, if it moved since the last purge.
    pub fn pending_purge(&self) -> Option<MessageId> {
        let watermark = self.watermark();
        (watermark.sequence > self.purged_below).then_some(watermark)
    }

    pub fn mark_purged(&mut self, watermark: MessageId) {
        self.purged_below = self.purged_below.max(watermark.sequence);
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.len()
    }
}
