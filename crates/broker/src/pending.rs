//! Per-subscription index of messages waiting for (re)delivery.
//!
//! Fresh messages go straight into the `ready` set. Messages coming back from
//! an expired lease sit in `delayed` until their backoff window (`not_before`)
//! has passed. `take_next` promotes due entries and then hands out the lowest
//! sequence, which gives FIFO order among eligible messages.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_core::MessageId;
use courier_core::clock::deadline_after;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PendingEntry {
    published_at: DateTime<Utc>,
    not_before: Option<DateTime<Utc>>,
}

/// A message selected for delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Eligible {
    pub message_id: MessageId,
    pub published_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct PendingIndex {
    entries: BTreeMap<MessageId, PendingEntry>,
    ready: BTreeSet<MessageId>,
    delayed: BTreeSet<(DateTime<Utc>, MessageId)>,
}

impl PendingIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a freshly published message, eligible immediately.
    pub fn insert(&mut self, message_id: MessageId, published_at: DateTime<Utc>) {
        self.remove(message_id);
        self.entries.insert(
            message_id,
            PendingEntry {
                published_at,
                not_before: None,
            },
        );
        self.ready.insert(message_id);
    }

    /// Add a message for redelivery once `not_before` has passed.
    pub fn schedule(
        &mut self,
        message_id: MessageId,
        published_at: DateTime<Utc>,
        not_before: DateTime<Utc>,
    ) {
        self.remove(message_id);
        self.entries.insert(
            message_id,
            PendingEntry {
                published_at,
                not_before: Some(not_before),
            },
        );
        self.delayed.insert((not_before, message_id));
    }

    /// Pop the oldest eligible message.
    pub fn take_next(&mut self, now: DateTime<Utc>) -> Option<Eligible> {
        self.promote_due(now);

        let message_id = self.ready.pop_first()?;
        let entry = self.entries.remove(&message_id)?;
        Some(Eligible {
            message_id,
            published_at: entry.published_at,
        })
    }

    fn promote_due(&mut self, now: DateTime<Utc>) {
        while let Some(&(not_before, message_id)) = self.delayed.first() {
            if not_before > now {
                break;
            }
            self.delayed.pop_first();
            self.ready.insert(message_id);
        }
    }

    pub fn remove(&mut self, message_id: MessageId) -> bool {
        let Some(entry) = self.entries.remove(&message_id) else {
            return false;
        };
        match entry.not_before {
            Some(not_before) if self.delayed.remove(&(not_before, message_id)) => {}
            _ => {
                self.ready.remove(&message_id);
            }
        }
        true
    }

    /// Messages published at least `retention` before `now`.
    pub fn retention_expired(&self, now: DateTime<Utc>, retention: Duration) -> Vec<MessageId> {
        self.entries
            .iter()
            .filter(|(_, entry)| deadline_after(entry.published_at, retention) <= now)
            .map(|(id, _)| *id)
            .collect()
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.entries.contains_key(&message_id)
    }

    /// Messages waiting for delivery, ready or delayed.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Messages still inside their backoff window as of the last promotion.
    pub fn delayed(&self) -> usize {
        self.delayed.len()
    }
}
