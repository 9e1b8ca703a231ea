//! Dead-letter destination.
//!
//! Dead-lettering is the designed terminal path for poison messages: a
//! successful routing decision, not an error.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use courier_core::{Clock, Message, SystemClock};

/// Dead-letter destination error.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DeadLetterError {
    #[error("dead-letter destination unavailable: {0}")]
    Unavailable(String),
}

/// Destination for messages that exhausted their retry budget.
///
/// An `Ok` return means the destination has taken ownership of the message;
/// only then does the broker drop its delivery record.
pub trait DeadLetterSink: Send + Sync {
    fn send_to_dead_letter(
        &self,
        subscription: &str,
        message: &Message,
        attempt_count: u32,
    ) -> Result<(), DeadLetterError>;
}

impl<D> DeadLetterSink for Arc<D>
where
    D: DeadLetterSink + ?Sized,
{
    fn send_to_dead_letter(
        &self,
        subscription: &str,
        message: &Message,
        attempt_count: u32,
    ) -> Result<(), DeadLetterError> {
        (**self).send_to_dead_letter(subscription, message, attempt_count)
    }
}

/// Entry in the dead-letter queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub subscription: String,
    pub message: Message,
    pub attempt_count: u32,
    pub dead_lettered_at: DateTime<Utc>,
}

/// In-memory dead-letter queue for tests/dev.
///
/// Entries are stamped from the queue's own clock; share the broker's clock
/// via [`InMemoryDeadLetterQueue::with_clock`] to keep timestamps consistent.
pub struct InMemoryDeadLetterQueue {
    entries: RwLock<HashMap<String, Vec<DeadLetterEntry>>>,
    available: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl InMemoryDeadLetterQueue {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            available: AtomicBool::new(true),
            clock,
        }
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Dead-lettered entries for a subscription, oldest first.
    pub fn list(&self, subscription: &str) -> Vec<DeadLetterEntry> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(subscription)
            .cloned()
            .unwrap_or_default()
    }

    /// Total number of dead-lettered entries across subscriptions.
    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for InMemoryDeadLetterQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryDeadLetterQueue")
            .field("len", &self.len())
            .field("available", &self.available.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl Default for InMemoryDeadLetterQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeadLetterSink for InMemoryDeadLetterQueue {
    fn send_to_dead_letter(
        &self,
        subscription: &str,
        message: &Message,
        attempt_count: u32,
    ) -> Result<(), DeadLetterError> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(DeadLetterError::Unavailable(
                "in-memory dead-letter queue marked unavailable".to_string(),
            ));
        }

        let dead_lettered_at = self.clock.now();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries
            .entry(subscription.to_string())
            .or_default()
            .push(DeadLetterEntry {
                subscription: subscription.to_string(),
                message: message.clone(),
                attempt_count,
                dead_lettered_at,
            });
        Ok(())
    }
}
