//! Per-subscription tracking of delivered-but-unacknowledged messages.
//!
//! A [`DeliveryRecord`] exists from the first delivery of a message until it
//! is acknowledged or dead-lettered. Between attempts the record stays in the
//! tracker with its lease released, which is what keeps `attempt_count`
//! monotonic across redeliveries.
//!
//! The tracker is not synchronised on its own: it lives inside the
//! subscription's lock together with the pending index, so "remove the record"
//! is a single atomic step for whichever path (ack, nack or the scheduler's
//! sweep) gets there first.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};

use courier_core::clock::deadline_after;
use courier_core::{LeaseId, MessageId};

/// Delivery state of one message on one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub message_id: MessageId,
    /// Number of deliveries so far; starts at 1 on the first delivery.
    pub attempt_count: u32,
    pub delivered_at: DateTime<Utc>,
    /// `delivered_at + ack_deadline`, or earlier after a nack.
    pub deadline: DateTime<Utc>,
    /// Lease minted by the most recent delivery.
    pub lease_id: LeaseId,
    pub published_at: DateTime<Utc>,
    /// `false` once the scheduler handled the expiry and the message waits for redelivery.
    pub leased: bool,
}

/// Outcome of checking a consumer's lease against the tracker.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LeaseStatus {
    /// The lease is current and its deadline has not passed.
    Active,
    /// The lease is current but its deadline passed (or it was nacked).
    Expired,
    /// The message was redelivered, or is waiting for redelivery, under another lease.
    Superseded,
    /// No record: the message was acknowledged or dead-lettered.
    Unknown,
}

/// Map of message id → delivery record, with a deadline-ordered index over
/// the records that currently hold a lease.
#[derive(Debug, Default)]
pub struct AckTracker {
    records: HashMap<MessageId, DeliveryRecord>,
    deadlines: BTreeSet<(DateTime<Utc>, MessageId)>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking the first delivery of a message.
    ///
    /// If a record already exists this behaves like [`AckTracker::refresh`].
    pub fn register(
        &mut self,
        message_id: MessageId,
        published_at: DateTime<Utc>,
        now: DateTime<Utc>,
        ack_deadline: Duration,
    ) -> &DeliveryRecord {
        let record = self.records.entry(message_id).or_insert_with(|| DeliveryRecord {
            message_id,
            attempt_count: 0,
            delivered_at: now,
            deadline: now,
            lease_id: LeaseId::new(),
            published_at,
            leased: false,
        });
        start_lease(&mut self.deadlines, record, now, ack_deadline);
        record
    }

    /// Record a redelivery: bump the attempt count and mint a new lease.
    pub fn refresh(
        &mut self,
        message_id: MessageId,
        now: DateTime<Utc>,
        ack_deadline: Duration,
    ) -> Option<&DeliveryRecord> {
        let record = self.records.get_mut(&message_id)?;
        start_lease(&mut self.deadlines, record, now, ack_deadline);
        Some(record)
    }

    /// Drop the record (ack or dead-letter).
    pub fn remove(&mut self, message_id: MessageId) -> Option<DeliveryRecord> {
        let record = self.records.remove(&message_id)?;
        if record.leased {
            self.deadlines.remove(&(record.deadline, message_id));
        }
        Some(record)
    }

    /// Expire the current lease right away (nack).
    pub fn expire(&mut self, message_id: MessageId, now: DateTime<Utc>) -> bool {
        self.move_deadline(message_id, |deadline| deadline.min(now))
    }

    /// Push the deadline of the current lease out to `deadline`.
    pub fn extend(&mut self, message_id: MessageId, deadline: DateTime<Utc>) -> bool {
        self.move_deadline(message_id, |_| deadline)
    }

    fn move_deadline(
        &mut self,
        message_id: MessageId,
        update: impl FnOnce(DateTime<Utc>) -> DateTime<Utc>,
    ) -> bool {
        let Some(record) = self.records.get_mut(&message_id) else {
            return false;
        };
        if !record.leased {
            return false;
        }

        self.deadlines.remove(&(record.deadline, message_id));
        record.deadline = update(record.deadline);
        self.deadlines.insert((record.deadline, message_id));
        true
    }

    /// Drop the lease but keep the record, so the next delivery continues the
    /// attempt count.
    pub fn release(&mut self, message_id: MessageId) -> Option<&DeliveryRecord> {
        let record = self.records.get_mut(&message_id)?;
        if record.leased {
            self.deadlines.remove(&(record.deadline, message_id));
            record.leased = false;
        }
        Some(record)
    }

    /// Leased records whose deadline is at or before `now`, earliest first.
    pub fn expired(&self, now: DateTime<Utc>) -> Vec<MessageId> {
        self.deadlines
            .iter()
            .take_while(|(deadline, _)| *deadline <= now)
            .map(|(_, id)| *id)
            .collect()
    }

    pub fn check_lease(
        &self,
        message_id: MessageId,
        lease_id: LeaseId,
        now: DateTime<Utc>,
    ) -> LeaseStatus {
        match self.records.get(&message_id) {
            None => LeaseStatus::Unknown,
            Some(record) if record.lease_id != lease_id || !record.leased => {
                LeaseStatus::Superseded
            }
            Some(record) if record.deadline <= now => LeaseStatus::Expired,
            Some(_) => LeaseStatus::Active,
        }
    }

    pub fn get(&self, message_id: MessageId) -> Option<&DeliveryRecord> {
        self.records.get(&message_id)
    }

    pub fn contains(&self, message_id: MessageId) -> bool {
        self.records.contains_key(&message_id)
    }

    /// Records currently holding a lease.
    pub fn in_flight(&self) -> usize {
        self.deadlines.len()
    }

    /// All records, leased or waiting for redelivery.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn start_lease(
    deadlines: &mut BTreeSet<(DateTime<Utc>, MessageId)>,
    record: &mut DeliveryRecord,
    now: DateTime<Utc>,
    ack_deadline: Duration,
) {
    if record.leased {
        deadlines.remove(&(record.deadline, record.message_id));
    }

    record.attempt_count = record.attempt_count.saturating_add(1);
    record.delivered_at = now;
    record.deadline = deadline_after(now, ack_deadline);
    record.lease_id = LeaseId::new();
    record.leased = true;
    deadlines.insert((record.deadline, record.message_id));
}
