//! Redelivery scheduler.
//!
//! A background thread that periodically sweeps every subscription: expired
//! leases are turned into delayed redeliveries or dead letters, pending
//! messages past the retention window are dropped, and the store is purged of
//! messages every subscription has settled.

use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use courier_core::Backoff;
use courier_core::backoff::should_dead_letter;
use courier_core::clock::deadline_after;

use crate::ack_tracker::DeliveryRecord;
use crate::broker::Broker;
use crate::dead_letter::DeadLetterSink;
use crate::error::BrokerError;
use crate::registry::{SubscriptionState, TopicState};
use crate::store::MessageStore;

/// What one sweep did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    /// Leases found past their deadline.
    pub expired: usize,
    pub redelivery_scheduled: usize,
    pub dead_lettered: usize,
    /// Dead-letter attempts that failed; those records are retried next sweep.
    pub dead_letter_failures: usize,
    pub retention_expired: usize,
    /// Messages removed from the store.
    pub purged: usize,
}

impl SweepReport {
    pub fn merge(&mut self, other: SweepReport) {
        self.expired += other.expired;
        self.redelivery_scheduled += other.redelivery_scheduled;
        self.dead_lettered += other.dead_lettered;
        self.dead_letter_failures += other.dead_letter_failures;
        self.retention_expired += other.retention_expired;
        self.purged += other.purged;
    }

    pub fn is_empty(&self) -> bool {
        *self == SweepReport::default()
    }
}

/// Sweep one subscription under its lock.
pub(crate) fn sweep_subscription<S, D>(
    sub: &SubscriptionState,
    store: &S,
    dead_letters: &D,
    backoff: &Backoff,
    now: DateTime<Utc>,
) -> SweepReport
where
    S: MessageStore,
    D: DeadLetterSink,
{
    let mut report = SweepReport::default();
    let mut queue = sub.lock();

    for message_id in queue.tracker.expired(now) {
        let Some(record) = queue.tracker.get(message_id).cloned() else {
            continue;
        };
        report.expired += 1;

        if should_dead_letter(record.attempt_count, &sub.retry_policy) {
            match dead_letter(sub, store, dead_letters, &record) {
                Ok(true) => {
                    queue.tracker.remove(message_id);
                    queue.counters.dead_lettered += 1;
                    sub.settle(message_id);
                    report.dead_lettered += 1;
                    info!(
                        subscription = %sub.name,
                        message_id = %message_id,
                        attempts = record.attempt_count,
                        "message dead-lettered"
                    );
                }
                Ok(false) => {
                    queue.tracker.remove(message_id);
                    queue.counters.retention_expired += 1;
                    sub.settle(message_id);
                    report.retention_expired += 1;
                    warn!(
                        subscription = %sub.name,
                        message_id = %message_id,
                        "message gone from store before dead-lettering; dropped"
                    );
                }
                Err(err) => {
                    // The record stays expired and is picked up again next sweep.
                    report.dead_letter_failures += 1;
                    warn!(
                        subscription = %sub.name,
                        message_id = %message_id,
                        error = %err,
                        "dead-lettering failed"
                    );
                }
            }
            continue;
        }

        let delay = backoff.delay(record.attempt_count, &sub.retry_policy);
        let not_before = deadline_after(now, delay);
        queue.tracker.release(message_id);
        queue
            .pending
            .schedule(message_id, record.published_at, not_before);
        report.redelivery_scheduled += 1;
        debug!(
            subscription = %sub.name,
            message_id = %message_id,
            attempt = record.attempt_count,
            delay_ms = delay.as_millis() as u64,
            "redelivery scheduled"
        );
    }

    if let Some(retention) = sub.config.retention_window() {
        for message_id in queue.pending.retention_expired(now, retention) {
            queue.pending.remove(message_id);
            queue.tracker.remove(message_id);
            queue.counters.retention_expired += 1;
            sub.settle(message_id);
            report.retention_expired += 1;
            debug!(
                subscription = %sub.name,
                message_id = %message_id,
                "message retention expired"
            );
        }
    }

    report
}

/// Read the message and hand it to the dead-letter destination.
///
/// `Ok(false)` means the message is no longer in the store.
fn dead_letter<S, D>(
    sub: &SubscriptionState,
    store: &S,
    dead_letters: &D,
    record: &DeliveryRecord,
) -> Result<bool, BrokerError>
where
    S: MessageStore,
    D: DeadLetterSink,
{
    let Some(message) = store.read_message(record.message_id)? else {
        return Ok(false);
    };
    dead_letters.send_to_dead_letter(&sub.name, &message, record.attempt_count)?;
    Ok(true)
}

/// Purge everything below the topic's settled watermark. Returns the number
/// of messages removed.
pub(crate) fn purge_settled<S: MessageStore>(topic: &TopicState, store: &S) -> usize {
    let Some(watermark) = topic.lock_index().pending_purge() else {
        return 0;
    };

    match store.purge_expired(topic.id, watermark) {
        Ok(purged) => {
            topic.lock_index().mark_purged(watermark);
            if purged > 0 {
                debug!(
                    topic = %topic.name,
                    purged,
                    watermark = %watermark,
                    "settled messages purged"
                );
            }
            purged
        }
        Err(err) => {
            warn!(topic = %topic.name, error = %err, "failed to purge settled messages");
            0
        }
    }
}

/// Handle to control a running scheduler.
#[derive(Debug)]
pub struct SchedulerHandle {
    shutdown: mpsc::Sender<()>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<SchedulerStats>>,
}

impl SchedulerHandle {
    /// Stop the scheduler and wait for the current sweep to finish.
    pub fn shutdown(mut self) {
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!("redelivery scheduler thread panicked");
            }
        }
    }

    pub fn stats(&self) -> SchedulerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Scheduler runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SchedulerStats {
    pub sweeps: u64,
    pub redeliveries_scheduled: u64,
    pub dead_lettered: u64,
    pub dead_letter_failures: u64,
    pub retention_expired: u64,
    pub purged: u64,
    pub uptime_secs: u64,
}

impl SchedulerStats {
    fn record(&mut self, report: &SweepReport) {
        self.sweeps += 1;
        self.redeliveries_scheduled += report.redelivery_scheduled as u64;
        self.dead_lettered += report.dead_lettered as u64;
        self.dead_letter_failures += report.dead_letter_failures as u64;
        self.retention_expired += report.retention_expired as u64;
        self.purged += report.purged as u64;
    }
}

/// Background redelivery loop over a shared broker.
pub struct RedeliveryScheduler;

impl RedeliveryScheduler {
    /// Spawn the scheduler thread.
    ///
    /// The sweep interval is the broker's configured interval, capped by the
    /// smallest ack deadline of any registered subscription, and re-evaluated
    /// after every sweep so later subscriptions are honoured.
    pub fn spawn<S, D>(broker: Arc<Broker<S, D>>) -> SchedulerHandle
    where
        S: MessageStore + 'static,
        D: DeadLetterSink + 'static,
    {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(SchedulerStats::default()));
        let stats_clone = stats.clone();

        let name = broker.config().scheduler_name.clone();
        let join = thread::Builder::new()
            .name(name)
            .spawn(move || scheduler_loop(broker, shutdown_rx, stats_clone))
            .expect("failed to spawn redelivery scheduler thread");

        SchedulerHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }
}

fn scheduler_loop<S, D>(
    broker: Arc<Broker<S, D>>,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<SchedulerStats>>,
) where
    S: MessageStore,
    D: DeadLetterSink,
{
    let name = broker.config().scheduler_name.clone();
    info!(scheduler = %name, "redelivery scheduler started");
    let start_time = Instant::now();

    loop {
        let report = broker.sweep();
        if !report.is_empty() {
            debug!(scheduler = %name, ?report, "sweep finished");
        }

        {
            let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
            s.record(&report);
            s.uptime_secs = start_time.elapsed().as_secs();
        }

        let interval = sweep_interval(&broker);
        match shutdown_rx.recv_timeout(interval) {
            Err(mpsc::RecvTimeoutError::Timeout) => continue,
            Ok(()) | Err(mpsc::RecvTimeoutError::Disconnected) => break,
        }
    }

    info!(scheduler = %name, "redelivery scheduler stopped");
}

fn sweep_interval<S, D>(broker: &Broker<S, D>) -> Duration
where
    S: MessageStore,
    D: DeadLetterSink,
{
    broker
        .config()
        .effective_sweep_interval(broker.registry().min_ack_deadline())
}
