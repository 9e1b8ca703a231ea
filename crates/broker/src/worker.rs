//! Subscription worker: a thread that pulls deliveries and feeds them to a
//! [`Subscriber`].

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, mpsc};
use std::thread;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::broker::Broker;
use crate::config::WorkerConfig;
use crate::dead_letter::DeadLetterSink;
use crate::error::BrokerResult;
use crate::registry::SubscriptionHandle;
use crate::store::MessageStore;
use crate::subscriber::{DeliveryContext, FromMessage, Subscriber, SubscriberError};

/// How a single delivery ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Acked,
    Nacked,
    /// The lease expired or was superseded before the outcome was recorded.
    LeaseLost,
    /// The handler failed during shutdown; the lease is left to expire.
    Abandoned,
}

/// Worker runtime statistics.
#[derive(Debug, Clone, Default, Serialize)]
pub struct WorkerStats {
    pub processed: u64,
    pub acked: u64,
    pub nacked: u64,
    pub lease_lost: u64,
    pub abandoned: u64,
    pub errors: u64,
}

/// Handle to control a running worker.
#[derive(Debug)]
pub struct WorkerHandle {
    shutdown: mpsc::Sender<()>,
    cancelled: Arc<AtomicBool>,
    join: Option<thread::JoinHandle<()>>,
    stats: Arc<Mutex<WorkerStats>>,
}

impl WorkerHandle {
    /// Signal cancellation to the running handler and wait for the worker to
    /// finish its current delivery.
    pub fn shutdown(mut self) {
        self.cancelled.store(true, Ordering::Release);
        let _ = self.shutdown.send(());
        if let Some(j) = self.join.take() {
            if j.join().is_err() {
                error!("subscription worker thread panicked");
            }
        }
    }

    pub fn stats(&self) -> WorkerStats {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// Drives one subscriber over one subscription.
pub struct SubscriptionWorker<S, D, M, H> {
    broker: Arc<Broker<S, D>>,
    subscription: SubscriptionHandle,
    subscriber: H,
    cancelled: Arc<AtomicBool>,
    _message: PhantomData<fn() -> M>,
}

impl<S, D, M, H> SubscriptionWorker<S, D, M, H>
where
    S: MessageStore + 'static,
    D: DeadLetterSink + 'static,
    M: FromMessage + 'static,
    H: Subscriber<M> + 'static,
{
    pub fn new(broker: Arc<Broker<S, D>>, subscription: SubscriptionHandle, subscriber: H) -> Self {
        Self {
            broker,
            subscription,
            subscriber,
            cancelled: Arc::new(AtomicBool::new(false)),
            _message: PhantomData,
        }
    }

    /// Run the worker on its own thread.
    pub fn spawn(self, config: WorkerConfig) -> WorkerHandle {
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>();
        let stats = Arc::new(Mutex::new(WorkerStats::default()));
        let stats_clone = stats.clone();
        let cancelled = self.cancelled.clone();

        let join = thread::Builder::new()
            .name(config.name.clone())
            .spawn(move || worker_loop(self, config, shutdown_rx, stats_clone))
            .expect("failed to spawn subscription worker thread");

        WorkerHandle {
            shutdown: shutdown_tx,
            cancelled,
            join: Some(join),
            stats,
        }
    }

    /// Deliver and process a single message (for testing or synchronous use).
    ///
    /// `Ok(None)` means nothing was eligible.
    pub fn process_one(&self) -> BrokerResult<Option<Outcome>> {
        let Some(delivery) = self.broker.deliver(&self.subscription)? else {
            return Ok(None);
        };
        let lease = delivery.lease;
        let ctx = DeliveryContext::new(self.subscription.name(), &delivery, self.cancelled.clone());

        let result = M::from_message(delivery.message).and_then(|message| {
            self.subscriber
                .handle(&ctx, message)
                .map_err(SubscriberError::Handler)
        });

        let settled = match result {
            Ok(()) => self.broker.ack(&lease).map(|()| Outcome::Acked),
            Err(err) if ctx.is_cancelled() => {
                debug!(
                    subscription = %self.subscription.name(),
                    message_id = %lease.message_id,
                    error = %err,
                    "handler failed during shutdown; leaving lease to expire"
                );
                return Ok(Some(Outcome::Abandoned));
            }
            Err(err) => {
                warn!(
                    subscription = %self.subscription.name(),
                    message_id = %lease.message_id,
                    attempt = ctx.attempt(),
                    error = %err,
                    "message handling failed"
                );
                self.broker.nack(&lease).map(|()| Outcome::Nacked)
            }
        };

        match settled {
            Ok(outcome) => Ok(Some(outcome)),
            Err(err) if err.is_lease_race() => {
                debug!(
                    subscription = %self.subscription.name(),
                    message_id = %lease.message_id,
                    error = %err,
                    "lease lost before outcome was recorded"
                );
                Ok(Some(Outcome::LeaseLost))
            }
            Err(err) => Err(err),
        }
    }
}

fn worker_loop<S, D, M, H>(
    worker: SubscriptionWorker<S, D, M, H>,
    config: WorkerConfig,
    shutdown_rx: mpsc::Receiver<()>,
    stats: Arc<Mutex<WorkerStats>>,
) where
    S: MessageStore + 'static,
    D: DeadLetterSink + 'static,
    M: FromMessage + 'static,
    H: Subscriber<M> + 'static,
{
    info!(
        worker = %config.name,
        subscription = %worker.subscription.name(),
        "subscription worker started"
    );

    loop {
        if shutdown_rx.try_recv().is_ok() || worker.cancelled.load(Ordering::Acquire) {
            break;
        }

        let idle = match worker.process_one() {
            Ok(Some(outcome)) => {
                let mut s = stats.lock().unwrap_or_else(PoisonError::into_inner);
                s.processed += 1;
                match outcome {
                    Outcome::Acked => s.acked += 1,
                    Outcome::Nacked => s.nacked += 1,
                    Outcome::LeaseLost => s.lease_lost += 1,
                    Outcome::Abandoned => s.abandoned += 1,
                }
                false
            }
            Ok(None) => true,
            Err(err) => {
                error!(worker = %config.name, error = %err, "delivery failed");
                stats.lock().unwrap_or_else(PoisonError::into_inner).errors += 1;
                true
            }
        };

        if idle && wait_for_shutdown(&shutdown_rx, config.poll_interval) {
            break;
        }
    }

    info!(worker = %config.name, "subscription worker stopped");
}

/// Sleep up to `interval`; `true` if shutdown was requested meanwhile.
fn wait_for_shutdown(shutdown_rx: &mpsc::Receiver<()>, interval: Duration) -> bool {
    !matches!(
        shutdown_rx.recv_timeout(interval),
        Err(mpsc::RecvTimeoutError::Timeout)
    )
}

impl<S, D, M, H> std::fmt::Debug for SubscriptionWorker<S, D, M, H> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionWorker")
            .field("subscription", &self.subscription.name())
            .field("cancelled", &self.cancelled.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}
