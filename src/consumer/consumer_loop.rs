//! # Consumer Loop
//!
//! Pull → process → settle over one DLQ subscription.
//!
//! ```text
//! broker.pull ──▶ [in-flight permits] ──▶ mpsc ──▶ worker × N ──▶ engine ──▶ ack / nack
//! ```
//!
//! One listener task pulls batches sized to the free in-flight permits and
//! feeds a bounded channel; `worker_count` workers drain it. A permit travels
//! with its message and is released only after the message is settled, so
//! at most `max_in_flight` deliveries are unacknowledged at any time.
//!
//! Shutdown stops the listener, lets workers drain until the grace deadline,
//! then aborts them and nacks whatever is still queued or in flight.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch, Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::engine::{Disposition, ReprocessingEngine};
use super::stats::{ConsumerStats, ConsumerStatsSnapshot};
use crate::config::{BrokerConfig, ConsumerConfig, ReprocessorConfig};
use crate::error::ReprocessorError;
use crate::logging::log_reprocessing_error;
use crate::messaging::BrokerMessage;
use crate::scheduler::BackoffPolicy;

/// Jitter applied to pull retry delays
const PULL_RETRY_JITTER: f64 = 0.1;

struct Work {
    message: BrokerMessage,
    _permit: OwnedSemaphorePermit,
}

/// Deliveries currently owned by a worker
#[derive(Debug, Default)]
struct InFlight {
    next: AtomicU64,
    messages: DashMap<u64, BrokerMessage>,
}

impl InFlight {
    fn insert(&self, message: BrokerMessage) -> u64 {
        let key = self.next.fetch_add(1, Ordering::Relaxed);
        self.messages.insert(key, message);
        key
    }

    fn remove(&self, key: u64) {
        self.messages.remove(&key);
    }

    fn take_all(&self) -> Vec<BrokerMessage> {
        let keys: Vec<u64> = self.messages.iter().map(|entry| *entry.key()).collect();
        keys.into_iter()
            .filter_map(|key| self.messages.remove(&key).map(|(_, message)| message))
            .collect()
    }
}

/// Outcome of a graceful shutdown
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DrainReport {
    /// Workers finished all queued work before the grace deadline
    pub drained_within_grace: bool,
    /// Queued deliveries nacked after the deadline
    pub released_queued: usize,
    /// In-flight deliveries nacked after the deadline
    pub released_in_flight: usize,
    pub stats: ConsumerStatsSnapshot,
}

#[derive(Debug)]
pub struct ConsumerLoop {
    broker_config: BrokerConfig,
    consumer_config: ConsumerConfig,
    engine: Arc<ReprocessingEngine>,
}

impl ConsumerLoop {
    pub fn new(config: &ReprocessorConfig, engine: Arc<ReprocessingEngine>) -> Self {
        Self {
            broker_config: config.broker.clone(),
            consumer_config: config.consumer.clone(),
            engine,
        }
    }

    pub fn engine(&self) -> &Arc<ReprocessingEngine> {
        &self.engine
    }

    /// Spawn the listener, workers and maintenance task
    pub fn start(self) -> ConsumerHandle {
        let ConsumerLoop {
            broker_config,
            consumer_config,
            engine,
        } = self;

        info!(
            subscription = %engine.subscription(),
            provider = engine.broker().provider_name(),
            quarantine = engine.sink().backend_name(),
            max_in_flight = consumer_config.max_in_flight,
            worker_count = consumer_config.worker_count,
            "Starting DLQ consumer loop"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (work_tx, work_rx) = mpsc::channel(consumer_config.channel_capacity.max(1));
        let receiver = Arc::new(Mutex::new(work_rx));
        let permits = Arc::new(Semaphore::new(consumer_config.max_in_flight.max(1)));
        let in_flight = Arc::new(InFlight::default());
        let running = Arc::new(AtomicBool::new(true));

        let listener = tokio::spawn(run_listener(
            engine.clone(),
            broker_config,
            permits,
            work_tx,
            shutdown_rx.clone(),
        ));

        let mut workers = JoinSet::new();
        for worker_id in 0..consumer_config.worker_count.max(1) {
            workers.spawn(run_worker(
                worker_id,
                engine.clone(),
                receiver.clone(),
                in_flight.clone(),
                consumer_config.processing_timeout(),
            ));
        }

        let maintenance = tokio::spawn(run_maintenance(
            engine.clone(),
            consumer_config.maintenance_interval(),
            shutdown_rx,
        ));

        ConsumerHandle {
            shutdown_tx,
            listener,
            workers,
            maintenance,
            engine,
            receiver,
            in_flight,
            running,
            grace: consumer_config.shutdown_grace(),
        }
    }
}

/// Control handle for a running [`ConsumerLoop`]
pub struct ConsumerHandle {
    shutdown_tx: watch::Sender<bool>,
    listener: JoinHandle<()>,
    workers: JoinSet<()>,
    maintenance: JoinHandle<()>,
    engine: Arc<ReprocessingEngine>,
    receiver: Arc<Mutex<mpsc::Receiver<Work>>>,
    in_flight: Arc<InFlight>,
    running: Arc<AtomicBool>,
    grace: Duration,
}

impl std::fmt::Debug for ConsumerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerHandle")
            .field("subscription", &self.engine.subscription())
            .field("running", &self.is_running())
            .field("grace", &self.grace)
            .finish()
    }
}

impl ConsumerHandle {
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && !self.listener.is_finished()
    }

    pub fn stats(&self) -> ConsumerStatsSnapshot {
        self.engine.stats().snapshot()
    }

    pub fn engine(&self) -> &Arc<ReprocessingEngine> {
        &self.engine
    }

    /// Stop pulling, drain up to the grace period, nack what is left
    pub async fn shutdown(mut self) -> DrainReport {
        info!(grace = ?self.grace, "Shutting down DLQ consumer loop");
        self.running.store(false, Ordering::SeqCst);
        if self.shutdown_tx.send(true).is_err() {
            debug!("Consumer tasks already stopped");
        }
        let deadline = Instant::now() + self.grace;

        if tokio::time::timeout_at(deadline, &mut self.listener).await.is_err() {
            warn!("Listener did not stop within the grace period; aborting");
            self.listener.abort();
        }

        let drained_within_grace = tokio::time::timeout_at(deadline, async {
            while let Some(joined) = self.workers.join_next().await {
                if let Err(e) = joined {
                    error!(error = %e, "Consumer worker task failed");
                }
            }
        })
        .await
        .is_ok();

        if !drained_within_grace {
            warn!("Workers did not drain within the grace period; aborting");
            self.workers.shutdown().await;
        }

        let mut released_queued = 0;
        {
            let mut receiver = self.receiver.lock().await;
            receiver.close();
            while let Ok(work) = receiver.try_recv() {
                self.engine.release(&work.message, "shutdown").await;
                released_queued += 1;
            }
        }

        let mut released_in_flight = 0;
        for message in self.in_flight.take_all() {
            self.engine.release(&message, "shutdown").await;
            released_in_flight += 1;
        }

        self.maintenance.abort();

        let report = DrainReport {
            drained_within_grace,
            released_queued,
            released_in_flight,
            stats: self.engine.stats().snapshot(),
        };
        info!(
            drained_within_grace,
            released_queued,
            released_in_flight,
            "DLQ consumer loop stopped"
        );
        report
    }
}

async fn run_listener(
    engine: Arc<ReprocessingEngine>,
    config: BrokerConfig,
    permits: Arc<Semaphore>,
    work_tx: mpsc::Sender<Work>,
    mut shutdown: watch::Receiver<bool>,
) {
    let stats = engine.stats().clone();
    let retry = BackoffPolicy::new(
        config.pull_retry_base(),
        config.pull_retry_max(),
        2.0,
        PULL_RETRY_JITTER,
    );
    let batch_size = config.pull_batch_size.max(1);
    let mut consecutive_failures: u32 = 0;

    'listen: loop {
        if *shutdown.borrow() {
            break;
        }

        let first = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = shutdown.changed() => break,
        };
        let mut batch_permits = vec![first];
        while batch_permits.len() < batch_size {
            match permits.clone().try_acquire_owned() {
                Ok(permit) => batch_permits.push(permit),
                Err(_) => break,
            }
        }

        ConsumerStats::incr(&stats.pulls);
        let pulled = engine
            .broker()
            .pull(engine.subscription(), batch_permits.len())
            .await;

        let messages = match pulled {
            Ok(messages) => {
                consecutive_failures = 0;
                messages
            }
            Err(error) => {
                ConsumerStats::incr(&stats.pull_errors);
                drop(batch_permits);
                consecutive_failures = consecutive_failures.saturating_add(1);
                let delay = if error.is_transient() {
                    retry.delay_for(consecutive_failures)
                } else {
                    retry.max_delay()
                };
                warn!(
                    error = %error,
                    transient = error.is_transient(),
                    consecutive_failures,
                    retry_in_ms = delay.as_millis() as u64,
                    "Pull failed; backing off"
                );
                if sleep_or_shutdown(delay, &mut shutdown).await {
                    break;
                }
                continue;
            }
        };

        if messages.is_empty() {
            drop(batch_permits);
            if sleep_or_shutdown(config.idle_poll_interval(), &mut shutdown).await {
                break;
            }
            continue;
        }

        debug!(count = messages.len(), "Pulled DLQ batch");
        let mut messages = messages.into_iter();
        while let Some(message) = messages.next() {
            let Some(permit) = batch_permits.pop() else {
                engine.release(&message, "in-flight window full").await;
                continue;
            };

            let slot = tokio::select! {
                slot = work_tx.reserve() => slot,
                _ = shutdown.changed() => {
                    engine.release(&message, "shutdown").await;
                    for rest in messages.by_ref() {
                        engine.release(&rest, "shutdown").await;
                    }
                    break 'listen;
                }
            };

            match slot {
                Ok(slot) => slot.send(Work {
                    message,
                    _permit: permit,
                }),
                Err(_) => {
                    engine.release(&message, "workers stopped").await;
                    for rest in messages.by_ref() {
                        engine.release(&rest, "workers stopped").await;
                    }
                    break 'listen;
                }
            }
        }
    }

    debug!("Listener stopped");
}

/// Sleep for `delay`; returns true when shutdown was signalled first
async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}

async fn run_worker(
    worker_id: usize,
    engine: Arc<ReprocessingEngine>,
    receiver: Arc<Mutex<mpsc::Receiver<Work>>>,
    in_flight: Arc<InFlight>,
    processing_timeout: Duration,
) {
    debug!(worker_id, "Worker started");
    loop {
        let work = {
            let mut receiver = receiver.lock().await;
            receiver.recv().await
        };
        let Some(work) = work else { break };
        let message = work.message.clone();
        let key = in_flight.insert(message.clone());

        let outcome = AssertUnwindSafe(tokio::time::timeout(
            processing_timeout,
            engine.handle(&message),
        ))
        .catch_unwind()
        .await;

        let disposition = match outcome {
            Ok(Ok(disposition)) => disposition,
            Ok(Err(_elapsed)) => {
                ConsumerStats::incr(&engine.stats().timeouts);
                let error = ReprocessorError::ProcessingTimeout {
                    message_id: message.message_id.to_string(),
                    timeout_ms: processing_timeout.as_millis() as u64,
                };
                log_reprocessing_error("consumer", Some(message.message_id.as_str()), &error, None);
                Disposition::Retry {
                    reason: error.to_string(),
                    delay: None,
                }
            }
            Err(_panic) => {
                ConsumerStats::incr(&engine.stats().panics);
                error!(
                    worker_id,
                    delivery_id = %message.message_id,
                    "Processing panicked; releasing delivery"
                );
                Disposition::Retry {
                    reason: "processing panicked".to_string(),
                    delay: None,
                }
            }
        };

        engine.settle(&message, &disposition).await;
        in_flight.remove(key);
        drop(work);
    }
    debug!(worker_id, "Worker stopped");
}

async fn run_maintenance(
    engine: Arc<ReprocessingEngine>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                engine.run_maintenance();
            }
            _ = shutdown.changed() => break,
        }
    }
}
