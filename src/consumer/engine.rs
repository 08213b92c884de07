//! # Reprocessing Engine
//!
//! Processes one delivery end to end: normalize, classify, plan, act,
//! commit, settle. The consumer loop calls [`ReprocessingEngine::handle`]
//! under a timeout and then [`ReprocessingEngine::settle`]; tests and
//! embedders can call [`ReprocessingEngine::process`] for both.
//!
//! Acknowledgment always follows the commit of the attempt state. When the
//! outbound action (publish, quarantine write) fails the decision is not
//! committed and the delivery is nacked.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use super::stats::ConsumerStats;
use crate::classifier::{Classification, FailureClassifier, FailureKind};
use crate::config::ReprocessorConfig;
use crate::constants::defaults;
use crate::envelope::{Envelope, EnvelopeStore};
use crate::error::{ReprocessorError, Result};
use crate::logging::{log_disposition, log_reprocessing_error};
use crate::messaging::{BrokerClient, BrokerMessage, MessageId};
use crate::quarantine::QuarantineSink;
use crate::scheduler::{AttemptRecord, Decision, RedeliveryRoute, RedeliveryScheduler};

/// Terminal outcome of one delivery, and the broker action it maps to
#[derive(Debug, Clone, PartialEq)]
pub enum Disposition {
    /// Published to a delay tier; acked
    Redelivered {
        attempt: u32,
        topic: String,
        delay: Duration,
    },
    /// Redelivery held on the DLQ copy; nacked with the backoff delay
    Held { attempt: u32, delay: Duration },
    /// Held redelivery published to its original topic; acked
    Dispatched { attempt: u32, topic: String },
    /// Arrived before its backoff elapsed; nacked for the remainder
    Deferred { remaining: Duration },
    /// Written to the quarantine store; acked
    Quarantined { kind: FailureKind, reason: String },
    /// Nothing to do; acked
    Duplicate { reason: String },
    /// Could not be processed now; nacked
    Retry {
        reason: String,
        delay: Option<Duration>,
    },
}

impl Disposition {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Redelivered { .. } => "redelivered",
            Self::Held { .. } => "held",
            Self::Dispatched { .. } => "dispatched",
            Self::Deferred { .. } => "deferred",
            Self::Quarantined { .. } => "quarantined",
            Self::Duplicate { .. } => "duplicate",
            Self::Retry { .. } => "retry",
        }
    }

    /// Whether the delivery is acknowledged; otherwise it is nacked
    pub fn acks(&self) -> bool {
        matches!(
            self,
            Self::Redelivered { .. }
                | Self::Dispatched { .. }
                | Self::Quarantined { .. }
                | Self::Duplicate { .. }
        )
    }

    /// Redelivery delay requested from the broker on nack
    pub fn nack_delay(&self) -> Option<Duration> {
        match self {
            Self::Held { delay, .. } => Some(*delay),
            Self::Deferred { remaining } => Some(*remaining),
            Self::Retry { delay, .. } => *delay,
            _ => None,
        }
    }

    fn attempt(&self) -> Option<u32> {
        match self {
            Self::Redelivered { attempt, .. }
            | Self::Held { attempt, .. }
            | Self::Dispatched { attempt, .. } => Some(*attempt),
            _ => None,
        }
    }
}

/// Entries removed by one [`ReprocessingEngine::run_maintenance`] pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MaintenanceReport {
    pub tombstones: usize,
    pub records: usize,
    pub envelopes: usize,
}

pub struct ReprocessingEngine {
    envelopes: EnvelopeStore,
    classifier: FailureClassifier,
    scheduler: RedeliveryScheduler,
    sink: Arc<dyn QuarantineSink>,
    broker: Arc<dyn BrokerClient>,
    subscription: String,
    stats: Arc<ConsumerStats>,
    preview_bytes: usize,
}

impl std::fmt::Debug for ReprocessingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReprocessingEngine")
            .field("subscription", &self.subscription)
            .field("broker", &self.broker.provider_name())
            .field("sink", &self.sink.backend_name())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

impl ReprocessingEngine {
    pub fn new(
        broker: Arc<dyn BrokerClient>,
        sink: Arc<dyn QuarantineSink>,
        classifier: FailureClassifier,
        scheduler: RedeliveryScheduler,
        subscription: impl Into<String>,
    ) -> Self {
        Self {
            envelopes: EnvelopeStore::new(),
            classifier,
            scheduler,
            sink,
            broker,
            subscription: subscription.into(),
            stats: Arc::new(ConsumerStats::new()),
            preview_bytes: defaults::PAYLOAD_PREVIEW_BYTES,
        }
    }

    pub fn from_config(
        config: &ReprocessorConfig,
        broker: Arc<dyn BrokerClient>,
        sink: Arc<dyn QuarantineSink>,
    ) -> Self {
        Self::new(
            broker,
            sink,
            FailureClassifier::from_config(&config.classifier, &config.redelivery),
            RedeliveryScheduler::from_config(config),
            config.broker.subscription.clone(),
        )
    }

    pub fn subscription(&self) -> &str {
        &self.subscription
    }

    pub fn broker(&self) -> &Arc<dyn BrokerClient> {
        &self.broker
    }

    pub fn sink(&self) -> &Arc<dyn QuarantineSink> {
        &self.sink
    }

    pub fn scheduler(&self) -> &RedeliveryScheduler {
        &self.scheduler
    }

    pub fn envelopes(&self) -> &EnvelopeStore {
        &self.envelopes
    }

    pub fn stats(&self) -> &Arc<ConsumerStats> {
        &self.stats
    }

    /// Handle and settle one delivery
    pub async fn process(&self, message: &BrokerMessage) -> Disposition {
        let disposition = self.handle(message).await;
        self.settle(message, &disposition).await;
        disposition
    }

    /// Decide and act on one delivery, without acking or nacking it
    #[instrument(
        skip(self, message),
        fields(delivery_id = %message.message_id, delivery_attempt = message.delivery_attempt)
    )]
    pub async fn handle(&self, message: &BrokerMessage) -> Disposition {
        ConsumerStats::incr(&self.stats.received);
        let envelope = self.envelopes.normalize(message);
        info!(
            message_id = %envelope.message_id(),
            republished = envelope.is_republished(),
            payload = %envelope.payload_preview(self.preview_bytes),
            "Received dead-lettered message"
        );

        let now = Utc::now();
        let mut guard = self.scheduler.lock(envelope.message_id()).await;

        // No local state: the message may have been quarantined by an earlier run
        if guard.record().is_none() && guard.tombstone().is_none() {
            match self.sink.get(envelope.message_id()).await {
                Ok(Some(existing)) if existing.resolution.is_none() => {
                    guard.restore_tombstone(existing.quarantined_at, now);
                }
                Ok(_) => {}
                Err(error) => {
                    drop(guard);
                    return self.lookup_failed(&envelope, error.into());
                }
            }
        }

        let classification = self.classifier.classify(&envelope, guard.record());
        debug!(
            kind = %classification.kind,
            reason = %classification.reason,
            "Delivery classified"
        );

        let decision = match guard.plan(&envelope, &classification, now) {
            Ok(decision) => decision,
            Err(violation) => return self.invariant_violated(&envelope, violation.into()),
        };

        if let Err(error) = self.act(&envelope, &decision).await {
            guard.record_pending(&classification, now);
            return self.action_failed(&envelope, &decision, &classification, error);
        }

        if let Err(violation) = guard.commit(&envelope, &decision, now) {
            return self.invariant_violated(&envelope, violation.into());
        }
        drop(guard);

        let disposition = self.disposition_for(decision);
        if matches!(disposition, Disposition::Quarantined { .. }) {
            self.envelopes.forget(envelope.message_id());
        }
        self.count(&disposition);
        self.log(&envelope, &disposition);
        disposition
    }

    /// Perform the broker action a disposition maps to
    ///
    /// Broker failures are logged and counted; the broker redelivers an
    /// unsettled message once its ack deadline passes.
    pub async fn settle(&self, message: &BrokerMessage, disposition: &Disposition) {
        let result = if disposition.acks() {
            self.broker
                .ack(&self.subscription, &message.receipt_handle)
                .await
                .map(|()| ConsumerStats::incr(&self.stats.acked))
        } else {
            self.broker
                .nack(&self.subscription, &message.receipt_handle, disposition.nack_delay())
                .await
                .map(|()| ConsumerStats::incr(&self.stats.nacked))
        };

        if let Err(error) = result {
            ConsumerStats::incr(&self.stats.ack_failures);
            log_reprocessing_error(
                "consumer",
                Some(message.message_id.as_str()),
                &error,
                Some(disposition.name()),
            );
        }
    }

    /// Nack a delivery that will not be processed now
    pub async fn release(&self, message: &BrokerMessage, reason: &str) {
        let disposition = Disposition::Retry {
            reason: reason.to_string(),
            delay: None,
        };
        self.settle(message, &disposition).await;
    }

    /// Downstream success signal: discard the message's attempt state
    pub async fn resolve(&self, message_id: &MessageId) -> Option<AttemptRecord> {
        let record = self.scheduler.resolve(message_id).await;
        self.envelopes.forget(message_id);
        record
    }

    /// Evict expired tombstones, idle attempt records and first-seen entries
    /// of messages the scheduler no longer tracks
    pub fn run_maintenance(&self) -> MaintenanceReport {
        let tombstones = self.scheduler.purge_tombstones();
        let records = self.scheduler.evict_idle_records();
        let envelopes = self.envelopes.evict_older_than(
            self.scheduler.policy().record_ttl,
            |message_id| self.scheduler.is_tracked(message_id),
        );
        self.stats
            .evicted_records
            .fetch_add(records as u64, Ordering::Relaxed);

        let report = MaintenanceReport {
            tombstones,
            records,
            envelopes,
        };
        if report != MaintenanceReport::default() {
            debug!(tombstones, records, envelopes, "Reprocessor maintenance evicted entries");
        }
        report
    }

    async fn act(&self, envelope: &Envelope, decision: &Decision) -> Result<()> {
        let strip = self.classifier.error_attributes();
        match decision {
            Decision::Redeliver {
                attempt,
                route: RedeliveryRoute::DelayTier {
                    topic,
                    original_topic,
                    ..
                },
                ..
            } => {
                let outbound = self
                    .scheduler
                    .router()
                    .redelivery_message(envelope, *attempt, original_topic, strip);
                self.broker.publish(topic, outbound).await?;
            }
            Decision::Dispatch { attempt, topic } => {
                let outbound = self
                    .scheduler
                    .router()
                    .redelivery_message(envelope, *attempt, topic, strip);
                self.broker.publish(topic, outbound).await?;
            }
            Decision::Quarantine { record } => {
                self.sink.persist(record.as_ref().clone()).await?;
            }
            Decision::Redeliver { .. } | Decision::Defer { .. } | Decision::Duplicate { .. } => {}
        }
        Ok(())
    }

    fn disposition_for(&self, decision: Decision) -> Disposition {
        match decision {
            Decision::Redeliver {
                attempt,
                delay,
                route,
                ..
            } => match route {
                RedeliveryRoute::DelayTier { topic, .. } => Disposition::Redelivered {
                    attempt,
                    topic,
                    delay,
                },
                RedeliveryRoute::Hold { .. } => Disposition::Held { attempt, delay },
            },
            Decision::Dispatch { attempt, topic } => Disposition::Dispatched { attempt, topic },
            Decision::Defer { remaining } => Disposition::Deferred { remaining },
            Decision::Quarantine { record } => Disposition::Quarantined {
                kind: record.failure_kind,
                reason: record.reason,
            },
            Decision::Duplicate { reason } => Disposition::Duplicate {
                reason: reason.to_string(),
            },
        }
    }

    fn count(&self, disposition: &Disposition) {
        let counter = match disposition {
            Disposition::Redelivered { .. } => &self.stats.redelivered,
            Disposition::Held { .. } => &self.stats.held,
            Disposition::Dispatched { .. } => &self.stats.dispatched,
            Disposition::Deferred { .. } => &self.stats.deferred,
            Disposition::Quarantined { .. } => &self.stats.quarantined,
            Disposition::Duplicate { .. } => &self.stats.duplicates,
            Disposition::Retry { .. } => return,
        };
        ConsumerStats::incr(counter);
    }

    fn log(&self, envelope: &Envelope, disposition: &Disposition) {
        let details = match disposition {
            Disposition::Quarantined { reason, .. }
            | Disposition::Duplicate { reason }
            | Disposition::Retry { reason, .. } => Some(reason.clone()),
            Disposition::Redelivered { topic, delay, .. } => {
                Some(format!("topic={topic} delay_ms={}", delay.as_millis()))
            }
            Disposition::Dispatched { topic, .. } => Some(format!("topic={topic}")),
            Disposition::Held { delay, .. } => Some(format!("delay_ms={}", delay.as_millis())),
            Disposition::Deferred { remaining } => {
                Some(format!("remaining_ms={}", remaining.as_millis()))
            }
        };
        log_disposition(
            envelope.message_id().as_str(),
            disposition.name(),
            disposition.attempt(),
            details.as_deref(),
        );
    }

    fn invariant_violated(&self, envelope: &Envelope, error: ReprocessorError) -> Disposition {
        ConsumerStats::incr(&self.stats.invariant_violations);
        log_reprocessing_error(
            "scheduler",
            Some(envelope.message_id().as_str()),
            &error,
            Some(&format!("delivery {}", envelope.delivery_key())),
        );
        let disposition = Disposition::Retry {
            reason: error.to_string(),
            delay: Some(self.scheduler.backoff().max_delay()),
        };
        self.log(envelope, &disposition);
        disposition
    }

    fn lookup_failed(&self, envelope: &Envelope, error: ReprocessorError) -> Disposition {
        ConsumerStats::incr(&self.stats.persistence_failures);
        log_reprocessing_error(
            "quarantine",
            Some(envelope.message_id().as_str()),
            &error,
            Some("quarantine lookup"),
        );
        let disposition = Disposition::Retry {
            reason: error.to_string(),
            delay: Some(self.scheduler.backoff().base_delay_for(1)),
        };
        self.log(envelope, &disposition);
        disposition
    }

    fn action_failed(
        &self,
        envelope: &Envelope,
        decision: &Decision,
        classification: &Classification,
        error: ReprocessorError,
    ) -> Disposition {
        let (component, delay) = match (&error, decision) {
            (ReprocessorError::Quarantine(_), _) => {
                ConsumerStats::incr(&self.stats.persistence_failures);
                ("quarantine", self.scheduler.backoff().base_delay_for(1))
            }
            (_, Decision::Redeliver { delay, .. }) => {
                ConsumerStats::incr(&self.stats.publish_failures);
                ("redelivery", *delay)
            }
            _ => {
                ConsumerStats::incr(&self.stats.publish_failures);
                ("redelivery", self.scheduler.backoff().base_delay_for(1))
            }
        };

        warn!(
            message_id = %envelope.message_id(),
            decision = decision.name(),
            kind = %classification.kind,
            transient = error.is_transient(),
            "Outbound action failed; decision not committed"
        );
        log_reprocessing_error(
            component,
            Some(envelope.message_id().as_str()),
            &error,
            Some(decision.name()),
        );

        let disposition = Disposition::Retry {
            reason: error.to_string(),
            delay: Some(delay),
        };
        self.log(envelope, &disposition);
        disposition
    }
}
