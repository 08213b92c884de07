//! # Redelivery Scheduler
//!
//! Owns the per-message [`AttemptRecord`] store and decides, for each
//! classified delivery, whether to redeliver, hold, quarantine or ignore it.
//!
//! ## State machine
//!
//! ```text
//! Pending ──▶ Redelivering ──▶ Resolved
//!    │             │
//!    └─────────────┴──────────▶ Quarantined (exactly once, then tombstoned)
//! ```
//!
//! ## Concurrency
//!
//! Every message id maps to its own async mutex. A worker takes the lock
//! with [`RedeliveryScheduler::lock`], plans a [`Decision`], performs the
//! outbound side effect, and only then commits the decision. A decision that
//! was never committed leaves the record untouched, so a failed publish or
//! quarantine write can simply be retried on the next delivery.

pub mod attempts;
pub mod backoff;
pub mod routing;

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, instrument};

use crate::classifier::{Classification, FailureKind};
use crate::config::{ReprocessorConfig, SchedulerConfig};
use crate::envelope::Envelope;
use crate::messaging::MessageId;
use crate::quarantine::QuarantineRecord;

pub use attempts::{AttemptRecord, AttemptSnapshot, AttemptStatus};
pub use backoff::BackoffPolicy;
pub use routing::{RedeliveryRoute, RedeliveryRouter};

/// A broken scheduler invariant. Fatal to the affected message's path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerInvariantViolation {
    #[error("Message {message_id} has an active attempt record and a quarantine tombstone")]
    ActiveRecordAfterQuarantine { message_id: String },

    #[error("Attempt record for {found} is stored under key {expected}")]
    KeyMismatch { expected: String, found: String },

    #[error("Attempt count for {message_id} would not advance: current {current}, proposed {proposed}")]
    AttemptCountRegression {
        message_id: String,
        current: u32,
        proposed: u32,
    },

    #[error("Decision for {message_id} no longer matches its attempt record: {detail}")]
    StaleDecision { message_id: String, detail: String },
}

/// Attempt ceilings, tombstone retention and idle record retention
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerPolicy {
    pub max_attempts: u32,
    pub unknown_max_attempts: u32,
    pub tombstone_ttl: Duration,
    pub record_ttl: Duration,
}

impl SchedulerPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            unknown_max_attempts: config.unknown_max_attempts,
            tombstone_ttl: config.tombstone_ttl(),
            record_ttl: config.record_ttl(),
        }
    }

    pub fn ceiling_for(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::Unknown => self.unknown_max_attempts.min(self.max_attempts),
            FailureKind::Transient | FailureKind::Poison => self.max_attempts,
        }
    }
}

impl Default for SchedulerPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

/// Why a delivery needs no action
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DuplicateReason {
    /// This exact delivery was already acted on
    AlreadyProcessed,
    /// The message is quarantined
    AlreadyQuarantined,
    /// Copy of an attempt that has since been superseded
    StaleAttempt { attempt: u32, current: u32 },
}

impl std::fmt::Display for DuplicateReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyProcessed => write!(f, "already_processed"),
            Self::AlreadyQuarantined => write!(f, "already_quarantined"),
            Self::StaleAttempt { attempt, current } => {
                write!(f, "stale_attempt({attempt} < {current})")
            }
        }
    }
}

/// What to do with one delivery
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Schedule redelivery `attempt` after `delay`
    Redeliver {
        attempt: u32,
        delay: Duration,
        next_eligible_at: DateTime<Utc>,
        route: RedeliveryRoute,
        kind: FailureKind,
        reason: String,
    },
    /// Backoff of a held redelivery elapsed: publish it now
    Dispatch { attempt: u32, topic: String },
    /// Arrived before it was eligible; nack for the remaining time
    Defer { remaining: Duration },
    Quarantine { record: Box<QuarantineRecord> },
    Duplicate { reason: DuplicateReason },
}

impl Decision {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Redeliver { .. } => "redeliver",
            Self::Dispatch { .. } => "dispatch",
            Self::Defer { .. } => "defer",
            Self::Quarantine { .. } => "quarantine",
            Self::Duplicate { .. } => "duplicate",
        }
    }
}

/// Marker kept after a quarantine so late duplicates are recognized
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tombstone {
    pub quarantined_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Tombstone {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

#[derive(Debug, Default)]
struct Slot {
    record: Option<AttemptRecord>,
    tombstone: Option<Tombstone>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.record.is_none() && self.tombstone.is_none()
    }
}

#[derive(Debug)]
pub struct RedeliveryScheduler {
    policy: SchedulerPolicy,
    backoff: BackoffPolicy,
    router: RedeliveryRouter,
    slots: DashMap<MessageId, Arc<Mutex<Slot>>>,
}

impl RedeliveryScheduler {
    pub fn new(policy: SchedulerPolicy, backoff: BackoffPolicy, router: RedeliveryRouter) -> Self {
        Self {
            policy,
            backoff,
            router,
            slots: DashMap::new(),
        }
    }

    pub fn from_config(config: &ReprocessorConfig) -> Self {
        Self::new(
            SchedulerPolicy::from_config(&config.scheduler),
            BackoffPolicy::from_config(&config.scheduler.backoff),
            RedeliveryRouter::from_config(&config.redelivery),
        )
    }

    pub fn policy(&self) -> &SchedulerPolicy {
        &self.policy
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    pub fn router(&self) -> &RedeliveryRouter {
        &self.router
    }

    /// Take exclusive ownership of a message's attempt state
    pub async fn lock(&self, message_id: &MessageId) -> AttemptGuard<'_> {
        let slot = self.slots.entry(message_id.clone()).or_default().clone();
        let mut slot = slot.lock_owned().await;

        let now = Utc::now();
        if slot.tombstone.map(|t| t.is_expired(now)).unwrap_or(false) {
            slot.tombstone = None;
        }

        AttemptGuard {
            slot,
            owner: SlotOwner {
                scheduler: self,
                message_id: message_id.clone(),
            },
        }
    }

    /// Copy of the current record, if any
    pub async fn record(&self, message_id: &MessageId) -> Option<AttemptRecord> {
        self.lock(message_id).await.record().cloned()
    }

    pub async fn is_quarantined(&self, message_id: &MessageId) -> bool {
        self.lock(message_id).await.tombstone().is_some()
    }

    /// Downstream success: discard the record and return it as `Resolved`
    #[instrument(skip(self, message_id), fields(message_id = %message_id))]
    pub async fn resolve(&self, message_id: &MessageId) -> Option<AttemptRecord> {
        let mut guard = self.lock(message_id).await;
        let mut record = guard.slot.record.take()?;
        record.status = AttemptStatus::Resolved;
        debug!(attempt_count = record.attempt_count, "Attempt record resolved");
        Some(record)
    }

    /// Drop expired tombstones, returning how many were removed
    pub fn purge_tombstones(&self) -> usize {
        let now = Utc::now();
        let mut purged = 0;
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(mut slot) => {
                    if slot.tombstone.map(|t| t.is_expired(now)).unwrap_or(false) {
                        slot.tombstone = None;
                        purged += 1;
                    }
                    !slot.is_empty()
                }
                Err(_) => true,
            }
        });
        purged
    }

    /// Drop attempt records idle for longer than the record TTL
    ///
    /// A redelivery that succeeded downstream is usually never resolved
    /// explicitly; its record is only reclaimed here. A copy that fails again
    /// after eviction recovers its count from the attempt stamp it carries.
    pub fn evict_idle_records(&self) -> usize {
        let now = Utc::now();
        let ttl = self.policy.record_ttl;
        let mut evicted = 0;
        self.slots.retain(|_, slot| {
            if Arc::strong_count(slot) > 1 {
                return true;
            }
            match slot.try_lock() {
                Ok(mut slot) => {
                    let idle = slot
                        .record
                        .as_ref()
                        .map(|record| add_saturating(record.last_activity(), ttl) <= now)
                        .unwrap_or(false);
                    if idle {
                        slot.record = None;
                        evicted += 1;
                    }
                    !slot.is_empty()
                }
                Err(_) => true,
            }
        });
        evicted
    }

    /// Whether any state is held for `message_id`
    pub fn is_tracked(&self, message_id: &MessageId) -> bool {
        self.slots.contains_key(message_id)
    }

    /// Messages with a live attempt record (best effort; skips locked slots)
    pub fn active_records(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|slot| slot.record.is_some())
                    .unwrap_or(true)
            })
            .count()
    }

    pub fn tombstone_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| {
                entry
                    .value()
                    .try_lock()
                    .map(|slot| slot.tombstone.is_some())
                    .unwrap_or(false)
            })
            .count()
    }
}

/// Removes an empty slot once nobody else references it
#[derive(Debug)]
struct SlotOwner<'a> {
    scheduler: &'a RedeliveryScheduler,
    message_id: MessageId,
}

impl Drop for SlotOwner<'_> {
    fn drop(&mut self) {
        self.scheduler.slots.remove_if(&self.message_id, |_, slot| {
            Arc::strong_count(slot) == 1
                && slot.try_lock().map(|s| s.is_empty()).unwrap_or(false)
        });
    }
}

/// Exclusive access to one message's attempt state
///
/// Field order matters: the slot lock is released before the owner drops.
#[derive(Debug)]
pub struct AttemptGuard<'a> {
    slot: OwnedMutexGuard<Slot>,
    owner: SlotOwner<'a>,
}

impl AttemptGuard<'_> {
    pub fn message_id(&self) -> &MessageId {
        &self.owner.message_id
    }

    pub fn record(&self) -> Option<&AttemptRecord> {
        self.slot.record.as_ref()
    }

    pub fn tombstone(&self) -> Option<&Tombstone> {
        self.slot.tombstone.as_ref()
    }

    fn check_invariants(&self) -> Result<(), SchedulerInvariantViolation> {
        let message_id = self.message_id();
        if let Some(record) = &self.slot.record {
            if self.slot.tombstone.is_some() {
                return Err(SchedulerInvariantViolation::ActiveRecordAfterQuarantine {
                    message_id: message_id.to_string(),
                });
            }
            if &record.message_id != message_id {
                return Err(SchedulerInvariantViolation::KeyMismatch {
                    expected: message_id.to_string(),
                    found: record.message_id.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Decide what to do with `envelope`, without changing any state
    pub fn plan(
        &self,
        envelope: &Envelope,
        classification: &Classification,
        now: DateTime<Utc>,
    ) -> Result<Decision, SchedulerInvariantViolation> {
        self.check_invariants()?;
        let scheduler = self.owner.scheduler;

        if self.slot.tombstone.is_some() {
            return Ok(Decision::Duplicate {
                reason: DuplicateReason::AlreadyQuarantined,
            });
        }

        let record = self.slot.record.as_ref();
        if let Some(record) = record {
            if record.last_delivery.as_ref() == Some(&envelope.delivery_key()) {
                return Ok(Decision::Duplicate {
                    reason: DuplicateReason::AlreadyProcessed,
                });
            }

            if let Some(remaining) = record.remaining_backoff(now) {
                return Ok(Decision::Defer { remaining });
            }

            if record.is_held() {
                if let Some(topic) = scheduler.router.resolve_topic(envelope) {
                    return Ok(Decision::Dispatch {
                        attempt: record.attempt_count,
                        topic,
                    });
                }
            }

            let seen_attempt = envelope.redelivery_attempt().unwrap_or(0);
            if seen_attempt < record.attempt_count {
                return Ok(Decision::Duplicate {
                    reason: DuplicateReason::StaleAttempt {
                        attempt: seen_attempt,
                        current: record.attempt_count,
                    },
                });
            }
        }

        let kind = classification.kind;
        let attempt_count = self.attempts_seen(envelope);
        let ceiling = scheduler.policy.ceiling_for(kind);

        if !kind.is_retryable() {
            return Ok(self.quarantine(envelope, classification, classification.reason.clone(), now));
        }

        if attempt_count >= ceiling {
            let reason = format!(
                "attempt ceiling {ceiling} reached for {kind} failure: {}",
                classification.reason
            );
            return Ok(self.quarantine(envelope, classification, reason, now));
        }

        let attempt = attempt_count + 1;
        let delay = scheduler.backoff.delay_for(attempt);
        let Some(route) = scheduler.router.route(envelope, delay) else {
            let reason = format!("no redelivery route: {}", classification.reason);
            return Ok(self.quarantine(envelope, classification, reason, now));
        };

        Ok(Decision::Redeliver {
            attempt,
            delay,
            next_eligible_at: add_saturating(now, delay),
            route,
            kind,
            reason: classification.reason.clone(),
        })
    }

    /// Attempts already made for this message
    ///
    /// The record is authoritative when it is ahead; the stamp on a
    /// republished copy covers attempts this process has no record of.
    fn attempts_seen(&self, envelope: &Envelope) -> u32 {
        let recorded = self.slot.record.as_ref().map(|r| r.attempt_count).unwrap_or(0);
        recorded.max(envelope.redelivery_attempt().unwrap_or(0))
    }

    fn quarantine(
        &self,
        envelope: &Envelope,
        classification: &Classification,
        reason: String,
        now: DateTime<Utc>,
    ) -> Decision {
        let record = self.slot.record.as_ref();
        let attempt_count = self.attempts_seen(envelope);
        let mut attempt_history = record.map(|r| r.history.clone()).unwrap_or_default();
        if record.map(|r| r.attempt_count).unwrap_or(0) < attempt_count {
            attempt_history.push(recovered_snapshot(envelope, classification.kind, attempt_count));
        }
        attempt_history.push(AttemptSnapshot {
            attempt_count,
            kind: classification.kind,
            reason: reason.clone(),
            status: AttemptStatus::Quarantined,
            observed_at: now,
            delivery: envelope.delivery_key(),
            delay_ms: None,
            next_eligible_at: None,
            route: None,
        });

        Decision::Quarantine {
            record: Box::new(QuarantineRecord {
                message_id: self.message_id().clone(),
                envelope: envelope.clone(),
                attempt_history,
                quarantined_at: now,
                failure_kind: classification.kind,
                reason,
                resolution: None,
            }),
        }
    }

    /// Apply a decision whose side effect has completed
    pub fn commit(
        &mut self,
        envelope: &Envelope,
        decision: &Decision,
        now: DateTime<Utc>,
    ) -> Result<(), SchedulerInvariantViolation> {
        self.check_invariants()?;
        let scheduler = self.owner.scheduler;
        let message_id = self.message_id().clone();

        match decision {
            Decision::Duplicate { .. } | Decision::Defer { .. } => Ok(()),

            Decision::Dispatch { attempt, topic } => {
                let record = self.slot.record.as_mut().filter(|r| r.is_held()).ok_or_else(|| {
                    SchedulerInvariantViolation::StaleDecision {
                        message_id: message_id.to_string(),
                        detail: "dispatch without a held redelivery".to_string(),
                    }
                })?;
                if record.attempt_count != *attempt {
                    return Err(SchedulerInvariantViolation::StaleDecision {
                        message_id: message_id.to_string(),
                        detail: format!(
                            "dispatch planned for attempt {attempt}, record is at {}",
                            record.attempt_count
                        ),
                    });
                }

                record.redelivered_at = Some(now);
                record.last_delivery = Some(envelope.delivery_key());
                record.history.push(AttemptSnapshot {
                    attempt_count: record.attempt_count,
                    kind: record.last_error_kind,
                    reason: "held redelivery dispatched".to_string(),
                    status: AttemptStatus::Redelivering,
                    observed_at: now,
                    delivery: envelope.delivery_key(),
                    delay_ms: None,
                    next_eligible_at: record.next_eligible_at,
                    route: Some(topic.clone()),
                });
                Ok(())
            }

            Decision::Redeliver {
                attempt,
                delay,
                next_eligible_at,
                route,
                kind,
                reason,
            } => {
                let current = self.slot.record.as_ref().map(|r| r.attempt_count).unwrap_or(0);
                if *attempt <= current {
                    return Err(SchedulerInvariantViolation::AttemptCountRegression {
                        message_id: message_id.to_string(),
                        current,
                        proposed: *attempt,
                    });
                }

                let record = self
                    .slot
                    .record
                    .get_or_insert_with(|| AttemptRecord::new(message_id.clone(), *kind, now));
                let previous = attempt - 1;
                if record.attempt_count < previous {
                    record.history.push(recovered_snapshot(envelope, *kind, previous));
                }
                record.attempt_count = *attempt;
                record.last_error_kind = *kind;
                record.next_eligible_at = Some(*next_eligible_at);
                record.status = AttemptStatus::Redelivering;
                record.last_delivery = Some(envelope.delivery_key());
                record.redelivered_at = route.publish_topic().map(|_| now);
                record.history.push(AttemptSnapshot {
                    attempt_count: *attempt,
                    kind: *kind,
                    reason: reason.clone(),
                    status: AttemptStatus::Redelivering,
                    observed_at: now,
                    delivery: envelope.delivery_key(),
                    delay_ms: Some(delay.as_millis() as u64),
                    next_eligible_at: Some(*next_eligible_at),
                    route: Some(route.to_string()),
                });
                Ok(())
            }

            Decision::Quarantine { record } => {
                self.slot.record = None;
                self.slot.tombstone = Some(Tombstone {
                    quarantined_at: record.quarantined_at,
                    expires_at: add_saturating(now, scheduler.policy.tombstone_ttl),
                });
                Ok(())
            }
        }
    }

    /// Mark the message quarantined by an earlier run
    ///
    /// Used when the quarantine store already holds an unresolved record but
    /// this process has no tombstone for it.
    pub fn restore_tombstone(&mut self, quarantined_at: DateTime<Utc>, now: DateTime<Utc>) {
        let ttl = self.owner.scheduler.policy.tombstone_ttl;
        self.slot.record = None;
        self.slot.tombstone = Some(Tombstone {
            quarantined_at,
            expires_at: add_saturating(now, ttl),
        });
    }

    /// Remember a failure whose decision could not be carried out
    ///
    /// Only creates a `Pending` record when none exists, so the failure kind
    /// is kept for the next delivery without consuming an attempt.
    pub fn record_pending(&mut self, classification: &Classification, now: DateTime<Utc>) {
        if self.slot.record.is_some() || self.slot.tombstone.is_some() {
            return;
        }
        let message_id = self.message_id().clone();
        self.slot.record = Some(AttemptRecord::new(message_id, classification.kind, now));
    }
}

/// Placeholder for attempts made before this process kept a record
fn recovered_snapshot(envelope: &Envelope, kind: FailureKind, attempt_count: u32) -> AttemptSnapshot {
    AttemptSnapshot {
        attempt_count,
        kind,
        reason: format!("attempts 1..={attempt_count} recovered from redelivery stamp"),
        status: AttemptStatus::Redelivering,
        observed_at: envelope.publish_time(),
        delivery: envelope.delivery_key(),
        delay_ms: None,
        next_eligible_at: None,
        route: None,
    }
}

/// `now + duration`, saturating at the latest representable instant
fn add_saturating(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(duration)
        .ok()
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
