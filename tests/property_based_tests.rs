mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::strategies::*;
use dlq_reprocessor::classifier::{Classification, FailureKind};
use dlq_reprocessor::config::DelayTierConfig;
use dlq_reprocessor::constants::attributes;
use dlq_reprocessor::envelope::{Envelope, EnvelopeStore};
use dlq_reprocessor::messaging::{BrokerMessage, MessageId, ReceiptHandle};
use dlq_reprocessor::scheduler::{
    BackoffPolicy, Decision, RedeliveryRouter, RedeliveryScheduler, SchedulerPolicy,
};
use proptest::prelude::*;

const UNKNOWN_CEILING: u32 = 2;

#[derive(Debug, Default)]
struct Outcome {
    redeliveries: u32,
    quarantines: u32,
    replays: usize,
    duplicates: usize,
    unexpected: Vec<String>,
}

fn scheduler(max_attempts: u32) -> RedeliveryScheduler {
    RedeliveryScheduler::new(
        SchedulerPolicy {
            max_attempts,
            unknown_max_attempts: UNKNOWN_CEILING,
            tombstone_ttl: Duration::from_secs(24 * 60 * 60),
            record_ttl: Duration::from_secs(24 * 60 * 60),
        },
        BackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10), 2.0, 0.5),
        RedeliveryRouter::new(
            attributes::ORIGINAL_TOPIC,
            None,
            vec![DelayTierConfig {
                delay_ms: 60_000,
                topic: "payments-retry".to_string(),
            }],
        ),
    )
}

fn delivery(store: &EnvelopeStore, attempt: Option<u32>, now: DateTime<Utc>) -> Envelope {
    let mut attrs = BTreeMap::new();
    attrs.insert(attributes::ORIGINAL_TOPIC.to_string(), "payments".to_string());
    let delivery_id = match attempt {
        Some(n) => {
            attrs.insert(attributes::ORIGIN_MESSAGE_ID.to_string(), "m-1".to_string());
            attrs.insert(attributes::ATTEMPT.to_string(), n.to_string());
            format!("c-{n}")
        }
        None => "m-1".to_string(),
    };
    store.normalize_at(
        &BrokerMessage {
            message_id: MessageId::new(delivery_id.clone()),
            receipt_handle: ReceiptHandle::new(format!("{delivery_id}:1")),
            payload: br#"{"payment_id": 1}"#.to_vec(),
            attributes: attrs,
            publish_time: now,
            delivery_attempt: 1,
        },
        now,
    )
}

async fn step(
    scheduler: &RedeliveryScheduler,
    envelope: &Envelope,
    kind: FailureKind,
    now: DateTime<Utc>,
) -> Decision {
    let classification = Classification {
        kind,
        reason: format!("{kind} failure"),
        matched_signature: None,
    };
    let mut guard = scheduler.lock(envelope.message_id()).await;
    let decision = guard
        .plan(envelope, &classification, now)
        .unwrap_or_else(|violation| panic!("plan failed: {violation}"));
    guard
        .commit(envelope, &decision, now)
        .unwrap_or_else(|violation| panic!("commit failed: {violation}"));
    decision
}

/// Drive one message to quarantine, replaying earlier deliveries in between
async fn run_deliveries(max_attempts: u32, kind: FailureKind, pattern: &[u8]) -> Outcome {
    let scheduler = scheduler(max_attempts);
    let store = EnvelopeStore::new();
    let mut now = Utc::now();
    let mut outcome = Outcome::default();
    let mut seen: Vec<Envelope> = Vec::new();
    let mut current = delivery(&store, None, now);

    for round in 0.. {
        now += chrono::Duration::hours(1);
        let decision = step(&scheduler, &current, kind, now).await;
        seen.push(current.clone());

        let next = match decision {
            Decision::Redeliver { attempt, .. } => {
                outcome.redeliveries += 1;
                if attempt != outcome.redeliveries {
                    outcome
                        .unexpected
                        .push(format!("attempt {attempt} after {} redeliveries", outcome.redeliveries - 1));
                }
                Some(delivery(&store, Some(attempt), now))
            }
            Decision::Quarantine { .. } => {
                outcome.quarantines += 1;
                None
            }
            other => {
                outcome.unexpected.push(format!("mainline decision {other:?}"));
                None
            }
        };

        let replays = pattern[round % pattern.len()] as usize;
        outcome.replays += replays;
        for i in 0..replays {
            now += chrono::Duration::hours(1);
            let stale = seen[(round + i) % seen.len()].clone();
            match step(&scheduler, &stale, kind, now).await {
                Decision::Duplicate { .. } => outcome.duplicates += 1,
                other => outcome.unexpected.push(format!("replay decision {other:?}")),
            }
        }

        match next {
            Some(envelope) => current = envelope,
            None => break,
        }
        if round > 64 {
            outcome.unexpected.push("no quarantine after 64 rounds".to_string());
            break;
        }
    }

    // Every copy ever seen is a duplicate once the message is quarantined
    for envelope in &seen {
        now += chrono::Duration::hours(1);
        if !matches!(step(&scheduler, envelope, kind, now).await, Decision::Duplicate { .. }) {
            outcome.unexpected.push("post-quarantine delivery acted on".to_string());
        }
    }
    outcome
}

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap()
}

proptest! {
    /// Property: un-jittered delays never decrease and never exceed the cap
    #[test]
    fn backoff_is_monotonic_and_capped(policy in backoff_policy_strategy(), attempt in 1u32..64) {
        let current = policy.base_delay_for(attempt);
        let next = policy.base_delay_for(attempt + 1);
        prop_assert!(current <= next, "{:?} > {:?} at attempt {}", current, next, attempt);
        prop_assert!(next <= policy.max_delay());
    }

    /// Property: jitter only lengthens the delay, and never past the cap
    #[test]
    fn jittered_delay_stays_within_bounds(policy in backoff_policy_strategy(), attempt in 1u32..64) {
        let base = policy.base_delay_for(attempt);
        let jittered = policy.delay_for(attempt);
        // Float round-trips may shave a nanosecond
        prop_assert!(jittered + Duration::from_micros(1) >= base, "{:?} < {:?}", jittered, base);
        prop_assert!(jittered <= policy.max_delay());
    }

    /// Property: however deliveries are duplicated, a message is quarantined
    /// exactly once and redelivered no more than its ceiling allows
    #[test]
    fn duplicates_never_cause_extra_actions(
        max_attempts in 1u32..6,
        kind in failure_kind_strategy(),
        pattern in duplicate_pattern_strategy(),
    ) {
        let outcome = runtime().block_on(run_deliveries(max_attempts, kind, &pattern));

        prop_assert!(outcome.unexpected.is_empty(), "{:?}", outcome.unexpected);
        prop_assert_eq!(outcome.quarantines, 1);
        prop_assert_eq!(outcome.duplicates, outcome.replays);

        let ceiling = match kind {
            FailureKind::Poison => 0,
            FailureKind::Unknown => max_attempts.min(UNKNOWN_CEILING),
            FailureKind::Transient => max_attempts,
        };
        prop_assert_eq!(outcome.redeliveries, ceiling);
    }
}
