//! Quarantine record model, merge rule and query filter.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::FailureKind;
use crate::envelope::Envelope;
use crate::messaging::MessageId;
use crate::scheduler::AttemptSnapshot;

/// Operator action that closed a quarantined message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    pub resolved_at: DateTime<Utc>,
    pub resolved_by: String,
    pub note: Option<String>,
    /// Topic the payload was replayed to, when resolved by replay
    pub replayed_to: Option<String>,
}

impl Resolution {
    pub fn new(resolved_by: impl Into<String>, note: Option<String>) -> Self {
        Self {
            resolved_at: Utc::now(),
            resolved_by: resolved_by.into(),
            note,
            replayed_to: None,
        }
    }
}

/// Durable record of an exhausted or poison message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineRecord {
    pub message_id: MessageId,
    pub envelope: Envelope,
    pub attempt_history: Vec<AttemptSnapshot>,
    pub quarantined_at: DateTime<Utc>,
    pub failure_kind: FailureKind,
    pub reason: String,
    pub resolution: Option<Resolution>,
}

impl QuarantineRecord {
    pub fn is_resolved(&self) -> bool {
        self.resolution.is_some()
    }

    /// Combine a re-persisted record with the stored one
    ///
    /// Keeps the earliest `quarantined_at` and any existing resolution; the
    /// longer attempt history wins, the incoming one on a tie.
    pub fn merge(existing: QuarantineRecord, incoming: QuarantineRecord) -> QuarantineRecord {
        let quarantined_at = existing.quarantined_at.min(incoming.quarantined_at);
        let resolution = existing.resolution.clone().or(incoming.resolution.clone());

        let mut merged = if incoming.attempt_history.len() >= existing.attempt_history.len() {
            incoming
        } else {
            existing
        };
        merged.quarantined_at = quarantined_at;
        merged.resolution = resolution;
        merged
    }
}

/// Filter for the operator read path, ordered by `quarantined_at` ascending
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuarantineQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub failure_kind: Option<FailureKind>,
    pub include_resolved: bool,
    pub limit: Option<usize>,
    pub offset: usize,
}

impl QuarantineQuery {
    /// Unresolved records of any kind
    pub fn unresolved() -> Self {
        Self::default()
    }

    pub fn all() -> Self {
        Self {
            include_resolved: true,
            ..Self::default()
        }
    }

    pub fn between(mut self, from: DateTime<Utc>, to: DateTime<Utc>) -> Self {
        self.from = Some(from);
        self.to = Some(to);
        self
    }

    pub fn with_kind(mut self, kind: FailureKind) -> Self {
        self.failure_kind = Some(kind);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn with_offset(mut self, offset: usize) -> Self {
        self.offset = offset;
        self
    }

    /// `from` is inclusive, `to` exclusive
    pub fn matches(&self, record: &QuarantineRecord) -> bool {
        self.from.map_or(true, |from| record.quarantined_at >= from)
            && self.to.map_or(true, |to| record.quarantined_at < to)
            && self
                .failure_kind
                .map_or(true, |kind| record.failure_kind == kind)
            && (self.include_resolved || !record.is_resolved())
    }

    /// Filter, order and page an in-memory set of records
    pub fn apply<I>(&self, records: I) -> Vec<QuarantineRecord>
    where
        I: IntoIterator<Item = QuarantineRecord>,
    {
        let mut matched: Vec<QuarantineRecord> =
            records.into_iter().filter(|r| self.matches(r)).collect();
        matched.sort_by(|a, b| {
            a.quarantined_at
                .cmp(&b.quarantined_at)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });
        matched
            .into_iter()
            .skip(self.offset)
            .take(self.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

/// Counts over all stored records
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuarantineStats {
    pub total: u64,
    pub transient: u64,
    pub poison: u64,
    pub unknown: u64,
    pub resolved: u64,
}

impl QuarantineStats {
    pub fn from_records<'a, I>(records: I) -> Self
    where
        I: IntoIterator<Item = &'a QuarantineRecord>,
    {
        let mut stats = Self::default();
        for record in records {
            stats.record(record.failure_kind, record.is_resolved());
        }
        stats
    }

    pub(crate) fn record(&mut self, kind: FailureKind, resolved: bool) {
        self.total += 1;
        match kind {
            FailureKind::Transient => self.transient += 1,
            FailureKind::Poison => self.poison += 1,
            FailureKind::Unknown => self.unknown += 1,
        }
        if resolved {
            self.resolved += 1;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::constants::attributes;
    use crate::envelope::EnvelopeStore;
    use crate::messaging::{BrokerMessage, ReceiptHandle};
    use crate::scheduler::AttemptStatus;
    use std::collections::BTreeMap;

    /// Record with `history_len` snapshots, quarantined now
    pub(crate) fn sample_record(id: &str, kind: FailureKind, history_len: u32) -> QuarantineRecord {
        let now = Utc::now();
        let mut attrs = BTreeMap::new();
        attrs.insert(attributes::ORIGINAL_TOPIC.to_string(), "payments".to_string());
        let envelope = EnvelopeStore::new().normalize_at(
            &BrokerMessage {
                message_id: MessageId::new(id),
                receipt_handle: ReceiptHandle::new(format!("{id}:1")),
                payload: br#"{"order_id": 1}"#.to_vec(),
                attributes: attrs,
                publish_time: now,
                delivery_attempt: 1,
            },
            now,
        );

        let attempt_history = (0..history_len)
            .map(|n| AttemptSnapshot {
                attempt_count: n,
                kind,
                reason: format!("failure {n}"),
                status: if n + 1 == history_len {
                    AttemptStatus::Quarantined
                } else {
                    AttemptStatus::Redelivering
                },
                observed_at: now,
                delivery: envelope.delivery_key(),
                delay_ms: None,
                next_eligible_at: None,
                route: None,
            })
            .collect();

        QuarantineRecord {
            message_id: MessageId::new(id),
            envelope,
            attempt_history,
            quarantined_at: now,
            failure_kind: kind,
            reason: "exhausted".to_string(),
            resolution: None,
        }
    }

    #[test]
    fn test_merge_keeps_earliest_timestamp_and_longest_history() {
        let mut first = sample_record("m-1", FailureKind::Transient, 2);
        first.quarantined_at -= chrono::Duration::minutes(5);
        let second = sample_record("m-1", FailureKind::Transient, 4);

        let merged = QuarantineRecord::merge(first.clone(), second.clone());
        assert_eq!(merged.quarantined_at, first.quarantined_at);
        assert_eq!(merged.attempt_history.len(), 4);

        let merged = QuarantineRecord::merge(second, first.clone());
        assert_eq!(merged.attempt_history.len(), 4);
        assert_eq!(merged.quarantined_at, first.quarantined_at);
    }

    #[test]
    fn test_merge_keeps_existing_resolution() {
        let mut existing = sample_record("m-1", FailureKind::Poison, 1);
        existing.resolution = Some(Resolution::new("alice", Some("fixed upstream".to_string())));
        let incoming = sample_record("m-1", FailureKind::Poison, 1);

        let merged = QuarantineRecord::merge(existing.clone(), incoming);
        assert_eq!(merged.resolution, existing.resolution);
    }

    #[test]
    fn test_query_filters_and_pages() {
        let base = Utc::now();
        let records: Vec<QuarantineRecord> = (0..5)
            .map(|n| {
                let kind = if n % 2 == 0 {
                    FailureKind::Poison
                } else {
                    FailureKind::Transient
                };
                let mut r = sample_record(&format!("m-{n}"), kind, 1);
                r.quarantined_at = base + chrono::Duration::seconds(n);
                if n == 4 {
                    r.resolution = Some(Resolution::new("ops", None));
                }
                r
            })
            .collect();

        let poison = QuarantineQuery::unresolved()
            .with_kind(FailureKind::Poison)
            .apply(records.clone());
        let ids: Vec<&str> = poison.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m-0", "m-2"]);

        let window = QuarantineQuery::all()
            .between(base + chrono::Duration::seconds(1), base + chrono::Duration::seconds(4))
            .apply(records.clone());
        assert_eq!(window.len(), 3);

        let page = QuarantineQuery::all()
            .with_offset(1)
            .with_limit(2)
            .apply(records.clone());
        let ids: Vec<&str> = page.iter().map(|r| r.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m-1", "m-2"]);

        let stats = QuarantineStats::from_records(records.iter());
        assert_eq!(stats.total, 5);
        assert_eq!(stats.poison, 3);
        assert_eq!(stats.transient, 2);
        assert_eq!(stats.resolved, 1);
    }
}
