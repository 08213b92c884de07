//! # Message Envelopes
//!
//! Normalizes raw [`BrokerMessage`]s into immutable [`Envelope`]s.
//!
//! A logical message keeps one `message_id` across its whole reprocessing
//! life: copies republished by the engine carry the original id in
//! [`attributes::ORIGIN_MESSAGE_ID`], and [`EnvelopeStore::normalize`] maps
//! them back to it. The broker-assigned id of the concrete copy is kept as
//! the `delivery_id`.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::constants::attributes;
use crate::messaging::{BrokerMessage, MessageId};

/// Identifies one concrete delivery of one broker copy
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeliveryKey {
    pub delivery_id: MessageId,
    pub delivery_attempt: u32,
}

impl std::fmt::Display for DeliveryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.delivery_id, self.delivery_attempt)
    }
}

/// Normalized, immutable view of a received message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    message_id: MessageId,
    delivery_id: MessageId,
    payload: Vec<u8>,
    attributes: BTreeMap<String, String>,
    first_seen_at: DateTime<Utc>,
    delivery_attempt: u32,
    publish_time: DateTime<Utc>,
}

impl Envelope {
    /// Stable id of the logical message
    pub fn message_id(&self) -> &MessageId {
        &self.message_id
    }

    /// Broker id of this copy
    pub fn delivery_id(&self) -> &MessageId {
        &self.delivery_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn attributes(&self) -> &BTreeMap<String, String> {
        &self.attributes
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn first_seen_at(&self) -> DateTime<Utc> {
        self.first_seen_at
    }

    /// Broker-reported delivery count of this copy
    pub fn delivery_attempt(&self) -> u32 {
        self.delivery_attempt
    }

    pub fn publish_time(&self) -> DateTime<Utc> {
        self.publish_time
    }

    pub fn delivery_key(&self) -> DeliveryKey {
        DeliveryKey {
            delivery_id: self.delivery_id.clone(),
            delivery_attempt: self.delivery_attempt,
        }
    }

    /// Redelivery attempt stamped on this copy when the engine republished it
    pub fn redelivery_attempt(&self) -> Option<u32> {
        self.attribute(attributes::ATTEMPT)
            .and_then(|value| value.trim().parse().ok())
    }

    /// Whether this copy was republished by the reprocessor
    pub fn is_republished(&self) -> bool {
        self.attribute(attributes::ORIGIN_MESSAGE_ID).is_some()
    }

    /// Lossy UTF-8 rendering of at most `max_bytes` of the payload
    pub fn payload_preview(&self, max_bytes: usize) -> String {
        let end = self.payload.len().min(max_bytes);
        let mut preview = String::from_utf8_lossy(&self.payload[..end]).into_owned();
        if self.payload.len() > max_bytes {
            preview.push_str("...");
        }
        preview
    }
}

/// Builds envelopes and remembers when each logical message was first seen
#[derive(Debug, Default)]
pub struct EnvelopeStore {
    first_seen: DashMap<MessageId, DateTime<Utc>>,
}

impl EnvelopeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Normalize a broker message into an envelope
    pub fn normalize(&self, message: &BrokerMessage) -> Envelope {
        self.normalize_at(message, Utc::now())
    }

    pub fn normalize_at(&self, message: &BrokerMessage, now: DateTime<Utc>) -> Envelope {
        let message_id = message
            .attributes
            .get(attributes::ORIGIN_MESSAGE_ID)
            .map(|id| id.trim())
            .filter(|id| !id.is_empty())
            .map(MessageId::new)
            .unwrap_or_else(|| message.message_id.clone());

        let first_seen_at = *self
            .first_seen
            .entry(message_id.clone())
            .or_insert(now)
            .value();

        Envelope {
            message_id,
            delivery_id: message.message_id.clone(),
            payload: message.payload.clone(),
            attributes: message.attributes.clone(),
            first_seen_at,
            delivery_attempt: message.delivery_attempt.max(1),
            publish_time: message.publish_time,
        }
    }

    pub fn first_seen(&self, message_id: &MessageId) -> Option<DateTime<Utc>> {
        self.first_seen.get(message_id).map(|entry| *entry.value())
    }

    /// Drop the first-seen entry of a message that reached a terminal state
    pub fn forget(&self, message_id: &MessageId) {
        self.first_seen.remove(message_id);
    }

    /// Evict entries first seen more than `age` ago, except those `in_use`
    /// still reports, returning how many were removed
    pub fn evict_older_than<F>(&self, age: Duration, in_use: F) -> usize
    where
        F: Fn(&MessageId) -> bool,
    {
        let cutoff = chrono::Duration::from_std(age)
            .ok()
            .and_then(|age| Utc::now().checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let before = self.first_seen.len();
        self.first_seen
            .retain(|message_id, seen| *seen >= cutoff || in_use(message_id));
        before.saturating_sub(self.first_seen.len())
    }

    pub fn len(&self) -> usize {
        self.first_seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.first_seen.is_empty()
    }
}
