//! # Messaging Types
//!
//! Provider-agnostic message types exchanged with a [`BrokerClient`](super::BrokerClient).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a broker message
///
/// The format is provider-specific (numeric ids, UUIDs, opaque strings).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub String);

impl MessageId {
    /// Create a new message ID
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<u64> for MessageId {
    fn from(id: u64) -> Self {
        Self(id.to_string())
    }
}

/// Handle for acknowledging a received message
///
/// Distinct from [`MessageId`]: a broker may hand out a new receipt for each
/// delivery of the same message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReceiptHandle(pub String);

impl ReceiptHandle {
    /// Create a new receipt handle
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Get the inner string value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for ReceiptHandle {
    fn from(handle: String) -> Self {
        Self(handle)
    }
}

impl From<&str> for ReceiptHandle {
    fn from(handle: &str) -> Self {
        Self(handle.to_string())
    }
}

/// A raw message as delivered by the broker subscription
#[derive(Debug, Clone)]
pub struct BrokerMessage {
    /// Broker-assigned message id of this copy
    pub message_id: MessageId,

    /// Handle for ack/nack of this delivery
    pub receipt_handle: ReceiptHandle,

    /// Opaque payload bytes
    pub payload: Vec<u8>,

    /// Message attributes
    pub attributes: BTreeMap<String, String>,

    /// When the broker accepted the message
    pub publish_time: DateTime<Utc>,

    /// Number of times the broker has delivered this message (1-based)
    pub delivery_attempt: u32,
}

/// A message to publish to a topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub payload: Vec<u8>,
    pub attributes: BTreeMap<String, String>,
}

impl OutboundMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            attributes: BTreeMap::new(),
        }
    }

    /// Set an attribute, replacing any existing value
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn with_attributes(mut self, attributes: BTreeMap<String, String>) -> Self {
        self.attributes.extend(attributes);
        self
    }
}

/// Subscription statistics from providers that track them
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub subscription: String,
    /// Messages waiting (visible + invisible)
    pub message_count: u64,
    /// Messages currently leased to a consumer
    pub in_flight_count: u64,
    pub total_delivered: u64,
    pub total_acked: u64,
    pub total_nacked: u64,
}
