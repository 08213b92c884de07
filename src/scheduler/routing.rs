//! Chooses where a redelivered message goes.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::{DelayTierConfig, RedeliveryConfig};
use crate::constants::attributes;
use crate::envelope::Envelope;
use crate::messaging::OutboundMessage;

/// How a redelivery reaches its destination
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum RedeliveryRoute {
    /// Publish now to a delay topic that delivers after `tier_delay`
    DelayTier {
        topic: String,
        tier_delay: Duration,
        original_topic: String,
    },
    /// Nack the DLQ copy with the backoff delay, then publish to
    /// `original_topic` once it comes back eligible
    Hold { original_topic: String },
}

impl RedeliveryRoute {
    pub fn original_topic(&self) -> &str {
        match self {
            Self::DelayTier { original_topic, .. } | Self::Hold { original_topic } => original_topic,
        }
    }

    /// Topic published to when the redelivery is acted on immediately
    pub fn publish_topic(&self) -> Option<&str> {
        match self {
            Self::DelayTier { topic, .. } => Some(topic),
            Self::Hold { .. } => None,
        }
    }
}

impl std::fmt::Display for RedeliveryRoute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DelayTier {
                topic, tier_delay, ..
            } => write!(f, "delay_tier({topic}, {}ms)", tier_delay.as_millis()),
            Self::Hold { original_topic } => write!(f, "hold({original_topic})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RedeliveryRouter {
    original_topic_attribute: String,
    default_topic: Option<String>,
    /// Sorted by ascending delay
    tiers: Vec<DelayTierConfig>,
}

impl RedeliveryRouter {
    pub fn new(
        original_topic_attribute: impl Into<String>,
        default_topic: Option<String>,
        mut tiers: Vec<DelayTierConfig>,
    ) -> Self {
        tiers.sort_by_key(|tier| tier.delay_ms);
        Self {
            original_topic_attribute: original_topic_attribute.into(),
            default_topic,
            tiers,
        }
    }

    pub fn from_config(config: &RedeliveryConfig) -> Self {
        Self::new(
            config.original_topic_attribute.clone(),
            config.default_topic.clone(),
            config.delay_tiers.clone(),
        )
    }

    pub fn original_topic_attribute(&self) -> &str {
        &self.original_topic_attribute
    }

    /// Topic the message was originally published to, if known
    pub fn resolve_topic(&self, envelope: &Envelope) -> Option<String> {
        envelope
            .attribute(&self.original_topic_attribute)
            .map(str::trim)
            .filter(|topic| !topic.is_empty())
            .map(str::to_string)
            .or_else(|| self.default_topic.clone())
    }

    /// Route for a redelivery after `delay`
    ///
    /// Picks the smallest tier whose delay covers `delay`, the largest tier
    /// when none does, and holds the message when no tiers are configured.
    pub fn route(&self, envelope: &Envelope, delay: Duration) -> Option<RedeliveryRoute> {
        let original_topic = self.resolve_topic(envelope)?;

        let tier = self
            .tiers
            .iter()
            .find(|tier| tier.delay() >= delay)
            .or_else(|| self.tiers.last());

        Some(match tier {
            Some(tier) => RedeliveryRoute::DelayTier {
                topic: tier.topic.clone(),
                tier_delay: tier.delay(),
                original_topic,
            },
            None => RedeliveryRoute::Hold { original_topic },
        })
    }

    /// Copy of `envelope` to publish as redelivery `attempt`
    ///
    /// Drops `strip` (the downstream error attributes) and any previous
    /// reprocessor stamps, then stamps the origin id, attempt and original
    /// topic so a copy that fails again maps back to the same message.
    pub fn redelivery_message(
        &self,
        envelope: &Envelope,
        attempt: u32,
        original_topic: &str,
        strip: &[String],
    ) -> OutboundMessage {
        OutboundMessage::new(envelope.payload().to_vec())
            .with_attributes(Self::carried_attributes(envelope, strip))
            .with_attribute(attributes::ORIGIN_MESSAGE_ID, envelope.message_id().as_str())
            .with_attribute(attributes::ATTEMPT, attempt.to_string())
            .with_attribute(self.original_topic_attribute.clone(), original_topic)
    }

    /// Copy of a quarantined envelope for an operator replay
    ///
    /// Carries no origin id, so a replay that fails again starts a fresh
    /// attempt history instead of hitting the quarantine tombstone.
    pub fn replay_message(&self, envelope: &Envelope, original_topic: &str, strip: &[String]) -> OutboundMessage {
        OutboundMessage::new(envelope.payload().to_vec())
            .with_attributes(Self::carried_attributes(envelope, strip))
            .with_attribute(attributes::REPLAYED_FROM, envelope.message_id().as_str())
            .with_attribute(self.original_topic_attribute.clone(), original_topic)
    }

    fn carried_attributes(envelope: &Envelope, strip: &[String]) -> BTreeMap<String, String> {
        envelope
            .attributes()
            .iter()
            .filter(|(key, _)| {
                !strip.iter().any(|s| s == *key)
                    && key.as_str() != attributes::ORIGIN_MESSAGE_ID
                    && key.as_str() != attributes::ATTEMPT
                    && key.as_str() != attributes::REPLAYED_FROM
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::EnvelopeStore;
    use crate::messaging::{BrokerMessage, MessageId, ReceiptHandle};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn envelope(topic: Option<&str>) -> Envelope {
        let mut attributes = BTreeMap::new();
        if let Some(topic) = topic {
            attributes.insert(attributes::ORIGINAL_TOPIC.to_string(), topic.to_string());
        }
        EnvelopeStore::new().normalize(&BrokerMessage {
            message_id: MessageId::new("m-1"),
            receipt_handle: ReceiptHandle::new("1:1"),
            payload: b"{}".to_vec(),
            attributes,
            publish_time: Utc::now(),
            delivery_attempt: 1,
        })
    }

    fn tiers() -> Vec<DelayTierConfig> {
        vec![
            DelayTierConfig {
                delay_ms: 60_000,
                topic: "retry-1m".to_string(),
            },
            DelayTierConfig {
                delay_ms: 10_000,
                topic: "retry-10s".to_string(),
            },
        ]
    }

    #[test]
    fn test_hold_without_tiers() {
        let router = RedeliveryRouter::new(attributes::ORIGINAL_TOPIC, None, Vec::new());
        let route = router.route(&envelope(Some("payments")), Duration::from_secs(5));
        assert_eq!(
            route,
            Some(RedeliveryRoute::Hold {
                original_topic: "payments".to_string()
            })
        );
        assert_eq!(route.unwrap().publish_topic(), None);
    }

    #[test]
    fn test_smallest_covering_tier() {
        let router = RedeliveryRouter::new(attributes::ORIGINAL_TOPIC, None, tiers());
        let route = router
            .route(&envelope(Some("payments")), Duration::from_secs(5))
            .unwrap();
        assert_eq!(route.publish_topic(), Some("retry-10s"));
        assert_eq!(route.original_topic(), "payments");

        let route = router
            .route(&envelope(Some("payments")), Duration::from_secs(30))
            .unwrap();
        assert_eq!(route.publish_topic(), Some("retry-1m"));
    }

    #[test]
    fn test_largest_tier_when_delay_exceeds_all() {
        let router = RedeliveryRouter::new(attributes::ORIGINAL_TOPIC, None, tiers());
        let route = router
            .route(&envelope(Some("payments")), Duration::from_secs(600))
            .unwrap();
        assert_eq!(route.publish_topic(), Some("retry-1m"));
    }

    #[test]
    fn test_default_topic_and_no_route() {
        let router = RedeliveryRouter::new(attributes::ORIGINAL_TOPIC, None, Vec::new());
        assert!(router.route(&envelope(None), Duration::from_secs(1)).is_none());

        let router =
            RedeliveryRouter::new(attributes::ORIGINAL_TOPIC, Some("fallback".to_string()), Vec::new());
        assert_eq!(router.resolve_topic(&envelope(None)).as_deref(), Some("fallback"));
        assert_eq!(
            router.resolve_topic(&envelope(Some("payments"))).as_deref(),
            Some("payments")
        );
    }

    #[test]
    fn test_redelivery_message_stamps_identity_and_strips_errors() {
        let router = RedeliveryRouter::new(attributes::ORIGINAL_TOPIC, None, Vec::new());
        let mut attrs = BTreeMap::new();
        attrs.insert(attributes::ORIGINAL_TOPIC.to_string(), "payments".to_string());
        attrs.insert(attributes::ERROR.to_string(), "connection reset".to_string());
        attrs.insert(attributes::ATTEMPT.to_string(), "1".to_string());
        attrs.insert("tenant".to_string(), "acme".to_string());
        let env = EnvelopeStore::new().normalize(&BrokerMessage {
            message_id: MessageId::new("m-1"),
            receipt_handle: ReceiptHandle::new("m-1:1"),
            payload: b"{}".to_vec(),
            attributes: attrs,
            publish_time: Utc::now(),
            delivery_attempt: 1,
        });

        let strip = vec![attributes::ERROR.to_string()];
        let out = router.redelivery_message(&env, 2, "payments", &strip);
        assert_eq!(out.payload, b"{}".to_vec());
        assert_eq!(out.attributes.get(attributes::ATTEMPT).map(String::as_str), Some("2"));
        assert_eq!(
            out.attributes.get(attributes::ORIGIN_MESSAGE_ID).map(String::as_str),
            Some("m-1")
        );
        assert_eq!(out.attributes.get("tenant").map(String::as_str), Some("acme"));
        assert!(!out.attributes.contains_key(attributes::ERROR));

        let replay = router.replay_message(&env, "payments", &strip);
        assert!(!replay.attributes.contains_key(attributes::ORIGIN_MESSAGE_ID));
        assert!(!replay.attributes.contains_key(attributes::ATTEMPT));
        assert_eq!(
            replay.attributes.get(attributes::REPLAYED_FROM).map(String::as_str),
            Some("m-1")
        );
    }
}
