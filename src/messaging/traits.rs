//! # Broker Client Trait
//!
//! Capability set the reprocessor needs from a managed message broker.
//! The broker is an at-least-once delivery collaborator; this crate does not
//! implement transport, authentication or provisioning.

use std::time::Duration;

use async_trait::async_trait;

use super::errors::MessagingError;
use super::types::{BrokerMessage, MessageId, OutboundMessage, ReceiptHandle};

/// Provider-agnostic broker operations
///
/// Implementations must be safe to share across the consumer's listener and
/// worker tasks. The consumer holds the client as `Arc<dyn BrokerClient>`, so
/// a fake can be injected in tests.
///
/// # Delivery contract
///
/// - A pulled message stays leased until acked, nacked, or its ack deadline
///   expires, after which the broker delivers it again with
///   `delivery_attempt` incremented.
/// - `nack` with a delay hides the message for at least that long.
#[async_trait]
pub trait BrokerClient: Send + Sync + 'static {
    /// Pull up to `max_messages` from a subscription
    ///
    /// Returns an empty vector when nothing is available.
    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<BrokerMessage>, MessagingError>;

    /// Acknowledge a delivery, removing the message from the subscription
    async fn ack(
        &self,
        subscription: &str,
        receipt_handle: &ReceiptHandle,
    ) -> Result<(), MessagingError>;

    /// Negative-acknowledge a delivery
    ///
    /// The broker redelivers the message after `redelivery_delay`, or as
    /// soon as possible when `None`.
    async fn nack(
        &self,
        subscription: &str,
        receipt_handle: &ReceiptHandle,
        redelivery_delay: Option<Duration>,
    ) -> Result<(), MessagingError>;

    /// Publish a message to a topic
    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<MessageId, MessagingError>;

    /// Health check - verify the broker is reachable
    async fn health_check(&self) -> Result<bool, MessagingError>;

    /// Provider name for logging
    fn provider_name(&self) -> &'static str;
}
