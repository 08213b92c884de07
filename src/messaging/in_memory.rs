//! # In-Memory Broker
//!
//! Thread-safe in-memory broker for testing and development.
//!
//! ## Features
//!
//! - **Ack Deadline**: pulled messages become invisible and reappear, with
//!   `delivery_attempt` incremented, if not acked before the deadline
//! - **Delayed Nack**: `nack` with a delay hides the message for that long
//! - **Topic Fan-out**: publishing to a topic copies the message into every
//!   subscription attached to it
//! - **Fault Injection**: queue errors to be returned by the next
//!   pull/ack/nack/publish calls

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::RwLock;

use super::errors::MessagingError;
use super::traits::BrokerClient;
use super::types::{
    BrokerMessage, MessageId, OutboundMessage, ReceiptHandle, SubscriptionStats,
};

/// Default ack deadline applied to pulled messages
pub const DEFAULT_ACK_DEADLINE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
struct StoredMessage {
    id: u64,
    payload: Vec<u8>,
    attributes: BTreeMap<String, String>,
    publish_time: DateTime<Utc>,
    /// When the message becomes visible again (None = visible now)
    visible_at: Option<DateTime<Utc>>,
    delivery_count: u32,
}

#[derive(Debug, Default)]
struct InMemorySubscription {
    messages: VecDeque<StoredMessage>,
    total_delivered: u64,
    total_acked: u64,
    total_nacked: u64,
}

#[derive(Debug, Default)]
struct BrokerState {
    /// topic -> attached subscriptions
    topics: HashMap<String, Vec<String>>,
    subscriptions: HashMap<String, InMemorySubscription>,
}

#[derive(Debug, Default)]
struct FaultPlan {
    pull: VecDeque<MessagingError>,
    ack: VecDeque<MessagingError>,
    nack: VecDeque<MessagingError>,
    publish: VecDeque<MessagingError>,
}

/// In-memory [`BrokerClient`] for tests
///
/// # Example
///
/// ```rust
/// use dlq_reprocessor::messaging::{BrokerClient, InMemoryBroker, OutboundMessage};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let broker = InMemoryBroker::new();
/// broker.create_subscription("payments-dlq", "payments-dlq-sub").await;
///
/// broker
///     .publish("payments-dlq", OutboundMessage::new(br#"{"id":1}"#.to_vec()))
///     .await?;
///
/// let messages = broker.pull("payments-dlq-sub", 10).await?;
/// assert_eq!(messages.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct InMemoryBroker {
    state: RwLock<BrokerState>,
    faults: Mutex<FaultPlan>,
    published: Mutex<Vec<(String, OutboundMessage)>>,
    next_id: AtomicU64,
    ack_deadline: Duration,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::with_ack_deadline(DEFAULT_ACK_DEADLINE)
    }

    pub fn with_ack_deadline(ack_deadline: Duration) -> Self {
        Self {
            state: RwLock::new(BrokerState::default()),
            faults: Mutex::new(FaultPlan::default()),
            published: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            ack_deadline,
        }
    }

    /// Create a topic with no subscriptions
    pub async fn create_topic(&self, topic: &str) {
        let mut state = self.state.write().await;
        state.topics.entry(topic.to_string()).or_default();
    }

    /// Create a subscription attached to `topic`, creating the topic if needed
    pub async fn create_subscription(&self, topic: &str, subscription: &str) {
        let mut state = self.state.write().await;
        let subs = state.topics.entry(topic.to_string()).or_default();
        if !subs.iter().any(|s| s == subscription) {
            subs.push(subscription.to_string());
        }
        state
            .subscriptions
            .entry(subscription.to_string())
            .or_default();
    }

    /// Number of messages held by a subscription, leased ones included
    pub async fn pending_count(&self, subscription: &str) -> usize {
        let state = self.state.read().await;
        state
            .subscriptions
            .get(subscription)
            .map(|s| s.messages.len())
            .unwrap_or(0)
    }

    pub async fn subscription_stats(
        &self,
        subscription: &str,
    ) -> Result<SubscriptionStats, MessagingError> {
        let state = self.state.read().await;
        let sub = state
            .subscriptions
            .get(subscription)
            .ok_or_else(|| MessagingError::subscription_not_found(subscription))?;

        let now = Utc::now();
        let in_flight_count = sub
            .messages
            .iter()
            .filter(|m| m.visible_at.map(|vt| vt > now).unwrap_or(false))
            .count() as u64;

        Ok(SubscriptionStats {
            subscription: subscription.to_string(),
            message_count: sub.messages.len() as u64,
            in_flight_count,
            total_delivered: sub.total_delivered,
            total_acked: sub.total_acked,
            total_nacked: sub.total_nacked,
        })
    }

    /// Every successful publish, in order, as `(topic, message)`
    pub fn published(&self) -> Vec<(String, OutboundMessage)> {
        self.published.lock().clone()
    }

    /// Successful publishes to one topic
    pub fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.published
            .lock()
            .iter()
            .filter(|(t, _)| t == topic)
            .map(|(_, m)| m.clone())
            .collect()
    }

    /// Make the next `pull` fail with `error`
    pub fn inject_pull_error(&self, error: MessagingError) {
        self.faults.lock().pull.push_back(error);
    }

    pub fn inject_ack_error(&self, error: MessagingError) {
        self.faults.lock().ack.push_back(error);
    }

    pub fn inject_nack_error(&self, error: MessagingError) {
        self.faults.lock().nack.push_back(error);
    }

    /// Make the next `publish` fail with `error`
    pub fn inject_publish_error(&self, error: MessagingError) {
        self.faults.lock().publish.push_back(error);
    }

    fn parse_receipt(receipt_handle: &ReceiptHandle) -> Result<(u64, u32), MessagingError> {
        let invalid = || MessagingError::invalid_receipt_handle(receipt_handle.as_str());
        let (id, delivery) = receipt_handle.as_str().split_once(':').ok_or_else(invalid)?;
        let id = id.parse().map_err(|_| invalid())?;
        let delivery = delivery.parse().map_err(|_| invalid())?;
        Ok((id, delivery))
    }

    fn after(now: DateTime<Utc>, duration: Duration) -> DateTime<Utc> {
        chrono::Duration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

#[async_trait]
impl BrokerClient for InMemoryBroker {
    async fn pull(
        &self,
        subscription: &str,
        max_messages: usize,
    ) -> Result<Vec<BrokerMessage>, MessagingError> {
        if let Some(error) = self.faults.lock().pull.pop_front() {
            return Err(error);
        }

        let mut state = self.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| MessagingError::subscription_not_found(subscription))?;

        let now = Utc::now();
        let lease_until = Self::after(now, self.ack_deadline);
        let mut received = Vec::new();

        for msg in sub.messages.iter_mut() {
            if received.len() >= max_messages {
                break;
            }

            let is_visible = msg.visible_at.map(|vt| vt <= now).unwrap_or(true);
            if !is_visible {
                continue;
            }

            msg.visible_at = Some(lease_until);
            msg.delivery_count += 1;

            received.push(BrokerMessage {
                message_id: MessageId::from(msg.id),
                receipt_handle: ReceiptHandle::new(format!("{}:{}", msg.id, msg.delivery_count)),
                payload: msg.payload.clone(),
                attributes: msg.attributes.clone(),
                publish_time: msg.publish_time,
                delivery_attempt: msg.delivery_count,
            });
        }
        sub.total_delivered += received.len() as u64;

        Ok(received)
    }

    async fn ack(
        &self,
        subscription: &str,
        receipt_handle: &ReceiptHandle,
    ) -> Result<(), MessagingError> {
        if let Some(error) = self.faults.lock().ack.pop_front() {
            return Err(error);
        }
        let (id, delivery) = Self::parse_receipt(receipt_handle)?;

        let mut state = self.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| MessagingError::subscription_not_found(subscription))?;

        let pos = sub
            .messages
            .iter()
            .position(|m| m.id == id)
            .ok_or_else(|| MessagingError::message_not_found(id.to_string()))?;

        // A receipt from an earlier delivery is stale once the message was redelivered
        if sub.messages[pos].delivery_count != delivery {
            return Err(MessagingError::invalid_receipt_handle(receipt_handle.as_str()));
        }

        sub.messages.remove(pos);
        sub.total_acked += 1;
        Ok(())
    }

    async fn nack(
        &self,
        subscription: &str,
        receipt_handle: &ReceiptHandle,
        redelivery_delay: Option<Duration>,
    ) -> Result<(), MessagingError> {
        if let Some(error) = self.faults.lock().nack.pop_front() {
            return Err(error);
        }
        let (id, delivery) = Self::parse_receipt(receipt_handle)?;

        let mut state = self.state.write().await;
        let sub = state
            .subscriptions
            .get_mut(subscription)
            .ok_or_else(|| MessagingError::subscription_not_found(subscription))?;

        let msg = sub
            .messages
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or_else(|| MessagingError::message_not_found(id.to_string()))?;

        if msg.delivery_count != delivery {
            return Err(MessagingError::invalid_receipt_handle(receipt_handle.as_str()));
        }

        msg.visible_at = redelivery_delay.map(|delay| Self::after(Utc::now(), delay));
        sub.total_nacked += 1;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        message: OutboundMessage,
    ) -> Result<MessageId, MessagingError> {
        if let Some(error) = self.faults.lock().publish.pop_front() {
            return Err(error);
        }

        let mut state = self.state.write().await;
        let subscriptions = state
            .topics
            .get(topic)
            .cloned()
            .ok_or_else(|| MessagingError::topic_not_found(topic))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let stored = StoredMessage {
            id,
            payload: message.payload.clone(),
            attributes: message.attributes.clone(),
            publish_time: Utc::now(),
            visible_at: None,
            delivery_count: 0,
        };

        for name in subscriptions {
            if let Some(sub) = state.subscriptions.get_mut(&name) {
                sub.messages.push_back(stored.clone());
            }
        }
        drop(state);

        self.published.lock().push((topic.to_string(), message));
        Ok(MessageId::from(id))
    }

    async fn health_check(&self) -> Result<bool, MessagingError> {
        Ok(true)
    }

    fn provider_name(&self) -> &'static str {
        "in_memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn broker_with_dlq() -> InMemoryBroker {
        let broker = InMemoryBroker::new();
        broker.create_subscription("dlq", "dlq-sub").await;
        broker
    }

    #[tokio::test]
    async fn test_publish_pull_ack() {
        let broker = broker_with_dlq().await;
        let id = broker
            .publish("dlq", OutboundMessage::new(b"hello".to_vec()).with_attribute("k", "v"))
            .await
            .unwrap();

        let messages = broker.pull("dlq-sub", 10).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].message_id, id);
        assert_eq!(messages[0].payload, b"hello");
        assert_eq!(messages[0].delivery_attempt, 1);
        assert_eq!(messages[0].attributes.get("k").map(String::as_str), Some("v"));

        // Leased messages are invisible
        assert!(broker.pull("dlq-sub", 10).await.unwrap().is_empty());

        broker.ack("dlq-sub", &messages[0].receipt_handle).await.unwrap();
        assert_eq!(broker.pending_count("dlq-sub").await, 0);
    }

    #[tokio::test]
    async fn test_nack_without_delay_redelivers_with_incremented_attempt() {
        let broker = broker_with_dlq().await;
        broker
            .publish("dlq", OutboundMessage::new(b"x".to_vec()))
            .await
            .unwrap();

        let first = broker.pull("dlq-sub", 1).await.unwrap();
        broker
            .nack("dlq-sub", &first[0].receipt_handle, None)
            .await
            .unwrap();

        let second = broker.pull("dlq-sub", 1).await.unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].message_id, first[0].message_id);
        assert_eq!(second[0].delivery_attempt, 2);

        // The first receipt is stale now
        let stale = broker.ack("dlq-sub", &first[0].receipt_handle).await;
        assert!(matches!(stale, Err(MessagingError::InvalidReceiptHandle { .. })));
    }

    #[tokio::test]
    async fn test_nack_with_delay_hides_message() {
        let broker = broker_with_dlq().await;
        broker
            .publish("dlq", OutboundMessage::new(b"x".to_vec()))
            .await
            .unwrap();

        let first = broker.pull("dlq-sub", 1).await.unwrap();
        broker
            .nack("dlq-sub", &first[0].receipt_handle, Some(Duration::from_secs(60)))
            .await
            .unwrap();

        assert!(broker.pull("dlq-sub", 1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ack_deadline_expiry_redelivers() {
        let broker = InMemoryBroker::with_ack_deadline(Duration::from_millis(20));
        broker.create_subscription("dlq", "dlq-sub").await;
        broker
            .publish("dlq", OutboundMessage::new(b"x".to_vec()))
            .await
            .unwrap();

        assert_eq!(broker.pull("dlq-sub", 1).await.unwrap().len(), 1);
        tokio::time::sleep(Duration::from_millis(40)).await;

        let again = broker.pull("dlq-sub", 1).await.unwrap();
        assert_eq!(again.len(), 1);
        assert_eq!(again[0].delivery_attempt, 2);
    }

    #[tokio::test]
    async fn test_fan_out_and_missing_topic() {
        let broker = InMemoryBroker::new();
        broker.create_subscription("orders", "orders-a").await;
        broker.create_subscription("orders", "orders-b").await;

        broker
            .publish("orders", OutboundMessage::new(b"o".to_vec()))
            .await
            .unwrap();
        assert_eq!(broker.pending_count("orders-a").await, 1);
        assert_eq!(broker.pending_count("orders-b").await, 1);
        assert_eq!(broker.published_to("orders").len(), 1);

        let missing = broker
            .publish("nope", OutboundMessage::new(b"o".to_vec()))
            .await;
        assert!(matches!(missing, Err(MessagingError::TopicNotFound { .. })));
    }

    #[tokio::test]
    async fn test_fault_injection_is_consumed_once() {
        let broker = broker_with_dlq().await;
        broker.inject_pull_error(MessagingError::unavailable("503"));

        assert!(broker.pull("dlq-sub", 1).await.is_err());
        assert!(broker.pull("dlq-sub", 1).await.is_ok());

        broker.inject_publish_error(MessagingError::timeout("publish", 100));
        assert!(broker
            .publish("dlq", OutboundMessage::new(b"x".to_vec()))
            .await
            .is_err());
        assert!(broker.published().is_empty());

        broker
            .publish("dlq", OutboundMessage::new(b"y".to_vec()))
            .await
            .unwrap();
        let pulled = broker.pull("dlq-sub", 1).await.unwrap();
        broker.inject_ack_error(MessagingError::connection("reset"));
        broker.inject_nack_error(MessagingError::throttled("quota"));
        let handle = &pulled[0].receipt_handle;
        assert!(broker.ack("dlq-sub", handle).await.is_err());
        assert!(broker.nack("dlq-sub", handle, None).await.is_err());
        assert!(broker.ack("dlq-sub", handle).await.is_ok());
        assert!(broker.health_check().await.unwrap());
    }

    #[tokio::test]
    async fn test_subscription_stats() {
        let broker = broker_with_dlq().await;
        for _ in 0..3 {
            broker
                .publish("dlq", OutboundMessage::new(b"x".to_vec()))
                .await
                .unwrap();
        }
        let pulled = broker.pull("dlq-sub", 2).await.unwrap();
        broker.ack("dlq-sub", &pulled[0].receipt_handle).await.unwrap();

        let stats = broker.subscription_stats("dlq-sub").await.unwrap();
        assert_eq!(stats.message_count, 2);
        assert_eq!(stats.in_flight_count, 1);
        assert_eq!(stats.total_delivered, 2);
        assert_eq!(stats.total_acked, 1);
    }
}
