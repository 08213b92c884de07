//! Broker topology, configuration and message helpers

use std::sync::Arc;
use std::time::Duration;

use dlq_reprocessor::config::{DelayTierConfig, ReprocessorConfig};
use dlq_reprocessor::constants::attributes;
use dlq_reprocessor::consumer::ReprocessingEngine;
use dlq_reprocessor::messaging::{BrokerClient, BrokerMessage, InMemoryBroker, OutboundMessage};
use dlq_reprocessor::quarantine::QuarantineSink;

pub const DLQ_TOPIC: &str = "payments-dlq";
pub const DLQ_SUBSCRIPTION: &str = "payments-dlq-sub";
pub const ORIGINAL_TOPIC: &str = "payments";
pub const ORIGINAL_SUBSCRIPTION: &str = "payments-sub";
pub const RETRY_TOPIC: &str = "payments-retry";

/// Broker with the DLQ, the original topic and one delay tier wired up
pub async fn broker() -> Arc<InMemoryBroker> {
    let broker = Arc::new(InMemoryBroker::new());
    broker.create_topic(RETRY_TOPIC).await;
    broker.create_subscription(DLQ_TOPIC, DLQ_SUBSCRIPTION).await;
    broker
        .create_subscription(ORIGINAL_TOPIC, ORIGINAL_SUBSCRIPTION)
        .await;
    broker
}

/// Deterministic configuration with millisecond backoff
pub fn test_config() -> ReprocessorConfig {
    let mut config = ReprocessorConfig::default();
    config.broker.subscription = DLQ_SUBSCRIPTION.to_string();
    config.broker.idle_poll_interval_ms = 5;
    config.broker.pull_retry_base_ms = 5;
    config.broker.pull_retry_max_ms = 20;
    config.scheduler.max_attempts = 3;
    config.scheduler.backoff.base_delay_ms = 10;
    config.scheduler.backoff.max_delay_ms = 1_000;
    config.scheduler.backoff.multiplier = 2.0;
    config.scheduler.backoff.jitter_factor = 0.0;
    config.consumer.worker_count = 2;
    config.consumer.max_in_flight = 8;
    config.consumer.channel_capacity = 8;
    config.consumer.processing_timeout_ms = 2_000;
    config.consumer.shutdown_grace_ms = 2_000;
    config
}

/// [`test_config`] routing redeliveries through [`RETRY_TOPIC`]
pub fn tiered_config() -> ReprocessorConfig {
    let mut config = test_config();
    config.redelivery.delay_tiers = vec![DelayTierConfig {
        delay_ms: 1_000,
        topic: RETRY_TOPIC.to_string(),
    }];
    config
}

pub fn engine(
    config: &ReprocessorConfig,
    broker: Arc<InMemoryBroker>,
    sink: Arc<dyn QuarantineSink>,
) -> Arc<ReprocessingEngine> {
    Arc::new(ReprocessingEngine::from_config(config, broker, sink))
}

/// A message as the downstream consumer dead-letters it
pub fn failed_message(payload: &[u8], error: &str) -> OutboundMessage {
    OutboundMessage::new(payload.to_vec())
        .with_attribute(attributes::ORIGINAL_TOPIC, ORIGINAL_TOPIC)
        .with_attribute(attributes::ERROR, error)
}

/// Publish a dead-lettered message onto the DLQ topic
pub async fn dead_letter(broker: &InMemoryBroker, payload: &[u8], error: &str) {
    broker
        .publish(DLQ_TOPIC, failed_message(payload, error))
        .await
        .expect("publish to DLQ");
}

/// Simulate the downstream consumer failing a redelivered copy again
pub async fn fail_again(broker: &InMemoryBroker, copy: &OutboundMessage, error: &str) {
    let message = copy.clone().with_attribute(attributes::ERROR, error);
    broker
        .publish(DLQ_TOPIC, message)
        .await
        .expect("re-dead-letter copy");
}

/// Pull exactly one visible message from the DLQ subscription
pub async fn pull_one(broker: &InMemoryBroker) -> BrokerMessage {
    let mut messages = broker
        .pull(DLQ_SUBSCRIPTION, 1)
        .await
        .expect("pull from DLQ");
    assert_eq!(messages.len(), 1, "expected one visible DLQ message");
    messages.remove(0)
}

/// Poll `condition` until it holds or `timeout` elapses
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
