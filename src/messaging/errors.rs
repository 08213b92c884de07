//! # Messaging Error Types
//!
//! Broker transport errors surfaced by [`BrokerClient`](super::BrokerClient)
//! implementations. The consumer loop never treats these as fatal: transient
//! variants are retried with backoff, everything else is logged and the
//! affected message is left for the broker to redeliver.

use thiserror::Error;

/// Broker transport error types
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessagingError {
    #[error("Broker connection error: {message}")]
    Connection { message: String },

    #[error("Broker unavailable: {message}")]
    Unavailable { message: String },

    #[error("Network timeout: operation {operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Throttled by broker: {message}")]
    Throttled { message: String },

    #[error("Subscription not found: {subscription}")]
    SubscriptionNotFound { subscription: String },

    #[error("Topic not found: {topic}")]
    TopicNotFound { topic: String },

    #[error("Invalid receipt handle: {handle}")]
    InvalidReceiptHandle { handle: String },

    #[error("Message not found: {message_id}")]
    MessageNotFound { message_id: String },

    #[error("Publish to {topic} failed: {message}")]
    Publish { topic: String, message: String },

    #[error("Message serialization error: {message}")]
    Serialization { message: String },

    #[error("Internal messaging error: {message}")]
    Internal { message: String },
}

impl MessagingError {
    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
        }
    }

    /// Create a broker unavailable error
    pub fn unavailable(message: impl Into<String>) -> Self {
        Self::Unavailable {
            message: message.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    /// Create a throttling error
    pub fn throttled(message: impl Into<String>) -> Self {
        Self::Throttled {
            message: message.into(),
        }
    }

    pub fn subscription_not_found(subscription: impl Into<String>) -> Self {
        Self::SubscriptionNotFound {
            subscription: subscription.into(),
        }
    }

    pub fn topic_not_found(topic: impl Into<String>) -> Self {
        Self::TopicNotFound {
            topic: topic.into(),
        }
    }

    pub fn invalid_receipt_handle(handle: impl Into<String>) -> Self {
        Self::InvalidReceiptHandle {
            handle: handle.into(),
        }
    }

    pub fn message_not_found(message_id: impl Into<String>) -> Self {
        Self::MessageNotFound {
            message_id: message_id.into(),
        }
    }

    /// Create a publish error
    pub fn publish(topic: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Publish {
            topic: topic.into(),
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether retrying the same broker call later can succeed.
    ///
    /// Missing subscriptions/topics and malformed handles are configuration
    /// or programming errors and will not heal on their own.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Connection { .. }
                | Self::Unavailable { .. }
                | Self::Timeout { .. }
                | Self::Throttled { .. }
                | Self::Publish { .. }
        )
    }
}

impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization {
            message: err.to_string(),
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;
