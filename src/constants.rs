//! # System Constants
//!
//! Message attribute keys and default values shared across the reprocessor.

/// Attribute keys read from and stamped onto broker messages
pub mod attributes {
    /// Original message id, stamped on every republished copy
    pub const ORIGIN_MESSAGE_ID: &str = "x-dlq-origin-message-id";
    /// Redelivery attempt number of a republished copy
    pub const ATTEMPT: &str = "x-dlq-attempt";
    /// Topic the message was originally published to
    pub const ORIGINAL_TOPIC: &str = "x-dlq-original-topic";
    /// Error reported by the downstream consumer that dead-lettered the message
    pub const ERROR: &str = "x-dlq-error";
    /// Error code reported by the downstream consumer
    pub const ERROR_CODE: &str = "x-dlq-error-code";
    /// Quarantined message id an operator replay was taken from
    pub const REPLAYED_FROM: &str = "x-dlq-replayed-from";
}

/// Default values
pub mod defaults {
    use std::time::Duration;

    pub const SUBSCRIPTION: &str = "dlq_payments_data-sub";
    pub const PULL_BATCH_SIZE: usize = 10;
    pub const MAX_ATTEMPTS: u32 = 5;
    pub const UNKNOWN_MAX_ATTEMPTS: u32 = 3;
    pub const BASE_DELAY: Duration = Duration::from_secs(1);
    pub const MAX_DELAY: Duration = Duration::from_secs(300);
    pub const BACKOFF_MULTIPLIER: f64 = 2.0;
    pub const JITTER_FACTOR: f64 = 0.1;
    pub const TOMBSTONE_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    /// Idle time after which an unresolved attempt record is dropped
    pub const RECORD_TTL: Duration = Duration::from_secs(24 * 60 * 60);
    /// Bytes of payload shown in the receipt log line
    pub const PAYLOAD_PREVIEW_BYTES: usize = 256;
}
