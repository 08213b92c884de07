//! # Messaging Module
//!
//! Broker abstraction for the reprocessor. The consumer loop only talks to a
//! [`BrokerClient`]; [`InMemoryBroker`] is the in-process implementation used
//! by tests and local development.

pub mod errors;
pub mod in_memory;
pub mod traits;
pub mod types;

pub use errors::{MessagingError, MessagingResult};
pub use in_memory::InMemoryBroker;
pub use traits::BrokerClient;
pub use types::{BrokerMessage, MessageId, OutboundMessage, ReceiptHandle, SubscriptionStats};
