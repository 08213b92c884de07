#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, SQLx in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # DLQ Reprocessor
//!
//! Reliable dead-letter reprocessing: consumes failed messages from a DLQ
//! subscription, classifies each failure, redelivers with bounded
//! exponential backoff, and quarantines exhausted or poison messages in a
//! durable store for manual triage.
//!
//! ## Architecture
//!
//! ```text
//! broker ─▶ ConsumerLoop ─▶ EnvelopeStore ─▶ FailureClassifier ─▶ RedeliveryScheduler
//!                                                                     │
//!             ack / nack ◀── delay tier │ original topic │ QuarantineSink
//! ```
//!
//! ## Module Organization
//!
//! - [`messaging`] - `BrokerClient` trait and the in-memory broker
//! - [`envelope`] - Normalized message envelopes and stable message identity
//! - [`classifier`] - Transient / poison / unknown failure classification
//! - [`scheduler`] - Attempt records, backoff, routing and the quarantine decision
//! - [`quarantine`] - Durable quarantine stores and the triage service
//! - [`consumer`] - Reprocessing engine and the pull/worker loop
//! - [`config`] - Layered configuration
//! - [`logging`] - Structured logging setup
//! - [`error`] - Crate-level error type
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use dlq_reprocessor::config::ConfigManager;
//! use dlq_reprocessor::consumer::{ConsumerLoop, ReprocessingEngine};
//! use dlq_reprocessor::messaging::InMemoryBroker;
//! use dlq_reprocessor::quarantine::sink_from_config;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ConfigManager::load()?;
//! let config = manager.config();
//! dlq_reprocessor::logging::init_structured_logging(&config.logging);
//!
//! let broker = Arc::new(InMemoryBroker::new());
//! let sink = sink_from_config(&config.quarantine).await?;
//! let engine = Arc::new(ReprocessingEngine::from_config(config, broker, sink));
//!
//! let handle = ConsumerLoop::new(config, engine).start();
//! tokio::signal::ctrl_c().await?;
//! let report = handle.shutdown().await;
//! println!("released {} in-flight deliveries", report.released_in_flight);
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod constants;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod messaging;
pub mod quarantine;
pub mod scheduler;

pub use classifier::{Classification, FailureClassifier, FailureKind};
pub use config::{ConfigManager, ConfigurationError, ReprocessorConfig};
pub use consumer::{ConsumerHandle, ConsumerLoop, Disposition, DrainReport, ReprocessingEngine};
pub use envelope::{DeliveryKey, Envelope, EnvelopeStore};
pub use error::{ReprocessorError, Result};
pub use messaging::{BrokerClient, BrokerMessage, InMemoryBroker, MessageId, MessagingError};
pub use quarantine::{QuarantineError, QuarantineRecord, QuarantineSink, TriageService};
pub use scheduler::{
    AttemptRecord, AttemptStatus, BackoffPolicy, Decision, RedeliveryScheduler,
    SchedulerInvariantViolation,
};
