//! # Quarantine Sink
//!
//! Durable storage for messages that exhausted their redelivery budget or
//! can never succeed, plus the operator read path used for manual triage.
//!
//! Writes are idempotent per `message_id`: persisting the same message again
//! merges into the stored record (see [`QuarantineRecord::merge`]). A failed
//! write is reported to the caller, which must not acknowledge the message.

pub mod file;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod record;
pub mod triage;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::{QuarantineBackend, QuarantineConfig};
use crate::messaging::MessageId;

pub use file::FileQuarantineStore;
pub use memory::InMemoryQuarantineStore;
#[cfg(feature = "postgres")]
pub use postgres::PgQuarantineStore;
pub use record::{QuarantineQuery, QuarantineRecord, QuarantineStats, Resolution};
pub use triage::TriageService;

/// Quarantine persistence errors
#[derive(Error, Debug)]
pub enum QuarantineError {
    #[error("Quarantine I/O error at {path}: {message}")]
    Io { path: String, message: String },

    #[error("Quarantine record serialization error: {0}")]
    Serialization(String),

    #[error("Quarantine database error: {0}")]
    Database(String),

    #[error("Quarantined message not found: {message_id}")]
    NotFound { message_id: String },

    #[error("Quarantine backend '{backend}' is not available: {reason}")]
    BackendUnavailable { backend: String, reason: String },

    #[error("Invalid quarantine operation on {message_id}: {reason}")]
    InvalidOperation { message_id: String, reason: String },
}

impl QuarantineError {
    pub fn io(path: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::Io {
            path: path.into(),
            message: error.to_string(),
        }
    }

    pub fn not_found(message_id: &MessageId) -> Self {
        Self::NotFound {
            message_id: message_id.to_string(),
        }
    }

    pub fn backend_unavailable(backend: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::BackendUnavailable {
            backend: backend.into(),
            reason: reason.into(),
        }
    }

    pub fn invalid_operation(message_id: &MessageId, reason: impl Into<String>) -> Self {
        Self::InvalidOperation {
            message_id: message_id.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<serde_json::Error> for QuarantineError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "postgres")]
impl From<sqlx::Error> for QuarantineError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database(err.to_string())
    }
}

pub type QuarantineResult<T> = Result<T, QuarantineError>;

/// Durable quarantine storage
#[async_trait]
pub trait QuarantineSink: Send + Sync + 'static {
    /// Store a record, merging with any existing record for the same message
    async fn persist(&self, record: QuarantineRecord) -> QuarantineResult<()>;

    async fn get(&self, message_id: &MessageId) -> QuarantineResult<Option<QuarantineRecord>>;

    async fn list(&self, query: &QuarantineQuery) -> QuarantineResult<Vec<QuarantineRecord>>;

    /// Mark a record resolved externally; an existing resolution is kept
    async fn mark_resolved(
        &self,
        message_id: &MessageId,
        resolution: Resolution,
    ) -> QuarantineResult<QuarantineRecord>;

    async fn stats(&self) -> QuarantineResult<QuarantineStats>;

    /// Delete resolved records resolved before `cutoff`, returning the count
    async fn purge_resolved_before(&self, cutoff: DateTime<Utc>) -> QuarantineResult<u64>;

    fn backend_name(&self) -> &'static str;
}

/// Build the sink selected by configuration
pub async fn sink_from_config(config: &QuarantineConfig) -> QuarantineResult<Arc<dyn QuarantineSink>> {
    match config.backend {
        QuarantineBackend::Memory => Ok(Arc::new(InMemoryQuarantineStore::new())),
        QuarantineBackend::File => {
            let directory = config.directory.clone().ok_or_else(|| {
                QuarantineError::backend_unavailable("file", "quarantine.directory is not set")
            })?;
            Ok(Arc::new(FileQuarantineStore::open(directory).await?))
        }
        #[cfg(feature = "postgres")]
        QuarantineBackend::Postgres => {
            let url = config.database_url.as_deref().ok_or_else(|| {
                QuarantineError::backend_unavailable("postgres", "quarantine.database_url is not set")
            })?;
            Ok(Arc::new(
                PgQuarantineStore::connect(url, config.max_connections).await?,
            ))
        }
        #[cfg(not(feature = "postgres"))]
        QuarantineBackend::Postgres => Err(QuarantineError::backend_unavailable(
            "postgres",
            "built without the `postgres` feature",
        )),
    }
}
