//! Error types for the reprocessor.
//!
//! Each component owns its error enum; [`ReprocessorError`] wraps them for
//! callers that cross component boundaries.

use thiserror::Error;

use crate::classifier::ClassificationError;
use crate::config::ConfigurationError;
use crate::messaging::MessagingError;
use crate::quarantine::QuarantineError;
use crate::scheduler::SchedulerInvariantViolation;

#[derive(Debug, Error)]
pub enum ReprocessorError {
    #[error("Broker error: {0}")]
    Messaging(#[from] MessagingError),

    #[error("Classification error: {0}")]
    Classification(#[from] ClassificationError),

    #[error("Quarantine error: {0}")]
    Quarantine(#[from] QuarantineError),

    #[error("Scheduler invariant violated: {0}")]
    SchedulerInvariant(#[from] SchedulerInvariantViolation),

    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Processing of {message_id} timed out after {timeout_ms}ms")]
    ProcessingTimeout { message_id: String, timeout_ms: u64 },
}

impl ReprocessorError {
    /// Whether the failing operation may succeed if retried later
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Messaging(e) => e.is_transient(),
            Self::Quarantine(_) | Self::ProcessingTimeout { .. } => true,
            Self::Classification(_) | Self::SchedulerInvariant(_) | Self::Configuration(_) => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ReprocessorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrapping_preserves_transience() {
        let err: ReprocessorError = MessagingError::timeout("pull", 500).into();
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("Broker error"));

        let err: ReprocessorError = MessagingError::topic_not_found("payments").into();
        assert!(!err.is_transient());

        let err: ReprocessorError = SchedulerInvariantViolation::KeyMismatch {
            expected: "a".to_string(),
            found: "b".to_string(),
        }
        .into();
        assert!(!err.is_transient());
    }
}
