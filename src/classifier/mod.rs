//! # Failure Classification
//!
//! Assigns a [`FailureKind`] to a dead-lettered message from its envelope and
//! the prior attempt state. Classification is side-effect free apart from
//! logging, and deterministic for the same inputs.
//!
//! ## Rules, first match wins
//!
//! 1. No resolvable redelivery topic: `Poison`
//! 2. Payload rejected by the [`PayloadValidator`]: `Poison`
//! 3. Poison signature in the error attributes: `Poison`
//! 4. Transient signature in the error attributes: `Transient`
//! 5. Prior attempt was classified `Transient`: `Transient`
//! 6. Otherwise: `Unknown`
//!
//! A validator failure is logged and yields `Unknown`.

pub mod signatures;
pub mod validator;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::config::{ClassifierConfig, RedeliveryConfig};
use crate::envelope::Envelope;
use crate::scheduler::AttemptRecord;

pub use signatures::{SignatureMatch, SignatureSet};
pub use validator::{JsonPayloadValidator, PayloadValidator, PayloadVerdict};

/// Failure category of a dead-lettered message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Retryable: network, throttling, timeouts, unavailability
    Transient,
    /// Can never succeed regardless of retry count
    Poison,
    /// No known signature; retried under a stricter ceiling
    Unknown,
}

impl FailureKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Poison)
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Poison => write!(f, "poison"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

impl std::str::FromStr for FailureKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "transient" => Ok(Self::Transient),
            "poison" => Ok(Self::Poison),
            "unknown" => Ok(Self::Unknown),
            _ => Err(format!("Invalid failure kind: {s}")),
        }
    }
}

/// Result of classifying one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Classification {
    pub kind: FailureKind,
    pub reason: String,
    pub matched_signature: Option<String>,
}

impl Classification {
    fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
            matched_signature: None,
        }
    }
}

/// Failure inside the classifier itself
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ClassificationError {
    #[error("Payload validator '{validator}' failed: {message}")]
    ValidatorFailed { validator: String, message: String },
}

impl ClassificationError {
    pub fn validator_failed(validator: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidatorFailed {
            validator: validator.into(),
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FailureClassifier {
    signatures: SignatureSet,
    validator: Arc<dyn PayloadValidator>,
    error_attributes: Vec<String>,
    original_topic_attribute: String,
    default_topic: Option<String>,
}

impl FailureClassifier {
    pub fn new(
        signatures: SignatureSet,
        validator: Arc<dyn PayloadValidator>,
        error_attributes: Vec<String>,
        original_topic_attribute: impl Into<String>,
        default_topic: Option<String>,
    ) -> Self {
        Self {
            signatures,
            validator,
            error_attributes,
            original_topic_attribute: original_topic_attribute.into(),
            default_topic,
        }
    }

    /// Build a classifier with the default JSON validator
    pub fn from_config(classifier: &ClassifierConfig, redelivery: &RedeliveryConfig) -> Self {
        let validator = JsonPayloadValidator::new(
            classifier.max_payload_bytes,
            classifier.require_json,
            classifier.required_fields.clone(),
        );
        Self::new(
            SignatureSet::new(&classifier.transient_signatures, &classifier.poison_signatures),
            Arc::new(validator),
            classifier.error_attributes.clone(),
            redelivery.original_topic_attribute.clone(),
            redelivery.default_topic.clone(),
        )
    }

    /// Attributes the downstream consumer writes its error into
    pub fn error_attributes(&self) -> &[String] {
        &self.error_attributes
    }

    /// Replace the payload validator
    pub fn with_validator(mut self, validator: Arc<dyn PayloadValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn classify(&self, envelope: &Envelope, prior: Option<&AttemptRecord>) -> Classification {
        if !self.has_route(envelope) {
            return Classification::new(
                FailureKind::Poison,
                format!(
                    "no redelivery topic: attribute '{}' missing and no default topic configured",
                    self.original_topic_attribute
                ),
            );
        }

        match self.validator.validate(envelope.payload()) {
            Ok(PayloadVerdict::Valid) => {}
            Ok(PayloadVerdict::Rejected(reason)) => {
                return Classification::new(FailureKind::Poison, reason);
            }
            Err(error) => {
                warn!(
                    message_id = %envelope.message_id(),
                    validator = self.validator.name(),
                    error = %error,
                    "Payload validation failed, classifying as unknown"
                );
                return Classification::new(FailureKind::Unknown, error.to_string());
            }
        }

        let error_text = self.error_text(envelope);
        if let Some(matched) = self.signatures.match_text(&error_text) {
            return Classification {
                kind: matched.kind,
                reason: format!("error matched {} signature '{}'", matched.kind, matched.signature),
                matched_signature: Some(matched.signature),
            };
        }

        if prior.map(|record| record.last_error_kind) == Some(FailureKind::Transient) {
            return Classification::new(
                FailureKind::Transient,
                "no signature matched; previous attempt was transient",
            );
        }

        let reason = if error_text.is_empty() {
            "no error attributes present".to_string()
        } else {
            "no known error signature matched".to_string()
        };
        Classification::new(FailureKind::Unknown, reason)
    }

    fn has_route(&self, envelope: &Envelope) -> bool {
        envelope
            .attribute(&self.original_topic_attribute)
            .map(|topic| !topic.trim().is_empty())
            .unwrap_or(false)
            || self.default_topic.is_some()
    }

    fn error_text(&self, envelope: &Envelope) -> String {
        self.error_attributes
            .iter()
            .filter_map(|key| envelope.attribute(key))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
