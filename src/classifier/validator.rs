//! Payload validation used to detect poison messages.

use super::ClassificationError;

/// Outcome of validating a payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PayloadVerdict {
    Valid,
    /// The payload can never be processed; the string says why
    Rejected(String),
}

/// Decides whether a payload is structurally processable
///
/// An `Err` means the validator itself failed, not that the payload is bad.
pub trait PayloadValidator: Send + Sync + std::fmt::Debug {
    fn validate(&self, payload: &[u8]) -> Result<PayloadVerdict, ClassificationError>;

    fn name(&self) -> &'static str;
}

/// Requires a size-bounded UTF-8 JSON object with the configured top-level fields
#[derive(Debug, Clone)]
pub struct JsonPayloadValidator {
    max_bytes: usize,
    require_json: bool,
    required_fields: Vec<String>,
}

impl JsonPayloadValidator {
    pub fn new(max_bytes: usize, require_json: bool, required_fields: Vec<String>) -> Self {
        Self {
            max_bytes,
            require_json,
            required_fields,
        }
    }
}

impl PayloadValidator for JsonPayloadValidator {
    fn validate(&self, payload: &[u8]) -> Result<PayloadVerdict, ClassificationError> {
        if payload.is_empty() {
            return Ok(PayloadVerdict::Rejected("payload is empty".to_string()));
        }

        if payload.len() > self.max_bytes {
            return Ok(PayloadVerdict::Rejected(format!(
                "payload is {} bytes, limit is {}",
                payload.len(),
                self.max_bytes
            )));
        }

        if !self.require_json {
            return Ok(PayloadVerdict::Valid);
        }

        let text = match std::str::from_utf8(payload) {
            Ok(text) => text,
            Err(e) => {
                return Ok(PayloadVerdict::Rejected(format!(
                    "payload is not valid UTF-8: {e}"
                )))
            }
        };

        let value: serde_json::Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                return Ok(PayloadVerdict::Rejected(format!(
                    "payload is not valid JSON: {e}"
                )))
            }
        };

        let Some(object) = value.as_object() else {
            return Ok(PayloadVerdict::Rejected(
                "payload is not a JSON object".to_string(),
            ));
        };

        let missing: Vec<&str> = self
            .required_fields
            .iter()
            .filter(|field| !object.contains_key(field.as_str()))
            .map(String::as_str)
            .collect();

        if missing.is_empty() {
            Ok(PayloadVerdict::Valid)
        } else {
            Ok(PayloadVerdict::Rejected(format!(
                "payload is missing required fields: {}",
                missing.join(", ")
            )))
        }
    }

    fn name(&self) -> &'static str {
        "json"
    }
}
