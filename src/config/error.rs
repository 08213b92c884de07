//! Errors raised while loading and validating [`ReprocessorConfig`](super::ReprocessorConfig).

use thiserror::Error;

/// Why a configuration could not be produced
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Cannot read configuration file '{file_path}': {error}")]
    FileReadError { file_path: String, error: String },

    /// Layered sources could not be merged or deserialized
    #[error("Failed to parse configuration: {error}")]
    ParseError { error: String },

    /// A field the selected options depend on is unset
    #[error("Configuration field '{field}' is required by {context}")]
    MissingRequiredField { field: String, context: String },

    /// A field is outside its allowed range
    #[error("Field '{field}' has invalid value '{value}': {context}")]
    InvalidValue {
        field: String,
        value: String,
        context: String,
    },

    /// Fields are individually valid but inconsistent with each other
    #[error("Inconsistent configuration: {error}")]
    ValidationError { error: String },
}

impl ConfigurationError {
    pub fn file_read_error<P: Into<String>, E: std::fmt::Display>(file_path: P, error: E) -> Self {
        Self::FileReadError {
            file_path: file_path.into(),
            error: error.to_string(),
        }
    }

    pub fn missing_required_field<F: Into<String>, C: Into<String>>(field: F, context: C) -> Self {
        Self::MissingRequiredField {
            field: field.into(),
            context: context.into(),
        }
    }

    pub fn invalid_value<F: Into<String>, V: ToString, C: Into<String>>(
        field: F,
        value: V,
        context: C,
    ) -> Self {
        Self::InvalidValue {
            field: field.into(),
            value: value.to_string(),
            context: context.into(),
        }
    }

    pub fn validation_error<E: Into<String>>(error: E) -> Self {
        Self::ValidationError {
            error: error.into(),
        }
    }
}

impl From<config::ConfigError> for ConfigurationError {
    fn from(err: config::ConfigError) -> Self {
        Self::ParseError {
            error: err.to_string(),
        }
    }
}

pub type ConfigResult<T> = Result<T, ConfigurationError>;
