//! Core error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Invalid cluster parameters: {message}")]
    InvalidParams { message: String },

    #[error("Unsupported {engine} schema version '{version}': {reason}")]
    UnsupportedSchemaVersion {
        engine: String,
        version: String,
        reason: String,
    },

    #[error("Custom resource validation failed for '{name}': {message}")]
    BuildValidation { name: String, message: String },

    #[error("Invalid quantity '{value}': {reason}")]
    InvalidQuantity { value: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl CoreError {
    pub(crate) fn invalid_params(message: impl Into<String>) -> Self {
        CoreError::InvalidParams {
            message: message.into(),
        }
    }

    pub(crate) fn invalid_quantity(value: &str, reason: impl Into<String>) -> Self {
        CoreError::InvalidQuantity {
            value: value.to_string(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CoreError>;
