//! Error types for version service operations

use std::time::Duration;
use thiserror::Error;

/// Version service errors
#[derive(Debug, Error)]
pub enum VersionError {
    // ============ Resolution Errors ============
    #[error("Version resolution failed: {message}")]
    VersionResolution { message: String },

    #[error("Invalid version '{version}': {reason}")]
    InvalidVersion { version: String, reason: String },

    #[error("Component '{component}' not found in the {product} {version} matrix")]
    ComponentNotFound {
        product: String,
        version: String,
        component: String,
    },

    // ============ Configuration Errors ============
    #[error("Invalid version service URL: {url} - {reason}")]
    InvalidUrl { url: String, reason: String },

    // ============ Network Errors ============
    #[error("HTTP error: {status} - {message}")]
    Http { status: u16, message: String },

    #[error("Network error: {message}")]
    Network { message: String },

    #[error("Request timeout after {timeout:?}")]
    Timeout { timeout: Duration },

    // ============ Parse Errors ============
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl VersionError {
    pub(crate) fn resolution(message: impl Into<String>) -> Self {
        VersionError::VersionResolution {
            message: message.into(),
        }
    }

    /// Map a request failure of a client configured with `timeout`
    pub(crate) fn request(e: reqwest::Error, timeout: Duration) -> Self {
        if e.is_timeout() {
            VersionError::Timeout { timeout }
        } else {
            e.into()
        }
    }
}

/// Result type for version service operations
pub type Result<T> = std::result::Result<T, VersionError>;

impl From<reqwest::Error> for VersionError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() {
            VersionError::Network {
                message: format!("Connection failed: {}", e),
            }
        } else if let Some(status) = e.status() {
            VersionError::Http {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else if e.is_decode() {
            VersionError::Serialization(e.to_string())
        } else {
            VersionError::Network {
                message: e.to_string(),
            }
        }
    }
}

impl From<serde_json::Error> for VersionError {
    fn from(e: serde_json::Error) -> Self {
        VersionError::Serialization(e.to_string())
    }
}

impl From<url::ParseError> for VersionError {
    fn from(e: url::ParseError) -> Self {
        VersionError::InvalidUrl {
            url: String::new(),
            reason: e.to_string(),
        }
    }
}
