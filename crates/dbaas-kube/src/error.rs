//! Error types for dbaas-kube

use dbaas_core::{ClusterState, CoreError};
use dbaas_versions::VersionError;
use thiserror::Error;

/// Result type for dbaas-kube operations
pub type Result<T> = std::result::Result<T, KubeError>;

/// Errors that can occur while talking to the platform
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KubeError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Api(#[from] kube::Error),

    /// Object absent on the platform
    #[error("{kind} '{name}' not found")]
    NotFound { kind: String, name: String },

    /// Create with a name already in use
    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: String, name: String },

    /// Operation requires a ready cluster
    #[error("cluster '{name}' is not ready (state: {state})")]
    NotReady { name: String, state: ClusterState },

    /// A platform command failed
    #[error("'{command}' failed: {message}")]
    Command { command: String, message: String },

    /// Bridge session could not be opened or closed
    #[error("session error: {0}")]
    Session(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Versions(#[from] VersionError),

    /// Invalid configuration
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<serde_json::Error> for KubeError {
    fn from(e: serde_json::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl From<serde_yaml::Error> for KubeError {
    fn from(e: serde_yaml::Error) -> Self {
        KubeError::Serialization(e.to_string())
    }
}

impl KubeError {
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        KubeError::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    pub fn command(command: impl Into<String>, message: impl Into<String>) -> Self {
        KubeError::Command {
            command: command.into(),
            message: message.into(),
        }
    }

    /// Check if this is a "not found" error
    pub fn is_not_found(&self) -> bool {
        match self {
            KubeError::NotFound { .. } => true,
            KubeError::Api(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }

    /// Turn the diagnostic text of a failed command into an error
    ///
    /// Absent objects and name collisions get their own variants so callers
    /// never match on message text.
    pub fn classify_diagnostic(command: &str, kind: &str, name: &str, diagnostic: &str) -> Self {
        let text = diagnostic.trim();
        let lower = text.to_ascii_lowercase();
        if lower.contains("not found")
            || text.contains("NotFound")
            || lower.contains("could not find the requested resource")
        {
            KubeError::not_found(kind, name)
        } else if lower.contains("already exists") || text.contains("AlreadyExists") {
            KubeError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        } else {
            KubeError::command(command, text)
        }
    }
}
