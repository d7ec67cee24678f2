//! Controller configuration
//!
//! Every field has a default, so an empty document is a valid configuration:
//!
//! ```yaml
//! namespace: databases
//! versionServiceUrl: https://check.percona.com/versions/v1
//! session:
//!   ports: { start: 52000, end: 52999 }
//!   dialInterval: 200ms
//!   terminationGrace: 10s
//! ```

use std::path::PathBuf;
use std::time::Duration;

use dbaas_core::Engine;
use dbaas_versions::DEFAULT_VERSION_SERVICE_URL;
use serde::{Deserialize, Serialize};

use crate::error::{KubeError, Result};

/// Field manager name for Server-Side Apply
pub const DEFAULT_FIELD_MANAGER: &str = "dbaas-controller";

pub const DEFAULT_NAMESPACE: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Namespace holding the clusters, their pods and claims
    pub namespace: String,
    pub field_manager: String,
    /// Deployment running the MySQL-engine operator
    pub xtradb_operator_deployment: String,
    /// Deployment running the MongoDB-engine operator
    pub psmdb_operator_deployment: String,
    /// Used to look up recommended images when none is given; `None` lets the
    /// operator pick its own default
    pub version_service_url: Option<String>,
    pub session: SessionConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            field_manager: DEFAULT_FIELD_MANAGER.to_string(),
            xtradb_operator_deployment: "percona-xtradb-cluster-operator".to_string(),
            psmdb_operator_deployment: "percona-server-mongodb-operator".to_string(),
            version_service_url: Some(DEFAULT_VERSION_SERVICE_URL.to_string()),
            session: SessionConfig::default(),
        }
    }
}

impl ControllerConfig {
    /// Parse a YAML (or JSON) document
    pub fn from_yaml(text: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() {
            return Err(KubeError::InvalidConfig("namespace must not be empty".into()));
        }
        if self.field_manager.is_empty() {
            return Err(KubeError::InvalidConfig(
                "fieldManager must not be empty".into(),
            ));
        }
        self.session.validate()
    }

    /// Deployment name of an engine's operator
    pub fn operator_deployment(&self, engine: Engine) -> &str {
        match engine {
            Engine::XtraDb => &self.xtradb_operator_deployment,
            Engine::Psmdb => &self.psmdb_operator_deployment,
        }
    }
}

/// Inclusive range of local ports handed to bridge sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u32 {
        if self.end < self.start {
            0
        } else {
            u32::from(self.end - self.start) + 1
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.start..=self.end).contains(&port)
    }

    /// Port at `offset` from the start, wrapping around the range
    pub(crate) fn nth_wrapping(&self, offset: u32) -> Option<u16> {
        let len = self.len();
        if len == 0 {
            return None;
        }
        u16::try_from(u32::from(self.start) + offset % len).ok()
    }
}

impl Default for PortRange {
    fn default() -> Self {
        Self::new(50000, 50999)
    }
}

/// Bridge session settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionConfig {
    pub ports: PortRange,
    /// Dials before a started bridge counts as dead
    pub dial_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub dial_interval: Duration,
    /// Full claim-launch-dial sequences before giving up
    pub open_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub open_backoff: Duration,
    /// How long a closing bridge may take to exit
    #[serde(with = "humantime_serde")]
    pub termination_grace: Duration,
    pub kubectl_path: PathBuf,
    pub kubeconfig: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ports: PortRange::default(),
            dial_attempts: 50,
            dial_interval: Duration::from_millis(100),
            open_attempts: 3,
            open_backoff: Duration::from_millis(500),
            termination_grace: Duration::from_secs(5),
            kubectl_path: PathBuf::from("kubectl"),
            kubeconfig: None,
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ports.is_empty() {
            return Err(KubeError::InvalidConfig(format!(
                "empty session port range {}-{}",
                self.ports.start, self.ports.end
            )));
        }
        if self.ports.start == 0 {
            return Err(KubeError::InvalidConfig(
                "session ports must start above 0".into(),
            ));
        }
        if self.dial_attempts == 0 || self.open_attempts == 0 {
            return Err(KubeError::InvalidConfig(
                "dialAttempts and openAttempts must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
