//! Engine-independent view of a stored cluster

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::fmt;

use crate::crd::{PerconaServerMongoDb, PerconaXtraDbCluster, PodCounts};
use crate::error::Result;
use crate::params::Engine;

/// Externally visible cluster state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ClusterState {
    Invalid,
    Changing,
    Ready,
    Upgrading,
    Paused,
}

impl ClusterState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClusterState::Invalid => "invalid",
            ClusterState::Changing => "changing",
            ClusterState::Ready => "ready",
            ClusterState::Upgrading => "upgrading",
            ClusterState::Paused => "paused",
        }
    }
}

impl fmt::Display for ClusterState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status reported by an operator in `status.state`
///
/// The vocabulary grows across operator releases; anything unrecognized is
/// kept as [`AppState::Other`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AppState {
    Unknown,
    Initializing,
    Ready,
    Paused,
    Stopping,
    Error,
    Other(String),
}

impl AppState {
    pub fn parse(state: Option<&str>) -> Self {
        match state.map(str::trim) {
            None | Some("") | Some("unknown") => AppState::Unknown,
            Some("initializing") | Some("init") => AppState::Initializing,
            Some("ready") => AppState::Ready,
            Some("paused") => AppState::Paused,
            Some("stopping") => AppState::Stopping,
            Some("error") => AppState::Error,
            Some(other) => AppState::Other(other.to_string()),
        }
    }
}

/// Capabilities the state resolver needs from either engine's document
pub trait DatabaseCluster {
    fn name(&self) -> &str;

    /// Desired pause flag, `None` when the document has no spec
    fn pause(&self) -> Option<bool>;

    /// Primary image declared in `spec`
    fn image(&self) -> Option<&str>;

    /// Observed operator status
    fn state(&self) -> AppState;
}

impl DatabaseCluster for PerconaXtraDbCluster {
    fn name(&self) -> &str {
        PerconaXtraDbCluster::name(self)
    }

    fn pause(&self) -> Option<bool> {
        self.spec.as_ref().map(|s| s.pause.unwrap_or(false))
    }

    fn image(&self) -> Option<&str> {
        self.pxc_image()
    }

    fn state(&self) -> AppState {
        AppState::parse(self.status.as_ref().and_then(|s| s.state.as_deref()))
    }
}

impl DatabaseCluster for PerconaServerMongoDb {
    fn name(&self) -> &str {
        PerconaServerMongoDb::name(self)
    }

    fn pause(&self) -> Option<bool> {
        self.spec.as_ref().map(|s| s.pause.unwrap_or(false))
    }

    fn image(&self) -> Option<&str> {
        PerconaServerMongoDb::image(self)
    }

    fn state(&self) -> AppState {
        AppState::parse(self.status.as_ref().and_then(|s| s.state.as_deref()))
    }
}

/// A stored cluster of either engine
#[derive(Debug, Clone, PartialEq)]
pub enum AnyCluster {
    XtraDb(PerconaXtraDbCluster),
    Psmdb(PerconaServerMongoDb),
}

impl AnyCluster {
    /// Decode a document read from the platform
    pub fn from_value(engine: Engine, value: JsonValue) -> Result<Self> {
        Ok(match engine {
            Engine::XtraDb => AnyCluster::XtraDb(serde_json::from_value(value)?),
            Engine::Psmdb => AnyCluster::Psmdb(serde_json::from_value(value)?),
        })
    }

    pub fn engine(&self) -> Engine {
        match self {
            AnyCluster::XtraDb(_) => Engine::XtraDb,
            AnyCluster::Psmdb(_) => Engine::Psmdb,
        }
    }

    fn inner(&self) -> &dyn DatabaseCluster {
        match self {
            AnyCluster::XtraDb(c) => c,
            AnyCluster::Psmdb(c) => c,
        }
    }

    pub fn size(&self) -> Option<u32> {
        match self {
            AnyCluster::XtraDb(c) => c.size(),
            AnyCluster::Psmdb(c) => c.size(),
        }
    }

    pub fn pod_counts(&self) -> PodCounts {
        match self {
            AnyCluster::XtraDb(c) => c.pod_counts(),
            AnyCluster::Psmdb(c) => c.pod_counts(),
        }
    }

    /// Declared image per pod role
    pub fn role_images(&self) -> BTreeMap<String, String> {
        let mut images = BTreeMap::new();
        match self {
            AnyCluster::XtraDb(c) => {
                if let Some(image) = c.pxc_image() {
                    images.insert("pxc".to_string(), image.to_string());
                }
                if let Some(spec) = &c.spec {
                    for (role, proxy) in [("haproxy", &spec.haproxy), ("proxysql", &spec.proxysql)] {
                        if let Some(proxy) = proxy
                            && proxy.enabled.unwrap_or(false)
                            && let Some(image) = &proxy.image
                        {
                            images.insert(role.to_string(), image.clone());
                        }
                    }
                    if let Some(image) = spec.pmm.as_ref().and_then(|p| p.image.as_ref()) {
                        images.insert("pmm".to_string(), image.clone());
                    }
                }
            }
            AnyCluster::Psmdb(c) => {
                if let Some(image) = c.image() {
                    images.insert("mongod".to_string(), image.to_string());
                }
                if let Some(image) = c
                    .spec
                    .as_ref()
                    .and_then(|s| s.pmm.as_ref())
                    .and_then(|p| p.image.as_ref())
                {
                    images.insert("pmm".to_string(), image.clone());
                }
            }
        }
        images
    }

    /// Endpoint the operator reports in `status.host`
    pub fn host(&self) -> Option<&str> {
        match self {
            AnyCluster::XtraDb(c) => c.status.as_ref()?.host.as_deref(),
            AnyCluster::Psmdb(c) => c.status.as_ref()?.host.as_deref(),
        }
    }
}

impl DatabaseCluster for AnyCluster {
    fn name(&self) -> &str {
        self.inner().name()
    }

    fn pause(&self) -> Option<bool> {
        self.inner().pause()
    }

    fn image(&self) -> Option<&str> {
        self.inner().image()
    }

    fn state(&self) -> AppState {
        self.inner().state()
    }
}

/// One row of a cluster listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub name: String,
    pub engine: Engine,
    pub state: ClusterState,
    pub size: Option<u32>,
    pub images: BTreeMap<String, String>,
    pub pods: PodCounts,
    pub paused: bool,
    pub host: Option<String>,
}

impl ClusterSummary {
    pub fn new(cluster: &AnyCluster, state: ClusterState) -> Self {
        Self {
            name: cluster.name().to_string(),
            engine: cluster.engine(),
            state,
            size: cluster.size(),
            images: cluster.role_images(),
            pods: cluster.pod_counts(),
            paused: cluster.pause().unwrap_or(false),
            host: cluster.host().map(str::to_string),
        }
    }
}
