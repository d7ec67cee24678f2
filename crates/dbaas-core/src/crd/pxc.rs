//! PerconaXtraDBCluster custom resource (MySQL engine)

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::common::{
    AppStatus, BackupStorageSpec, ExposeSpec, PmmSpec, PodAffinity, PodCounts, PodResources,
    UpgradeOptions, VolumeSpec,
};

/// API group of the MySQL-engine operator
pub const PXC_GROUP: &str = "pxc.percona.com";
/// Kind of the MySQL-engine custom resource
pub const PXC_KIND: &str = "PerconaXtraDBCluster";
/// Plural resource name
pub const PXC_PLURAL: &str = "perconaxtradbclusters";

/// PerconaXtraDBCluster document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerconaXtraDbCluster {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PxcClusterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PxcClusterStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PxcClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cr_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unsafe_configurations: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_options: Option<UpgradeOptions>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pxc: Option<PxcPodSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy: Option<PxcPodSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxysql: Option<PxcPodSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmm: Option<PmmSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PxcBackupSpec>,
}

/// Pod template of one role (database nodes or a proxy)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PxcPodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PodResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_spec: Option<VolumeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<PodAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<ExposeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PxcScheduledBackup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PxcBackupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<Vec<PxcScheduledBackup>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storages: Option<BTreeMap<String, BackupStorageSpec>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PxcClusterStatus {
    /// Free-text cluster state (`initializing`, `ready`, `paused`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pxc: Option<AppStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub haproxy: Option<AppStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxysql: Option<AppStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub message: Vec<String>,
}

impl PerconaXtraDbCluster {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    /// Database node image declared in `spec`
    pub fn pxc_image(&self) -> Option<&str> {
        self.spec.as_ref()?.pxc.as_ref()?.image.as_deref()
    }

    /// Image of whichever proxy is enabled
    pub fn proxy_image(&self) -> Option<&str> {
        self.enabled_proxy().and_then(|p| p.image.as_deref())
    }

    /// Declared database node count
    pub fn size(&self) -> Option<u32> {
        self.spec.as_ref()?.pxc.as_ref()?.size
    }

    fn enabled_proxy(&self) -> Option<&PxcPodSpec> {
        let spec = self.spec.as_ref()?;
        [spec.haproxy.as_ref(), spec.proxysql.as_ref()]
            .into_iter()
            .flatten()
            .find(|p| p.enabled.unwrap_or(false))
    }

    /// Ready/total pods over database nodes and proxies
    pub fn pod_counts(&self) -> PodCounts {
        let mut counts = PodCounts::default();
        if let Some(status) = &self.status {
            counts.add(status.pxc.as_ref());
            counts.add(status.haproxy.as_ref());
            counts.add(status.proxysql.as_ref());
        }
        counts
    }
}
