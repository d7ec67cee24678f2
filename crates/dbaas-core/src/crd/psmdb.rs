//! PerconaServerMongoDB custom resource (MongoDB engine)

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use super::common::{
    AppStatus, BackupStorageSpec, ExposeSpec, PmmSpec, PodAffinity, PodCounts, PodResources,
    UpgradeOptions, VolumeSpec,
};

/// API group of the MongoDB-engine operator
pub const PSMDB_GROUP: &str = "psmdb.percona.com";
/// Kind of the MongoDB-engine custom resource
pub const PSMDB_KIND: &str = "PerconaServerMongoDB";
/// Plural resource name
pub const PSMDB_PLURAL: &str = "perconaservermongodbs";

/// Name of the single data replica set the controller manages
pub const DEFAULT_REPLSET_NAME: &str = "rs0";

/// PerconaServerMongoDB document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PerconaServerMongoDb {
    pub api_version: String,
    pub kind: String,
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<PsmdbClusterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<PsmdbClusterStatus>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsmdbClusterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cr_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pause: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_unsafe_configurations: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets: Option<SecretsSpec>,
    /// Server options; present only in generations before 1.12
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongod: Option<MongodSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replsets: Option<Vec<ReplsetSpec>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sharding: Option<ShardingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmm: Option<PmmSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backup: Option<PsmdbBackupSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upgrade_options: Option<UpgradeOptions>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub users: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongodSecurity {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable_encryption: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_key_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encryption_cipher_mode: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongodSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security: Option<MongodSecurity>,
}

/// Arbiter or non-voting member group nested in a replica set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberGroupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<PodAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PodResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_spec: Option<VolumeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReplsetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    /// Raw mongod configuration (1.12+)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PodResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume_spec: Option<VolumeSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<PodAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arbiter: Option<MemberGroupSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonvoting: Option<MemberGroupSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<ExposeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MongosSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<PodResources>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<PodAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expose: Option<ExposeSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardingSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configsvr_repl_set: Option<ReplsetSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongos: Option<MongosSpec>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupTask {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keep: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsmdbBackupSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tasks: Option<Vec<BackupTask>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storages: Option<BTreeMap<String, BackupStorageSpec>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsmdbClusterStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub replsets: BTreeMap<String, AppStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mongos: Option<AppStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl PerconaServerMongoDb {
    pub fn name(&self) -> &str {
        self.metadata.name.as_deref().unwrap_or_default()
    }

    pub fn image(&self) -> Option<&str> {
        self.spec.as_ref()?.image.as_deref()
    }

    /// The data replica set (first entry in `replsets`)
    pub fn data_replset(&self) -> Option<&ReplsetSpec> {
        self.spec.as_ref()?.replsets.as_ref()?.first()
    }

    pub fn size(&self) -> Option<u32> {
        self.data_replset()?.size
    }

    /// Name of the secret holding the system users
    pub fn users_secret(&self) -> Option<&str> {
        self.spec.as_ref()?.secrets.as_ref()?.users.as_deref()
    }

    /// Ready/total pods over replica sets and routers
    pub fn pod_counts(&self) -> PodCounts {
        let mut counts = PodCounts::default();
        if let Some(status) = &self.status {
            for replset in status.replsets.values() {
                counts.add(Some(replset));
            }
            counts.add(status.mongos.as_ref());
        }
        counts
    }
}
