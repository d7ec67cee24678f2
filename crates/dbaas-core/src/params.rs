//! Create/update parameters for database clusters
//!
//! Every field except the cluster name is optional. A field left as `None`
//! is never written into the custom resource, so on create the operator
//! applies its own default and on update the previously applied value is kept.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::error::{CoreError, Result};

/// Maximum length of a cluster name (operators derive longer object names from it)
pub const MAX_CLUSTER_NAME_LEN: usize = 22;

/// The two supported database engines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    /// MySQL engine (Percona XtraDB Cluster operator)
    XtraDb,
    /// MongoDB engine (Percona Server for MongoDB operator)
    Psmdb,
}

impl Engine {
    /// Human-readable engine name
    pub fn as_str(&self) -> &'static str {
        match self {
            Engine::XtraDb => "xtradb",
            Engine::Psmdb => "psmdb",
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a cluster is exposed when exposure is enabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ExposeType {
    /// Cluster-internal service
    #[default]
    ClusterIP,
    NodePort,
    LoadBalancer,
}

impl ExposeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExposeType::ClusterIP => "ClusterIP",
            ExposeType::NodePort => "NodePort",
            ExposeType::LoadBalancer => "LoadBalancer",
        }
    }
}

/// CPU and memory for one pod role
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComputeResources {
    pub cpu_millis: Option<u64>,
    pub memory_bytes: Option<u64>,
}

/// Per-role pod parameters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentParams {
    pub compute: Option<ComputeResources>,
    pub disk_size_bytes: Option<u64>,
    pub image: Option<String>,
}

/// Monitoring agent settings
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitoringParams {
    pub enabled: bool,
    pub host: Option<String>,
    pub user: Option<String>,
    pub image: Option<String>,
    pub compute: Option<ComputeResources>,
}

/// A scheduled backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupSchedule {
    pub name: String,
    /// Cron expression
    pub schedule: String,
    pub keep: Option<u32>,
    pub storage_name: String,
}

/// Where backups are written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum StorageTarget {
    S3 {
        bucket: String,
        region: Option<String>,
        endpoint_url: Option<String>,
        credentials_secret: String,
    },
    Filesystem {
        size_bytes: u64,
        storage_class: Option<String>,
    },
}

/// Backup schedules and storage targets
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupParams {
    pub image: Option<String>,
    #[serde(default)]
    pub schedules: Vec<BackupSchedule>,
    #[serde(default)]
    pub storages: BTreeMap<String, StorageTarget>,
}

/// Proxy flavour in front of the MySQL engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    #[default]
    HAProxy,
    ProxySQL,
}

/// Proxy parameters for the MySQL engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyParams {
    pub kind: Option<ProxyKind>,
    pub compute: Option<ComputeResources>,
    pub disk_size_bytes: Option<u64>,
    pub image: Option<String>,
}

/// Parameters for a MySQL-engine cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct XtraDbParams {
    pub name: String,
    pub size: Option<u32>,
    pub pause: Option<bool>,
    #[serde(default)]
    pub pxc: ComponentParams,
    #[serde(default)]
    pub proxy: ProxyParams,
    pub expose: Option<bool>,
    pub expose_type: Option<ExposeType>,
    pub monitoring: Option<MonitoringParams>,
    pub version_service_url: Option<String>,
    pub backup: Option<BackupParams>,
}

/// Extra member group of a replica set (arbiters, non-voting members)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemberGroupParams {
    pub enabled: bool,
    pub size: Option<u32>,
}

/// Sharding parameters for the MongoDB engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShardingParams {
    pub enabled: bool,
    pub configsvr_size: Option<u32>,
    #[serde(default)]
    pub configsvr: ComponentParams,
    pub mongos_size: Option<u32>,
    pub mongos_compute: Option<ComputeResources>,
}

/// Data-at-rest encryption for the MongoDB engine
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionParams {
    pub enabled: bool,
    pub key_secret: Option<String>,
    pub cipher_mode: Option<String>,
}

/// Parameters for a MongoDB-engine cluster
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PsmdbParams {
    pub name: String,
    pub size: Option<u32>,
    pub pause: Option<bool>,
    pub image: Option<String>,
    #[serde(default)]
    pub replset: ComponentParams,
    pub sharding: Option<ShardingParams>,
    pub arbiter: Option<MemberGroupParams>,
    pub non_voting: Option<MemberGroupParams>,
    pub expose: Option<bool>,
    pub expose_type: Option<ExposeType>,
    pub encryption: Option<EncryptionParams>,
    pub monitoring: Option<MonitoringParams>,
    pub version_service_url: Option<String>,
    pub backup: Option<BackupParams>,
}

/// Engine-tagged cluster parameters
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "engine", rename_all = "lowercase")]
pub enum ClusterParams {
    XtraDb(XtraDbParams),
    Psmdb(PsmdbParams),
}

impl ClusterParams {
    pub fn engine(&self) -> Engine {
        match self {
            ClusterParams::XtraDb(_) => Engine::XtraDb,
            ClusterParams::Psmdb(_) => Engine::Psmdb,
        }
    }

    pub fn name(&self) -> &str {
        match self {
            ClusterParams::XtraDb(p) => &p.name,
            ClusterParams::Psmdb(p) => &p.name,
        }
    }

    /// Reject malformed parameters before any document is built
    pub fn validate(&self) -> Result<()> {
        match self {
            ClusterParams::XtraDb(p) => p.validate(),
            ClusterParams::Psmdb(p) => p.validate(),
        }
    }
}

impl XtraDbParams {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_size("size", self.size)?;
        validate_component("pxc", &self.pxc)?;
        validate_compute("proxy", self.proxy.compute.as_ref())?;
        validate_disk("proxy", self.proxy.disk_size_bytes)?;
        validate_monitoring(self.monitoring.as_ref())?;
        validate_backup(self.backup.as_ref())
    }
}

impl PsmdbParams {
    pub fn validate(&self) -> Result<()> {
        validate_name(&self.name)?;
        validate_size("size", self.size)?;
        validate_component("replset", &self.replset)?;

        if let Some(sharding) = &self.sharding {
            validate_size("sharding.configsvrSize", sharding.configsvr_size)?;
            validate_size("sharding.mongosSize", sharding.mongos_size)?;
            validate_component("configsvr", &sharding.configsvr)?;
            validate_compute("mongos", sharding.mongos_compute.as_ref())?;
        }
        if let Some(arbiter) = &self.arbiter {
            validate_size("arbiter.size", arbiter.size)?;
        }
        if let Some(non_voting) = &self.non_voting {
            validate_size("nonVoting.size", non_voting.size)?;
        }
        if let Some(encryption) = &self.encryption
            && encryption.key_secret.as_deref() == Some("")
        {
            return Err(CoreError::invalid_params(
                "encryption key secret name must not be empty",
            ));
        }

        validate_monitoring(self.monitoring.as_ref())?;
        validate_backup(self.backup.as_ref())
    }
}

/// Cluster names become object-name prefixes, so they must be DNS-1123 labels
fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(CoreError::invalid_params("cluster name is required"));
    }
    if name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(CoreError::invalid_params(format!(
            "cluster name '{}' is longer than {} characters",
            name, MAX_CLUSTER_NAME_LEN
        )));
    }

    let valid_chars = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    let starts_ok = name.starts_with(|c: char| c.is_ascii_lowercase());
    let ends_ok = name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());

    if !(valid_chars && starts_ok && ends_ok) {
        return Err(CoreError::invalid_params(format!(
            "cluster name '{}' must consist of lowercase letters, digits and '-', \
             start with a letter and end with a letter or digit",
            name
        )));
    }
    Ok(())
}

fn validate_size(field: &str, size: Option<u32>) -> Result<()> {
    if size == Some(0) {
        return Err(CoreError::invalid_params(format!(
            "{} must be greater than zero",
            field
        )));
    }
    Ok(())
}

fn validate_compute(role: &str, compute: Option<&ComputeResources>) -> Result<()> {
    let Some(compute) = compute else {
        return Ok(());
    };
    if compute.cpu_millis == Some(0) {
        return Err(CoreError::invalid_params(format!(
            "{} CPU must be greater than zero",
            role
        )));
    }
    if compute.memory_bytes == Some(0) {
        return Err(CoreError::invalid_params(format!(
            "{} memory must be greater than zero",
            role
        )));
    }
    Ok(())
}

fn validate_disk(role: &str, disk: Option<u64>) -> Result<()> {
    if disk == Some(0) {
        return Err(CoreError::invalid_params(format!(
            "{} disk size must be greater than zero",
            role
        )));
    }
    Ok(())
}

fn validate_component(role: &str, component: &ComponentParams) -> Result<()> {
    validate_compute(role, component.compute.as_ref())?;
    validate_disk(role, component.disk_size_bytes)?;
    if component.image.as_deref() == Some("") {
        return Err(CoreError::invalid_params(format!(
            "{} image must not be empty",
            role
        )));
    }
    Ok(())
}

fn validate_monitoring(monitoring: Option<&MonitoringParams>) -> Result<()> {
    match monitoring {
        Some(m) if m.enabled && m.host.as_deref().unwrap_or("").is_empty() => Err(
            CoreError::invalid_params("monitoring requires a server host when enabled"),
        ),
        Some(m) => validate_compute("monitoring", m.compute.as_ref()),
        None => Ok(()),
    }
}

fn validate_backup(backup: Option<&BackupParams>) -> Result<()> {
    let Some(backup) = backup else {
        return Ok(());
    };

    let mut seen = std::collections::BTreeSet::new();
    for schedule in &backup.schedules {
        if schedule.name.is_empty() || schedule.schedule.trim().is_empty() {
            return Err(CoreError::invalid_params(
                "backup schedules need a name and a cron expression",
            ));
        }
        if !seen.insert(schedule.name.as_str()) {
            return Err(CoreError::invalid_params(format!(
                "duplicate backup schedule '{}'",
                schedule.name
            )));
        }
        if !backup.storages.is_empty() && !backup.storages.contains_key(&schedule.storage_name) {
            return Err(CoreError::invalid_params(format!(
                "backup schedule '{}' refers to unknown storage '{}'",
                schedule.name, schedule.storage_name
            )));
        }
    }

    for (name, target) in &backup.storages {
        match target {
            StorageTarget::S3 { bucket, .. } if bucket.is_empty() => {
                return Err(CoreError::invalid_params(format!(
                    "storage '{}' needs a bucket",
                    name
                )));
            }
            StorageTarget::Filesystem { size_bytes: 0, .. } => {
                return Err(CoreError::invalid_params(format!(
                    "storage '{}' needs a non-zero size",
                    name
                )));
            }
            _ => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn xtradb(name: &str) -> XtraDbParams {
        XtraDbParams {
            name: name.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_valid_minimal_params() {
        assert!(xtradb("orders-db").validate().is_ok());
        let psmdb = PsmdbParams {
            name: "events".to_string(),
            size: Some(3),
            ..Default::default()
        };
        assert!(ClusterParams::Psmdb(psmdb).validate().is_ok());
    }

    #[test]
    fn test_zero_size_rejected() {
        let params = XtraDbParams {
            size: Some(0),
            ..xtradb("orders")
        };
        let err = params.validate().unwrap_err();
        assert!(matches!(err, CoreError::InvalidParams { .. }));
        assert!(err.to_string().contains("size"));
    }

    #[test]
    fn test_zero_arbiter_size_rejected() {
        let params = PsmdbParams {
            name: "events".to_string(),
            arbiter: Some(MemberGroupParams {
                enabled: true,
                size: Some(0),
            }),
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_invalid_names() {
        for name in ["", "Orders", "1orders", "orders-", "orders_db", "a-very-long-cluster-name-x"] {
            assert!(xtradb(name).validate().is_err(), "{name} should be rejected");
        }
    }

    #[test]
    fn test_zero_compute_rejected() {
        let mut params = xtradb("orders");
        params.pxc.compute = Some(ComputeResources {
            cpu_millis: Some(0),
            memory_bytes: Some(1 << 30),
        });
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_monitoring_requires_host() {
        let params = XtraDbParams {
            monitoring: Some(MonitoringParams {
                enabled: true,
                ..Default::default()
            }),
            ..xtradb("orders")
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_backup_schedule_must_reference_storage() {
        let mut storages = BTreeMap::new();
        storages.insert(
            "s3-us-east".to_string(),
            StorageTarget::S3 {
                bucket: "backups".to_string(),
                region: Some("us-east-1".to_string()),
                endpoint_url: None,
                credentials_secret: "s3-creds".to_string(),
            },
        );
        let schedule = BackupSchedule {
            name: "daily".to_string(),
            schedule: "0 0 * * *".to_string(),
            keep: Some(3),
            storage_name: "missing".to_string(),
        };
        let params = XtraDbParams {
            backup: Some(BackupParams {
                image: None,
                schedules: vec![schedule.clone()],
                storages: storages.clone(),
            }),
            ..xtradb("orders")
        };
        assert!(params.validate().is_err());

        let params = XtraDbParams {
            backup: Some(BackupParams {
                image: None,
                schedules: vec![BackupSchedule {
                    storage_name: "s3-us-east".to_string(),
                    ..schedule
                }],
                storages,
            }),
            ..xtradb("orders")
        };
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_params_deserialize_from_yaml() {
        let yaml = r#"
engine: psmdb
name: events
size: 3
replset:
  diskSizeBytes: 10737418240
sharding:
  enabled: true
  configsvrSize: 3
"#;
        let params: ClusterParams = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(params.engine(), Engine::Psmdb);
        assert_eq!(params.name(), "events");
        match params {
            ClusterParams::Psmdb(p) => {
                assert_eq!(p.replset.disk_size_bytes, Some(10 << 30));
                assert_eq!(p.sharding.unwrap().configsvr_size, Some(3));
            }
            _ => panic!("expected psmdb params"),
        }
    }
}
