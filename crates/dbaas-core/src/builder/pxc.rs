//! PerconaXtraDBCluster generations
//!
//! - `pre-1.9`: the apiVersion encodes the operator release (`v1-8-0`), there is
//!   no `crVersion`, and exposure is the proxy's `serviceType`.
//! - `1.9+`: apiVersion `v1` plus `spec.crVersion`; exposure is `spec.pxc.expose`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use semver::Version;
use serde_json::Value as JsonValue;

use super::{
    BuildContext, Generation, default_key, pmm, pod_resources, s3_storage, upgrade_options,
    versioned_api_version, volume,
};
use crate::crd::pxc::{PxcBackupSpec, PxcScheduledBackup};
use crate::crd::{
    BackupStorageSpec, ExposeSpec, PXC_GROUP, PXC_KIND, PerconaXtraDbCluster, PxcClusterSpec,
    PxcPodSpec, VolumeSpec, object_at, to_value,
};
use crate::error::Result;
use crate::params::{ProxyKind, StorageTarget, XtraDbParams};
use crate::quantity::format_bytes;

const FINALIZER: &str = "delete-pxc-pods-in-order";

/// Clusters smaller than this need the operator's unsafe-configuration switch
const SAFE_CLUSTER_SIZE: u32 = 3;

pub(crate) static PXC_GENERATIONS: [Generation<XtraDbParams>; 2] = [
    Generation {
        label: "1.9+",
        since: Version::new(1, 9, 0),
        populate: populate_current,
        normalize: normalize_current,
        validate,
    },
    Generation {
        label: "pre-1.9",
        since: Version::new(1, 7, 0),
        populate: populate_legacy,
        normalize: normalize_legacy,
        validate,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Legacy,
    Current,
}

/// Name of the secret holding the system users
pub(crate) fn secrets_name(cluster: &str) -> String {
    format!("dbaas-{}-pxc-secrets", cluster)
}

fn populate_current(p: &XtraDbParams, ctx: &BuildContext<'_>) -> Result<JsonValue> {
    populate(p, ctx, Layout::Current)
}

fn populate_legacy(p: &XtraDbParams, ctx: &BuildContext<'_>) -> Result<JsonValue> {
    populate(p, ctx, Layout::Legacy)
}

fn populate(p: &XtraDbParams, ctx: &BuildContext<'_>, layout: Layout) -> Result<JsonValue> {
    let api_version = match layout {
        Layout::Legacy => versioned_api_version(PXC_GROUP, ctx.version),
        Layout::Current => format!("{}/v1", PXC_GROUP),
    };

    let mut spec = PxcClusterSpec {
        cr_version: (layout == Layout::Current).then(|| ctx.cr_version()),
        pause: p.pause,
        upgrade_options: upgrade_options(p.version_service_url.as_ref()),
        pmm: pmm(p.monitoring.as_ref()),
        backup: backup(p),
        ..Default::default()
    };
    if ctx.creating() {
        spec.secrets_name = Some(secrets_name(&p.name));
    }
    if let Some(size) = p.size {
        spec.allow_unsafe_configurations = Some(size < SAFE_CLUSTER_SIZE);
    }

    let pxc = PxcPodSpec {
        size: p.size,
        image: p.pxc.image.clone(),
        resources: pod_resources(p.pxc.compute.as_ref()),
        volume_spec: volume(p.pxc.disk_size_bytes),
        expose: match layout {
            Layout::Current => pod_expose(p),
            Layout::Legacy => None,
        },
        ..Default::default()
    };
    spec.pxc = (pxc != PxcPodSpec::default()).then_some(pxc);

    populate_proxy(p, ctx, layout, &mut spec)?;

    let cluster = PerconaXtraDbCluster {
        api_version,
        kind: PXC_KIND.to_string(),
        metadata: ObjectMeta {
            name: Some(p.name.clone()),
            finalizers: ctx.creating().then(|| vec![FINALIZER.to_string()]),
            ..Default::default()
        },
        spec: Some(spec),
        status: None,
    };
    to_value(&cluster)
}

fn pod_expose(p: &XtraDbParams) -> Option<ExposeSpec> {
    if p.expose.is_none() && p.expose_type.is_none() {
        return None;
    }
    Some(ExposeSpec {
        enabled: p.expose,
        type_: p.expose_type.map(|t| t.as_str().to_string()),
        expose_type: None,
    })
}

/// Proxy named in the existing document, if one is enabled there
fn existing_proxy(ctx: &BuildContext<'_>) -> Option<ProxyKind> {
    let enabled = |pointer| ctx.existing_field(pointer).and_then(JsonValue::as_bool) == Some(true);
    if enabled("/spec/proxysql/enabled") {
        Some(ProxyKind::ProxySQL)
    } else if enabled("/spec/haproxy/enabled") {
        Some(ProxyKind::HAProxy)
    } else {
        None
    }
}

fn populate_proxy(
    p: &XtraDbParams,
    ctx: &BuildContext<'_>,
    layout: Layout,
    spec: &mut PxcClusterSpec,
) -> Result<()> {
    let kind = p
        .proxy
        .kind
        .or_else(|| existing_proxy(ctx))
        .unwrap_or_default();
    // The proxy choice is written on create and when it is asked for explicitly
    let write_choice = ctx.creating() || p.proxy.kind.is_some();

    let volume_spec = match (kind, p.proxy.disk_size_bytes) {
        (ProxyKind::HAProxy, Some(_)) => {
            return Err(ctx.invalid("HAProxy has no persistent volume, disk size applies to ProxySQL only"));
        }
        (ProxyKind::HAProxy, None) => None,
        (ProxyKind::ProxySQL, disk) => volume(disk),
    };

    let service_type = match layout {
        Layout::Legacy => p.expose.map(|enabled| {
            let service = if enabled {
                p.expose_type.unwrap_or_default()
            } else {
                Default::default()
            };
            service.as_str().to_string()
        }),
        Layout::Current => None,
    };

    let proxy = PxcPodSpec {
        enabled: write_choice.then_some(true),
        size: p.size,
        image: p.proxy.image.clone(),
        resources: pod_resources(p.proxy.compute.as_ref()),
        volume_spec,
        service_type,
        ..Default::default()
    };
    let proxy = (proxy != PxcPodSpec::default()).then_some(proxy);
    let disabled = write_choice.then(|| PxcPodSpec {
        enabled: Some(false),
        ..Default::default()
    });

    match kind {
        ProxyKind::HAProxy => {
            spec.haproxy = proxy;
            spec.proxysql = disabled;
        }
        ProxyKind::ProxySQL => {
            spec.proxysql = proxy;
            spec.haproxy = disabled;
        }
    }
    Ok(())
}

fn backup(p: &XtraDbParams) -> Option<PxcBackupSpec> {
    let backup = p.backup.as_ref()?;

    let schedule = (!backup.schedules.is_empty()).then(|| {
        backup
            .schedules
            .iter()
            .map(|s| PxcScheduledBackup {
                name: Some(s.name.clone()),
                schedule: Some(s.schedule.clone()),
                keep: s.keep,
                storage_name: Some(s.storage_name.clone()),
            })
            .collect()
    });

    let storages = (!backup.storages.is_empty()).then(|| {
        backup
            .storages
            .iter()
            .map(|(name, target)| (name.clone(), storage(target)))
            .collect()
    });

    Some(PxcBackupSpec {
        image: backup.image.clone(),
        schedule,
        storages,
    })
}

fn storage(target: &StorageTarget) -> BackupStorageSpec {
    match target {
        StorageTarget::Filesystem {
            size_bytes,
            storage_class,
        } => BackupStorageSpec {
            type_: Some("filesystem".to_string()),
            s3: None,
            volume: Some(VolumeSpec::claim(
                format_bytes(*size_bytes),
                storage_class.clone(),
            )),
        },
        s3 => s3_storage(s3).unwrap_or_default(),
    }
}

fn normalize_current(document: &mut JsonValue) {
    if let Some(expose) = object_at(document, &["spec", "pxc", "expose"])
        && expose.get("enabled").and_then(JsonValue::as_bool) == Some(true)
    {
        default_key(expose, "type", "ClusterIP");
    }
}

/// Older operators take exposure from the proxy service type alone, and an
/// absent type already means a cluster-internal service
fn normalize_legacy(_document: &mut JsonValue) {}

fn validate(document: &JsonValue, ctx: &BuildContext<'_>) -> Result<()> {
    let cluster: PerconaXtraDbCluster = serde_json::from_value(document.clone())
        .map_err(|e| ctx.invalid(format!("not a valid {} document: {}", PXC_KIND, e)))?;
    let spec = cluster
        .spec
        .as_ref()
        .ok_or_else(|| ctx.invalid("document has no spec"))?;

    let enabled_proxies = [&spec.haproxy, &spec.proxysql]
        .into_iter()
        .filter(|proxy| proxy.as_ref().and_then(|p| p.enabled) == Some(true))
        .count();
    if enabled_proxies > 1 {
        return Err(ctx.invalid("HAProxy and ProxySQL cannot both be enabled"));
    }

    if let Some(expose) = spec.pxc.as_ref().and_then(|p| p.expose.as_ref())
        && expose.enabled == Some(true)
        && expose.service_type().is_none()
    {
        return Err(ctx.invalid("exposure is enabled without a service type"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::build;
    use crate::error::CoreError;
    use crate::params::{
        BackupParams, BackupSchedule, ClusterParams, ComputeResources, ExposeType, ProxyParams,
    };
    use serde_json::json;
    use std::collections::BTreeMap;

    fn params(size: u32) -> XtraDbParams {
        XtraDbParams {
            name: "orders".to_string(),
            size: Some(size),
            ..Default::default()
        }
    }

    fn build_doc(p: XtraDbParams, version: &str, existing: Option<&JsonValue>) -> JsonValue {
        build(&ClusterParams::XtraDb(p), version, existing)
            .unwrap()
            .into_value()
    }

    #[test]
    fn test_create_current_generation() {
        let doc = build_doc(params(3), "1.11.0", None);
        assert_eq!(doc["apiVersion"], "pxc.percona.com/v1");
        assert_eq!(doc["kind"], "PerconaXtraDBCluster");
        assert_eq!(doc["metadata"]["name"], "orders");
        assert_eq!(doc["metadata"]["finalizers"], json!(["delete-pxc-pods-in-order"]));
        assert_eq!(doc["spec"]["crVersion"], "1.11.0");
        assert_eq!(doc["spec"]["secretsName"], "dbaas-orders-pxc-secrets");
        assert_eq!(doc["spec"]["allowUnsafeConfigurations"], false);
        assert_eq!(doc["spec"]["pxc"], json!({"size": 3}));
        assert_eq!(doc["spec"]["haproxy"], json!({"enabled": true, "size": 3}));
        assert_eq!(doc["spec"]["proxysql"], json!({"enabled": false}));
        assert!(doc.get("status").is_none());
        assert!(doc["spec"].get("pmm").is_none());
        assert!(doc["spec"].get("backup").is_none());
    }

    #[test]
    fn test_create_legacy_generation() {
        let p = XtraDbParams {
            expose: Some(true),
            expose_type: Some(ExposeType::LoadBalancer),
            ..params(1)
        };
        let doc = build_doc(p, "1.8.0", None);
        assert_eq!(doc["apiVersion"], "pxc.percona.com/v1-8-0");
        assert!(doc["spec"].get("crVersion").is_none());
        assert!(doc["spec"]["pxc"].get("expose").is_none());
        assert_eq!(doc["spec"]["haproxy"]["serviceType"], "LoadBalancer");
        assert_eq!(doc["spec"]["allowUnsafeConfigurations"], true);
    }

    #[test]
    fn test_build_is_deterministic() {
        let mut compute = ComputeResources::default();
        compute.cpu_millis = Some(1000);
        compute.memory_bytes = Some(2 << 30);
        let mut p = params(3);
        p.pxc.compute = Some(compute);
        p.pxc.disk_size_bytes = Some(25 << 30);
        p.version_service_url = Some("https://check.percona.com".to_string());

        let first = build(&ClusterParams::XtraDb(p.clone()), "1.11.0", None).unwrap();
        let second = build(&ClusterParams::XtraDb(p.clone()), "1.11.0", None).unwrap();
        assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());

        // Re-applying the same request over its own output changes nothing
        let existing = first.as_value().clone();
        let rebuilt = build(&ClusterParams::XtraDb(p), "1.11.0", Some(&existing)).unwrap();
        assert_eq!(rebuilt.to_json().unwrap(), first.to_json().unwrap());
    }

    #[test]
    fn test_update_overlays_only_given_fields() {
        let existing = json!({
            "apiVersion": "pxc.percona.com/v1",
            "kind": "PerconaXtraDBCluster",
            "metadata": {"name": "orders", "resourceVersion": "4711", "uid": "0a1b"},
            "spec": {
                "crVersion": "1.11.0",
                "secretsName": "dbaas-orders-pxc-secrets",
                "pxc": {"size": 3, "image": "percona/percona-xtradb-cluster:8.0.27"},
                "haproxy": {"enabled": true, "size": 3},
                "proxysql": {"enabled": false}
            },
            "status": {"state": "ready"}
        });
        let mut p = XtraDbParams {
            name: "orders".to_string(),
            ..Default::default()
        };
        p.pxc.compute = Some(ComputeResources {
            cpu_millis: Some(500),
            memory_bytes: None,
        });

        let doc = build_doc(p, "1.11.0", Some(&existing));
        assert_eq!(
            doc["spec"]["pxc"]["image"],
            "percona/percona-xtradb-cluster:8.0.27"
        );
        assert_eq!(doc["spec"]["pxc"]["size"], 3);
        assert_eq!(doc["spec"]["pxc"]["resources"]["requests"], json!({"cpu": "500m"}));
        assert_eq!(doc["spec"]["haproxy"], json!({"enabled": true, "size": 3}));
        assert!(doc.get("status").is_none());
        assert!(doc["metadata"].get("resourceVersion").is_none());
        assert!(doc["metadata"].get("finalizers").is_none());
    }

    #[test]
    fn test_pause_and_resume() {
        let existing = build_doc(params(3), "1.11.0", None);
        let pause = XtraDbParams {
            pause: Some(true),
            ..XtraDbParams {
                name: "orders".to_string(),
                ..Default::default()
            }
        };
        let paused = build_doc(pause, "1.11.0", Some(&existing));
        assert_eq!(paused["spec"]["pause"], true);
        assert_eq!(paused["spec"]["pxc"]["size"], 3);

        let resume = XtraDbParams {
            name: "orders".to_string(),
            pause: Some(false),
            ..Default::default()
        };
        let resumed = build_doc(resume, "1.11.0", Some(&paused));
        assert_eq!(resumed["spec"]["pause"], false);
    }

    #[test]
    fn test_expose_defaults_to_cluster_ip() {
        let p = XtraDbParams {
            expose: Some(true),
            ..params(3)
        };
        let doc = build_doc(p, "1.9.0", None);
        assert_eq!(
            doc["spec"]["pxc"]["expose"],
            json!({"enabled": true, "type": "ClusterIP"})
        );
    }

    #[test]
    fn test_proxysql_selection_and_switch() {
        let p = XtraDbParams {
            proxy: ProxyParams {
                kind: Some(ProxyKind::ProxySQL),
                disk_size_bytes: Some(2 << 30),
                ..Default::default()
            },
            ..params(3)
        };
        let doc = build_doc(p, "1.11.0", None);
        assert_eq!(doc["spec"]["proxysql"]["enabled"], true);
        assert_eq!(
            doc["spec"]["proxysql"]["volumeSpec"]["persistentVolumeClaim"]["resources"]["requests"]
                ["storage"],
            "2Gi"
        );
        assert_eq!(doc["spec"]["haproxy"], json!({"enabled": false}));

        // Resources without a proxy kind go to the proxy already enabled
        let update = XtraDbParams {
            name: "orders".to_string(),
            proxy: ProxyParams {
                image: Some("percona/proxysql2:2.3".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let updated = build_doc(update, "1.11.0", Some(&doc));
        assert_eq!(updated["spec"]["proxysql"]["image"], "percona/proxysql2:2.3");
        assert!(updated["spec"]["haproxy"].get("image").is_none());

        let switch = XtraDbParams {
            name: "orders".to_string(),
            proxy: ProxyParams {
                kind: Some(ProxyKind::HAProxy),
                ..Default::default()
            },
            ..Default::default()
        };
        let switched = build_doc(switch, "1.11.0", Some(&updated));
        assert_eq!(switched["spec"]["haproxy"]["enabled"], true);
        assert_eq!(switched["spec"]["proxysql"]["enabled"], false);
    }

    #[test]
    fn test_haproxy_disk_rejected() {
        let p = XtraDbParams {
            proxy: ProxyParams {
                disk_size_bytes: Some(1 << 30),
                ..Default::default()
            },
            ..params(3)
        };
        let err = build(&ClusterParams::XtraDb(p), "1.11.0", None).unwrap_err();
        assert!(matches!(err, CoreError::BuildValidation { .. }));
    }

    #[test]
    fn test_both_proxies_enabled_rejected() {
        let existing = json!({
            "apiVersion": "pxc.percona.com/v1",
            "kind": "PerconaXtraDBCluster",
            "metadata": {"name": "orders"},
            "spec": {"haproxy": {"enabled": true}, "proxysql": {"enabled": true}}
        });
        let err = build(
            &ClusterParams::XtraDb(XtraDbParams {
                name: "orders".to_string(),
                pause: Some(false),
                ..Default::default()
            }),
            "1.11.0",
            Some(&existing),
        )
        .unwrap_err();
        assert!(err.to_string().contains("both be enabled"));
    }

    #[test]
    fn test_backup_section() {
        let mut storages = BTreeMap::new();
        storages.insert(
            "s3-eu".to_string(),
            StorageTarget::S3 {
                bucket: "pxc-backups".to_string(),
                region: Some("eu-west-1".to_string()),
                endpoint_url: None,
                credentials_secret: "s3-creds".to_string(),
            },
        );
        storages.insert(
            "local".to_string(),
            StorageTarget::Filesystem {
                size_bytes: 6 << 30,
                storage_class: Some("standard".to_string()),
            },
        );
        let p = XtraDbParams {
            backup: Some(BackupParams {
                image: Some("percona/percona-xtrabackup:8.0.27".to_string()),
                schedules: vec![BackupSchedule {
                    name: "daily".to_string(),
                    schedule: "0 3 * * *".to_string(),
                    keep: Some(5),
                    storage_name: "s3-eu".to_string(),
                }],
                storages,
            }),
            ..params(3)
        };
        let doc = build_doc(p, "1.11.0", None);
        let backup = &doc["spec"]["backup"];
        assert_eq!(
            backup["schedule"],
            json!([{"name": "daily", "schedule": "0 3 * * *", "keep": 5, "storageName": "s3-eu"}])
        );
        assert_eq!(
            backup["storages"]["s3-eu"],
            json!({"type": "s3", "s3": {"bucket": "pxc-backups", "credentialsSecret": "s3-creds", "region": "eu-west-1"}})
        );
        assert_eq!(backup["storages"]["local"]["type"], "filesystem");
        assert_eq!(
            backup["storages"]["local"]["volume"]["persistentVolumeClaim"]["storageClassName"],
            "standard"
        );
    }
}
