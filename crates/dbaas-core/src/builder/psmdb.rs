//! PerconaServerMongoDB generations
//!
//! - `pre-1.12`: apiVersion encodes the operator release (`v1-11-0`); data-at-rest
//!   encryption lives in `spec.mongod.security`; no non-voting members.
//! - `1.12+`: apiVersion `v1` plus `spec.crVersion`; the encryption key moves to
//!   `spec.secrets.encryptionKey` and the cipher settings into the replica set's
//!   raw `configuration`; replica sets may carry a `nonvoting` group; the router
//!   exposure key is `type` instead of `exposeType`.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use semver::Version;
use serde_json::Value as JsonValue;

use super::{
    BuildContext, Generation, default_key, pmm, pod_resources, s3_storage, upgrade_options,
    versioned_api_version, volume,
};
use crate::crd::psmdb::{
    BackupTask, DEFAULT_REPLSET_NAME, MemberGroupSpec, MongodSecurity, MongodSpec, MongosSpec,
    PsmdbBackupSpec, SecretsSpec,
};
use crate::crd::{
    ExposeSpec, PSMDB_GROUP, PSMDB_KIND, PerconaServerMongoDb, PsmdbClusterSpec, ReplsetSpec,
    ShardingSpec, to_value,
};
use crate::error::Result;
use crate::params::{EncryptionParams, ExposeType, MemberGroupParams, PsmdbParams, StorageTarget};

const FINALIZER: &str = "delete-psmdb-pods-in-order";

/// Replica sets smaller than this need the operator's unsafe-configuration switch
const SAFE_REPLSET_SIZE: u32 = 3;

pub(crate) static PSMDB_GENERATIONS: [Generation<PsmdbParams>; 2] = [
    Generation {
        label: "1.12+",
        since: Version::new(1, 12, 0),
        populate: populate_current,
        normalize,
        validate: validate_current,
    },
    Generation {
        label: "pre-1.12",
        since: Version::new(1, 8, 0),
        populate: populate_legacy,
        normalize,
        validate: validate_legacy,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Layout {
    Legacy,
    Current,
}

/// Name of the secret holding the system users
pub(crate) fn secrets_name(cluster: &str) -> String {
    format!("dbaas-{}-psmdb-secrets", cluster)
}

fn populate_current(p: &PsmdbParams, ctx: &BuildContext<'_>) -> Result<JsonValue> {
    populate(p, ctx, Layout::Current)
}

fn populate_legacy(p: &PsmdbParams, ctx: &BuildContext<'_>) -> Result<JsonValue> {
    populate(p, ctx, Layout::Legacy)
}

fn populate(p: &PsmdbParams, ctx: &BuildContext<'_>, layout: Layout) -> Result<JsonValue> {
    let api_version = match layout {
        Layout::Legacy => versioned_api_version(PSMDB_GROUP, ctx.version),
        Layout::Current => format!("{}/v1", PSMDB_GROUP),
    };

    let mut spec = PsmdbClusterSpec {
        cr_version: (layout == Layout::Current).then(|| ctx.cr_version()),
        pause: p.pause,
        image: p.image.clone(),
        upgrade_options: upgrade_options(p.version_service_url.as_ref()),
        pmm: pmm(p.monitoring.as_ref()),
        backup: backup(p, ctx)?,
        ..Default::default()
    };
    if let Some(size) = p.size {
        spec.allow_unsafe_configurations = Some(size < SAFE_REPLSET_SIZE);
    }

    let mut secrets = SecretsSpec {
        users: ctx.creating().then(|| secrets_name(&p.name)),
        ..Default::default()
    };

    let mut replset = ReplsetSpec {
        size: p.size,
        resources: pod_resources(p.replset.compute.as_ref()),
        volume_spec: volume(p.replset.disk_size_bytes),
        expose: replset_expose(p),
        arbiter: p.arbiter.as_ref().map(member_group),
        ..Default::default()
    };

    match (layout, &p.non_voting) {
        (Layout::Legacy, Some(_)) => {
            return Err(ctx.invalid("non-voting members need operator 1.12 or newer"));
        }
        (Layout::Current, non_voting) => replset.nonvoting = non_voting.as_ref().map(member_group),
        (Layout::Legacy, None) => {}
    }

    if let Some(encryption) = &p.encryption {
        match layout {
            Layout::Legacy => {
                spec.mongod = Some(MongodSpec {
                    security: Some(MongodSecurity {
                        enable_encryption: Some(encryption.enabled),
                        encryption_key_secret: encryption.key_secret.clone(),
                        encryption_cipher_mode: encryption.cipher_mode.clone(),
                    }),
                });
            }
            Layout::Current => {
                secrets.encryption_key = encryption.key_secret.clone();
                replset.configuration = Some(encryption_configuration(encryption));
            }
        }
    }

    spec.secrets = (secrets != SecretsSpec::default()).then_some(secrets);
    // Updates target the stored data replica set and only when a replica set
    // field was requested
    if ctx.creating() || replset != ReplsetSpec::default() {
        let name = ctx
            .existing_field("/spec/replsets/0/name")
            .and_then(JsonValue::as_str)
            .unwrap_or(DEFAULT_REPLSET_NAME);
        replset.name = Some(name.to_string());
        spec.replsets = Some(vec![replset]);
    }
    spec.sharding = sharding(p, ctx, layout);

    let cluster = PerconaServerMongoDb {
        api_version,
        kind: PSMDB_KIND.to_string(),
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

fn member_group(group: &MemberGroupParams) -> MemberGroupSpec {
    MemberGroupSpec {
        enabled: Some(group.enabled),
        size: group.size,
        ..Default::default()
    }
}

fn replset_expose(p: &PsmdbParams) -> Option<ExposeSpec> {
    if p.expose.is_none() && p.expose_type.is_none() {
        return None;
    }
    Some(ExposeSpec {
        enabled: p.expose,
        type_: None,
        expose_type: p.expose_type.map(|t| t.as_str().to_string()),
    })
}

/// Router service; the router has no on/off switch, so disabled exposure is a
/// cluster-internal service
fn mongos_expose(p: &PsmdbParams, layout: Layout) -> Option<ExposeSpec> {
    let service = match (p.expose, p.expose_type) {
        (Some(false), _) => ExposeType::ClusterIP,
        (_, Some(service)) => service,
        (Some(true), None) => ExposeType::default(),
        (None, None) => return None,
    };
    let service = Some(service.as_str().to_string());
    Some(match layout {
        Layout::Legacy => ExposeSpec {
            expose_type: service,
            ..Default::default()
        },
        Layout::Current => ExposeSpec {
            type_: service,
            ..Default::default()
        },
    })
}

fn sharding(p: &PsmdbParams, ctx: &BuildContext<'_>, layout: Layout) -> Option<ShardingSpec> {
    let params = p.sharding.as_ref();
    let sharded = params.map(|s| s.enabled).unwrap_or_else(|| {
        ctx.existing_field("/spec/sharding/enabled")
            .and_then(JsonValue::as_bool)
            .unwrap_or(false)
    });

    let configsvr = params.map(|s| ReplsetSpec {
        size: s.configsvr_size,
        resources: pod_resources(s.configsvr.compute.as_ref()),
        volume_spec: volume(s.configsvr.disk_size_bytes),
        ..Default::default()
    });
    let mongos = MongosSpec {
        size: params.and_then(|s| s.mongos_size),
        resources: params.and_then(|s| pod_resources(s.mongos_compute.as_ref())),
        expose: if sharded { mongos_expose(p, layout) } else { None },
        ..Default::default()
    };

    let spec = ShardingSpec {
        enabled: params.map(|s| s.enabled),
        configsvr_repl_set: configsvr.filter(|c| *c != ReplsetSpec::default()),
        mongos: (mongos != MongosSpec::default()).then_some(mongos),
    };
    (spec != ShardingSpec::default()).then_some(spec)
}

/// Raw mongod configuration enabling data-at-rest encryption
fn encryption_configuration(encryption: &EncryptionParams) -> String {
    let mut configuration = format!(
        "security:\n  enableEncryption: {}\n",
        encryption.enabled
    );
    if let Some(mode) = &encryption.cipher_mode {
        configuration.push_str(&format!("  encryptionCipherMode: {}\n", mode));
    }
    configuration
}

fn backup(p: &PsmdbParams, ctx: &BuildContext<'_>) -> Result<Option<PsmdbBackupSpec>> {
    let Some(backup) = &p.backup else {
        return Ok(None);
    };

    let tasks = (!backup.schedules.is_empty()).then(|| {
        backup
            .schedules
            .iter()
            .map(|s| BackupTask {
                name: Some(s.name.clone()),
                enabled: Some(true),
                schedule: Some(s.schedule.clone()),
                keep: s.keep,
                storage_name: Some(s.storage_name.clone()),
            })
            .collect()
    });

    let mut storages = std::collections::BTreeMap::new();
    for (name, target) in &backup.storages {
        let spec = match target {
            StorageTarget::Filesystem { .. } => None,
            s3 => s3_storage(s3),
        }
        .ok_or_else(|| {
            ctx.invalid(format!(
                "storage '{}': the MongoDB operator only writes backups to S3",
                name
            ))
        })?;
        storages.insert(name.clone(), spec);
    }

    Ok(Some(PsmdbBackupSpec {
        enabled: Some(true),
        image: backup.image.clone(),
        tasks,
        storages: (!storages.is_empty()).then_some(storages),
    }))
}

fn normalize(document: &mut JsonValue) {
    if let Some(replsets) = document
        .pointer_mut("/spec/replsets")
        .and_then(JsonValue::as_array_mut)
    {
        for replset in replsets {
            default_expose_type(replset);
        }
    }
    if let Some(configsvr) = document.pointer_mut("/spec/sharding/configsvrReplSet") {
        default_expose_type(configsvr);
    }
}

fn default_expose_type(replset: &mut JsonValue) {
    if let Some(expose) = replset.get_mut("expose").and_then(JsonValue::as_object_mut)
        && expose.get("enabled").and_then(JsonValue::as_bool) == Some(true)
    {
        default_key(expose, "exposeType", ExposeType::default().as_str());
    }
}

fn validate_current(document: &JsonValue, ctx: &BuildContext<'_>) -> Result<()> {
    validate(document, ctx, Layout::Current)
}

fn validate_legacy(document: &JsonValue, ctx: &BuildContext<'_>) -> Result<()> {
    validate(document, ctx, Layout::Legacy)
}

fn validate(document: &JsonValue, ctx: &BuildContext<'_>, layout: Layout) -> Result<()> {
    let cluster: PerconaServerMongoDb = serde_json::from_value(document.clone())
        .map_err(|e| ctx.invalid(format!("not a valid {} document: {}", PSMDB_KIND, e)))?;
    let spec = cluster
        .spec
        .as_ref()
        .ok_or_else(|| ctx.invalid("document has no spec"))?;

    let replsets = spec.replsets.as_deref().unwrap_or_default();
    if replsets.is_empty() {
        return Err(ctx.invalid("document has no replica set"));
    }

    for replset in replsets {
        let name = replset.name.as_deref().unwrap_or_default();
        if let Some(expose) = &replset.expose
            && expose.enabled == Some(true)
            && expose.service_type().is_none()
        {
            return Err(ctx.invalid(format!(
                "replica set '{}' is exposed without a service type",
                name
            )));
        }
        if layout == Layout::Legacy && replset.nonvoting.is_some() {
            return Err(ctx.invalid(format!(
                "replica set '{}' has non-voting members, which need operator 1.12 or newer",
                name
            )));
        }
    }

    if let Some(sharding) = &spec.sharding
        && sharding.enabled == Some(true)
    {
        let configsvr_size = sharding
            .configsvr_repl_set
            .as_ref()
            .and_then(|c| c.size);
        if configsvr_size.is_none() {
            return Err(ctx.invalid(
                "sharding is enabled without a config server replica set size",
            ));
        }
    }
    Ok(())
}
