//! Custom resource document builder
//!
//! `build` maps cluster parameters, the installed operator's schema version and
//! an optional previously applied document to a complete custom resource:
//!
//! 1. parameters are validated and the schema version is parsed
//! 2. the schema generation is picked from a per-engine dispatch table
//! 3. a fragment holding only the fields present in the parameters is populated
//! 4. with an existing document, the fragment is overlaid on it so that every
//!    field the parameters do not mention is kept verbatim
//! 5. the result is normalized (exposure defaults) and validated
//!
//! The output is a pure function of the inputs: no generated identifiers and
//! no timestamps, so re-applying an unchanged request is a no-op.

mod psmdb;
mod pxc;

use semver::Version;
use serde_json::Value as JsonValue;

use crate::crd::{
    BackupStorageSpec, CrDocument, PmmSpec, PodResources, ResourceList, S3Storage, UpgradeOptions,
    VolumeSpec, overlay, strip_server_fields,
};
use crate::error::{CoreError, Result};
use crate::params::{ClusterParams, ComputeResources, Engine, MonitoringParams, StorageTarget};
use crate::quantity::{format_bytes, format_cpu_millis};

use psmdb::PSMDB_GENERATIONS;
use pxc::PXC_GENERATIONS;

/// Build the custom resource for `params` against operator schema `schema_version`
///
/// `existing` is the document currently stored on the platform, if any. When
/// given, only the fields present in `params` are changed.
pub fn build(
    params: &ClusterParams,
    schema_version: &str,
    existing: Option<&JsonValue>,
) -> Result<CrDocument> {
    params.validate()?;
    let version = parse_schema_version(params.engine(), schema_version)?;

    match params {
        ClusterParams::XtraDb(p) => assemble(
            Engine::XtraDb,
            &PXC_GENERATIONS,
            p,
            &p.name,
            &version,
            existing,
        ),
        ClusterParams::Psmdb(p) => assemble(
            Engine::Psmdb,
            &PSMDB_GENERATIONS,
            p,
            &p.name,
            &version,
            existing,
        ),
    }
}

/// Name of the generation `schema_version` falls into
pub fn generation_label(engine: Engine, schema_version: &str) -> Result<&'static str> {
    let version = parse_schema_version(engine, schema_version)?;
    Ok(match engine {
        Engine::XtraDb => select(engine, &PXC_GENERATIONS, &version)?.label,
        Engine::Psmdb => select(engine, &PSMDB_GENERATIONS, &version)?.label,
    })
}

/// A version range within which an operator's document shape is stable
///
/// Tables list generations newest first; a version belongs to the first entry
/// whose `since` it reaches.
pub(crate) struct Generation<P> {
    pub label: &'static str,
    pub since: Version,
    pub populate: fn(&P, &BuildContext<'_>) -> Result<JsonValue>,
    pub normalize: fn(&mut JsonValue),
    pub validate: fn(&JsonValue, &BuildContext<'_>) -> Result<()>,
}

/// Inputs available to every generation hook
pub(crate) struct BuildContext<'a> {
    pub name: &'a str,
    pub version: &'a Version,
    pub existing: Option<&'a JsonValue>,
}

impl BuildContext<'_> {
    pub fn creating(&self) -> bool {
        self.existing.is_none()
    }

    /// `X.Y.Z` form written to `crVersion`
    pub fn cr_version(&self) -> String {
        format!(
            "{}.{}.{}",
            self.version.major, self.version.minor, self.version.patch
        )
    }

    /// Look up a field of the existing document by JSON pointer
    pub fn existing_field(&self, pointer: &str) -> Option<&JsonValue> {
        self.existing?.pointer(pointer)
    }

    pub fn invalid(&self, message: impl Into<String>) -> CoreError {
        CoreError::BuildValidation {
            name: self.name.to_string(),
            message: message.into(),
        }
    }
}

fn assemble<P>(
    engine: Engine,
    generations: &'static [Generation<P>],
    params: &P,
    name: &str,
    version: &Version,
    existing: Option<&JsonValue>,
) -> Result<CrDocument> {
    let generation = select(engine, generations, version)?;
    let ctx = BuildContext {
        name,
        version,
        existing,
    };

    let fragment = (generation.populate)(params, &ctx)?;

    let mut document = match existing {
        Some(existing) => {
            check_identity(&ctx, existing, &fragment)?;
            let mut base = existing.clone();
            strip_server_fields(&mut base);
            overlay(&mut base, &fragment);
            base
        }
        None => fragment,
    };

    (generation.normalize)(&mut document);
    (generation.validate)(&document, &ctx)?;

    Ok(CrDocument::new(engine, document))
}

/// The stored document must describe the same object the parameters name
fn check_identity(ctx: &BuildContext<'_>, existing: &JsonValue, fragment: &JsonValue) -> Result<()> {
    let existing_name = existing.pointer("/metadata/name").and_then(JsonValue::as_str);
    if existing_name != Some(ctx.name) {
        return Err(ctx.invalid(format!(
            "existing document is named '{}'",
            existing_name.unwrap_or_default()
        )));
    }

    let existing_kind = existing.get("kind").and_then(JsonValue::as_str);
    let kind = fragment.get("kind").and_then(JsonValue::as_str);
    if existing_kind != kind {
        return Err(ctx.invalid(format!(
            "existing document has kind '{}', expected '{}'",
            existing_kind.unwrap_or_default(),
            kind.unwrap_or_default()
        )));
    }
    Ok(())
}

fn select<'a, P>(
    engine: Engine,
    generations: &'a [Generation<P>],
    version: &Version,
) -> Result<&'a Generation<P>> {
    generations
        .iter()
        .find(|g| version >= &g.since)
        .ok_or_else(|| {
            let oldest = generations
                .last()
                .map(|g| g.since.to_string())
                .unwrap_or_default();
            CoreError::UnsupportedSchemaVersion {
                engine: engine.to_string(),
                version: version.to_string(),
                reason: format!("oldest supported operator version is {}", oldest),
            }
        })
}

/// Parse an operator version (`1.11.0`, `1.11`, `v1.11.0`)
///
/// Pre-release and build metadata are dropped; generations are keyed on
/// release numbers only.
pub fn parse_schema_version(engine: Engine, raw: &str) -> Result<Version> {
    let unsupported = |reason: &str| CoreError::UnsupportedSchemaVersion {
        engine: engine.to_string(),
        version: raw.to_string(),
        reason: reason.to_string(),
    };

    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);
    if trimmed.is_empty() {
        return Err(unsupported("version is empty"));
    }

    let core = trimmed.split(['-', '+']).next().unwrap_or_default();
    let candidate = match core.matches('.').count() {
        1 => format!("{}.0", core),
        2 => core.to_string(),
        _ => return Err(unsupported("expected MAJOR.MINOR or MAJOR.MINOR.PATCH")),
    };

    let version = Version::parse(&candidate).map_err(|e| unsupported(&e.to_string()))?;
    Ok(Version::new(version.major, version.minor, version.patch))
}

/// `group/vX-Y-Z`, the apiVersion form of older operators
pub(crate) fn versioned_api_version(group: &str, version: &Version) -> String {
    format!(
        "{}/v{}-{}-{}",
        group, version.major, version.minor, version.patch
    )
}

/// Requests and limits for a role; both are set to the requested amount
pub(crate) fn pod_resources(compute: Option<&ComputeResources>) -> Option<PodResources> {
    let compute = compute?;
    if compute.cpu_millis.is_none() && compute.memory_bytes.is_none() {
        return None;
    }
    let list = ResourceList {
        cpu: compute.cpu_millis.map(format_cpu_millis),
        memory: compute.memory_bytes.map(format_bytes),
    };
    Some(PodResources {
        requests: Some(list.clone()),
        limits: Some(list),
    })
}

pub(crate) fn volume(disk_size_bytes: Option<u64>) -> Option<VolumeSpec> {
    disk_size_bytes.map(|size| VolumeSpec::claim(format_bytes(size), None))
}

pub(crate) fn pmm(monitoring: Option<&MonitoringParams>) -> Option<PmmSpec> {
    let monitoring = monitoring?;
    Some(PmmSpec {
        enabled: Some(monitoring.enabled),
        server_host: monitoring.host.clone(),
        server_user: monitoring.user.clone(),
        image: monitoring.image.clone(),
        resources: pod_resources(monitoring.compute.as_ref()),
    })
}

/// Point the operator at the version service; upgrades stay manual
pub(crate) fn upgrade_options(version_service_url: Option<&String>) -> Option<UpgradeOptions> {
    version_service_url.map(|url| UpgradeOptions {
        version_service_endpoint: Some(url.clone()),
        apply: Some("disabled".to_string()),
        schedule: None,
    })
}

pub(crate) fn s3_storage(target: &StorageTarget) -> Option<BackupStorageSpec> {
    match target {
        StorageTarget::S3 {
            bucket,
            region,
            endpoint_url,
            credentials_secret,
        } => Some(BackupStorageSpec {
            type_: Some("s3".to_string()),
            s3: Some(S3Storage {
                bucket: Some(bucket.clone()),
                credentials_secret: Some(credentials_secret.clone()),
                region: region.clone(),
                endpoint_url: endpoint_url.clone(),
            }),
            volume: None,
        }),
        StorageTarget::Filesystem { .. } => None,
    }
}

/// Set `key` to `value` in a JSON object when it is absent
pub(crate) fn default_key(object: &mut serde_json::Map<String, JsonValue>, key: &str, value: &str) {
    if !object.contains_key(key) {
        object.insert(key.to_string(), JsonValue::String(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::{PsmdbParams, XtraDbParams};

    #[test]
    fn test_parse_schema_version_forms() {
        for raw in ["1.11.0", "1.11", "v1.11.0", " 1.11.0 ", "1.11.0-rc1"] {
            assert_eq!(
                parse_schema_version(Engine::XtraDb, raw).unwrap(),
                Version::new(1, 11, 0),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_parse_schema_version_rejects_garbage() {
        for raw in ["", "v", "1", "1.2.3.4", "latest", "1.x.0"] {
            let err = parse_schema_version(Engine::Psmdb, raw).unwrap_err();
            assert!(
                matches!(err, CoreError::UnsupportedSchemaVersion { .. }),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_generation_labels() {
        assert_eq!(generation_label(Engine::XtraDb, "1.8.0").unwrap(), "pre-1.9");
        assert_eq!(generation_label(Engine::XtraDb, "1.9.0").unwrap(), "1.9+");
        assert_eq!(generation_label(Engine::XtraDb, "2.0").unwrap(), "1.9+");
        assert_eq!(generation_label(Engine::Psmdb, "1.11.0").unwrap(), "pre-1.12");
        assert_eq!(generation_label(Engine::Psmdb, "1.12.0").unwrap(), "1.12+");
    }

    #[test]
    fn test_too_old_operator_is_rejected() {
        let params = ClusterParams::XtraDb(XtraDbParams {
            name: "orders".to_string(),
            ..Default::default()
        });
        let err = build(&params, "1.6.0", None).unwrap_err();
        assert!(matches!(err, CoreError::UnsupportedSchemaVersion { .. }));

        let params = ClusterParams::Psmdb(PsmdbParams {
            name: "events".to_string(),
            ..Default::default()
        });
        assert!(build(&params, "1.7.0", None).is_err());
    }

    #[test]
    fn test_invalid_params_rejected_before_version() {
        let params = ClusterParams::XtraDb(XtraDbParams {
            name: "orders".to_string(),
            size: Some(0),
            ..Default::default()
        });
        let err = build(&params, "not-a-version", None).unwrap_err();
        assert!(matches!(err, CoreError::InvalidParams { .. }));
    }

    #[test]
    fn test_existing_document_must_match_name() {
        let params = ClusterParams::XtraDb(XtraDbParams {
            name: "orders".to_string(),
            size: Some(3),
            ..Default::default()
        });
        let existing = serde_json::json!({
            "apiVersion": "pxc.percona.com/v1",
            "kind": "PerconaXtraDBCluster",
            "metadata": {"name": "payments"},
            "spec": {}
        });
        let err = build(&params, "1.11.0", Some(&existing)).unwrap_err();
        assert!(matches!(err, CoreError::BuildValidation { .. }));
    }

    #[test]
    fn test_pod_resources_formatting() {
        let resources = pod_resources(Some(&ComputeResources {
            cpu_millis: Some(1000),
            memory_bytes: Some(2 << 30),
        }))
        .unwrap();
        let requests = resources.requests.unwrap();
        assert_eq!(requests.cpu.as_deref(), Some("1000m"));
        assert_eq!(requests.memory.as_deref(), Some("2Gi"));
        assert!(pod_resources(Some(&ComputeResources::default())).is_none());
    }
}
