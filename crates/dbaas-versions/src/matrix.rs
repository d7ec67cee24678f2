//! Version matrix types and selection
//!
//! The version service answers with one entry per (product, operator version).
//! Each entry maps component names to candidate versions:
//!
//! ```json
//! {"versions": [{"product": "pxc-operator", "operator": "1.11.0",
//!   "matrix": {"pxc": {"8.0.27-18.1": {"imagePath": "...", "imageHash": "...",
//!                                      "status": "recommended", "critical": false}}}}]}
//! ```

use semver::Version;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, VersionError};

/// Component status marking the version a new cluster should use
pub const STATUS_RECOMMENDED: &str = "recommended";

/// Platform product whose matrix lists compatible operator versions
pub const PLATFORM_PRODUCT: &str = "pmm-server";
/// Component of the platform matrix holding MySQL-engine operator versions
pub const XTRADB_OPERATOR_COMPONENT: &str = "pxcOperator";
/// Component of the platform matrix holding MongoDB-engine operator versions
pub const PSMDB_OPERATOR_COMPONENT: &str = "psmdbOperator";

/// Response body of `GET /{product}/{version}`
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionResponse {
    #[serde(default)]
    pub versions: Vec<VersionMatrixEntry>,
}

/// Compatibility matrix of one product release
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMatrixEntry {
    pub product: String,
    /// Release of `product` this matrix belongs to
    pub operator: String,
    #[serde(default)]
    pub matrix: BTreeMap<String, BTreeMap<String, ComponentInfo>>,
}

/// One candidate version of a component
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentInfo {
    #[serde(default)]
    pub image_path: String,
    #[serde(default)]
    pub image_hash: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub critical: bool,
}

/// Latest compatible operator version per engine
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperatorVersions {
    pub xtradb: Version,
    pub psmdb: Version,
}

impl VersionMatrixEntry {
    /// Candidates of `component`
    pub fn component(&self, component: &str) -> Result<&BTreeMap<String, ComponentInfo>> {
        self.matrix
            .get(component)
            .ok_or_else(|| VersionError::ComponentNotFound {
                product: self.product.clone(),
                version: self.operator.clone(),
                component: component.to_string(),
            })
    }
}

/// Parse a matrix key (`1.11.0`, `8.0.27-18.1`, `2.4`, `v1.2.0`)
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix('v').unwrap_or(trimmed);

    let invalid = |reason: String| VersionError::InvalidVersion {
        version: raw.to_string(),
        reason,
    };

    match Version::parse(trimmed) {
        Ok(version) => Ok(version),
        Err(err) => {
            // `X.Y` and `X.Y-suffix` get a zero patch
            let (core, rest) = match trimmed.find(['-', '+']) {
                Some(idx) => trimmed.split_at(idx),
                None => (trimmed, ""),
            };
            if core.matches('.').count() == 1 {
                Version::parse(&format!("{}.0{}", core, rest)).map_err(|e| invalid(e.to_string()))
            } else {
                Err(invalid(err.to_string()))
            }
        }
    }
}

/// Highest version among the keys of `versions`
///
/// Folds with strict greater-than starting from `0.0.0`. An empty map is an
/// error, and so is any key that is not a version.
pub fn latest<V>(versions: &BTreeMap<String, V>) -> Result<Version> {
    if versions.is_empty() {
        return Err(VersionError::resolution("no versions to choose from"));
    }
    versions
        .keys()
        .try_fold(Version::new(0, 0, 0), |max, key| {
            let version = parse_version(key)?;
            Ok(if version > max { version } else { max })
        })
}

/// Recommended candidate of a component, the latest one when none is recommended
pub fn recommended(candidates: &BTreeMap<String, ComponentInfo>) -> Result<(Version, &ComponentInfo)> {
    let recommended: BTreeMap<String, &ComponentInfo> = candidates
        .iter()
        .filter(|(_, info)| info.status == STATUS_RECOMMENDED)
        .map(|(k, v)| (k.clone(), v))
        .collect();

    let pool = if recommended.is_empty() {
        candidates.iter().map(|(k, v)| (k.clone(), v)).collect()
    } else {
        recommended
    };

    let best = latest(&pool)?;
    let info = pool
        .iter()
        .find(|(key, _)| parse_version(key).is_ok_and(|v| v == best))
        .map(|(_, info)| *info)
        .ok_or_else(|| VersionError::resolution(format!("version {} vanished", best)))?;
    Ok((best, info))
}

/// Latest operator versions compatible with a platform release
///
/// Exactly one matrix entry is required; zero or several entries mean the
/// service has no usable dependency information and `None` is returned.
pub fn operator_versions(response: &VersionResponse) -> Result<Option<OperatorVersions>> {
    let [entry] = response.versions.as_slice() else {
        return Ok(None);
    };
    Ok(Some(OperatorVersions {
        xtradb: latest(entry.component(XTRADB_OPERATOR_COMPONENT)?)?,
        psmdb: latest(entry.component(PSMDB_OPERATOR_COMPONENT)?)?,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(status: &str) -> ComponentInfo {
        ComponentInfo {
            image_path: format!("percona/image:{}", status),
            status: status.to_string(),
            ..Default::default()
        }
    }

    fn map(keys: &[&str]) -> BTreeMap<String, ComponentInfo> {
        keys.iter()
            .map(|k| (k.to_string(), info("available")))
            .collect()
    }

    #[test]
    fn test_latest_of_empty_map_fails() {
        let empty: BTreeMap<String, ComponentInfo> = BTreeMap::new();
        assert!(matches!(
            latest(&empty),
            Err(VersionError::VersionResolution { .. })
        ));
    }

    #[test]
    fn test_latest_uses_semantic_order() {
        let versions = map(&["1.2.0", "1.10.0", "2.0.0"]);
        assert_eq!(latest(&versions).unwrap(), Version::new(2, 0, 0));

        let versions = map(&["1.2.0", "1.10.0", "1.9.1"]);
        assert_eq!(latest(&versions).unwrap(), Version::new(1, 10, 0));
    }

    #[test]
    fn test_latest_rejects_non_versions() {
        let versions = map(&["1.2.0", "latest"]);
        assert!(matches!(
            latest(&versions),
            Err(VersionError::InvalidVersion { .. })
        ));
    }

    #[test]
    fn test_parse_lenient_forms() {
        assert_eq!(parse_version("2.4").unwrap(), Version::new(2, 4, 0));
        assert_eq!(parse_version("v1.12.0").unwrap(), Version::new(1, 12, 0));
        let image = parse_version("8.0.27-18.1").unwrap();
        assert_eq!((image.major, image.minor, image.patch), (8, 0, 27));
        assert_eq!(image.pre.as_str(), "18.1");
        assert_eq!(parse_version("2.4-1").unwrap().pre.as_str(), "1");
        assert!(parse_version("eight").is_err());
    }

    #[test]
    fn test_recommended_prefers_status() {
        let mut candidates = map(&["8.0.25-15.1", "8.0.26-16.1"]);
        candidates.insert("8.0.23-14.1".to_string(), info(STATUS_RECOMMENDED));
        let (version, chosen) = recommended(&candidates).unwrap();
        assert_eq!(version.to_string(), "8.0.23-14.1");
        assert_eq!(chosen.image_path, "percona/image:recommended");

        let (version, _) = recommended(&map(&["8.0.25-15.1", "8.0.26-16.1"])).unwrap();
        assert_eq!(version.to_string(), "8.0.26-16.1");
    }

    #[test]
    fn test_operator_versions_require_single_entry() {
        let entry = VersionMatrixEntry {
            product: PLATFORM_PRODUCT.to_string(),
            operator: "2.26.0".to_string(),
            matrix: BTreeMap::from([
                (XTRADB_OPERATOR_COMPONENT.to_string(), map(&["1.10.0", "1.11.0"])),
                (PSMDB_OPERATOR_COMPONENT.to_string(), map(&["1.11.0", "1.12.0"])),
            ]),
        };

        let none = VersionResponse::default();
        assert_eq!(operator_versions(&none).unwrap(), None);

        let two = VersionResponse {
            versions: vec![entry.clone(), entry.clone()],
        };
        assert_eq!(operator_versions(&two).unwrap(), None);

        let one = VersionResponse {
            versions: vec![entry],
        };
        assert_eq!(
            operator_versions(&one).unwrap(),
            Some(OperatorVersions {
                xtradb: Version::new(1, 11, 0),
                psmdb: Version::new(1, 12, 0),
            })
        );
    }

    #[test]
    fn test_operator_versions_missing_component() {
        let response = VersionResponse {
            versions: vec![VersionMatrixEntry {
                product: PLATFORM_PRODUCT.to_string(),
                operator: "2.26.0".to_string(),
                matrix: BTreeMap::from([(
                    XTRADB_OPERATOR_COMPONENT.to_string(),
                    map(&["1.11.0"]),
                )]),
            }],
        };
        assert!(matches!(
            operator_versions(&response),
            Err(VersionError::ComponentNotFound { .. })
        ));
    }
}
