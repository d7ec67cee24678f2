//! Platform access port
//!
//! Everything the controller reads or writes goes through [`AccessPort`]:
//! - **KubeAccessPort**: talks to the API server through kube-rs
//! - **MockAccessPort**: in-memory store for tests
//!
//! Calls are at-most-once with no retry. An absent object is always reported
//! as [`KubeError::NotFound`](crate::KubeError::NotFound), never as a generic failure.

mod client;
mod mock;

pub use client::KubeAccessPort;
pub use mock::{MockAccessPort, OperationCounts};

use async_trait::async_trait;
use dbaas_core::Engine;
use dbaas_core::crd::{PSMDB_GROUP, PSMDB_KIND, PSMDB_PLURAL, PXC_GROUP, PXC_KIND, PXC_PLURAL};
use serde_json::Value as JsonValue;
use std::fmt;

use crate::error::Result;

/// A resource type the controller works with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResourceKind {
    pub group: &'static str,
    pub version: &'static str,
    pub kind: &'static str,
    pub plural: &'static str,
    pub namespaced: bool,
}

impl ResourceKind {
    pub const NODE: Self = Self::core("Node", "nodes", false);
    pub const POD: Self = Self::core("Pod", "pods", true);
    pub const PERSISTENT_VOLUME_CLAIM: Self =
        Self::core("PersistentVolumeClaim", "persistentvolumeclaims", true);
    pub const SECRET: Self = Self::core("Secret", "secrets", true);
    pub const DEPLOYMENT: Self = Self::apps("Deployment", "deployments");
    pub const STATEFUL_SET: Self = Self::apps("StatefulSet", "statefulsets");
    pub const XTRADB_CLUSTER: Self = Self {
        group: PXC_GROUP,
        version: "v1",
        kind: PXC_KIND,
        plural: PXC_PLURAL,
        namespaced: true,
    };
    pub const PSMDB_CLUSTER: Self = Self {
        group: PSMDB_GROUP,
        version: "v1",
        kind: PSMDB_KIND,
        plural: PSMDB_PLURAL,
        namespaced: true,
    };

    const fn core(kind: &'static str, plural: &'static str, namespaced: bool) -> Self {
        Self {
            group: "",
            version: "v1",
            kind,
            plural,
            namespaced,
        }
    }

    const fn apps(kind: &'static str, plural: &'static str) -> Self {
        Self {
            group: "apps",
            version: "v1",
            kind,
            plural,
            namespaced: true,
        }
    }

    /// Custom resource kind of an engine's clusters
    pub fn cluster(engine: Engine) -> Self {
        match engine {
            Engine::XtraDb => Self::XTRADB_CLUSTER,
            Engine::Psmdb => Self::PSMDB_CLUSTER,
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.to_string()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.group.is_empty() {
            f.write_str(self.plural)
        } else {
            write!(f, "{}.{}", self.plural, self.group)
        }
    }
}

/// How a patch document is interpreted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchType {
    /// RFC 7386 JSON merge patch
    Merge,
    /// Kubernetes strategic merge patch
    Strategic,
}

/// Synchronous request channel to the platform
#[async_trait]
pub trait AccessPort: Send + Sync {
    /// Get one object, or list all objects of `kind` as `{"items": [...]}`
    async fn get(&self, kind: &ResourceKind, name: Option<&str>) -> Result<JsonValue>;

    /// Server-side apply a complete document
    async fn apply(&self, document: &JsonValue) -> Result<()>;

    async fn patch(
        &self,
        kind: &ResourceKind,
        name: &str,
        patch_type: PatchType,
        patch: &JsonValue,
    ) -> Result<()>;

    /// Delete the object a document describes
    async fn delete(&self, document: &JsonValue) -> Result<()>;

    /// Items of `kind` across every namespace
    ///
    /// Cluster-scoped kinds behave like [`AccessPort::list`].
    async fn list_all_namespaces(&self, kind: &ResourceKind) -> Result<Vec<JsonValue>>;

    /// Items of a list returned by [`AccessPort::get`]
    async fn list(&self, kind: &ResourceKind) -> Result<Vec<JsonValue>> {
        Ok(items(self.get(kind, None).await?))
    }
}

pub(crate) fn items(mut list: JsonValue) -> Vec<JsonValue> {
    match list.get_mut("items").map(JsonValue::take) {
        Some(JsonValue::Array(items)) => items,
        _ => Vec::new(),
    }
}

/// `(apiVersion, kind, name, namespace)` of a document
pub(crate) fn identity(document: &JsonValue) -> Option<(&str, &str, &str, Option<&str>)> {
    let api_version = document.get("apiVersion")?.as_str()?;
    let kind = document.get("kind")?.as_str()?;
    let metadata = document.get("metadata")?;
    let name = metadata.get("name")?.as_str()?;
    let namespace = metadata.get("namespace").and_then(JsonValue::as_str);
    Some((api_version, kind, name, namespace))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_api_versions() {
        assert_eq!(ResourceKind::POD.api_version(), "v1");
        assert_eq!(ResourceKind::STATEFUL_SET.api_version(), "apps/v1");
        assert_eq!(
            ResourceKind::cluster(Engine::XtraDb).api_version(),
            "pxc.percona.com/v1"
        );
        assert_eq!(
            ResourceKind::cluster(Engine::Psmdb).to_string(),
            "perconaservermongodbs.psmdb.percona.com"
        );
    }

    #[test]
    fn test_identity() {
        let doc = json!({
            "apiVersion": "pxc.percona.com/v1-8-0",
            "kind": "PerconaXtraDBCluster",
            "metadata": {"name": "orders"}
        });
        assert_eq!(
            identity(&doc),
            Some(("pxc.percona.com/v1-8-0", "PerconaXtraDBCluster", "orders", None))
        );
        assert_eq!(identity(&json!({"kind": "Pod"})), None);
    }

    #[tokio::test]
    async fn test_list_unwraps_items() {
        let port = MockAccessPort::with_objects(vec![
            json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "a"}}),
            json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": "b"}}),
            json!({"apiVersion": "v1", "kind": "Secret", "metadata": {"name": "c"}}),
        ]);
        let pods = port.list(&ResourceKind::POD).await.unwrap();
        assert_eq!(pods.len(), 2);
        assert!(port.list(&ResourceKind::NODE).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_all_namespaces() {
        let pod = |name: &str, namespace: &str| {
            json!({"apiVersion": "v1", "kind": "Pod", "metadata": {"name": name, "namespace": namespace}})
        };
        let port = MockAccessPort::with_objects(vec![
            pod("db-0", "default"),
            pod("coredns", "kube-system"),
            json!({"apiVersion": "v1", "kind": "Node", "metadata": {"name": "worker-1"}}),
        ]);
        assert_eq!(port.list(&ResourceKind::POD).await.unwrap().len(), 1);
        assert_eq!(port.list_all_namespaces(&ResourceKind::POD).await.unwrap().len(), 2);
        assert_eq!(port.list_all_namespaces(&ResourceKind::NODE).await.unwrap().len(), 1);
    }
}
