//! Cluster lifecycle operations
//!
//! The controller owns no state: every call re-reads the stored custom
//! resource and the live pod/node objects through its [`AccessPort`].
//! Convergence is observed by polling [`ClusterController::status`].
//!
//! Concurrent create/update calls against the same cluster name are not
//! serialized here.

use base64::Engine as _;
use chrono::Utc;
use dbaas_core::resources::{allocatable, consumed, consumed_storage, is_worker_node};
use dbaas_core::{
    AnyCluster, ClusterParams, ClusterState, ClusterSummary, CrDocument, DatabaseCluster, Engine,
    ResourceReport, build, generation_label, parse_schema_version, resolve,
};
use dbaas_versions::{OperatorVersions, VersionServiceClient, database_component};
use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue, json};
use std::borrow::Cow;
use std::collections::HashSet;

use crate::config::ControllerConfig;
use crate::error::{KubeError, Result};
use crate::port::{AccessPort, PatchType, ResourceKind};

/// Label carrying the owning cluster's name on operator-managed objects
pub const INSTANCE_LABEL: &str = "app.kubernetes.io/instance";
/// Label carrying the pod role (`pxc`, `haproxy`, `mongod`, ...)
pub const COMPONENT_LABEL: &str = "app.kubernetes.io/component";
/// Pod template annotation that triggers a rolling restart
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

const XTRADB_PORT: u16 = 3306;
const PSMDB_PORT: u16 = 27017;
const XTRADB_ROOT_USER: &str = "root";
const PSMDB_USER_KEY: &str = "MONGODB_USER_ADMIN_USER";
const PSMDB_PASSWORD_KEY: &str = "MONGODB_USER_ADMIN_PASSWORD";

/// Connection details of a ready cluster
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
}

/// Create, update, observe and delete database clusters
pub struct ClusterController<P> {
    port: P,
    config: ControllerConfig,
}

impl<P: AccessPort> ClusterController<P> {
    pub fn new(port: P, config: ControllerConfig) -> Self {
        Self { port, config }
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn config(&self) -> &ControllerConfig {
        &self.config
    }

    /// Version of the installed operator, read from its Deployment image tag
    pub async fn operator_version(&self, engine: Engine) -> Result<Version> {
        let name = self.config.operator_deployment(engine);
        let deployment = self
            .port
            .get(&ResourceKind::DEPLOYMENT, Some(name))
            .await?;

        let tag = deployment
            .pointer("/spec/template/spec/containers")
            .and_then(JsonValue::as_array)
            .into_iter()
            .flatten()
            .filter_map(|c| c.get("image").and_then(JsonValue::as_str))
            .find_map(image_tag)
            .ok_or_else(|| {
                KubeError::InvalidConfig(format!(
                    "operator deployment '{}' has no tagged image",
                    name
                ))
            })?;

        Ok(parse_schema_version(engine, tag)?)
    }

    /// Build and apply the document of a new cluster
    pub async fn create(&self, params: &ClusterParams) -> Result<CrDocument> {
        params.validate()?;
        let engine = params.engine();
        let kind = ResourceKind::cluster(engine);

        match self.port.get(&kind, Some(params.name())).await {
            Ok(_) => {
                return Err(KubeError::AlreadyExists {
                    kind: kind.kind.to_string(),
                    name: params.name().to_string(),
                });
            }
            Err(e) if e.is_not_found() => {}
            Err(e) => return Err(e),
        }

        let operator = self.operator_version(engine).await?;
        let params = self.with_recommended_image(params, &operator).await?;
        let schema = operator.to_string();
        let document = build(&params, &schema, None)?;
        self.port.apply(document.as_value()).await?;

        tracing::info!(
            %engine,
            name = params.name(),
            operator = %schema,
            generation = generation_label(engine, &schema)?,
            "Cluster created"
        );
        Ok(document)
    }

    /// Rebuild the stored document with `params` on top and re-apply it
    ///
    /// Fields `params` leaves unset keep their stored values.
    pub async fn update(&self, params: &ClusterParams) -> Result<CrDocument> {
        params.validate()?;
        let engine = params.engine();
        let existing = self
            .port
            .get(&ResourceKind::cluster(engine), Some(params.name()))
            .await?;

        let operator = self.operator_version(engine).await?;
        let document = build(params, &operator.to_string(), Some(&existing))?;
        self.port.apply(document.as_value()).await?;

        tracing::info!(%engine, name = params.name(), operator = %operator, "Cluster updated");
        Ok(document)
    }

    pub async fn delete(&self, engine: Engine, name: &str) -> Result<()> {
        let existing = self
            .port
            .get(&ResourceKind::cluster(engine), Some(name))
            .await?;
        self.port.delete(&existing).await?;
        tracing::info!(%engine, %name, "Cluster deleted");
        Ok(())
    }

    /// The stored cluster document
    pub async fn get(&self, engine: Engine, name: &str) -> Result<AnyCluster> {
        let value = self
            .port
            .get(&ResourceKind::cluster(engine), Some(name))
            .await?;
        Ok(AnyCluster::from_value(engine, value)?)
    }

    pub async fn status(&self, engine: Engine, name: &str) -> Result<ClusterSummary> {
        let cluster = self.get(engine, name).await?;
        let pods = self.typed::<Pod>(&ResourceKind::POD).await;
        Ok(summarize(&cluster, &pods))
    }

    /// Summaries of the stored clusters, optionally narrowed by engine and name
    pub async fn list(
        &self,
        engine: Option<Engine>,
        name: Option<&str>,
    ) -> Result<Vec<ClusterSummary>> {
        let engines = match engine {
            Some(engine) => vec![engine],
            None => vec![Engine::XtraDb, Engine::Psmdb],
        };
        let pods = self.typed::<Pod>(&ResourceKind::POD).await;

        let mut summaries = Vec::new();
        for engine in engines {
            let items = match self.port.list(&ResourceKind::cluster(engine)).await {
                Ok(items) => items,
                Err(e) if e.is_not_found() => {
                    tracing::debug!(%engine, "Cluster kind not served, skipping");
                    continue;
                }
                Err(e) => return Err(e),
            };
            for item in items {
                let cluster = AnyCluster::from_value(engine, item)?;
                if name.is_some_and(|n| n != cluster.name()) {
                    continue;
                }
                summaries.push(summarize(&cluster, &pods));
            }
        }
        Ok(summaries)
    }

    /// Rolling-restart every StatefulSet of a cluster, returning how many were patched
    pub async fn restart(&self, engine: Engine, name: &str) -> Result<usize> {
        self.get(engine, name).await?;

        let sets: Vec<String> = self
            .port
            .list(&ResourceKind::STATEFUL_SET)
            .await?
            .iter()
            .filter(|set| label(set, INSTANCE_LABEL) == Some(name))
            .filter_map(|set| set.pointer("/metadata/name")?.as_str().map(str::to_string))
            .collect();
        if sets.is_empty() {
            return Err(KubeError::not_found("StatefulSet", name));
        }

        let mut annotations = Map::new();
        annotations.insert(
            RESTARTED_AT_ANNOTATION.to_string(),
            JsonValue::String(Utc::now().to_rfc3339()),
        );
        let patch = json!({"spec": {"template": {"metadata": {"annotations": annotations}}}});

        for set in &sets {
            self.port
                .patch(&ResourceKind::STATEFUL_SET, set, PatchType::Strategic, &patch)
                .await?;
        }
        tracing::info!(%engine, %name, statefulsets = sets.len(), "Cluster restarted");
        Ok(sets.len())
    }

    /// Host, port and admin login of a ready cluster
    pub async fn credentials(&self, engine: Engine, name: &str) -> Result<Credentials> {
        let cluster = self.get(engine, name).await?;
        let pods = self.typed::<Pod>(&ResourceKind::POD).await;
        let state = summarize(&cluster, &pods).state;
        let not_ready = || KubeError::NotReady {
            name: name.to_string(),
            state,
        };
        if state != ClusterState::Ready {
            return Err(not_ready());
        }
        let host = cluster.host().ok_or_else(not_ready)?.to_string();

        let secret_name = users_secret(&cluster)
            .ok_or_else(|| KubeError::not_found("users secret of cluster", name))?;
        let secret = self
            .port
            .get(&ResourceKind::SECRET, Some(secret_name))
            .await?;

        let (port, username, password) = match engine {
            Engine::XtraDb => (
                XTRADB_PORT,
                XTRADB_ROOT_USER.to_string(),
                secret_value(&secret, secret_name, XTRADB_ROOT_USER)?,
            ),
            Engine::Psmdb => (
                PSMDB_PORT,
                secret_value(&secret, secret_name, PSMDB_USER_KEY)?,
                secret_value(&secret, secret_name, PSMDB_PASSWORD_KEY)?,
            ),
        };
        Ok(Credentials {
            host,
            port,
            username,
            password,
        })
    }

    /// Allocatable, consumed and available CPU, memory and storage
    ///
    /// Capacity covers worker nodes only. Consumption counts pods and claims
    /// of every namespace, except pods bound to a non-worker node.
    pub async fn resources(&self) -> Result<ResourceReport> {
        let (nodes, pods, claims) = futures::try_join!(
            self.typed::<Node>(&ResourceKind::NODE),
            self.typed_all_namespaces::<Pod>(&ResourceKind::POD),
            self.typed_all_namespaces::<PersistentVolumeClaim>(
                &ResourceKind::PERSISTENT_VOLUME_CLAIM
            ),
        )?;

        let (workers, others): (Vec<Node>, Vec<Node>) =
            nodes.into_iter().partition(is_worker_node);
        let excluded: HashSet<&str> = others
            .iter()
            .filter_map(|n| n.metadata.name.as_deref())
            .collect();
        let pods: Vec<Pod> = pods
            .into_iter()
            .filter(|pod| {
                let node = pod.spec.as_ref().and_then(|s| s.node_name.as_deref());
                !node.is_some_and(|n| excluded.contains(n))
            })
            .collect();

        let allocatable = allocatable(&workers)?;
        let mut consumed = consumed(&pods)?;
        consumed.disk_bytes = consumed_storage(&claims)?;
        Ok(ResourceReport::new(allocatable, consumed))
    }

    /// Newest operator versions compatible with a platform release
    pub async fn operator_versions(
        &self,
        platform_version: &str,
    ) -> Result<Option<OperatorVersions>> {
        let client = self.version_client(None)?.ok_or_else(|| {
            KubeError::InvalidConfig("no version service URL configured".to_string())
        })?;
        Ok(client.latest_operator_versions(platform_version).await?)
    }

    async fn typed<T: DeserializeOwned>(&self, kind: &ResourceKind) -> Result<Vec<T>> {
        decode(self.port.list(kind).await?)
    }

    async fn typed_all_namespaces<T: DeserializeOwned>(
        &self,
        kind: &ResourceKind,
    ) -> Result<Vec<T>> {
        decode(self.port.list_all_namespaces(kind).await?)
    }

    fn version_client(&self, url: Option<&str>) -> Result<Option<VersionServiceClient>> {
        Ok(url
            .or(self.config.version_service_url.as_deref())
            .map(VersionServiceClient::new)
            .transpose()?)
    }

    /// Fill in the recommended database image when none was requested
    async fn with_recommended_image<'a>(
        &self,
        params: &'a ClusterParams,
        operator: &Version,
    ) -> Result<Cow<'a, ClusterParams>> {
        let (image, url) = match params {
            ClusterParams::XtraDb(p) => (&p.pxc.image, p.version_service_url.as_deref()),
            ClusterParams::Psmdb(p) => (&p.image, p.version_service_url.as_deref()),
        };
        if image.is_some() {
            return Ok(Cow::Borrowed(params));
        }
        let Some(client) = self.version_client(url)? else {
            return Ok(Cow::Borrowed(params));
        };

        let recommended = client
            .recommended_database_image(params.engine(), &operator.to_string())
            .await?;
        tracing::debug!(
            engine = %params.engine(),
            image = %recommended.image_path,
            version = %recommended.version,
            "Using recommended image"
        );

        let mut params = params.clone();
        match &mut params {
            ClusterParams::XtraDb(p) => p.pxc.image = Some(recommended.image_path),
            ClusterParams::Psmdb(p) => p.image = Some(recommended.image_path),
        }
        Ok(Cow::Owned(params))
    }
}

fn decode<T: DeserializeOwned>(items: Vec<JsonValue>) -> Result<Vec<T>> {
    items
        .into_iter()
        .map(|item| serde_json::from_value(item).map_err(KubeError::from))
        .collect()
}

fn summarize(cluster: &AnyCluster, pods: &Result<Vec<Pod>>) -> ClusterSummary {
    let state = resolve(Some(cluster), |c: &AnyCluster| match pods {
        Ok(pods) => Ok(images_match(c, pods)),
        Err(e) => Err(e.to_string()),
    });
    ClusterSummary::new(cluster, state)
}

/// Whether every database pod of the cluster runs the declared image
fn images_match(cluster: &AnyCluster, pods: &[Pod]) -> bool {
    let Some(declared) = cluster.image() else {
        return true;
    };
    let component = database_component(cluster.engine());
    pods.iter()
        .filter(|pod| {
            let labels = pod.metadata.labels.as_ref();
            let has = |key: &str, value: &str| {
                labels.and_then(|l| l.get(key)).map(String::as_str) == Some(value)
            };
            has(INSTANCE_LABEL, cluster.name()) && has(COMPONENT_LABEL, component)
        })
        .all(|pod| {
            pod.spec.as_ref().is_some_and(|spec| {
                spec.containers
                    .iter()
                    .any(|c| c.image.as_deref() == Some(declared))
            })
        })
}

fn users_secret(cluster: &AnyCluster) -> Option<&str> {
    match cluster {
        AnyCluster::XtraDb(c) => c.spec.as_ref()?.secrets_name.as_deref(),
        AnyCluster::Psmdb(c) => c.users_secret(),
    }
}

fn secret_value(secret: &JsonValue, secret_name: &str, key: &str) -> Result<String> {
    let encoded = secret
        .get("data")
        .and_then(|data| data.get(key))
        .and_then(JsonValue::as_str)
        .ok_or_else(|| KubeError::not_found("secret key", format!("{}/{}", secret_name, key)))?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| {
            KubeError::Serialization(format!("{}/{} is not base64: {}", secret_name, key, e))
        })?;
    String::from_utf8(decoded).map_err(|e| {
        KubeError::Serialization(format!("{}/{} is not UTF-8: {}", secret_name, key, e))
    })
}

fn label<'a>(object: &'a JsonValue, key: &str) -> Option<&'a str> {
    object.get("metadata")?.get("labels")?.get(key)?.as_str()
}

/// Tag of an image reference (`repo/name:tag` or `repo/name:tag@sha256:...`)
fn image_tag(image: &str) -> Option<&str> {
    let image = image.split_once('@').map_or(image, |(name, _)| name);
    let (name, tag) = image.rsplit_once(':')?;
    // A colon before the last slash belongs to a registry port
    (!tag.contains('/') && !name.is_empty()).then_some(tag)
}
