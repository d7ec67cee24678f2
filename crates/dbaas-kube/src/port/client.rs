//! Access port backed by the Kubernetes API

use async_trait::async_trait;
use kube::{
    Client,
    api::{Api, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PropagationPolicy},
    core::{GroupVersionKind, TypeMeta},
    discovery::{ApiResource, Discovery, Scope},
};
use serde_json::Value as JsonValue;
use std::str::FromStr;
use tokio::sync::OnceCell;

use super::{AccessPort, PatchType, ResourceKind, identity};
use crate::config::ControllerConfig;
use crate::error::{KubeError, Result};
use crate::session::Session;

/// Access port talking to the API server through kube-rs
pub struct KubeAccessPort {
    client: Client,
    namespace: String,
    field_manager: String,
    /// Resolved lazily; only whole documents of arbitrary kinds need it
    discovery: OnceCell<Discovery>,
}

impl KubeAccessPort {
    pub fn new(client: Client, config: &ControllerConfig) -> Self {
        Self {
            client,
            namespace: config.namespace.clone(),
            field_manager: config.field_manager.clone(),
            discovery: OnceCell::new(),
        }
    }

    /// Use the default kubeconfig / in-cluster credentials
    pub async fn try_default(config: &ControllerConfig) -> Result<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client, config))
    }

    /// Talk to the platform through an open bridge session
    pub fn for_session(session: &Session, config: &ControllerConfig) -> Result<Self> {
        let mut kube_config = kube::Config::new(parse_url(&session.url())?);
        kube_config.default_namespace = config.namespace.clone();
        let client = Client::try_from(kube_config)?;
        Ok(Self::new(client, config))
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api(&self, kind: &ResourceKind) -> Api<DynamicObject> {
        if kind.namespaced {
            Api::namespaced_with(self.client.clone(), &self.namespace, &api_resource(kind))
        } else {
            self.api_all(kind)
        }
    }

    /// Api spanning every namespace
    fn api_all(&self, kind: &ResourceKind) -> Api<DynamicObject> {
        Api::all_with(self.client.clone(), &api_resource(kind))
    }

    async fn list_items(
        &self,
        api: Api<DynamicObject>,
        kind: &ResourceKind,
    ) -> Result<Vec<JsonValue>> {
        let list = api
            .list(&ListParams::default())
            .await
            .map_err(|e| failure("list", kind.kind, "", e))?;
        // List items come back without apiVersion and kind
        list.items
            .into_iter()
            .map(|mut item| {
                item.types.get_or_insert_with(|| TypeMeta {
                    api_version: kind.api_version(),
                    kind: kind.kind.to_string(),
                });
                serde_json::to_value(item).map_err(KubeError::from)
            })
            .collect()
    }

    async fn discovery(&self) -> Result<&Discovery> {
        self.discovery
            .get_or_try_init(|| async {
                Discovery::new(self.client.clone())
                    .run()
                    .await
                    .map_err(KubeError::Api)
            })
            .await
    }

    /// Api for the kind a whole document describes
    async fn api_for_document(
        &self,
        document: &JsonValue,
    ) -> Result<(Api<DynamicObject>, String, String)> {
        let (api_version, kind, name, namespace) = identity(document).ok_or_else(|| {
            KubeError::InvalidConfig(
                "document is missing apiVersion, kind or metadata.name".to_string(),
            )
        })?;

        let gvk = gvk_from_api_version(api_version, kind);
        let (resource, capabilities) = self
            .discovery()
            .await?
            .resolve_gvk(&gvk)
            .ok_or_else(|| KubeError::not_found("resource type", format!("{}/{}", api_version, kind)))?;

        let api = if capabilities.scope == Scope::Namespaced {
            let namespace = namespace.unwrap_or(&self.namespace);
            Api::namespaced_with(self.client.clone(), namespace, &resource)
        } else {
            Api::all_with(self.client.clone(), &resource)
        };
        Ok((api, kind.to_string(), name.to_string()))
    }
}

#[async_trait]
impl AccessPort for KubeAccessPort {
    async fn get(&self, kind: &ResourceKind, name: Option<&str>) -> Result<JsonValue> {
        let api = self.api(kind);
        match name {
            Some(name) => {
                let object = api
                    .get(name)
                    .await
                    .map_err(|e| failure("get", kind.kind, name, e))?;
                Ok(serde_json::to_value(object)?)
            }
            None => {
                let items = self.list_items(api, kind).await?;
                Ok(serde_json::json!({ "items": items }))
            }
        }
    }

    async fn list_all_namespaces(&self, kind: &ResourceKind) -> Result<Vec<JsonValue>> {
        self.list_items(self.api_all(kind), kind).await
    }

    async fn apply(&self, document: &JsonValue) -> Result<()> {
        let (api, kind, name) = self.api_for_document(document).await?;
        let params = PatchParams::apply(&self.field_manager).force();
        api.patch(&name, &params, &Patch::Apply(document))
            .await
            .map_err(|e| failure("apply", &kind, &name, e))?;
        tracing::info!(%kind, %name, "Applied");
        Ok(())
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        name: &str,
        patch_type: PatchType,
        patch: &JsonValue,
    ) -> Result<()> {
        let params = PatchParams {
            field_manager: Some(self.field_manager.clone()),
            ..Default::default()
        };
        let patch = match patch_type {
            PatchType::Merge => Patch::Merge(patch),
            PatchType::Strategic => Patch::Strategic(patch),
        };
        self.api(kind)
            .patch(name, &params, &patch)
            .await
            .map_err(|e| failure("patch", kind.kind, name, e))?;
        tracing::info!(kind = kind.kind, %name, ?patch_type, "Patched");
        Ok(())
    }

    async fn delete(&self, document: &JsonValue) -> Result<()> {
        let (api, kind, name) = self.api_for_document(document).await?;
        let params = DeleteParams {
            propagation_policy: Some(PropagationPolicy::Background),
            ..Default::default()
        };
        api.delete(&name, &params)
            .await
            .map_err(|e| failure("delete", &kind, &name, e))?;
        tracing::info!(%kind, %name, "Deleted");
        Ok(())
    }
}

fn api_resource(kind: &ResourceKind) -> ApiResource {
    ApiResource {
        group: kind.group.to_string(),
        version: kind.version.to_string(),
        api_version: kind.api_version(),
        kind: kind.kind.to_string(),
        plural: kind.plural.to_string(),
    }
}

/// Wrap an API failure with the attempted command
fn failure(verb: &str, kind: &str, name: &str, err: kube::Error) -> KubeError {
    let command = if name.is_empty() {
        format!("{} {}", verb, kind)
    } else {
        format!("{} {}/{}", verb, kind, name)
    };
    match err {
        kube::Error::Api(resp) if resp.code == 404 => KubeError::not_found(kind, name),
        kube::Error::Api(resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
            KubeError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
        }
        err => KubeError::classify_diagnostic(&command, kind, name, &err.to_string()),
    }
}

fn gvk_from_api_version(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = api_version.rsplit_once('/').unwrap_or(("", api_version));
    GroupVersionKind::gvk(group, version, kind)
}

fn parse_url<T>(raw: &str) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e: T::Err| KubeError::InvalidConfig(format!("invalid URL '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gvk_from_api_version() {
        let gvk = gvk_from_api_version("pxc.percona.com/v1-8-0", "PerconaXtraDBCluster");
        assert_eq!(gvk.group, "pxc.percona.com");
        assert_eq!(gvk.version, "v1-8-0");
        assert_eq!(gvk.kind, "PerconaXtraDBCluster");

        let gvk = gvk_from_api_version("v1", "Secret");
        assert_eq!(gvk.group, "");
        assert_eq!(gvk.version, "v1");
    }

    #[test]
    fn test_parse_url() {
        let port: u16 = parse_url("8001").unwrap();
        assert_eq!(port, 8001);
        assert!(matches!(
            parse_url::<u16>("http://"),
            Err(KubeError::InvalidConfig(_))
        ));
    }
}
