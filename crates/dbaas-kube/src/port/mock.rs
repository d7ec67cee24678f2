//! Mock access port for testing
//!
//! Objects live in memory keyed by kind, namespace and name, useful for unit
//! tests without requiring a Kubernetes cluster. Documents without a namespace
//! land in the port's own namespace; nodes are cluster-scoped.

use async_trait::async_trait;
use serde_json::{Map, Value as JsonValue, json};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::{AccessPort, PatchType, ResourceKind, identity};
use crate::config::DEFAULT_NAMESPACE;
use crate::error::{KubeError, Result};

/// (kind, namespace, name); cluster-scoped objects have an empty namespace
type Key = (String, String, String);
type Store = BTreeMap<Key, JsonValue>;

/// In-memory access port for testing
#[derive(Clone, Default)]
pub struct MockAccessPort {
    store: Arc<RwLock<Store>>,
    /// Namespace of namespaced calls; `default` when unset
    namespace: Option<String>,
    /// Track operation counts for assertions
    operations: Arc<RwLock<OperationCounts>>,
    /// Kinds whose every operation fails, with the diagnostic to report
    failures: Arc<RwLock<HashMap<String, String>>>,
}

/// Counts of operations performed for testing assertions
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OperationCounts {
    pub gets: usize,
    pub lists: usize,
    pub applies: usize,
    pub patches: usize,
    pub deletes: usize,
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

impl MockAccessPort {
    /// Create a new empty mock port
    pub fn new() -> Self {
        Self::default()
    }

    /// Create with pre-populated objects
    pub fn with_objects(objects: Vec<JsonValue>) -> Self {
        let port = Self::new();
        for object in objects {
            port.insert(object);
        }
        port
    }

    /// Serve namespaced calls from `namespace`
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn namespace(&self) -> &str {
        self.namespace.as_deref().unwrap_or(DEFAULT_NAMESPACE)
    }

    /// Store an object as-is; documents without kind or name are ignored
    pub fn insert(&self, object: JsonValue) {
        if let Some(key) = self.key_of(&object) {
            write(&self.store).insert(key, object);
        }
    }

    /// Current copy of a stored object in the port's namespace
    pub fn object(&self, kind: &str, name: &str) -> Option<JsonValue> {
        read(&self.store).get(&self.key(kind, None, name)).cloned()
    }

    fn key(&self, kind: &str, namespace: Option<&str>, name: &str) -> Key {
        let namespace = if cluster_scoped(kind) {
            ""
        } else {
            namespace.unwrap_or(self.namespace())
        };
        (kind.to_string(), namespace.to_string(), name.to_string())
    }

    fn key_of(&self, document: &JsonValue) -> Option<Key> {
        let (_, kind, name, namespace) = identity(document)?;
        Some(self.key(kind, namespace, name))
    }

    fn items(&self, kind: &ResourceKind, namespace: Option<&str>) -> Vec<JsonValue> {
        read(&self.store)
            .iter()
            .filter(|((k, ns, _), _)| k == kind.kind && namespace.is_none_or(|n| n == ns.as_str()))
            .map(|(_, object)| object.clone())
            .collect()
    }

    /// Make every operation on `kind` fail with `diagnostic`
    pub fn fail_on(&self, kind: &str, diagnostic: &str) {
        write(&self.failures).insert(kind.to_string(), diagnostic.to_string());
    }

    /// Get operation counts for assertions
    pub fn operation_counts(&self) -> OperationCounts {
        read(&self.operations).clone()
    }

    /// Reset operation counts
    pub fn reset_counts(&self) {
        *write(&self.operations) = OperationCounts::default();
    }

    fn check_failure(&self, verb: &str, kind: &str, name: &str) -> Result<()> {
        match read(&self.failures).get(kind) {
            Some(diagnostic) => Err(KubeError::classify_diagnostic(
                &format!("{} {}/{}", verb, kind, name),
                kind,
                name,
                diagnostic,
            )),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AccessPort for MockAccessPort {
    async fn get(&self, kind: &ResourceKind, name: Option<&str>) -> Result<JsonValue> {
        match name {
            Some(name) => {
                write(&self.operations).gets += 1;
                self.check_failure("get", kind.kind, name)?;
                self.object(kind.kind, name)
                    .ok_or_else(|| KubeError::not_found(kind.kind, name))
            }
            None => {
                write(&self.operations).lists += 1;
                self.check_failure("list", kind.kind, "")?;
                let namespace = kind.namespaced.then(|| self.namespace());
                Ok(json!({ "items": self.items(kind, namespace) }))
            }
        }
    }

    async fn list_all_namespaces(&self, kind: &ResourceKind) -> Result<Vec<JsonValue>> {
        write(&self.operations).lists += 1;
        self.check_failure("list", kind.kind, "")?;
        Ok(self.items(kind, None))
    }

    async fn apply(&self, document: &JsonValue) -> Result<()> {
        write(&self.operations).applies += 1;
        let key = self.key_of(document).ok_or_else(|| {
            KubeError::InvalidConfig("document is missing apiVersion, kind or metadata.name".into())
        })?;
        self.check_failure("apply", &key.0, &key.2)?;
        write(&self.store).insert(key, document.clone());
        Ok(())
    }

    async fn patch(
        &self,
        kind: &ResourceKind,
        name: &str,
        _patch_type: PatchType,
        patch: &JsonValue,
    ) -> Result<()> {
        write(&self.operations).patches += 1;
        self.check_failure("patch", kind.kind, name)?;
        let mut store = write(&self.store);
        let object = store
            .get_mut(&self.key(kind.kind, None, name))
            .ok_or_else(|| KubeError::not_found(kind.kind, name))?;
        merge_patch(object, patch);
        Ok(())
    }

    async fn delete(&self, document: &JsonValue) -> Result<()> {
        write(&self.operations).deletes += 1;
        let key = self.key_of(document).ok_or_else(|| {
            KubeError::InvalidConfig("document is missing apiVersion, kind or metadata.name".into())
        })?;
        self.check_failure("delete", &key.0, &key.2)?;
        match write(&self.store).remove(&key) {
            Some(_) => Ok(()),
            None => Err(KubeError::not_found(key.0, key.2)),
        }
    }
}

fn cluster_scoped(kind: &str) -> bool {
    kind == ResourceKind::NODE.kind
}

/// RFC 7386 merge: `null` removes, objects merge, everything else replaces
fn merge_patch(target: &mut JsonValue, patch: &JsonValue) {
    let JsonValue::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = JsonValue::Object(Map::new());
    }
    if let JsonValue::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(JsonValue::Null), value);
            }
        }
    }
}
