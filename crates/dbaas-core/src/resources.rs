//! Resource accounting over node and pod snapshots
//!
//! All figures are canonical integers: CPU in millicores, memory and storage
//! in bytes. Quantity strings are parsed with [`crate::quantity`] before any
//! arithmetic, and a malformed quantity is an error rather than a zero.

use k8s_openapi::api::core::v1::{Node, PersistentVolumeClaim, Pod};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{CoreError, Result};
use crate::quantity::{parse_bytes, parse_cpu_millis};

const CPU: &str = "cpu";
const MEMORY: &str = "memory";
const EPHEMERAL_STORAGE: &str = "ephemeral-storage";
const STORAGE: &str = "storage";

/// Node role labels that mark a node as part of the control plane
const CONTROL_PLANE_LABELS: &[&str] = &[
    "node-role.kubernetes.io/control-plane",
    "node-role.kubernetes.io/master",
];

/// CPU, memory and storage totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceAmounts {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
}

impl ResourceAmounts {
    /// Component-wise difference, clamped at zero
    pub fn saturating_sub(&self, other: &ResourceAmounts) -> ResourceAmounts {
        ResourceAmounts {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            disk_bytes: self.disk_bytes.saturating_sub(other.disk_bytes),
        }
    }

    fn checked_add(&self, other: &ResourceAmounts) -> Result<ResourceAmounts> {
        let overflow = || CoreError::invalid_quantity("total", "sum overflows 64 bits");
        Ok(ResourceAmounts {
            cpu_millis: self.cpu_millis.checked_add(other.cpu_millis).ok_or_else(overflow)?,
            memory_bytes: self
                .memory_bytes
                .checked_add(other.memory_bytes)
                .ok_or_else(overflow)?,
            disk_bytes: self.disk_bytes.checked_add(other.disk_bytes).ok_or_else(overflow)?,
        })
    }
}

/// Allocatable, consumed and available resources of a cluster
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceReport {
    pub allocatable: ResourceAmounts,
    pub consumed: ResourceAmounts,
    pub available: ResourceAmounts,
}

impl ResourceReport {
    pub fn new(allocatable: ResourceAmounts, consumed: ResourceAmounts) -> Self {
        Self {
            allocatable,
            consumed,
            available: available(&allocatable, &consumed),
        }
    }
}

/// Pod lifecycle phase
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    fn parse(phase: Option<&str>) -> Self {
        match phase {
            Some("Pending") => PodPhase::Pending,
            Some("Running") => PodPhase::Running,
            Some("Succeeded") => PodPhase::Succeeded,
            Some("Failed") => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    /// Terminal pods hold no resources on their node
    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Requests of a single pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodFootprint {
    pub name: String,
    pub phase: PodPhase,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    /// Volumes backed by a persistent claim
    pub claim_volumes: usize,
    /// Any other volume (config maps, secrets, empty dirs, ...)
    pub other_volumes: usize,
}

impl PodFootprint {
    pub fn from_pod(pod: &Pod) -> Result<Self> {
        let phase = PodPhase::parse(pod.status.as_ref().and_then(|s| s.phase.as_deref()));

        let mut cpu_millis = 0u64;
        let mut memory_bytes = 0u64;
        let mut claim_volumes = 0;
        let mut other_volumes = 0;

        if let Some(spec) = &pod.spec {
            for container in &spec.containers {
                let Some(requests) = container.resources.as_ref().and_then(|r| r.requests.as_ref())
                else {
                    continue;
                };
                cpu_millis = add(cpu_millis, quantity(requests, CPU, parse_cpu_millis)?)?;
                memory_bytes = add(memory_bytes, quantity(requests, MEMORY, parse_bytes)?)?;
            }
            for volume in spec.volumes.iter().flatten() {
                if volume.persistent_volume_claim.is_some() {
                    claim_volumes += 1;
                } else {
                    other_volumes += 1;
                }
            }
        }

        Ok(Self {
            name: pod.metadata.name.clone().unwrap_or_default(),
            phase,
            cpu_millis,
            memory_bytes,
            claim_volumes,
            other_volumes,
        })
    }
}

/// Whether a node runs workloads: not a control-plane node and schedulable
pub fn is_worker_node(node: &Node) -> bool {
    let control_plane = node
        .metadata
        .labels
        .as_ref()
        .is_some_and(|labels| CONTROL_PLANE_LABELS.iter().any(|l| labels.contains_key(*l)));
    let unschedulable = node
        .spec
        .as_ref()
        .and_then(|s| s.unschedulable)
        .unwrap_or(false);
    !control_plane && !unschedulable
}

/// Sum of the allocatable figures of the given nodes
///
/// Callers filter out non-worker nodes first (see [`is_worker_node`]).
pub fn allocatable(nodes: &[Node]) -> Result<ResourceAmounts> {
    nodes.iter().try_fold(ResourceAmounts::default(), |total, node| {
        let Some(allocatable) = node.status.as_ref().and_then(|s| s.allocatable.as_ref()) else {
            return Ok(total);
        };
        let node_amounts = ResourceAmounts {
            cpu_millis: quantity(allocatable, CPU, parse_cpu_millis)?,
            memory_bytes: quantity(allocatable, MEMORY, parse_bytes)?,
            disk_bytes: quantity(allocatable, EPHEMERAL_STORAGE, parse_bytes)?,
        };
        total.checked_add(&node_amounts)
    })
}

/// CPU and memory requested by non-terminal pods
pub fn consumed(pods: &[Pod]) -> Result<ResourceAmounts> {
    pods.iter().try_fold(ResourceAmounts::default(), |total, pod| {
        let footprint = PodFootprint::from_pod(pod)?;
        if footprint.phase.is_terminal() {
            return Ok(total);
        }
        total.checked_add(&ResourceAmounts {
            cpu_millis: footprint.cpu_millis,
            memory_bytes: footprint.memory_bytes,
            disk_bytes: 0,
        })
    })
}

/// Capacity of bound persistent volume claims
pub fn consumed_storage(claims: &[PersistentVolumeClaim]) -> Result<u64> {
    claims
        .iter()
        .filter_map(|claim| claim.status.as_ref())
        .filter(|status| status.phase.as_deref() == Some("Bound"))
        .filter_map(|status| status.capacity.as_ref())
        .try_fold(0u64, |total, capacity| {
            add(total, quantity(capacity, STORAGE, parse_bytes)?)
        })
}

/// `allocatable - consumed`, clamped at zero
pub fn available(allocatable: &ResourceAmounts, consumed: &ResourceAmounts) -> ResourceAmounts {
    allocatable.saturating_sub(consumed)
}

fn quantity(
    map: &BTreeMap<String, Quantity>,
    key: &str,
    parse: fn(&str) -> Result<u64>,
) -> Result<u64> {
    map.get(key).map_or(Ok(0), |q| parse(&q.0))
}

fn add(total: u64, value: u64) -> Result<u64> {
    total
        .checked_add(value)
        .ok_or_else(|| CoreError::invalid_quantity("total", "sum overflows 64 bits"))
}
