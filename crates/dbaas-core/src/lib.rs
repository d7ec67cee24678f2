//! DBaaS Core - Domain logic of the database cluster controller
//!
//! This crate is synchronous and performs no I/O:
//! - `params`: create/update parameters for both engines
//! - `crd`: typed custom resources of the MySQL and MongoDB operators
//! - `builder`: version-aware custom resource construction
//! - `state`: collapses a stored cluster into a `ClusterState`
//! - `resources`: node capacity and pod consumption accounting
//! - `quantity`: parsing of suffixed CPU/memory quantities

pub mod builder;
pub mod cluster;
pub mod crd;
pub mod error;
pub mod params;
pub mod quantity;
pub mod resources;
pub mod state;

pub use builder::{build, generation_label, parse_schema_version};
pub use cluster::{AnyCluster, AppState, ClusterState, ClusterSummary, DatabaseCluster};
pub use crd::CrDocument;
pub use error::{CoreError, Result};
pub use params::{
    BackupParams, BackupSchedule, ClusterParams, ComponentParams, ComputeResources, Engine,
    ExposeType, MonitoringParams, ProxyKind, ProxyParams, PsmdbParams, StorageTarget,
    XtraDbParams,
};
pub use resources::{ResourceAmounts, ResourceReport};
pub use state::resolve;
