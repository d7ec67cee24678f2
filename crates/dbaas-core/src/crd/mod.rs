//! Custom resource documents of the two database operators
//!
//! The typed structs are used both to build documents (absent fields are
//! never serialized) and to read documents back from the platform (unknown
//! fields are ignored, so newer operator schemas still parse).

pub mod common;
mod document;
pub mod psmdb;
pub mod pxc;

pub use common::{
    AppStatus, BackupStorageSpec, ExposeSpec, PmmSpec, PodAffinity, PodCounts, PodResources,
    ResourceList, S3Storage, UpgradeOptions, VolumeSpec,
};
pub use document::CrDocument;
pub(crate) use document::{object_at, overlay, strip_server_fields, to_value};
pub use psmdb::{
    PSMDB_GROUP, PSMDB_KIND, PSMDB_PLURAL, PerconaServerMongoDb, PsmdbClusterSpec,
    PsmdbClusterStatus, ReplsetSpec, ShardingSpec,
};
pub use pxc::{
    PXC_GROUP, PXC_KIND, PXC_PLURAL, PerconaXtraDbCluster, PxcClusterSpec, PxcClusterStatus,
    PxcPodSpec,
};
