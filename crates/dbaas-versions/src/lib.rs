//! DBaaS Version Service
//!
//! Fetches compatibility matrices from the version service and selects
//! versions from them:
//!
//! - **Latest**: highest semantic version among a component's candidates
//! - **Operator versions**: newest operators compatible with a platform release
//! - **Recommended images**: the image a new cluster should start with
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbaas_versions::VersionServiceClient;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = VersionServiceClient::new("https://check.percona.com/versions/v1")?;
//! if let Some(versions) = client.latest_operator_versions("2.26.0").await? {
//!     println!("pxc {} / psmdb {}", versions.xtradb, versions.psmdb);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod matrix;

pub use client::{
    DEFAULT_VERSION_SERVICE_URL, RecommendedImage, VersionServiceClient, database_component,
    operator_product,
};
pub use error::{Result, VersionError};
pub use matrix::{
    ComponentInfo, OperatorVersions, VersionMatrixEntry, VersionResponse, latest,
    operator_versions, parse_version, recommended,
};
