//! DBaaS Kube - platform integration for the DBaaS controller
//!
//! This crate provides:
//! - **Access Port**: get/apply/patch/delete against the platform, with a
//!   kube-rs implementation and an in-memory mock
//! - **Sessions**: local `kubectl proxy` bridges on distinct, revocable ports
//! - **Controller**: create, update, delete, status, restart, credentials and
//!   resource reports for both database engines
//! - **Configuration**: namespace, operator deployments and session settings
//!
//! ## Example
//!
//! ```rust,no_run
//! use dbaas_kube::{ClusterController, ControllerConfig, KubeAccessPort};
//! use dbaas_core::Engine;
//!
//! # async fn example() -> dbaas_kube::Result<()> {
//! let config = ControllerConfig::default();
//! let port = KubeAccessPort::try_default(&config).await?;
//! let controller = ClusterController::new(port, config);
//! for cluster in controller.list(Some(Engine::XtraDb), None).await? {
//!     println!("{} {}", cluster.name, cluster.state);
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod controller;
pub mod error;
pub mod port;
pub mod session;

pub use config::{ControllerConfig, PortRange, SessionConfig};
pub use controller::{ClusterController, Credentials};
pub use error::{KubeError, Result};
pub use port::{AccessPort, KubeAccessPort, MockAccessPort, OperationCounts, PatchType, ResourceKind};
pub use session::{
    BridgeLauncher, BridgeProcess, KubectlProxyLauncher, PortRegistry, Session, SessionManager,
};
