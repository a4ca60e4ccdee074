//! MicroVM orchestration core.
//!
//! Two process roles share this crate:
//!
//! - the **agent** runs on each host, drives the hypervisor through
//!   [`driver::HypervisorDriver`], tracks every VM with a lifecycle state
//!   machine and reports state over the control channel;
//! - the **control plane** accepts agent connections, authorizes every
//!   client operation and reconciles desired against observed state.

pub mod authz;
pub mod channel;
pub mod config;
pub mod control_plane;
pub mod domain;
pub mod driver;
pub mod error;
pub mod metrics;
pub mod reconciler;
pub mod resources;
pub mod runtime;
pub mod tracing;
pub mod vm;

pub use authz::{AuthorizationGateway, HttpPermissionOracle, Permission, PermissionOracle};
pub use config::Config;
pub use control_plane::{ControlPlane, ControlPlaneSettings};
pub use domain::{Resources, VmRuntimeState, VmSpec, VmStatus};
pub use error::{OrchestratorError, OrchestratorResult};
pub use reconciler::Reconciler;
pub use runtime::{AgentRuntime, RuntimeSettings};
