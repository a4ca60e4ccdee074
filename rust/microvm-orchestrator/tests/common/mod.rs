//! Shared fixtures for the integration tests.

#![allow(dead_code, reason = "not every test binary uses every helper")]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use uuid::Uuid;

use microvm_orchestrator::authz::{AuthorizationGateway, Permission, PermissionOracle, ResourceRef};
use microvm_orchestrator::control_plane::{ControlPlane, ControlPlaneSettings, CreateVmRequest, VmView};
use microvm_orchestrator::domain::NetworkMode;
use microvm_orchestrator::reconciler::{DesiredStatus, RetryPolicy};

/// Answers every check with the same verdict.
#[derive(Debug)]
pub struct FixedOracle(pub bool);

#[async_trait]
impl PermissionOracle for FixedOracle {
    async fn check(&self, _: &str, _: Permission, _: &ResourceRef) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

pub fn control_plane_with(oracle: Arc<dyn PermissionOracle>) -> Arc<ControlPlane> {
    build_control_plane(oracle, Duration::from_secs(5))
}

/// Allow-all control plane that expires agents silent for longer than `heartbeat_timeout`.
pub fn control_plane_expiring(heartbeat_timeout: Duration) -> Arc<ControlPlane> {
    build_control_plane(Arc::new(FixedOracle(true)), heartbeat_timeout)
}

fn build_control_plane(oracle: Arc<dyn PermissionOracle>, heartbeat_timeout: Duration) -> Arc<ControlPlane> {
    let gateway = AuthorizationGateway::new(oracle, Duration::from_secs(1));
    let settings = ControlPlaneSettings {
        heartbeat_timeout,
        retry: RetryPolicy {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_millis(200),
        },
    };
    Arc::new(ControlPlane::new(settings, gateway))
}

pub fn control_plane(allow: bool) -> Arc<ControlPlane> {
    control_plane_with(Arc::new(FixedOracle(allow)))
}

pub fn create_request(name: &str, memory_mib: u64, agent_id: Option<&str>) -> CreateVmRequest {
    CreateVmRequest {
        name: name.to_string(),
        description: String::new(),
        vcpu_count: 1,
        memory_mib,
        disk_mib: 1024,
        image: "alpine".to_string(),
        network: NetworkMode::None,
        kernel_args: Vec::new(),
        desired: DesiredStatus::Running,
        agent_id: agent_id.map(str::to_string),
    }
}

/// Poll `get_vm` until `done` holds, failing after five seconds.
pub async fn wait_for_vm<F>(cp: &ControlPlane, vm_id: Uuid, done: F) -> VmView
where
    F: Fn(&VmView) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let view = cp.get_vm("alice", vm_id).await.unwrap();
        if done(&view) {
            return view;
        }
        assert!(Instant::now() < deadline, "condition never held; last view {view:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll the agent table until `done` holds, failing after five seconds.
pub async fn wait_for_agents<F>(cp: &ControlPlane, done: F)
where
    F: Fn(&[microvm_orchestrator::control_plane::AgentView]) -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        let agents = cp.agents();
        if done(&agents) {
            return;
        }
        assert!(Instant::now() < deadline, "agent condition never held; last {agents:?}");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
