//! Firecracker process management.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::api::FirecrackerApiClient;
use super::{action_allowed, HypervisorConfig, HypervisorDriver, HypervisorObservedState, VmAction};
use crate::config::FirecrackerConfig;
use crate::domain::{InstanceHandle, VmSpec};
use crate::error::{OrchestratorError, OrchestratorResult};

const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_WAIT: Duration = Duration::from_secs(5);

/// Launches one `firecracker` process per VM and drives it over its API socket.
#[derive(Debug)]
pub struct FirecrackerDriver {
    settings: FirecrackerConfig,
    children: Mutex<HashMap<Uuid, Child>>,
}

impl FirecrackerDriver {
    pub fn new(settings: FirecrackerConfig) -> Self {
        Self {
            settings,
            children: Mutex::new(HashMap::new()),
        }
    }

    fn socket_path(&self, vm_id: &Uuid) -> PathBuf {
        self.settings.socket_dir.join(format!("{vm_id}.sock"))
    }

    fn client(&self, handle: &InstanceHandle) -> FirecrackerApiClient {
        FirecrackerApiClient::new(
            handle.api_socket.clone(),
            Duration::from_secs(self.settings.action_timeout_secs),
        )
    }

    /// `Some(true)` if the tracked child has exited, `None` if untracked.
    fn child_exited(&self, vm_id: &Uuid) -> Option<bool> {
        let mut children = self.children.lock();
        let child = children.get_mut(vm_id)?;
        match child.try_wait() {
            Ok(Some(status)) => {
                debug!(vm_id = %vm_id, exit_status = ?status, "Firecracker process exited");
                children.remove(vm_id);
                Some(true)
            }
            Ok(None) => Some(false),
            Err(e) => {
                warn!(vm_id = %vm_id, error = %e, "Failed to poll Firecracker process");
                Some(false)
            }
        }
    }

    async fn wait_for_socket(&self, vm_id: &Uuid, socket: &Path) -> OrchestratorResult<()> {
        let timeout = Duration::from_secs(self.settings.launch_timeout_secs);
        let wait = async {
            loop {
                if self.child_exited(vm_id) == Some(true) {
                    return Err(OrchestratorError::LaunchError(
                        "firecracker exited before its API socket came up".to_string(),
                    ));
                }
                if UnixStream::connect(socket).await.is_ok() {
                    return Ok(());
                }
                tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
            }
        };
        tokio::time::timeout(timeout, wait).await.map_err(|_elapsed| {
            OrchestratorError::LaunchError(format!(
                "API socket {} not ready after {}s",
                socket.display(),
                timeout.as_secs()
            ))
        })?
    }

    async fn configure(&self, handle: &InstanceHandle, config: &HypervisorConfig) -> OrchestratorResult<()> {
        let client = self.client(handle);
        client.set_machine_config(&config.machine).await?;
        client.set_boot_source(&config.boot_source).await?;
        for drive in &config.drives {
            client.add_drive(drive).await?;
        }
        for iface in &config.network_interfaces {
            client.add_network_interface(iface).await?;
        }
        Ok(())
    }
}

#[async_trait]
impl HypervisorDriver for FirecrackerDriver {
    fn backend(&self) -> &'static str {
        "firecracker"
    }

    fn build_configuration(&self, spec: &VmSpec) -> OrchestratorResult<HypervisorConfig> {
        super::build_configuration(spec, &self.settings)
    }

    async fn launch(&self, spec: &VmSpec, config: &HypervisorConfig) -> OrchestratorResult<InstanceHandle> {
        tokio::fs::create_dir_all(&self.settings.socket_dir)
            .await
            .map_err(|e| OrchestratorError::LaunchError(format!("socket dir: {e}")))?;

        let socket = self.socket_path(&spec.id);
        match tokio::fs::remove_file(&socket).await {
            Ok(()) => debug!(vm_id = %spec.id, "Removed stale API socket"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(OrchestratorError::LaunchError(format!("stale socket: {e}"))),
        }

        let child = Command::new(&self.settings.binary_path)
            .arg("--api-sock")
            .arg(&socket)
            .arg("--id")
            .arg(spec.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OrchestratorError::LaunchError(format!(
                    "spawn {}: {e}",
                    self.settings.binary_path.display()
                ))
            })?;

        let handle = InstanceHandle {
            vm_id: spec.id,
            api_socket: socket.clone(),
            pid: child.id(),
        };
        self.children.lock().insert(spec.id, child);

        info!(vm_id = %spec.id, pid = ?handle.pid, socket = %socket.display(), "Firecracker process spawned");

        let ready = match self.wait_for_socket(&spec.id, &socket).await {
            Ok(()) => self
                .configure(&handle, config)
                .await
                .map_err(|e| OrchestratorError::LaunchError(format!("configure: {e}"))),
            Err(e) => Err(e),
        };
        if let Err(e) = ready {
            if let Err(cleanup) = self.terminate(&handle).await {
                warn!(vm_id = %spec.id, error = %cleanup, "Cleanup after failed launch failed");
            }
            return Err(e);
        }

        Ok(handle)
    }

    async fn issue_action(&self, handle: &InstanceHandle, action: VmAction) -> OrchestratorResult<()> {
        let state = self.query_state(handle).await?;
        if state == HypervisorObservedState::Exited {
            return Err(OrchestratorError::HypervisorUnreachable(format!(
                "instance {} has exited",
                handle.vm_id
            )));
        }
        if !action_allowed(state, action) {
            return Err(OrchestratorError::InvalidState {
                action: action.to_string(),
                state: state.to_string(),
            });
        }

        let client = self.client(handle);
        match action {
            VmAction::Start => client.start().await,
            VmAction::Stop => client.send_ctrl_alt_del().await,
            VmAction::Pause => client.pause().await,
            VmAction::Resume => client.resume().await,
            // A guest-initiated reboot makes Firecracker exit; restarts relaunch instead.
            VmAction::Reboot => Err(OrchestratorError::InvalidState {
                action: action.to_string(),
                state: "firecracker exits on guest reboot".to_string(),
            }),
        }
    }

    async fn query_state(&self, handle: &InstanceHandle) -> OrchestratorResult<HypervisorObservedState> {
        match self.child_exited(&handle.vm_id) {
            Some(true) => return Ok(HypervisorObservedState::Exited),
            None if !handle.api_socket.exists() => return Ok(HypervisorObservedState::Exited),
            _ => {}
        }

        let info = self.client(handle).describe_instance().await?;
        match info.state.as_str() {
            "Running" => Ok(HypervisorObservedState::Running),
            "Paused" => Ok(HypervisorObservedState::Paused),
            "Not started" => Ok(HypervisorObservedState::NotStarted),
            other => Err(OrchestratorError::Internal(format!(
                "unknown Firecracker instance state '{other}'"
            ))),
        }
    }

    async fn terminate(&self, handle: &InstanceHandle) -> OrchestratorResult<()> {
        let child = self.children.lock().remove(&handle.vm_id);
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                debug!(vm_id = %handle.vm_id, error = %e, "Kill signal not delivered");
            }
            match tokio::time::timeout(KILL_WAIT, child.wait()).await {
                Ok(Ok(status)) => {
                    info!(vm_id = %handle.vm_id, exit_status = ?status, "Firecracker process terminated");
                }
                Ok(Err(e)) => return Err(e.into()),
                Err(_elapsed) => {
                    return Err(OrchestratorError::timeout("firecracker kill", KILL_WAIT));
                }
            }
        }

        match tokio::fs::remove_file(&handle.api_socket).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn abort_launch(&self, vm_id: &Uuid) -> OrchestratorResult<()> {
        let handle = InstanceHandle {
            vm_id: *vm_id,
            api_socket: self.socket_path(vm_id),
            pid: None,
        };
        self.terminate(&handle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn driver_in(dir: &std::path::Path, binary: &str) -> FirecrackerDriver {
        FirecrackerDriver::new(FirecrackerConfig {
            binary_path: PathBuf::from(binary),
            socket_dir: dir.to_path_buf(),
            launch_timeout_secs: 1,
            ..FirecrackerConfig::default()
        })
    }

    #[tokio::test]
    async fn test_missing_binary_is_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_in(dir.path(), "/nonexistent/firecracker");
        let spec = VmSpec::new(Uuid::new_v4(), 1, 128, 256, "alpine");
        let config = driver.build_configuration(&spec).unwrap();

        let err = driver.launch(&spec, &config).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::LaunchError(_)));
    }

    #[tokio::test]
    async fn test_abort_launch_removes_leftover_socket() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_in(dir.path(), "firecracker");
        let vm_id = Uuid::new_v4();
        let socket = dir.path().join(format!("{vm_id}.sock"));
        std::fs::write(&socket, b"").unwrap();

        driver.abort_launch(&vm_id).await.unwrap();
        assert!(!socket.exists());
        driver.abort_launch(&vm_id).await.unwrap();
    }

    #[tokio::test]
    async fn test_untracked_instance_without_socket_is_exited() {
        let dir = tempfile::tempdir().unwrap();
        let driver = driver_in(dir.path(), "firecracker");
        let handle = InstanceHandle {
            vm_id: Uuid::new_v4(),
            api_socket: dir.path().join("missing.sock"),
            pid: None,
        };
        assert_eq!(
            driver.query_state(&handle).await.unwrap(),
            HypervisorObservedState::Exited
        );
        let err = driver.issue_action(&handle, VmAction::Stop).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::HypervisorUnreachable(_)));
    }
}
