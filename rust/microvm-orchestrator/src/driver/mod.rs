//! Hypervisor driver: pure VM-spec translation plus lifecycle actions.
//!
//! The translation half (`build_configuration`, `build_boot_args`,
//! `tap_device_name`, `guest_mac`) is deterministic and runs without a
//! hypervisor. The action half is the `HypervisorDriver` trait, implemented by
//! the Firecracker backend and by an in-process simulation.

pub mod api;
pub mod firecracker;
pub mod simulated;

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::FirecrackerConfig;
use crate::domain::{InstanceHandle, NetworkMode, VmSpec};
use crate::error::{OrchestratorError, OrchestratorResult};

pub use api::{BootSource, Drive, MachineConfig, NetworkInterface};
pub use firecracker::FirecrackerDriver;
pub use simulated::SimulatedDriver;

/// Drive id given to the root filesystem.
pub const ROOT_DRIVE_ID: &str = "rootfs";

/// Prefix of generated host tap devices; keeps names under IFNAMSIZ.
const TAP_PREFIX: &str = "fc-";

/// Complete boot/runtime configuration for one hypervisor instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorConfig {
    pub machine: MachineConfig,
    pub boot_source: BootSource,
    /// Ordered; the first drive is always the root device.
    pub drives: Vec<Drive>,
    pub network_interfaces: Vec<NetworkInterface>,
}

/// Lifecycle actions sent to a live instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmAction {
    Start,
    Stop,
    Reboot,
    Pause,
    Resume,
}

impl fmt::Display for VmAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Reboot => "reboot",
            Self::Pause => "pause",
            Self::Resume => "resume",
        };
        f.write_str(s)
    }
}

/// State as reported by the hypervisor itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HypervisorObservedState {
    /// Process is up and configured, guest not booted yet.
    NotStarted,
    Running,
    Paused,
    /// The hypervisor process is gone.
    Exited,
}

impl fmt::Display for HypervisorObservedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotStarted => "not_started",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Whether `action` is legal for an instance the hypervisor reports as `state`.
pub fn action_allowed(state: HypervisorObservedState, action: VmAction) -> bool {
    use HypervisorObservedState as S;
    match action {
        VmAction::Start => state == S::NotStarted,
        VmAction::Stop | VmAction::Reboot => state == S::Running,
        VmAction::Pause => state == S::Running,
        VmAction::Resume => state == S::Paused,
    }
}

/// Result of a graceful-then-forced stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownOutcome {
    /// The grace period elapsed and the process was killed.
    pub forced: bool,
}

/// Compose the kernel command line.
///
/// Always `console=<console> root=<root> panic=1`, then `defaults` and then
/// `extra`, each in the given order.
pub fn build_boot_args<S: AsRef<str>>(console: &str, root: &str, defaults: &[S], extra: &[S]) -> String {
    let mut args = format!("console={console} root={root} panic=1");
    for arg in defaults.iter().chain(extra.iter()) {
        args.push(' ');
        args.push_str(arg.as_ref());
    }
    args
}

/// Host tap device for a VM, derived from its id.
pub fn tap_device_name(vm_id: &Uuid) -> String {
    let simple = vm_id.simple().to_string();
    format!("{TAP_PREFIX}{}", &simple[..8])
}

/// Guest MAC for a VM: locally administered unicast, folded from all 16 id bytes.
pub fn guest_mac(vm_id: &Uuid) -> String {
    let bytes = vm_id.as_bytes();
    let mut tail = [0u8; 4];
    for (i, b) in bytes.iter().enumerate() {
        tail[i % 4] ^= b.rotate_left(u32::try_from(i / 4).unwrap_or(0));
    }
    format!(
        "06:00:{:02x}:{:02x}:{:02x}:{:02x}",
        tail[0], tail[1], tail[2], tail[3]
    )
}

fn resolve_image(image_dir: &Path, image: &str) -> PathBuf {
    let path = Path::new(image);
    if path.is_absolute() {
        path.to_path_buf()
    } else if path.extension().is_some() {
        image_dir.join(path)
    } else {
        image_dir.join(format!("{image}.ext4"))
    }
}

/// Translate a VM spec into hypervisor boot/runtime configuration.
pub fn build_configuration(spec: &VmSpec, settings: &FirecrackerConfig) -> OrchestratorResult<HypervisorConfig> {
    spec.validate()?;

    let boot_args = build_boot_args(
        &settings.console,
        &settings.root_device,
        &settings.default_boot_args,
        &spec.kernel_args,
    );

    let kernel = spec
        .kernel_image
        .clone()
        .unwrap_or_else(|| settings.kernel_path.clone());
    let initrd = spec.initrd.clone().or_else(|| settings.initrd_path.clone());

    let mut drives = Vec::with_capacity(1 + spec.volumes.len());
    drives.push(Drive {
        drive_id: ROOT_DRIVE_ID.to_string(),
        path_on_host: resolve_image(&settings.image_dir, &spec.image),
        is_root_device: true,
        is_read_only: false,
    });
    for (idx, volume) in spec.volumes.iter().enumerate() {
        drives.push(Drive {
            drive_id: format!("vol{idx}"),
            path_on_host: volume.path.clone(),
            is_root_device: false,
            is_read_only: volume.read_only,
        });
    }

    let network_interfaces = match spec.network {
        NetworkMode::None => Vec::new(),
        NetworkMode::Tap => vec![NetworkInterface {
            iface_id: "eth0".to_string(),
            host_dev_name: tap_device_name(&spec.id),
            guest_mac: Some(guest_mac(&spec.id)),
        }],
    };

    Ok(HypervisorConfig {
        machine: MachineConfig {
            vcpu_count: spec.vcpu_count,
            mem_size_mib: spec.memory_mib,
        },
        boot_source: BootSource {
            kernel_image_path: kernel,
            initrd_path: initrd,
            boot_args,
        },
        drives,
        network_interfaces,
    })
}

/// Drives one kind of hypervisor on the local host.
#[async_trait]
pub trait HypervisorDriver: Send + Sync + fmt::Debug {
    /// Backend name advertised as an agent capability.
    fn backend(&self) -> &'static str;

    fn build_configuration(&self, spec: &VmSpec) -> OrchestratorResult<HypervisorConfig>;

    /// Spawn and configure a hypervisor instance; the guest is not booted yet.
    async fn launch(&self, spec: &VmSpec, config: &HypervisorConfig) -> OrchestratorResult<InstanceHandle>;

    async fn issue_action(&self, handle: &InstanceHandle, action: VmAction) -> OrchestratorResult<()>;

    async fn query_state(&self, handle: &InstanceHandle) -> OrchestratorResult<HypervisorObservedState>;

    /// Forcefully end the instance and clean up its control socket.
    async fn terminate(&self, handle: &InstanceHandle) -> OrchestratorResult<()>;

    /// Release whatever a `launch` for `vm_id` left behind when it was cut off
    /// before returning a handle. A no-op if nothing was spawned.
    async fn abort_launch(&self, vm_id: &Uuid) -> OrchestratorResult<()>;

    /// Request a clean stop, escalating to `terminate` after `grace`.
    async fn shutdown(
        &self,
        handle: &InstanceHandle,
        grace: Duration,
        poll_interval: Duration,
    ) -> OrchestratorResult<ShutdownOutcome> {
        match self.query_state(handle).await? {
            HypervisorObservedState::Exited => return Ok(ShutdownOutcome { forced: false }),
            // A paused or unbooted guest cannot process a shutdown request.
            HypervisorObservedState::Paused | HypervisorObservedState::NotStarted => {
                self.terminate(handle).await?;
                return Ok(ShutdownOutcome { forced: true });
            }
            HypervisorObservedState::Running => {}
        }

        match self.issue_action(handle, VmAction::Stop).await {
            Ok(()) => {}
            Err(OrchestratorError::InvalidState { state, .. }) => {
                debug!(vm_id = %handle.vm_id, %state, "Stop not accepted, waiting for exit");
            }
            Err(e) => return Err(e),
        }

        let deadline = Instant::now() + grace;
        loop {
            if self.query_state(handle).await? == HypervisorObservedState::Exited {
                return Ok(ShutdownOutcome { forced: false });
            }
            if Instant::now() >= deadline {
                warn!(
                    vm_id = %handle.vm_id,
                    grace_ms = grace.as_millis(),
                    "VM did not exit within grace period, forcing termination"
                );
                self.terminate(handle).await?;
                return Ok(ShutdownOutcome { forced: true });
            }
            tokio::time::sleep(poll_interval).await;
        }
    }
}
