//! Core data model shared by the agent and the control plane.

use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Identifier of an agent host.
pub type AgentId = String;

/// Wire protocol version advertised in registrations.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on vCPUs accepted for a single micro VM.
pub const MAX_VCPUS: u32 = 32;

/// Guest networking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    /// No network interface is attached.
    None,
    /// One virtio-net interface backed by a host tap device.
    #[default]
    Tap,
}

/// Additional block device attached after the root drive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeSpec {
    pub path: PathBuf,
    #[serde(default)]
    pub read_only: bool,
}

/// Immutable desired configuration of a VM.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmSpec {
    pub id: Uuid,
    pub vcpu_count: u32,
    pub memory_mib: u64,
    pub disk_mib: u64,
    /// Root filesystem image, either an absolute path or a name resolved
    /// against the agent's image directory.
    pub image: String,
    #[serde(default)]
    pub network: NetworkMode,
    /// Extra kernel command-line arguments, appended in order.
    #[serde(default)]
    pub kernel_args: Vec<String>,
    #[serde(default)]
    pub kernel_image: Option<PathBuf>,
    #[serde(default)]
    pub initrd: Option<PathBuf>,
    #[serde(default)]
    pub volumes: Vec<VolumeSpec>,
}

impl VmSpec {
    pub fn new(id: Uuid, vcpu_count: u32, memory_mib: u64, disk_mib: u64, image: impl Into<String>) -> Self {
        Self {
            id,
            vcpu_count,
            memory_mib,
            disk_mib,
            image: image.into(),
            network: NetworkMode::default(),
            kernel_args: Vec::new(),
            kernel_image: None,
            initrd: None,
            volumes: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_network(mut self, network: NetworkMode) -> Self {
        self.network = network;
        self
    }

    #[must_use]
    pub fn with_kernel_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.kernel_args = args.into_iter().map(Into::into).collect();
        self
    }

    #[must_use]
    pub fn with_volume(mut self, path: impl Into<PathBuf>, read_only: bool) -> Self {
        self.volumes.push(VolumeSpec {
            path: path.into(),
            read_only,
        });
        self
    }

    /// Resources this VM reserves on its host while live.
    pub fn resources(&self) -> Resources {
        Resources::new(self.vcpu_count, self.memory_mib, self.disk_mib)
    }

    /// Reject malformed specs before anything is touched.
    pub fn validate(&self) -> OrchestratorResult<()> {
        if self.vcpu_count == 0 {
            return Err(OrchestratorError::Validation(
                "vcpu_count must be at least 1".to_string(),
            ));
        }
        if self.vcpu_count > MAX_VCPUS {
            return Err(OrchestratorError::Validation(format!(
                "vcpu_count {} exceeds maximum of {MAX_VCPUS}",
                self.vcpu_count
            )));
        }
        if self.memory_mib == 0 {
            return Err(OrchestratorError::Validation(
                "memory_mib must be at least 1".to_string(),
            ));
        }
        if self.disk_mib == 0 {
            return Err(OrchestratorError::Validation(
                "disk_mib must be at least 1".to_string(),
            ));
        }
        if self.image.trim().is_empty() {
            return Err(OrchestratorError::Validation(
                "image reference must not be empty".to_string(),
            ));
        }
        for arg in &self.kernel_args {
            if arg.is_empty() || arg.chars().any(|c| c.is_whitespace() || c.is_control()) {
                return Err(OrchestratorError::Validation(format!(
                    "invalid kernel argument {arg:?}"
                )));
            }
        }
        Ok(())
    }
}

/// CPU / memory / disk quantities used for admission control.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Resources {
    pub vcpus: u32,
    pub memory_mib: u64,
    pub disk_mib: u64,
}

impl Resources {
    pub const fn new(vcpus: u32, memory_mib: u64, disk_mib: u64) -> Self {
        Self {
            vcpus,
            memory_mib,
            disk_mib,
        }
    }

    /// `self - other`, or `None` if any dimension would go negative.
    pub fn checked_sub(&self, other: &Resources) -> Option<Resources> {
        Some(Resources {
            vcpus: self.vcpus.checked_sub(other.vcpus)?,
            memory_mib: self.memory_mib.checked_sub(other.memory_mib)?,
            disk_mib: self.disk_mib.checked_sub(other.disk_mib)?,
        })
    }

    pub fn saturating_add(&self, other: &Resources) -> Resources {
        Resources {
            vcpus: self.vcpus.saturating_add(other.vcpus),
            memory_mib: self.memory_mib.saturating_add(other.memory_mib),
            disk_mib: self.disk_mib.saturating_add(other.disk_mib),
        }
    }

    pub fn fits_within(&self, capacity: &Resources) -> bool {
        capacity.checked_sub(self).is_some()
    }
}

impl fmt::Display for Resources {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "cpu={} mem={}MiB disk={}MiB",
            self.vcpus, self.memory_mib, self.disk_mib
        )
    }
}

/// Lifecycle status of a VM instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmStatus {
    Created,
    Starting,
    Running,
    Pausing,
    Paused,
    Resuming,
    Stopping,
    Shutdown,
    Failed,
}

impl VmStatus {
    pub const ALL: [VmStatus; 9] = [
        VmStatus::Created,
        VmStatus::Starting,
        VmStatus::Running,
        VmStatus::Pausing,
        VmStatus::Paused,
        VmStatus::Resuming,
        VmStatus::Stopping,
        VmStatus::Shutdown,
        VmStatus::Failed,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Pausing => "pausing",
            Self::Paused => "paused",
            Self::Resuming => "resuming",
            Self::Stopping => "stopping",
            Self::Shutdown => "shutdown",
            Self::Failed => "failed",
        }
    }

    /// `Shutdown` and `Failed` end an instance; running again needs a new one.
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Shutdown | Self::Failed)
    }

    /// A hypervisor process exists (or is being brought up) for this status.
    pub const fn is_live(&self) -> bool {
        !matches!(self, Self::Created | Self::Shutdown | Self::Failed)
    }
}

impl fmt::Display for VmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why an instance ended up in `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    LaunchError,
    BootTimeout,
    HypervisorUnreachable,
    /// The hypervisor process went away without a requested stop.
    HypervisorExited,
    DriverError,
}

impl FailureCause {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::LaunchError => "launch_error",
            Self::BootTimeout => "boot_timeout",
            Self::HypervisorUnreachable => "hypervisor_unreachable",
            Self::HypervisorExited => "hypervisor_exited",
            Self::DriverError => "driver_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmFailure {
    pub cause: FailureCause,
    pub message: String,
}

/// Handle to a live hypervisor instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceHandle {
    pub vm_id: Uuid,
    /// Hypervisor API control socket.
    pub api_socket: PathBuf,
    pub pid: Option<u32>,
}

/// Agent-local mutable state of one VM instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRuntimeState {
    pub vm_id: Uuid,
    pub status: VmStatus,
    pub instance: Option<InstanceHandle>,
    /// Resources held by the instance while it is live.
    pub usage: Option<Resources>,
    pub last_transition: DateTime<Utc>,
    pub last_error: Option<VmFailure>,
}

impl VmRuntimeState {
    pub fn new(vm_id: Uuid) -> Self {
        Self {
            vm_id,
            status: VmStatus::Created,
            instance: None,
            usage: None,
            last_transition: Utc::now(),
            last_error: None,
        }
    }
}

/// Agent identity and capacity snapshot, sent at register and every heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRegistration {
    pub agent_id: AgentId,
    pub hostname: String,
    /// Supported hypervisor backends, e.g. `firecracker`.
    pub capabilities: Vec<String>,
    pub total: Resources,
    pub available: Resources,
    pub protocol_version: u32,
}
