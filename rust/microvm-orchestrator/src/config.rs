//! Configuration for the orchestrator agent and control plane

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::domain::Resources;
use crate::error::{OrchestratorError, OrchestratorResult};

/// Top-level configuration shared by both process roles
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Hypervisor (Firecracker) settings used by the agent
    #[serde(default)]
    pub firecracker: FirecrackerConfig,

    /// Agent runtime and channel settings
    #[serde(default)]
    pub agent: AgentConfig,

    /// Control plane listener, liveness and retry policy
    #[serde(default)]
    pub control_plane: ControlPlaneConfig,

    /// Permission oracle client
    #[serde(default)]
    pub authorization: AuthorizationConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FirecrackerConfig {
    #[serde(default = "default_binary_path")]
    pub binary_path: PathBuf,
    #[serde(default = "default_kernel_path")]
    pub kernel_path: PathBuf,
    #[serde(default)]
    pub initrd_path: Option<PathBuf>,
    /// Directory that relative image references resolve against
    #[serde(default = "default_image_dir")]
    pub image_dir: PathBuf,
    /// Directory holding per-instance API sockets
    #[serde(default = "default_socket_dir")]
    pub socket_dir: PathBuf,
    #[serde(default = "default_console")]
    pub console: String,
    #[serde(default = "default_root_device")]
    pub root_device: String,
    /// Appended after `console= root= panic=1`, before per-VM args
    #[serde(default = "default_boot_args")]
    pub default_boot_args: Vec<String>,
    /// Process spawn plus API socket readiness (default: 5s)
    #[serde(default = "default_launch_timeout")]
    pub launch_timeout_secs: u64,
    /// Maximum time in `Starting` (default: 30s)
    #[serde(default = "default_boot_timeout")]
    pub boot_timeout_secs: u64,
    /// Wait for a clean exit before forcing termination (default: 10s)
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,
    /// Bound on a single hypervisor API call (default: 5s)
    #[serde(default = "default_action_timeout")]
    pub action_timeout_secs: u64,
    #[serde(default = "default_state_poll_interval")]
    pub state_poll_interval_ms: u64,
}

/// Which hypervisor driver the agent uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Firecracker,
    /// In-process simulation for hosts without KVM
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_hostname")]
    pub hostname: String,
    #[serde(default = "default_control_plane_addr")]
    pub control_plane_addr: String,
    #[serde(default = "default_driver")]
    pub driver: DriverKind,
    /// Host capacity offered to VMs
    #[serde(default = "default_capacity")]
    pub capacity: Resources,
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_ms: u64,
    #[serde(default = "default_reconnect_initial")]
    pub reconnect_initial_delay_ms: u64,
    #[serde(default = "default_reconnect_max")]
    pub reconnect_max_delay_ms: u64,
    /// Time allowed for the control plane to acknowledge a registration
    #[serde(default = "default_register_timeout")]
    pub register_timeout_ms: u64,
    /// Bounded queue depth for outbound channel messages
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlPlaneConfig {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Agents silent for longer than this are marked offline (default: 15s)
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_ms: u64,
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_retry_max_attempts")]
    pub retry_max_attempts: u32,
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthorizationConfig {
    #[serde(default = "default_oracle_url")]
    pub oracle_url: String,
    #[serde(default)]
    pub oracle_token: Option<String>,
    /// Bound on one permission check (default: 2000ms)
    #[serde(default = "default_check_timeout")]
    pub check_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Metrics server port (default: 2114)
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

// Default value functions
fn default_binary_path() -> PathBuf {
    PathBuf::from("/usr/local/bin/firecracker")
}
fn default_kernel_path() -> PathBuf {
    PathBuf::from("/var/lib/firecracker/kernel/vmlinux")
}
fn default_image_dir() -> PathBuf {
    PathBuf::from("/var/lib/firecracker/images")
}
fn default_socket_dir() -> PathBuf {
    PathBuf::from("/run/firecracker")
}
fn default_console() -> String {
    "ttyS0".to_string()
}
fn default_root_device() -> String {
    "/dev/vda".to_string()
}
fn default_boot_args() -> Vec<String> {
    vec!["reboot=k".to_string(), "pci=off".to_string()]
}
fn default_launch_timeout() -> u64 {
    5
}
fn default_boot_timeout() -> u64 {
    30
}
fn default_stop_grace() -> u64 {
    10
}
fn default_action_timeout() -> u64 {
    5
}
fn default_state_poll_interval() -> u64 {
    100
}
fn default_agent_id() -> String {
    default_hostname()
}
fn default_hostname() -> String {
    env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string())
}
fn default_control_plane_addr() -> String {
    "127.0.0.1:7070".to_string()
}
fn default_driver() -> DriverKind {
    DriverKind::Firecracker
}
fn default_capacity() -> Resources {
    Resources::new(8, 16 * 1024, 100 * 1024)
}
fn default_heartbeat_interval() -> u64 {
    5_000
}
fn default_monitor_interval() -> u64 {
    2_000
}
fn default_reconnect_initial() -> u64 {
    250
}
fn default_reconnect_max() -> u64 {
    10_000
}
fn default_register_timeout() -> u64 {
    5_000
}
fn default_outbound_buffer() -> usize {
    256
}
fn default_listen_addr() -> String {
    "0.0.0.0:7070".to_string()
}
fn default_heartbeat_timeout() -> u64 {
    15_000
}
fn default_sweep_interval() -> u64 {
    1_000
}
fn default_retry_max_attempts() -> u32 {
    3
}
fn default_retry_base_delay() -> u64 {
    1_000
}
fn default_retry_max_delay() -> u64 {
    30_000
}
fn default_oracle_url() -> String {
    "http://localhost:8443".to_string()
}
fn default_check_timeout() -> u64 {
    2_000
}
fn default_metrics_port() -> u16 {
    2114
}
fn default_true() -> bool {
    true
}

impl Default for FirecrackerConfig {
    fn default() -> Self {
        Self {
            binary_path: default_binary_path(),
            kernel_path: default_kernel_path(),
            initrd_path: None,
            image_dir: default_image_dir(),
            socket_dir: default_socket_dir(),
            console: default_console(),
            root_device: default_root_device(),
            default_boot_args: default_boot_args(),
            launch_timeout_secs: default_launch_timeout(),
            boot_timeout_secs: default_boot_timeout(),
            stop_grace_secs: default_stop_grace(),
            action_timeout_secs: default_action_timeout(),
            state_poll_interval_ms: default_state_poll_interval(),
        }
    }
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            hostname: default_hostname(),
            control_plane_addr: default_control_plane_addr(),
            driver: default_driver(),
            capacity: default_capacity(),
            heartbeat_interval_ms: default_heartbeat_interval(),
            monitor_interval_ms: default_monitor_interval(),
            reconnect_initial_delay_ms: default_reconnect_initial(),
            reconnect_max_delay_ms: default_reconnect_max(),
            register_timeout_ms: default_register_timeout(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            heartbeat_timeout_ms: default_heartbeat_timeout(),
            sweep_interval_ms: default_sweep_interval(),
            retry_max_attempts: default_retry_max_attempts(),
            retry_base_delay_ms: default_retry_base_delay(),
            retry_max_delay_ms: default_retry_max_delay(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for AuthorizationConfig {
    fn default() -> Self {
        Self {
            oracle_url: default_oracle_url(),
            oracle_token: None,
            check_timeout_ms: default_check_timeout(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            firecracker: FirecrackerConfig::default(),
            agent: AgentConfig::default(),
            control_plane: ControlPlaneConfig::default(),
            authorization: AuthorizationConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file or environment
    pub fn load() -> OrchestratorResult<Self> {
        if let Ok(config_path) = env::var("ORCHESTRATOR_CONFIG_PATH") {
            Self::from_file(&config_path)
        } else if Path::new("/etc/microvm/orchestrator.yaml").exists() {
            Self::from_file("/etc/microvm/orchestrator.yaml")
        } else if Path::new("config/orchestrator.yaml").exists() {
            Self::from_file("config/orchestrator.yaml")
        } else {
            Ok(Self::from_env(Self::default()))
        }
    }

    /// Load configuration from a YAML file
    pub fn from_file(path: &str) -> OrchestratorResult<Self> {
        let content = fs::read_to_string(path).map_err(|e| {
            OrchestratorError::Configuration(format!("Failed to read config file: {e}"))
        })?;

        let config: Config = serde_yaml::from_str(&content).map_err(|e| {
            OrchestratorError::Configuration(format!("Failed to parse config: {e}"))
        })?;

        Ok(Self::from_env(config))
    }

    /// Override configuration with environment variables
    pub fn from_env(mut config: Config) -> Self {
        // Hypervisor overrides
        if let Ok(v) = env::var("FIRECRACKER_BIN") {
            config.firecracker.binary_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("FIRECRACKER_KERNEL") {
            config.firecracker.kernel_path = PathBuf::from(v);
        }
        if let Ok(v) = env::var("FIRECRACKER_SOCKET_DIR") {
            config.firecracker.socket_dir = PathBuf::from(v);
        }
        if let Ok(v) = env::var("VM_BOOT_TIMEOUT_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.firecracker.boot_timeout_secs = secs;
            }
        }
        if let Ok(v) = env::var("VM_STOP_GRACE_SECONDS") {
            if let Ok(secs) = v.parse::<u64>() {
                config.firecracker.stop_grace_secs = secs;
            }
        }

        // Agent overrides
        if let Ok(v) = env::var("AGENT_ID") {
            if !v.is_empty() {
                config.agent.agent_id = v;
            }
        }
        if let Ok(v) = env::var("CONTROL_PLANE_ADDR") {
            config.agent.control_plane_addr = v;
        }
        if let Ok(v) = env::var("HEARTBEAT_INTERVAL_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                config.agent.heartbeat_interval_ms = ms;
            }
        }

        // Control plane overrides
        if let Ok(v) = env::var("CONTROL_PLANE_LISTEN_ADDR") {
            config.control_plane.listen_addr = v;
        }
        if let Ok(v) = env::var("HEARTBEAT_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                config.control_plane.heartbeat_timeout_ms = ms;
            }
        }

        // Oracle overrides
        if let Ok(v) = env::var("PERMISSION_ORACLE_URL") {
            config.authorization.oracle_url = v;
        }
        if let Ok(v) = env::var("PERMISSION_ORACLE_TOKEN") {
            if !v.is_empty() {
                config.authorization.oracle_token = Some(v);
            }
        }

        if let Ok(v) = env::var("METRICS_PORT") {
            if let Ok(port) = v.parse::<u16>() {
                config.metrics.port = port;
            }
        }

        config
    }

    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.firecracker.boot_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.firecracker.stop_grace_secs)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.agent.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.control_plane.heartbeat_timeout_ms)
    }

    pub fn oracle_timeout(&self) -> Duration {
        Duration::from_millis(self.authorization.check_timeout_ms)
    }
}
