//! Firecracker REST API client (HTTP/1.1 over the instance's Unix socket)

use std::path::{Path, PathBuf};
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{ACCEPT, CONTENT_TYPE, HOST};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use serde::{Deserialize, Serialize};
use tokio::net::UnixStream;
use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Client for Firecracker's REST API
#[derive(Debug, Clone)]
pub struct FirecrackerApiClient {
    socket_path: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u32,
    pub mem_size_mib: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub initrd_path: Option<PathBuf>,
    pub boot_args: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub host_dev_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub guest_mac: Option<String>,
}

/// Body of `PUT /actions`
#[derive(Debug, Serialize)]
struct InstanceActionInfo {
    action_type: &'static str,
}

/// Body of `PATCH /vm`
#[derive(Debug, Serialize)]
struct VmStateChange {
    state: &'static str,
}

/// Response of `GET /`
#[derive(Debug, Clone, Deserialize)]
pub struct InstanceInfo {
    #[serde(default)]
    pub id: String,
    /// `Not started`, `Running` or `Paused`
    pub state: String,
    #[serde(default)]
    pub vmm_version: String,
}

#[derive(Debug, Deserialize)]
struct FaultBody {
    fault_message: String,
}

impl FirecrackerApiClient {
    pub fn new(socket_path: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            socket_path: socket_path.into(),
            timeout,
        }
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub async fn set_machine_config(&self, config: &MachineConfig) -> OrchestratorResult<()> {
        self.put("/machine-config", config, "machine-config").await
    }

    pub async fn set_boot_source(&self, boot: &BootSource) -> OrchestratorResult<()> {
        self.put("/boot-source", boot, "boot-source").await
    }

    pub async fn add_drive(&self, drive: &Drive) -> OrchestratorResult<()> {
        self.put(&format!("/drives/{}", drive.drive_id), drive, "drive")
            .await
    }

    pub async fn add_network_interface(&self, iface: &NetworkInterface) -> OrchestratorResult<()> {
        self.put(
            &format!("/network-interfaces/{}", iface.iface_id),
            iface,
            "network-interface",
        )
        .await
    }

    pub async fn start(&self) -> OrchestratorResult<()> {
        self.action("InstanceStart").await
    }

    /// Ask the guest to shut down (x86 keyboard controller reset).
    pub async fn send_ctrl_alt_del(&self) -> OrchestratorResult<()> {
        self.action("SendCtrlAltDel").await
    }

    pub async fn pause(&self) -> OrchestratorResult<()> {
        let body = serde_json::to_vec(&VmStateChange { state: "Paused" })?;
        self.expect_success(Method::PATCH, "/vm", body, "pause").await
    }

    pub async fn resume(&self) -> OrchestratorResult<()> {
        let body = serde_json::to_vec(&VmStateChange { state: "Resumed" })?;
        self.expect_success(Method::PATCH, "/vm", body, "resume").await
    }

    pub async fn describe_instance(&self) -> OrchestratorResult<InstanceInfo> {
        let (status, body) = self.send(Method::GET, "/", None).await?;
        if !status.is_success() {
            return Err(OrchestratorError::HypervisorUnreachable(format!(
                "GET / returned {status}"
            )));
        }
        Ok(serde_json::from_slice(&body)?)
    }

    async fn action(&self, action_type: &'static str) -> OrchestratorResult<()> {
        let body = serde_json::to_vec(&InstanceActionInfo { action_type })?;
        self.expect_success(Method::PUT, "/actions", body, action_type)
            .await
    }

    async fn put<T: Serialize>(&self, path: &str, payload: &T, what: &str) -> OrchestratorResult<()> {
        let body = serde_json::to_vec(payload)?;
        self.expect_success(Method::PUT, path, body, what).await
    }

    async fn expect_success(
        &self,
        method: Method,
        path: &str,
        body: Vec<u8>,
        what: &str,
    ) -> OrchestratorResult<()> {
        let (status, response) = self.send(method, path, Some(body)).await?;
        if status.is_success() {
            return Ok(());
        }
        let fault = serde_json::from_slice::<FaultBody>(&response)
            .map_or_else(|_| String::from_utf8_lossy(&response).into_owned(), |f| f.fault_message);
        if status == StatusCode::BAD_REQUEST {
            Err(OrchestratorError::InvalidState {
                action: what.to_string(),
                state: fault,
            })
        } else {
            Err(OrchestratorError::Internal(format!(
                "Firecracker {what} failed with {status}: {fault}"
            )))
        }
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> OrchestratorResult<(StatusCode, Bytes)> {
        let request = async {
            let stream = UnixStream::connect(&self.socket_path).await.map_err(|e| {
                OrchestratorError::HypervisorUnreachable(format!(
                    "{}: {e}",
                    self.socket_path.display()
                ))
            })?;
            let (mut sender, conn) =
                hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!(error = %e, "Firecracker API connection closed");
                }
            });

            let req = Request::builder()
                .method(method)
                .uri(path)
                .header(HOST, "localhost")
                .header(ACCEPT, "application/json")
                .header(CONTENT_TYPE, "application/json")
                .body(Full::new(Bytes::from(body.unwrap_or_default())))
                .map_err(|e| OrchestratorError::Internal(format!("Invalid API request: {e}")))?;

            let response = sender.send_request(req).await?;
            let status = response.status();
            let bytes = response.into_body().collect().await?.to_bytes();
            Ok::<_, OrchestratorError>((status, bytes))
        };

        tokio::time::timeout(self.timeout, request)
            .await
            .map_err(|_elapsed| OrchestratorError::timeout(format!("firecracker {path}"), self.timeout))?
    }
}
