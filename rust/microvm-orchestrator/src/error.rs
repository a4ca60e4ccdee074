use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::VmStatus;

/// Core error type for the orchestration core
#[derive(Error, Debug)]
pub enum OrchestratorError {
    /// Malformed request or VM spec; nothing has been touched yet
    #[error("Validation failed: {0}")]
    Validation(String),

    /// Permission oracle denied the request (or could not be consulted)
    #[error("Forbidden: subject '{subject}' may not '{permission}' on {resource}")]
    Forbidden {
        subject: String,
        permission: String,
        resource: String,
    },

    /// Admission control rejected a start
    #[error("Insufficient resources on host: requested {requested}, available {available}")]
    InsufficientResources { requested: String, available: String },

    /// Hypervisor control socket is gone or refused the connection
    #[error("Hypervisor unreachable: {0}")]
    HypervisorUnreachable(String),

    #[error("Failed to launch hypervisor: {0}")]
    LaunchError(String),

    #[error("VM did not reach running within {seconds} seconds")]
    BootTimeout { seconds: u64 },

    /// The hypervisor refused an action for its current state
    #[error("Hypervisor action '{action}' not valid in state '{state}'")]
    InvalidState { action: String, state: String },

    /// The lifecycle state machine rejected a transition request
    #[error("Transition '{request}' is not allowed from state '{from}'")]
    InvalidTransition { from: VmStatus, request: String },

    #[error("Control channel disconnected")]
    ChannelDisconnected,

    /// A dispatched command was superseded by newer desired state
    #[error("Command {command_id} superseded by newer desired state")]
    StaleCommand { command_id: Uuid },

    #[error("VM {0} not found")]
    NotFound(Uuid),

    #[error("Operation '{operation}' timed out after {millis} ms")]
    Timeout { operation: String, millis: u64 },

    /// Wire protocol violations (bad frames, unexpected message order)
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Result type alias for orchestration operations
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Stable, machine-readable rejection reason carried over the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionKind {
    Validation,
    Forbidden,
    InsufficientResources,
    HypervisorUnreachable,
    LaunchError,
    BootTimeout,
    InvalidState,
    InvalidTransition,
    ChannelDisconnected,
    StaleCommand,
    NotFound,
    Timeout,
    Protocol,
    Internal,
}

impl RejectionKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "validation",
            Self::Forbidden => "forbidden",
            Self::InsufficientResources => "insufficient_resources",
            Self::HypervisorUnreachable => "hypervisor_unreachable",
            Self::LaunchError => "launch_error",
            Self::BootTimeout => "boot_timeout",
            Self::InvalidState => "invalid_state",
            Self::InvalidTransition => "invalid_transition",
            Self::ChannelDisconnected => "channel_disconnected",
            Self::StaleCommand => "stale_command",
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::Protocol => "protocol",
            Self::Internal => "internal",
        }
    }
}

impl OrchestratorError {
    /// Classify the error for reporting to a remote peer.
    pub fn kind(&self) -> RejectionKind {
        match self {
            Self::Validation(_) => RejectionKind::Validation,
            Self::Forbidden { .. } => RejectionKind::Forbidden,
            Self::InsufficientResources { .. } => RejectionKind::InsufficientResources,
            Self::HypervisorUnreachable(_) => RejectionKind::HypervisorUnreachable,
            Self::LaunchError(_) => RejectionKind::LaunchError,
            Self::BootTimeout { .. } => RejectionKind::BootTimeout,
            Self::InvalidState { .. } => RejectionKind::InvalidState,
            Self::InvalidTransition { .. } => RejectionKind::InvalidTransition,
            Self::ChannelDisconnected => RejectionKind::ChannelDisconnected,
            Self::StaleCommand { .. } => RejectionKind::StaleCommand,
            Self::NotFound(_) => RejectionKind::NotFound,
            Self::Timeout { .. } => RejectionKind::Timeout,
            Self::Protocol(_) => RejectionKind::Protocol,
            Self::Configuration(_) | Self::Internal(_) | Self::Other(_) => RejectionKind::Internal,
        }
    }

    pub fn forbidden(
        subject: impl Into<String>,
        permission: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self::Forbidden {
            subject: subject.into(),
            permission: permission.into(),
            resource: resource.into(),
        }
    }

    pub fn timeout(operation: impl Into<String>, after: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            millis: u64::try_from(after.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl From<std::io::Error> for OrchestratorError {
    fn from(err: std::io::Error) -> Self {
        OrchestratorError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for OrchestratorError {
    fn from(err: serde_json::Error) -> Self {
        OrchestratorError::Protocol(format!("Malformed JSON: {err}"))
    }
}

impl From<hyper::Error> for OrchestratorError {
    fn from(err: hyper::Error) -> Self {
        OrchestratorError::HypervisorUnreachable(err.to_string())
    }
}

impl From<reqwest::Error> for OrchestratorError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OrchestratorError::Timeout {
                operation: "http request".to_string(),
                millis: 0,
            }
        } else {
            OrchestratorError::Internal(format!("HTTP request failed: {err}"))
        }
    }
}
