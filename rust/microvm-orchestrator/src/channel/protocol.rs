//! Control channel message set.
//!
//! Every frame is one JSON `Envelope`: `{seq, channel_id, message: {type, payload}}`.
//! `seq` is strictly increasing per sender per channel; receivers drop anything
//! at or below the last sequence they accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::{AgentRegistration, VmRuntimeState, VmSpec, VmStatus};
use crate::error::{OrchestratorError, RejectionKind};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub seq: u64,
    /// Nil until the control plane has acknowledged registration.
    pub channel_id: Uuid,
    pub message: ControlMessage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ControlMessage {
    Register(AgentRegistration),
    RegisterAck(RegisterAck),
    Heartbeat(Heartbeat),
    CommandDispatch(CommandDispatch),
    CommandResult(CommandResult),
    StateUpdate(StateUpdate),
    Error(ProtocolError),
}

impl ControlMessage {
    /// Stable name used in logs and metric labels.
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Register(_) => "register",
            Self::RegisterAck(_) => "register_ack",
            Self::Heartbeat(_) => "heartbeat",
            Self::CommandDispatch(_) => "command_dispatch",
            Self::CommandResult(_) => "command_result",
            Self::StateUpdate(_) => "state_update",
            Self::Error(_) => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterAck {
    pub channel_id: Uuid,
    pub heartbeat_interval_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Agents attach a fresh capacity snapshot; the control plane sends none.
    #[serde(default)]
    pub registration: Option<AgentRegistration>,
    pub sent_at: DateTime<Utc>,
}

impl Heartbeat {
    pub fn now(registration: Option<AgentRegistration>) -> Self {
        Self {
            registration,
            sent_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CommandAction {
    Start { spec: VmSpec },
    Stop,
    Restart { spec: VmSpec },
    Pause,
    Resume,
    /// Stop if live, then forget the VM on the agent.
    Delete,
}

impl CommandAction {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start { .. } => "start",
            Self::Stop => "stop",
            Self::Restart { .. } => "restart",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandDispatch {
    pub command_id: Uuid,
    pub vm_id: Uuid,
    pub action: CommandAction,
}

impl CommandDispatch {
    pub fn new(vm_id: Uuid, action: CommandAction) -> Self {
        Self {
            command_id: Uuid::new_v4(),
            vm_id,
            action,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandOutcome {
    Completed { status: VmStatus },
    Rejected { kind: RejectionKind, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command_id: Uuid,
    pub vm_id: Uuid,
    pub outcome: CommandOutcome,
}

impl CommandResult {
    pub fn completed(command: &CommandDispatch, status: VmStatus) -> Self {
        Self {
            command_id: command.command_id,
            vm_id: command.vm_id,
            outcome: CommandOutcome::Completed { status },
        }
    }

    pub fn rejected(command: &CommandDispatch, error: &OrchestratorError) -> Self {
        Self {
            command_id: command.command_id,
            vm_id: command.vm_id,
            outcome: CommandOutcome::Rejected {
                kind: error.kind(),
                message: error.to_string(),
            },
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Completed { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateUpdate {
    pub states: Vec<VmRuntimeState>,
    /// The agent's complete VM set; VMs missing from it are absent on the agent.
    #[serde(default)]
    pub full_snapshot: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtocolError {
    pub kind: RejectionKind,
    pub message: String,
}

/// Stamps outbound messages with this side's sequence numbers.
#[derive(Debug)]
pub struct OutboundSequencer {
    channel_id: Uuid,
    next: u64,
}

impl OutboundSequencer {
    pub fn new(channel_id: Uuid) -> Self {
        Self { channel_id, next: 1 }
    }

    pub fn channel_id(&self) -> Uuid {
        self.channel_id
    }

    pub fn bind(&mut self, channel_id: Uuid) {
        self.channel_id = channel_id;
    }

    pub fn seal(&mut self, message: ControlMessage) -> Envelope {
        let seq = self.next;
        self.next += 1;
        Envelope {
            seq,
            channel_id: self.channel_id,
            message,
        }
    }
}

/// Remembers the highest inbound sequence accepted on a channel.
#[derive(Debug, Default)]
pub struct SequenceTracker {
    last_accepted: u64,
}

impl SequenceTracker {
    /// `true` if `seq` is new; duplicates and stragglers return `false`.
    pub fn accept(&mut self, seq: u64) -> bool {
        if seq <= self.last_accepted {
            return false;
        }
        self.last_accepted = seq;
        true
    }

    pub fn last_accepted(&self) -> u64 {
        self.last_accepted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Resources;

    #[test]
    fn test_envelope_wire_shape() {
        let mut out = OutboundSequencer::new(Uuid::nil());
        let vm_id = Uuid::new_v4();
        let envelope = out.seal(ControlMessage::CommandDispatch(CommandDispatch::new(
            vm_id,
            CommandAction::Pause,
        )));

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["seq"], 1);
        assert_eq!(json["message"]["type"], "command_dispatch");
        assert_eq!(json["message"]["payload"]["action"]["kind"], "pause");
        assert_eq!(json["message"]["payload"]["vm_id"], vm_id.to_string());
    }

    #[test]
    fn test_register_decodes() {
        let raw = r#"{
            "seq": 1,
            "channel_id": "00000000-0000-0000-0000-000000000000",
            "message": {"type": "register", "payload": {
                "agent_id": "host-a", "hostname": "host-a.local",
                "capabilities": ["firecracker"],
                "total": {"vcpus": 8, "memory_mib": 16384, "disk_mib": 100000},
                "available": {"vcpus": 8, "memory_mib": 16384, "disk_mib": 100000},
                "protocol_version": 1
            }}
        }"#;
        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        match envelope.message {
            ControlMessage::Register(reg) => {
                assert_eq!(reg.agent_id, "host-a");
                assert_eq!(reg.total, Resources::new(8, 16384, 100_000));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_message_type_rejected() {
        let raw = r#"{"seq":1,"channel_id":"00000000-0000-0000-0000-000000000000","message":{"type":"gossip","payload":{}}}"#;
        assert!(serde_json::from_str::<Envelope>(raw).is_err());
    }

    #[test]
    fn test_sequence_tracker_drops_replays() {
        let mut tracker = SequenceTracker::default();
        assert!(tracker.accept(1));
        assert!(tracker.accept(2));
        assert!(!tracker.accept(2));
        assert!(!tracker.accept(1));
        assert!(tracker.accept(5));
        assert_eq!(tracker.last_accepted(), 5);
    }

    #[test]
    fn test_rejected_result_carries_kind() {
        let command = CommandDispatch::new(Uuid::new_v4(), CommandAction::Stop);
        let result = CommandResult::rejected(&command, &OrchestratorError::NotFound(command.vm_id));
        assert!(!result.is_completed());
        assert!(matches!(
            result.outcome,
            CommandOutcome::Rejected { kind: RejectionKind::NotFound, .. }
        ));
    }
}
