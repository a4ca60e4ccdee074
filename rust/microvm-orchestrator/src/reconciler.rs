//! Desired-vs-observed reconciliation on the control plane.
//!
//! The reconciler is a plain synchronous state holder: every entry point takes
//! the current `Instant` and returns the commands that must go out. Delivery is
//! the caller's job; commands for offline agents stay in the reconciler until
//! the agent is back or the VM is reassigned.
//!
//! At most one command per VM is in flight. When desired state moves on while
//! a delivered command is still unanswered, the command is marked superseded
//! and the corrective command is computed from whatever the agent reports next.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::protocol::{CommandAction, CommandDispatch, CommandOutcome, CommandResult, StateUpdate};
use crate::config::ControlPlaneConfig;
use crate::domain::{AgentId, VmRuntimeState, VmSpec, VmStatus};
use crate::error::{OrchestratorError, OrchestratorResult, RejectionKind};
use crate::metrics;

/// Target status the control plane drives a VM towards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DesiredStatus {
    Running,
    Stopped,
    Paused,
}

impl DesiredStatus {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Paused => "paused",
        }
    }
}

/// Authoritative desired-state record for one VM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmRecord {
    pub spec: VmSpec,
    pub name: String,
    pub description: String,
    pub desired: DesiredStatus,
    pub agent_id: Option<AgentId>,
    /// Waiting for the agent to confirm teardown before the record is dropped.
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl VmRecord {
    pub fn new(spec: VmSpec, name: impl Into<String>, description: impl Into<String>, desired: DesiredStatus) -> Self {
        let now = Utc::now();
        Self {
            spec,
            name: name.into(),
            description: description.into(),
            desired,
            agent_id: None,
            deleted: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn vm_id(&self) -> Uuid {
        self.spec.id
    }
}

/// What the control plane last learned from the owning agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Observed {
    /// No report since the agent (re)connected.
    Unknown,
    /// The agent's full snapshot did not include the VM.
    Absent,
    Reported(VmRuntimeState),
}

impl Observed {
    pub fn status(&self) -> Option<VmStatus> {
        match self {
            Self::Reported(state) => Some(state.status),
            Self::Unknown | Self::Absent => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &ControlPlaneConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
        }
    }

    /// Backoff before attempt `failures + 1`: base doubled per failure, capped.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ControlPlaneConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Start,
    Stop,
    Restart,
    Pause,
    Resume,
    Delete,
}

impl CommandKind {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Delete => "delete",
        }
    }

    fn action(self, spec: &VmSpec) -> CommandAction {
        match self {
            Self::Start => CommandAction::Start { spec: spec.clone() },
            Self::Stop => CommandAction::Stop,
            Self::Restart => CommandAction::Restart { spec: spec.clone() },
            Self::Pause => CommandAction::Pause,
            Self::Resume => CommandAction::Resume,
            Self::Delete => CommandAction::Delete,
        }
    }
}

#[derive(Debug, Clone)]
struct Inflight {
    command: CommandDispatch,
    kind: CommandKind,
    agent_id: AgentId,
    issued_at: Instant,
    /// Position in the reconciler's request order when the command was built.
    seq: u64,
    /// `false` while held for an offline agent.
    sent: bool,
    superseded: bool,
}

#[derive(Debug, Clone, Copy)]
struct RetryState {
    failures: u32,
    not_before: Instant,
}

/// A command that must be written to `agent_id`'s channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatch {
    pub agent_id: AgentId,
    pub command: CommandDispatch,
}

/// Minimal command that moves `observed` towards `record.desired`.
fn plan(record: &VmRecord, observed: &Observed, restart_requested: bool) -> Option<CommandKind> {
    use VmStatus::{Created, Failed, Paused, Running, Shutdown};

    if record.deleted {
        return match observed {
            Observed::Absent => None,
            _ => Some(CommandKind::Delete),
        };
    }

    let status = observed.status();
    match record.desired {
        DesiredStatus::Running => match status {
            None | Some(Created | Shutdown | Failed) => Some(CommandKind::Start),
            Some(Paused) => Some(CommandKind::Resume),
            Some(Running) if restart_requested => Some(CommandKind::Restart),
            // Transitional states settle on their own.
            Some(_) => None,
        },
        DesiredStatus::Stopped => match status {
            Some(Running | Paused) => Some(CommandKind::Stop),
            _ => None,
        },
        DesiredStatus::Paused => match status {
            None | Some(Created | Shutdown | Failed) => Some(CommandKind::Start),
            Some(Running) => Some(CommandKind::Pause),
            Some(_) => None,
        },
    }
}

fn converged(desired: DesiredStatus, observed: &Observed) -> bool {
    match (desired, observed) {
        (DesiredStatus::Running, Observed::Reported(s)) => s.status == VmStatus::Running,
        (DesiredStatus::Paused, Observed::Reported(s)) => s.status == VmStatus::Paused,
        (DesiredStatus::Stopped, Observed::Absent) => true,
        (DesiredStatus::Stopped, Observed::Reported(s)) => !s.status.is_live(),
        _ => false,
    }
}

#[derive(Debug, Default)]
pub struct Reconciler {
    records: HashMap<Uuid, VmRecord>,
    observed: HashMap<Uuid, Observed>,
    inflight: HashMap<Uuid, Inflight>,
    /// Cleanup commands for agents that lost a VM through reassignment.
    held: HashMap<AgentId, Vec<CommandDispatch>>,
    online: HashSet<AgentId>,
    retries: HashMap<Uuid, RetryState>,
    /// Pending restart requests, keyed to the request order at the time they were made.
    restarts: HashMap<Uuid, u64>,
    seq: u64,
    policy: RetryPolicy,
}

impl Reconciler {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            ..Self::default()
        }
    }

    pub fn record(&self, vm_id: &Uuid) -> Option<&VmRecord> {
        self.records.get(vm_id)
    }

    pub fn records(&self) -> impl Iterator<Item = &VmRecord> {
        self.records.values()
    }

    pub fn observed(&self, vm_id: &Uuid) -> Observed {
        self.observed.get(vm_id).cloned().unwrap_or(Observed::Unknown)
    }

    /// Command currently awaiting a result for `vm_id`, delivered or held.
    pub fn inflight_command(&self, vm_id: &Uuid) -> Option<&CommandDispatch> {
        self.inflight.get(vm_id).map(|f| &f.command)
    }

    pub fn retry_failures(&self, vm_id: &Uuid) -> u32 {
        self.retries.get(vm_id).map_or(0, |r| r.failures)
    }

    pub fn is_online(&self, agent_id: &str) -> bool {
        self.online.contains(agent_id)
    }

    /// VMs waiting for placement.
    pub fn unassigned(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .records
            .values()
            .filter(|r| r.agent_id.is_none() && !r.deleted)
            .map(VmRecord::vm_id)
            .collect();
        ids.sort();
        ids
    }

    pub fn vms_on(&self, agent_id: &str) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self
            .records
            .values()
            .filter(|r| r.agent_id.as_deref() == Some(agent_id))
            .map(VmRecord::vm_id)
            .collect();
        ids.sort();
        ids
    }

    /// Insert or replace a record and reconcile it.
    pub fn upsert(&mut self, record: VmRecord, now: Instant) -> Vec<Dispatch> {
        let vm_id = record.vm_id();
        self.observed.entry(vm_id).or_insert(Observed::Unknown);
        self.records.insert(vm_id, record);
        self.reconcile_vm(vm_id, now)
    }

    pub fn set_desired(&mut self, vm_id: Uuid, desired: DesiredStatus, now: Instant) -> OrchestratorResult<Vec<Dispatch>> {
        let record = self.live_record_mut(vm_id)?;
        record.desired = desired;
        record.updated_at = Utc::now();
        self.retries.remove(&vm_id);
        if desired != DesiredStatus::Running {
            self.restarts.remove(&vm_id);
        }
        Ok(self.reconcile_vm(vm_id, now))
    }

    /// Replace the spec. A running instance picks it up at its next (re)start.
    pub fn update_spec(
        &mut self,
        spec: VmSpec,
        name: Option<String>,
        description: Option<String>,
        now: Instant,
    ) -> OrchestratorResult<Vec<Dispatch>> {
        let vm_id = spec.id;
        let record = self.live_record_mut(vm_id)?;
        record.spec = spec;
        if let Some(name) = name {
            record.name = name;
        }
        if let Some(description) = description {
            record.description = description;
        }
        record.updated_at = Utc::now();
        self.retries.remove(&vm_id);
        Ok(self.reconcile_vm(vm_id, now))
    }

    /// Cycle the VM once and keep it running.
    pub fn request_restart(&mut self, vm_id: Uuid, now: Instant) -> OrchestratorResult<Vec<Dispatch>> {
        let record = self.live_record_mut(vm_id)?;
        record.desired = DesiredStatus::Running;
        record.updated_at = Utc::now();
        self.retries.remove(&vm_id);
        self.seq += 1;
        self.restarts.insert(vm_id, self.seq);
        Ok(self.reconcile_vm(vm_id, now))
    }

    /// Tear the VM down on its agent, then forget it.
    pub fn mark_deleted(&mut self, vm_id: Uuid, now: Instant) -> OrchestratorResult<Vec<Dispatch>> {
        let record = self
            .records
            .get_mut(&vm_id)
            .ok_or(OrchestratorError::NotFound(vm_id))?;
        record.deleted = true;
        record.updated_at = Utc::now();
        self.retries.remove(&vm_id);
        self.restarts.remove(&vm_id);
        Ok(self.reconcile_vm(vm_id, now))
    }

    /// Place an unassigned VM on `agent_id`.
    pub fn assign(&mut self, vm_id: Uuid, agent_id: AgentId, now: Instant) -> OrchestratorResult<Vec<Dispatch>> {
        let record = self.live_record_mut(vm_id)?;
        if let Some(current) = &record.agent_id {
            return Err(OrchestratorError::Validation(format!(
                "VM {vm_id} is already assigned to agent {current}"
            )));
        }
        info!(vm_id = %vm_id, agent_id = %agent_id, "VM assigned");
        record.agent_id = Some(agent_id);
        self.observed.insert(vm_id, Observed::Unknown);
        Ok(self.reconcile_vm(vm_id, now))
    }

    /// Move a VM to another agent. The previous owner is told to delete its copy.
    pub fn reassign(&mut self, vm_id: Uuid, agent_id: AgentId, now: Instant) -> OrchestratorResult<Vec<Dispatch>> {
        let record = self.live_record_mut(vm_id)?;
        let previous = record.agent_id.replace(agent_id.clone());
        record.updated_at = Utc::now();

        let mut out = Vec::new();
        if let Some(previous) = previous.filter(|p| *p != agent_id) {
            info!(vm_id = %vm_id, from = %previous, to = %agent_id, "VM reassigned");
            self.inflight.remove(&vm_id);
            let cleanup = CommandDispatch::new(vm_id, CommandAction::Delete);
            if self.online.contains(&previous) {
                metrics::record_dispatch(CommandKind::Delete.as_str(), "sent");
                out.push(Dispatch {
                    agent_id: previous,
                    command: cleanup,
                });
            } else {
                metrics::record_dispatch(CommandKind::Delete.as_str(), "held");
                self.held.entry(previous).or_default().push(cleanup);
            }
        }

        self.observed.insert(vm_id, Observed::Unknown);
        self.retries.remove(&vm_id);
        out.extend(self.reconcile_vm(vm_id, now));
        Ok(out)
    }

    /// A channel to `agent_id` has been established (first time or after a drop).
    ///
    /// Everything previously reported by the agent is forgotten; held commands
    /// go out now.
    pub fn agent_online(&mut self, agent_id: &str, now: Instant) -> Vec<Dispatch> {
        self.online.insert(agent_id.to_string());
        let vms = self.vms_on(agent_id);
        for vm_id in &vms {
            self.observed.insert(*vm_id, Observed::Unknown);
        }

        let mut out = self.release_held(agent_id);
        for vm_id in vms {
            out.extend(self.reconcile_vm(vm_id, now));
        }
        out
    }

    /// Hand out everything held for `agent_id` if it is online.
    pub fn release_held(&mut self, agent_id: &str) -> Vec<Dispatch> {
        if !self.online.contains(agent_id) {
            return Vec::new();
        }
        let mut out: Vec<Dispatch> = self
            .held
            .remove(agent_id)
            .unwrap_or_default()
            .into_iter()
            .map(|command| Dispatch {
                agent_id: agent_id.to_string(),
                command,
            })
            .collect();

        let mut released: Vec<&mut Inflight> = self
            .inflight
            .values_mut()
            .filter(|f| !f.sent && f.agent_id == agent_id)
            .collect();
        released.sort_by_key(|f| f.command.vm_id);
        for flight in released {
            flight.sent = true;
            metrics::record_dispatch(flight.kind.as_str(), "released");
            out.push(Dispatch {
                agent_id: agent_id.to_string(),
                command: flight.command.clone(),
            });
        }
        out
    }

    /// The agent's channel is gone or its heartbeat timed out.
    ///
    /// Its VMs become state-unknown; delivered commands are written off since
    /// their results can no longer arrive. Held commands stay held.
    pub fn agent_offline(&mut self, agent_id: &str) {
        if !self.online.remove(agent_id) {
            return;
        }
        for vm_id in self.vms_on(agent_id) {
            self.observed.insert(vm_id, Observed::Unknown);
            if self.inflight.get(&vm_id).is_some_and(|f| f.sent) {
                self.inflight.remove(&vm_id);
            }
        }
    }

    /// Put a command back on hold after its delivery failed.
    pub fn hold(&mut self, dispatch: Dispatch) {
        let vm_id = dispatch.command.vm_id;
        match self.inflight.get_mut(&vm_id) {
            Some(flight) if flight.command.command_id == dispatch.command.command_id => {
                flight.sent = false;
            }
            _ => self.held.entry(dispatch.agent_id).or_default().push(dispatch.command),
        }
    }

    /// Apply a batch of reported states from `agent_id`.
    ///
    /// Reports for VMs the agent does not own are ignored, as are reports older
    /// than what is already known. Re-applying a batch changes nothing.
    pub fn apply_state_update(&mut self, agent_id: &str, update: &StateUpdate, now: Instant) -> Vec<Dispatch> {
        let mut touched = Vec::new();

        for state in &update.states {
            let vm_id = state.vm_id;
            let Some(record) = self.records.get(&vm_id) else {
                debug!(vm_id = %vm_id, agent_id, "State report for unknown VM");
                continue;
            };
            if record.agent_id.as_deref() != Some(agent_id) {
                debug!(vm_id = %vm_id, agent_id, "State report from non-owning agent");
                continue;
            }
            if let Some(Observed::Reported(current)) = self.observed.get(&vm_id) {
                if current == state || state.last_transition < current.last_transition {
                    continue;
                }
            }

            let desired = record.desired;
            let unexpected_failure = state.status == VmStatus::Failed
                && desired != DesiredStatus::Stopped
                && !record.deleted
                && !self.inflight.contains_key(&vm_id);

            let observed = Observed::Reported(state.clone());
            if converged(desired, &observed) {
                self.retries.remove(&vm_id);
            }
            self.observed.insert(vm_id, observed);
            if unexpected_failure {
                warn!(vm_id = %vm_id, agent_id, "VM failed without a pending command");
                self.charge_failure(vm_id, now);
            }
            touched.push(vm_id);
        }

        if update.full_snapshot {
            let reported: HashSet<Uuid> = update.states.iter().map(|s| s.vm_id).collect();
            for vm_id in self.vms_on(agent_id) {
                if !reported.contains(&vm_id) {
                    self.observed.insert(vm_id, Observed::Absent);
                    touched.push(vm_id);
                }
            }
        }

        touched.sort();
        touched.dedup();
        touched
            .into_iter()
            .flat_map(|vm_id| self.reconcile_vm(vm_id, now))
            .collect()
    }

    /// Settle the in-flight command `result` answers.
    pub fn apply_command_result(&mut self, agent_id: &str, result: &CommandResult, now: Instant) -> Vec<Dispatch> {
        let vm_id = result.vm_id;
        let matches = self
            .inflight
            .get(&vm_id)
            .is_some_and(|f| f.command.command_id == result.command_id && f.agent_id == agent_id);
        if !matches {
            debug!(vm_id = %vm_id, command_id = %result.command_id, agent_id, "Result for untracked command");
            return Vec::new();
        }
        let Some(flight) = self.inflight.remove(&vm_id) else {
            return Vec::new();
        };
        let elapsed_ms = u64::try_from(flight.issued_at.elapsed().as_millis()).unwrap_or(u64::MAX);

        match &result.outcome {
            CommandOutcome::Completed { status } => {
                metrics::record_dispatch(flight.kind.as_str(), "completed");
                debug!(vm_id = %vm_id, command = flight.kind.as_str(), status = %status, elapsed_ms, "Command completed");
                if flight.kind == CommandKind::Delete {
                    if self.records.get(&vm_id).is_some_and(|r| r.deleted) {
                        self.forget(vm_id);
                        return Vec::new();
                    }
                    self.observed.insert(vm_id, Observed::Absent);
                } else {
                    // Only a boot built after the request carries its spec.
                    let satisfied = matches!(flight.kind, CommandKind::Start | CommandKind::Restart)
                        && self.restarts.get(&vm_id).is_some_and(|requested| flight.seq > *requested);
                    if satisfied {
                        self.restarts.remove(&vm_id);
                    }
                    self.assume_status(vm_id, *status);
                }
            }
            CommandOutcome::Rejected { kind, message } => {
                metrics::record_dispatch(flight.kind.as_str(), "rejected");
                match kind {
                    RejectionKind::StaleCommand
                    | RejectionKind::InvalidTransition
                    | RejectionKind::InvalidState => {
                        info!(vm_id = %vm_id, command = flight.kind.as_str(), reason = kind.as_str(), "Command no longer applicable");
                    }
                    RejectionKind::NotFound => {
                        self.observed.insert(vm_id, Observed::Absent);
                    }
                    _ if flight.superseded => {
                        debug!(vm_id = %vm_id, command = flight.kind.as_str(), "Superseded command failed");
                    }
                    _ => {
                        warn!(vm_id = %vm_id, command = flight.kind.as_str(), reason = kind.as_str(), message = %message, "Command failed");
                        self.charge_failure(vm_id, now);
                    }
                }
            }
        }

        self.reconcile_vm(vm_id, now)
    }

    /// Periodic pass: re-offers held commands and issues those whose backoff elapsed.
    pub fn tick(&mut self, now: Instant) -> Vec<Dispatch> {
        let mut agents: Vec<AgentId> = self.online.iter().cloned().collect();
        agents.sort();
        let mut out: Vec<Dispatch> = agents
            .iter()
            .flat_map(|agent_id| self.release_held(agent_id))
            .collect();

        let mut ids: Vec<Uuid> = self.records.keys().copied().collect();
        ids.sort();
        for vm_id in ids {
            out.extend(self.reconcile_vm(vm_id, now));
        }
        out
    }

    fn live_record_mut(&mut self, vm_id: Uuid) -> OrchestratorResult<&mut VmRecord> {
        self.records
            .get_mut(&vm_id)
            .filter(|r| !r.deleted)
            .ok_or(OrchestratorError::NotFound(vm_id))
    }

    /// A completed command vouches for `status` until the agent's own report lands.
    fn assume_status(&mut self, vm_id: Uuid, status: VmStatus) {
        if matches!(self.observed.get(&vm_id), Some(Observed::Reported(_))) {
            return;
        }
        let mut state = VmRuntimeState::new(vm_id);
        state.status = status;
        state.last_transition = DateTime::<Utc>::MIN_UTC;
        self.observed.insert(vm_id, Observed::Reported(state));
    }

    fn charge_failure(&mut self, vm_id: Uuid, now: Instant) {
        let failures = self.retry_failures(&vm_id) + 1;
        let delay = self.policy.delay_for(failures);
        self.retries.insert(
            vm_id,
            RetryState {
                failures,
                not_before: now + delay,
            },
        );
        if failures >= self.policy.max_attempts {
            warn!(vm_id = %vm_id, failures, "Retry budget exhausted; waiting for a desired-state change");
        } else {
            debug!(vm_id = %vm_id, failures, delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX), "Retry scheduled");
        }
    }

    fn forget(&mut self, vm_id: Uuid) {
        info!(vm_id = %vm_id, "VM record removed");
        self.records.remove(&vm_id);
        self.observed.remove(&vm_id);
        self.inflight.remove(&vm_id);
        self.retries.remove(&vm_id);
        self.restarts.remove(&vm_id);
    }

    fn reconcile_vm(&mut self, vm_id: Uuid, now: Instant) -> Vec<Dispatch> {
        let Some(record) = self.records.get(&vm_id) else {
            return Vec::new();
        };
        let Some(agent_id) = record.agent_id.clone() else {
            if record.deleted {
                self.forget(vm_id);
            }
            return Vec::new();
        };
        let observed = self.observed(&vm_id);
        let wanted = plan(record, &observed, self.restarts.contains_key(&vm_id));

        if let Some(flight) = self.inflight.get_mut(&vm_id) {
            if Some(flight.kind) == wanted {
                flight.superseded = false;
                return Vec::new();
            }
            if flight.sent {
                if !flight.superseded {
                    flight.superseded = true;
                    metrics::record_dispatch(flight.kind.as_str(), "superseded");
                    info!(vm_id = %vm_id, command = flight.kind.as_str(), "In-flight command superseded");
                }
                return Vec::new();
            }
            metrics::record_dispatch(flight.kind.as_str(), "replaced");
            self.inflight.remove(&vm_id);
        }

        let Some(kind) = wanted else {
            if record.deleted && observed == Observed::Absent {
                self.forget(vm_id);
            }
            return Vec::new();
        };

        if let Some(retry) = self.retries.get(&vm_id) {
            if retry.failures >= self.policy.max_attempts || now < retry.not_before {
                return Vec::new();
            }
        }

        let command = CommandDispatch::new(vm_id, kind.action(&record.spec));
        let online = self.online.contains(&agent_id);
        self.seq += 1;
        self.inflight.insert(
            vm_id,
            Inflight {
                command: command.clone(),
                kind,
                agent_id: agent_id.clone(),
                issued_at: now,
                seq: self.seq,
                sent: online,
                superseded: false,
            },
        );

        if online {
            metrics::record_dispatch(kind.as_str(), "sent");
            debug!(vm_id = %vm_id, agent_id = %agent_id, command = kind.as_str(), "Dispatching command");
            vec![Dispatch { agent_id, command }]
        } else {
            metrics::record_dispatch(kind.as_str(), "held");
            debug!(vm_id = %vm_id, agent_id = %agent_id, command = kind.as_str(), "Agent offline; command held");
            Vec::new()
        }
    }
}
