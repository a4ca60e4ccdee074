//! Control plane facade: the in-process boundary the CRUD surface calls.
//!
//! Every mutating operation is authorized before the reconciler sees it.
//! Agent channel sessions report into the same structure through the
//! `agent_*` / `apply_*` hooks.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::authz::{AuthorizationGateway, Permission};
use crate::channel::protocol::{CommandResult, ControlMessage, StateUpdate};
use crate::config::Config;
use crate::domain::{AgentId, AgentRegistration, NetworkMode, Resources, VmFailure, VmSpec, VmStatus};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics;
use crate::reconciler::{DesiredStatus, Dispatch, Observed, Reconciler, RetryPolicy, VmRecord};

#[derive(Debug, Clone, Copy)]
pub struct ControlPlaneSettings {
    /// Agents silent for longer than this lose their channel.
    pub heartbeat_timeout: Duration,
    pub retry: RetryPolicy,
}

impl ControlPlaneSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            heartbeat_timeout: config.heartbeat_timeout(),
            retry: RetryPolicy::from_config(&config.control_plane),
        }
    }
}

impl Default for ControlPlaneSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

fn default_desired() -> DesiredStatus {
    DesiredStatus::Running
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateVmRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub vcpu_count: u32,
    pub memory_mib: u64,
    pub disk_mib: u64,
    pub image: String,
    #[serde(default)]
    pub network: NetworkMode,
    #[serde(default)]
    pub kernel_args: Vec<String>,
    #[serde(default = "default_desired")]
    pub desired: DesiredStatus,
    /// Pin to an agent instead of automatic placement.
    #[serde(default)]
    pub agent_id: Option<AgentId>,
}

impl CreateVmRequest {
    fn spec(&self, id: Uuid) -> VmSpec {
        VmSpec::new(id, self.vcpu_count, self.memory_mib, self.disk_mib, self.image.clone())
            .with_network(self.network)
            .with_kernel_args(self.kernel_args.iter().cloned())
    }
}

/// Partial update; `None` keeps the current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UpdateVmRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub vcpu_count: Option<u32>,
    pub memory_mib: Option<u64>,
    pub disk_mib: Option<u64>,
    pub image: Option<String>,
    pub kernel_args: Option<Vec<String>>,
}

impl UpdateVmRequest {
    fn apply(&self, mut spec: VmSpec) -> VmSpec {
        if let Some(v) = self.vcpu_count {
            spec.vcpu_count = v;
        }
        if let Some(v) = self.memory_mib {
            spec.memory_mib = v;
        }
        if let Some(v) = self.disk_mib {
            spec.disk_mib = v;
        }
        if let Some(v) = &self.image {
            spec.image.clone_from(v);
        }
        if let Some(v) = &self.kernel_args {
            spec.kernel_args.clone_from(v);
        }
        spec
    }
}

/// One VM as seen by API callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VmView {
    pub vm_id: Uuid,
    pub name: String,
    pub description: String,
    pub spec: VmSpec,
    pub desired: DesiredStatus,
    pub agent_id: Option<AgentId>,
    /// Last reported status; `None` while the owning agent's view is unknown.
    pub status: Option<VmStatus>,
    pub last_error: Option<VmFailure>,
    pub pending_command: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentView {
    pub agent_id: AgentId,
    pub hostname: String,
    pub online: bool,
    pub total: Resources,
    /// Capacity reported by the agent itself.
    pub available: Resources,
    pub last_seen: DateTime<Utc>,
    pub vm_count: usize,
}

#[derive(Debug)]
struct AgentLink {
    channel_id: Uuid,
    outbound: mpsc::Sender<ControlMessage>,
}

#[derive(Debug)]
struct AgentEntry {
    registration: AgentRegistration,
    last_seen: Instant,
    last_seen_at: DateTime<Utc>,
    link: Option<AgentLink>,
}

#[derive(Debug)]
pub struct ControlPlane {
    settings: ControlPlaneSettings,
    gateway: AuthorizationGateway,
    reconciler: Mutex<Reconciler>,
    agents: RwLock<HashMap<AgentId, AgentEntry>>,
}

impl ControlPlane {
    pub fn new(settings: ControlPlaneSettings, gateway: AuthorizationGateway) -> Self {
        Self {
            reconciler: Mutex::new(Reconciler::new(settings.retry)),
            settings,
            gateway,
            agents: RwLock::new(HashMap::new()),
        }
    }

    // ---- CRUD surface -------------------------------------------------

    #[instrument(skip(self, request), fields(name = %request.name))]
    pub async fn create_vm(&self, subject: &str, request: CreateVmRequest) -> OrchestratorResult<VmView> {
        let vm_id = Uuid::new_v4();
        self.gateway.authorize(subject, Permission::Create, vm_id).await?;

        let spec = request.spec(vm_id);
        spec.validate()?;
        if let Some(agent_id) = &request.agent_id {
            if !self.agents.read().contains_key(agent_id) {
                return Err(OrchestratorError::Validation(format!("unknown agent '{agent_id}'")));
            }
        }

        let record = VmRecord::new(spec, request.name, request.description, request.desired);
        let capacities = self.linked_capacities();
        let dispatches = {
            let mut reconciler = self.reconciler.lock();
            let now = Instant::now();
            let mut out = reconciler.upsert(record, now);
            match request.agent_id {
                Some(agent_id) => out.extend(reconciler.assign(vm_id, agent_id, now)?),
                None => out.extend(place_unassigned(&mut reconciler, &capacities, now)),
            }
            out
        };
        info!(vm_id = %vm_id, subject, "VM created");
        self.deliver(dispatches);
        self.view(vm_id)
    }

    pub async fn update_vm(&self, subject: &str, vm_id: Uuid, request: UpdateVmRequest) -> OrchestratorResult<VmView> {
        self.gateway.authorize(subject, Permission::Update, vm_id).await?;

        let dispatches = {
            let mut reconciler = self.reconciler.lock();
            let current = reconciler
                .record(&vm_id)
                .filter(|r| !r.deleted)
                .ok_or(OrchestratorError::NotFound(vm_id))?;
            let spec = request.apply(current.spec.clone());
            spec.validate()?;
            reconciler.update_spec(spec, request.name, request.description, Instant::now())?
        };
        self.deliver(dispatches);
        self.view(vm_id)
    }

    pub async fn delete_vm(&self, subject: &str, vm_id: Uuid) -> OrchestratorResult<()> {
        self.gateway.authorize(subject, Permission::Delete, vm_id).await?;
        let dispatches = self.reconciler.lock().mark_deleted(vm_id, Instant::now())?;
        info!(vm_id = %vm_id, subject, "VM deletion requested");
        self.deliver(dispatches);
        Ok(())
    }

    pub async fn start_vm(&self, subject: &str, vm_id: Uuid) -> OrchestratorResult<VmView> {
        self.set_desired(subject, Permission::Start, vm_id, DesiredStatus::Running).await
    }

    pub async fn stop_vm(&self, subject: &str, vm_id: Uuid) -> OrchestratorResult<VmView> {
        self.set_desired(subject, Permission::Stop, vm_id, DesiredStatus::Stopped).await
    }

    pub async fn pause_vm(&self, subject: &str, vm_id: Uuid) -> OrchestratorResult<VmView> {
        self.set_desired(subject, Permission::Pause, vm_id, DesiredStatus::Paused).await
    }

    pub async fn resume_vm(&self, subject: &str, vm_id: Uuid) -> OrchestratorResult<VmView> {
        self.set_desired(subject, Permission::Resume, vm_id, DesiredStatus::Running).await
    }

    pub async fn restart_vm(&self, subject: &str, vm_id: Uuid) -> OrchestratorResult<VmView> {
        self.gateway.authorize(subject, Permission::Restart, vm_id).await?;
        let dispatches = self.reconciler.lock().request_restart(vm_id, Instant::now())?;
        self.deliver(dispatches);
        self.view(vm_id)
    }

    /// Move a VM to `agent_id`, e.g. away from a host that is not coming back.
    pub async fn reassign_vm(&self, subject: &str, vm_id: Uuid, agent_id: &str) -> OrchestratorResult<VmView> {
        self.gateway.authorize(subject, Permission::Update, vm_id).await?;
        if !self.agents.read().contains_key(agent_id) {
            return Err(OrchestratorError::Validation(format!("unknown agent '{agent_id}'")));
        }
        let dispatches = self
            .reconciler
            .lock()
            .reassign(vm_id, agent_id.to_string(), Instant::now())?;
        self.deliver(dispatches);
        self.view(vm_id)
    }

    /// Every VM `subject` may read. One failed check fails the listing.
    pub async fn list_vms(&self, subject: &str) -> OrchestratorResult<Vec<VmView>> {
        let mut views: Vec<VmView> = {
            let reconciler = self.reconciler.lock();
            reconciler
                .records()
                .filter(|r| !r.deleted)
                .map(|r| view_of(&reconciler, r))
                .collect()
        };
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.vm_id.cmp(&b.vm_id)));
        self.gateway.filter_readable(subject, views, |v| v.vm_id).await
    }

    pub async fn get_vm(&self, subject: &str, vm_id: Uuid) -> OrchestratorResult<VmView> {
        self.gateway.authorize(subject, Permission::Read, vm_id).await?;
        self.view(vm_id)
    }

    /// Registered agents, ordered by id.
    pub fn agents(&self) -> Vec<AgentView> {
        let counts: HashMap<AgentId, usize> = {
            let reconciler = self.reconciler.lock();
            let mut counts = HashMap::new();
            for record in reconciler.records().filter(|r| !r.deleted) {
                if let Some(agent_id) = &record.agent_id {
                    *counts.entry(agent_id.clone()).or_insert(0) += 1;
                }
            }
            counts
        };

        let mut views: Vec<AgentView> = self
            .agents
            .read()
            .iter()
            .map(|(agent_id, entry)| AgentView {
                agent_id: agent_id.clone(),
                hostname: entry.registration.hostname.clone(),
                online: entry.link.is_some(),
                total: entry.registration.total,
                available: entry.registration.available,
                last_seen: entry.last_seen_at,
                vm_count: counts.get(agent_id).copied().unwrap_or(0),
            })
            .collect();
        views.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        views
    }

    async fn set_desired(
        &self,
        subject: &str,
        permission: Permission,
        vm_id: Uuid,
        desired: DesiredStatus,
    ) -> OrchestratorResult<VmView> {
        self.gateway.authorize(subject, permission, vm_id).await?;
        let dispatches = self
            .reconciler
            .lock()
            .set_desired(vm_id, desired, Instant::now())?;
        debug!(vm_id = %vm_id, desired = desired.as_str(), "Desired state changed");
        self.deliver(dispatches);
        self.view(vm_id)
    }

    fn view(&self, vm_id: Uuid) -> OrchestratorResult<VmView> {
        let reconciler = self.reconciler.lock();
        reconciler
            .record(&vm_id)
            .map(|r| view_of(&reconciler, r))
            .ok_or(OrchestratorError::NotFound(vm_id))
    }

    // ---- Channel hooks ------------------------------------------------

    /// A registered agent got a fresh channel; any previous channel is dropped.
    pub fn agent_connected(
        &self,
        registration: AgentRegistration,
        channel_id: Uuid,
        outbound: mpsc::Sender<ControlMessage>,
    ) {
        let agent_id = registration.agent_id.clone();
        let replaced = {
            let mut agents = self.agents.write();
            let entry = AgentEntry {
                registration,
                last_seen: Instant::now(),
                last_seen_at: Utc::now(),
                link: Some(AgentLink { channel_id, outbound }),
            };
            let previous = agents.insert(agent_id.clone(), entry);
            metrics::set_agents_online(agents.values().filter(|e| e.link.is_some()).count());
            previous.is_some_and(|p| p.link.is_some())
        };
        if replaced {
            info!(agent_id = %agent_id, "Agent re-registered; previous channel dropped");
        }
        info!(agent_id = %agent_id, channel_id = %channel_id, "Agent online");

        let capacities = self.linked_capacities();
        let dispatches = {
            let mut reconciler = self.reconciler.lock();
            let now = Instant::now();
            if replaced {
                reconciler.agent_offline(&agent_id);
            }
            let mut out = reconciler.agent_online(&agent_id, now);
            out.extend(place_unassigned(&mut reconciler, &capacities, now));
            out
        };
        self.deliver(dispatches);
    }

    /// The session for `channel_id` ended. Stale sessions are ignored.
    pub fn agent_disconnected(&self, agent_id: &str, channel_id: Uuid) {
        if !self.drop_link(agent_id, Some(channel_id)) {
            return;
        }
        warn!(agent_id, channel_id = %channel_id, "Agent channel closed");
        self.reconciler.lock().agent_offline(agent_id);
    }

    pub fn agent_heartbeat(&self, agent_id: &str, channel_id: Uuid, registration: Option<AgentRegistration>) {
        let mut agents = self.agents.write();
        let Some(entry) = agents.get_mut(agent_id) else {
            return;
        };
        if entry.link.as_ref().map(|l| l.channel_id) != Some(channel_id) {
            return;
        }
        entry.last_seen = Instant::now();
        entry.last_seen_at = Utc::now();
        if let Some(registration) = registration.filter(|r| r.agent_id == agent_id) {
            entry.registration = registration;
        }
    }

    pub fn apply_state_update(&self, agent_id: &str, channel_id: Uuid, update: &StateUpdate) {
        if !self.is_current(agent_id, channel_id) {
            debug!(agent_id, "State update from superseded channel");
            return;
        }
        let dispatches = self
            .reconciler
            .lock()
            .apply_state_update(agent_id, update, Instant::now());
        self.deliver(dispatches);
    }

    pub fn apply_command_result(&self, agent_id: &str, channel_id: Uuid, result: &CommandResult) {
        if !self.is_current(agent_id, channel_id) {
            debug!(agent_id, "Command result from superseded channel");
            return;
        }
        let dispatches = self
            .reconciler
            .lock()
            .apply_command_result(agent_id, result, Instant::now());
        self.deliver(dispatches);
    }

    /// Expire silent agents, place waiting VMs and retry due commands.
    pub fn sweep(&self, now: Instant) {
        let expired: Vec<AgentId> = self
            .agents
            .read()
            .iter()
            .filter(|(_, e)| {
                e.link.is_some() && now.saturating_duration_since(e.last_seen) > self.settings.heartbeat_timeout
            })
            .map(|(id, _)| id.clone())
            .collect();
        for agent_id in &expired {
            if self.drop_link(agent_id, None) {
                warn!(agent_id = %agent_id, "Agent heartbeat timed out; marked offline");
                self.reconciler.lock().agent_offline(agent_id);
            }
        }

        let capacities = self.linked_capacities();
        let dispatches = {
            let mut reconciler = self.reconciler.lock();
            let mut out = place_unassigned(&mut reconciler, &capacities, now);
            out.extend(reconciler.tick(now));
            out
        };
        self.deliver(dispatches);
    }

    pub async fn run_sweeper(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.sweep(Instant::now()),
                () = shutdown.cancelled() => {
                    debug!("Control plane sweeper stopped");
                    return;
                }
            }
        }
    }

    fn is_current(&self, agent_id: &str, channel_id: Uuid) -> bool {
        self.agents
            .read()
            .get(agent_id)
            .and_then(|e| e.link.as_ref())
            .is_some_and(|l| l.channel_id == channel_id)
    }

    /// Remove the agent's link (only if it is `channel_id`, when given).
    fn drop_link(&self, agent_id: &str, channel_id: Option<Uuid>) -> bool {
        let mut agents = self.agents.write();
        let Some(entry) = agents.get_mut(agent_id) else {
            return false;
        };
        let current = entry.link.as_ref().map(|l| l.channel_id);
        if current.is_none() || (channel_id.is_some() && current != channel_id) {
            return false;
        }
        entry.link = None;
        metrics::set_agents_online(agents.values().filter(|e| e.link.is_some()).count());
        true
    }

    fn linked_capacities(&self) -> Vec<(AgentId, Resources)> {
        let mut capacities: Vec<(AgentId, Resources)> = self
            .agents
            .read()
            .iter()
            .filter(|(_, e)| e.link.is_some())
            .map(|(id, e)| (id.clone(), e.registration.total))
            .collect();
        capacities.sort_by(|a, b| a.0.cmp(&b.0));
        capacities
    }

    /// Write commands to their agents' outbound queues. Anything that cannot be
    /// queued right now stays with the reconciler for the next sweep.
    fn deliver(&self, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            let outbound = self
                .agents
                .read()
                .get(&dispatch.agent_id)
                .and_then(|e| e.link.as_ref())
                .map(|l| l.outbound.clone());
            let Some(outbound) = outbound else {
                self.reconciler.lock().hold(dispatch);
                continue;
            };

            let message = ControlMessage::CommandDispatch(dispatch.command.clone());
            match outbound.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    warn!(agent_id = %dispatch.agent_id, "Agent outbound queue full; command held");
                    self.reconciler.lock().hold(dispatch);
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(agent_id = %dispatch.agent_id, "Agent channel closed; command held");
                    self.reconciler.lock().hold(dispatch);
                }
            }
        }
    }
}

fn view_of(reconciler: &Reconciler, record: &VmRecord) -> VmView {
    let vm_id = record.vm_id();
    let (status, last_error) = match reconciler.observed(&vm_id) {
        Observed::Reported(state) => (Some(state.status), state.last_error),
        Observed::Unknown | Observed::Absent => (None, None),
    };
    VmView {
        vm_id,
        name: record.name.clone(),
        description: record.description.clone(),
        spec: record.spec.clone(),
        desired: record.desired,
        agent_id: record.agent_id.clone(),
        status,
        last_error,
        pending_command: reconciler
            .inflight_command(&vm_id)
            .map(|c| c.action.as_str().to_string()),
        created_at: record.created_at,
        updated_at: record.updated_at,
    }
}

/// Put every unassigned VM on the connected agent with the most free memory
/// that fits it. VMs that fit nowhere wait for the next pass.
fn place_unassigned(reconciler: &mut Reconciler, capacities: &[(AgentId, Resources)], now: Instant) -> Vec<Dispatch> {
    let pending = reconciler.unassigned();
    if pending.is_empty() || capacities.is_empty() {
        return Vec::new();
    }

    let mut free: Vec<(AgentId, Resources)> = capacities
        .iter()
        .map(|(agent_id, total)| {
            let committed = reconciler
                .records()
                .filter(|r| !r.deleted && r.agent_id.as_deref() == Some(agent_id.as_str()))
                .fold(Resources::default(), |acc, r| acc.saturating_add(&r.spec.resources()));
            (agent_id.clone(), total.checked_sub(&committed).unwrap_or_default())
        })
        .collect();

    let mut out = Vec::new();
    for vm_id in pending {
        let Some(needed) = reconciler.record(&vm_id).map(|r| r.spec.resources()) else {
            continue;
        };
        let choice = free
            .iter_mut()
            .filter(|(_, available)| needed.fits_within(available))
            .max_by_key(|(_, available)| available.memory_mib);
        let Some((agent_id, available)) = choice else {
            debug!(vm_id = %vm_id, %needed, "No agent can host VM yet");
            continue;
        };
        *available = available.checked_sub(&needed).unwrap_or_default();
        match reconciler.assign(vm_id, agent_id.clone(), now) {
            Ok(dispatches) => out.extend(dispatches),
            Err(e) => debug!(vm_id = %vm_id, error = %e, "Placement skipped"),
        }
    }
    out
}
