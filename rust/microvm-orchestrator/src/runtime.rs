//! Agent runtime: owns every VM state machine on this host.
//!
//! Commands for the same VM run strictly one after another in arrival order
//! (one queue and worker per VM); each machine additionally sits behind a
//! `tokio::sync::Mutex` so the drift monitor never races a transition.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::channel::protocol::{CommandAction, CommandDispatch, CommandResult};
use crate::config::Config;
use crate::domain::{AgentId, AgentRegistration, VmRuntimeState, VmSpec, VmStatus, PROTOCOL_VERSION};
use crate::driver::HypervisorDriver;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::resources::HostResources;
use crate::vm::{LifecycleTimings, VmMachine};

const DEFAULT_UPDATE_BUFFER: usize = 256;

type Job = (CommandDispatch, mpsc::Sender<CommandResult>);

#[derive(Debug, Clone)]
pub struct RuntimeSettings {
    pub agent_id: AgentId,
    pub hostname: String,
    pub timings: LifecycleTimings,
    /// Capacity of the state update queue feeding the control channel.
    pub update_buffer: usize,
}

impl RuntimeSettings {
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        let agent_id = agent_id.into();
        Self {
            hostname: agent_id.clone(),
            agent_id,
            timings: LifecycleTimings::default(),
            update_buffer: DEFAULT_UPDATE_BUFFER,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self {
            agent_id: config.agent.agent_id.clone(),
            hostname: config.agent.hostname.clone(),
            timings: LifecycleTimings::from_config(&config.firecracker),
            update_buffer: config.agent.outbound_buffer,
        }
    }
}

#[derive(Debug)]
struct VmSlot {
    machine: tokio::sync::Mutex<VmMachine>,
    published: Arc<RwLock<VmRuntimeState>>,
}

#[derive(Debug)]
pub struct AgentRuntime {
    settings: RuntimeSettings,
    driver: Arc<dyn HypervisorDriver>,
    host: HostResources,
    slots: RwLock<HashMap<Uuid, Arc<VmSlot>>>,
    queues: Mutex<HashMap<Uuid, mpsc::UnboundedSender<Job>>>,
    updates: mpsc::Sender<VmRuntimeState>,
}

impl AgentRuntime {
    /// Build a runtime; the receiver yields every VM state change in order.
    pub fn new(
        settings: RuntimeSettings,
        host: HostResources,
        driver: Arc<dyn HypervisorDriver>,
    ) -> (Self, mpsc::Receiver<VmRuntimeState>) {
        let (updates, rx) = mpsc::channel(settings.update_buffer.max(1));
        info!(
            agent_id = %settings.agent_id,
            backend = driver.backend(),
            capacity = %host.total(),
            "Agent runtime initialized"
        );
        let runtime = Self {
            settings,
            driver,
            host,
            slots: RwLock::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            updates,
        };
        (runtime, rx)
    }

    pub fn agent_id(&self) -> &str {
        &self.settings.agent_id
    }

    pub fn host(&self) -> &HostResources {
        &self.host
    }

    /// Identity and current capacity, as sent at registration and with heartbeats.
    pub fn registration(&self) -> AgentRegistration {
        AgentRegistration {
            agent_id: self.settings.agent_id.clone(),
            hostname: self.settings.hostname.clone(),
            capabilities: vec![self.driver.backend().to_string()],
            total: self.host.total(),
            available: self.host.available(),
            protocol_version: PROTOCOL_VERSION,
        }
    }

    /// Current state of every VM on this host, ordered by id.
    pub fn snapshot(&self) -> Vec<VmRuntimeState> {
        let mut states: Vec<VmRuntimeState> = self
            .slots
            .read()
            .values()
            .map(|slot| slot.published.read().clone())
            .collect();
        states.sort_by_key(|s| s.vm_id);
        states
    }

    pub fn vm_state(&self, vm_id: &Uuid) -> Option<VmRuntimeState> {
        self.slots
            .read()
            .get(vm_id)
            .map(|slot| slot.published.read().clone())
    }

    /// Queue `command` behind earlier commands for the same VM; the result goes to `reply`.
    pub fn enqueue(self: &Arc<Self>, command: CommandDispatch, reply: mpsc::Sender<CommandResult>) {
        let vm_id = command.vm_id;
        let mut queues = self.queues.lock();
        let job = match queues.get(&vm_id) {
            Some(queue) => match queue.send((command, reply)) {
                Ok(()) => return,
                Err(mpsc::error::SendError(job)) => job,
            },
            None => (command, reply),
        };

        let (queue, jobs) = mpsc::unbounded_channel();
        // The receiver is alive; it is moved into the worker below.
        let _ = queue.send(job);
        queues.insert(vm_id, queue);
        tokio::spawn(Arc::clone(self).work_queue(jobs));
    }

    async fn work_queue(self: Arc<Self>, mut jobs: mpsc::UnboundedReceiver<Job>) {
        while let Some((command, reply)) = jobs.recv().await {
            let result = self.handle_command(command).await;
            if reply.send(result).await.is_err() {
                debug!("Command result dropped, control channel gone");
            }
        }
    }

    /// Execute one command to completion and report how it ended.
    pub async fn handle_command(&self, command: CommandDispatch) -> CommandResult {
        info!(
            command_id = %command.command_id,
            vm_id = %command.vm_id,
            action = command.action.as_str(),
            "Executing command"
        );
        match self.execute(&command).await {
            Ok(status) => CommandResult::completed(&command, status),
            Err(e) => {
                warn!(
                    command_id = %command.command_id,
                    vm_id = %command.vm_id,
                    action = command.action.as_str(),
                    error = %e,
                    "Command rejected"
                );
                CommandResult::rejected(&command, &e)
            }
        }
    }

    async fn execute(&self, command: &CommandDispatch) -> OrchestratorResult<VmStatus> {
        match &command.action {
            CommandAction::Start { spec } => {
                check_spec_target(command, spec)?;
                self.start_vm(spec.clone()).await
            }
            CommandAction::Stop => self.stop_vm(command.vm_id).await,
            CommandAction::Restart { spec } => {
                check_spec_target(command, spec)?;
                self.restart_vm(command, spec.clone()).await
            }
            CommandAction::Pause => self.pause_vm(command.vm_id).await,
            CommandAction::Resume => self.resume_vm(command.vm_id).await,
            CommandAction::Delete => self.delete_vm(command.vm_id).await,
        }
    }

    fn slot(&self, vm_id: &Uuid) -> Option<Arc<VmSlot>> {
        self.slots.read().get(vm_id).cloned()
    }

    fn slot_or_insert(&self, spec: &VmSpec) -> Arc<VmSlot> {
        let mut slots = self.slots.write();
        let slot = slots.entry(spec.id).or_insert_with(|| {
            let machine = VmMachine::new(
                spec.clone(),
                Arc::clone(&self.driver),
                self.settings.timings,
                self.updates.clone(),
            );
            Arc::new(VmSlot {
                published: machine.published(),
                machine: tokio::sync::Mutex::new(machine),
            })
        });
        Arc::clone(slot)
    }

    fn forget(&self, vm_id: &Uuid, slot: &Arc<VmSlot>) {
        let mut slots = self.slots.write();
        if slots.get(vm_id).is_some_and(|s| Arc::ptr_eq(s, slot)) {
            slots.remove(vm_id);
        }
    }

    fn settle(&self, vm_id: &Uuid, status: VmStatus) {
        if status.is_terminal() && self.host.release(vm_id).is_some() {
            debug!(vm_id = %vm_id, %status, "Released resources of ended VM");
        }
    }

    /// Admit and boot `spec`. A live VM is left alone; an ended one gets a fresh instance.
    pub async fn start_vm(&self, spec: VmSpec) -> OrchestratorResult<VmStatus> {
        spec.validate()?;
        let vm_id = spec.id;
        let slot = self.slot_or_insert(&spec);
        let mut machine = slot.machine.lock().await;

        let status = machine.status();
        if status.is_live() {
            debug!(vm_id = %vm_id, %status, "VM already live, start is a no-op");
            return Ok(status);
        }
        if let Err(e) = self.host.try_reserve(vm_id, spec.resources()) {
            if status == VmStatus::Created {
                self.forget(&vm_id, &slot);
            }
            return Err(e);
        }
        if status.is_terminal() || machine.spec() != &spec {
            *machine = machine.renewed(spec);
        }

        let result = machine.start().await;
        self.settle(&vm_id, machine.status());
        result
    }

    pub async fn stop_vm(&self, vm_id: Uuid) -> OrchestratorResult<VmStatus> {
        let slot = self.slot(&vm_id).ok_or(OrchestratorError::NotFound(vm_id))?;
        let mut machine = slot.machine.lock().await;
        if machine.status().is_terminal() {
            return Ok(machine.status());
        }
        let result = machine.stop().await;
        self.settle(&vm_id, machine.status());
        result
    }

    /// Restart a running VM, picking up `spec` for the new boot.
    async fn restart_vm(&self, command: &CommandDispatch, spec: VmSpec) -> OrchestratorResult<VmStatus> {
        let vm_id = command.vm_id;
        let slot = self.slot(&vm_id).ok_or(OrchestratorError::StaleCommand {
            command_id: command.command_id,
        })?;
        let mut machine = slot.machine.lock().await;

        let status = machine.status();
        if status == VmStatus::Created || status.is_terminal() {
            // The VM stopped before this restart got its turn.
            return Err(OrchestratorError::StaleCommand {
                command_id: command.command_id,
            });
        }
        if status == VmStatus::Running && machine.spec() != &spec {
            spec.validate()?;
            if spec.resources() != machine.spec().resources() {
                self.host.resize(vm_id, spec.resources())?;
            }
            machine.replace_spec(spec)?;
        }

        let result = machine.restart().await;
        self.settle(&vm_id, machine.status());
        result
    }

    pub async fn pause_vm(&self, vm_id: Uuid) -> OrchestratorResult<VmStatus> {
        let slot = self.slot(&vm_id).ok_or(OrchestratorError::NotFound(vm_id))?;
        let mut machine = slot.machine.lock().await;
        let result = machine.pause().await;
        self.settle(&vm_id, machine.status());
        result
    }

    pub async fn resume_vm(&self, vm_id: Uuid) -> OrchestratorResult<VmStatus> {
        let slot = self.slot(&vm_id).ok_or(OrchestratorError::NotFound(vm_id))?;
        let mut machine = slot.machine.lock().await;
        let result = machine.resume().await;
        self.settle(&vm_id, machine.status());
        result
    }

    /// Stop the VM if it is live and drop it from this host.
    pub async fn delete_vm(&self, vm_id: Uuid) -> OrchestratorResult<VmStatus> {
        let Some(slot) = self.slot(&vm_id) else {
            return Ok(VmStatus::Shutdown);
        };
        let mut machine = slot.machine.lock().await;
        if matches!(machine.status(), VmStatus::Running | VmStatus::Paused) {
            if let Err(e) = machine.stop().await {
                warn!(vm_id = %vm_id, error = %e, "Stop during delete failed");
            }
        }
        let status = machine.status();

        self.host.release(&vm_id);
        self.forget(&vm_id, &slot);
        self.queues.lock().remove(&vm_id);
        info!(vm_id = %vm_id, %status, "VM deleted from host");
        Ok(status)
    }

    /// Check every settled VM once; VMs busy with a transition are skipped.
    pub async fn monitor_once(&self) {
        let slots: Vec<(Uuid, Arc<VmSlot>)> = self
            .slots
            .read()
            .iter()
            .map(|(id, slot)| (*id, Arc::clone(slot)))
            .collect();

        for (vm_id, slot) in slots {
            let Ok(mut machine) = slot.machine.try_lock() else {
                continue;
            };
            if let Err(e) = machine.observe().await {
                debug!(vm_id = %vm_id, error = %e, "Observation failed");
            }
            self.settle(&vm_id, machine.status());
        }
    }

    pub async fn run_monitor(self: Arc<Self>, interval: Duration, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = ticker.tick() => self.monitor_once().await,
                () = shutdown.cancelled() => {
                    debug!("Drift monitor stopped");
                    return;
                }
            }
        }
    }
}

fn check_spec_target(command: &CommandDispatch, spec: &VmSpec) -> OrchestratorResult<()> {
    if spec.id != command.vm_id {
        return Err(OrchestratorError::Validation(format!(
            "spec {} does not match VM {}",
            spec.id, command.vm_id
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Resources;
    use crate::driver::SimulatedDriver;

    fn runtime(capacity: Resources) -> (Arc<AgentRuntime>, Arc<SimulatedDriver>, mpsc::Receiver<VmRuntimeState>) {
        let driver = Arc::new(SimulatedDriver::default());
        let mut settings = RuntimeSettings::new("agent-test");
        settings.timings.poll_interval = Duration::from_millis(5);
        settings.timings.stop_grace = Duration::from_millis(50);
        let (rt, rx) = AgentRuntime::new(settings, HostResources::new(capacity), Arc::clone(&driver) as _);
        (Arc::new(rt), driver, rx)
    }

    fn spec(cpu: u32, mem: u64) -> VmSpec {
        VmSpec::new(Uuid::new_v4(), cpu, mem, 1024, "alpine")
    }

    fn start(spec: &VmSpec) -> CommandDispatch {
        CommandDispatch::new(spec.id, CommandAction::Start { spec: spec.clone() })
    }

    #[tokio::test]
    async fn test_start_reserves_and_stop_releases() {
        let (rt, _driver, _rx) = runtime(Resources::new(4, 4096, 10_000));
        let vm = spec(2, 1024);

        let result = rt.handle_command(start(&vm)).await;
        assert!(result.is_completed());
        assert_eq!(rt.host().available(), Resources::new(2, 3072, 8976));

        let result = rt.handle_command(CommandDispatch::new(vm.id, CommandAction::Stop)).await;
        assert!(result.is_completed());
        assert_eq!(rt.host().available(), rt.host().total());
        assert_eq!(rt.vm_state(&vm.id).map(|s| s.status), Some(VmStatus::Shutdown));
    }

    #[tokio::test]
    async fn test_insufficient_resources_rejected_without_state() {
        let (rt, driver, _rx) = runtime(Resources::new(1, 512, 10_000));
        let vm = spec(2, 1024);

        let result = rt.handle_command(start(&vm)).await;
        assert!(matches!(
            result.outcome,
            crate::channel::protocol::CommandOutcome::Rejected {
                kind: crate::error::RejectionKind::InsufficientResources,
                ..
            }
        ));
        assert!(rt.snapshot().is_empty());
        assert_eq!(driver.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_boot_releases_resources() {
        let (rt, driver, _rx) = runtime(Resources::new(4, 4096, 10_000));
        driver.set_fail_all_launches(true);
        let vm = spec(1, 512);

        let result = rt.handle_command(start(&vm)).await;
        assert!(!result.is_completed());
        assert_eq!(rt.host().available(), rt.host().total());
        assert_eq!(rt.vm_state(&vm.id).map(|s| s.status), Some(VmStatus::Failed));
    }

    #[tokio::test]
    async fn test_start_after_shutdown_uses_fresh_instance() {
        let (rt, driver, _rx) = runtime(Resources::new(4, 4096, 10_000));
        let vm = spec(1, 512);
        rt.start_vm(vm.clone()).await.unwrap();
        rt.stop_vm(vm.id).await.unwrap();

        assert_eq!(rt.start_vm(vm.clone()).await.unwrap(), VmStatus::Running);
        assert_eq!(driver.launch_count(), 2);
        assert_eq!(rt.start_vm(vm.clone()).await.unwrap(), VmStatus::Running);
        assert_eq!(driver.launch_count(), 2);
    }

    #[tokio::test]
    async fn test_restart_of_stopped_vm_is_stale() {
        let (rt, _driver, _rx) = runtime(Resources::new(4, 4096, 10_000));
        let vm = spec(1, 512);
        rt.start_vm(vm.clone()).await.unwrap();
        rt.stop_vm(vm.id).await.unwrap();

        let result = rt
            .handle_command(CommandDispatch::new(vm.id, CommandAction::Restart { spec: vm.clone() }))
            .await;
        assert!(matches!(
            result.outcome,
            crate::channel::protocol::CommandOutcome::Rejected {
                kind: crate::error::RejectionKind::StaleCommand,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_restart_spec_keeps_reservation() {
        let (rt, driver, _rx) = runtime(Resources::new(4, 4096, 10_000));
        let vm = spec(1, 512);
        rt.start_vm(vm.clone()).await.unwrap();
        let held = rt.host().reserved_for(&vm.id);
        let available = rt.host().available();

        let mut bad = vm.clone();
        bad.vcpu_count = 0;
        let result = rt
            .handle_command(CommandDispatch::new(vm.id, CommandAction::Restart { spec: bad }))
            .await;
        assert!(matches!(
            result.outcome,
            crate::channel::protocol::CommandOutcome::Rejected {
                kind: crate::error::RejectionKind::Validation,
                ..
            }
        ));
        assert_eq!(rt.host().reserved_for(&vm.id), held);
        assert_eq!(rt.host().available(), available);
        assert_eq!(rt.vm_state(&vm.id).map(|s| s.status), Some(VmStatus::Running));
        assert_eq!(driver.launch_count(), 1);
    }

    #[tokio::test]
    async fn test_delete_forgets_vm() {
        let (rt, _driver, _rx) = runtime(Resources::new(4, 4096, 10_000));
        let vm = spec(1, 512);
        rt.start_vm(vm.clone()).await.unwrap();

        assert_eq!(rt.delete_vm(vm.id).await.unwrap(), VmStatus::Shutdown);
        assert!(rt.vm_state(&vm.id).is_none());
        assert_eq!(rt.host().available(), rt.host().total());
        assert_eq!(rt.delete_vm(vm.id).await.unwrap(), VmStatus::Shutdown);
    }

    #[tokio::test]
    async fn test_monitor_fails_crashed_vm_and_releases() {
        let (rt, driver, _rx) = runtime(Resources::new(4, 4096, 10_000));
        let vm = spec(1, 512);
        rt.start_vm(vm.clone()).await.unwrap();

        driver.crash(vm.id);
        rt.monitor_once().await;
        assert_eq!(rt.vm_state(&vm.id).map(|s| s.status), Some(VmStatus::Failed));
        assert_eq!(rt.host().available(), rt.host().total());
    }

    #[tokio::test]
    async fn test_enqueue_preserves_order_per_vm() {
        let (rt, _driver, _rx) = runtime(Resources::new(4, 4096, 10_000));
        let vm = spec(1, 512);
        let (tx, mut results) = mpsc::channel(8);

        rt.enqueue(start(&vm), tx.clone());
        rt.enqueue(CommandDispatch::new(vm.id, CommandAction::Pause), tx.clone());
        rt.enqueue(CommandDispatch::new(vm.id, CommandAction::Stop), tx);

        let mut outcomes = Vec::new();
        for _ in 0..3 {
            outcomes.push(results.recv().await.unwrap());
        }
        assert!(outcomes.iter().all(CommandResult::is_completed));
        assert_eq!(rt.vm_state(&vm.id).map(|s| s.status), Some(VmStatus::Shutdown));
    }
}
