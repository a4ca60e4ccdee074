//! In-process hypervisor simulation.
//!
//! Used when the host has no KVM (`driver: simulated`) and as the driver behind
//! the runtime and channel tests. Fault injection hooks let callers reproduce
//! launch failures, boot hangs, guests that ignore shutdown and crashes.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;
use uuid::Uuid;

use super::{action_allowed, HypervisorConfig, HypervisorDriver, HypervisorObservedState, VmAction};
use crate::config::FirecrackerConfig;
use crate::domain::{InstanceHandle, VmSpec};
use crate::error::{OrchestratorError, OrchestratorResult};

#[derive(Debug, Clone)]
struct SimInstance {
    state: HypervisorObservedState,
    /// State polls left before a started guest reports `Running`.
    boot_polls_left: Option<u32>,
    unreachable: bool,
}

#[derive(Debug, Default)]
struct Faults {
    fail_launch: HashSet<Uuid>,
    fail_all_launches: bool,
    never_boot: bool,
    ignore_stop: bool,
    boot_polls: u32,
    launch_delay: Duration,
}

#[derive(Debug)]
pub struct SimulatedDriver {
    settings: FirecrackerConfig,
    faults: Mutex<Faults>,
    instances: Mutex<HashMap<Uuid, SimInstance>>,
    actions: Mutex<Vec<(Uuid, VmAction)>>,
    launches: AtomicUsize,
    terminations: AtomicUsize,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(FirecrackerConfig::default())
    }
}

impl SimulatedDriver {
    pub fn new(settings: FirecrackerConfig) -> Self {
        Self {
            settings,
            faults: Mutex::new(Faults::default()),
            instances: Mutex::new(HashMap::new()),
            actions: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            terminations: AtomicUsize::new(0),
        }
    }

    pub fn fail_launch_for(&self, vm_id: Uuid) {
        self.faults.lock().fail_launch.insert(vm_id);
    }

    pub fn set_fail_all_launches(&self, fail: bool) {
        self.faults.lock().fail_all_launches = fail;
    }

    /// Started guests never report `Running`.
    pub fn set_never_boot(&self, never: bool) {
        self.faults.lock().never_boot = never;
    }

    /// Guests ignore the graceful stop request.
    pub fn set_ignore_stop(&self, ignore: bool) {
        self.faults.lock().ignore_stop = ignore;
    }

    pub fn set_boot_polls(&self, polls: u32) {
        self.faults.lock().boot_polls = polls;
    }

    pub fn set_launch_delay(&self, delay: Duration) {
        self.faults.lock().launch_delay = delay;
    }

    /// The hypervisor process dies underneath the VM.
    pub fn crash(&self, vm_id: Uuid) {
        if let Some(instance) = self.instances.lock().get_mut(&vm_id) {
            instance.state = HypervisorObservedState::Exited;
        }
    }

    /// The control socket stops answering.
    pub fn make_unreachable(&self, vm_id: Uuid) {
        if let Some(instance) = self.instances.lock().get_mut(&vm_id) {
            instance.unreachable = true;
        }
    }

    pub fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn termination_count(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn actions_for(&self, vm_id: Uuid) -> Vec<VmAction> {
        self.actions
            .lock()
            .iter()
            .filter(|(id, _)| *id == vm_id)
            .map(|(_, action)| *action)
            .collect()
    }

    pub fn instance_state(&self, vm_id: Uuid) -> Option<HypervisorObservedState> {
        self.instances.lock().get(&vm_id).map(|i| i.state)
    }

    fn reachable(&self, vm_id: &Uuid) -> OrchestratorResult<()> {
        match self.instances.lock().get(vm_id) {
            Some(instance) if instance.unreachable => Err(OrchestratorError::HypervisorUnreachable(
                format!("simulated socket for {vm_id} is gone"),
            )),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl HypervisorDriver for SimulatedDriver {
    fn backend(&self) -> &'static str {
        "simulated"
    }

    fn build_configuration(&self, spec: &VmSpec) -> OrchestratorResult<HypervisorConfig> {
        super::build_configuration(spec, &self.settings)
    }

    async fn launch(&self, spec: &VmSpec, _config: &HypervisorConfig) -> OrchestratorResult<InstanceHandle> {
        let (delay, fail) = {
            let faults = self.faults.lock();
            (
                faults.launch_delay,
                faults.fail_all_launches || faults.fail_launch.contains(&spec.id),
            )
        };
        self.launches.fetch_add(1, Ordering::SeqCst);
        if fail {
            return Err(OrchestratorError::LaunchError(format!(
                "simulated launch failure for {}",
                spec.id
            )));
        }

        self.instances.lock().insert(
            spec.id,
            SimInstance {
                state: HypervisorObservedState::NotStarted,
                boot_polls_left: None,
                unreachable: false,
            },
        );
        // The process exists from here on; the delay stands in for socket wait and configuration.
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        debug!(vm_id = %spec.id, "Simulated instance launched");

        Ok(InstanceHandle {
            vm_id: spec.id,
            api_socket: self.settings.socket_dir.join(format!("{}.sock", spec.id)),
            pid: None,
        })
    }

    async fn issue_action(&self, handle: &InstanceHandle, action: VmAction) -> OrchestratorResult<()> {
        self.reachable(&handle.vm_id)?;
        let (never_boot, ignore_stop, boot_polls) = {
            let faults = self.faults.lock();
            (faults.never_boot, faults.ignore_stop, faults.boot_polls)
        };

        let mut instances = self.instances.lock();
        let instance = instances.get_mut(&handle.vm_id).ok_or_else(|| {
            OrchestratorError::HypervisorUnreachable(format!("no simulated instance {}", handle.vm_id))
        })?;
        if instance.state == HypervisorObservedState::Exited {
            return Err(OrchestratorError::HypervisorUnreachable(format!(
                "instance {} has exited",
                handle.vm_id
            )));
        }
        // A booting guest still reports NotStarted but has accepted InstanceStart.
        if action == VmAction::Start && instance.boot_polls_left.is_some() {
            return Err(OrchestratorError::InvalidState {
                action: action.to_string(),
                state: "booting".to_string(),
            });
        }
        if !action_allowed(instance.state, action) {
            return Err(OrchestratorError::InvalidState {
                action: action.to_string(),
                state: instance.state.to_string(),
            });
        }
        self.actions.lock().push((handle.vm_id, action));

        match action {
            VmAction::Start => {
                instance.boot_polls_left = Some(if never_boot { u32::MAX } else { boot_polls });
            }
            VmAction::Stop => {
                if !ignore_stop {
                    instance.state = HypervisorObservedState::Exited;
                }
            }
            VmAction::Pause => instance.state = HypervisorObservedState::Paused,
            VmAction::Resume | VmAction::Reboot => instance.state = HypervisorObservedState::Running,
        }
        Ok(())
    }

    async fn query_state(&self, handle: &InstanceHandle) -> OrchestratorResult<HypervisorObservedState> {
        self.reachable(&handle.vm_id)?;
        let mut instances = self.instances.lock();
        let Some(instance) = instances.get_mut(&handle.vm_id) else {
            return Ok(HypervisorObservedState::Exited);
        };
        if instance.state == HypervisorObservedState::NotStarted {
            match instance.boot_polls_left {
                Some(0) => {
                    instance.state = HypervisorObservedState::Running;
                    instance.boot_polls_left = None;
                }
                Some(u32::MAX) | None => {}
                Some(n) => instance.boot_polls_left = Some(n - 1),
            }
        }
        Ok(instance.state)
    }

    async fn terminate(&self, handle: &InstanceHandle) -> OrchestratorResult<()> {
        self.terminations.fetch_add(1, Ordering::SeqCst);
        if let Some(instance) = self.instances.lock().get_mut(&handle.vm_id) {
            instance.state = HypervisorObservedState::Exited;
            instance.unreachable = false;
        }
        Ok(())
    }

    async fn abort_launch(&self, vm_id: &Uuid) -> OrchestratorResult<()> {
        if self.instances.lock().remove(vm_id).is_some() {
            self.terminations.fetch_add(1, Ordering::SeqCst);
            debug!(vm_id = %vm_id, "Simulated launch aborted");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn launched(driver: &SimulatedDriver) -> InstanceHandle {
        let spec = VmSpec::new(Uuid::new_v4(), 1, 128, 256, "alpine");
        let config = driver.build_configuration(&spec).unwrap();
        driver.launch(&spec, &config).await.unwrap()
    }

    #[tokio::test]
    async fn test_boot_after_polls() {
        let driver = SimulatedDriver::default();
        driver.set_boot_polls(2);
        let handle = launched(&driver).await;

        driver.issue_action(&handle, VmAction::Start).await.unwrap();
        assert_eq!(driver.query_state(&handle).await.unwrap(), HypervisorObservedState::NotStarted);
        assert_eq!(driver.query_state(&handle).await.unwrap(), HypervisorObservedState::NotStarted);
        assert_eq!(driver.query_state(&handle).await.unwrap(), HypervisorObservedState::Running);
    }

    #[tokio::test]
    async fn test_invalid_action_rejected() {
        let driver = SimulatedDriver::default();
        let handle = launched(&driver).await;

        let err = driver.issue_action(&handle, VmAction::Pause).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_shutdown_escalates_when_stop_ignored() {
        let driver = SimulatedDriver::default();
        driver.set_ignore_stop(true);
        let handle = launched(&driver).await;
        driver.issue_action(&handle, VmAction::Start).await.unwrap();
        driver.query_state(&handle).await.unwrap();

        let outcome = driver
            .shutdown(&handle, Duration::from_millis(30), Duration::from_millis(5))
            .await
            .unwrap();
        assert!(outcome.forced);
        assert_eq!(driver.termination_count(), 1);
        assert_eq!(driver.query_state(&handle).await.unwrap(), HypervisorObservedState::Exited);
    }

    #[tokio::test]
    async fn test_abort_launch_removes_instance_once() {
        let driver = SimulatedDriver::default();
        let handle = launched(&driver).await;

        driver.abort_launch(&handle.vm_id).await.unwrap();
        driver.abort_launch(&handle.vm_id).await.unwrap();
        assert_eq!(driver.instance_state(handle.vm_id), None);
        assert_eq!(driver.termination_count(), 1);
    }

    #[tokio::test]
    async fn test_unreachable_instance() {
        let driver = SimulatedDriver::default();
        let handle = launched(&driver).await;
        driver.make_unreachable(handle.vm_id);

        let err = driver.query_state(&handle).await.unwrap_err();
        assert!(matches!(err, OrchestratorError::HypervisorUnreachable(_)));
    }
}
