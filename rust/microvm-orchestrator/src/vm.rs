//! Single VM lifecycle management
//!
//! `next_status` is the transition table; `VmMachine` drives one VM instance
//! through it, calling the hypervisor driver and publishing every status change
//! as a `VmRuntimeState` update.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::FirecrackerConfig;
use crate::domain::{FailureCause, InstanceHandle, VmFailure, VmRuntimeState, VmSpec, VmStatus};
use crate::driver::{HypervisorDriver, HypervisorObservedState, VmAction};
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics::{self, DriverTimer};

/// Extra time allowed for a forced kill after the stop grace period.
const KILL_MARGIN: Duration = Duration::from_secs(5);

/// Inputs to the lifecycle state machine.
///
/// `Start`, `Stop`, `Restart`, `Pause` and `Resume` are requests; the others
/// are driver observations or internal steps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Start,
    Booted,
    Stop,
    Exited,
    Restart,
    /// Second half of a restart: the old instance is gone, boot a new one.
    Relaunch,
    Pause,
    Paused,
    Resume,
    Resumed,
    Fail,
}

impl LifecycleEvent {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Start => "start",
            Self::Booted => "booted",
            Self::Stop => "stop",
            Self::Exited => "exited",
            Self::Restart => "restart",
            Self::Relaunch => "relaunch",
            Self::Pause => "pause",
            Self::Paused => "paused",
            Self::Resume => "resume",
            Self::Resumed => "resumed",
            Self::Fail => "fail",
        }
    }
}

/// The lifecycle transition table. `None` means the event is illegal in `from`.
pub fn next_status(from: VmStatus, event: LifecycleEvent) -> Option<VmStatus> {
    use LifecycleEvent as E;
    use VmStatus as S;

    match (from, event) {
        (S::Created, E::Start) | (S::Stopping, E::Relaunch) => Some(S::Starting),
        (S::Starting, E::Booted) | (S::Resuming, E::Resumed) => Some(S::Running),
        (S::Running | S::Paused, E::Stop) | (S::Running, E::Restart) => Some(S::Stopping),
        (S::Stopping, E::Exited) => Some(S::Shutdown),
        (S::Running, E::Pause) => Some(S::Pausing),
        (S::Pausing, E::Paused) => Some(S::Paused),
        (S::Paused, E::Resume) => Some(S::Resuming),
        (status, E::Fail) if !status.is_terminal() => Some(S::Failed),
        _ => None,
    }
}

/// Deadlines applied to driver calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LifecycleTimings {
    pub launch_timeout: Duration,
    pub boot_timeout: Duration,
    pub stop_grace: Duration,
    pub action_timeout: Duration,
    pub poll_interval: Duration,
}

impl LifecycleTimings {
    pub fn from_config(config: &FirecrackerConfig) -> Self {
        Self {
            launch_timeout: Duration::from_secs(config.launch_timeout_secs),
            boot_timeout: Duration::from_secs(config.boot_timeout_secs),
            stop_grace: Duration::from_secs(config.stop_grace_secs),
            action_timeout: Duration::from_secs(config.action_timeout_secs),
            poll_interval: Duration::from_millis(config.state_poll_interval_ms),
        }
    }

    /// Launch waits for the socket, then issues up to four configuration calls.
    fn launch_bound(&self) -> Duration {
        self.launch_timeout + self.action_timeout * 4
    }

    fn stop_bound(&self) -> Duration {
        self.stop_grace + self.action_timeout * 2 + KILL_MARGIN
    }

    fn kill_bound(&self) -> Duration {
        self.action_timeout + KILL_MARGIN
    }
}

impl Default for LifecycleTimings {
    fn default() -> Self {
        Self::from_config(&FirecrackerConfig::default())
    }
}

async fn bounded<T, F>(limit: Duration, operation: &'static str, call: F) -> OrchestratorResult<T>
where
    F: Future<Output = OrchestratorResult<T>>,
{
    let timer = DriverTimer::new(operation);
    let result = timeout(limit, call)
        .await
        .map_err(|_elapsed| OrchestratorError::timeout(operation, limit))
        .and_then(|r| r);
    timer.finish();
    result
}

/// Poll until the hypervisor reports `target`; `false` if it exited instead.
async fn wait_for(
    driver: &dyn HypervisorDriver,
    handle: &InstanceHandle,
    target: HypervisorObservedState,
    poll_interval: Duration,
) -> OrchestratorResult<bool> {
    loop {
        match driver.query_state(handle).await? {
            state if state == target => return Ok(true),
            HypervisorObservedState::Exited => return Ok(false),
            _ => tokio::time::sleep(poll_interval).await,
        }
    }
}

fn cause_of(error: &OrchestratorError, fallback: FailureCause) -> FailureCause {
    match error {
        OrchestratorError::HypervisorUnreachable(_) => FailureCause::HypervisorUnreachable,
        OrchestratorError::LaunchError(_) => FailureCause::LaunchError,
        OrchestratorError::BootTimeout { .. } => FailureCause::BootTimeout,
        _ => fallback,
    }
}

/// Lifecycle state machine for one VM instance.
///
/// Methods take `&mut self`; the agent runtime wraps each machine in a mutex so
/// at most one transition per VM is in flight.
#[derive(Debug)]
pub struct VmMachine {
    spec: VmSpec,
    state: VmRuntimeState,
    /// Copy of `state` readable without holding the machine.
    published: Arc<RwLock<VmRuntimeState>>,
    driver: Arc<dyn HypervisorDriver>,
    timings: LifecycleTimings,
    updates: mpsc::Sender<VmRuntimeState>,
}

impl VmMachine {
    pub fn new(
        spec: VmSpec,
        driver: Arc<dyn HypervisorDriver>,
        timings: LifecycleTimings,
        updates: mpsc::Sender<VmRuntimeState>,
    ) -> Self {
        let state = VmRuntimeState::new(spec.id);
        let published = Arc::new(RwLock::new(state.clone()));
        Self {
            spec,
            state,
            published,
            driver,
            timings,
            updates,
        }
    }

    /// Fresh instance for `spec` that keeps publishing into an existing slot.
    #[must_use]
    pub fn renewed(&self, spec: VmSpec) -> Self {
        let state = VmRuntimeState::new(spec.id);
        *self.published.write() = state.clone();
        Self {
            spec,
            state,
            published: Arc::clone(&self.published),
            driver: Arc::clone(&self.driver),
            timings: self.timings,
            updates: self.updates.clone(),
        }
    }

    pub fn spec(&self) -> &VmSpec {
        &self.spec
    }

    pub fn state(&self) -> &VmRuntimeState {
        &self.state
    }

    pub fn status(&self) -> VmStatus {
        self.state.status
    }

    pub fn published(&self) -> Arc<RwLock<VmRuntimeState>> {
        Arc::clone(&self.published)
    }

    /// Use `spec` from the next boot on; a running instance keeps its configuration.
    pub fn replace_spec(&mut self, spec: VmSpec) -> OrchestratorResult<()> {
        if spec.id != self.spec.id {
            return Err(OrchestratorError::Validation(format!(
                "spec {} does not belong to VM {}",
                spec.id, self.spec.id
            )));
        }
        spec.validate()?;
        self.spec = spec;
        Ok(())
    }

    /// Created -> Starting -> Running.
    pub async fn start(&mut self) -> OrchestratorResult<VmStatus> {
        self.advance(LifecycleEvent::Start).await?;
        self.boot().await
    }

    /// Running|Paused -> Stopping -> Shutdown, forcing termination after the grace period.
    pub async fn stop(&mut self) -> OrchestratorResult<VmStatus> {
        self.advance(LifecycleEvent::Stop).await?;
        self.halt().await?;
        self.advance(LifecycleEvent::Exited).await?;
        Ok(self.status())
    }

    /// Running -> Stopping -> Starting -> Running without passing through Created.
    pub async fn restart(&mut self) -> OrchestratorResult<VmStatus> {
        self.advance(LifecycleEvent::Restart).await?;
        self.halt().await?;
        self.advance(LifecycleEvent::Relaunch).await?;
        self.boot().await
    }

    pub async fn pause(&mut self) -> OrchestratorResult<VmStatus> {
        self.advance(LifecycleEvent::Pause).await?;
        self.act(
            VmAction::Pause,
            HypervisorObservedState::Paused,
            LifecycleEvent::Paused,
        )
        .await
    }

    pub async fn resume(&mut self) -> OrchestratorResult<VmStatus> {
        self.advance(LifecycleEvent::Resume).await?;
        self.act(
            VmAction::Resume,
            HypervisorObservedState::Running,
            LifecycleEvent::Resumed,
        )
        .await
    }

    /// Compare a settled VM against the hypervisor and fail it if the process is gone.
    pub async fn observe(&mut self) -> OrchestratorResult<VmStatus> {
        if !matches!(self.state.status, VmStatus::Running | VmStatus::Paused) {
            return Ok(self.status());
        }
        let Some(handle) = self.state.instance.clone() else {
            return Ok(self.status());
        };

        let observed = bounded(
            self.timings.action_timeout,
            "query_state",
            self.driver.query_state(&handle),
        )
        .await;
        match observed {
            Ok(HypervisorObservedState::Exited) => {
                warn!(vm_id = %self.spec.id, status = %self.state.status, "Hypervisor exited unexpectedly");
                let err = OrchestratorError::HypervisorUnreachable(format!(
                    "hypervisor for {} exited without a stop request",
                    self.spec.id
                ));
                let _ = self.fail(FailureCause::HypervisorExited, err).await;
            }
            Ok(HypervisorObservedState::Running) if self.state.status == VmStatus::Paused => {
                warn!(vm_id = %self.spec.id, "Hypervisor reports running while VM is paused");
            }
            Ok(HypervisorObservedState::Paused) if self.state.status == VmStatus::Running => {
                warn!(vm_id = %self.spec.id, "Hypervisor reports paused while VM is running");
            }
            Ok(_) => {}
            Err(e @ OrchestratorError::HypervisorUnreachable(_)) => {
                let _ = self.fail(FailureCause::HypervisorUnreachable, e).await;
            }
            Err(e) => {
                debug!(vm_id = %self.spec.id, error = %e, "State query failed");
            }
        }
        Ok(self.status())
    }

    /// Apply `event` and publish the new state. Illegal events change nothing.
    async fn advance(&mut self, event: LifecycleEvent) -> OrchestratorResult<()> {
        let from = self.state.status;
        let to = next_status(from, event).ok_or_else(|| OrchestratorError::InvalidTransition {
            from,
            request: event.as_str().to_string(),
        })?;

        self.state.status = to;
        self.state.last_transition = Utc::now();
        if to.is_terminal() {
            self.state.instance = None;
            self.state.usage = None;
        }

        metrics::record_transition(from.as_str(), to.as_str());
        info!(vm_id = %self.spec.id, from = %from, to = %to, "VM state transition");
        self.publish().await;
        Ok(())
    }

    async fn publish(&self) {
        *self.published.write() = self.state.clone();
        if self.updates.send(self.state.clone()).await.is_err() {
            debug!(vm_id = %self.spec.id, "State update receiver closed");
        }
    }

    /// Tear down any instance, record the failure and move to `Failed`.
    async fn fail(&mut self, cause: FailureCause, error: OrchestratorError) -> OrchestratorError {
        if let Some(handle) = self.state.instance.clone() {
            let cleanup = bounded(
                self.timings.kill_bound(),
                "terminate",
                self.driver.terminate(&handle),
            )
            .await;
            if let Err(e) = cleanup {
                warn!(vm_id = %self.spec.id, error = %e, "Failed to terminate instance of failed VM");
            }
        }

        warn!(vm_id = %self.spec.id, cause = cause.as_str(), error = %error, "VM failed");
        metrics::record_failure(cause.as_str());
        self.state.last_error = Some(VmFailure {
            cause,
            message: error.to_string(),
        });
        if let Err(e) = self.advance(LifecycleEvent::Fail).await {
            debug!(vm_id = %self.spec.id, error = %e, "VM already terminal");
        }
        error
    }

    /// Launch, start and wait for the guest. Expects status `Starting`.
    async fn boot(&mut self) -> OrchestratorResult<VmStatus> {
        let config = match self.driver.build_configuration(&self.spec) {
            Ok(config) => config,
            Err(e) => return Err(self.fail(FailureCause::LaunchError, e).await),
        };

        let launched = bounded(
            self.timings.launch_bound(),
            "launch",
            self.driver.launch(&self.spec, &config),
        )
        .await;
        let handle = match launched {
            Ok(handle) => handle,
            Err(e) => {
                // A launch cut off by the deadline never returned its handle.
                let cleanup = bounded(
                    self.timings.kill_bound(),
                    "abort_launch",
                    self.driver.abort_launch(&self.spec.id),
                )
                .await;
                if let Err(cleanup) = cleanup {
                    warn!(vm_id = %self.spec.id, error = %cleanup, "Failed to clean up interrupted launch");
                }
                let cause = cause_of(&e, FailureCause::LaunchError);
                return Err(self.fail(cause, e).await);
            }
        };
        self.state.instance = Some(handle.clone());
        self.state.usage = Some(self.spec.resources());

        let started = bounded(
            self.timings.action_timeout,
            "instance_start",
            self.driver.issue_action(&handle, VmAction::Start),
        )
        .await;
        if let Err(e) = started {
            let cause = cause_of(&e, FailureCause::LaunchError);
            return Err(self.fail(cause, e).await);
        }

        let boot_timeout = self.timings.boot_timeout;
        let booted = timeout(
            boot_timeout,
            wait_for(
                self.driver.as_ref(),
                &handle,
                HypervisorObservedState::Running,
                self.timings.poll_interval,
            ),
        )
        .await;
        match booted {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                let err = OrchestratorError::LaunchError(
                    "hypervisor exited before the guest booted".to_string(),
                );
                return Err(self.fail(FailureCause::HypervisorExited, err).await);
            }
            Ok(Err(e)) => {
                let cause = cause_of(&e, FailureCause::DriverError);
                return Err(self.fail(cause, e).await);
            }
            Err(_elapsed) => {
                let err = OrchestratorError::BootTimeout {
                    seconds: boot_timeout.as_secs(),
                };
                return Err(self.fail(FailureCause::BootTimeout, err).await);
            }
        }

        self.advance(LifecycleEvent::Booted).await?;
        Ok(self.status())
    }

    /// Stop the current instance, gracefully first. Expects status `Stopping`.
    async fn halt(&mut self) -> OrchestratorResult<()> {
        let Some(handle) = self.state.instance.clone() else {
            return Ok(());
        };

        let outcome = bounded(
            self.timings.stop_bound(),
            "shutdown",
            self.driver.shutdown(&handle, self.timings.stop_grace, self.timings.poll_interval),
        )
        .await;
        match outcome {
            Ok(outcome) => {
                if outcome.forced {
                    warn!(vm_id = %self.spec.id, "VM terminated after grace period");
                } else {
                    debug!(vm_id = %self.spec.id, "VM exited cleanly");
                }
                self.state.instance = None;
                self.state.usage = None;
                Ok(())
            }
            Err(e) => {
                let cause = cause_of(&e, FailureCause::DriverError);
                Err(self.fail(cause, e).await)
            }
        }
    }

    /// Issue a pause/resume and wait for the hypervisor to confirm it.
    async fn act(
        &mut self,
        action: VmAction,
        target: HypervisorObservedState,
        done: LifecycleEvent,
    ) -> OrchestratorResult<VmStatus> {
        let Some(handle) = self.state.instance.clone() else {
            let err = OrchestratorError::Internal(format!("no instance to {action}"));
            return Err(self.fail(FailureCause::DriverError, err).await);
        };

        let limit = self.timings.action_timeout;
        if let Err(e) = bounded(limit, "issue_action", self.driver.issue_action(&handle, action)).await {
            let cause = cause_of(&e, FailureCause::DriverError);
            return Err(self.fail(cause, e).await);
        }

        let confirmed = bounded(
            limit,
            "confirm_action",
            wait_for(self.driver.as_ref(), &handle, target, self.timings.poll_interval),
        )
        .await;
        match confirmed {
            Ok(true) => {}
            Ok(false) => {
                let err = OrchestratorError::HypervisorUnreachable(format!(
                    "hypervisor exited during {action}"
                ));
                return Err(self.fail(FailureCause::HypervisorExited, err).await);
            }
            Err(e) => {
                let cause = cause_of(&e, FailureCause::DriverError);
                return Err(self.fail(cause, e).await);
            }
        }

        self.advance(done).await?;
        Ok(self.status())
    }
}
