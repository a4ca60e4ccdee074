//! Agent side of the control channel.
//!
//! One long-lived TCP stream to the control plane. Each (re)connection is a new
//! channel instance: `Register`, wait for `RegisterAck`, send a full snapshot,
//! then stream state changes, command results and heartbeats while executing
//! dispatched commands through the agent runtime.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at, timeout};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec::ControlCodec;
use super::protocol::{
    CommandResult, ControlMessage, Heartbeat, OutboundSequencer, ProtocolError, RegisterAck, SequenceTracker, StateUpdate,
};
use super::{accept_inbound, send_message};
use crate::config::Config;
use crate::domain::VmRuntimeState;
use crate::error::{OrchestratorError, OrchestratorResult, RejectionKind};
use crate::runtime::AgentRuntime;

/// Most state changes folded into one `StateUpdate`.
const MAX_UPDATE_BATCH: usize = 64;

#[derive(Debug, Clone)]
pub struct AgentChannelSettings {
    pub addr: String,
    /// Bound on connecting and on waiting for `RegisterAck`.
    pub register_timeout: Duration,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub result_buffer: usize,
}

impl AgentChannelSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            addr: config.agent.control_plane_addr.clone(),
            register_timeout: Duration::from_millis(config.agent.register_timeout_ms),
            reconnect_initial: Duration::from_millis(config.agent.reconnect_initial_delay_ms),
            reconnect_max: Duration::from_millis(config.agent.reconnect_max_delay_ms),
            result_buffer: config.agent.outbound_buffer,
        }
    }
}

#[derive(Debug)]
pub struct AgentChannel {
    runtime: Arc<AgentRuntime>,
    settings: AgentChannelSettings,
}

type AgentFramed = Framed<TcpStream, ControlCodec>;

impl AgentChannel {
    pub fn new(runtime: Arc<AgentRuntime>, settings: AgentChannelSettings) -> Self {
        Self { runtime, settings }
    }

    /// Keep a channel to the control plane until `shutdown` fires, reconnecting
    /// with exponential backoff. `updates` is the runtime's state change stream.
    pub async fn run(
        self,
        mut updates: mpsc::Receiver<VmRuntimeState>,
        shutdown: CancellationToken,
    ) -> OrchestratorResult<()> {
        let mut delay = self.settings.reconnect_initial;
        loop {
            match self.session(&mut updates, &shutdown, &mut delay).await {
                Ok(()) if shutdown.is_cancelled() => return Ok(()),
                Ok(()) => info!(agent_id = self.runtime.agent_id(), "Control channel closed by control plane"),
                Err(e) => warn!(
                    agent_id = self.runtime.agent_id(),
                    error = %e,
                    retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Control channel session failed"
                ),
            }

            if !self.backoff(with_jitter(delay), &mut updates, &shutdown).await {
                return Ok(());
            }
            delay = delay.saturating_mul(2).min(self.settings.reconnect_max);
        }
    }

    /// Sleep before reconnecting. Updates produced meanwhile are dropped; the
    /// next snapshot covers them. `false` if shutdown fired.
    async fn backoff(
        &self,
        wait: Duration,
        updates: &mut mpsc::Receiver<VmRuntimeState>,
        shutdown: &CancellationToken,
    ) -> bool {
        let sleep = tokio::time::sleep(wait);
        tokio::pin!(sleep);
        let mut updates_open = true;
        loop {
            tokio::select! {
                () = &mut sleep => return true,
                () = shutdown.cancelled() => return false,
                update = updates.recv(), if updates_open => {
                    if update.is_none() {
                        updates_open = false;
                    }
                }
            }
        }
    }

    async fn session(
        &self,
        updates: &mut mpsc::Receiver<VmRuntimeState>,
        shutdown: &CancellationToken,
        delay: &mut Duration,
    ) -> OrchestratorResult<()> {
        let register_timeout = self.settings.register_timeout;
        let stream = tokio::select! {
            () = shutdown.cancelled() => return Ok(()),
            connected = timeout(register_timeout, TcpStream::connect(&self.settings.addr)) => {
                connected.map_err(|_elapsed| OrchestratorError::timeout("connect", register_timeout))??
            }
        };
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, ControlCodec::default());

        let mut out = OutboundSequencer::new(Uuid::nil());
        let mut inbound = SequenceTracker::default();
        send_message(&mut framed, &mut out, ControlMessage::Register(self.runtime.registration())).await?;
        let ack = self.await_ack(&mut framed, &mut inbound).await?;
        let channel_id = ack.channel_id;
        out.bind(channel_id);
        *delay = self.settings.reconnect_initial;
        info!(
            agent_id = self.runtime.agent_id(),
            channel_id = %channel_id,
            addr = %self.settings.addr,
            "Registered with control plane"
        );

        // Resynchronize: the snapshot supersedes anything queued before it.
        while updates.try_recv().is_ok() {}
        let snapshot = StateUpdate {
            states: self.runtime.snapshot(),
            full_snapshot: true,
        };
        send_message(&mut framed, &mut out, ControlMessage::StateUpdate(snapshot)).await?;

        let period = Duration::from_millis(ack.heartbeat_interval_ms.max(1));
        let mut heartbeat = interval_at(Instant::now() + period, period);
        let (result_tx, mut results) = mpsc::channel(self.settings.result_buffer.max(1));
        let mut updates_open = true;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => {
                    info!(agent_id = self.runtime.agent_id(), "Control channel shutting down");
                    return Ok(());
                }
                // State changes go out before the results that follow them.
                update = updates.recv(), if updates_open => match update {
                    Some(state) => {
                        let mut states = vec![state];
                        while states.len() < MAX_UPDATE_BATCH {
                            match updates.try_recv() {
                                Ok(state) => states.push(state),
                                Err(_) => break,
                            }
                        }
                        let update = StateUpdate { states, full_snapshot: false };
                        send_message(&mut framed, &mut out, ControlMessage::StateUpdate(update)).await?;
                    }
                    None => updates_open = false,
                },
                Some(result) = results.recv() => {
                    send_message(&mut framed, &mut out, ControlMessage::CommandResult(result)).await?;
                }
                frame = framed.next() => match frame {
                    Some(Ok(envelope)) => {
                        let Some(message) = accept_inbound(envelope, channel_id, &mut inbound) else {
                            continue;
                        };
                        self.on_message(message, &mut framed, &mut out, &result_tx).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => return Ok(()),
                },
                _ = heartbeat.tick() => {
                    let beat = Heartbeat::now(Some(self.runtime.registration()));
                    send_message(&mut framed, &mut out, ControlMessage::Heartbeat(beat)).await?;
                }
            }
        }
    }

    async fn await_ack(&self, framed: &mut AgentFramed, inbound: &mut SequenceTracker) -> OrchestratorResult<RegisterAck> {
        let register_timeout = self.settings.register_timeout;
        let frame = timeout(register_timeout, framed.next())
            .await
            .map_err(|_elapsed| OrchestratorError::timeout("register", register_timeout))?;
        let envelope = match frame {
            Some(Ok(envelope)) => envelope,
            Some(Err(e)) => return Err(e),
            None => return Err(OrchestratorError::ChannelDisconnected),
        };
        inbound.accept(envelope.seq);

        match envelope.message {
            ControlMessage::RegisterAck(ack) if ack.channel_id == envelope.channel_id => Ok(ack),
            ControlMessage::Error(err) => Err(OrchestratorError::Protocol(format!(
                "registration refused ({}): {}",
                err.kind.as_str(),
                err.message
            ))),
            other => Err(OrchestratorError::Protocol(format!(
                "expected register_ack, got {}",
                other.kind()
            ))),
        }
    }

    async fn on_message(
        &self,
        message: ControlMessage,
        framed: &mut AgentFramed,
        out: &mut OutboundSequencer,
        result_tx: &mpsc::Sender<CommandResult>,
    ) -> OrchestratorResult<()> {
        match message {
            ControlMessage::CommandDispatch(command) => {
                debug!(
                    command_id = %command.command_id,
                    vm_id = %command.vm_id,
                    action = command.action.as_str(),
                    "Command received"
                );
                self.runtime.enqueue(command, result_tx.clone());
            }
            ControlMessage::Heartbeat(_) => debug!("Heartbeat from control plane"),
            ControlMessage::Error(err) => {
                warn!(kind = err.kind.as_str(), message = %err.message, "Control plane reported an error");
            }
            ControlMessage::Register(_)
            | ControlMessage::RegisterAck(_)
            | ControlMessage::CommandResult(_)
            | ControlMessage::StateUpdate(_) => {
                warn!(kind = message.kind(), "Unexpected message from control plane");
                let reply = ControlMessage::Error(ProtocolError {
                    kind: RejectionKind::Protocol,
                    message: format!("agents do not accept {}", message.kind()),
                });
                send_message(framed, out, reply).await?;
            }
        }
        Ok(())
    }
}

/// Spread reconnects of many agents by adding up to 25% random delay.
fn with_jitter(delay: Duration) -> Duration {
    let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
    let extra = rand::rng().random_range(0..=millis / 4);
    delay.saturating_add(Duration::from_millis(extra))
}
