//! Control plane side of the control channel: one task per agent connection.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::codec::ControlCodec;
use super::protocol::{
    ControlMessage, Heartbeat, OutboundSequencer, ProtocolError, RegisterAck, SequenceTracker,
};
use super::{accept_inbound, send_message};
use crate::config::Config;
use crate::control_plane::ControlPlane;
use crate::domain::{AgentRegistration, PROTOCOL_VERSION};
use crate::error::{OrchestratorError, OrchestratorResult, RejectionKind};

type ServerFramed = Framed<TcpStream, ControlCodec>;

#[derive(Debug, Clone, Copy)]
pub struct ServerSettings {
    /// Time an agent has to send `Register` after connecting.
    pub register_timeout: Duration,
    /// Interval agents are told to heartbeat at.
    pub heartbeat_interval: Duration,
    /// Depth of each agent's outbound command queue.
    pub outbound_buffer: usize,
}

impl ServerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            register_timeout: Duration::from_millis(config.agent.register_timeout_ms),
            heartbeat_interval: config.heartbeat_interval(),
            outbound_buffer: config.control_plane.outbound_buffer,
        }
    }
}

#[derive(Debug)]
pub struct ControlPlaneServer {
    control_plane: Arc<ControlPlane>,
    settings: ServerSettings,
}

/// Identity of an established session.
#[derive(Debug, Clone)]
struct Session {
    agent_id: String,
    channel_id: Uuid,
}

impl ControlPlaneServer {
    pub fn new(control_plane: Arc<ControlPlane>, settings: ServerSettings) -> Self {
        Self {
            control_plane,
            settings,
        }
    }

    /// Accept agent connections until `shutdown` fires.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, shutdown: CancellationToken) -> OrchestratorResult<()> {
        info!(addr = ?listener.local_addr().ok(), "Control channel listening");
        loop {
            tokio::select! {
                () = shutdown.cancelled() => {
                    info!("Control channel listener stopped");
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(peer = %peer, "Agent connection accepted");
                        let server = Arc::clone(&self);
                        let session_shutdown = shutdown.child_token();
                        tokio::spawn(async move {
                            if let Err(e) = server.serve_agent(stream, session_shutdown).await {
                                warn!(peer = %peer, error = %e, "Agent session ended with error");
                            }
                        });
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept agent connection");
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    }
                },
            }
        }
    }

    /// Run one agent connection from `Register` to close.
    pub async fn serve_agent(&self, stream: TcpStream, shutdown: CancellationToken) -> OrchestratorResult<()> {
        stream.set_nodelay(true)?;
        let mut framed = Framed::new(stream, ControlCodec::default());
        let channel_id = Uuid::new_v4();
        let mut out = OutboundSequencer::new(channel_id);
        let mut inbound = SequenceTracker::default();

        let registration = match self.await_register(&mut framed, &mut inbound).await {
            Ok(registration) => registration,
            Err(e) => {
                let refusal = ControlMessage::Error(ProtocolError {
                    kind: e.kind(),
                    message: e.to_string(),
                });
                // Best effort; the connection is dropped either way.
                let _ = send_message(&mut framed, &mut out, refusal).await;
                return Err(e);
            }
        };

        let ack = RegisterAck {
            channel_id,
            heartbeat_interval_ms: u64::try_from(self.settings.heartbeat_interval.as_millis()).unwrap_or(u64::MAX),
        };
        send_message(&mut framed, &mut out, ControlMessage::RegisterAck(ack)).await?;

        let session = Session {
            agent_id: registration.agent_id.clone(),
            channel_id,
        };
        info!(
            agent_id = %session.agent_id,
            channel_id = %channel_id,
            capacity = %registration.total,
            "Agent registered"
        );

        let (outbound_tx, outbound) = mpsc::channel(self.settings.outbound_buffer.max(1));
        self.control_plane.agent_connected(registration, channel_id, outbound_tx);
        let result = self
            .run_session(&session, framed, out, inbound, outbound, shutdown)
            .await;
        self.control_plane
            .agent_disconnected(&session.agent_id, session.channel_id);
        result
    }

    async fn await_register(
        &self,
        framed: &mut ServerFramed,
        inbound: &mut SequenceTracker,
    ) -> OrchestratorResult<AgentRegistration> {
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

        let registration = match envelope.message {
            ControlMessage::Register(registration) => registration,
            other => {
                return Err(OrchestratorError::Protocol(format!(
                    "expected register, got {}",
                    other.kind()
                )));
            }
        };
        if registration.protocol_version != PROTOCOL_VERSION {
            return Err(OrchestratorError::Protocol(format!(
                "unsupported protocol version {} (expected {PROTOCOL_VERSION})",
                registration.protocol_version
            )));
        }
        if registration.agent_id.trim().is_empty() {
            return Err(OrchestratorError::Validation("agent_id must not be empty".to_string()));
        }
        Ok(registration)
    }

    async fn run_session(
        &self,
        session: &Session,
        mut framed: ServerFramed,
        mut out: OutboundSequencer,
        mut inbound: SequenceTracker,
        mut outbound: mpsc::Receiver<ControlMessage>,
        shutdown: CancellationToken,
    ) -> OrchestratorResult<()> {
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => return Ok(()),
                message = outbound.recv() => match message {
                    Some(message) => send_message(&mut framed, &mut out, message).await?,
                    None => {
                        info!(agent_id = %session.agent_id, "Channel superseded or expired; closing");
                        return Ok(());
                    }
                },
                frame = framed.next() => match frame {
                    Some(Ok(envelope)) => {
                        let Some(message) = accept_inbound(envelope, session.channel_id, &mut inbound) else {
                            continue;
                        };
                        self.on_message(session, message, &mut framed, &mut out).await?;
                    }
                    Some(Err(e)) => return Err(e),
                    None => {
                        info!(agent_id = %session.agent_id, "Agent closed channel");
                        return Ok(());
                    }
                },
            }
        }
    }

    async fn on_message(
        &self,
        session: &Session,
        message: ControlMessage,
        framed: &mut ServerFramed,
        out: &mut OutboundSequencer,
    ) -> OrchestratorResult<()> {
        let cp = &self.control_plane;
        let (agent_id, channel_id) = (session.agent_id.as_str(), session.channel_id);
        match message {
            ControlMessage::Heartbeat(beat) => {
                cp.agent_heartbeat(agent_id, channel_id, beat.registration);
                send_message(framed, out, ControlMessage::Heartbeat(Heartbeat::now(None))).await?;
            }
            ControlMessage::StateUpdate(update) => {
                cp.agent_heartbeat(agent_id, channel_id, None);
                cp.apply_state_update(agent_id, channel_id, &update);
            }
            ControlMessage::CommandResult(result) => {
                cp.agent_heartbeat(agent_id, channel_id, None);
                cp.apply_command_result(agent_id, channel_id, &result);
            }
            ControlMessage::Error(err) => {
                warn!(agent_id, kind = err.kind.as_str(), message = %err.message, "Agent reported an error");
            }
            ControlMessage::Register(_) | ControlMessage::RegisterAck(_) | ControlMessage::CommandDispatch(_) => {
                warn!(agent_id, kind = message.kind(), "Unexpected message from agent");
                let reply = ControlMessage::Error(ProtocolError {
                    kind: RejectionKind::Protocol,
                    message: format!("control plane does not accept {}", message.kind()),
                });
                send_message(framed, out, reply).await?;
            }
        }
        Ok(())
    }
}
