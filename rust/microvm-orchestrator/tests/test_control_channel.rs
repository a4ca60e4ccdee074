//! End-to-end control channel tests over loopback TCP.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use microvm_orchestrator::channel::protocol::{
    CommandAction, CommandResult, ControlMessage, Envelope, OutboundSequencer, StateUpdate,
};
use microvm_orchestrator::channel::{
    AgentChannel, AgentChannelSettings, ControlCodec, ControlPlaneServer, ServerSettings,
};
use microvm_orchestrator::control_plane::ControlPlane;
use microvm_orchestrator::domain::{AgentRegistration, PROTOCOL_VERSION, Resources, VmRuntimeState, VmStatus};
use microvm_orchestrator::driver::SimulatedDriver;
use microvm_orchestrator::error::RejectionKind;
use microvm_orchestrator::resources::HostResources;
use microvm_orchestrator::{AgentRuntime, RuntimeSettings};

use common::{control_plane, control_plane_expiring, create_request, wait_for_agents, wait_for_vm};

type RawClient = Framed<TcpStream, ControlCodec>;

fn server_settings() -> ServerSettings {
    ServerSettings {
        register_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_millis(100),
        outbound_buffer: 32,
    }
}

async fn start_server(cp: &Arc<ControlPlane>, shutdown: &CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let server = Arc::new(ControlPlaneServer::new(Arc::clone(cp), server_settings()));
    tokio::spawn(server.serve(listener, shutdown.clone()));
    addr
}

fn start_agent(agent_id: &str, addr: &str, shutdown: &CancellationToken) -> (Arc<AgentRuntime>, Arc<SimulatedDriver>) {
    let driver = Arc::new(SimulatedDriver::default());
    let mut settings = RuntimeSettings::new(agent_id);
    settings.timings.poll_interval = Duration::from_millis(5);
    settings.timings.stop_grace = Duration::from_millis(50);
    let (runtime, updates) = AgentRuntime::new(
        settings,
        HostResources::new(Resources::new(8, 8192, 100_000)),
        Arc::clone(&driver) as _,
    );
    let runtime = Arc::new(runtime);

    let channel = AgentChannel::new(
        Arc::clone(&runtime),
        AgentChannelSettings {
            addr: addr.to_string(),
            register_timeout: Duration::from_secs(2),
            reconnect_initial: Duration::from_millis(20),
            reconnect_max: Duration::from_millis(200),
            result_buffer: 32,
        },
    );
    tokio::spawn(channel.run(updates, shutdown.clone()));
    (runtime, driver)
}

fn registration(agent_id: &str, protocol_version: u32) -> AgentRegistration {
    let total = Resources::new(4, 4096, 50_000);
    AgentRegistration {
        agent_id: agent_id.to_string(),
        hostname: agent_id.to_string(),
        capabilities: vec!["simulated".to_string()],
        total,
        available: total,
        protocol_version,
    }
}

async fn recv(client: &mut RawClient) -> Envelope {
    tokio::time::timeout(Duration::from_secs(2), client.next())
        .await
        .expect("no frame within 2s")
        .expect("channel closed")
        .expect("undecodable frame")
}

/// Connect and register by hand, returning the framed client and its bound sequencer.
async fn raw_agent(addr: &str, agent_id: &str) -> (RawClient, OutboundSequencer) {
    let stream = TcpStream::connect(addr).await.unwrap();
    let mut client = Framed::new(stream, ControlCodec::default());
    let mut out = OutboundSequencer::new(Uuid::nil());
    client
        .send(out.seal(ControlMessage::Register(registration(agent_id, PROTOCOL_VERSION))))
        .await
        .unwrap();

    let ack = match recv(&mut client).await.message {
        ControlMessage::RegisterAck(ack) => ack,
        other => panic!("expected register_ack, got {other:?}"),
    };
    out.bind(ack.channel_id);
    (client, out)
}

fn running(vm_id: Uuid) -> VmRuntimeState {
    let mut state = VmRuntimeState::new(vm_id);
    state.status = VmStatus::Running;
    state
}

#[tokio::test]
async fn test_agent_runs_vm_created_on_control_plane() {
    let shutdown = CancellationToken::new();
    let cp = control_plane(true);
    let addr = start_server(&cp, &shutdown).await;
    let (runtime, driver) = start_agent("host-a", &addr, &shutdown);

    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "host-a" && a.online)).await;

    let view = cp.create_vm("alice", create_request("web", 512, None)).await.unwrap();
    assert_eq!(view.agent_id.as_deref(), Some("host-a"));

    let view = wait_for_vm(&cp, view.vm_id, |v| {
        v.status == Some(VmStatus::Running) && v.pending_command.is_none()
    })
    .await;
    assert_eq!(driver.launch_count(), 1);
    assert_eq!(runtime.vm_state(&view.vm_id).map(|s| s.status), Some(VmStatus::Running));

    cp.stop_vm("alice", view.vm_id).await.unwrap();
    wait_for_vm(&cp, view.vm_id, |v| {
        v.status == Some(VmStatus::Shutdown) && v.pending_command.is_none()
    })
    .await;
    assert_eq!(runtime.host().available(), runtime.host().total());

    shutdown.cancel();
}

#[tokio::test]
async fn test_pause_resume_and_delete_round_trip() {
    let shutdown = CancellationToken::new();
    let cp = control_plane(true);
    let addr = start_server(&cp, &shutdown).await;
    let (runtime, _driver) = start_agent("host-a", &addr, &shutdown);
    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.online)).await;

    let vm_id = cp.create_vm("alice", create_request("db", 1024, None)).await.unwrap().vm_id;
    wait_for_vm(&cp, vm_id, |v| v.status == Some(VmStatus::Running)).await;

    cp.pause_vm("alice", vm_id).await.unwrap();
    wait_for_vm(&cp, vm_id, |v| v.status == Some(VmStatus::Paused)).await;
    cp.resume_vm("alice", vm_id).await.unwrap();
    wait_for_vm(&cp, vm_id, |v| v.status == Some(VmStatus::Running)).await;

    cp.delete_vm("alice", vm_id).await.unwrap();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while cp.get_vm("alice", vm_id).await.is_ok() {
        assert!(tokio::time::Instant::now() < deadline, "record never forgotten");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(runtime.vm_state(&vm_id).is_none());

    shutdown.cancel();
}

#[tokio::test]
async fn test_duplicate_sequence_is_ignored() {
    let shutdown = CancellationToken::new();
    let cp = control_plane(true);
    let addr = start_server(&cp, &shutdown).await;
    let (mut client, mut out) = raw_agent(&addr, "raw").await;
    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "raw")).await;

    let vm_id = cp
        .create_vm("alice", create_request("pinned", 256, Some("raw")))
        .await
        .unwrap()
        .vm_id;
    let command = match recv(&mut client).await.message {
        ControlMessage::CommandDispatch(command) => command,
        other => panic!("expected command_dispatch, got {other:?}"),
    };
    assert_eq!(command.vm_id, vm_id);
    assert!(matches!(command.action, CommandAction::Start { .. }));

    let update = out.seal(ControlMessage::StateUpdate(StateUpdate {
        states: vec![running(vm_id)],
        full_snapshot: false,
    }));
    client.send(update.clone()).await.unwrap();
    wait_for_vm(&cp, vm_id, |v| v.status == Some(VmStatus::Running)).await;

    // Same seq, newer content: must be dropped.
    let mut replay = update;
    let mut paused = running(vm_id);
    paused.status = VmStatus::Paused;
    paused.last_transition = Utc::now() + chrono::Duration::seconds(1);
    replay.message = ControlMessage::StateUpdate(StateUpdate {
        states: vec![paused.clone()],
        full_snapshot: false,
    });
    client.send(replay).await.unwrap();

    // A fresh seq afterwards is still accepted, proving the replay was read and skipped.
    client
        .send(out.seal(ControlMessage::CommandResult(CommandResult::completed(&command, VmStatus::Running))))
        .await
        .unwrap();
    let view = wait_for_vm(&cp, vm_id, |v| v.pending_command.is_none()).await;
    assert_eq!(view.status, Some(VmStatus::Running));

    shutdown.cancel();
}

#[tokio::test]
async fn test_protocol_version_mismatch_is_refused() {
    let shutdown = CancellationToken::new();
    let cp = control_plane(true);
    let addr = start_server(&cp, &shutdown).await;

    let stream = TcpStream::connect(&addr).await.unwrap();
    let mut client = Framed::new(stream, ControlCodec::default());
    let mut out = OutboundSequencer::new(Uuid::nil());
    client
        .send(out.seal(ControlMessage::Register(registration("old", PROTOCOL_VERSION + 1))))
        .await
        .unwrap();

    match recv(&mut client).await.message {
        ControlMessage::Error(err) => assert_eq!(err.kind, RejectionKind::Protocol),
        other => panic!("expected error, got {other:?}"),
    }
    let closed = tokio::time::timeout(Duration::from_secs(2), client.next()).await.unwrap();
    assert!(closed.is_none());
    assert!(cp.agents().is_empty());

    shutdown.cancel();
}

#[tokio::test]
async fn test_disconnect_makes_state_unknown() {
    let shutdown = CancellationToken::new();
    let cp = control_plane(true);
    let addr = start_server(&cp, &shutdown).await;
    let (mut client, mut out) = raw_agent(&addr, "flaky").await;
    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "flaky")).await;

    let vm_id = cp
        .create_vm("alice", create_request("web", 256, Some("flaky")))
        .await
        .unwrap()
        .vm_id;
    let _start = recv(&mut client).await;
    client
        .send(out.seal(ControlMessage::StateUpdate(StateUpdate {
            states: vec![running(vm_id)],
            full_snapshot: true,
        })))
        .await
        .unwrap();
    wait_for_vm(&cp, vm_id, |v| v.status == Some(VmStatus::Running)).await;

    drop(client);
    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "flaky" && !a.online)).await;
    let view = cp.get_vm("alice", vm_id).await.unwrap();
    assert_eq!(view.status, None);
    assert_eq!(view.agent_id.as_deref(), Some("flaky"));

    shutdown.cancel();
}

#[tokio::test]
async fn test_agent_reconnects_and_resyncs() {
    let shutdown = CancellationToken::new();
    let cp = control_plane(true);

    // Reserve a port, then let the agent retry against it until the server is up.
    let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = reserved.local_addr().unwrap().to_string();
    drop(reserved);
    let (_runtime, _driver) = start_agent("late", &addr, &shutdown);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cp.agents().is_empty());

    let listener = TcpListener::bind(&addr).await.unwrap();
    let server = Arc::new(ControlPlaneServer::new(Arc::clone(&cp), server_settings()));
    tokio::spawn(server.serve(listener, shutdown.clone()));

    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "late" && a.online)).await;
    let vm_id = cp.create_vm("alice", create_request("web", 256, None)).await.unwrap().vm_id;
    wait_for_vm(&cp, vm_id, |v| v.status == Some(VmStatus::Running)).await;

    shutdown.cancel();
}

#[tokio::test]
async fn test_running_vm_survives_session_drop() {
    let shutdown = CancellationToken::new();
    let cp = control_plane(true);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let first_server = CancellationToken::new();
    let server = Arc::new(ControlPlaneServer::new(Arc::clone(&cp), server_settings()));
    let serving = tokio::spawn(server.serve(listener, first_server.clone()));

    let (runtime, driver) = start_agent("host-a", &addr, &shutdown);
    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "host-a" && a.online)).await;
    let vm_id = cp.create_vm("alice", create_request("web", 512, None)).await.unwrap().vm_id;
    wait_for_vm(&cp, vm_id, |v| {
        v.status == Some(VmStatus::Running) && v.pending_command.is_none()
    })
    .await;

    // Tear the live session down, then serve again on the same address.
    first_server.cancel();
    serving.await.unwrap().unwrap();
    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "host-a" && !a.online)).await;
    assert_eq!(cp.get_vm("alice", vm_id).await.unwrap().status, None);

    let listener = TcpListener::bind(&addr).await.unwrap();
    let server = Arc::new(ControlPlaneServer::new(Arc::clone(&cp), server_settings()));
    tokio::spawn(server.serve(listener, shutdown.clone()));

    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "host-a" && a.online)).await;
    let view = wait_for_vm(&cp, vm_id, |v| {
        v.status == Some(VmStatus::Running) && v.pending_command.is_none()
    })
    .await;
    assert_eq!(view.agent_id.as_deref(), Some("host-a"));
    assert_eq!(driver.launch_count(), 1);
    assert_eq!(runtime.vm_state(&vm_id).map(|s| s.status), Some(VmStatus::Running));

    shutdown.cancel();
}

#[tokio::test]
async fn test_heartbeats_keep_idle_agent_online() {
    let shutdown = CancellationToken::new();
    let cp = control_plane_expiring(Duration::from_millis(300));
    tokio::spawn(Arc::clone(&cp).run_sweeper(Duration::from_millis(20), shutdown.clone()));
    let addr = start_server(&cp, &shutdown).await;

    let (_runtime, _driver) = start_agent("idle", &addr, &shutdown);
    let (_silent, _out) = raw_agent(&addr, "silent").await;
    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "idle" && a.online)).await;
    let first_seen = cp.agents().into_iter().find(|a| a.agent_id == "idle").unwrap().last_seen;

    // A registered client that never heartbeats is expired by the sweeper.
    wait_for_agents(&cp, |agents| agents.iter().any(|a| a.agent_id == "silent" && !a.online)).await;

    tokio::time::sleep(Duration::from_secs(1)).await;
    let idle = cp.agents().into_iter().find(|a| a.agent_id == "idle").unwrap();
    assert!(idle.online);
    assert_eq!(idle.vm_count, 0);
    assert!(idle.last_seen > first_seen);

    shutdown.cancel();
}
