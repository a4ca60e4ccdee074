//! Authorization gateway against an HTTP permission oracle.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

use microvm_orchestrator::authz::{AuthorizationGateway, HttpPermissionOracle, Permission};
use microvm_orchestrator::channel::protocol::ControlMessage;
use microvm_orchestrator::config::AuthorizationConfig;
use microvm_orchestrator::domain::{AgentRegistration, PROTOCOL_VERSION, Resources};
use microvm_orchestrator::error::OrchestratorError;

use common::{control_plane_with, create_request};

const ALLOWED: &str = r#"{"checkedAt":{"token":"GhUKEzE3"},"permissionship":"PERMISSIONSHIP_HAS_PERMISSION"}"#;
const DENIED: &str = r#"{"checkedAt":{"token":"GhUKEzE3"},"permissionship":"PERMISSIONSHIP_NO_PERMISSION"}"#;

/// Answers every request with `status` and `body`, forwarding raw requests to the returned receiver.
async fn oracle_server(status: &'static str, body: &'static str) -> (String, mpsc::UnboundedReceiver<String>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    let (tx, rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((mut stream, _)) = listener.accept().await else {
                return;
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                let request = read_request(&mut stream).await;
                let _ = tx.send(request);
                let response = format!(
                    "HTTP/1.1 {status}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                let _ = stream.write_all(response.as_bytes()).await;
                let _ = stream.shutdown().await;
            });
        }
    });
    (url, rx)
}

async fn read_request(stream: &mut tokio::net::TcpStream) -> String {
    let mut buf = vec![0u8; 16 * 1024];
    let mut read = 0;
    loop {
        let n = stream.read(&mut buf[read..]).await.unwrap_or(0);
        read += n;
        let text = String::from_utf8_lossy(&buf[..read]);
        if let Some(head_end) = text.find("\r\n\r\n") {
            let len = text[..head_end]
                .lines()
                .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length: ").map(str::to_string))
                .and_then(|v| v.trim().parse::<usize>().ok())
                .unwrap_or(0);
            if read >= head_end + 4 + len {
                break;
            }
        }
        if n == 0 {
            break;
        }
    }
    String::from_utf8_lossy(&buf[..read]).to_string()
}

fn oracle(url: &str, timeout_ms: u64) -> HttpPermissionOracle {
    HttpPermissionOracle::new(&AuthorizationConfig {
        oracle_url: url.to_string(),
        oracle_token: Some("secret-token".to_string()),
        check_timeout_ms: timeout_ms,
    })
    .unwrap()
}

#[tokio::test]
async fn test_allowed_check_sends_spicedb_request() {
    let (url, mut requests) = oracle_server("200 OK", ALLOWED).await;
    let gateway = AuthorizationGateway::new(Arc::new(oracle(&url, 2_000)), Duration::from_secs(2));
    let vm_id = Uuid::new_v4();

    let decision = gateway.authorize("user:alice", Permission::Start, vm_id).await.unwrap();
    assert!(decision.allowed);
    assert_eq!(decision.resource.to_string(), format!("vm:{vm_id}"));

    let request = requests.recv().await.unwrap();
    assert!(request.starts_with("POST /v1/permissions/check HTTP/1.1"));
    assert!(request.to_ascii_lowercase().contains("authorization: bearer secret-token"));
    let body = &request[request.find("\r\n\r\n").unwrap() + 4..];
    let json: serde_json::Value = serde_json::from_str(body).unwrap();
    assert_eq!(json["permission"], "start");
    assert_eq!(json["resource"]["objectType"], "vm");
    assert_eq!(json["resource"]["objectId"], vm_id.to_string());
    assert_eq!(json["subject"]["object"]["objectType"], "user");
    assert_eq!(json["subject"]["object"]["objectId"], "alice");
}

#[tokio::test]
async fn test_no_permission_is_forbidden() {
    let (url, _requests) = oracle_server("200 OK", DENIED).await;
    let gateway = AuthorizationGateway::new(Arc::new(oracle(&url, 2_000)), Duration::from_secs(2));

    let err = gateway
        .authorize("bob", Permission::Delete, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Forbidden { .. }));
}

#[tokio::test]
async fn test_oracle_error_fails_closed() {
    let (url, _requests) = oracle_server("503 Service Unavailable", r#"{"message":"overloaded"}"#).await;
    let gateway = AuthorizationGateway::new(Arc::new(oracle(&url, 2_000)), Duration::from_secs(2));

    let err = gateway
        .authorize("alice", Permission::Stop, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Forbidden { .. }));
}

#[tokio::test]
async fn test_unreachable_oracle_fails_closed() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let gateway = AuthorizationGateway::new(Arc::new(oracle(&url, 500)), Duration::from_millis(500));

    let err = gateway
        .authorize("alice", Permission::Create, Uuid::new_v4())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Forbidden { .. }));
}

#[tokio::test]
async fn test_denied_request_dispatches_nothing() {
    let (url, _requests) = oracle_server("200 OK", DENIED).await;
    let cp = control_plane_with(Arc::new(oracle(&url, 2_000)));

    let (tx, mut outbound) = mpsc::channel(8);
    let total = Resources::new(4, 4096, 50_000);
    cp.agent_connected(
        AgentRegistration {
            agent_id: "host-a".to_string(),
            hostname: "host-a".to_string(),
            capabilities: vec!["simulated".to_string()],
            total,
            available: total,
            protocol_version: PROTOCOL_VERSION,
        },
        Uuid::new_v4(),
        tx,
    );

    let err = cp.create_vm("mallory", create_request("web", 512, None)).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Forbidden { .. }));

    // Mutations on ids that do not exist are refused before existence is revealed.
    let err = cp.stop_vm("mallory", Uuid::new_v4()).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::Forbidden { .. }));

    assert!(cp.list_vms("mallory").await.unwrap().is_empty());
    assert!(!matches!(outbound.try_recv(), Ok(ControlMessage::CommandDispatch(_))));
    assert_eq!(cp.agents()[0].vm_count, 0);
}
