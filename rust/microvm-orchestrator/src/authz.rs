//! Authorization gateway in front of every control plane operation.
//!
//! Mutating requests are checked one at a time against an external
//! relationship-based permission oracle before anything else happens. Reads
//! are filtered item by item with the `read` permission; any failed check
//! fails the whole read so callers never see a partial listing.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt, TryStreamExt};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::config::AuthorizationConfig;
use crate::error::{OrchestratorError, OrchestratorResult};
use crate::metrics;

/// Concurrent oracle checks issued while filtering a read.
const READ_CHECK_CONCURRENCY: usize = 8;

const HAS_PERMISSION: &str = "PERMISSIONSHIP_HAS_PERMISSION";

/// Resource a permission is evaluated against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRef {
    pub kind: String,
    pub id: String,
}

impl ResourceRef {
    pub fn vm(id: Uuid) -> Self {
        Self {
            kind: "vm".to_string(),
            id: id.to_string(),
        }
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    Create,
    Update,
    Delete,
    Start,
    Stop,
    Restart,
    Pause,
    Resume,
    Read,
}

impl Permission {
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::Pause => "pause",
            Self::Resume => "resume",
            Self::Read => "read",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// "Can `subject` perform `permission` on `resource`?"
///
/// Implementations must be side-effect free from the orchestrator's point of
/// view. Errors are treated as a denial by the gateway.
#[async_trait]
pub trait PermissionOracle: Send + Sync + fmt::Debug {
    async fn check(
        &self,
        subject: &str,
        permission: Permission,
        resource: &ResourceRef,
    ) -> anyhow::Result<bool>;
}

/// Outcome of one oracle evaluation. Never cached across requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub subject: String,
    pub permission: Permission,
    pub resource: ResourceRef,
    pub allowed: bool,
    pub evaluated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct AuthorizationGateway {
    oracle: Arc<dyn PermissionOracle>,
    timeout: Duration,
}

impl AuthorizationGateway {
    pub fn new(oracle: Arc<dyn PermissionOracle>, timeout: Duration) -> Self {
        Self { oracle, timeout }
    }

    /// Evaluate one mutating request. Anything but an explicit allow is `Forbidden`.
    #[instrument(skip(self), fields(resource = %ResourceRef::vm(vm_id)))]
    pub async fn authorize(
        &self,
        subject: &str,
        permission: Permission,
        vm_id: Uuid,
    ) -> OrchestratorResult<AuthorizationDecision> {
        let resource = ResourceRef::vm(vm_id);
        let decision = self.evaluate(subject, permission, &resource).await;
        match decision {
            Ok(decision) if decision.allowed => {
                debug!(subject, permission = %permission, "Request authorized");
                Ok(decision)
            }
            Ok(_) => {
                info!(subject, permission = %permission, resource = %resource, "Request denied");
                Err(OrchestratorError::forbidden(subject, permission.as_str(), resource.to_string()))
            }
            Err(e) => {
                warn!(
                    subject,
                    permission = %permission,
                    resource = %resource,
                    error = %e,
                    "Permission check failed; denying"
                );
                Err(OrchestratorError::forbidden(subject, permission.as_str(), resource.to_string()))
            }
        }
    }

    /// Keep the items `subject` may read, in input order.
    ///
    /// Denied items are omitted; a failed check fails the whole call.
    pub async fn filter_readable<T, F>(
        &self,
        subject: &str,
        items: Vec<T>,
        id_of: F,
    ) -> OrchestratorResult<Vec<T>>
    where
        F: Fn(&T) -> Uuid,
    {
        let checks = items.into_iter().map(|item| {
            let resource = ResourceRef::vm(id_of(&item));
            async move {
                let decision = self.evaluate(subject, Permission::Read, &resource).await?;
                Ok::<_, OrchestratorError>(decision.allowed.then_some(item))
            }
        });

        let visible: Vec<Option<T>> = stream::iter(checks)
            .buffered(READ_CHECK_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(visible.into_iter().flatten().collect())
    }

    async fn evaluate(
        &self,
        subject: &str,
        permission: Permission,
        resource: &ResourceRef,
    ) -> OrchestratorResult<AuthorizationDecision> {
        let allowed =
            match tokio::time::timeout(self.timeout, self.oracle.check(subject, permission, resource))
                .await
            {
                Ok(Ok(allowed)) => allowed,
                Ok(Err(e)) => {
                    metrics::record_authz(permission.as_str(), false);
                    return Err(OrchestratorError::Other(
                        e.context(format!("permission oracle failed for {resource}")),
                    ));
                }
                Err(_) => {
                    metrics::record_authz(permission.as_str(), false);
                    return Err(OrchestratorError::timeout("permission check", self.timeout));
                }
            };

        metrics::record_authz(permission.as_str(), allowed);
        Ok(AuthorizationDecision {
            subject: subject.to_string(),
            permission,
            resource: resource.clone(),
            allowed,
            evaluated_at: Utc::now(),
        })
    }
}

/// Client for a SpiceDB-compatible `CheckPermission` HTTP endpoint.
#[derive(Debug, Clone)]
pub struct HttpPermissionOracle {
    client: Client,
    base_url: String,
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckPermissionResponse {
    permissionship: String,
}

impl HttpPermissionOracle {
    pub fn new(config: &AuthorizationConfig) -> OrchestratorResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.check_timeout_ms))
            .build()
            .map_err(|e| {
                OrchestratorError::Configuration(format!("Failed to build oracle HTTP client: {e}"))
            })?;

        info!("Permission oracle client initialized with base URL: {}", config.oracle_url);

        Ok(Self {
            client,
            base_url: config.oracle_url.trim_end_matches('/').to_string(),
            token: config.oracle_token.clone(),
        })
    }

    fn request_body(subject: &str, permission: Permission, resource: &ResourceRef) -> serde_json::Value {
        // Subjects are `type:id`; a bare id is a user.
        let (subject_type, subject_id) = subject.split_once(':').unwrap_or(("user", subject));
        json!({
            "resource": { "objectType": resource.kind, "objectId": resource.id },
            "permission": permission.as_str(),
            "subject": { "object": { "objectType": subject_type, "objectId": subject_id } },
            "consistency": { "fullyConsistent": true },
        })
    }
}

#[async_trait]
impl PermissionOracle for HttpPermissionOracle {
    async fn check(
        &self,
        subject: &str,
        permission: Permission,
        resource: &ResourceRef,
    ) -> anyhow::Result<bool> {
        let url = format!("{}/v1/permissions/check", self.base_url);
        let mut request = self
            .client
            .post(&url)
            .json(&Self::request_body(subject, permission, resource));
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("permission oracle returned {status}: {body}");
        }

        let body: CheckPermissionResponse = response.json().await?;
        Ok(body.permissionship == HAS_PERMISSION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Grants exactly the listed `(subject, permission, resource id)` triples.
    #[derive(Debug, Default)]
    struct StaticOracle {
        grants: HashSet<(String, Permission, String)>,
        failing: HashSet<String>,
        calls: Mutex<usize>,
    }

    impl StaticOracle {
        fn grant(mut self, subject: &str, permission: Permission, vm: Uuid) -> Self {
            self.grants
                .insert((subject.to_string(), permission, vm.to_string()));
            self
        }

        fn fail_on(mut self, vm: Uuid) -> Self {
            self.failing.insert(vm.to_string());
            self
        }
    }

    #[async_trait]
    impl PermissionOracle for StaticOracle {
        async fn check(
            &self,
            subject: &str,
            permission: Permission,
            resource: &ResourceRef,
        ) -> anyhow::Result<bool> {
            *self.calls.lock() += 1;
            if self.failing.contains(&resource.id) {
                anyhow::bail!("oracle unavailable");
            }
            Ok(self
                .grants
                .contains(&(subject.to_string(), permission, resource.id.clone())))
        }
    }

    #[derive(Debug)]
    struct HangingOracle;

    #[async_trait]
    impl PermissionOracle for HangingOracle {
        async fn check(&self, _: &str, _: Permission, _: &ResourceRef) -> anyhow::Result<bool> {
            std::future::pending().await
        }
    }

    fn gateway(oracle: impl PermissionOracle + 'static) -> AuthorizationGateway {
        AuthorizationGateway::new(Arc::new(oracle), Duration::from_millis(200))
    }

    #[tokio::test]
    async fn test_allow_returns_decision() {
        let vm = Uuid::new_v4();
        let gw = gateway(StaticOracle::default().grant("alice", Permission::Start, vm));

        let decision = gw.authorize("alice", Permission::Start, vm).await.unwrap();
        assert!(decision.allowed);
        assert_eq!(decision.resource, ResourceRef::vm(vm));
        assert_eq!(decision.permission, Permission::Start);
    }

    #[tokio::test]
    async fn test_deny_is_forbidden_with_reason() {
        let vm = Uuid::new_v4();
        let gw = gateway(StaticOracle::default().grant("alice", Permission::Start, vm));

        let err = gw.authorize("alice", Permission::Delete, vm).await.unwrap_err();
        match err {
            OrchestratorError::Forbidden { subject, permission, resource } => {
                assert_eq!(subject, "alice");
                assert_eq!(permission, "delete");
                assert_eq!(resource, format!("vm:{vm}"));
            }
            other => panic!("expected Forbidden, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_oracle_error_denies() {
        let vm = Uuid::new_v4();
        let gw = gateway(StaticOracle::default().grant("alice", Permission::Stop, vm).fail_on(vm));
        assert!(matches!(
            gw.authorize("alice", Permission::Stop, vm).await,
            Err(OrchestratorError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn test_oracle_timeout_denies() {
        let gw = gateway(HangingOracle);
        assert!(matches!(
            gw.authorize("alice", Permission::Create, Uuid::new_v4()).await,
            Err(OrchestratorError::Forbidden { .. })
        ));
    }

    #[tokio::test]
    async fn test_filter_keeps_order_and_omits_denied() {
        let ids: Vec<Uuid> = (0..5).map(|_| Uuid::new_v4()).collect();
        let oracle = StaticOracle::default()
            .grant("bob", Permission::Read, ids[0])
            .grant("bob", Permission::Read, ids[2])
            .grant("bob", Permission::Read, ids[4])
            .grant("bob", Permission::Start, ids[1]);
        let gw = gateway(oracle);

        let visible = gw.filter_readable("bob", ids.clone(), |id| *id).await.unwrap();
        assert_eq!(visible, vec![ids[0], ids[2], ids[4]]);
    }

    #[tokio::test]
    async fn test_filter_fails_whole_read_on_any_error() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut oracle = StaticOracle::default();
        for id in &ids {
            oracle = oracle.grant("bob", Permission::Read, *id);
        }
        let gw = gateway(oracle.fail_on(ids[3]));

        assert!(gw.filter_readable("bob", ids, |id| *id).await.is_err());
    }

    #[tokio::test]
    async fn test_decisions_are_not_cached() {
        let vm = Uuid::new_v4();
        let oracle = Arc::new(StaticOracle::default().grant("alice", Permission::Pause, vm));
        let gw = AuthorizationGateway::new(Arc::clone(&oracle) as Arc<dyn PermissionOracle>, Duration::from_secs(1));

        gw.authorize("alice", Permission::Pause, vm).await.unwrap();
        gw.authorize("alice", Permission::Pause, vm).await.unwrap();
        assert_eq!(*oracle.calls.lock(), 2);
    }

    #[test]
    fn test_check_request_body() {
        let vm = Uuid::new_v4();
        let body = HttpPermissionOracle::request_body("alice", Permission::Restart, &ResourceRef::vm(vm));
        assert_eq!(body["resource"]["objectType"], "vm");
        assert_eq!(body["resource"]["objectId"], vm.to_string());
        assert_eq!(body["permission"], "restart");
        assert_eq!(body["subject"]["object"]["objectType"], "user");
        assert_eq!(body["subject"]["object"]["objectId"], "alice");

        let body = HttpPermissionOracle::request_body("service:ci", Permission::Read, &ResourceRef::vm(vm));
        assert_eq!(body["subject"]["object"]["objectType"], "service");
        assert_eq!(body["subject"]["object"]["objectId"], "ci");
    }
}
