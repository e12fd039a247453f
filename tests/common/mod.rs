// Shared harness: in-process agents wired together by a loopback transport

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use cacp::agent::{AgentIdentity, AgentService};
use cacp::broadcast::{BroadcastCoordinator, PeerTransport};
use cacp::collab::SyncMessage;
use cacp::db::SnapshotStore;
use cacp::registry::{Peer, PeerDirectory};
use cacp::rpc::{JsonRpcError, JsonRpcRequest, RpcDispatcher};
use cacp::store::LocalStore;
use parking_lot::RwLock;
use serde_json::{json, Value};

/// Routes sync calls to in-process dispatchers keyed by endpoint
#[derive(Default)]
pub struct LoopbackNetwork {
    agents: RwLock<HashMap<String, RpcDispatcher>>,
    down: RwLock<HashSet<String>>,
}

impl LoopbackNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make an endpoint refuse connections
    pub fn partition(&self, endpoint: &str) {
        self.down.write().insert(endpoint.to_string());
    }

    pub fn heal(&self, endpoint: &str) {
        self.down.write().remove(endpoint);
    }
}

#[async_trait]
impl PeerTransport for LoopbackNetwork {
    async fn send(&self, peer: &Peer, message: &SyncMessage) -> Result<()> {
        if self.down.read().contains(&peer.endpoint) {
            bail!("connection refused: {}", peer.endpoint);
        }
        let Some(dispatcher) = self.agents.read().get(&peer.endpoint).cloned() else {
            bail!("no route to {}", peer.endpoint);
        };

        // Go through the wire encoding like a real peer would
        let request: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": message.method(),
            "params": message.to_params()?,
        }))?;
        let response = dispatcher.handle(request);
        if let Some(error) = response.error {
            bail!("peer returned error {}: {}", error.code, error.message);
        }
        Ok(())
    }
}

pub struct TestAgent {
    pub endpoint: String,
    pub dispatcher: RpcDispatcher,
}

impl TestAgent {
    pub fn service(&self) -> &Arc<AgentService> {
        self.dispatcher.service()
    }

    /// Call a method; JSON-RPC errors become test failures
    pub fn call(&self, method: &str, params: Value) -> Result<Value> {
        match self.call_raw(method, params)? {
            Ok(result) => Ok(result),
            Err(error) => bail!("{} failed: {} ({})", method, error.message, error.code),
        }
    }

    /// Call a method expecting an error document back
    pub fn call_err(&self, method: &str, params: Value) -> Result<JsonRpcError> {
        match self.call_raw(method, params)? {
            Ok(result) => bail!("{} unexpectedly succeeded: {}", method, result),
            Err(error) => Ok(error),
        }
    }

    fn call_raw(&self, method: &str, params: Value) -> Result<std::result::Result<Value, JsonRpcError>> {
        let request: JsonRpcRequest = serde_json::from_value(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        }))?;
        let response = self.dispatcher.handle(request);
        Ok(match (response.result, response.error) {
            (_, Some(error)) => Err(error),
            (Some(result), None) => Ok(result),
            (None, None) => Ok(Value::Null),
        })
    }

    /// Wait until every broadcast emitted so far has been delivered
    pub async fn flush(&self) {
        self.service().broadcaster().flush().await;
    }

    pub fn meet(&self, other: &TestAgent) {
        let identity = other.service().identity();
        self.service().directory().register(
            &identity.agent_id,
            &other.endpoint,
            Some(identity.repo_name.clone()),
            Some(identity.role.clone()),
        );
    }
}

pub fn spawn_agent(
    network: &Arc<LoopbackNetwork>,
    agent_id: &str,
    repo_name: &str,
    role: &str,
    persistence: Option<Arc<dyn SnapshotStore>>,
) -> TestAgent {
    let endpoint = format!("loop://{}", agent_id);
    let identity = AgentIdentity {
        agent_id: agent_id.to_string(),
        repo_name: repo_name.to_string(),
        role: role.to_string(),
        language: "rust".to_string(),
        endpoint: endpoint.clone(),
    };
    let directory = Arc::new(PeerDirectory::new(agent_id));
    let (broadcaster, _worker) = BroadcastCoordinator::new(
        directory.clone(),
        network.clone(),
        Duration::from_millis(500),
    )
    .spawn();
    let service = AgentService::new(
        identity,
        Arc::new(LocalStore::new()),
        directory,
        broadcaster,
        persistence,
    );
    let dispatcher = RpcDispatcher::new(Arc::new(service));
    network
        .agents
        .write()
        .insert(endpoint.clone(), dispatcher.clone());
    TestAgent {
        endpoint,
        dispatcher,
    }
}

/// Backend and frontend agents that know each other
pub fn pair(network: &Arc<LoopbackNetwork>) -> (TestAgent, TestAgent) {
    let backend = spawn_agent(network, "agent-backend", "backend-api", "backend", None);
    let frontend = spawn_agent(network, "agent-frontend", "frontend-app", "frontend", None);
    backend.meet(&frontend);
    frontend.meet(&backend);
    (backend, frontend)
}

pub fn str_field(value: &Value, field: &str) -> Result<String> {
    match value.get(field).and_then(Value::as_str) {
        Some(s) => Ok(s.to_string()),
        None => bail!("missing string field {} in {}", field, value),
    }
}

/// Scenario A setup: project created by backend, joined by frontend
pub async fn shared_project(backend: &TestAgent, frontend: &TestAgent) -> Result<String> {
    let created = backend.call(
        "cacp/project/create",
        json!({
            "name": "P",
            "objective": "Checkout flow",
            "repos": [
                {"name": "backend-api", "role": "backend", "language": "rust"},
                {"name": "frontend-app", "role": "frontend", "language": "typescript"}
            ]
        }),
    )?;
    let project_id = str_field(&created, "projectId")?;
    backend.flush().await;

    frontend.call("cacp/project/join", json!({ "projectId": project_id }))?;
    frontend.flush().await;
    Ok(project_id)
}

pub async fn propose_users_endpoint(backend: &TestAgent, project_id: &str) -> Result<String> {
    let proposed = backend.call(
        "cacp/contract/propose",
        json!({
            "projectId": project_id,
            "type": "api_endpoint",
            "name": "GET /users",
            "content": {
                "method": "GET",
                "path": "/users",
                "response": {"type": "array"}
            }
        }),
    )?;
    backend.flush().await;
    str_field(&proposed, "contractId")
}
