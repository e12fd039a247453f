//! JSON-RPC 2.0 dispatch for agent operations
//!
//! The same dispatcher serves the HTTP endpoint and the stdio loop.
//! Methods:
//! - cacp/project/*: create, join, get, list, updateStatus, addRepo
//! - cacp/contract/*: propose, respond, update, get, list
//! - cacp/context/*: share, askQuestion, recordDecision, list, getThread
//! - cacp/implementation/*: start, complete, verify, getStatus
//! - cacp/file/*: share, request, listRequests, fulfillRequest (local only)
//! - sync counterparts and cacp/peer/announce

use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

use crate::agent::AgentService;
use crate::error::CoreError;

pub mod handlers;

/// How a method affects state
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MethodKind {
    Read,
    Write,
    Sync,
}

/// Every method the dispatcher understands
pub const METHODS: &[(&str, MethodKind)] = &[
    ("cacp/project/create", MethodKind::Write),
    ("cacp/project/join", MethodKind::Write),
    ("cacp/project/get", MethodKind::Read),
    ("cacp/project/list", MethodKind::Read),
    ("cacp/project/updateStatus", MethodKind::Write),
    ("cacp/project/addRepo", MethodKind::Write),
    ("cacp/contract/propose", MethodKind::Write),
    ("cacp/contract/respond", MethodKind::Write),
    ("cacp/contract/update", MethodKind::Write),
    ("cacp/contract/get", MethodKind::Read),
    ("cacp/contract/list", MethodKind::Read),
    ("cacp/context/share", MethodKind::Write),
    ("cacp/context/askQuestion", MethodKind::Write),
    ("cacp/context/recordDecision", MethodKind::Write),
    ("cacp/context/list", MethodKind::Read),
    ("cacp/context/getThread", MethodKind::Read),
    ("cacp/implementation/start", MethodKind::Write),
    ("cacp/implementation/complete", MethodKind::Write),
    ("cacp/implementation/verify", MethodKind::Write),
    ("cacp/implementation/getStatus", MethodKind::Read),
    ("cacp/file/share", MethodKind::Write),
    ("cacp/file/request", MethodKind::Write),
    ("cacp/file/listRequests", MethodKind::Read),
    ("cacp/file/fulfillRequest", MethodKind::Write),
    ("cacp/project/sync", MethodKind::Sync),
    ("cacp/contract/sync", MethodKind::Sync),
    ("cacp/context/sync", MethodKind::Sync),
    ("cacp/repo/sync", MethodKind::Sync),
    ("cacp/peer/announce", MethodKind::Sync),
];

pub fn method_kind(method: &str) -> Option<MethodKind> {
    METHODS.iter().find(|(m, _)| *m == method).map(|(_, k)| *k)
}

/// JSON-RPC 2.0 request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: Option<Value>,
    pub method: String,
    pub params: Option<Value>,
}

/// JSON-RPC 2.0 response
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcResponse {
    pub jsonrpc: String,
    pub id: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<JsonRpcError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl From<&CoreError> for JsonRpcError {
    fn from(e: &CoreError) -> Self {
        Self {
            code: e.code(),
            message: e.to_string(),
            data: Some(json!({ "kind": e.kind() })),
        }
    }
}

impl JsonRpcResponse {
    fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    fn failure(id: Option<Value>, error: JsonRpcError) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    fn protocol_error(id: Option<Value>, code: i32, message: String) -> Self {
        Self::failure(
            id,
            JsonRpcError {
                code,
                message,
                data: None,
            },
        )
    }
}

/// Routes decoded requests to the agent service
#[derive(Clone)]
pub struct RpcDispatcher {
    service: Arc<AgentService>,
}

impl RpcDispatcher {
    pub fn new(service: Arc<AgentService>) -> Self {
        Self { service }
    }

    pub fn service(&self) -> &Arc<AgentService> {
        &self.service
    }

    /// Handle one raw request line or body
    pub fn handle_str(&self, request_str: &str) -> JsonRpcResponse {
        match serde_json::from_str::<JsonRpcRequest>(request_str) {
            Ok(request) => self.handle(request),
            Err(e) => JsonRpcResponse::protocol_error(None, -32700, format!("Parse error: {}", e)),
        }
    }

    pub fn handle(&self, request: JsonRpcRequest) -> JsonRpcResponse {
        if request.jsonrpc != "2.0" {
            return JsonRpcResponse::protocol_error(
                request.id,
                -32600,
                "Invalid Request: jsonrpc must be '2.0'".to_string(),
            );
        }

        if method_kind(&request.method).is_none() {
            return JsonRpcResponse::protocol_error(
                request.id,
                -32601,
                format!("Method not found: {}", request.method),
            );
        }

        let params = request.params.unwrap_or(Value::Null);
        match handlers::dispatch(&self.service, &request.method, params) {
            Ok(result) => JsonRpcResponse::success(request.id, result),
            Err(e) => {
                tracing::debug!(method = %request.method, error = %e, "Request failed");
                JsonRpcResponse::failure(request.id, JsonRpcError::from(&e))
            }
        }
    }

    /// Serve JSON-RPC 2.0 over stdin/stdout, one request per line
    pub async fn run_stdio(&self) -> Result<()> {
        tracing::info!(
            agent_id = %self.service.identity().agent_id,
            methods = METHODS.len(),
            "JSON-RPC over stdio ready"
        );

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        let mut stdout = tokio::io::stdout();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_str(&line);
            let mut response_json = serde_json::to_string(&response)?;
            response_json.push('\n');
            stdout.write_all(response_json.as_bytes()).await?;
            stdout.flush().await?;
        }
        Ok(())
    }
}
