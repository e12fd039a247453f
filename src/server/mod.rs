//! HTTP surface of an agent
//!
//! `POST /` carries JSON-RPC 2.0; the remaining routes expose health, the
//! peer directory, the method list and the agent card.

use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::agent::AgentIdentity;
use crate::registry::{agent_card, Peer, AGENT_CARD_PATH};
use crate::rpc::{JsonRpcResponse, RpcDispatcher, METHODS};

#[derive(Clone)]
pub struct AppState {
    pub dispatcher: RpcDispatcher,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(dispatcher: RpcDispatcher, http: reqwest::Client) -> Self {
        Self { dispatcher, http }
    }

    fn identity(&self) -> &AgentIdentity {
        self.dispatcher.service().identity()
    }
}

pub fn app_router(state: AppState) -> Router {
    Router::new()
        .route("/", post(rpc))
        .route("/health", get(health))
        .route("/peers", get(list_peers))
        .route("/peers/register", post(register_peer))
        .route("/methods", get(list_methods))
        .route(AGENT_CARD_PATH, get(card))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until the process is stopped
pub async fn serve(state: AppState, bind: &str) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("Invalid bind address: {}", bind))?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    tracing::info!(
        %addr,
        agent_id = %state.identity().agent_id,
        repo = %state.identity().repo_name,
        "Agent listening"
    );

    axum::serve(listener, app_router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("Shutdown requested");
        })
        .await
        .context("HTTP server failed")?;
    Ok(())
}

/// Body is taken raw so malformed JSON becomes a JSON-RPC parse error
async fn rpc(State(state): State<AppState>, body: String) -> Json<JsonRpcResponse> {
    Json(state.dispatcher.handle_str(&body))
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    let service = state.dispatcher.service();
    Json(json!({
        "status": "healthy",
        "agentId": service.identity().agent_id,
        "repo": service.identity().repo_name,
        "peerCount": service.directory().len(),
        "projectCount": service.store().len(),
    }))
}

fn peer_json(peer: &Peer) -> Value {
    json!({
        "agentId": peer.agent_id,
        "endpoint": peer.endpoint,
        "repoName": peer.repo_name,
        "role": peer.role,
        "isHealthy": peer.healthy,
        "failedAttempts": peer.failed_attempts,
        "lastSeen": peer.last_seen,
    })
}

async fn list_peers(State(state): State<AppState>) -> Json<Value> {
    let peers: Vec<Value> = state
        .dispatcher
        .service()
        .directory()
        .list()
        .iter()
        .map(peer_json)
        .collect();
    Json(json!({ "peers": peers }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RegisterPeerRequest {
    agent_id: Option<String>,
    endpoint: String,
    repo_name: Option<String>,
    role: Option<String>,
}

/// Register a peer directly, or probe its agent card when no id is given
async fn register_peer(
    State(state): State<AppState>,
    Json(request): Json<RegisterPeerRequest>,
) -> impl IntoResponse {
    let directory = state.dispatcher.service().directory();

    let registered = match request.agent_id {
        Some(agent_id) => directory.register(
            &agent_id,
            &request.endpoint,
            request.repo_name,
            request.role,
        ),
        None => match directory.discover(&state.http, &request.endpoint).await {
            Ok(peer) => peer,
            Err(e) => {
                tracing::warn!(endpoint = %request.endpoint, error = %format!("{:#}", e), "Discovery failed");
                return (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "status": "error", "error": format!("{:#}", e) })),
                );
            }
        },
    };

    let Some(peer) = registered else {
        return (StatusCode::OK, Json(json!({ "status": "ignored" })));
    };

    tokio::spawn(announce_to(
        state.http.clone(),
        peer.endpoint.clone(),
        state.identity().clone(),
    ));

    (
        StatusCode::OK,
        Json(json!({ "status": "registered", "peer": peer_json(&peer) })),
    )
}

/// Tell a newly registered peer about ourselves; failures are only logged
async fn announce_to(client: reqwest::Client, endpoint: String, identity: AgentIdentity) {
    let envelope = json!({
        "jsonrpc": "2.0",
        "method": "cacp/peer/announce",
        "params": {
            "agentId": identity.agent_id,
            "endpoint": identity.endpoint,
            "repoName": identity.repo_name,
            "role": identity.role,
        },
        "id": format!("announce-{}", uuid::Uuid::new_v4()),
    });

    match client.post(&endpoint).json(&envelope).send().await {
        Ok(response) if response.status().is_success() => {
            tracing::debug!(%endpoint, "Announced to peer");
        }
        Ok(response) => {
            tracing::debug!(%endpoint, status = %response.status(), "Peer rejected announcement");
        }
        Err(e) => {
            tracing::debug!(%endpoint, error = %e, "Announcement failed");
        }
    }
}

async fn list_methods() -> Json<Value> {
    let methods: Vec<Value> = METHODS
        .iter()
        .map(|(name, kind)| json!({ "name": name, "kind": kind }))
        .collect();
    Json(json!({ "methods": methods }))
}

async fn card(State(state): State<AppState>) -> Json<Value> {
    let identity = state.identity();
    Json(agent_card(&identity.card(), &identity.endpoint))
}
