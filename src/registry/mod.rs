//! Directory of known peer agents
//!
//! Peers are registered manually, from config, by announcement or by probing
//! an endpoint for its agent card. Unhealthy peers stay broadcast targets.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::models::{ContextType, ContractType};

/// Consecutive failures after which a peer is marked unhealthy
pub const UNHEALTHY_AFTER: u32 = 3;

pub const AGENT_CARD_PATH: &str = "/.well-known/agent.json";

/// A known peer agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Peer {
    pub agent_id: String,
    pub endpoint: String,
    pub repo_name: Option<String>,
    pub role: Option<String>,
    pub last_seen: DateTime<Utc>,
    pub healthy: bool,
    pub failed_attempts: u32,
}

/// Public identity of an agent as advertised in its card
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CardIdentity {
    pub agent_id: String,
    pub repo: String,
    pub role: String,
    pub language: String,
}

/// Build the agent card served at `/.well-known/agent.json`
pub fn agent_card(identity: &CardIdentity, endpoint: &str) -> Value {
    let contract_types: Vec<String> = ContractType::ALL.iter().map(|t| t.to_string()).collect();
    let context_types: Vec<String> = ContextType::ALL.iter().map(|t| t.to_string()).collect();
    json!({
        "name": format!("CACP Agent ({})", identity.repo),
        "description": format!("Coordination agent for the {} repository", identity.repo),
        "version": env!("CARGO_PKG_VERSION"),
        "url": endpoint,
        "protocols": { "cacp": "2.0" },
        "capabilities": [identity.language, identity.role],
        "extensions": {
            "cacp": {
                "agentId": identity.agent_id,
                "repo": identity.repo,
                "role": identity.role,
                "language": identity.language,
                "supportedContractTypes": contract_types,
                "supportedContextTypes": context_types,
            }
        }
    })
}

/// Extract the identity from a fetched agent card
pub fn parse_agent_card(card: &Value) -> Option<CardIdentity> {
    serde_json::from_value(card.get("extensions")?.get("cacp")?.clone()).ok()
}

pub struct PeerDirectory {
    self_agent_id: String,
    peers: RwLock<HashMap<String, Peer>>,
}

impl PeerDirectory {
    pub fn new(self_agent_id: impl Into<String>) -> Self {
        Self {
            self_agent_id: self_agent_id.into(),
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn self_agent_id(&self) -> &str {
        &self.self_agent_id
    }

    /// Register or refresh a peer; registering self is ignored
    pub fn register(
        &self,
        agent_id: &str,
        endpoint: &str,
        repo_name: Option<String>,
        role: Option<String>,
    ) -> Option<Peer> {
        if agent_id == self.self_agent_id {
            return None;
        }
        let peer = Peer {
            agent_id: agent_id.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            repo_name,
            role,
            last_seen: Utc::now(),
            healthy: true,
            failed_attempts: 0,
        };
        self.peers.write().insert(peer.agent_id.clone(), peer.clone());
        tracing::info!(agent_id, endpoint = %peer.endpoint, "Registered peer");
        Some(peer)
    }

    pub fn unregister(&self, agent_id: &str) -> Option<Peer> {
        let removed = self.peers.write().remove(agent_id);
        if removed.is_some() {
            tracing::info!(agent_id, "Unregistered peer");
        }
        removed
    }

    pub fn get(&self, agent_id: &str) -> Option<Peer> {
        self.peers.read().get(agent_id).cloned()
    }

    /// All peers ordered by agent id
    pub fn list(&self) -> Vec<Peer> {
        let mut peers: Vec<Peer> = self.peers.read().values().cloned().collect();
        peers.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        peers
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    pub fn record_success(&self, agent_id: &str) {
        if let Some(peer) = self.peers.write().get_mut(agent_id) {
            peer.last_seen = Utc::now();
            peer.healthy = true;
            peer.failed_attempts = 0;
        }
    }

    /// Count a failed delivery; returns whether the peer is still healthy
    pub fn record_failure(&self, agent_id: &str) -> bool {
        let mut peers = self.peers.write();
        let Some(peer) = peers.get_mut(agent_id) else {
            return false;
        };
        peer.failed_attempts += 1;
        if peer.failed_attempts >= UNHEALTHY_AFTER && peer.healthy {
            peer.healthy = false;
            tracing::warn!(agent_id, failures = peer.failed_attempts, "Peer marked unhealthy");
        }
        peer.healthy
    }

    /// A failed probe marks the peer unhealthy at once
    pub fn mark_unhealthy(&self, agent_id: &str) {
        if let Some(peer) = self.peers.write().get_mut(agent_id) {
            if peer.healthy {
                tracing::warn!(agent_id, endpoint = %peer.endpoint, "Peer failed health check");
            }
            peer.healthy = false;
        }
    }

    /// Probe `/health` on every peer concurrently and record the results
    pub async fn health_check(&self, client: &reqwest::Client, timeout: Duration) -> Vec<(String, bool)> {
        let peers = self.list();
        let probes = peers.iter().map(|peer| async move {
            let url = format!("{}/health", peer.endpoint);
            let healthy = match client.get(&url).timeout(timeout).send().await {
                Ok(response) => response.status().is_success(),
                Err(_) => false,
            };
            (peer.agent_id.clone(), healthy)
        });

        let results = join_all(probes).await;
        for (agent_id, healthy) in &results {
            if *healthy {
                self.record_success(agent_id);
            } else {
                self.mark_unhealthy(agent_id);
            }
        }
        results
    }

    /// Probe an endpoint for its agent card and register the agent behind it
    pub async fn discover(&self, client: &reqwest::Client, endpoint: &str) -> Result<Option<Peer>> {
        let url = format!("{}{}", endpoint.trim_end_matches('/'), AGENT_CARD_PATH);
        let response = client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("Failed to fetch agent card from {}", url))?;

        if !response.status().is_success() {
            anyhow::bail!("Agent card request to {} failed: {}", url, response.status());
        }

        let card: Value = response
            .json()
            .await
            .context("Failed to parse agent card")?;
        let identity = parse_agent_card(&card).context("Agent card has no cacp extension")?;

        Ok(self.register(
            &identity.agent_id,
            endpoint,
            Some(identity.repo),
            Some(identity.role),
        ))
    }
}

/// Re-probe all peers every `interval` until the task is aborted
pub fn spawn_health_monitor(
    directory: Arc<PeerDirectory>,
    client: reqwest::Client,
    interval: Duration,
    timeout: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // first tick fires immediately
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let results = directory.health_check(&client, timeout).await;
            let healthy = results.iter().filter(|(_, ok)| *ok).count();
            tracing::debug!(peers = results.len(), healthy, "Peer health check");
        }
    })
}
