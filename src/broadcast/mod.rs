//! Fan-out of committed local mutations to peers
//!
//! Mutation handlers emit events onto an unbounded channel and return at
//! once. A dispatcher task drains the channel in order and hands each event
//! to one lane per peer. A lane delivers its events one at a time, each call
//! bounded by a timeout, so per-peer order holds while a stalled peer only
//! delays its own lane. Failed deliveries are logged and counted against the
//! peer, nothing else.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::future::join_all;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::collab::SyncMessage;
use crate::error::CoreError;
use crate::registry::{Peer, PeerDirectory};

/// Delivery of one sync message to one peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn send(&self, peer: &Peer, message: &SyncMessage) -> Result<()>;
}

/// Upper bound on establishing a connection to a peer
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON-RPC over HTTP
pub struct HttpTransport {
    client: reqwest::Client,
    agent_id: String,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(agent_id: impl Into<String>, endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("cacp/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .context("Failed to create HTTP client")?;
        Ok(Self::with_client(client, agent_id, endpoint))
    }

    pub fn with_client(
        client: reqwest::Client,
        agent_id: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Self {
        Self {
            client,
            agent_id: agent_id.into(),
            endpoint: endpoint.into(),
        }
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

#[async_trait]
impl PeerTransport for HttpTransport {
    async fn send(&self, peer: &Peer, message: &SyncMessage) -> Result<()> {
        let envelope = json!({
            "jsonrpc": "2.0",
            "method": message.method(),
            "params": message.to_params()?,
            "id": format!("{}-{}", self.agent_id, uuid::Uuid::new_v4()),
        });

        let response = self
            .client
            .post(&peer.endpoint)
            .header("X-Agent-ID", &self.agent_id)
            .header("X-Source-Endpoint", &self.endpoint)
            .json(&envelope)
            .send()
            .await
            .context("Request failed")?;

        if !response.status().is_success() {
            anyhow::bail!("HTTP {}", response.status());
        }

        let body: Value = response.json().await.context("Invalid JSON-RPC response")?;
        if let Some(error) = body.get("error") {
            anyhow::bail!("Peer returned error: {}", error);
        }
        Ok(())
    }
}

/// Work item for the broadcast worker
#[derive(Debug)]
pub enum BroadcastEvent {
    StateChanged(SyncMessage),
    Flush(oneshot::Sender<()>),
    Shutdown(oneshot::Sender<()>),
}

/// Work item for a single peer's lane
enum LaneItem {
    Deliver(Peer, Arc<SyncMessage>),
    Flush(oneshot::Sender<()>),
}

/// Cheap handle used by mutation handlers
#[derive(Clone)]
pub struct Broadcaster {
    tx: mpsc::UnboundedSender<BroadcastEvent>,
}

impl Broadcaster {
    /// Queue a state-changed event; never blocks
    pub fn emit(&self, message: SyncMessage) {
        if self.tx.send(BroadcastEvent::StateChanged(message)).is_err() {
            tracing::debug!("Broadcast worker stopped; dropping state change");
        }
    }

    /// Wait until every previously emitted event has been delivered
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(BroadcastEvent::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }

    /// Drain pending events and stop the worker
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.tx.send(BroadcastEvent::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

/// Sends one message to one peer and books the outcome in the directory
struct Delivery {
    directory: Arc<PeerDirectory>,
    transport: Arc<dyn PeerTransport>,
    timeout: Duration,
}

impl Delivery {
    async fn send(&self, peer: &Peer, message: &SyncMessage) -> Result<(), CoreError> {
        let outcome = tokio::time::timeout(self.timeout, self.transport.send(peer, message)).await;
        let reason = match outcome {
            Ok(Ok(())) => {
                self.directory.record_success(&peer.agent_id);
                return Ok(());
            }
            Ok(Err(e)) => format!("{:#}", e),
            Err(_) => format!("timed out after {} ms", self.timeout.as_millis()),
        };

        let error = CoreError::PeerUnreachable {
            agent_id: peer.agent_id.clone(),
            reason,
        };
        tracing::warn!(
            method = message.method(),
            endpoint = %peer.endpoint,
            error = %error,
            "Broadcast delivery failed"
        );
        self.directory.record_failure(&peer.agent_id);
        Err(error)
    }

    async fn drain_lane(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<LaneItem>) {
        while let Some(item) = rx.recv().await {
            match item {
                LaneItem::Deliver(peer, message) => {
                    if self.send(&peer, &message).await.is_ok() {
                        tracing::debug!(
                            method = message.method(),
                            entity_id = message.payload.entity_id(),
                            agent_id = %peer.agent_id,
                            "Delivered broadcast"
                        );
                    }
                }
                LaneItem::Flush(ack) => {
                    let _ = ack.send(());
                }
            }
        }
    }
}

pub struct BroadcastCoordinator {
    delivery: Arc<Delivery>,
    lanes: HashMap<String, mpsc::UnboundedSender<LaneItem>>,
    lane_tasks: Vec<JoinHandle<()>>,
}

impl BroadcastCoordinator {
    pub fn new(
        directory: Arc<PeerDirectory>,
        transport: Arc<dyn PeerTransport>,
        timeout: Duration,
    ) -> Self {
        Self {
            delivery: Arc::new(Delivery {
                directory,
                transport,
                timeout,
            }),
            lanes: HashMap::new(),
            lane_tasks: Vec::new(),
        }
    }

    /// Start the worker on the current tokio runtime
    pub fn spawn(self) -> (Broadcaster, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = tokio::spawn(self.run(rx));
        (Broadcaster { tx }, handle)
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<BroadcastEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                BroadcastEvent::StateChanged(message) => self.dispatch(message),
                BroadcastEvent::Flush(ack) => {
                    // lanes drain on their own; only the ack waits for them
                    let pending = self.flush_lanes();
                    tokio::spawn(async move {
                        join_all(pending).await;
                        let _ = ack.send(());
                    });
                }
                BroadcastEvent::Shutdown(ack) => {
                    join_all(self.flush_lanes()).await;
                    self.lanes.clear();
                    join_all(self.lane_tasks.drain(..)).await;
                    let _ = ack.send(());
                    break;
                }
            }
        }
        tracing::debug!("Broadcast worker stopped");
    }

    /// Queue a message on the lane of every peer except its source
    fn dispatch(&mut self, message: SyncMessage) {
        let peers: Vec<Peer> = self
            .delivery
            .directory
            .list()
            .into_iter()
            .filter(|p| p.agent_id != message.source_agent)
            .collect();

        if peers.is_empty() {
            tracing::debug!(method = message.method(), "No peers; local-only");
            return;
        }
        tracing::debug!(
            method = message.method(),
            entity_id = message.payload.entity_id(),
            peers = peers.len(),
            "Broadcasting"
        );

        let message = Arc::new(message);
        for peer in peers {
            let lane = self.lane(&peer.agent_id);
            if lane.send(LaneItem::Deliver(peer, message.clone())).is_err() {
                tracing::debug!("Peer lane closed; dropping delivery");
            }
        }
    }

    fn lane(&mut self, agent_id: &str) -> &mpsc::UnboundedSender<LaneItem> {
        let delivery = &self.delivery;
        let lane_tasks = &mut self.lane_tasks;
        self.lanes.entry(agent_id.to_string()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            lane_tasks.push(tokio::spawn(delivery.clone().drain_lane(rx)));
            tx
        })
    }

    /// One receiver per lane, resolved once the lane has drained past it
    fn flush_lanes(&self) -> Vec<oneshot::Receiver<()>> {
        self.lanes
            .values()
            .filter_map(|lane| {
                let (ack, done) = oneshot::channel();
                lane.send(LaneItem::Flush(ack)).ok().map(|_| done)
            })
            .collect()
    }
}
