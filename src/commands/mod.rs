//! CLI commands for cacp

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::task::JoinHandle;

use crate::agent::{AgentIdentity, AgentService};
use crate::broadcast::{BroadcastCoordinator, HttpTransport};
use crate::config::{load_config_from, save_config_to, CacpPaths, Config, PeerEntry};
use crate::db::{open_snapshot_store, SnapshotStore};
use crate::files::FileWorkspace;
use crate::registry::{spawn_health_monitor, PeerDirectory};
use crate::rpc::RpcDispatcher;
use crate::server::{self, AppState};
use crate::store::LocalStore;

/// Initialize cacp for first-time setup
pub fn init(paths: &CacpPaths) -> Result<()> {
    if paths.is_initialized() {
        println!("cacp is already initialized at {}", paths.root.display());
        return Ok(());
    }

    println!("Initializing cacp at {}...", paths.root.display());

    paths.ensure_dirs()?;
    println!("  Created directory structure");

    save_config_to(&Config::default(), &paths.config)?;
    println!("  Created config.toml");

    println!();
    println!("cacp initialized successfully!");
    println!();
    println!("Next steps:");
    println!("  edit {}   Set agent_id and repo_name", paths.config.display());
    println!("  cacp serve                   Start the agent over HTTP");
    println!("  cacp stdio                   Speak JSON-RPC over stdin/stdout");

    Ok(())
}

/// Command-line overrides for `serve`
#[derive(Debug, Default, Clone)]
pub struct ServeOverrides {
    pub bind: Option<String>,
    pub agent_id: Option<String>,
    pub repo: Option<String>,
    pub peers: Vec<String>,
}

/// Parse `agent-id=http://host:port`
pub fn parse_peer_arg(arg: &str) -> Result<PeerEntry> {
    let Some((agent_id, endpoint)) = arg.split_once('=') else {
        bail!("Invalid peer '{}': expected <agent-id>=<endpoint>", arg);
    };
    if agent_id.trim().is_empty() || endpoint.trim().is_empty() {
        bail!("Invalid peer '{}': agent id and endpoint are required", arg);
    }
    Ok(PeerEntry {
        agent_id: agent_id.trim().to_string(),
        endpoint: endpoint.trim().to_string(),
        repo_name: None,
    })
}

/// Effective configuration: file values, then command-line overrides
pub fn effective_config(paths: &CacpPaths, overrides: &ServeOverrides) -> Result<Config> {
    let mut config = load_config_from(&paths.config)?;
    if let Some(bind) = &overrides.bind {
        config.agent.bind = bind.clone();
    }
    if let Some(agent_id) = &overrides.agent_id {
        config.agent.agent_id = agent_id.clone();
    }
    if let Some(repo) = &overrides.repo {
        config.agent.repo_name = repo.clone();
    }
    for arg in &overrides.peers {
        config.peers.push(parse_peer_arg(arg)?);
    }
    Ok(config)
}

/// A running agent: service, dispatcher and the background tasks
pub struct AgentRuntime {
    pub dispatcher: RpcDispatcher,
    pub http: reqwest::Client,
    worker: JoinHandle<()>,
    health: Option<JoinHandle<()>>,
}

impl AgentRuntime {
    /// Rehydrate the store, seed the directory and start the broadcast worker
    pub fn start(config: &Config, paths: &CacpPaths) -> Result<Self> {
        let identity = AgentIdentity::from_config(&config.agent);

        let persistence = open_snapshot_store(
            config.persistence.backend,
            paths.snapshot_path(&config.persistence).as_deref(),
        )?;
        let store = Arc::new(load_store(persistence.as_deref())?);

        let directory = Arc::new(PeerDirectory::new(identity.agent_id.clone()));
        for peer in &config.peers {
            directory.register(&peer.agent_id, &peer.endpoint, peer.repo_name.clone(), None);
        }

        let transport = HttpTransport::new(identity.agent_id.clone(), identity.endpoint.clone())?;
        let http = transport.client().clone();
        let (broadcaster, worker) = BroadcastCoordinator::new(
            directory.clone(),
            Arc::new(transport),
            config.broadcast.timeout(),
        )
        .spawn();

        let health = config.broadcast.health_interval().map(|interval| {
            spawn_health_monitor(
                directory.clone(),
                http.clone(),
                interval,
                config.broadcast.timeout(),
            )
        });

        tracing::info!(
            agent_id = %identity.agent_id,
            repo = %identity.repo_name,
            backend = %config.persistence.backend,
            projects = store.len(),
            peers = directory.len(),
            "Agent started"
        );

        let service = AgentService::new(identity, store, directory, broadcaster, persistence)
            .with_file_workspace(FileWorkspace::new(paths.workspace_path(&config.files)));
        Ok(Self {
            dispatcher: RpcDispatcher::new(Arc::new(service)),
            http,
            worker,
            health,
        })
    }

    /// Stop probing peers, drain pending broadcasts and stop the worker
    pub async fn stop(self) -> Result<()> {
        if let Some(health) = &self.health {
            health.abort();
        }
        self.dispatcher.service().broadcaster().shutdown().await;
        self.worker.await.context("Broadcast worker panicked")?;
        Ok(())
    }
}

fn load_store(persistence: Option<&dyn SnapshotStore>) -> Result<LocalStore> {
    let Some(persistence) = persistence else {
        return Ok(LocalStore::new());
    };
    match persistence.load()? {
        Some(snapshot) => {
            LocalStore::from_snapshot(snapshot).context("Failed to rehydrate saved snapshot")
        }
        None => Ok(LocalStore::new()),
    }
}

/// Serve JSON-RPC over HTTP until interrupted
pub async fn serve(paths: &CacpPaths, overrides: &ServeOverrides) -> Result<()> {
    let config = effective_config(paths, overrides)?;
    let runtime = AgentRuntime::start(&config, paths)?;

    let state = AppState::new(runtime.dispatcher.clone(), runtime.http.clone());
    server::serve(state, &config.agent.bind).await?;

    runtime.stop().await
}

/// Serve JSON-RPC over stdin/stdout until EOF
pub async fn stdio(paths: &CacpPaths) -> Result<()> {
    let config = effective_config(paths, &ServeOverrides::default())?;
    let runtime = AgentRuntime::start(&config, paths)?;
    runtime.dispatcher.run_stdio().await?;
    runtime.stop().await
}

/// Print the effective configuration as TOML
pub fn show_config(paths: &CacpPaths) -> Result<()> {
    let config = load_config_from(&paths.config)?;
    let rendered = toml::to_string_pretty(&config).context("Failed to serialize config")?;
    println!("# {}", paths.config.display());
    print!("{}", rendered);
    Ok(())
}

/// List projects held in the saved snapshot
pub fn projects(paths: &CacpPaths) -> Result<()> {
    let config = load_config_from(&paths.config)?;
    let persistence = open_snapshot_store(
        config.persistence.backend,
        paths.snapshot_path(&config.persistence).as_deref(),
    )?;
    let Some(persistence) = persistence else {
        bail!("Persistence is disabled; set [persistence] backend in config.toml");
    };

    let projects = persistence.load()?.map(|s| s.projects).unwrap_or_default();
    if projects.is_empty() {
        println!("No projects found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<24} {:<14} {:>5} {:>9}",
        "ID", "NAME", "STATUS", "REPOS", "CONTRACTS"
    );
    println!("{}", "-".repeat(94));
    for project in projects {
        println!(
            "{:<38} {:<24} {:<14} {:>5} {:>9}",
            project.project_id,
            truncate(&project.name, 22),
            project.status,
            project.repos.len(),
            project.contracts.len()
        );
    }
    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}
