//! Configuration management for cacp
//!
//! Handles the ~/.cacp/ directory structure and config.toml

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Where the local store snapshot is kept
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum PersistenceBackend {
    #[default]
    None,
    Json,
    Sqlite,
}

impl std::fmt::Display for PersistenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PersistenceBackend::None => write!(f, "none"),
            PersistenceBackend::Json => write!(f, "json"),
            PersistenceBackend::Sqlite => write!(f, "sqlite"),
        }
    }
}

impl std::str::FromStr for PersistenceBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "none" => Ok(PersistenceBackend::None),
            "json" => Ok(PersistenceBackend::Json),
            "sqlite" => Ok(PersistenceBackend::Sqlite),
            _ => Err(format!(
                "Invalid persistence backend: {}. Use: none, json, sqlite",
                s
            )),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub agent: AgentSection,
    #[serde(default)]
    pub broadcast: BroadcastSection,
    #[serde(default)]
    pub persistence: PersistenceSection,
    #[serde(default)]
    pub files: FilesSection,
    #[serde(default)]
    pub peers: Vec<PeerEntry>,
}

/// Identity of this agent and the repo it owns
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AgentSection {
    pub agent_id: String,
    pub repo_name: String,
    pub role: String,
    pub language: String,
    pub endpoint: Option<String>,
    pub bind: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            agent_id: "cacp-agent".to_string(),
            repo_name: "local-repo".to_string(),
            role: "backend".to_string(),
            language: "rust".to_string(),
            endpoint: None,
            bind: "127.0.0.1:8080".to_string(),
        }
    }
}

impl AgentSection {
    /// Endpoint advertised to peers
    pub fn public_endpoint(&self) -> String {
        self.endpoint
            .clone()
            .unwrap_or_else(|| format!("http://{}", self.bind))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct BroadcastSection {
    pub timeout_ms: u64,
    /// Seconds between peer health probes; 0 turns them off
    pub health_interval_secs: u64,
}

impl Default for BroadcastSection {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            health_interval_secs: 30,
        }
    }
}

impl BroadcastSection {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn health_interval(&self) -> Option<Duration> {
        (self.health_interval_secs > 0).then(|| Duration::from_secs(self.health_interval_secs))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PersistenceSection {
    #[serde(default)]
    pub backend: PersistenceBackend,
    pub path: Option<PathBuf>,
}

/// Where files shared by peers are written
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct FilesSection {
    pub workspace: Option<PathBuf>,
}

/// A statically configured peer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PeerEntry {
    pub agent_id: String,
    pub endpoint: String,
    pub repo_name: Option<String>,
}

/// Returns the path to the cacp home directory (~/.cacp)
pub fn cacp_home() -> Result<PathBuf> {
    let home = dirs::home_dir().context("Could not determine home directory")?;
    Ok(home.join(".cacp"))
}

/// Returns paths to all cacp files
pub struct CacpPaths {
    pub root: PathBuf,
    pub config: PathBuf,
    pub data: PathBuf,
    pub db_file: PathBuf,
    pub snapshot_file: PathBuf,
    pub workspace: PathBuf,
}

impl CacpPaths {
    pub fn new() -> Result<Self> {
        Ok(Self::at(cacp_home()?))
    }

    pub fn at(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        Self {
            config: root.join("config.toml"),
            data: root.join("data"),
            db_file: root.join("data/cacp.db"),
            snapshot_file: root.join("data/snapshot.json"),
            workspace: root.join("workspace"),
            root,
        }
    }

    /// Create all directories if they don't exist
    pub fn ensure_dirs(&self) -> Result<()> {
        fs::create_dir_all(&self.root).context("Failed to create cacp root")?;
        fs::create_dir_all(&self.data).context("Failed to create data directory")?;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.config.exists()
    }

    /// Shared-file directory, honouring an explicit override
    pub fn workspace_path(&self, files: &FilesSection) -> PathBuf {
        files.workspace.clone().unwrap_or_else(|| self.workspace.clone())
    }

    /// Snapshot location for a backend, honouring an explicit override
    pub fn snapshot_path(&self, persistence: &PersistenceSection) -> Option<PathBuf> {
        if let Some(path) = &persistence.path {
            return Some(path.clone());
        }
        match persistence.backend {
            PersistenceBackend::None => None,
            PersistenceBackend::Json => Some(self.snapshot_file.clone()),
            PersistenceBackend::Sqlite => Some(self.db_file.clone()),
        }
    }
}

/// Load configuration from ~/.cacp/config.toml, defaults when absent
pub fn load_config() -> Result<Config> {
    let paths = CacpPaths::new()?;
    load_config_from(&paths.config)
}

pub fn load_config_from(path: &Path) -> Result<Config> {
    if !path.exists() {
        return Ok(Config::default());
    }
    let content = fs::read_to_string(path).context("Failed to read config.toml")?;
    toml::from_str(&content).context("Failed to parse config.toml")
}

/// Save configuration to disk
pub fn save_config(config: &Config) -> Result<()> {
    let paths = CacpPaths::new()?;
    save_config_to(config, &paths.config)
}

pub fn save_config_to(config: &Config, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config).context("Failed to serialize config")?;
    fs::write(path, content).context("Failed to write config.toml")?;
    Ok(())
}
