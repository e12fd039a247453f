//! Replication between peer agents
//!
//! A sync message carries one whole entity plus the id of the agent that
//! produced it. Receivers hand it to the conflict resolver and never forward it.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::models::{ContextPacket, Contract, Project, RepoContext};

pub mod conflicts;
pub mod sync;

pub const PROJECT_SYNC: &str = "cacp/project/sync";
pub const CONTRACT_SYNC: &str = "cacp/contract/sync";
pub const CONTEXT_SYNC: &str = "cacp/context/sync";
pub const REPO_SYNC: &str = "cacp/repo/sync";

/// Entity carried by a sync message
#[derive(Debug, Clone, PartialEq)]
pub enum SyncPayload {
    Project(Project),
    Contract { project_id: String, contract: Contract },
    Context { project_id: String, packet: ContextPacket },
    Repo { project_id: String, repo: RepoContext },
}

impl SyncPayload {
    pub fn project_id(&self) -> &str {
        match self {
            SyncPayload::Project(project) => &project.project_id,
            SyncPayload::Contract { project_id, .. }
            | SyncPayload::Context { project_id, .. }
            | SyncPayload::Repo { project_id, .. } => project_id,
        }
    }

    /// Id of the replicated entity itself
    pub fn entity_id(&self) -> &str {
        match self {
            SyncPayload::Project(project) => &project.project_id,
            SyncPayload::Contract { contract, .. } => &contract.contract_id,
            SyncPayload::Context { packet, .. } => &packet.packet_id,
            SyncPayload::Repo { repo, .. } => &repo.repo_id,
        }
    }

    pub fn method(&self) -> &'static str {
        match self {
            SyncPayload::Project(_) => PROJECT_SYNC,
            SyncPayload::Contract { .. } => CONTRACT_SYNC,
            SyncPayload::Context { .. } => CONTEXT_SYNC,
            SyncPayload::Repo { .. } => REPO_SYNC,
        }
    }
}

/// One replicated update as sent between agents
#[derive(Debug, Clone, PartialEq)]
pub struct SyncMessage {
    pub source_agent: String,
    pub payload: SyncPayload,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectParams {
    source_agent: String,
    project: Project,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct NestedParams<T> {
    source_agent: String,
    project_id: String,
    #[serde(alias = "contract", alias = "packet", alias = "repo")]
    entity: T,
}

impl SyncMessage {
    pub fn new(source_agent: impl Into<String>, payload: SyncPayload) -> Self {
        Self {
            source_agent: source_agent.into(),
            payload,
        }
    }

    pub fn method(&self) -> &'static str {
        self.payload.method()
    }

    /// Parameter document sent with the sync method
    pub fn to_params(&self) -> CoreResult<Value> {
        let params = match &self.payload {
            SyncPayload::Project(project) => json!({
                "sourceAgent": self.source_agent,
                "project": serde_json::to_value(project)?,
            }),
            SyncPayload::Contract {
                project_id,
                contract,
            } => json!({
                "sourceAgent": self.source_agent,
                "projectId": project_id,
                "contract": serde_json::to_value(contract)?,
            }),
            SyncPayload::Context { project_id, packet } => json!({
                "sourceAgent": self.source_agent,
                "projectId": project_id,
                "packet": serde_json::to_value(packet)?,
            }),
            SyncPayload::Repo { project_id, repo } => json!({
                "sourceAgent": self.source_agent,
                "projectId": project_id,
                "repo": serde_json::to_value(repo)?,
            }),
        };
        Ok(params)
    }

    /// Decode a sync method call
    pub fn from_params(method: &str, params: Value) -> CoreResult<Self> {
        match method {
            PROJECT_SYNC => {
                let p: ProjectParams = serde_json::from_value(params)?;
                Ok(Self::new(p.source_agent, SyncPayload::Project(p.project)))
            }
            CONTRACT_SYNC => {
                let p: NestedParams<Contract> = serde_json::from_value(params)?;
                Ok(Self::new(
                    p.source_agent,
                    SyncPayload::Contract {
                        project_id: p.project_id,
                        contract: p.entity,
                    },
                ))
            }
            CONTEXT_SYNC => {
                let p: NestedParams<ContextPacket> = serde_json::from_value(params)?;
                Ok(Self::new(
                    p.source_agent,
                    SyncPayload::Context {
                        project_id: p.project_id,
                        packet: p.entity,
                    },
                ))
            }
            REPO_SYNC => {
                let p: NestedParams<RepoContext> = serde_json::from_value(params)?;
                Ok(Self::new(
                    p.source_agent,
                    SyncPayload::Repo {
                        project_id: p.project_id,
                        repo: p.entity,
                    },
                ))
            }
            other => Err(CoreError::validation(format!("Unknown sync method: {}", other))),
        }
    }
}

/// What a receiver did with a sync message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncOutcome {
    /// Entity was unknown locally and has been inserted
    Created,
    /// Incoming copy superseded the local one
    Updated,
    /// Local copy is as new or newer
    Stale,
    /// Referenced project is unknown locally
    Dropped,
}

impl std::fmt::Display for SyncOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncOutcome::Created => write!(f, "created"),
            SyncOutcome::Updated => write!(f, "updated"),
            SyncOutcome::Stale => write!(f, "stale"),
            SyncOutcome::Dropped => write!(f, "dropped"),
        }
    }
}

impl SyncOutcome {
    pub fn applied(&self) -> bool {
        matches!(self, SyncOutcome::Created | SyncOutcome::Updated)
    }
}
