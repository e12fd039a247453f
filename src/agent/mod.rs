//! Agent service: every coordination operation for one agent
//!
//! Each mutating operation validates its input, commits to the local store
//! under the project's lock, saves a snapshot, and then emits a state change
//! for the broadcast worker. The caller's result never waits on peers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Deserialize;

use crate::broadcast::Broadcaster;
use crate::collab::{self, SyncMessage, SyncOutcome, SyncPayload};
use crate::config::AgentSection;
use crate::db::SnapshotStore;
use crate::error::{CoreError, CoreResult};
use crate::files::{FileRequest, FileWorkspace, SavedFile, SharedFile};
use crate::models::{
    ContextPacket, ContextType, Contract, ContractStatus, ContractType, Document, Project,
    ProjectStatus, RepoContext, ResponseAction, VerifyResult,
};
use crate::registry::{CardIdentity, Peer, PeerDirectory};
use crate::store::{LocalStore, PacketFilter};
use crate::validation;
use crate::workflow::{LifecycleEngine, Transition};

/// Who this agent is; trusted when stamping authorship
#[derive(Debug, Clone, PartialEq)]
pub struct AgentIdentity {
    pub agent_id: String,
    pub repo_name: String,
    pub role: String,
    pub language: String,
    pub endpoint: String,
}

impl AgentIdentity {
    pub fn from_config(agent: &AgentSection) -> Self {
        Self {
            agent_id: agent.agent_id.clone(),
            repo_name: agent.repo_name.clone(),
            role: agent.role.clone(),
            language: agent.language.clone(),
            endpoint: agent.public_endpoint(),
        }
    }

    pub fn card(&self) -> CardIdentity {
        CardIdentity {
            agent_id: self.agent_id.clone(),
            repo: self.repo_name.clone(),
            role: self.role.clone(),
            language: self.language.clone(),
        }
    }
}

// ----------------------------------------------------------------------
// Parameter documents
// ----------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepoSpec {
    pub name: String,
    pub role: String,
    pub language: String,
    #[serde(default)]
    pub relevant_paths: Vec<String>,
    pub url: Option<String>,
}

impl RepoSpec {
    fn into_repo(self) -> RepoContext {
        let mut repo = RepoContext::new(self.name, self.role, self.language);
        repo.relevant_paths = self.relevant_paths;
        repo.url = self.url;
        repo
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateProjectParams {
    pub name: String,
    #[serde(default)]
    pub objective: String,
    #[serde(default)]
    pub repos: Vec<RepoSpec>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinProjectParams {
    pub project_id: String,
    pub repo_name: Option<String>,
    pub agent_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusParams {
    pub project_id: String,
    pub status: ProjectStatus,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddRepoParams {
    pub project_id: String,
    pub repo: RepoSpec,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposeParams {
    pub project_id: String,
    #[serde(rename = "type")]
    pub contract_type: ContractType,
    pub name: String,
    pub content: Document,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RespondParams {
    pub project_id: String,
    pub contract_id: String,
    pub action: ResponseAction,
    pub comment: Option<String>,
    pub suggested_change: Option<Document>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateContractParams {
    pub project_id: String,
    pub contract_id: String,
    pub content: Document,
    pub change_notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListContractsParams {
    pub project_id: String,
    pub status: Option<ContractStatus>,
    #[serde(rename = "type")]
    pub contract_type: Option<ContractType>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareParams {
    pub project_id: String,
    #[serde(rename = "type")]
    pub packet_type: ContextType,
    pub content: Document,
    #[serde(default)]
    pub related_contracts: Vec<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AskQuestionParams {
    pub project_id: String,
    pub question: String,
    pub options: Option<Vec<String>>,
    #[serde(default)]
    pub urgent: bool,
    #[serde(default)]
    pub related_contracts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordDecisionParams {
    pub project_id: String,
    pub decision: String,
    pub chosen: String,
    pub rationale: String,
    #[serde(default)]
    pub implications: Vec<String>,
    #[serde(default)]
    pub related_contracts: Vec<String>,
    pub reply_to: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListContextParams {
    pub project_id: String,
    #[serde(rename = "type")]
    pub packet_type: Option<ContextType>,
    pub contract_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartImplementationParams {
    pub project_id: String,
    pub contract_id: String,
    pub plan: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteImplementationParams {
    pub project_id: String,
    pub contract_id: String,
    #[serde(default)]
    pub files: Vec<String>,
    pub notes: Option<String>,
    pub test_endpoint: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyParams {
    pub project_id: String,
    pub contract_id: String,
    pub result: VerifyResult,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnounceParams {
    pub agent_id: String,
    pub endpoint: String,
    pub repo_name: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShareFileParams {
    pub project_id: String,
    pub file: SharedFile,
    pub purpose: Option<String>,
    #[serde(default)]
    pub related_contracts: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestFileParams {
    pub project_id: String,
    pub description: String,
    pub suggested_format: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillFileParams {
    pub request_id: String,
    pub file: SharedFile,
}

// ----------------------------------------------------------------------
// Service
// ----------------------------------------------------------------------

pub struct AgentService {
    identity: AgentIdentity,
    store: Arc<LocalStore>,
    directory: Arc<PeerDirectory>,
    broadcaster: Broadcaster,
    persistence: Option<Arc<dyn SnapshotStore>>,
    // Held across snapshot and save so saves land in commit order
    save_lock: Mutex<()>,
    files: Option<FileWorkspace>,
}

impl AgentService {
    pub fn new(
        identity: AgentIdentity,
        store: Arc<LocalStore>,
        directory: Arc<PeerDirectory>,
        broadcaster: Broadcaster,
        persistence: Option<Arc<dyn SnapshotStore>>,
    ) -> Self {
        Self {
            identity,
            store,
            directory,
            broadcaster,
            persistence,
            save_lock: Mutex::new(()),
            files: None,
        }
    }

    /// Accept shared files into `workspace`
    pub fn with_file_workspace(mut self, workspace: FileWorkspace) -> Self {
        self.files = Some(workspace);
        self
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.identity
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    pub fn directory(&self) -> &Arc<PeerDirectory> {
        &self.directory
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    fn persist(&self) {
        let Some(persistence) = &self.persistence else {
            return;
        };
        let _guard = self.save_lock.lock();
        if let Err(e) = persistence.save(&self.store.snapshot()) {
            tracing::error!(error = %format!("{:#}", e), "Failed to save snapshot");
        }
    }

    /// Persist, then hand the change to the broadcast worker
    fn committed(&self, payload: SyncPayload) {
        self.persist();
        self.broadcaster
            .emit(SyncMessage::new(self.identity.agent_id.clone(), payload));
    }

    /// The repo this agent holds in `project`
    fn member_repo<'a>(&self, project: &'a Project) -> CoreResult<&'a RepoContext> {
        let mine = |r: &&RepoContext| {
            r.assigned_agent.as_deref() == Some(self.identity.agent_id.as_str())
        };
        project
            .repos
            .iter()
            .filter(mine)
            .find(|r| r.name == self.identity.repo_name)
            .or_else(|| project.repos.iter().find(mine))
            .ok_or_else(|| CoreError::NotAMember {
                repo: self.identity.repo_name.clone(),
                project_id: project.project_id.clone(),
            })
    }

    fn member_repo_id(&self, project_id: &str) -> CoreResult<String> {
        self.store
            .read_project(project_id, |p| self.member_repo(p).map(|r| r.repo_id.clone()))?
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub fn create_project(&self, params: CreateProjectParams) -> CoreResult<Project> {
        validation::require_non_empty(&params.name, "name")?;

        let repos = params
            .repos
            .into_iter()
            .map(|spec| {
                let mut repo = spec.into_repo();
                if repo.name == self.identity.repo_name {
                    repo.assigned_agent = Some(self.identity.agent_id.clone());
                    repo.agent_endpoint = Some(self.identity.endpoint.clone());
                }
                repo
            })
            .collect();

        let project = self
            .store
            .create_project(Project::new(params.name, params.objective, repos))?;
        tracing::info!(project_id = %project.project_id, name = %project.name, "Created project");

        self.committed(SyncPayload::Project(project.clone()));
        Ok(project)
    }

    /// Claim a repo in a project for this agent
    pub fn join_project(&self, params: JoinProjectParams) -> CoreResult<(String, RepoContext)> {
        let repo_name = params
            .repo_name
            .unwrap_or_else(|| self.identity.repo_name.clone());
        let endpoint = params
            .agent_endpoint
            .unwrap_or_else(|| self.identity.endpoint.clone());
        let agent_id = self.identity.agent_id.clone();

        let repo = self.store.update_repo(&params.project_id, &repo_name, |repo| {
            if let Some(owner) = &repo.assigned_agent {
                if *owner != agent_id {
                    return Err(CoreError::validation(format!(
                        "Repo {} already claimed by another agent",
                        repo.name
                    )));
                }
            }
            repo.assigned_agent = Some(agent_id.clone());
            repo.agent_endpoint = Some(endpoint);
            Ok(())
        })?;
        let project_name = self.store.read_project(&params.project_id, |p| p.name.clone())?;
        tracing::info!(project_id = %params.project_id, repo = %repo.name, "Joined project");

        self.committed(SyncPayload::Repo {
            project_id: params.project_id,
            repo: repo.clone(),
        });
        Ok((project_name, repo))
    }

    pub fn get_project(&self, project_id: &str) -> CoreResult<Project> {
        self.store.get_project(project_id)
    }

    pub fn list_projects(&self) -> Vec<Project> {
        self.store.list_projects()
    }

    pub fn update_project_status(&self, params: UpdateStatusParams) -> CoreResult<Project> {
        let project = self.store.with_project(&params.project_id, |project| {
            self.member_repo(project)?;
            project.status = params.status;
            project.bump();
            Ok(project.clone())
        })?;
        tracing::info!(project_id = %project.project_id, status = %project.status, "Updated project status");

        self.committed(SyncPayload::Project(project.clone()));
        Ok(project)
    }

    pub fn add_repo(&self, params: AddRepoParams) -> CoreResult<RepoContext> {
        self.member_repo_id(&params.project_id)?;
        let repo = self
            .store
            .add_repo(&params.project_id, params.repo.into_repo())?;
        tracing::info!(project_id = %params.project_id, repo = %repo.name, "Added repo");

        self.committed(SyncPayload::Repo {
            project_id: params.project_id,
            repo: repo.clone(),
        });
        Ok(repo)
    }

    // ------------------------------------------------------------------
    // Contracts
    // ------------------------------------------------------------------

    pub fn propose_contract(&self, params: ProposeParams) -> CoreResult<Contract> {
        validation::require_non_empty(&params.name, "name")?;
        validation::validate_contract_content(params.contract_type, &params.content)?;
        let repo_id = self.member_repo_id(&params.project_id)?;

        let contract = self.store.add_contract(
            &params.project_id,
            Contract::new(params.contract_type, params.name, params.content, repo_id),
        )?;
        tracing::info!(
            project_id = %params.project_id,
            contract_id = %contract.contract_id,
            contract_type = %contract.contract_type,
            "Proposed contract"
        );

        self.committed(SyncPayload::Contract {
            project_id: params.project_id,
            contract: contract.clone(),
        });
        Ok(contract)
    }

    /// Run a lifecycle operation on a contract as this agent's repo
    fn transition<T>(
        &self,
        project_id: &str,
        contract_id: &str,
        op: impl FnOnce(&mut Contract, &str, &[RepoContext]) -> CoreResult<T>,
    ) -> CoreResult<(Contract, T)> {
        let repo_id = self.member_repo_id(project_id)?;
        let (contract, out) = self
            .store
            .update_contract(project_id, contract_id, |contract, repos| {
                op(contract, &repo_id, repos)
            })?;

        self.committed(SyncPayload::Contract {
            project_id: project_id.to_string(),
            contract: contract.clone(),
        });
        Ok((contract, out))
    }

    pub fn respond_contract(&self, params: RespondParams) -> CoreResult<(Contract, Transition)> {
        let (contract, transition) =
            self.transition(&params.project_id, &params.contract_id, |contract, repo_id, _| {
                LifecycleEngine::respond(
                    contract,
                    repo_id,
                    params.action,
                    params.comment,
                    params.suggested_change,
                )
            })?;
        tracing::info!(
            contract_id = %contract.contract_id,
            action = %params.action,
            from = %transition.from,
            to = %transition.to,
            "Responded to contract"
        );
        Ok((contract, transition))
    }

    pub fn update_contract(&self, params: UpdateContractParams) -> CoreResult<Contract> {
        let contract_type = self
            .store
            .get_contract(&params.project_id, &params.contract_id)?
            .contract_type;
        validation::validate_contract_content(contract_type, &params.content)?;

        let (contract, _) =
            self.transition(&params.project_id, &params.contract_id, |contract, repo_id, _| {
                LifecycleEngine::update(contract, params.content, repo_id, params.change_notes)
            })?;
        tracing::info!(
            contract_id = %contract.contract_id,
            version = contract.version,
            "Updated contract content"
        );
        Ok(contract)
    }

    pub fn get_contract(&self, project_id: &str, contract_id: &str) -> CoreResult<Contract> {
        self.store.get_contract(project_id, contract_id)
    }

    pub fn list_contracts(&self, params: ListContractsParams) -> CoreResult<Vec<Contract>> {
        self.store
            .list_contracts(&params.project_id, params.status, params.contract_type)
    }

    // ------------------------------------------------------------------
    // Context
    // ------------------------------------------------------------------

    pub fn share_context(&self, params: ShareParams) -> CoreResult<ContextPacket> {
        validation::validate_context_content(params.packet_type, &params.content)?;
        let project_id = params.project_id;

        let packet = self.store.with_project(&project_id, |project| {
            let repo_id = self.member_repo(project)?.repo_id.clone();
            if let Some(reply_to) = &params.reply_to {
                if project.packet(reply_to).is_none() {
                    return Err(CoreError::not_found("ContextPacket", reply_to));
                }
            }
            if let Some(missing) = params
                .related_contracts
                .iter()
                .find(|id| project.contract(id).is_none())
            {
                return Err(CoreError::not_found("Contract", missing));
            }

            let mut packet = ContextPacket::new(
                repo_id,
                self.identity.agent_id.clone(),
                params.packet_type,
                params.content,
            );
            packet.related_contracts = params.related_contracts;
            packet.reply_to = params.reply_to;
            project.touch(packet.timestamp);
            project.context_history.push(packet.clone());
            Ok(packet)
        })?;
        tracing::info!(
            project_id = %project_id,
            packet_id = %packet.packet_id,
            packet_type = %packet.packet_type,
            "Shared context"
        );

        self.committed(SyncPayload::Context {
            project_id,
            packet: packet.clone(),
        });
        Ok(packet)
    }

    pub fn ask_question(&self, params: AskQuestionParams) -> CoreResult<ContextPacket> {
        let mut content = Document::new();
        content.insert("question".to_string(), params.question.into());
        if let Some(options) = params.options {
            content.insert("options".to_string(), options.into());
        }
        content.insert("urgent".to_string(), params.urgent.into());

        self.share_context(ShareParams {
            project_id: params.project_id,
            packet_type: ContextType::Question,
            content,
            related_contracts: params.related_contracts,
            reply_to: None,
        })
    }

    pub fn record_decision(&self, params: RecordDecisionParams) -> CoreResult<ContextPacket> {
        let mut content = Document::new();
        content.insert("decision".to_string(), params.decision.into());
        content.insert("chosen".to_string(), params.chosen.into());
        content.insert("rationale".to_string(), params.rationale.into());
        content.insert("implications".to_string(), params.implications.into());

        self.share_context(ShareParams {
            project_id: params.project_id,
            packet_type: ContextType::Decision,
            content,
            related_contracts: params.related_contracts,
            reply_to: params.reply_to,
        })
    }

    pub fn list_context(&self, params: ListContextParams) -> CoreResult<Vec<ContextPacket>> {
        let filter = PacketFilter {
            packet_type: params.packet_type,
            contract_id: params.contract_id,
            since: params.since,
            limit: params.limit,
        };
        self.store.list_packets(&params.project_id, &filter)
    }

    /// Root packet followed by its replies
    pub fn get_thread(&self, project_id: &str, packet_id: &str) -> CoreResult<Vec<ContextPacket>> {
        let (root, replies) = self.store.thread(project_id, packet_id)?;
        let mut thread = Vec::with_capacity(replies.len() + 1);
        thread.push(root);
        thread.extend(replies);
        Ok(thread)
    }

    // ------------------------------------------------------------------
    // Implementation
    // ------------------------------------------------------------------

    /// Returns the contract and the repo id the implementation is recorded under
    pub fn start_implementation(
        &self,
        params: StartImplementationParams,
    ) -> CoreResult<(Contract, String)> {
        let agent_id = self.identity.agent_id.clone();
        let (contract, repo_id) =
            self.transition(&params.project_id, &params.contract_id, |contract, repo_id, _| {
                LifecycleEngine::start_implementation(
                    contract,
                    repo_id,
                    &agent_id,
                    params.plan,
                    params.files,
                )
                .map(|_| repo_id.to_string())
            })?;
        tracing::info!(contract_id = %contract.contract_id, repo_id = %repo_id, "Started implementation");
        Ok((contract, repo_id))
    }

    pub fn complete_implementation(
        &self,
        params: CompleteImplementationParams,
    ) -> CoreResult<(Contract, Transition)> {
        let (contract, transition) =
            self.transition(&params.project_id, &params.contract_id, |contract, repo_id, repos| {
                LifecycleEngine::complete_implementation(
                    contract,
                    repo_id,
                    params.files,
                    params.notes,
                    params.test_endpoint,
                    repos.iter().map(|r| r.repo_id.as_str()),
                )
            })?;
        tracing::info!(
            contract_id = %contract.contract_id,
            status = %contract.status,
            "Completed implementation"
        );
        Ok((contract, transition))
    }

    pub fn verify_implementation(&self, params: VerifyParams) -> CoreResult<(Contract, Transition)> {
        let (contract, transition) =
            self.transition(&params.project_id, &params.contract_id, |contract, repo_id, _| {
                LifecycleEngine::verify(contract, repo_id, params.result, params.notes)
            })?;
        tracing::info!(
            contract_id = %contract.contract_id,
            result = %params.result,
            status = %contract.status,
            "Verified implementation"
        );
        Ok((contract, transition))
    }

    pub fn implementation_status(&self, project_id: &str, contract_id: &str) -> CoreResult<Contract> {
        self.store.get_contract(project_id, contract_id)
    }

    // ------------------------------------------------------------------
    // Files
    // ------------------------------------------------------------------

    fn files(&self) -> CoreResult<&FileWorkspace> {
        self.files
            .as_ref()
            .ok_or_else(|| CoreError::validation("File sharing is disabled: no workspace configured"))
    }

    /// Store a file another agent sent into this agent's workspace
    pub fn share_file(&self, params: ShareFileParams) -> CoreResult<SavedFile> {
        let files = self.files()?;
        self.store.read_project(&params.project_id, |project| {
            self.member_repo(project)?;
            match params
                .related_contracts
                .iter()
                .find(|id| project.contract(id).is_none())
            {
                Some(missing) => Err(CoreError::not_found("Contract", missing.clone())),
                None => Ok(()),
            }
        })??;

        let saved = files.save(&params.project_id, &params.file)?;
        tracing::info!(
            project_id = %params.project_id,
            path = %saved.saved_to.display(),
            size = saved.size,
            purpose = params.purpose.as_deref().unwrap_or(""),
            "Received file"
        );
        Ok(saved)
    }

    pub fn request_file(&self, params: RequestFileParams) -> CoreResult<FileRequest> {
        validation::require_non_empty(&params.description, "description")?;
        let files = self.files()?;
        let repo_id = self.member_repo_id(&params.project_id)?;
        let request = files.add_request(
            &params.project_id,
            &repo_id,
            params.description,
            params.suggested_format,
        );
        tracing::info!(project_id = %params.project_id, request_id = %request.request_id, "Recorded file request");
        Ok(request)
    }

    pub fn list_file_requests(&self, project_id: &str) -> CoreResult<Vec<FileRequest>> {
        let files = self.files()?;
        self.store.read_project(project_id, |_| ())?;
        Ok(files.requests(project_id))
    }

    pub fn fulfill_file_request(&self, params: FulfillFileParams) -> CoreResult<SavedFile> {
        let files = self.files()?;
        let request = files.request(&params.request_id)?;
        self.member_repo_id(&request.project_id)?;

        let (request, saved) = files.fulfill(&params.request_id, &params.file)?;
        tracing::info!(
            request_id = %request.request_id,
            path = %saved.saved_to.display(),
            "Fulfilled file request"
        );
        Ok(saved)
    }

    // ------------------------------------------------------------------
    // Peers and replication
    // ------------------------------------------------------------------

    /// Apply a sync message from a peer; never re-broadcast
    pub fn receive_sync(&self, message: &SyncMessage) -> CoreResult<SyncOutcome> {
        let outcome = collab::sync::apply(&self.store, message)?;
        if outcome.applied() {
            self.persist();
        }
        Ok(outcome)
    }

    pub fn announce(&self, params: AnnounceParams) -> Option<Peer> {
        self.directory
            .register(&params.agent_id, &params.endpoint, params.repo_name, params.role)
    }
}
