//! Data models for replicated coordination state
//!
//! A Project owns its repos, contracts and context packets. Cross references
//! (repo ids inside a contract, contract ids inside a packet) are plain ids
//! resolved by lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque structured document (contract content, packet content)
pub type Document = serde_json::Map<String, Value>;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current time, strictly after `prev` even if the clock lags behind it
pub fn next_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + chrono::Duration::microseconds(1)
    }
}

/// Project lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProjectStatus {
    #[default]
    Planning,
    Implementing,
    Integrating,
    Complete,
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProjectStatus::Planning => write!(f, "planning"),
            ProjectStatus::Implementing => write!(f, "implementing"),
            ProjectStatus::Integrating => write!(f, "integrating"),
            ProjectStatus::Complete => write!(f, "complete"),
        }
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "planning" => Ok(ProjectStatus::Planning),
            "implementing" => Ok(ProjectStatus::Implementing),
            "integrating" => Ok(ProjectStatus::Integrating),
            "complete" => Ok(ProjectStatus::Complete),
            _ => Err(format!(
                "Invalid project status: {}. Use: planning, implementing, integrating, complete",
                s
            )),
        }
    }
}

/// Kind of interface a contract describes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContractType {
    ApiEndpoint,
    EventSchema,
    DataModel,
    ConfigSpec,
    RpcInterface,
    Custom,
}

impl ContractType {
    pub const ALL: [ContractType; 6] = [
        ContractType::ApiEndpoint,
        ContractType::EventSchema,
        ContractType::DataModel,
        ContractType::ConfigSpec,
        ContractType::RpcInterface,
        ContractType::Custom,
    ];
}

impl std::fmt::Display for ContractType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractType::ApiEndpoint => write!(f, "api_endpoint"),
            ContractType::EventSchema => write!(f, "event_schema"),
            ContractType::DataModel => write!(f, "data_model"),
            ContractType::ConfigSpec => write!(f, "config_spec"),
            ContractType::RpcInterface => write!(f, "rpc_interface"),
            ContractType::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for ContractType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "api_endpoint" => Ok(ContractType::ApiEndpoint),
            "event_schema" => Ok(ContractType::EventSchema),
            "data_model" => Ok(ContractType::DataModel),
            "config_spec" => Ok(ContractType::ConfigSpec),
            "rpc_interface" => Ok(ContractType::RpcInterface),
            "custom" => Ok(ContractType::Custom),
            _ => Err(format!("Invalid contract type: {}", s)),
        }
    }
}

/// Contract lifecycle status
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContractStatus {
    Proposed,
    Negotiating,
    Agreed,
    Implemented,
    Verified,
    Rejected,
}

impl std::fmt::Display for ContractStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContractStatus::Proposed => write!(f, "proposed"),
            ContractStatus::Negotiating => write!(f, "negotiating"),
            ContractStatus::Agreed => write!(f, "agreed"),
            ContractStatus::Implemented => write!(f, "implemented"),
            ContractStatus::Verified => write!(f, "verified"),
            ContractStatus::Rejected => write!(f, "rejected"),
        }
    }
}

impl std::str::FromStr for ContractStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "proposed" => Ok(ContractStatus::Proposed),
            "negotiating" => Ok(ContractStatus::Negotiating),
            "agreed" => Ok(ContractStatus::Agreed),
            "implemented" => Ok(ContractStatus::Implemented),
            "verified" => Ok(ContractStatus::Verified),
            "rejected" => Ok(ContractStatus::Rejected),
            _ => Err(format!("Invalid contract status: {}", s)),
        }
    }
}

/// Kind of shared context carried by a packet
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    CodeSnippet,
    TypeDefinition,
    ApiSpec,
    ErrorCatalog,
    EnvConfig,
    TestCase,
    DependencyInfo,
    ImplementationStatus,
    Question,
    Decision,
}

impl ContextType {
    pub const ALL: [ContextType; 10] = [
        ContextType::CodeSnippet,
        ContextType::TypeDefinition,
        ContextType::ApiSpec,
        ContextType::ErrorCatalog,
        ContextType::EnvConfig,
        ContextType::TestCase,
        ContextType::DependencyInfo,
        ContextType::ImplementationStatus,
        ContextType::Question,
        ContextType::Decision,
    ];
}

impl std::fmt::Display for ContextType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ContextType::CodeSnippet => "code_snippet",
            ContextType::TypeDefinition => "type_definition",
            ContextType::ApiSpec => "api_spec",
            ContextType::ErrorCatalog => "error_catalog",
            ContextType::EnvConfig => "env_config",
            ContextType::TestCase => "test_case",
            ContextType::DependencyInfo => "dependency_info",
            ContextType::ImplementationStatus => "implementation_status",
            ContextType::Question => "question",
            ContextType::Decision => "decision",
        };
        write!(f, "{}", s)
    }
}

impl std::str::FromStr for ContextType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.to_lowercase();
        ContextType::ALL
            .iter()
            .find(|t| t.to_string() == lowered)
            .copied()
            .ok_or_else(|| format!("Invalid context type: {}", s))
    }
}

/// Per-repo implementation progress
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum ImplementationState {
    #[default]
    NotStarted,
    InProgress,
    Complete,
    Verified,
}

impl std::fmt::Display for ImplementationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImplementationState::NotStarted => write!(f, "not_started"),
            ImplementationState::InProgress => write!(f, "in_progress"),
            ImplementationState::Complete => write!(f, "complete"),
            ImplementationState::Verified => write!(f, "verified"),
        }
    }
}

/// Response to a contract proposal
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Agree,
    RequestChange,
    Reject,
}

impl std::fmt::Display for ResponseAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResponseAction::Agree => write!(f, "agree"),
            ResponseAction::RequestChange => write!(f, "request_change"),
            ResponseAction::Reject => write!(f, "reject"),
        }
    }
}

/// Outcome of an integration verification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum VerifyResult {
    Success,
    Failure,
    Partial,
}

impl std::fmt::Display for VerifyResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VerifyResult::Success => write!(f, "success"),
            VerifyResult::Failure => write!(f, "failure"),
            VerifyResult::Partial => write!(f, "partial"),
        }
    }
}

/// A repository participating in a project
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RepoContext {
    pub repo_id: String,
    pub name: String,
    pub role: String,
    pub language: String,
    #[serde(default)]
    pub relevant_paths: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub assigned_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_endpoint: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl RepoContext {
    pub fn new(name: impl Into<String>, role: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            repo_id: new_id(),
            name: name.into(),
            role: role.into(),
            language: language.into(),
            relevant_paths: Vec::new(),
            url: None,
            assigned_agent: None,
            agent_endpoint: None,
            updated_at: Utc::now(),
        }
    }
}

/// Immutable snapshot of a contract's prior state
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractVersion {
    pub version: u64,
    pub status: ContractStatus,
    pub content: Document,
    pub proposed_by: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub change_notes: Option<String>,
    pub timestamp: DateTime<Utc>,
}

/// One respond call recorded in the negotiation log
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContractResponse {
    pub repo_id: String,
    pub action: ResponseAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_change: Option<Document>,
    pub timestamp: DateTime<Utc>,
}

/// Per-repo implementation record for a contract
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Implementation {
    pub repo_id: String,
    pub agent_id: String,
    pub state: ImplementationState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub verification: Option<VerifyResult>,
    #[serde(default)]
    pub notes: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Implementation {
    pub fn new(repo_id: impl Into<String>, agent_id: impl Into<String>) -> Self {
        Self {
            repo_id: repo_id.into(),
            agent_id: agent_id.into(),
            state: ImplementationState::NotStarted,
            plan: None,
            files: Vec::new(),
            verification: None,
            notes: String::new(),
            test_endpoint: None,
            started_at: None,
            completed_at: None,
            updated_at: Utc::now(),
        }
    }
}

/// A negotiated interface between repositories
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Contract {
    pub contract_id: String,
    #[serde(rename = "type")]
    pub contract_type: ContractType,
    pub name: String,
    pub version: u64,
    pub status: ContractStatus,
    pub content: Document,
    pub proposed_by: String,
    #[serde(default)]
    pub history: Vec<ContractVersion>,
    #[serde(default)]
    pub implementations: Vec<Implementation>,
    #[serde(default)]
    pub responses: Vec<ContractResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    /// Create a new contract at version 1 in PROPOSED
    pub fn new(
        contract_type: ContractType,
        name: impl Into<String>,
        content: Document,
        proposed_by: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            contract_id: new_id(),
            contract_type,
            name: name.into(),
            version: 1,
            status: ContractStatus::Proposed,
            content,
            proposed_by: proposed_by.into(),
            history: Vec::new(),
            implementations: Vec::new(),
            responses: Vec::new(),
            created_at: now,
            updated_at: now,
        }
    }

    /// Push the current state onto history
    pub fn record_prior_state(&mut self, change_notes: Option<String>) {
        self.history.push(ContractVersion {
            version: self.version,
            status: self.status,
            content: self.content.clone(),
            proposed_by: self.proposed_by.clone(),
            change_notes,
            timestamp: self.updated_at,
        });
    }

    pub fn implementation(&self, repo_id: &str) -> Option<&Implementation> {
        self.implementations.iter().find(|i| i.repo_id == repo_id)
    }

    pub fn implementation_mut(&mut self, repo_id: &str) -> Option<&mut Implementation> {
        self.implementations.iter_mut().find(|i| i.repo_id == repo_id)
    }

    /// True when every listed repo has a complete implementation
    pub fn all_complete<'a>(&self, mut repo_ids: impl Iterator<Item = &'a str>) -> bool {
        let mut any = false;
        let all = repo_ids.all(|id| {
            any = true;
            self.implementation(id)
                .map_or(false, |i| i.state == ImplementationState::Complete)
        });
        any && all
    }
}

/// Immutable message shared between agents
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContextPacket {
    pub packet_id: String,
    pub from_repo: String,
    pub from_agent: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub packet_type: ContextType,
    pub content: Document,
    #[serde(default)]
    pub related_contracts: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl ContextPacket {
    pub fn new(
        from_repo: impl Into<String>,
        from_agent: impl Into<String>,
        packet_type: ContextType,
        content: Document,
    ) -> Self {
        Self {
            packet_id: new_id(),
            from_repo: from_repo.into(),
            from_agent: from_agent.into(),
            timestamp: Utc::now(),
            packet_type,
            content,
            related_contracts: Vec::new(),
            reply_to: None,
        }
    }
}

/// A cross-repo project: the unit of replication and locking
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Project {
    pub project_id: String,
    pub name: String,
    pub objective: String,
    #[serde(default)]
    pub status: ProjectStatus,
    #[serde(default)]
    pub repos: Vec<RepoContext>,
    #[serde(default)]
    pub contracts: Vec<Contract>,
    #[serde(default)]
    pub context_history: Vec<ContextPacket>,
    pub created_at: DateTime<Utc>,
    /// Latest activity anywhere in the project, nested entities included
    pub updated_at: DateTime<Utc>,
    /// Last change to name, objective or status; the header's LWW stamp
    #[serde(default)]
    pub header_updated_at: DateTime<Utc>,
}

impl Project {
    pub fn new(name: impl Into<String>, objective: impl Into<String>, repos: Vec<RepoContext>) -> Self {
        let now = Utc::now();
        Self {
            project_id: new_id(),
            name: name.into(),
            objective: objective.into(),
            status: ProjectStatus::Planning,
            repos,
            contracts: Vec::new(),
            context_history: Vec::new(),
            created_at: now,
            updated_at: now,
            header_updated_at: now,
        }
    }

    pub fn repo_by_name(&self, name: &str) -> Option<&RepoContext> {
        self.repos.iter().find(|r| r.name == name)
    }

    pub fn repo_by_name_mut(&mut self, name: &str) -> Option<&mut RepoContext> {
        self.repos.iter_mut().find(|r| r.name == name)
    }

    pub fn repo_by_id(&self, repo_id: &str) -> Option<&RepoContext> {
        self.repos.iter().find(|r| r.repo_id == repo_id)
    }

    pub fn contract(&self, contract_id: &str) -> Option<&Contract> {
        self.contracts.iter().find(|c| c.contract_id == contract_id)
    }

    pub fn contract_mut(&mut self, contract_id: &str) -> Option<&mut Contract> {
        self.contracts.iter_mut().find(|c| c.contract_id == contract_id)
    }

    pub fn packet(&self, packet_id: &str) -> Option<&ContextPacket> {
        self.context_history.iter().find(|p| p.packet_id == packet_id)
    }

    /// Mark a local header change; returns the new timestamp
    pub fn bump(&mut self) -> DateTime<Utc> {
        let at = next_timestamp(self.header_updated_at.max(self.updated_at));
        self.header_updated_at = at;
        self.updated_at = at;
        at
    }

    /// Take a remote header that won resolution
    pub fn accept_header(&mut self, incoming: &Project) {
        self.name = incoming.name.clone();
        self.objective = incoming.objective.clone();
        self.status = incoming.status;
        self.header_updated_at = incoming.header_updated_at;
        self.touch(incoming.header_updated_at);
    }

    /// Advance `updated_at`, never moving it backwards
    pub fn touch(&mut self, at: DateTime<Utc>) {
        if at > self.updated_at {
            self.updated_at = at;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_contract_starts_proposed_at_version_one() {
        let contract = Contract::new(ContractType::ApiEndpoint, "Users", Document::new(), "repo-1");
        assert_eq!(contract.version, 1);
        assert_eq!(contract.status, ContractStatus::Proposed);
        assert!(contract.history.is_empty());
    }

    #[test]
    fn test_record_prior_state_captures_snapshot() {
        let mut content = Document::new();
        content.insert("path".to_string(), Value::String("/users".to_string()));
        let mut contract = Contract::new(ContractType::ApiEndpoint, "Users", content.clone(), "repo-1");
        contract.record_prior_state(Some("first".to_string()));

        assert_eq!(contract.history.len(), 1);
        assert_eq!(contract.history[0].version, 1);
        assert_eq!(contract.history[0].content, content);
        assert_eq!(contract.history[0].status, ContractStatus::Proposed);
    }

    #[test]
    fn test_all_complete_requires_every_repo() {
        let mut contract = Contract::new(ContractType::Custom, "c", Document::new(), "a");
        let mut done = Implementation::new("a", "agent-a");
        done.state = ImplementationState::Complete;
        contract.implementations.push(done);

        assert!(contract.all_complete(["a"].into_iter()));
        assert!(!contract.all_complete(["a", "b"].into_iter()));
        assert!(!contract.all_complete(std::iter::empty()));
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(serde_json::to_value(ContractType::RpcInterface).unwrap(), "rpc_interface");
        assert_eq!(serde_json::to_value(ImplementationState::NotStarted).unwrap(), "not_started");
        assert_eq!("decision".parse::<ContextType>().unwrap(), ContextType::Decision);
        assert!("bogus".parse::<ContractStatus>().is_err());
    }

    #[test]
    fn test_next_timestamp_is_strictly_later() {
        let future = Utc::now() + chrono::Duration::seconds(60);
        assert!(next_timestamp(future) > future);
        let past = Utc::now() - chrono::Duration::seconds(60);
        assert!(next_timestamp(past) > past);
    }

    #[test]
    fn test_touch_is_monotonic() {
        let mut project = Project::new("P", "obj", Vec::new());
        let before = project.updated_at;
        project.touch(before - chrono::Duration::seconds(10));
        assert_eq!(project.updated_at, before);
    }

    #[test]
    fn test_nested_activity_leaves_header_stamp() {
        let mut project = Project::new("P", "obj", Vec::new());
        let header = project.header_updated_at;
        project.touch(Utc::now() + chrono::Duration::seconds(30));
        assert_eq!(project.header_updated_at, header);

        let bumped = project.bump();
        assert!(bumped > header);
        assert_eq!(project.header_updated_at, project.updated_at);
    }
}
