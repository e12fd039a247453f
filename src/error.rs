//! Error taxonomy for coordination operations
//!
//! Every failure is scoped to the single requested operation. `PeerUnreachable`
//! is produced by the broadcast layer and never surfaces to a caller.

/// Typed failure of a coordination operation
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} already exists: {id}")]
    AlreadyExists { entity: &'static str, id: String },

    #[error("Invalid transition: cannot {trigger} a contract in status {current}")]
    InvalidTransition { current: String, trigger: String },

    #[error("Validation failed: {0}")]
    ValidationFailure(String),

    #[error("Peer {agent_id} unreachable: {reason}")]
    PeerUnreachable { agent_id: String, reason: String },

    #[error("Repo {repo} is not a member of project {project_id}")]
    NotAMember { repo: String, project_id: String },

    #[error("Storage failed: {0}")]
    Storage(String),
}

pub type CoreResult<T> = std::result::Result<T, CoreError>;

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    pub fn already_exists(entity: &'static str, id: impl Into<String>) -> Self {
        CoreError::AlreadyExists {
            entity,
            id: id.into(),
        }
    }

    pub fn invalid_transition(current: impl ToString, trigger: impl ToString) -> Self {
        CoreError::InvalidTransition {
            current: current.to_string(),
            trigger: trigger.to_string(),
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::ValidationFailure(message.into())
    }

    /// Stable machine-readable kind
    pub fn kind(&self) -> &'static str {
        match self {
            CoreError::NotFound { .. } => "not_found",
            CoreError::AlreadyExists { .. } => "already_exists",
            CoreError::InvalidTransition { .. } => "invalid_transition",
            CoreError::ValidationFailure(_) => "validation_failure",
            CoreError::PeerUnreachable { .. } => "peer_unreachable",
            CoreError::NotAMember { .. } => "not_a_member",
            CoreError::Storage(_) => "storage_failure",
        }
    }

    /// JSON-RPC error code (implementation-defined server range)
    pub fn code(&self) -> i32 {
        match self {
            CoreError::NotFound { .. } => -32001,
            CoreError::AlreadyExists { .. } => -32002,
            CoreError::InvalidTransition { .. } => -32003,
            CoreError::ValidationFailure(_) => -32004,
            CoreError::PeerUnreachable { .. } => -32005,
            CoreError::NotAMember { .. } => -32006,
            CoreError::Storage(_) => -32007,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(e: serde_json::Error) -> Self {
        CoreError::ValidationFailure(e.to_string())
    }
}
