//! Contract lifecycle state machine
//!
//! Transition table:
//! - proposed    --respond(agree)-->          agreed
//! - proposed    --respond(request_change)--> negotiating
//! - proposed    --respond(reject)-->         rejected
//! - negotiating --respond(agree)-->          agreed
//! - negotiating --respond(request_change)--> negotiating (comment only)
//! - negotiating --respond(reject)-->         rejected
//! - negotiating --update(content)-->         proposed (version + 1)
//! - agreed      --all implementations complete--> implemented (derived)
//! - implemented --verify(success)-->         verified
//! - implemented --verify(failure)-->         negotiating
//!
//! Rejected is terminal. Every status change and every content update pushes
//! the prior state onto the contract history before mutating.

use crate::error::{CoreError, CoreResult};
use crate::models::{
    next_timestamp, Contract, ContractResponse, ContractStatus, Document, Implementation,
    ImplementationState, ResponseAction, VerifyResult,
};

/// Something that asks the state machine to move a contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Respond(ResponseAction),
    Update,
    ImplementationsComplete,
    Verify(VerifyResult),
    StartImplementation,
    CompleteImplementation,
}

impl std::fmt::Display for Trigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trigger::Respond(action) => write!(f, "respond({})", action),
            Trigger::Update => write!(f, "update"),
            Trigger::ImplementationsComplete => write!(f, "complete all implementations of"),
            Trigger::Verify(result) => write!(f, "verify({})", result),
            Trigger::StartImplementation => write!(f, "start implementation of"),
            Trigger::CompleteImplementation => write!(f, "complete implementation of"),
        }
    }
}

/// Result of a successful trigger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: ContractStatus,
    pub to: ContractStatus,
    pub trigger: Trigger,
}

impl Transition {
    pub fn changed(&self) -> bool {
        self.from != self.to
    }
}

/// Stateless engine applying triggers to contracts
pub struct LifecycleEngine;

impl LifecycleEngine {
    /// Target status for a trigger, or `None` if the table has no such row
    pub fn next_status(from: ContractStatus, trigger: Trigger) -> Option<ContractStatus> {
        use ContractStatus::*;
        use ResponseAction::*;

        match (from, trigger) {
            (Proposed, Trigger::Respond(Agree)) => Some(Agreed),
            (Proposed, Trigger::Respond(RequestChange)) => Some(Negotiating),
            (Proposed, Trigger::Respond(Reject)) => Some(Rejected),
            (Negotiating, Trigger::Respond(Agree)) => Some(Agreed),
            (Negotiating, Trigger::Respond(RequestChange)) => Some(Negotiating),
            (Negotiating, Trigger::Respond(Reject)) => Some(Rejected),
            (Negotiating, Trigger::Update) => Some(Proposed),
            (Agreed, Trigger::ImplementationsComplete) => Some(Implemented),
            (Agreed, Trigger::StartImplementation) => Some(Agreed),
            (Agreed, Trigger::CompleteImplementation) => Some(Agreed),
            (Implemented, Trigger::Verify(VerifyResult::Success)) => Some(Verified),
            (Implemented, Trigger::Verify(VerifyResult::Failure)) => Some(Negotiating),
            (Implemented, Trigger::Verify(VerifyResult::Partial)) => Some(Implemented),
            _ => None,
        }
    }

    /// Validate a trigger against the contract's current status
    pub fn check(contract: &Contract, trigger: Trigger) -> CoreResult<Transition> {
        match Self::next_status(contract.status, trigger) {
            Some(to) => Ok(Transition {
                from: contract.status,
                to,
                trigger,
            }),
            None => Err(CoreError::invalid_transition(contract.status, trigger)),
        }
    }

    fn move_to(contract: &mut Contract, transition: &Transition, change_notes: Option<String>) {
        if transition.changed() {
            contract.record_prior_state(change_notes);
            contract.status = transition.to;
        }
        contract.updated_at = next_timestamp(contract.updated_at);
    }

    /// Apply a respond action from a participating repo
    pub fn respond(
        contract: &mut Contract,
        repo_id: &str,
        action: ResponseAction,
        comment: Option<String>,
        suggested_change: Option<Document>,
    ) -> CoreResult<Transition> {
        let transition = Self::check(contract, Trigger::Respond(action))?;

        Self::move_to(contract, &transition, comment.clone());
        contract.responses.push(ContractResponse {
            repo_id: repo_id.to_string(),
            action,
            comment,
            suggested_change,
            timestamp: contract.updated_at,
        });
        Ok(transition)
    }

    /// Replace content while negotiating; bumps the version and re-proposes
    pub fn update(
        contract: &mut Contract,
        content: Document,
        proposed_by: &str,
        change_notes: Option<String>,
    ) -> CoreResult<Transition> {
        let transition = Self::check(contract, Trigger::Update)?;

        contract.record_prior_state(change_notes);
        contract.version += 1;
        contract.content = content;
        contract.proposed_by = proposed_by.to_string();
        contract.status = transition.to;
        contract.updated_at = next_timestamp(contract.updated_at);
        Ok(transition)
    }

    /// Signal that a repo started implementing an agreed contract
    pub fn start_implementation(
        contract: &mut Contract,
        repo_id: &str,
        agent_id: &str,
        plan: Option<String>,
        files: Vec<String>,
    ) -> CoreResult<Transition> {
        let transition = Self::check(contract, Trigger::StartImplementation)?;
        let now = next_timestamp(contract.updated_at);

        if contract.implementation(repo_id).is_none() {
            contract
                .implementations
                .push(Implementation::new(repo_id, agent_id));
        }
        if let Some(implementation) = contract.implementation_mut(repo_id) {
            implementation.agent_id = agent_id.to_string();
            implementation.state = ImplementationState::InProgress;
            implementation.plan = plan;
            implementation.files = files;
            implementation.started_at = Some(now);
            implementation.completed_at = None;
            implementation.updated_at = now;
        }
        contract.updated_at = now;
        Ok(transition)
    }

    /// Mark a repo's implementation complete, then settle the derived status
    pub fn complete_implementation<'a>(
        contract: &mut Contract,
        repo_id: &str,
        files: Vec<String>,
        notes: Option<String>,
        test_endpoint: Option<String>,
        participants: impl Iterator<Item = &'a str>,
    ) -> CoreResult<Transition> {
        let transition = Self::check(contract, Trigger::CompleteImplementation)?;
        let now = next_timestamp(contract.updated_at);

        let implementation = contract
            .implementation_mut(repo_id)
            .ok_or_else(|| CoreError::not_found("Implementation", repo_id))?;
        implementation.state = ImplementationState::Complete;
        implementation.files = files;
        implementation.notes = notes.unwrap_or_default();
        implementation.test_endpoint = test_endpoint;
        implementation.completed_at = Some(now);
        implementation.updated_at = now;
        contract.updated_at = now;

        Ok(Self::settle_implementations(contract, participants).unwrap_or(transition))
    }

    /// Derived transition: agreed -> implemented once every participant is complete
    pub fn settle_implementations<'a>(
        contract: &mut Contract,
        participants: impl Iterator<Item = &'a str>,
    ) -> Option<Transition> {
        if contract.status != ContractStatus::Agreed || !contract.all_complete(participants) {
            return None;
        }
        let transition = Self::check(contract, Trigger::ImplementationsComplete).ok()?;
        Self::move_to(contract, &transition, None);
        Some(transition)
    }

    /// Record an integration verification result reported by `repo_id`
    pub fn verify(
        contract: &mut Contract,
        repo_id: &str,
        result: VerifyResult,
        notes: Option<String>,
    ) -> CoreResult<Transition> {
        let transition = Self::check(contract, Trigger::Verify(result))?;
        let now = next_timestamp(contract.updated_at);

        if result == VerifyResult::Partial {
            if let Some(implementation) = contract.implementation_mut(repo_id) {
                implementation.verification = Some(result);
                if let Some(notes) = notes {
                    implementation.notes = notes;
                }
                implementation.updated_at = now;
            }
            contract.updated_at = now;
            return Ok(transition);
        }

        for implementation in contract.implementations.iter_mut() {
            implementation.verification = Some(result);
            implementation.updated_at = now;
            if result == VerifyResult::Success {
                implementation.state = ImplementationState::Verified;
            } else {
                implementation.state = ImplementationState::NotStarted;
                implementation.completed_at = None;
            }
        }

        Self::move_to(contract, &transition, notes);
        Ok(transition)
    }

    /// Content is frozen from agreement until the contract re-opens
    pub fn is_content_frozen(status: ContractStatus) -> bool {
        !matches!(status, ContractStatus::Negotiating)
    }
}
