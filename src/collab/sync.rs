//! Receiving side of replication
//!
//! Applies an incoming sync message to the local store under the project's
//! lock. Unknown projects drop nested payloads; a whole-project sync for an
//! unknown project creates it.

use super::conflicts::ConflictResolver;
use super::{SyncMessage, SyncOutcome, SyncPayload};
use crate::error::CoreResult;
use crate::models::{ContextPacket, Contract, Project, RepoContext};
use crate::store::LocalStore;

/// Apply a sync message; stale and dropped messages are logged no-ops
pub fn apply(store: &LocalStore, message: &SyncMessage) -> CoreResult<SyncOutcome> {
    let project_id = message.payload.project_id();

    let outcome = match &message.payload {
        SyncPayload::Project(incoming) => {
            if store.insert_if_absent(incoming.clone())? {
                SyncOutcome::Created
            } else {
                store.with_project(project_id, |local| Ok(merge_project(local, incoming)))?
            }
        }
        payload if !store.contains_project(project_id) => {
            tracing::warn!(
                project_id,
                entity_id = payload.entity_id(),
                source = %message.source_agent,
                "Dropping sync for unknown project"
            );
            return Ok(SyncOutcome::Dropped);
        }
        SyncPayload::Contract { contract, .. } => {
            store.with_project(project_id, |local| Ok(merge_contract(local, contract)))?
        }
        SyncPayload::Context { packet, .. } => {
            store.with_project(project_id, |local| Ok(merge_packet(local, packet)))?
        }
        SyncPayload::Repo { repo, .. } => {
            store.with_project(project_id, |local| Ok(merge_repo(local, repo)))?
        }
    };

    if outcome.applied() {
        tracing::info!(
            method = message.method(),
            project_id,
            entity_id = message.payload.entity_id(),
            source = %message.source_agent,
            %outcome,
            "Applied sync"
        );
    } else {
        tracing::debug!(
            method = message.method(),
            project_id,
            entity_id = message.payload.entity_id(),
            source = %message.source_agent,
            "Discarded stale sync"
        );
    }
    Ok(outcome)
}

fn combine(a: SyncOutcome, b: SyncOutcome) -> SyncOutcome {
    if a.applied() || b.applied() {
        SyncOutcome::Updated
    } else {
        SyncOutcome::Stale
    }
}

/// Resolve the header, then every nested entity on its own
fn merge_project(local: &mut Project, incoming: &Project) -> SyncOutcome {
    let mut outcome = SyncOutcome::Stale;

    if ConflictResolver::supersedes(&*local, incoming) {
        local.accept_header(incoming);
        outcome = SyncOutcome::Updated;
    }
    for repo in &incoming.repos {
        outcome = combine(outcome, merge_repo(local, repo));
    }
    for contract in &incoming.contracts {
        outcome = combine(outcome, merge_contract(local, contract));
    }
    for packet in &incoming.context_history {
        outcome = combine(outcome, merge_packet(local, packet));
    }
    outcome
}

fn merge_contract(local: &mut Project, incoming: &Contract) -> SyncOutcome {
    let outcome = match local.contract_mut(&incoming.contract_id) {
        Some(existing) => {
            if !ConflictResolver::supersedes(&*existing, incoming) {
                return SyncOutcome::Stale;
            }
            *existing = incoming.clone();
            SyncOutcome::Updated
        }
        None => {
            local.contracts.push(incoming.clone());
            SyncOutcome::Created
        }
    };
    local.touch(incoming.updated_at);
    outcome
}

fn merge_packet(local: &mut Project, incoming: &ContextPacket) -> SyncOutcome {
    if local.packet(&incoming.packet_id).is_some() {
        return SyncOutcome::Stale;
    }
    local.context_history.push(incoming.clone());
    local.context_history.sort_by_key(|p| p.timestamp);
    local.touch(incoming.timestamp);
    SyncOutcome::Created
}

fn merge_repo(local: &mut Project, incoming: &RepoContext) -> SyncOutcome {
    if let Some(existing) = local.repos.iter_mut().find(|r| r.repo_id == incoming.repo_id) {
        if !ConflictResolver::supersedes(&*existing, incoming) {
            return SyncOutcome::Stale;
        }
        *existing = incoming.clone();
        local.touch(incoming.updated_at);
        return SyncOutcome::Updated;
    }

    if local.repo_by_name(&incoming.name).is_some() {
        tracing::debug!(
            repo = %incoming.name,
            project_id = %local.project_id,
            "Ignoring synced repo whose name is already taken"
        );
        return SyncOutcome::Stale;
    }
    local.repos.push(incoming.clone());
    local.touch(incoming.updated_at);
    SyncOutcome::Created
}
