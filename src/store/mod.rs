//! In-process store of projects and their nested entities
//!
//! Each project sits behind its own mutex; the map itself is behind a
//! read-write lock that is only held long enough to find or insert a slot.
//! Mutations run against a working copy and are committed only when the
//! closure succeeds, so a failed operation leaves the project untouched.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};
use crate::models::{
    next_timestamp, ContextPacket, ContextType, Contract, ContractStatus, ContractType, Project,
    RepoContext,
};
use crate::validation;

/// Default number of packets returned by a listing
pub const DEFAULT_PACKET_LIMIT: usize = 50;

/// Full serializable state of a store
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct StoreSnapshot {
    pub projects: Vec<Project>,
}

/// Filter for context packet listings
#[derive(Debug, Clone, Default)]
pub struct PacketFilter {
    pub packet_type: Option<ContextType>,
    pub contract_id: Option<String>,
    pub since: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl PacketFilter {
    fn matches(&self, packet: &ContextPacket) -> bool {
        if let Some(t) = self.packet_type {
            if packet.packet_type != t {
                return false;
            }
        }
        if let Some(contract_id) = &self.contract_id {
            if !packet.related_contracts.iter().any(|c| c == contract_id) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if packet.timestamp <= since {
                return false;
            }
        }
        true
    }
}

type Slot = Arc<Mutex<Project>>;

#[derive(Default)]
pub struct LocalStore {
    projects: RwLock<HashMap<String, Slot>>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rehydrate a store from a snapshot
    pub fn from_snapshot(snapshot: StoreSnapshot) -> CoreResult<Self> {
        let store = Self::new();
        for project in snapshot.projects {
            store.create_project(project)?;
        }
        Ok(store)
    }

    /// Copy of every project, ordered by creation
    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            projects: self.list_projects(),
        }
    }

    pub fn len(&self) -> usize {
        self.projects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.projects.read().is_empty()
    }

    fn slot(&self, project_id: &str) -> CoreResult<Slot> {
        self.projects
            .read()
            .get(project_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("Project", project_id))
    }

    pub fn contains_project(&self, project_id: &str) -> bool {
        self.projects.read().contains_key(project_id)
    }

    // ------------------------------------------------------------------
    // Projects
    // ------------------------------------------------------------------

    pub fn create_project(&self, project: Project) -> CoreResult<Project> {
        validation::validate_project(&project)?;

        let mut projects = self.projects.write();
        if projects.contains_key(&project.project_id) {
            return Err(CoreError::already_exists("Project", &project.project_id));
        }
        projects.insert(
            project.project_id.clone(),
            Arc::new(Mutex::new(project.clone())),
        );
        Ok(project)
    }

    /// Insert `project` unless a project with the same id is already present.
    /// Returns true when inserted.
    pub fn insert_if_absent(&self, project: Project) -> CoreResult<bool> {
        validation::validate_project(&project)?;

        let mut projects = self.projects.write();
        if projects.contains_key(&project.project_id) {
            return Ok(false);
        }
        projects.insert(project.project_id.clone(), Arc::new(Mutex::new(project)));
        Ok(true)
    }

    pub fn get_project(&self, project_id: &str) -> CoreResult<Project> {
        let slot = self.slot(project_id)?;
        let project = slot.lock().clone();
        Ok(project)
    }

    pub fn list_projects(&self) -> Vec<Project> {
        let slots: Vec<Slot> = self.projects.read().values().cloned().collect();
        let mut projects: Vec<Project> = slots.iter().map(|s| s.lock().clone()).collect();
        projects.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.project_id.cmp(&b.project_id))
        });
        projects
    }

    pub fn delete_project(&self, project_id: &str) -> CoreResult<Project> {
        let slot = self
            .projects
            .write()
            .remove(project_id)
            .ok_or_else(|| CoreError::not_found("Project", project_id))?;
        let project = slot.lock().clone();
        Ok(project)
    }

    /// Run `f` under the project's lock against a working copy; commit on `Ok`
    pub fn with_project<T>(
        &self,
        project_id: &str,
        f: impl FnOnce(&mut Project) -> CoreResult<T>,
    ) -> CoreResult<T> {
        let slot = self.slot(project_id)?;
        let mut guard = slot.lock();
        let mut working = guard.clone();
        let out = f(&mut working)?;
        validation::validate_project(&working)?;
        *guard = working;
        Ok(out)
    }

    /// Read a project under its lock without copying it
    pub fn read_project<T>(&self, project_id: &str, f: impl FnOnce(&Project) -> T) -> CoreResult<T> {
        let slot = self.slot(project_id)?;
        let guard = slot.lock();
        Ok(f(&guard))
    }

    // ------------------------------------------------------------------
    // Repos
    // ------------------------------------------------------------------

    pub fn add_repo(&self, project_id: &str, repo: RepoContext) -> CoreResult<RepoContext> {
        validation::validate_repo(&repo)?;
        self.with_project(project_id, |project| {
            if project.repo_by_name(&repo.name).is_some() {
                return Err(CoreError::validation(format!(
                    "Duplicate repo name in project: {}",
                    repo.name
                )));
            }
            project.touch(repo.updated_at);
            project.repos.push(repo.clone());
            Ok(repo)
        })
    }

    /// Mutate a repo by name
    pub fn update_repo(
        &self,
        project_id: &str,
        repo_name: &str,
        f: impl FnOnce(&mut RepoContext) -> CoreResult<()>,
    ) -> CoreResult<RepoContext> {
        self.with_project(project_id, |project| {
            let repo = project
                .repo_by_name_mut(repo_name)
                .ok_or_else(|| CoreError::not_found("Repo", repo_name))?;
            f(repo)?;
            repo.updated_at = next_timestamp(repo.updated_at);
            let repo = repo.clone();
            project.touch(repo.updated_at);
            Ok(repo)
        })
    }

    // ------------------------------------------------------------------
    // Contracts
    // ------------------------------------------------------------------

    pub fn add_contract(&self, project_id: &str, contract: Contract) -> CoreResult<Contract> {
        self.with_project(project_id, |project| {
            if project.contract(&contract.contract_id).is_some() {
                return Err(CoreError::already_exists("Contract", &contract.contract_id));
            }
            project.touch(contract.updated_at);
            project.contracts.push(contract.clone());
            Ok(contract)
        })
    }

    pub fn get_contract(&self, project_id: &str, contract_id: &str) -> CoreResult<Contract> {
        self.read_project(project_id, |project| project.contract(contract_id).cloned())?
            .ok_or_else(|| CoreError::not_found("Contract", contract_id))
    }

    pub fn list_contracts(
        &self,
        project_id: &str,
        status: Option<ContractStatus>,
        contract_type: Option<ContractType>,
    ) -> CoreResult<Vec<Contract>> {
        self.read_project(project_id, |project| {
            project
                .contracts
                .iter()
                .filter(|c| status.map_or(true, |s| c.status == s))
                .filter(|c| contract_type.map_or(true, |t| c.contract_type == t))
                .cloned()
                .collect()
        })
    }

    /// Mutate a contract; the closure also sees the project's repos
    pub fn update_contract<T>(
        &self,
        project_id: &str,
        contract_id: &str,
        f: impl FnOnce(&mut Contract, &[RepoContext]) -> CoreResult<T>,
    ) -> CoreResult<(Contract, T)> {
        self.with_project(project_id, |project| {
            let Project {
                repos, contracts, ..
            } = &mut *project;
            let contract = contracts
                .iter_mut()
                .find(|c| c.contract_id == contract_id)
                .ok_or_else(|| CoreError::not_found("Contract", contract_id))?;
            let out = f(contract, repos.as_slice())?;
            let contract = contract.clone();
            project.touch(contract.updated_at);
            Ok((contract, out))
        })
    }

    // ------------------------------------------------------------------
    // Context packets
    // ------------------------------------------------------------------

    pub fn add_packet(&self, project_id: &str, packet: ContextPacket) -> CoreResult<ContextPacket> {
        self.with_project(project_id, |project| {
            if project.packet(&packet.packet_id).is_some() {
                return Err(CoreError::already_exists("ContextPacket", &packet.packet_id));
            }
            project.touch(packet.timestamp);
            project.context_history.push(packet.clone());
            Ok(packet)
        })
    }

    pub fn get_packet(&self, project_id: &str, packet_id: &str) -> CoreResult<ContextPacket> {
        self.read_project(project_id, |project| project.packet(packet_id).cloned())?
            .ok_or_else(|| CoreError::not_found("ContextPacket", packet_id))
    }

    /// Filtered packets in chronological order, keeping the most recent `limit`
    pub fn list_packets(&self, project_id: &str, filter: &PacketFilter) -> CoreResult<Vec<ContextPacket>> {
        let limit = filter.limit.unwrap_or(DEFAULT_PACKET_LIMIT);
        self.read_project(project_id, |project| {
            let mut packets: Vec<ContextPacket> = project
                .context_history
                .iter()
                .filter(|p| filter.matches(p))
                .cloned()
                .collect();
            packets.sort_by_key(|p| p.timestamp);
            let skip = packets.len().saturating_sub(limit);
            packets.split_off(skip)
        })
    }

    /// Root packet plus its direct replies sorted by timestamp
    pub fn thread(
        &self,
        project_id: &str,
        packet_id: &str,
    ) -> CoreResult<(ContextPacket, Vec<ContextPacket>)> {
        self.read_project(project_id, |project| {
            let root = project.packet(packet_id).cloned()?;
            let mut replies: Vec<ContextPacket> = project
                .context_history
                .iter()
                .filter(|p| p.reply_to.as_deref() == Some(packet_id))
                .cloned()
                .collect();
            replies.sort_by_key(|p| p.timestamp);
            Some((root, replies))
        })?
        .ok_or_else(|| CoreError::not_found("ContextPacket", packet_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Document;
    use chrono::Duration;

    fn sample_project() -> Project {
        Project::new(
            "Checkout",
            "Ship checkout flow",
            vec![
                RepoContext::new("backend-api", "backend", "rust"),
                RepoContext::new("frontend-app", "frontend", "typescript"),
            ],
        )
    }

    fn packet_at(offset_secs: i64, packet_type: ContextType) -> ContextPacket {
        let mut packet = ContextPacket::new("repo", "agent", packet_type, Document::new());
        packet.timestamp = Utc::now() + Duration::seconds(offset_secs);
        packet
    }

    #[test]
    fn test_create_and_get_project() {
        let store = LocalStore::new();
        let project = store.create_project(sample_project()).unwrap();
        let fetched = store.get_project(&project.project_id).unwrap();
        assert_eq!(fetched, project);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_duplicate_project_id_already_exists() {
        let store = LocalStore::new();
        let project = store.create_project(sample_project()).unwrap();
        let err = store.create_project(project).unwrap_err();
        assert_eq!(err.kind(), "already_exists");
    }

    #[test]
    fn test_unknown_project_not_found() {
        let store = LocalStore::new();
        assert_eq!(store.get_project("missing").unwrap_err().kind(), "not_found");
        assert_eq!(
            store.get_contract("missing", "c").unwrap_err().kind(),
            "not_found"
        );
    }

    #[test]
    fn test_failed_mutation_leaves_project_untouched() {
        let store = LocalStore::new();
        let project = store.create_project(sample_project()).unwrap();

        let result: CoreResult<()> = store.with_project(&project.project_id, |p| {
            p.name = "changed".to_string();
            Err(CoreError::validation("nope"))
        });
        assert!(result.is_err());
        assert_eq!(store.get_project(&project.project_id).unwrap(), project);
    }

    #[test]
    fn test_add_repo_rejects_duplicate_name() {
        let store = LocalStore::new();
        let project = store.create_project(sample_project()).unwrap();
        let err = store
            .add_repo(
                &project.project_id,
                RepoContext::new("backend-api", "backend", "go"),
            )
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate repo name"));
    }

    #[test]
    fn test_list_contracts_filters() {
        let store = LocalStore::new();
        let project = store.create_project(sample_project()).unwrap();
        let pid = &project.project_id;

        let mut agreed = Contract::new(ContractType::Custom, "a", Document::new(), "r");
        agreed.status = ContractStatus::Agreed;
        store.add_contract(pid, agreed).unwrap();
        store
            .add_contract(pid, Contract::new(ContractType::EventSchema, "b", Document::new(), "r"))
            .unwrap();

        assert_eq!(store.list_contracts(pid, None, None).unwrap().len(), 2);
        assert_eq!(
            store
                .list_contracts(pid, Some(ContractStatus::Agreed), None)
                .unwrap()
                .len(),
            1
        );
        assert_eq!(
            store
                .list_contracts(pid, None, Some(ContractType::EventSchema))
                .unwrap()[0]
                .name,
            "b"
        );
    }

    #[test]
    fn test_list_packets_keeps_most_recent_last() {
        let store = LocalStore::new();
        let project = store.create_project(sample_project()).unwrap();
        let pid = &project.project_id;

        for offset in [3, 1, 2] {
            store.add_packet(pid, packet_at(offset, ContextType::ApiSpec)).unwrap();
        }
        store.add_packet(pid, packet_at(4, ContextType::Question)).unwrap();

        let filter = PacketFilter {
            packet_type: Some(ContextType::ApiSpec),
            limit: Some(2),
            ..Default::default()
        };
        let packets = store.list_packets(pid, &filter).unwrap();
        assert_eq!(packets.len(), 2);
        assert!(packets[0].timestamp < packets[1].timestamp);
        assert!(packets.iter().all(|p| p.packet_type == ContextType::ApiSpec));
    }

    #[test]
    fn test_thread_returns_root_and_replies() {
        let store = LocalStore::new();
        let project = store.create_project(sample_project()).unwrap();
        let pid = &project.project_id;

        let root = store.add_packet(pid, packet_at(0, ContextType::Question)).unwrap();
        let mut reply = packet_at(1, ContextType::Decision);
        reply.reply_to = Some(root.packet_id.clone());
        store.add_packet(pid, reply).unwrap();
        store.add_packet(pid, packet_at(2, ContextType::ApiSpec)).unwrap();

        let (thread_root, replies) = store.thread(pid, &root.packet_id).unwrap();
        assert_eq!(thread_root.packet_id, root.packet_id);
        assert_eq!(replies.len(), 1);
        assert_eq!(store.thread(pid, "nope").unwrap_err().kind(), "not_found");
    }

    #[test]
    fn test_snapshot_rehydrates_equal_state() {
        let store = LocalStore::new();
        let project = store.create_project(sample_project()).unwrap();
        store
            .add_contract(
                &project.project_id,
                Contract::new(ContractType::Custom, "c", Document::new(), "r"),
            )
            .unwrap();

        let snapshot = store.snapshot();
        let restored = LocalStore::from_snapshot(snapshot.clone()).unwrap();
        assert_eq!(restored.snapshot(), snapshot);
    }
}
