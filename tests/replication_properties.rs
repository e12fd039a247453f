// Properties of the replicated state layer: monotonic versions, idempotent
// and order-insensitive sync, untouched state on rejected triggers, and
// lossless snapshots

use anyhow::Result;
use cacp::collab::{sync, SyncMessage, SyncOutcome, SyncPayload};
use cacp::db::{JsonFileSnapshotStore, SnapshotStore, SqliteSnapshotStore};
use cacp::models::{
    ContextPacket, ContextType, Contract, ContractStatus, ContractType, Document, Project,
    RepoContext, ResponseAction, VerifyResult,
};
use cacp::store::{LocalStore, StoreSnapshot};
use cacp::workflow::{LifecycleEngine, Trigger};
use serde_json::json;
use tempfile::TempDir;

fn doc(value: serde_json::Value) -> Document {
    match value {
        serde_json::Value::Object(map) => map,
        _ => Document::new(),
    }
}

fn sample_project() -> Project {
    let mut backend = RepoContext::new("backend-api", "backend", "rust");
    backend.assigned_agent = Some("agent-backend".to_string());
    let frontend = RepoContext::new("frontend-app", "frontend", "typescript");
    let backend_id = backend.repo_id.clone();

    let mut project = Project::new("P", "Checkout flow", vec![backend, frontend]);
    let contract = Contract::new(
        ContractType::ApiEndpoint,
        "GET /users",
        doc(json!({"method": "GET", "path": "/users"})),
        backend_id.clone(),
    );
    let mut question = ContextPacket::new(
        backend_id,
        "agent-backend",
        ContextType::Question,
        doc(json!({"question": "paginate?"})),
    );
    question.related_contracts.push(contract.contract_id.clone());
    project.contracts.push(contract);
    project.context_history.push(question);
    project
}

fn contract_sync(project_id: &str, contract: &Contract) -> SyncMessage {
    SyncMessage::new(
        "agent-frontend",
        SyncPayload::Contract {
            project_id: project_id.to_string(),
            contract: contract.clone(),
        },
    )
}

/// Re-propose a contract: request a change, then update its content
fn renegotiate(contract: &mut Contract, path: &str) -> Result<()> {
    LifecycleEngine::respond(contract, "repo-f", ResponseAction::RequestChange, None, None)?;
    LifecycleEngine::update(
        contract,
        doc(json!({"method": "GET", "path": path})),
        "repo-b",
        Some(format!("moved to {}", path)),
    )?;
    Ok(())
}

#[test]
fn test_version_never_decreases() -> Result<()> {
    let mut contract = sample_project().contracts.remove(0);
    let mut last = contract.version;

    for round in 0..10 {
        if round % 3 == 2 {
            // frozen content: update must fail without touching the version
            LifecycleEngine::respond(&mut contract, "repo-f", ResponseAction::Agree, None, None)?;
            assert!(LifecycleEngine::update(&mut contract, Document::new(), "repo-b", None).is_err());
            assert!(contract.version >= last);
            last = contract.version;

            // implement, fail verification, then re-propose
            LifecycleEngine::start_implementation(&mut contract, "repo-b", "agent-backend", None, Vec::new())?;
            LifecycleEngine::complete_implementation(
                &mut contract,
                "repo-b",
                Vec::new(),
                None,
                None,
                ["repo-b"].into_iter(),
            )?;
            assert_eq!(contract.status, ContractStatus::Implemented);
            LifecycleEngine::verify(&mut contract, "repo-b", VerifyResult::Failure, None)?;
            assert_eq!(contract.status, ContractStatus::Negotiating);
            LifecycleEngine::update(
                &mut contract,
                doc(json!({"method": "GET", "path": "/users"})),
                "repo-b",
                None,
            )?;
        } else {
            renegotiate(&mut contract, &format!("/users/v{}", round))?;
        }
        assert!(contract.version >= last);
        last = contract.version;
    }

    let versions: Vec<u64> = contract.history.iter().map(|h| h.version).collect();
    assert!(versions.windows(2).all(|w| w[0] <= w[1]));
    Ok(())
}

#[test]
fn test_same_sync_twice_is_a_no_op() -> Result<()> {
    let project = sample_project();
    let store = LocalStore::new();

    let message = SyncMessage::new("agent-backend", SyncPayload::Project(project.clone()));
    assert_eq!(sync::apply(&store, &message)?, SyncOutcome::Created);
    let after_first = store.snapshot();
    assert_eq!(sync::apply(&store, &message)?, SyncOutcome::Stale);
    assert_eq!(store.snapshot(), after_first);

    let mut contract = project.contracts[0].clone();
    renegotiate(&mut contract, "/v2/users")?;
    let message = contract_sync(&project.project_id, &contract);
    assert_eq!(sync::apply(&store, &message)?, SyncOutcome::Updated);
    let after_first = store.snapshot();
    assert_eq!(sync::apply(&store, &message)?, SyncOutcome::Stale);
    assert_eq!(store.snapshot(), after_first);

    let packet = ContextPacket::new(
        "repo-f",
        "agent-frontend",
        ContextType::Decision,
        doc(json!({"decision": "d", "chosen": "c", "rationale": "r"})),
    );
    let message = SyncMessage::new(
        "agent-frontend",
        SyncPayload::Context {
            project_id: project.project_id.clone(),
            packet,
        },
    );
    assert_eq!(sync::apply(&store, &message)?, SyncOutcome::Created);
    assert_eq!(sync::apply(&store, &message)?, SyncOutcome::Stale);
    assert_eq!(store.get_project(&project.project_id)?.context_history.len(), 2);
    Ok(())
}

#[test]
fn test_sync_order_does_not_matter() -> Result<()> {
    let project = sample_project();
    let contract_id = project.contracts[0].contract_id.clone();

    let v1 = project.contracts[0].clone();
    let mut v2 = v1.clone();
    renegotiate(&mut v2, "/v2/users")?;
    assert!(v2.version > v1.version);

    let older = contract_sync(&project.project_id, &v1);
    let newer = contract_sync(&project.project_id, &v2);

    let forward = LocalStore::new();
    forward.create_project(project.clone())?;
    sync::apply(&forward, &older)?;
    sync::apply(&forward, &newer)?;

    let backward = LocalStore::new();
    backward.create_project(project.clone())?;
    sync::apply(&backward, &newer)?;
    sync::apply(&backward, &older)?;

    let a = forward.get_contract(&project.project_id, &contract_id)?;
    let b = backward.get_contract(&project.project_id, &contract_id)?;
    assert_eq!(a, b);
    assert_eq!(a, v2);
    Ok(())
}

#[test]
fn test_equal_version_newer_timestamp_wins() -> Result<()> {
    let project = sample_project();
    let store = LocalStore::new();
    store.create_project(project.clone())?;

    let mut newer = project.contracts[0].clone();
    LifecycleEngine::respond(&mut newer, "repo-f", ResponseAction::Agree, None, None)?;
    assert_eq!(newer.version, 1);

    let outcome = sync::apply(&store, &contract_sync(&project.project_id, &newer))?;
    assert_eq!(outcome, SyncOutcome::Updated);
    let held = store.get_contract(&project.project_id, &newer.contract_id)?;
    assert_eq!(held.status, ContractStatus::Agreed);
    Ok(())
}

#[test]
fn test_sync_for_unknown_project_is_dropped() -> Result<()> {
    let project = sample_project();
    let store = LocalStore::new();
    let outcome = sync::apply(&store, &contract_sync(&project.project_id, &project.contracts[0]))?;
    assert_eq!(outcome, SyncOutcome::Dropped);
    assert!(store.is_empty());
    Ok(())
}

fn attempt(contract: &mut Contract, trigger: Trigger) -> Option<cacp::error::CoreError> {
    let result = match trigger {
        Trigger::Respond(action) => LifecycleEngine::respond(contract, "repo-f", action, None, None),
        Trigger::Update => LifecycleEngine::update(contract, Document::new(), "repo-b", None),
        Trigger::Verify(result) => LifecycleEngine::verify(contract, "repo-b", result, None),
        Trigger::StartImplementation => {
            LifecycleEngine::start_implementation(contract, "repo-b", "agent-backend", None, Vec::new())
        }
        Trigger::CompleteImplementation => LifecycleEngine::complete_implementation(
            contract,
            "repo-b",
            Vec::new(),
            None,
            None,
            ["repo-b"].into_iter(),
        ),
        Trigger::ImplementationsComplete => return None,
    };
    result.err()
}

#[test]
fn test_triggers_outside_the_table_leave_state_unchanged() -> Result<()> {
    use ContractStatus::*;

    let statuses = [Proposed, Negotiating, Agreed, Implemented, Verified, Rejected];
    let triggers = [
        Trigger::Respond(ResponseAction::Agree),
        Trigger::Respond(ResponseAction::RequestChange),
        Trigger::Respond(ResponseAction::Reject),
        Trigger::Update,
        Trigger::Verify(VerifyResult::Success),
        Trigger::Verify(VerifyResult::Failure),
        Trigger::StartImplementation,
        Trigger::CompleteImplementation,
    ];
    let table = [
        (Proposed, Trigger::Respond(ResponseAction::Agree)),
        (Proposed, Trigger::Respond(ResponseAction::RequestChange)),
        (Proposed, Trigger::Respond(ResponseAction::Reject)),
        (Negotiating, Trigger::Respond(ResponseAction::Agree)),
        (Negotiating, Trigger::Respond(ResponseAction::RequestChange)),
        (Negotiating, Trigger::Respond(ResponseAction::Reject)),
        (Negotiating, Trigger::Update),
        (Agreed, Trigger::StartImplementation),
        (Agreed, Trigger::CompleteImplementation),
        (Implemented, Trigger::Verify(VerifyResult::Success)),
        (Implemented, Trigger::Verify(VerifyResult::Failure)),
    ];

    let base = sample_project().contracts.remove(0);
    let mut rejected = 0;
    for status in statuses {
        for trigger in triggers {
            if table.contains(&(status, trigger)) {
                continue;
            }
            let mut contract = base.clone();
            contract.status = status;
            let before = contract.clone();

            let error = attempt(&mut contract, trigger)
                .unwrap_or_else(|| panic!("{} from {} should fail", trigger, status));
            assert_eq!(error.kind(), "invalid_transition");
            let message = error.to_string();
            assert!(message.contains(&status.to_string()), "{}", message);
            assert!(message.contains(&trigger.to_string()), "{}", message);
            assert_eq!(contract, before);
            rejected += 1;
        }
    }
    assert_eq!(rejected, statuses.len() * triggers.len() - table.len());
    Ok(())
}

#[test]
fn test_update_outside_negotiating_keeps_version() -> Result<()> {
    let base = sample_project().contracts.remove(0);
    for status in [
        ContractStatus::Proposed,
        ContractStatus::Agreed,
        ContractStatus::Implemented,
        ContractStatus::Verified,
        ContractStatus::Rejected,
    ] {
        let mut contract = base.clone();
        contract.status = status;
        let err = LifecycleEngine::update(
            &mut contract,
            doc(json!({"method": "POST", "path": "/users"})),
            "repo-b",
            None,
        )
        .unwrap_err();
        assert_eq!(err.kind(), "invalid_transition");
        assert_eq!(contract.version, 1);
        assert!(contract.history.is_empty());
    }
    Ok(())
}

#[test]
fn test_snapshot_round_trip_through_both_backends() -> Result<()> {
    let dir = TempDir::new()?;
    let mut project = sample_project();
    renegotiate(&mut project.contracts[0], "/v2/users")?;
    let snapshot = StoreSnapshot {
        projects: vec![project],
    };

    let backends: Vec<Box<dyn SnapshotStore>> = vec![
        Box::new(JsonFileSnapshotStore::new(dir.path().join("snapshot.json"))),
        Box::new(SqliteSnapshotStore::open(&dir.path().join("cacp.db"))?),
    ];
    for backend in backends {
        backend.save(&snapshot)?;
        let loaded = backend.load()?;
        assert_eq!(loaded.as_ref(), Some(&snapshot));

        let store = LocalStore::from_snapshot(loaded.unwrap_or_default())?;
        assert_eq!(store.snapshot(), snapshot);
    }
    Ok(())
}
