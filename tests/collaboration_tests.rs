// End-to-end collaboration between two in-process agents
// Covers the negotiate -> implement -> verify flow and replication edge cases

mod common;

use anyhow::Result;
use cacp::collab::{SyncMessage, SyncOutcome, SyncPayload};
use cacp::models::{ContractStatus, ImplementationState};
use common::{pair, propose_users_endpoint, shared_project, spawn_agent, str_field, LoopbackNetwork};
use serde_json::json;

#[tokio::test]
async fn test_scenario_a_agree_replicates_to_both_agents() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (backend, frontend) = pair(&network);

    let project_id = shared_project(&backend, &frontend).await?;

    // frontend's claim reached the backend
    let project = backend.service().get_project(&project_id)?;
    let frontend_repo = project.repo_by_name("frontend-app").unwrap();
    assert_eq!(frontend_repo.assigned_agent.as_deref(), Some("agent-frontend"));

    let contract_id = propose_users_endpoint(&backend, &project_id).await?;
    let contract = frontend.service().get_contract(&project_id, &contract_id)?;
    assert_eq!(contract.version, 1);
    assert_eq!(contract.status, ContractStatus::Proposed);

    let responded = frontend.call(
        "cacp/contract/respond",
        json!({"projectId": project_id, "contractId": contract_id, "action": "agree"}),
    )?;
    assert_eq!(responded["status"], "agreed");
    frontend.flush().await;

    for agent in [&backend, &frontend] {
        let contract = agent.service().get_contract(&project_id, &contract_id)?;
        assert_eq!(contract.status, ContractStatus::Agreed);
        assert_eq!(contract.version, 1);
        assert_eq!(contract.responses.len(), 1);
    }
    Ok(())
}

#[tokio::test]
async fn test_scenario_b_implement_and_verify() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (backend, frontend) = pair(&network);
    let project_id = shared_project(&backend, &frontend).await?;
    let contract_id = propose_users_endpoint(&backend, &project_id).await?;

    let target = json!({"projectId": project_id, "contractId": contract_id});
    frontend.call(
        "cacp/contract/respond",
        json!({"projectId": project_id, "contractId": contract_id, "action": "agree"}),
    )?;
    frontend.flush().await;

    let started = backend.call("cacp/implementation/start", target.clone())?;
    assert_eq!(started["status"], "started");
    backend.flush().await;
    frontend.call("cacp/implementation/start", target.clone())?;
    frontend.flush().await;

    let done = backend.call("cacp/implementation/complete", target.clone())?;
    assert_eq!(done["contractStatus"], "agreed");
    backend.flush().await;
    let done = frontend.call("cacp/implementation/complete", target.clone())?;
    assert_eq!(done["contractStatus"], "implemented");
    frontend.flush().await;

    let contract = backend.service().get_contract(&project_id, &contract_id)?;
    assert_eq!(contract.status, ContractStatus::Implemented);
    assert_eq!(contract.implementations.len(), 2);

    let verified = backend.call(
        "cacp/implementation/verify",
        json!({"projectId": project_id, "contractId": contract_id, "result": "success"}),
    )?;
    assert_eq!(verified["status"], "verified");
    backend.flush().await;

    for agent in [&backend, &frontend] {
        let contract = agent.service().get_contract(&project_id, &contract_id)?;
        assert_eq!(contract.status, ContractStatus::Verified);
        assert!(contract
            .implementations
            .iter()
            .all(|i| i.state == ImplementationState::Verified));
    }

    let status = frontend.call("cacp/implementation/getStatus", target)?;
    assert_eq!(status["implementations"].as_array().unwrap().len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_scenario_c_request_change_then_update() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (backend, frontend) = pair(&network);
    let project_id = shared_project(&backend, &frontend).await?;
    let contract_id = propose_users_endpoint(&backend, &project_id).await?;

    let responded = frontend.call(
        "cacp/contract/respond",
        json!({
            "projectId": project_id,
            "contractId": contract_id,
            "action": "request_change",
            "comment": "Need pagination",
            "suggestedChange": {"query": {"page": "integer"}}
        }),
    )?;
    assert_eq!(responded["status"], "change_requested");
    assert_eq!(responded["contractStatus"], "negotiating");
    frontend.flush().await;

    let before = backend.service().get_contract(&project_id, &contract_id)?;
    assert_eq!(before.status, ContractStatus::Negotiating);

    let updated = backend.call(
        "cacp/contract/update",
        json!({
            "projectId": project_id,
            "contractId": contract_id,
            "content": {"method": "GET", "path": "/users", "query": {"page": "integer"}},
            "changeNotes": "Added pagination"
        }),
    )?;
    assert_eq!(updated["version"], 2);
    assert_eq!(updated["status"], "proposed");
    backend.flush().await;

    for agent in [&backend, &frontend] {
        let contract = agent.service().get_contract(&project_id, &contract_id)?;
        assert_eq!(contract.version, 2);
        assert_eq!(contract.status, ContractStatus::Proposed);
        assert_eq!(contract.history.len(), before.history.len() + 1);
        assert!(contract.content.contains_key("query"));
    }

    // history is hidden unless asked for
    let plain = frontend.call(
        "cacp/contract/get",
        json!({"projectId": project_id, "contractId": contract_id}),
    )?;
    assert!(plain.get("history").is_none());
    let full = frontend.call(
        "cacp/contract/get",
        json!({"projectId": project_id, "contractId": contract_id, "includeHistory": true}),
    )?;
    assert_eq!(full["history"].as_array().unwrap().len(), before.history.len() + 1);
    Ok(())
}

#[tokio::test]
async fn test_scenario_d_stale_equal_version_is_discarded() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (backend, frontend) = pair(&network);
    let project_id = shared_project(&backend, &frontend).await?;
    let contract_id = propose_users_endpoint(&backend, &project_id).await?;

    frontend.call(
        "cacp/contract/respond",
        json!({"projectId": project_id, "contractId": contract_id, "action": "request_change"}),
    )?;
    frontend.flush().await;
    backend.call(
        "cacp/contract/update",
        json!({
            "projectId": project_id,
            "contractId": contract_id,
            "content": {"method": "GET", "path": "/v2/users"}
        }),
    )?;
    backend.flush().await;
    frontend.call(
        "cacp/contract/respond",
        json!({"projectId": project_id, "contractId": contract_id, "action": "agree"}),
    )?;
    frontend.flush().await;

    let held = backend.service().get_contract(&project_id, &contract_id)?;
    assert_eq!((held.version, held.status), (2, ContractStatus::Agreed));

    let mut stale = held.clone();
    stale.status = ContractStatus::Negotiating;
    stale.updated_at = held.updated_at - chrono::Duration::seconds(5);
    let outcome = backend.service().receive_sync(&SyncMessage::new(
        "agent-frontend",
        SyncPayload::Contract {
            project_id: project_id.clone(),
            contract: stale,
        },
    ))?;

    assert_eq!(outcome, SyncOutcome::Stale);
    assert_eq!(backend.service().get_contract(&project_id, &contract_id)?, held);
    Ok(())
}

#[tokio::test]
async fn test_scenario_e_unreachable_peer_does_not_fail_caller() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (backend, frontend) = pair(&network);
    let mobile = spawn_agent(&network, "agent-mobile", "mobile-app", "client", None);
    backend.meet(&mobile);
    network.partition(&mobile.endpoint);

    let created = backend.call(
        "cacp/project/create",
        json!({
            "name": "P",
            "repos": [{"name": "backend-api", "role": "backend", "language": "rust"}]
        }),
    )?;
    assert_eq!(created["status"], "created");
    let project_id = str_field(&created, "projectId")?;
    backend.flush().await;

    assert!(frontend.service().get_project(&project_id).is_ok());
    assert!(mobile.service().get_project(&project_id).is_err());

    let peer = backend.service().directory().get("agent-mobile").unwrap();
    assert_eq!(peer.failed_attempts, 1);
    assert!(peer.healthy);

    // a later mutation reaches the peer once it is back
    network.heal(&mobile.endpoint);
    backend.call(
        "cacp/project/updateStatus",
        json!({"projectId": project_id, "status": "implementing"}),
    )?;
    backend.flush().await;
    let project = mobile.service().get_project(&project_id)?;
    assert_eq!(project.status.to_string(), "implementing");
    assert_eq!(backend.service().directory().get("agent-mobile").unwrap().failed_attempts, 0);
    Ok(())
}

#[tokio::test]
async fn test_context_thread_replicates() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (backend, frontend) = pair(&network);
    let project_id = shared_project(&backend, &frontend).await?;

    let question = frontend.call(
        "cacp/context/askQuestion",
        json!({"projectId": project_id, "question": "JWT or sessions?", "options": ["jwt", "sessions"]}),
    )?;
    let question_id = str_field(&question, "packetId")?;
    frontend.flush().await;

    backend.call(
        "cacp/context/recordDecision",
        json!({
            "projectId": project_id,
            "decision": "auth mechanism",
            "chosen": "jwt",
            "rationale": "stateless",
            "replyTo": question_id
        }),
    )?;
    backend.flush().await;

    for agent in [&backend, &frontend] {
        let thread = agent.call(
            "cacp/context/getThread",
            json!({"projectId": project_id, "packetId": question_id}),
        )?;
        let thread = thread["thread"].as_array().unwrap();
        assert_eq!(thread.len(), 2);
        assert_eq!(thread[0]["packet_id"], question_id.as_str());
    }

    let decisions = frontend.call(
        "cacp/context/list",
        json!({"projectId": project_id, "type": "decision"}),
    )?;
    assert_eq!(decisions["packets"].as_array().unwrap().len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_non_member_cannot_propose() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (backend, frontend) = pair(&network);

    let created = backend.call(
        "cacp/project/create",
        json!({
            "name": "P",
            "repos": [
                {"name": "backend-api", "role": "backend", "language": "rust"},
                {"name": "frontend-app", "role": "frontend", "language": "typescript"}
            ]
        }),
    )?;
    let project_id = str_field(&created, "projectId")?;
    backend.flush().await;

    // frontend holds the project but never joined
    let error = frontend.call_err(
        "cacp/contract/propose",
        json!({
            "projectId": project_id,
            "type": "custom",
            "name": "x",
            "content": {}
        }),
    )?;
    assert_eq!(error.data.unwrap()["kind"], "not_a_member");
    Ok(())
}

#[tokio::test]
async fn test_late_status_sync_survives_newer_context() -> Result<()> {
    let network = LoopbackNetwork::new();
    let (backend, frontend) = pair(&network);
    let project_id = shared_project(&backend, &frontend).await?;

    // status change is lost on the way to the frontend
    network.partition(&frontend.endpoint);
    backend.call(
        "cacp/project/updateStatus",
        json!({"projectId": project_id, "status": "implementing"}),
    )?;
    backend.flush().await;
    let delayed = backend.service().get_project(&project_id)?;
    network.heal(&frontend.endpoint);

    // unrelated activity after the status change
    frontend.call(
        "cacp/context/askQuestion",
        json!({"projectId": project_id, "question": "Rate limits?"}),
    )?;
    frontend.flush().await;

    let outcome = frontend.service().receive_sync(&SyncMessage::new(
        "agent-backend",
        SyncPayload::Project(delayed),
    ))?;
    assert_eq!(outcome, SyncOutcome::Updated);

    let held_by_backend = backend.service().get_project(&project_id)?;
    let held_by_frontend = frontend.service().get_project(&project_id)?;
    assert_eq!(held_by_frontend.status, held_by_backend.status);
    assert_eq!(held_by_frontend.status.to_string(), "implementing");
    assert_eq!(held_by_frontend.context_history.len(), 1);
    assert_eq!(held_by_backend.context_history.len(), 1);
    Ok(())
}
