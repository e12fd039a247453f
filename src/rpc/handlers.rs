//! Method implementations: decode params, call the service, shape the result

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::agent::AgentService;
use crate::collab::SyncMessage;
use crate::error::{CoreError, CoreResult};
use crate::models::{Contract, ResponseAction, VerifyResult};

/// Run `method` against the service
pub fn dispatch(service: &AgentService, method: &str, params: Value) -> CoreResult<Value> {
    match method {
        "cacp/project/create" => project_create(service, params),
        "cacp/project/join" => project_join(service, params),
        "cacp/project/get" => project_get(service, params),
        "cacp/project/list" => project_list(service),
        "cacp/project/updateStatus" => project_update_status(service, params),
        "cacp/project/addRepo" => project_add_repo(service, params),
        "cacp/contract/propose" => contract_propose(service, params),
        "cacp/contract/respond" => contract_respond(service, params),
        "cacp/contract/update" => contract_update(service, params),
        "cacp/contract/get" => contract_get(service, params),
        "cacp/contract/list" => contract_list(service, params),
        "cacp/context/share" => shared(service.share_context(parse(params)?)?),
        "cacp/context/askQuestion" => shared(service.ask_question(parse(params)?)?),
        "cacp/context/recordDecision" => shared(service.record_decision(parse(params)?)?),
        "cacp/context/list" => context_list(service, params),
        "cacp/context/getThread" => context_thread(service, params),
        "cacp/implementation/start" => implementation_start(service, params),
        "cacp/implementation/complete" => implementation_complete(service, params),
        "cacp/implementation/verify" => implementation_verify(service, params),
        "cacp/implementation/getStatus" => implementation_status(service, params),
        "cacp/file/share" => file_share(service, params),
        "cacp/file/request" => file_request(service, params),
        "cacp/file/listRequests" => file_list_requests(service, params),
        "cacp/file/fulfillRequest" => file_fulfill(service, params),
        "cacp/project/sync" | "cacp/contract/sync" | "cacp/context/sync" | "cacp/repo/sync" => {
            sync(service, method, params)
        }
        "cacp/peer/announce" => peer_announce(service, params),
        _ => Err(CoreError::validation(format!("Unknown method: {}", method))),
    }
}

fn parse<T: DeserializeOwned>(params: Value) -> CoreResult<T> {
    let params = if params.is_null() { json!({}) } else { params };
    serde_json::from_value(params).map_err(|e| CoreError::validation(format!("Invalid params: {}", e)))
}

fn to_json<T: serde::Serialize>(value: &T) -> CoreResult<Value> {
    Ok(serde_json::to_value(value)?)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProjectRef {
    project_id: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContractRef {
    project_id: String,
    contract_id: String,
    #[serde(default)]
    include_history: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PacketRef {
    project_id: String,
    packet_id: String,
}

// ----------------------------------------------------------------------
// Projects
// ----------------------------------------------------------------------

fn project_create(service: &AgentService, params: Value) -> CoreResult<Value> {
    let project = service.create_project(parse(params)?)?;
    Ok(json!({
        "projectId": project.project_id,
        "status": "created",
        "repoCount": project.repos.len(),
    }))
}

fn project_join(service: &AgentService, params: Value) -> CoreResult<Value> {
    let (project_name, repo) = service.join_project(parse(params)?)?;
    Ok(json!({
        "status": "joined",
        "repoId": repo.repo_id,
        "projectName": project_name,
    }))
}

fn project_get(service: &AgentService, params: Value) -> CoreResult<Value> {
    let r: ProjectRef = parse(params)?;
    to_json(&service.get_project(&r.project_id)?)
}

fn project_list(service: &AgentService) -> CoreResult<Value> {
    let projects: Vec<Value> = service
        .list_projects()
        .iter()
        .map(|p| {
            json!({
                "projectId": p.project_id,
                "name": p.name,
                "status": p.status,
                "repoCount": p.repos.len(),
                "contractCount": p.contracts.len(),
                "createdAt": p.created_at,
            })
        })
        .collect();
    Ok(json!({ "projects": projects }))
}

fn project_update_status(service: &AgentService, params: Value) -> CoreResult<Value> {
    let project = service.update_project_status(parse(params)?)?;
    Ok(json!({
        "projectId": project.project_id,
        "status": project.status,
    }))
}

fn project_add_repo(service: &AgentService, params: Value) -> CoreResult<Value> {
    let repo = service.add_repo(parse(params)?)?;
    Ok(json!({
        "repoId": repo.repo_id,
        "status": "added",
    }))
}

// ----------------------------------------------------------------------
// Contracts
// ----------------------------------------------------------------------

fn contract_summary(contract: &Contract) -> Value {
    json!({
        "contractId": contract.contract_id,
        "version": contract.version,
        "status": contract.status,
    })
}

fn contract_propose(service: &AgentService, params: Value) -> CoreResult<Value> {
    let contract = service.propose_contract(parse(params)?)?;
    Ok(contract_summary(&contract))
}

fn contract_respond(service: &AgentService, params: Value) -> CoreResult<Value> {
    let (contract, transition) = service.respond_contract(parse(params)?)?;
    let status = match transition.trigger {
        crate::workflow::Trigger::Respond(ResponseAction::Agree) => "agreed",
        crate::workflow::Trigger::Respond(ResponseAction::Reject) => "rejected",
        _ => "change_requested",
    };
    Ok(json!({
        "status": status,
        "contractVersion": contract.version,
        "contractStatus": contract.status,
    }))
}

fn contract_update(service: &AgentService, params: Value) -> CoreResult<Value> {
    let contract = service.update_contract(parse(params)?)?;
    Ok(contract_summary(&contract))
}

fn contract_get(service: &AgentService, params: Value) -> CoreResult<Value> {
    let r: ContractRef = parse(params)?;
    let contract = service.get_contract(&r.project_id, &r.contract_id)?;
    let mut value = to_json(&contract)?;
    if !r.include_history {
        if let Some(object) = value.as_object_mut() {
            object.remove("history");
        }
    }
    Ok(value)
}

fn contract_list(service: &AgentService, params: Value) -> CoreResult<Value> {
    let contracts: Vec<Value> = service
        .list_contracts(parse(params)?)?
        .iter()
        .map(|c| {
            json!({
                "contractId": c.contract_id,
                "type": c.contract_type,
                "name": c.name,
                "version": c.version,
                "status": c.status,
                "proposedBy": c.proposed_by,
            })
        })
        .collect();
    Ok(json!({ "contracts": contracts }))
}

// ----------------------------------------------------------------------
// Context
// ----------------------------------------------------------------------

fn shared(packet: crate::models::ContextPacket) -> CoreResult<Value> {
    Ok(json!({
        "packetId": packet.packet_id,
        "status": "shared",
    }))
}

fn context_list(service: &AgentService, params: Value) -> CoreResult<Value> {
    let packets = service.list_context(parse(params)?)?;
    Ok(json!({ "packets": to_json(&packets)? }))
}

fn context_thread(service: &AgentService, params: Value) -> CoreResult<Value> {
    let r: PacketRef = parse(params)?;
    let thread = service.get_thread(&r.project_id, &r.packet_id)?;
    Ok(json!({ "thread": to_json(&thread)? }))
}

// ----------------------------------------------------------------------
// Implementation
// ----------------------------------------------------------------------

fn implementation_start(service: &AgentService, params: Value) -> CoreResult<Value> {
    let (contract, repo_id) = service.start_implementation(parse(params)?)?;
    Ok(json!({
        "status": "started",
        "implementationId": format!("{}:{}", contract.contract_id, repo_id),
    }))
}

fn implementation_complete(service: &AgentService, params: Value) -> CoreResult<Value> {
    let (contract, _) = service.complete_implementation(parse(params)?)?;
    Ok(json!({
        "status": "complete",
        "contractStatus": contract.status,
    }))
}

fn implementation_verify(service: &AgentService, params: Value) -> CoreResult<Value> {
    let (contract, transition) = service.verify_implementation(parse(params)?)?;
    let status = match transition.trigger {
        crate::workflow::Trigger::Verify(VerifyResult::Success) => "verified",
        crate::workflow::Trigger::Verify(VerifyResult::Failure) => "failed",
        _ => "partial",
    };
    Ok(json!({
        "status": status,
        "contractStatus": contract.status,
    }))
}

fn implementation_status(service: &AgentService, params: Value) -> CoreResult<Value> {
    let r: ContractRef = parse(params)?;
    let contract = service.implementation_status(&r.project_id, &r.contract_id)?;
    let implementations: Vec<Value> = contract
        .implementations
        .iter()
        .map(|i| {
            json!({
                "repoId": i.repo_id,
                "agentId": i.agent_id,
                "state": i.state,
                "plan": i.plan,
                "files": i.files,
                "verification": i.verification,
                "notes": i.notes,
                "testEndpoint": i.test_endpoint,
                "startedAt": i.started_at,
                "completedAt": i.completed_at,
            })
        })
        .collect();
    Ok(json!({
        "contractId": contract.contract_id,
        "contractStatus": contract.status,
        "implementations": implementations,
    }))
}

// ----------------------------------------------------------------------
// Files
// ----------------------------------------------------------------------

fn file_share(service: &AgentService, params: Value) -> CoreResult<Value> {
    let saved = service.share_file(parse(params)?)?;
    Ok(json!({
        "status": "received",
        "savedTo": saved.saved_to.display().to_string(),
        "size": saved.size,
    }))
}

fn file_request(service: &AgentService, params: Value) -> CoreResult<Value> {
    let request = service.request_file(parse(params)?)?;
    Ok(json!({
        "status": "request_received",
        "requestId": request.request_id,
    }))
}

fn file_list_requests(service: &AgentService, params: Value) -> CoreResult<Value> {
    let r: ProjectRef = parse(params)?;
    let requests = service.list_file_requests(&r.project_id)?;
    Ok(json!({ "requests": requests }))
}

fn file_fulfill(service: &AgentService, params: Value) -> CoreResult<Value> {
    let saved = service.fulfill_file_request(parse(params)?)?;
    Ok(json!({
        "status": "fulfilled",
        "savedTo": saved.saved_to.display().to_string(),
        "size": saved.size,
    }))
}

// ----------------------------------------------------------------------
// Replication
// ----------------------------------------------------------------------

fn sync(service: &AgentService, method: &str, params: Value) -> CoreResult<Value> {
    let message = SyncMessage::from_params(method, params)?;
    let outcome = service.receive_sync(&message)?;
    Ok(json!({
        "status": outcome,
        "entityId": message.payload.entity_id(),
    }))
}

fn peer_announce(service: &AgentService, params: Value) -> CoreResult<Value> {
    service.announce(parse(params)?);
    let identity = service.identity();
    Ok(json!({
        "status": "acknowledged",
        "myAgentId": identity.agent_id,
        "myRepoName": identity.repo_name,
    }))
}
