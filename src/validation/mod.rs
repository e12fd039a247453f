//! Shape validation for contract content, context payloads and projects
//!
//! Payloads are opaque documents. Only the required top-level shape for each
//! type tag is checked, never a full schema.

use std::collections::{HashMap, HashSet};

use jsonschema::JSONSchema;
use once_cell::sync::Lazy;
use serde_json::{json, Value};

use crate::error::{CoreError, CoreResult};
use crate::models::{ContextType, ContractType, Document, Project, RepoContext};

static CONTRACT_SCHEMAS: Lazy<HashMap<ContractType, JSONSchema>> = Lazy::new(|| {
    ContractType::ALL
        .iter()
        .filter_map(|t| compile(&t.to_string(), contract_shape(*t)).map(|s| (*t, s)))
        .collect()
});

static CONTEXT_SCHEMAS: Lazy<HashMap<ContextType, JSONSchema>> = Lazy::new(|| {
    ContextType::ALL
        .iter()
        .filter_map(|t| compile(&t.to_string(), context_shape(*t)).map(|s| (*t, s)))
        .collect()
});

fn compile(name: &str, schema: Value) -> Option<JSONSchema> {
    match JSONSchema::compile(&schema) {
        Ok(compiled) => Some(compiled),
        Err(e) => {
            tracing::error!(shape = name, error = %e, "Failed to compile shape schema");
            None
        }
    }
}

fn required_strings(fields: &[&str]) -> Value {
    let properties: serde_json::Map<String, Value> = fields
        .iter()
        .map(|f| (f.to_string(), json!({ "type": "string" })))
        .collect();
    json!({
        "type": "object",
        "required": fields,
        "properties": properties
    })
}

fn contract_shape(contract_type: ContractType) -> Value {
    match contract_type {
        ContractType::ApiEndpoint => required_strings(&["method", "path"]),
        ContractType::EventSchema => required_strings(&["event"]),
        ContractType::RpcInterface => required_strings(&["method"]),
        ContractType::DataModel => json!({
            "type": "object",
            "required": ["fields"],
            "properties": { "fields": { "type": ["object", "array"] } }
        }),
        ContractType::ConfigSpec | ContractType::Custom => json!({ "type": "object" }),
    }
}

fn context_shape(context_type: ContextType) -> Value {
    match context_type {
        ContextType::Question => required_strings(&["question"]),
        ContextType::Decision => required_strings(&["decision", "chosen", "rationale"]),
        ContextType::CodeSnippet => required_strings(&["language", "file", "snippet"]),
        ContextType::TypeDefinition => required_strings(&["language", "definitions"]),
        _ => json!({ "type": "object" }),
    }
}

fn check(schema: Option<&JSONSchema>, label: String, content: &Document) -> CoreResult<()> {
    let Some(schema) = schema else {
        return Ok(());
    };
    let instance = Value::Object(content.clone());
    let result = schema.validate(&instance).map_err(|errors| {
        errors.map(|e| e.to_string()).collect::<Vec<_>>().join("; ")
    });
    result.map_err(|messages| CoreError::validation(format!("{} content: {}", label, messages)))
}

/// Validate contract content against the shape required by its type
pub fn validate_contract_content(contract_type: ContractType, content: &Document) -> CoreResult<()> {
    check(
        CONTRACT_SCHEMAS.get(&contract_type),
        format!("{} contract", contract_type),
        content,
    )
}

/// Validate context packet content against the shape required by its type
pub fn validate_context_content(context_type: ContextType, content: &Document) -> CoreResult<()> {
    check(
        CONTEXT_SCHEMAS.get(&context_type),
        format!("{} packet", context_type),
        content,
    )
}

pub fn validate_repo(repo: &RepoContext) -> CoreResult<()> {
    if repo.name.trim().is_empty() {
        return Err(CoreError::validation("repo name is required"));
    }
    if repo.role.trim().is_empty() {
        return Err(CoreError::validation(format!("repo {} has empty role", repo.name)));
    }
    if repo.language.trim().is_empty() {
        return Err(CoreError::validation(format!("repo {} has empty language", repo.name)));
    }
    Ok(())
}

/// Structural checks for a project: required fields and unique repo names
pub fn validate_project(project: &Project) -> CoreResult<()> {
    if project.name.trim().is_empty() {
        return Err(CoreError::validation("project name is required"));
    }

    let mut names = HashSet::new();
    for repo in &project.repos {
        validate_repo(repo)?;
        if !names.insert(repo.name.as_str()) {
            return Err(CoreError::validation(format!(
                "Duplicate repo name in project: {}",
                repo.name
            )));
        }
    }
    Ok(())
}

/// Require a non-empty string
pub fn require_non_empty(value: &str, field: &str) -> CoreResult<()> {
    if value.trim().is_empty() {
        return Err(CoreError::validation(format!("'{}' must not be empty", field)));
    }
    Ok(())
}
