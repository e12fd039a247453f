//! Files exchanged between agents
//!
//! Shared files arrive base64 encoded and land in a per-project directory
//! under the workspace root. File requests are held in memory and stay local
//! to this agent; neither is replicated.

use std::fs;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{CoreError, CoreResult};

/// Largest decoded file accepted
pub const MAX_FILE_BYTES: usize = 10 * 1024 * 1024;

fn default_content_type() -> String {
    "application/octet-stream".to_string()
}

/// A file as it travels over the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SharedFile {
    pub name: String,
    /// Base64 (standard alphabet) payload
    pub content: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

/// Where a shared file was written
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SavedFile {
    pub saved_to: PathBuf,
    pub size: usize,
    pub content_type: String,
}

/// An open ask for a file from some other agent
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct FileRequest {
    pub request_id: String,
    pub project_id: String,
    pub requested_by: String,
    pub description: String,
    pub suggested_format: Option<String>,
    pub timestamp: DateTime<Utc>,
}

pub struct FileWorkspace {
    root: PathBuf,
    requests: Mutex<Vec<FileRequest>>,
}

impl FileWorkspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Decode and write a file under `<root>/<project_id>/`
    pub fn save(&self, project_id: &str, file: &SharedFile) -> CoreResult<SavedFile> {
        let name = base_name(&file.name)?;
        let bytes = STANDARD
            .decode(file.content.trim())
            .map_err(|e| CoreError::validation(format!("Invalid base64 content: {}", e)))?;
        if bytes.len() > MAX_FILE_BYTES {
            return Err(CoreError::validation(format!(
                "File too large: {} bytes (max {})",
                bytes.len(),
                MAX_FILE_BYTES
            )));
        }

        let dir = self.root.join(project_id);
        fs::create_dir_all(&dir)
            .map_err(|e| CoreError::Storage(format!("{}: {}", dir.display(), e)))?;

        // prefix keeps repeated names from overwriting each other
        let id = uuid::Uuid::new_v4().simple().to_string();
        let path = dir.join(format!("{}_{}", &id[..8], name));
        fs::write(&path, &bytes)
            .map_err(|e| CoreError::Storage(format!("{}: {}", path.display(), e)))?;

        Ok(SavedFile {
            saved_to: path,
            size: bytes.len(),
            content_type: file.content_type.clone(),
        })
    }

    pub fn add_request(
        &self,
        project_id: &str,
        requested_by: &str,
        description: String,
        suggested_format: Option<String>,
    ) -> FileRequest {
        let request = FileRequest {
            request_id: uuid::Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            requested_by: requested_by.to_string(),
            description,
            suggested_format,
            timestamp: Utc::now(),
        };
        self.requests.lock().push(request.clone());
        request
    }

    /// Open requests for a project, oldest first
    pub fn requests(&self, project_id: &str) -> Vec<FileRequest> {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.project_id == project_id)
            .cloned()
            .collect()
    }

    pub fn request(&self, request_id: &str) -> CoreResult<FileRequest> {
        self.requests
            .lock()
            .iter()
            .find(|r| r.request_id == request_id)
            .cloned()
            .ok_or_else(|| CoreError::not_found("File request", request_id))
    }

    /// Save the file answering a request, then close the request
    pub fn fulfill(&self, request_id: &str, file: &SharedFile) -> CoreResult<(FileRequest, SavedFile)> {
        let request = self.request(request_id)?;
        let saved = self.save(&request.project_id, file)?;
        self.requests.lock().retain(|r| r.request_id != request_id);
        Ok((request, saved))
    }
}

/// Last path component only; rejects names that resolve to nothing
fn base_name(name: &str) -> CoreResult<&str> {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| CoreError::validation(format!("Invalid file name: {:?}", name)))
}
