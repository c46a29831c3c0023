// ABOUTME: Value types returned by the sandbox manager
// ABOUTME: Sandbox and snapshot summaries, LLM settings, directory listings and teardown reports

use crate::storage::{Sandbox, SandboxStatus, Snapshot};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Request to provision a new sandbox
#[derive(Debug, Clone)]
pub struct ProvisionRequest {
    /// Generated when `None`
    pub sandbox_id: Option<String>,
    pub tenant_id: String,
    pub owner_id: String,
    /// Shared knowledge files linked into the sandbox as `files`
    pub knowledge_path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SandboxInfo {
    pub id: String,
    pub tenant_id: String,
    pub owner_id: String,
    pub directory_path: PathBuf,
    pub status: SandboxStatus,
    pub port: Option<u16>,
    pub pid: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl From<Sandbox> for SandboxInfo {
    fn from(sandbox: Sandbox) -> Self {
        Self {
            id: sandbox.id,
            tenant_id: sandbox.tenant_id,
            owner_id: sandbox.owner_id,
            directory_path: PathBuf::from(sandbox.directory_path),
            status: sandbox.status,
            port: sandbox.port,
            pid: sandbox.pid,
            created_at: sandbox.created_at,
            last_heartbeat: sandbox.last_heartbeat,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SnapshotInfo {
    pub id: String,
    pub session_id: String,
    pub storage_path: String,
    pub size_bytes: u64,
    pub created_at: DateTime<Utc>,
}

impl From<Snapshot> for SnapshotInfo {
    fn from(snapshot: Snapshot) -> Self {
        Self {
            id: snapshot.id,
            session_id: snapshot.session_id,
            storage_path: snapshot.storage_path,
            size_bytes: snapshot.size_bytes,
            created_at: snapshot.created_at,
        }
    }
}

/// LLM settings rendered into the session's agent configuration.
///
/// `Debug` redacts the API key so the struct can be logged.
#[derive(Clone, Serialize, Deserialize, PartialEq)]
pub struct LlmProviderConfig {
    pub provider: String,
    pub model_name: String,
    pub api_key: Option<String>,
    pub api_base: Option<String>,
}

impl fmt::Debug for LlmProviderConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LlmProviderConfig")
            .field("provider", &self.provider)
            .field("model_name", &self.model_name)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("api_base", &self.api_base)
            .finish()
    }
}

/// Optional personalization for the rendered AGENTS.md
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct UserProfile {
    pub name: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FilesystemEntry {
    pub name: String,
    /// Relative to the session's `outputs/` directory
    pub path: String,
    pub is_directory: bool,
    /// Only set for regular files
    pub size_bytes: Option<u64>,
    pub modified_at: Option<DateTime<Utc>>,
}

/// One failed step of a best-effort teardown
#[derive(Debug, Clone, PartialEq)]
pub struct TeardownFailure {
    pub step: TeardownStep,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownStep {
    StopPreview,
    RemoveDirectory,
    MarkTerminated,
}

impl fmt::Display for TeardownStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::StopPreview => "stop preview process",
            Self::RemoveDirectory => "remove directory",
            Self::MarkTerminated => "mark terminated",
        };
        f.write_str(name)
    }
}

/// Outcome of `terminate`: every step runs, failures are collected here
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TeardownReport {
    pub sandbox_id: String,
    pub failures: Vec<TeardownFailure>,
}

impl TeardownReport {
    pub fn new(sandbox_id: &str) -> Self {
        Self {
            sandbox_id: sandbox_id.to_string(),
            failures: Vec::new(),
        }
    }

    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    pub(crate) fn record(&mut self, step: TeardownStep, error: impl fmt::Display) {
        tracing::warn!(
            "Teardown step '{}' failed for sandbox {}: {}",
            step,
            self.sandbox_id,
            error
        );
        self.failures.push(TeardownFailure {
            step,
            error: error.to_string(),
        });
    }
}
