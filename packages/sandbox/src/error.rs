// ABOUTME: Error types for sandbox provisioning, session workspaces and the agent bridge
// ABOUTME: One crate-wide enum so callers can match on failure class without string parsing

use crate::storage::StorageError;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for sandbox operations
#[derive(Error, Debug)]
pub enum SandboxError {
    /// Required templates or settings are missing. Raised at construction.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Tenant already runs the maximum number of sandboxes
    #[error("Maximum concurrent sandboxes ({limit}) reached for tenant {tenant_id}")]
    QuotaExceeded { tenant_id: String, limit: usize },

    /// A provisioning or session setup step failed after its directory was created
    #[error("Provisioning failed for {target}: {reason}")]
    ProvisioningFailed { target: String, reason: String },

    /// No free port left in the configured range
    #[error("No free port in range {start}-{end}")]
    ResourceExhausted { start: u16, end: u16 },

    /// Requested path resolves outside the session outputs root
    #[error("Path traversal not allowed: {path}")]
    PathTraversal { path: String },

    /// Sandbox or session id failed validation
    #[error("Invalid id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Sandbox not found: {0}")]
    NotFound(String),

    #[error("Sandbox {sandbox_id} is not running")]
    SandboxNotRunning { sandbox_id: String },

    #[error("Not a directory: {0}")]
    NotADirectory(String),

    #[error("Not a file: {0}")]
    NotAFile(String),

    /// Preview process could not be spawned or exited during the startup grace window
    #[error("Failed to start '{command}': {reason}")]
    StartupFailed { command: String, reason: String },

    #[error("Failed to kill process with PID {pid}: {reason}")]
    ProcessKill { pid: u32, reason: String },

    /// Malformed or unexpected frame from the agent subprocess
    #[error("Agent protocol error: {0}")]
    AgentProtocol(String),

    /// Agent subprocess is gone
    #[error("Agent subprocess exited: {0}")]
    SubprocessExited(String),

    #[error("Object store error for '{key}': {reason}")]
    ObjectStore { key: String, reason: String },

    #[error("Template copy failed from {from}: {reason}")]
    TemplateCopy { from: PathBuf, reason: String },

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for Results that return SandboxError
pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    pub(crate) fn provisioning(target: impl Into<String>, err: impl std::fmt::Display) -> Self {
        Self::ProvisioningFailed {
            target: target.into(),
            reason: err.to_string(),
        }
    }
}
