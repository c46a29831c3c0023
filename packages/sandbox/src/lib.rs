// ABOUTME: Sandbox runtime: per-user sandbox directories, preview servers and agent sessions
// ABOUTME: SandboxManager is the entry point; the other modules are its building blocks

pub mod acp;
pub mod agent_config;
pub mod config;
pub mod directory;
pub mod error;
pub mod manager;
pub mod ports;
pub mod process;
pub mod snapshot;
pub mod storage;
pub mod types;

pub use acp::{AcpEvent, AgentClient, AgentState};
pub use config::{CommandLine, SandboxConfig};
pub use directory::DirectoryManager;
pub use error::{Result, SandboxError};
pub use manager::SandboxManager;
pub use ports::PortAllocator;
pub use process::{PreviewProcess, ProcessManager};
pub use snapshot::{LocalObjectStore, ObjectStore, SnapshotManager};
pub use storage::{Sandbox, SandboxStatus, SandboxStorage, Snapshot, StorageError};
pub use types::{
    FilesystemEntry, LlmProviderConfig, ProvisionRequest, SandboxInfo, SnapshotInfo,
    TeardownFailure, TeardownReport, TeardownStep, UserProfile,
};
