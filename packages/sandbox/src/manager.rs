// ABOUTME: Sandbox lifecycle manager composing directories, ports, preview processes and agents
// ABOUTME: Provisioning rolls back on failure; termination is best-effort and reports per-step failures

use crate::acp::{AcpEvent, AgentClient};
use crate::agent_config::InstructionValues;
use crate::config::SandboxConfig;
use crate::directory::{validate_id, DirectoryManager};
use crate::error::{Result, SandboxError};
use crate::ports::PortAllocator;
use crate::process::{PreviewProcess, ProcessManager};
use crate::snapshot::{ObjectStore, SnapshotManager};
use crate::storage::{Sandbox, SandboxStatus, SandboxStorage, Snapshot, StorageError};
use crate::types::{
    FilesystemEntry, LlmProviderConfig, ProvisionRequest, SandboxInfo, SnapshotInfo,
    TeardownReport, TeardownStep, UserProfile,
};
use async_stream::stream;
use chrono::Utc;
use futures::{Stream, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// (sandbox_id, session_id)
type SessionKey = (String, String);

/// Resources acquired so far by a provisioning attempt
#[derive(Default)]
struct Leases {
    port: Option<u16>,
    preview: Option<PreviewProcess>,
}

/// Owns every live sandbox resource in this process.
///
/// Construct once and share it (e.g. behind an `Arc`). Each mutable map has
/// its own lock; none is held across subprocess or filesystem work.
pub struct SandboxManager {
    config: SandboxConfig,
    storage: Arc<SandboxStorage>,
    directories: DirectoryManager,
    processes: ProcessManager,
    snapshots: SnapshotManager,
    ports: PortAllocator,
    agents: Mutex<HashMap<SessionKey, AgentClient>>,
    session_locks: Mutex<HashMap<SessionKey, Arc<Mutex<()>>>>,
    previews: Mutex<HashMap<String, PreviewProcess>>,
}

impl SandboxManager {
    /// Fails with [`SandboxError::Configuration`] when required templates are missing
    pub fn new(
        config: SandboxConfig,
        storage: Arc<SandboxStorage>,
        object_store: Arc<dyn ObjectStore>,
    ) -> Result<Self> {
        if config.port_range_start > config.port_range_end {
            return Err(SandboxError::Configuration(format!(
                "Invalid port range {}-{}",
                config.port_range_start, config.port_range_end
            )));
        }

        let directories = DirectoryManager::new(&config)?;
        let processes = ProcessManager::new(config.preview_command.clone(), config.startup_grace);
        let ports = PortAllocator::new(config.port_range_start, config.port_range_end);

        info!(
            "Sandbox manager ready: base path {}, ports {}-{}",
            config.base_path.display(),
            config.port_range_start,
            config.port_range_end
        );

        Ok(Self {
            config,
            storage,
            directories,
            processes,
            snapshots: SnapshotManager::new(object_store),
            ports,
            agents: Mutex::new(HashMap::new()),
            session_locks: Mutex::new(HashMap::new()),
            previews: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub fn ports(&self) -> &PortAllocator {
        &self.ports
    }

    /// Number of agent clients currently tracked, live or not
    pub async fn agent_count(&self) -> usize {
        self.agents.lock().await.len()
    }

    // ========================================================================
    // SANDBOX LIFECYCLE
    // ========================================================================

    /// Create the sandbox directory, start its preview server and persist a
    /// RUNNING record.
    ///
    /// All-or-nothing: when any step after the directory exists fails, the
    /// preview process is stopped, the port released and the directory
    /// removed before the error is returned.
    pub async fn provision(&self, request: ProvisionRequest) -> Result<SandboxInfo> {
        let sandbox_id = request
            .sandbox_id
            .clone()
            .unwrap_or_else(|| format!("sbx_{}", uuid::Uuid::new_v4().simple()));
        validate_id(&sandbox_id)?;

        let limit = self.config.max_concurrent_per_tenant;
        if limit > 0 {
            let running = self.storage.count_running_for_tenant(&request.tenant_id).await?;
            if running >= limit {
                warn!(
                    "Tenant {} is at its sandbox limit ({}/{})",
                    request.tenant_id, running, limit
                );
                return Err(SandboxError::QuotaExceeded {
                    tenant_id: request.tenant_id,
                    limit,
                });
            }
        }

        match self.storage.get_sandbox(&sandbox_id).await {
            Ok(_) => {
                return Err(SandboxError::InvalidRequest(format!(
                    "Sandbox {} already exists",
                    sandbox_id
                )))
            }
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        info!(
            "Provisioning sandbox {} for tenant {} (owner {})",
            sandbox_id, request.tenant_id, request.owner_id
        );

        // A concurrent provision of the same id loses here, before it owns
        // anything it would have to roll back
        let directory = match self.directories.create_sandbox_directory(&sandbox_id) {
            Ok(directory) => directory,
            Err(e @ SandboxError::InvalidRequest(_)) => return Err(e),
            Err(e) => return Err(SandboxError::provisioning(format!("sandbox {}", sandbox_id), e)),
        };

        let mut leases = Leases::default();
        match self
            .start_sandbox(&sandbox_id, &request, &directory, &mut leases)
            .await
        {
            Ok(record) => {
                if let Some(preview) = leases.preview.take() {
                    self.previews.lock().await.insert(sandbox_id.clone(), preview);
                }
                info!(
                    "Sandbox {} running on port {:?} (PID {:?})",
                    sandbox_id, record.port, record.pid
                );
                Ok(record.into())
            }
            Err(e) => {
                error!("Provisioning sandbox {} failed: {}", sandbox_id, e);
                self.rollback_provision(&sandbox_id, leases).await;
                match e {
                    SandboxError::ResourceExhausted { .. } => Err(e),
                    other => Err(SandboxError::provisioning(format!("sandbox {}", sandbox_id), other)),
                }
            }
        }
    }

    async fn start_sandbox(
        &self,
        sandbox_id: &str,
        request: &ProvisionRequest,
        directory: &Path,
        leases: &mut Leases,
    ) -> Result<Sandbox> {
        self.directories
            .setup_files_symlink(directory, &request.knowledge_path)?;

        let port = self.ports.allocate().await?;
        leases.port = Some(port);

        let preview = self.processes.start_server(directory, port).await?;
        let pid = preview.pid;
        leases.preview = Some(preview);

        let now = Utc::now();
        let record = self
            .storage
            .create_sandbox(Sandbox {
                id: sandbox_id.to_string(),
                tenant_id: request.tenant_id.clone(),
                owner_id: request.owner_id.clone(),
                directory_path: directory.to_string_lossy().into_owned(),
                knowledge_path: Some(request.knowledge_path.to_string_lossy().into_owned()),
                status: SandboxStatus::Running,
                pid: Some(pid),
                port: Some(port),
                created_at: now,
                last_heartbeat: Some(now),
                terminated_at: None,
            })
            .await?;
        Ok(record)
    }

    async fn rollback_provision(&self, sandbox_id: &str, leases: Leases) {
        if let Some(mut preview) = leases.preview {
            if let Err(e) = self.processes.terminate_process(preview.pid).await {
                warn!("Rollback: failed to stop preview PID {}: {}", preview.pid, e);
            }
            // reap
            preview.is_alive();
        }
        if let Some(port) = leases.port {
            self.ports.release(port).await;
        }
        match self.directories.cleanup_sandbox_directory(sandbox_id) {
            Ok(_) => debug!("Rolled back sandbox {}", sandbox_id),
            Err(e) => warn!("Rollback: failed to remove sandbox {} directory: {}", sandbox_id, e),
        }
    }

    /// Tear a sandbox down. Every step runs even if an earlier one fails;
    /// failures are collected in the returned report. Calling it again on a
    /// terminated or unknown sandbox is harmless.
    pub async fn terminate(&self, sandbox_id: &str) -> TeardownReport {
        let mut report = TeardownReport::new(sandbox_id);

        let record = match self.storage.get_sandbox(sandbox_id).await {
            Ok(record) => Some(record),
            Err(StorageError::NotFound(_)) => {
                info!("Sandbox {} has no record, cleaning up local state only", sandbox_id);
                None
            }
            Err(e) => {
                report.record(TeardownStep::MarkTerminated, &e);
                None
            }
        };
        info!("Terminating sandbox {}", sandbox_id);

        // Agents
        let stale: Vec<AgentClient> = {
            let mut agents = self.agents.lock().await;
            let keys: Vec<SessionKey> = agents
                .keys()
                .filter(|(sandbox, _)| sandbox == sandbox_id)
                .cloned()
                .collect();
            keys.iter().filter_map(|key| agents.remove(key)).collect()
        };
        for client in stale {
            client.stop().await;
        }
        self.session_locks
            .lock()
            .await
            .retain(|(sandbox, _), _| sandbox != sandbox_id);

        // Preview process
        let preview = self.previews.lock().await.remove(sandbox_id);
        let pid = preview
            .as_ref()
            .map(|p| p.pid)
            .or_else(|| record.as_ref().and_then(|r| r.pid));
        if let Some(pid) = pid {
            if let Err(e) = self.processes.terminate_process(pid).await {
                report.record(TeardownStep::StopPreview, &e);
            }
        }

        // Port
        let port = preview
            .as_ref()
            .map(|p| p.port)
            .or_else(|| record.as_ref().and_then(|r| r.port));
        if let Some(port) = port {
            if !self.ports.release(port).await {
                debug!("Port {} for sandbox {} was not leased", port, sandbox_id);
            }
        }
        if let Some(mut preview) = preview {
            preview.is_alive();
        }

        // Directory
        match self.directories.cleanup_sandbox_directory(sandbox_id) {
            Ok(true) => {}
            Ok(false) => debug!("Sandbox {} directory already gone", sandbox_id),
            Err(e) => report.record(TeardownStep::RemoveDirectory, &e),
        }

        // Record
        if let Some(record) = record {
            if record.status == SandboxStatus::Running {
                if let Err(e) = self
                    .storage
                    .update_status(sandbox_id, SandboxStatus::Terminated)
                    .await
                {
                    report.record(TeardownStep::MarkTerminated, &e);
                }
            }
            if record.pid.is_some() || record.port.is_some() {
                if let Err(e) = self.storage.update_process_info(sandbox_id, None, None).await {
                    report.record(TeardownStep::MarkTerminated, &e);
                }
            }
        }

        if report.is_clean() {
            info!("Sandbox {} terminated", sandbox_id);
        } else {
            warn!(
                "Sandbox {} terminated with {} failed step(s)",
                sandbox_id,
                report.failures.len()
            );
        }
        report
    }

    pub async fn get_sandbox_info(&self, sandbox_id: &str) -> Result<Option<SandboxInfo>> {
        match self.storage.get_sandbox(sandbox_id).await {
            Ok(record) => Ok(Some(record.into())),
            Err(StorageError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// True only when the preview process is alive and answers on `/`.
    /// A healthy probe refreshes the heartbeat.
    pub async fn health_check(&self, sandbox_id: &str) -> Result<bool> {
        let record = self.fetch_sandbox(sandbox_id).await?;
        if record.status != SandboxStatus::Running {
            return Ok(false);
        }
        let (Some(pid), Some(port)) = (record.pid, record.port) else {
            debug!("Sandbox {} has no preview process recorded", sandbox_id);
            return Ok(false);
        };

        let alive = match self.previews.lock().await.get_mut(sandbox_id) {
            Some(preview) => preview.is_alive(),
            None => self.processes.is_process_running(pid),
        };
        if !alive {
            warn!("Preview process {} for sandbox {} is not running", pid, sandbox_id);
            return Ok(false);
        }

        let url = format!("http://{}:{}/", self.config.preview_host, port);
        let healthy = self
            .processes
            .wait_for_ready(&url, self.config.health_timeout)
            .await;
        if healthy {
            if let Err(e) = self.storage.update_heartbeat(sandbox_id).await {
                warn!("Failed to update heartbeat for sandbox {}: {}", sandbox_id, e);
            }
        }
        Ok(healthy)
    }

    // ========================================================================
    // SESSION WORKSPACES
    // ========================================================================

    /// Build `sessions/<session_id>` inside a running sandbox, restoring
    /// `outputs/` from `snapshot_path` when given.
    ///
    /// On failure the session directory is removed and
    /// [`SandboxError::ProvisioningFailed`] names the session.
    pub async fn setup_session_workspace(
        &self,
        sandbox_id: &str,
        session_id: &str,
        llm: &LlmProviderConfig,
        snapshot_path: Option<&str>,
        profile: Option<&UserProfile>,
    ) -> Result<PathBuf> {
        let record = self.require_running(sandbox_id).await?;
        let session_path = self.directories.create_session_directory(sandbox_id, session_id)?;

        match self
            .scaffold_session(&record, &session_path, llm, snapshot_path, profile)
            .await
        {
            Ok(()) => {
                info!("Session {} ready in sandbox {}", session_id, sandbox_id);
                Ok(session_path)
            }
            Err(e) => {
                error!("Session {} setup failed: {}", session_id, e);
                if let Err(cleanup) = self.directories.cleanup_session_directory(sandbox_id, session_id) {
                    warn!("Failed to remove session {} directory: {}", session_id, cleanup);
                }
                Err(SandboxError::provisioning(format!("session {}", session_id), e))
            }
        }
    }

    async fn scaffold_session(
        &self,
        record: &Sandbox,
        session_path: &Path,
        llm: &LlmProviderConfig,
        snapshot_path: Option<&str>,
        profile: Option<&UserProfile>,
    ) -> Result<()> {
        let restored = match snapshot_path {
            Some(path) => {
                self.snapshots.restore_snapshot(path, session_path).await?;
                true
            }
            None => false,
        };

        let directories = self.directories.clone();
        let session_path = session_path.to_path_buf();
        let knowledge_path = record.knowledge_path.clone().map(PathBuf::from);
        let preview_port = record.port;
        let disabled_tools = self.config.disabled_tools.clone();
        let llm = llm.clone();
        let profile = profile.cloned();

        tokio::task::spawn_blocking(move || -> Result<()> {
            if !restored {
                directories.setup_outputs_directory(&session_path)?;
            }
            directories.setup_venv(&session_path)?;
            directories.setup_agent_instructions(
                &session_path,
                &InstructionValues {
                    provider: Some(llm.provider.as_str()),
                    model_name: Some(llm.model_name.as_str()),
                    preview_port,
                    disabled_tools: &disabled_tools,
                    profile: profile.as_ref(),
                },
            )?;
            directories.setup_skills(&session_path)?;
            directories.setup_user_uploads_directory(&session_path)?;
            if let Some(knowledge_path) = knowledge_path {
                directories.setup_files_symlink(&session_path, &knowledge_path)?;
            }
            directories.write_opencode_config(&session_path, &llm, &disabled_tools)
        })
        .await
        .map_err(std::io::Error::other)?
    }

    /// Stop the session's agent and delete its directory. The sandbox and
    /// its other sessions are untouched.
    pub async fn cleanup_session_workspace(&self, sandbox_id: &str, session_id: &str) -> Result<bool> {
        let session_path = self.directories.session_path(sandbox_id, session_id)?;
        let key = (sandbox_id.to_string(), session_id.to_string());

        let client = self.agents.lock().await.remove(&key);
        if let Some(client) = client {
            client.stop().await;
        }
        self.session_locks.lock().await.remove(&key);

        let removed = self.directories.cleanup_session_directory(sandbox_id, session_id)?;
        if removed {
            info!("Removed session workspace {}", session_path.display());
        }
        Ok(removed)
    }

    // ========================================================================
    // AGENT MESSAGING
    // ========================================================================

    /// Send `text` to the session's agent and stream its events.
    ///
    /// The agent subprocess is started on first use and replaced when it has
    /// died. Calls for the same session are serialized: a second call waits
    /// until the previous stream is dropped. The sandbox heartbeat is
    /// refreshed before sending and on every event.
    pub async fn send_message(
        &self,
        sandbox_id: &str,
        session_id: &str,
        text: &str,
    ) -> Result<impl Stream<Item = AcpEvent> + Send + 'static> {
        if text.trim().is_empty() {
            return Err(SandboxError::InvalidRequest("Message cannot be empty".to_string()));
        }
        self.require_running(sandbox_id).await?;

        let session_path = self.directories.session_path(sandbox_id, session_id)?;
        if !session_path.is_dir() {
            return Err(SandboxError::NotFound(format!(
                "session {} in sandbox {}",
                session_id, sandbox_id
            )));
        }

        let key = (sandbox_id.to_string(), session_id.to_string());
        let session_lock = {
            let mut locks = self.session_locks.lock().await;
            Arc::clone(locks.entry(key.clone()).or_default())
        };
        let guard = session_lock.lock_owned().await;

        let client = self.agent_for(&key, &session_path).await;

        let storage = Arc::clone(&self.storage);
        let sandbox_id = sandbox_id.to_string();
        if let Err(e) = storage.update_heartbeat(&sandbox_id).await {
            warn!("Failed to update heartbeat for sandbox {}: {}", sandbox_id, e);
        }
        debug!("Sending message to session {} in sandbox {}", session_id, sandbox_id);

        let events = client.send_message(text.to_string());
        Ok(stream! {
            let _guard = guard;
            let mut events = Box::pin(events);
            while let Some(event) = events.next().await {
                if let Err(e) = storage.update_heartbeat(&sandbox_id).await {
                    warn!("Failed to update heartbeat for sandbox {}: {}", sandbox_id, e);
                }
                yield event;
            }
        })
    }

    /// Ask the session's agent to stop its current prompt. No-op without one.
    pub async fn cancel_agent(&self, sandbox_id: &str, session_id: &str) -> Result<()> {
        let key = (sandbox_id.to_string(), session_id.to_string());
        let client = self.agents.lock().await.get(&key).cloned();
        match client {
            Some(client) => client.cancel().await,
            None => {
                debug!("No agent to cancel for session {}", session_id);
                Ok(())
            }
        }
    }

    /// Reuse the session's client while it is usable, otherwise swap in a fresh one
    async fn agent_for(&self, key: &SessionKey, session_path: &Path) -> AgentClient {
        let (client, stale) = {
            let mut agents = self.agents.lock().await;
            if let Some(existing) = agents.get(key) {
                if existing.is_usable().await {
                    return existing.clone();
                }
            }
            let client = AgentClient::new(self.config.agent_command.clone(), session_path)
                .with_handshake_timeout(self.config.handshake_timeout)
                .with_prompt_timeout(self.config.prompt_timeout);
            let stale = agents.insert(key.clone(), client.clone());
            (client, stale)
        };

        if let Some(stale) = stale {
            info!("Replacing agent for session {} in sandbox {}", key.1, key.0);
            stale.stop().await;
        }
        client
    }

    // ========================================================================
    // SNAPSHOTS AND OUTPUT FILES
    // ========================================================================

    /// Archive the session's `outputs/` and record the snapshot
    pub async fn create_snapshot(&self, sandbox_id: &str, session_id: &str) -> Result<SnapshotInfo> {
        let record = self.fetch_sandbox(sandbox_id).await?;
        let session_path = self.existing_session(sandbox_id, session_id)?;

        let (id, storage_path, size_bytes) = self
            .snapshots
            .create_snapshot(&session_path, session_id, &record.tenant_id)
            .await?;

        let snapshot = self
            .storage
            .create_snapshot(Snapshot {
                id,
                sandbox_id: sandbox_id.to_string(),
                session_id: session_id.to_string(),
                tenant_id: record.tenant_id,
                storage_path,
                size_bytes,
                created_at: Utc::now(),
            })
            .await?;
        Ok(snapshot.into())
    }

    /// Newest snapshot for a session, if any
    pub async fn latest_snapshot(&self, session_id: &str) -> Result<Option<SnapshotInfo>> {
        Ok(self
            .storage
            .get_latest_snapshot_for_session(session_id)
            .await?
            .map(SnapshotInfo::from))
    }

    /// List a directory under the session's `outputs/`
    pub async fn list_directory(
        &self,
        sandbox_id: &str,
        session_id: &str,
        path: &str,
    ) -> Result<Vec<FilesystemEntry>> {
        let session_path = self.existing_session(sandbox_id, session_id)?;
        self.directories.list_outputs_directory(&session_path, path)
    }

    /// Read a file under the session's `outputs/`
    pub async fn read_file(&self, sandbox_id: &str, session_id: &str, path: &str) -> Result<Vec<u8>> {
        let session_path = self.existing_session(sandbox_id, session_id)?;
        self.directories.read_outputs_file(&session_path, path)
    }

    // ========================================================================
    // HELPERS
    // ========================================================================

    async fn fetch_sandbox(&self, sandbox_id: &str) -> Result<Sandbox> {
        match self.storage.get_sandbox(sandbox_id).await {
            Ok(record) => Ok(record),
            Err(StorageError::NotFound(_)) => Err(SandboxError::NotFound(sandbox_id.to_string())),
            Err(e) => Err(e.into()),
        }
    }

    async fn require_running(&self, sandbox_id: &str) -> Result<Sandbox> {
        let record = self.fetch_sandbox(sandbox_id).await?;
        if record.status != SandboxStatus::Running {
            return Err(SandboxError::SandboxNotRunning {
                sandbox_id: sandbox_id.to_string(),
            });
        }
        Ok(record)
    }

    fn existing_session(&self, sandbox_id: &str, session_id: &str) -> Result<PathBuf> {
        let session_path = self.directories.session_path(sandbox_id, session_id)?;
        if !session_path.is_dir() {
            return Err(SandboxError::NotFound(format!(
                "session {} in sandbox {}",
                session_id, sandbox_id
            )));
        }
        Ok(session_path)
    }
}
