// ABOUTME: Shared fixtures for integration tests: templates, in-memory storage and a manager
// ABOUTME: Each TestEnv owns its temp directory so tests never share filesystem state

#![allow(dead_code)]

use sandbox_runtime::{
    CommandLine, LlmProviderConfig, LocalObjectStore, ProvisionRequest, SandboxConfig,
    SandboxInfo, SandboxManager, SandboxStorage,
};
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use std::fs;
use std::net::TcpListener;
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

pub struct TestEnv {
    pub root: TempDir,
    pub manager: Arc<SandboxManager>,
    pub storage: Arc<SandboxStorage>,
    /// Same single connection the storage uses
    pub pool: SqlitePool,
    pub knowledge: PathBuf,
    pub ports: (u16, u16),
}

impl TestEnv {
    pub fn request(&self, sandbox_id: &str, tenant_id: &str) -> ProvisionRequest {
        ProvisionRequest {
            sandbox_id: Some(sandbox_id.to_string()),
            tenant_id: tenant_id.to_string(),
            owner_id: "u1".to_string(),
            knowledge_path: self.knowledge.clone(),
        }
    }

    pub async fn provision(&self, sandbox_id: &str) -> SandboxInfo {
        self.manager
            .provision(self.request(sandbox_id, "t1"))
            .await
            .expect("provision failed")
    }

    pub fn sandbox_dir(&self, sandbox_id: &str) -> PathBuf {
        self.root.path().join("sandboxes").join(sandbox_id)
    }

    pub fn session_dir(&self, sandbox_id: &str, session_id: &str) -> PathBuf {
        self.sandbox_dir(sandbox_id).join("sessions").join(session_id)
    }
}

pub fn llm() -> LlmProviderConfig {
    LlmProviderConfig {
        provider: "anthropic".to_string(),
        model_name: "claude-sonnet".to_string(),
        api_key: Some("sk-test-123".to_string()),
        api_base: None,
    }
}

pub fn mock_agent(args: &[&str]) -> CommandLine {
    let mut all = vec![concat!(env!("CARGO_MANIFEST_DIR"), "/tests/fixtures/mock_agent.sh")];
    all.extend_from_slice(args);
    CommandLine::new("sh", &all)
}

/// Find a small range of ports that are currently free on this host
pub fn free_range(len: u16) -> (u16, u16) {
    for start in (43000..60000).step_by(89) {
        let end = start + len - 1;
        if (start..=end).all(|p| TcpListener::bind(("127.0.0.1", p)).is_ok()) {
            return (start, end);
        }
    }
    panic!("no free port range found");
}

fn write_templates(root: &Path) -> PathBuf {
    let templates = root.join("templates");
    fs::create_dir_all(templates.join("outputs/web")).unwrap();
    fs::write(templates.join("outputs/web/index.html"), "<h1>preview</h1>").unwrap();
    fs::write(templates.join("outputs/README.md"), "# Outputs").unwrap();

    fs::create_dir_all(templates.join("venv/bin")).unwrap();
    fs::write(templates.join("venv/bin/python"), "#!/bin/sh\n").unwrap();
    symlink("python", templates.join("venv/bin/python3")).unwrap();

    fs::create_dir_all(templates.join("skills/charts")).unwrap();
    fs::write(templates.join("skills/charts/SKILL.md"), "Draw charts").unwrap();

    fs::write(
        templates.join("AGENTS.template.md"),
        "Provider {{PROVIDER}} model {{MODEL_NAME}} on port {{NEXTJS_PORT}} for {{USER_NAME}}\n",
    )
    .unwrap();
    templates
}

pub async fn setup() -> TestEnv {
    setup_with(|config| config).await
}

/// Build a manager over fresh templates, with `customize` applied last
pub async fn setup_with(customize: impl FnOnce(SandboxConfig) -> SandboxConfig) -> TestEnv {
    let root = TempDir::new().unwrap();
    let templates = write_templates(root.path());
    let knowledge = root.path().join("knowledge");
    fs::create_dir_all(&knowledge).unwrap();
    fs::write(knowledge.join("handbook.pdf"), "pdf").unwrap();

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    let storage = Arc::new(SandboxStorage::new(pool.clone()));
    storage.run_migrations().await.unwrap();

    let ports = free_range(4);
    let config = SandboxConfig::default()
        .with_base_path(root.path().join("sandboxes"))
        .with_template_root(&templates)
        .with_port_range(ports.0, ports.1)
        .with_max_concurrent_per_tenant(0)
        .with_preview_command(CommandLine::new("sh", &["-c", "sleep 30"]))
        .with_preview_host("127.0.0.1")
        .with_startup_grace(Duration::from_millis(100))
        .with_health_timeout(Duration::from_secs(2))
        .with_agent_command(mock_agent(&["normal"]))
        .with_handshake_timeout(Duration::from_secs(10));

    let manager = SandboxManager::new(
        customize(config),
        Arc::clone(&storage),
        Arc::new(LocalObjectStore::new(root.path().join("object-store"))),
    )
    .unwrap();

    TestEnv {
        root,
        manager: Arc::new(manager),
        storage,
        pool,
        knowledge,
        ports,
    }
}
