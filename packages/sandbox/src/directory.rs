// ABOUTME: Filesystem scaffolding for sandbox and session directory trees
// ABOUTME: Copies templates, links shared files, renders agent config and confines reads to outputs/

use crate::agent_config::{build_opencode_config, render_agent_instructions, InstructionValues};
use crate::config::SandboxConfig;
use crate::error::{Result, SandboxError};
use crate::types::{FilesystemEntry, LlmProviderConfig};
use chrono::{DateTime, Utc};
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::{symlink, OpenOptionsExt};
use std::path::{Component, Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

pub const SESSIONS_DIR: &str = "sessions";
pub const OUTPUTS_DIR: &str = "outputs";
pub const FILES_LINK: &str = "files";
pub const VENV_DIR: &str = ".venv";
pub const AGENTS_FILE: &str = "AGENTS.md";
pub const SKILLS_DIR: &str = ".agent/skills";
pub const OPENCODE_CONFIG_FILE: &str = "opencode.json";
pub const USER_UPLOADS_DIR: &str = "user_uploaded_files";

/// Extra output folders created next to the copied template
const OUTPUT_SUBDIRS: &[&str] = &["slides", "markdown", "graphs"];

/// Validate a sandbox or session id before it becomes a path component.
///
/// Ids may only contain alphanumerics, hyphens and underscores, which rules
/// out `..`, separators and anything else that could escape the base path.
pub fn validate_id(id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(SandboxError::InvalidId {
            id: id.to_string(),
            reason: "ID cannot be empty".to_string(),
        });
    }

    if id.contains("..") || id.contains('/') || id.contains('\\') {
        return Err(SandboxError::InvalidId {
            id: id.to_string(),
            reason: "ID cannot contain path traversal sequences (.. / \\)".to_string(),
        });
    }

    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
        return Err(SandboxError::InvalidId {
            id: id.to_string(),
            reason: "ID can only contain alphanumeric characters, hyphens, and underscores"
                .to_string(),
        });
    }

    Ok(())
}

/// Creates and removes sandbox/session trees. Holds no process or database state.
#[derive(Debug, Clone)]
pub struct DirectoryManager {
    base_path: PathBuf,
    outputs_template_path: PathBuf,
    venv_template_path: PathBuf,
    skills_path: PathBuf,
    agent_instructions_template_path: PathBuf,
}

impl DirectoryManager {
    /// Fails with [`SandboxError::Configuration`] when a required template is
    /// missing. Skills and agent instructions are optional.
    pub fn new(config: &SandboxConfig) -> Result<Self> {
        let mut missing = Vec::new();
        for (name, path) in [
            ("outputs template", &config.outputs_template_path),
            ("venv template", &config.venv_template_path),
        ] {
            if !path.is_dir() {
                missing.push(format!("{} ({})", name, path.display()));
            }
        }
        if !missing.is_empty() {
            return Err(SandboxError::Configuration(format!(
                "Missing sandbox templates: {}",
                missing.join(", ")
            )));
        }

        if !config.skills_path.is_dir() {
            warn!(
                "Skills directory {} not found, sessions will start without skills",
                config.skills_path.display()
            );
        }
        if !config.agent_instructions_template_path.is_file() {
            warn!(
                "Agent instructions template {} not found, AGENTS.md will not be generated",
                config.agent_instructions_template_path.display()
            );
        }

        Ok(Self {
            base_path: config.base_path.clone(),
            outputs_template_path: config.outputs_template_path.clone(),
            venv_template_path: config.venv_template_path.clone(),
            skills_path: config.skills_path.clone(),
            agent_instructions_template_path: config.agent_instructions_template_path.clone(),
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    pub fn sandbox_path(&self, sandbox_id: &str) -> Result<PathBuf> {
        validate_id(sandbox_id)?;
        Ok(self.base_path.join(sandbox_id))
    }

    pub fn session_path(&self, sandbox_id: &str, session_id: &str) -> Result<PathBuf> {
        validate_id(session_id)?;
        Ok(self.sandbox_path(sandbox_id)?.join(SESSIONS_DIR).join(session_id))
    }

    /// Claims the sandbox root exclusively; fails with
    /// [`SandboxError::InvalidRequest`] when it already exists
    pub fn create_sandbox_directory(&self, sandbox_id: &str) -> Result<PathBuf> {
        let path = self.sandbox_path(sandbox_id)?;
        fs::create_dir_all(&self.base_path)?;
        match fs::create_dir(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                return Err(SandboxError::InvalidRequest(format!(
                    "Sandbox directory {} already exists",
                    path.display()
                )))
            }
            Err(e) => return Err(e.into()),
        }
        fs::create_dir(path.join(SESSIONS_DIR))?;
        info!("Created sandbox directory {}", path.display());
        Ok(path)
    }

    /// Returns false when there was nothing to remove
    pub fn cleanup_sandbox_directory(&self, sandbox_id: &str) -> Result<bool> {
        let path = self.sandbox_path(sandbox_id)?;
        remove_tree(&path)
    }

    /// The parent sandbox directory must already exist
    pub fn create_session_directory(&self, sandbox_id: &str, session_id: &str) -> Result<PathBuf> {
        let sandbox_path = self.sandbox_path(sandbox_id)?;
        if !sandbox_path.is_dir() {
            return Err(SandboxError::NotFound(format!(
                "sandbox directory {}",
                sandbox_path.display()
            )));
        }

        let path = self.session_path(sandbox_id, session_id)?;
        fs::create_dir_all(&path)?;
        debug!("Created session directory {}", path.display());
        Ok(path)
    }

    pub fn cleanup_session_directory(&self, sandbox_id: &str, session_id: &str) -> Result<bool> {
        let path = self.session_path(sandbox_id, session_id)?;
        remove_tree(&path)
    }

    /// Link `<dir>/files` to the shared knowledge directory. An existing link is kept.
    pub fn setup_files_symlink(&self, dir: &Path, knowledge_path: &Path) -> Result<()> {
        let link = dir.join(FILES_LINK);
        if fs::symlink_metadata(&link).is_ok() {
            return Ok(());
        }
        symlink(knowledge_path, &link)?;
        debug!("Linked {} -> {}", link.display(), knowledge_path.display());
        Ok(())
    }

    pub fn setup_outputs_directory(&self, session_path: &Path) -> Result<PathBuf> {
        let outputs = self.outputs_path(session_path);
        if !outputs.exists() {
            copy_tree(&self.outputs_template_path, &outputs)?;
        }
        for sub in OUTPUT_SUBDIRS {
            fs::create_dir_all(outputs.join(sub))?;
        }
        Ok(outputs)
    }

    pub fn setup_venv(&self, session_path: &Path) -> Result<PathBuf> {
        let venv = session_path.join(VENV_DIR);
        if !venv.exists() {
            copy_tree(&self.venv_template_path, &venv)?;
        }
        Ok(venv)
    }

    /// Render AGENTS.md from the template. An existing file is left untouched.
    pub fn setup_agent_instructions(
        &self,
        session_path: &Path,
        values: &InstructionValues<'_>,
    ) -> Result<()> {
        let target = session_path.join(AGENTS_FILE);
        if target.exists() {
            return Ok(());
        }
        if !self.agent_instructions_template_path.is_file() {
            return Ok(());
        }

        let template = fs::read_to_string(&self.agent_instructions_template_path)?;
        fs::write(&target, render_agent_instructions(&template, values))?;
        debug!("Generated {}", target.display());
        Ok(())
    }

    /// Replace `.agent/skills` with a fresh copy of the skills directory
    pub fn setup_skills(&self, session_path: &Path) -> Result<()> {
        if !self.skills_path.is_dir() {
            warn!(
                "Skills path {} does not exist, skipping skills setup",
                self.skills_path.display()
            );
            return Ok(());
        }

        let dest = session_path.join(SKILLS_DIR);
        remove_tree(&dest)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)?;
        }
        copy_tree(&self.skills_path, &dest)
    }

    pub fn setup_user_uploads_directory(&self, session_path: &Path) -> Result<PathBuf> {
        let uploads = session_path.join(USER_UPLOADS_DIR);
        fs::create_dir_all(&uploads)?;
        Ok(uploads)
    }

    /// Write opencode.json, readable only by the owner since it carries the API key
    pub fn write_opencode_config(
        &self,
        session_path: &Path,
        llm: &LlmProviderConfig,
        disabled_tools: &[String],
    ) -> Result<()> {
        let config = build_opencode_config(llm, disabled_tools);
        let body = serde_json::to_vec_pretty(&config)?;

        let path = session_path.join(OPENCODE_CONFIG_FILE);
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&path)?;
        std::io::Write::write_all(&mut file, &body)?;

        debug!("Wrote agent configuration for provider {}", llm.provider);
        Ok(())
    }

    pub fn outputs_path(&self, session_path: &Path) -> PathBuf {
        session_path.join(OUTPUTS_DIR)
    }

    /// Resolve `requested` against the session's outputs root, following
    /// symlinks, and reject anything that lands outside it.
    pub fn resolve_in_outputs(&self, session_path: &Path, requested: &str) -> Result<PathBuf> {
        let root = self.outputs_path(session_path).canonicalize()?;
        let candidate = root.join(requested.trim_start_matches('/'));

        let resolved = match candidate.canonicalize() {
            Ok(path) => path,
            Err(e) if e.kind() == ErrorKind::NotFound => resolve_missing(&candidate)?,
            Err(e) => return Err(e.into()),
        };

        if !resolved.starts_with(&root) {
            warn!("Rejected path outside outputs root: {}", requested);
            return Err(SandboxError::PathTraversal {
                path: requested.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Directories first, then case-insensitive name
    pub fn list_outputs_directory(
        &self,
        session_path: &Path,
        requested: &str,
    ) -> Result<Vec<FilesystemEntry>> {
        let root = self.outputs_path(session_path).canonicalize()?;
        let target = self.resolve_in_outputs(session_path, requested)?;
        if !target.is_dir() {
            return Err(SandboxError::NotADirectory(requested.to_string()));
        }

        let mut entries = Vec::new();
        for item in fs::read_dir(&target)? {
            let item = item?;
            let path = item.path();
            let metadata = match fs::metadata(&path) {
                Ok(m) => m,
                // Dangling symlink
                Err(_) => fs::symlink_metadata(&path)?,
            };
            let relative = path.strip_prefix(&root).unwrap_or(&path);

            entries.push(FilesystemEntry {
                name: item.file_name().to_string_lossy().into_owned(),
                path: relative.to_string_lossy().into_owned(),
                is_directory: metadata.is_dir(),
                size_bytes: metadata.is_file().then_some(metadata.len()),
                modified_at: metadata.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        entries.sort_by(|a, b| {
            b.is_directory
                .cmp(&a.is_directory)
                .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
        });
        Ok(entries)
    }

    pub fn read_outputs_file(&self, session_path: &Path, requested: &str) -> Result<Vec<u8>> {
        let target = self.resolve_in_outputs(session_path, requested)?;
        if !target.is_file() {
            return Err(SandboxError::NotAFile(requested.to_string()));
        }
        Ok(fs::read(target)?)
    }
}

/// Remove a directory tree or a stray file/link. Returns false when absent.
fn remove_tree(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            debug!("{} already removed", path.display());
            return Ok(false);
        }
        Err(e) => return Err(e.into()),
    }
    info!("Removed {}", path.display());
    Ok(true)
}

/// Recursively copy `from` into `to`, recreating symlinks instead of following them
fn copy_tree(from: &Path, to: &Path) -> Result<()> {
    let copy_err = |reason: String| SandboxError::TemplateCopy {
        from: from.to_path_buf(),
        reason,
    };

    for entry in WalkDir::new(from).follow_links(false) {
        let entry = entry.map_err(|e| copy_err(e.to_string()))?;
        let relative = entry
            .path()
            .strip_prefix(from)
            .map_err(|e| copy_err(e.to_string()))?;
        let target = to.join(relative);
        let file_type = entry.file_type();

        if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            symlink(link, &target)?;
        } else if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| copy_err(e.to_string()))?;
        }
    }
    Ok(())
}

/// Canonicalize the deepest existing ancestor of a path that does not exist
/// yet and re-append the remaining components.
fn resolve_missing(path: &Path) -> Result<PathBuf> {
    let normalized = normalize_lexically(path);
    let mut existing = normalized.as_path();
    let mut rest = Vec::new();

    loop {
        match existing.canonicalize() {
            Ok(base) => {
                let mut resolved = base;
                for part in rest.iter().rev() {
                    resolved.push(part);
                }
                return Ok(resolved);
            }
            Err(_) => match (existing.parent(), existing.file_name()) {
                (Some(parent), Some(name)) => {
                    rest.push(name.to_os_string());
                    existing = parent;
                }
                _ => return Ok(normalized),
            },
        }
    }
}

fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct Fixture {
        _root: TempDir,
        config: SandboxConfig,
        knowledge: PathBuf,
    }

    fn fixture() -> Fixture {
        let root = TempDir::new().unwrap();
        let templates = root.path().join("templates");

        fs::create_dir_all(templates.join("outputs/web")).unwrap();
        fs::write(templates.join("outputs/web/index.html"), "<h1>hi</h1>").unwrap();
        fs::create_dir_all(templates.join("venv/bin")).unwrap();
        fs::write(templates.join("venv/bin/python3.11"), "#!/bin/sh\n").unwrap();
        symlink("python3.11", templates.join("venv/bin/python")).unwrap();
        fs::create_dir_all(templates.join("skills/pptx")).unwrap();
        fs::write(templates.join("skills/pptx/SKILL.md"), "make slides").unwrap();
        fs::write(
            templates.join("AGENTS.template.md"),
            "Using {{PROVIDER}} on {{NEXTJS_PORT}}",
        )
        .unwrap();

        let knowledge = root.path().join("kb");
        fs::create_dir_all(&knowledge).unwrap();

        let config = SandboxConfig::default()
            .with_base_path(root.path().join("sandboxes"))
            .with_template_root(&templates);

        Fixture {
            _root: root,
            config,
            knowledge,
        }
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("sb1").is_ok());
        assert!(validate_id("session_01-a").is_ok());
        assert!(validate_id("").is_err());
        assert!(validate_id("..").is_err());
        assert!(validate_id("a/b").is_err());
        assert!(validate_id("a b").is_err());
        assert!(validate_id("a;rm").is_err());
    }

    #[test]
    fn test_missing_templates_fail_construction() {
        let root = TempDir::new().unwrap();
        let config = SandboxConfig::default().with_template_root(root.path());

        let err = DirectoryManager::new(&config).unwrap_err();
        match err {
            SandboxError::Configuration(msg) => {
                assert!(msg.contains("outputs template"));
                assert!(msg.contains("venv template"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_optional_templates_may_be_missing() {
        let fx = fixture();
        fs::remove_dir_all(&fx.config.skills_path).unwrap();
        fs::remove_file(&fx.config.agent_instructions_template_path).unwrap();
        let manager = DirectoryManager::new(&fx.config).unwrap();

        manager.create_sandbox_directory("sb1").unwrap();
        let session = manager.create_session_directory("sb1", "s1").unwrap();
        manager.setup_skills(&session).unwrap();
        manager
            .setup_agent_instructions(&session, &InstructionValues::default())
            .unwrap();
        assert!(!session.join(SKILLS_DIR).exists());
        assert!(!session.join(AGENTS_FILE).exists());
    }

    #[test]
    fn test_full_session_layout() {
        let fx = fixture();
        let manager = DirectoryManager::new(&fx.config).unwrap();

        let sandbox = manager.create_sandbox_directory("sb1").unwrap();
        manager.setup_files_symlink(&sandbox, &fx.knowledge).unwrap();
        let session = manager.create_session_directory("sb1", "s1").unwrap();
        assert_eq!(session, sandbox.join("sessions").join("s1"));

        manager.setup_outputs_directory(&session).unwrap();
        manager.setup_venv(&session).unwrap();
        manager.setup_skills(&session).unwrap();
        manager.setup_user_uploads_directory(&session).unwrap();
        manager.setup_files_symlink(&session, &fx.knowledge).unwrap();
        manager
            .setup_agent_instructions(
                &session,
                &InstructionValues {
                    provider: Some("openai"),
                    preview_port: Some(3010),
                    ..Default::default()
                },
            )
            .unwrap();
        let llm = LlmProviderConfig {
            provider: "openai".to_string(),
            model_name: "gpt-4o".to_string(),
            api_key: Some("sk-test".to_string()),
            api_base: None,
        };
        manager.write_opencode_config(&session, &llm, &[]).unwrap();

        assert!(session.join("outputs/web/index.html").is_file());
        for sub in OUTPUT_SUBDIRS {
            assert!(session.join("outputs").join(sub).is_dir());
        }
        assert_eq!(
            fs::read_link(session.join(".venv/bin/python")).unwrap(),
            PathBuf::from("python3.11")
        );
        assert!(session.join(".agent/skills/pptx/SKILL.md").is_file());
        assert!(session.join(USER_UPLOADS_DIR).is_dir());
        assert_eq!(fs::read_link(session.join(FILES_LINK)).unwrap(), fx.knowledge);
        assert_eq!(
            fs::read_to_string(session.join(AGENTS_FILE)).unwrap(),
            "Using openai on 3010"
        );

        let config: serde_json::Value =
            serde_json::from_slice(&fs::read(session.join(OPENCODE_CONFIG_FILE)).unwrap()).unwrap();
        assert_eq!(config["model"], "openai/gpt-4o");
        let mode = fs::metadata(session.join(OPENCODE_CONFIG_FILE)).unwrap().permissions();
        assert_eq!(std::os::unix::fs::PermissionsExt::mode(&mode) & 0o777, 0o600);
    }

    #[test]
    fn test_session_requires_sandbox_directory() {
        let fx = fixture();
        let manager = DirectoryManager::new(&fx.config).unwrap();
        let err = manager.create_session_directory("missing", "s1").unwrap_err();
        assert!(matches!(err, SandboxError::NotFound(_)));
    }

    #[test]
    fn test_sandbox_directory_is_claimed_once() {
        let fx = fixture();
        let manager = DirectoryManager::new(&fx.config).unwrap();
        let sandbox = manager.create_sandbox_directory("sb1").unwrap();
        fs::write(sandbox.join("marker"), "x").unwrap();

        let err = manager.create_sandbox_directory("sb1").unwrap_err();
        assert!(matches!(err, SandboxError::InvalidRequest(_)));
        assert!(sandbox.join("marker").exists());
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let fx = fixture();
        let manager = DirectoryManager::new(&fx.config).unwrap();
        manager.create_sandbox_directory("sb1").unwrap();
        manager.create_session_directory("sb1", "s1").unwrap();

        assert!(manager.cleanup_session_directory("sb1", "s1").unwrap());
        assert!(!manager.cleanup_session_directory("sb1", "s1").unwrap());
        assert!(manager.sandbox_path("sb1").unwrap().is_dir());

        assert!(manager.cleanup_sandbox_directory("sb1").unwrap());
        assert!(!manager.cleanup_sandbox_directory("sb1").unwrap());
    }

    #[test]
    fn test_skills_are_refreshed() {
        let fx = fixture();
        let manager = DirectoryManager::new(&fx.config).unwrap();
        manager.create_sandbox_directory("sb1").unwrap();
        let session = manager.create_session_directory("sb1", "s1").unwrap();

        manager.setup_skills(&session).unwrap();
        fs::write(session.join(".agent/skills/stale.md"), "old").unwrap();
        manager.setup_skills(&session).unwrap();

        assert!(!session.join(".agent/skills/stale.md").exists());
        assert!(session.join(".agent/skills/pptx/SKILL.md").exists());
    }

    #[test]
    fn test_existing_agents_file_is_kept() {
        let fx = fixture();
        let manager = DirectoryManager::new(&fx.config).unwrap();
        manager.create_sandbox_directory("sb1").unwrap();
        let session = manager.create_session_directory("sb1", "s1").unwrap();
        fs::write(session.join(AGENTS_FILE), "custom").unwrap();

        manager
            .setup_agent_instructions(&session, &InstructionValues::default())
            .unwrap();
        assert_eq!(fs::read_to_string(session.join(AGENTS_FILE)).unwrap(), "custom");
    }

    #[test]
    fn test_resolve_rejects_traversal() {
        let fx = fixture();
        let manager = DirectoryManager::new(&fx.config).unwrap();
        let sandbox = manager.create_sandbox_directory("sb1").unwrap();
        let session = manager.create_session_directory("sb1", "s1").unwrap();
        manager.setup_outputs_directory(&session).unwrap();
        fs::write(sandbox.join("secret.txt"), "nope").unwrap();
        symlink(&sandbox, session.join("outputs/escape")).unwrap();

        for bad in [
            "../../secret.txt",
            "web/../../AGENTS.md",
            "escape/secret.txt",
            "escape",
            "../../../does-not-exist",
            "escape/missing/deeper",
        ] {
            let err = manager.resolve_in_outputs(&session, bad).unwrap_err();
            assert!(
                matches!(err, SandboxError::PathTraversal { .. }),
                "{} was not rejected",
                bad
            );
        }

        assert!(manager.resolve_in_outputs(&session, "/web/index.html").is_ok());
        assert!(manager.resolve_in_outputs(&session, "").is_ok());
    }

    #[test]
    fn test_list_and_read_outputs() {
        let fx = fixture();
        let manager = DirectoryManager::new(&fx.config).unwrap();
        manager.create_sandbox_directory("sb1").unwrap();
        let session = manager.create_session_directory("sb1", "s1").unwrap();
        manager.setup_outputs_directory(&session).unwrap();
        fs::write(session.join("outputs/Zeta.md"), "z").unwrap();
        fs::write(session.join("outputs/alpha.md"), "abc").unwrap();

        let entries = manager.list_outputs_directory(&session, "/").unwrap();
        let names: Vec<_> = entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(
            names,
            vec!["graphs", "markdown", "slides", "web", "alpha.md", "Zeta.md"]
        );
        let alpha = entries.iter().find(|e| e.name == "alpha.md").unwrap();
        assert_eq!(alpha.size_bytes, Some(3));
        assert_eq!(alpha.path, "alpha.md");
        assert!(entries[0].size_bytes.is_none());

        let nested = manager.list_outputs_directory(&session, "web").unwrap();
        assert_eq!(nested[0].path, "web/index.html");

        assert_eq!(manager.read_outputs_file(&session, "alpha.md").unwrap(), b"abc");
        assert!(matches!(
            manager.read_outputs_file(&session, "web"),
            Err(SandboxError::NotAFile(_))
        ));
        assert!(matches!(
            manager.list_outputs_directory(&session, "alpha.md"),
            Err(SandboxError::NotADirectory(_))
        ));
    }
}
