// ABOUTME: Runtime configuration for sandbox provisioning, loaded from environment variables
// ABOUTME: Typed parsing with validation and fallback defaults for every tunable

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

/// Environment variable names read by [`SandboxConfig::from_env`]
pub mod env_vars {
    // Filesystem layout
    pub const SANDBOX_BASE_PATH: &str = "SANDBOX_BASE_PATH";
    pub const OUTPUTS_TEMPLATE_PATH: &str = "OUTPUTS_TEMPLATE_PATH";
    pub const VENV_TEMPLATE_PATH: &str = "VENV_TEMPLATE_PATH";
    pub const SANDBOX_SKILLS_PATH: &str = "SANDBOX_SKILLS_PATH";
    pub const SANDBOX_AGENT_INSTRUCTIONS_PATH: &str = "SANDBOX_AGENT_INSTRUCTIONS_PATH";

    // Ports and quotas
    pub const SANDBOX_PORT_RANGE_START: &str = "SANDBOX_PORT_RANGE_START";
    pub const SANDBOX_PORT_RANGE_END: &str = "SANDBOX_PORT_RANGE_END";
    pub const SANDBOX_MAX_CONCURRENT_PER_ORG: &str = "SANDBOX_MAX_CONCURRENT_PER_ORG";

    // Preview process
    pub const SANDBOX_PREVIEW_COMMAND: &str = "SANDBOX_PREVIEW_COMMAND";
    pub const SANDBOX_PREVIEW_HOST: &str = "SANDBOX_PREVIEW_HOST";
    pub const SANDBOX_STARTUP_GRACE_MS: &str = "SANDBOX_STARTUP_GRACE_MS";
    pub const SANDBOX_HEALTH_TIMEOUT_SECS: &str = "SANDBOX_HEALTH_TIMEOUT_SECS";

    // Agent subprocess
    pub const SANDBOX_AGENT_COMMAND: &str = "SANDBOX_AGENT_COMMAND";
    pub const ACP_HANDSHAKE_TIMEOUT_SECS: &str = "ACP_HANDSHAKE_TIMEOUT_SECS";
    pub const ACP_MESSAGE_TIMEOUT_SECS: &str = "ACP_MESSAGE_TIMEOUT_SECS";
    pub const OPENCODE_DISABLED_TOOLS: &str = "OPENCODE_DISABLED_TOOLS";
}

pub const DEFAULT_PORT_RANGE_START: u16 = 3010;
pub const DEFAULT_PORT_RANGE_END: u16 = 3100;
pub const DEFAULT_MAX_CONCURRENT_PER_TENANT: usize = 10;

/// A program plus its arguments, parsed from a whitespace separated string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandLine {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
        }
    }

    /// Returns `None` for an empty or whitespace-only string
    pub fn parse(raw: &str) -> Option<Self> {
        let mut parts = raw.split_whitespace().map(str::to_string);
        let program = parts.next()?;
        Some(Self {
            program,
            args: parts.collect(),
        })
    }

    /// Arguments with every `{port}` placeholder replaced
    pub fn args_with_port(&self, port: u16) -> Vec<String> {
        let port = port.to_string();
        self.args.iter().map(|a| a.replace("{port}", &port)).collect()
    }

    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

#[derive(Debug, Clone)]
pub struct SandboxConfig {
    pub base_path: PathBuf,
    pub outputs_template_path: PathBuf,
    pub venv_template_path: PathBuf,
    pub skills_path: PathBuf,
    pub agent_instructions_template_path: PathBuf,
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Zero disables the per-tenant cap
    pub max_concurrent_per_tenant: usize,
    pub preview_command: CommandLine,
    pub preview_host: String,
    pub startup_grace: Duration,
    pub health_timeout: Duration,
    pub agent_command: CommandLine,
    pub handshake_timeout: Duration,
    pub prompt_timeout: Option<Duration>,
    pub disabled_tools: Vec<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from("/tmp/sandboxes"),
            outputs_template_path: PathBuf::from("/templates/outputs"),
            venv_template_path: PathBuf::from("/templates/venv"),
            skills_path: PathBuf::from("/templates/skills"),
            agent_instructions_template_path: PathBuf::from("/templates/AGENTS.template.md"),
            port_range_start: DEFAULT_PORT_RANGE_START,
            port_range_end: DEFAULT_PORT_RANGE_END,
            max_concurrent_per_tenant: DEFAULT_MAX_CONCURRENT_PER_TENANT,
            preview_command: CommandLine::new("python3", &["-m", "http.server", "{port}"]),
            preview_host: "localhost".to_string(),
            startup_grace: Duration::from_millis(2000),
            health_timeout: Duration::from_secs(5),
            agent_command: CommandLine::new("opencode", &["acp"]),
            handshake_timeout: Duration::from_secs(30),
            prompt_timeout: None,
            disabled_tools: Vec::new(),
        }
    }
}

impl SandboxConfig {
    /// Load configuration from the environment, falling back to defaults
    /// for anything unset or invalid.
    pub fn from_env() -> Self {
        use env_vars::*;

        let defaults = Self::default();

        let mut port_range_start =
            parse_env_or_default_with_validation(SANDBOX_PORT_RANGE_START, defaults.port_range_start, |p| p > 0);
        let mut port_range_end =
            parse_env_or_default_with_validation(SANDBOX_PORT_RANGE_END, defaults.port_range_end, |p| p > 0);
        if port_range_start > port_range_end {
            warn!(
                "Port range {}-{} is empty, using default: {}-{}",
                port_range_start, port_range_end, DEFAULT_PORT_RANGE_START, DEFAULT_PORT_RANGE_END
            );
            port_range_start = DEFAULT_PORT_RANGE_START;
            port_range_end = DEFAULT_PORT_RANGE_END;
        }

        Self {
            base_path: env_path(SANDBOX_BASE_PATH, defaults.base_path),
            outputs_template_path: env_path(OUTPUTS_TEMPLATE_PATH, defaults.outputs_template_path),
            venv_template_path: env_path(VENV_TEMPLATE_PATH, defaults.venv_template_path),
            skills_path: env_path(SANDBOX_SKILLS_PATH, defaults.skills_path),
            agent_instructions_template_path: env_path(
                SANDBOX_AGENT_INSTRUCTIONS_PATH,
                defaults.agent_instructions_template_path,
            ),
            port_range_start,
            port_range_end,
            max_concurrent_per_tenant: parse_env_or_default(
                SANDBOX_MAX_CONCURRENT_PER_ORG,
                defaults.max_concurrent_per_tenant,
            ),
            preview_command: env_command(SANDBOX_PREVIEW_COMMAND, defaults.preview_command),
            preview_host: std::env::var(SANDBOX_PREVIEW_HOST)
                .ok()
                .filter(|h| !h.trim().is_empty())
                .unwrap_or(defaults.preview_host),
            startup_grace: Duration::from_millis(parse_env_or_default(SANDBOX_STARTUP_GRACE_MS, 2000u64)),
            health_timeout: Duration::from_secs(parse_env_or_default_with_validation(
                SANDBOX_HEALTH_TIMEOUT_SECS,
                5u64,
                |s| s > 0,
            )),
            agent_command: env_command(SANDBOX_AGENT_COMMAND, defaults.agent_command),
            handshake_timeout: Duration::from_secs(parse_env_or_default_with_validation(
                ACP_HANDSHAKE_TIMEOUT_SECS,
                30u64,
                |s| s > 0,
            )),
            prompt_timeout: std::env::var(ACP_MESSAGE_TIMEOUT_SECS)
                .ok()
                .and_then(|raw| match raw.parse::<u64>() {
                    Ok(secs) if secs > 0 => Some(Duration::from_secs(secs)),
                    _ => {
                        warn!(
                            "Environment variable {} has invalid value '{}', prompts will not time out",
                            ACP_MESSAGE_TIMEOUT_SECS, raw
                        );
                        None
                    }
                }),
            disabled_tools: env_list(OPENCODE_DISABLED_TOOLS),
        }
    }

    pub fn with_base_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.base_path = path.into();
        self
    }

    /// Point all four templates at children of `root`:
    /// `outputs/`, `venv/`, `skills/` and `AGENTS.template.md`.
    pub fn with_template_root(mut self, root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        self.outputs_template_path = root.join("outputs");
        self.venv_template_path = root.join("venv");
        self.skills_path = root.join("skills");
        self.agent_instructions_template_path = root.join("AGENTS.template.md");
        self
    }

    pub fn with_port_range(mut self, start: u16, end: u16) -> Self {
        self.port_range_start = start;
        self.port_range_end = end;
        self
    }

    pub fn with_max_concurrent_per_tenant(mut self, limit: usize) -> Self {
        self.max_concurrent_per_tenant = limit;
        self
    }

    pub fn with_preview_command(mut self, command: CommandLine) -> Self {
        self.preview_command = command;
        self
    }

    pub fn with_preview_host(mut self, host: impl Into<String>) -> Self {
        self.preview_host = host.into();
        self
    }

    pub fn with_startup_grace(mut self, grace: Duration) -> Self {
        self.startup_grace = grace;
        self
    }

    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn with_agent_command(mut self, command: CommandLine) -> Self {
        self.agent_command = command;
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_prompt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub fn with_disabled_tools(mut self, tools: Vec<String>) -> Self {
        self.disabled_tools = tools;
        self
    }
}

/// Parse an environment variable, warning and returning `default` when it
/// is set but unparseable
fn parse_env_or_default<T>(var_name: &str, default: T) -> T
where
    T: FromStr + Display,
{
    match std::env::var(var_name) {
        Ok(raw) => raw.trim().parse::<T>().unwrap_or_else(|_| {
            warn!(
                "Environment variable {} has unparseable value '{}', using default: {}",
                var_name, raw, default
            );
            default
        }),
        Err(_) => default,
    }
}

/// Like [`parse_env_or_default`] but also rejects values failing `validator`
fn parse_env_or_default_with_validation<T, F>(var_name: &str, default: T, validator: F) -> T
where
    T: FromStr + Copy + Display,
    F: Fn(T) -> bool,
{
    let value = parse_env_or_default(var_name, default);
    if validator(value) {
        value
    } else {
        warn!(
            "Environment variable {} has invalid value '{}', using default: {}",
            var_name, value, default
        );
        default
    }
}

fn env_path(var_name: &str, default: PathBuf) -> PathBuf {
    std::env::var_os(var_name)
        .filter(|v| !v.is_empty())
        .map(PathBuf::from)
        .unwrap_or(default)
}

fn env_command(var_name: &str, default: CommandLine) -> CommandLine {
    match std::env::var(var_name) {
        Ok(raw) => CommandLine::parse(&raw).unwrap_or_else(|| {
            warn!(
                "Environment variable {} is empty, using default: {}",
                var_name,
                default.display()
            );
            default
        }),
        Err(_) => default,
    }
}

/// Comma separated list; blank entries are dropped
fn env_list(var_name: &str) -> Vec<String> {
    std::env::var(var_name)
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for var in [
            env_vars::SANDBOX_BASE_PATH,
            env_vars::SANDBOX_PORT_RANGE_START,
            env_vars::SANDBOX_PORT_RANGE_END,
            env_vars::SANDBOX_MAX_CONCURRENT_PER_ORG,
            env_vars::SANDBOX_PREVIEW_COMMAND,
            env_vars::SANDBOX_AGENT_COMMAND,
            env_vars::ACP_MESSAGE_TIMEOUT_SECS,
            env_vars::OPENCODE_DISABLED_TOOLS,
        ] {
            std::env::remove_var(var);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = SandboxConfig::from_env();
        assert_eq!(config.port_range_start, DEFAULT_PORT_RANGE_START);
        assert_eq!(config.port_range_end, DEFAULT_PORT_RANGE_END);
        assert_eq!(config.max_concurrent_per_tenant, DEFAULT_MAX_CONCURRENT_PER_TENANT);
        assert_eq!(config.agent_command, CommandLine::new("opencode", &["acp"]));
        assert!(config.prompt_timeout.is_none());
        assert!(config.disabled_tools.is_empty());
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var(env_vars::SANDBOX_BASE_PATH, "/srv/sandboxes");
        std::env::set_var(env_vars::SANDBOX_PORT_RANGE_START, "4100");
        std::env::set_var(env_vars::SANDBOX_PORT_RANGE_END, "4200");
        std::env::set_var(env_vars::SANDBOX_MAX_CONCURRENT_PER_ORG, "3");
        std::env::set_var(env_vars::ACP_MESSAGE_TIMEOUT_SECS, "90");
        std::env::set_var(env_vars::OPENCODE_DISABLED_TOOLS, "question, webfetch,,");

        let config = SandboxConfig::from_env();
        assert_eq!(config.base_path, PathBuf::from("/srv/sandboxes"));
        assert_eq!((config.port_range_start, config.port_range_end), (4100, 4200));
        assert_eq!(config.max_concurrent_per_tenant, 3);
        assert_eq!(config.prompt_timeout, Some(Duration::from_secs(90)));
        assert_eq!(config.disabled_tools, vec!["question", "webfetch"]);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_inverted_port_range_falls_back() {
        clear_env();
        std::env::set_var(env_vars::SANDBOX_PORT_RANGE_START, "5000");
        std::env::set_var(env_vars::SANDBOX_PORT_RANGE_END, "4000");
        let config = SandboxConfig::from_env();
        assert_eq!(config.port_range_start, DEFAULT_PORT_RANGE_START);
        assert_eq!(config.port_range_end, DEFAULT_PORT_RANGE_END);
        clear_env();
    }

    #[test]
    #[serial]
    fn test_unparseable_values_use_defaults() {
        clear_env();
        std::env::set_var(env_vars::SANDBOX_MAX_CONCURRENT_PER_ORG, "lots");
        std::env::set_var(env_vars::ACP_MESSAGE_TIMEOUT_SECS, "soon");
        std::env::set_var(env_vars::SANDBOX_AGENT_COMMAND, "   ");
        let config = SandboxConfig::from_env();
        assert_eq!(config.max_concurrent_per_tenant, DEFAULT_MAX_CONCURRENT_PER_TENANT);
        assert!(config.prompt_timeout.is_none());
        assert_eq!(config.agent_command.program, "opencode");
        clear_env();
    }

    #[test]
    fn test_command_line_port_substitution() {
        let cmd = CommandLine::parse("npm run dev -- -p {port}").unwrap();
        assert_eq!(cmd.program, "npm");
        assert_eq!(cmd.args_with_port(4100), vec!["run", "dev", "--", "-p", "4100"]);
        assert_eq!(cmd.display(), "npm run dev -- -p {port}");
        assert!(CommandLine::parse("").is_none());
    }
}
