// ABOUTME: Builds the per-session agent configuration (opencode.json) and renders AGENTS.md
// ABOUTME: The generated JSON embeds provider credentials and must never be logged

use crate::types::{LlmProviderConfig, UserProfile};
use serde_json::{json, Map, Value};

pub const OPENCODE_SCHEMA_URL: &str = "https://opencode.ai/config.json";

const THINKING_BUDGET_TOKENS: u32 = 16000;

/// Shell commands the agent may never run
const DENIED_BASH_COMMANDS: &[&str] = &[
    "rm", "curl", "wget", "ssh", "scp", "sftp", "ftp", "telnet", "nc", "netcat",
];

const ALLOWED_TOOLS: &[&str] = &[
    "edit", "write", "read", "grep", "glob", "list", "lsp", "patch", "skill", "question",
    "webfetch",
];

/// Provider specific reasoning options, empty for providers without any
fn reasoning_options(provider: &str) -> Map<String, Value> {
    let mut options = Map::new();
    match provider {
        "openai" | "azure" => {
            options.insert("reasoningEffort".to_string(), json!("high"));
        }
        "anthropic" | "bedrock" => {
            options.insert(
                "thinking".to_string(),
                json!({ "type": "enabled", "budgetTokens": THINKING_BUDGET_TOKENS }),
            );
        }
        "google" => {
            options.insert("thinking_budget".to_string(), json!(THINKING_BUDGET_TOKENS));
            options.insert("thinking_level".to_string(), json!("high"));
        }
        _ => {}
    }
    options
}

/// Build the opencode.json document for one session
pub fn build_opencode_config(llm: &LlmProviderConfig, disabled_tools: &[String]) -> Value {
    let mut provider_config = Map::new();

    if let Some(api_key) = llm.api_key.as_deref().filter(|k| !k.is_empty()) {
        provider_config.insert("options".to_string(), json!({ "apiKey": api_key }));
    }
    if let Some(api_base) = llm.api_base.as_deref().filter(|b| !b.is_empty()) {
        provider_config.insert("api".to_string(), json!(api_base));
    }

    let options = reasoning_options(&llm.provider);
    if !options.is_empty() {
        provider_config.insert(
            "models".to_string(),
            json!({ llm.model_name.clone(): { "options": options } }),
        );
    }

    let bash: Map<String, Value> = DENIED_BASH_COMMANDS
        .iter()
        .map(|cmd| (cmd.to_string(), json!("deny")))
        .collect();

    let mut permission = Map::new();
    permission.insert("bash".to_string(), Value::Object(bash));
    for tool in ALLOWED_TOOLS {
        permission.insert(tool.to_string(), json!("allow"));
    }
    for tool in disabled_tools {
        permission.insert(tool.clone(), json!("deny"));
    }

    json!({
        "$schema": OPENCODE_SCHEMA_URL,
        "model": format!("{}/{}", llm.provider, llm.model_name),
        "provider": { llm.provider.clone(): provider_config },
        "permission": permission,
    })
}

/// Values substituted into the AGENTS.md template
#[derive(Debug, Clone, Default)]
pub struct InstructionValues<'a> {
    pub provider: Option<&'a str>,
    pub model_name: Option<&'a str>,
    pub preview_port: Option<u16>,
    pub disabled_tools: &'a [String],
    pub profile: Option<&'a UserProfile>,
}

/// Replace `{{PLACEHOLDER}}` markers in the instructions template.
/// Unknown values render as "unknown" so the agent never sees a raw marker.
pub fn render_agent_instructions(template: &str, values: &InstructionValues<'_>) -> String {
    let disabled = if values.disabled_tools.is_empty() {
        "none".to_string()
    } else {
        values.disabled_tools.join(", ")
    };
    let port = values
        .preview_port
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let user_name = values
        .profile
        .and_then(|p| p.name.as_deref())
        .unwrap_or("the user");
    let user_role = values
        .profile
        .and_then(|p| p.role.as_deref())
        .unwrap_or("unknown");

    template
        .replace("{{PROVIDER}}", values.provider.unwrap_or("unknown"))
        .replace("{{MODEL_NAME}}", values.model_name.unwrap_or("unknown"))
        .replace("{{NEXTJS_PORT}}", &port)
        .replace("{{DISABLED_TOOLS}}", &disabled)
        .replace("{{USER_NAME}}", user_name)
        .replace("{{USER_ROLE}}", user_role)
}
