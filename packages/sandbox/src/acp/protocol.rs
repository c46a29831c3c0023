// ABOUTME: JSON-RPC framing and the closed event vocabulary of the Agent Client Protocol
// ABOUTME: Classifies incoming frames and maps session/update kinds to typed events without reading their content

use crate::error::{Result, SandboxError};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

pub const JSONRPC_VERSION: &str = "2.0";
pub const PROTOCOL_VERSION: u32 = 1;

pub mod methods {
    pub const INITIALIZE: &str = "initialize";
    pub const SESSION_NEW: &str = "session/new";
    pub const SESSION_LIST: &str = "session/list";
    pub const SESSION_RESUME: &str = "session/resume";
    pub const SESSION_PROMPT: &str = "session/prompt";
    pub const SESSION_CANCEL: &str = "session/cancel";
    pub const SESSION_UPDATE: &str = "session/update";
}

pub mod error_codes {
    /// Sent back for agent-initiated requests the client does not serve
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INTERNAL_ERROR: i64 = -32603;
    /// Synthesized when the subprocess exits before answering a prompt
    pub const SUBPROCESS_EXITED: i64 = -32000;
    pub const TIMEOUT: i64 = -1;
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcRequest<'a> {
    pub fn new(id: u64, method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification<'a> {
    pub jsonrpc: &'static str,
    pub method: &'a str,
    pub params: Value,
}

impl<'a> JsonRpcNotification<'a> {
    pub fn new(method: &'a str, params: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            method,
            params,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcErrorResponse {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub error: JsonRpcError,
}

impl JsonRpcErrorResponse {
    pub fn method_not_supported(id: Value, method: &str) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            error: JsonRpcError {
                code: error_codes::METHOD_NOT_FOUND,
                message: format!("Method not supported: {}", method),
                data: None,
            },
        }
    }
}

/// One frame read from the agent's stdout
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    /// Answer to one of our requests
    Response {
        id: Value,
        outcome: std::result::Result<Value, JsonRpcError>,
    },
    Notification { method: String, params: Value },
    /// Agent-initiated request expecting an answer
    Request {
        id: Value,
        method: String,
        params: Value,
    },
}

#[derive(Deserialize)]
struct RawMessage {
    id: Option<Value>,
    method: Option<String>,
    #[serde(default)]
    params: Value,
    result: Option<Value>,
    error: Option<JsonRpcError>,
}

impl IncomingMessage {
    pub fn parse(line: &str) -> Result<Self> {
        let raw: RawMessage = serde_json::from_str(line)
            .map_err(|e| SandboxError::AgentProtocol(format!("invalid JSON-RPC frame: {}", e)))?;

        match (raw.id, raw.method) {
            (Some(id), Some(method)) => Ok(Self::Request {
                id,
                method,
                params: raw.params,
            }),
            (None, Some(method)) => Ok(Self::Notification {
                method,
                params: raw.params,
            }),
            (Some(id), None) => {
                let outcome = match raw.error {
                    Some(error) => Err(error),
                    None => Ok(raw.result.unwrap_or(Value::Null)),
                };
                Ok(Self::Response { id, outcome })
            }
            (None, None) => Err(SandboxError::AgentProtocol(
                "frame has neither id nor method".to_string(),
            )),
        }
    }

    /// True when this is the response to request `request_id`
    pub fn answers(&self, request_id: u64) -> bool {
        match self {
            Self::Response { id, .. } => id_matches(id, request_id),
            _ => false,
        }
    }

    /// Short description for logs
    pub fn describe(&self) -> String {
        match self {
            Self::Response { id, .. } => format!("response id={}", id),
            Self::Request { id, method, .. } => format!("request id={} method={}", id, method),
            Self::Notification { method, params } => match update_kind(params) {
                Some(kind) => format!("notification {} ({})", method, kind),
                None => format!("notification {}", method),
            },
        }
    }
}

/// Some agents echo numeric ids back as strings
pub fn id_matches(id: &Value, request_id: u64) -> bool {
    id.as_u64() == Some(request_id) || id.as_str().and_then(|s| s.parse().ok()) == Some(request_id)
}

fn update_kind(params: &Value) -> Option<&str> {
    params.get("update")?.get("sessionUpdate")?.as_str()
}

/// Typed events streamed back from `send_message`.
///
/// Payloads are passed through untouched; the bridge only decides the kind.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AcpEvent {
    AgentMessageChunk { update: Value },
    AgentThoughtChunk { update: Value },
    ToolCallStart { update: Value },
    ToolCallProgress { update: Value },
    PlanUpdate { update: Value },
    ModeChange { update: Value },
    /// Terminal: the prompt finished
    PromptResponse { stop_reason: String },
    /// Terminal: the prompt failed
    Error { code: i64, message: String },
}

impl AcpEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::PromptResponse { .. } | Self::Error { .. })
    }

    pub fn error(code: i64, message: impl Into<String>) -> Self {
        Self::Error {
            code,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::AgentMessageChunk { .. } => "agent_message_chunk",
            Self::AgentThoughtChunk { .. } => "agent_thought_chunk",
            Self::ToolCallStart { .. } => "tool_call_start",
            Self::ToolCallProgress { .. } => "tool_call_progress",
            Self::PlanUpdate { .. } => "plan_update",
            Self::ModeChange { .. } => "mode_change",
            Self::PromptResponse { .. } => "prompt_response",
            Self::Error { .. } => "error",
        }
    }
}

/// Every `sessionUpdate` discriminator the protocol defines
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdateKind {
    AgentMessageChunk,
    AgentThoughtChunk,
    UserMessageChunk,
    ToolCall,
    ToolCallUpdate,
    Plan,
    CurrentModeUpdate,
    PromptResponse,
    AvailableCommandsUpdate,
    SessionInfoUpdate,
    Unknown(String),
}

impl SessionUpdateKind {
    pub fn parse(kind: &str) -> Self {
        match kind {
            "agent_message_chunk" => Self::AgentMessageChunk,
            "agent_thought_chunk" => Self::AgentThoughtChunk,
            "user_message_chunk" => Self::UserMessageChunk,
            "tool_call" => Self::ToolCall,
            "tool_call_update" => Self::ToolCallUpdate,
            "plan" => Self::Plan,
            "current_mode_update" => Self::CurrentModeUpdate,
            "prompt_response" => Self::PromptResponse,
            "available_commands_update" => Self::AvailableCommandsUpdate,
            "session_info_update" => Self::SessionInfoUpdate,
            other => Self::Unknown(other.to_string()),
        }
    }
}

/// Map a `session/update` payload to an event. `Ok(None)` means the kind is
/// deliberately not forwarded.
pub fn event_from_update(update: Value) -> Result<Option<AcpEvent>> {
    let kind = update
        .get("sessionUpdate")
        .and_then(Value::as_str)
        .map(SessionUpdateKind::parse)
        .ok_or_else(|| {
            SandboxError::AgentProtocol("session/update without sessionUpdate".to_string())
        })?;

    let event = match kind {
        SessionUpdateKind::AgentMessageChunk => AcpEvent::AgentMessageChunk { update },
        SessionUpdateKind::AgentThoughtChunk => AcpEvent::AgentThoughtChunk { update },
        SessionUpdateKind::ToolCall => AcpEvent::ToolCallStart { update },
        SessionUpdateKind::ToolCallUpdate => AcpEvent::ToolCallProgress { update },
        SessionUpdateKind::Plan => AcpEvent::PlanUpdate { update },
        SessionUpdateKind::CurrentModeUpdate => AcpEvent::ModeChange { update },
        SessionUpdateKind::PromptResponse => prompt_response_event(&update)?,
        SessionUpdateKind::UserMessageChunk
        | SessionUpdateKind::AvailableCommandsUpdate
        | SessionUpdateKind::SessionInfoUpdate => {
            debug!("Skipping session update {:?}", kind);
            return Ok(None);
        }
        SessionUpdateKind::Unknown(name) => {
            warn!("Unknown session update kind '{}', skipping", name);
            return Ok(None);
        }
    };
    Ok(Some(event))
}

/// Completion event from a prompt result. A result without `stopReason`
/// violates the protocol.
pub fn prompt_response_event(result: &Value) -> Result<AcpEvent> {
    result
        .get("stopReason")
        .and_then(Value::as_str)
        .map(|reason| AcpEvent::PromptResponse {
            stop_reason: reason.to_string(),
        })
        .ok_or_else(|| SandboxError::AgentProtocol(format!("prompt result without stopReason: {}", result)))
}

// ========================================================================
// REQUEST PARAMETERS
// ========================================================================

pub fn initialize_params() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "clientCapabilities": {
            "fs": { "readTextFile": true, "writeTextFile": true },
            "terminal": true,
        },
        "clientInfo": {
            "name": env!("CARGO_PKG_NAME"),
            "title": "Sandbox Runtime",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

pub fn new_session_params(cwd: &str) -> Value {
    json!({ "cwd": cwd, "mcpServers": [] })
}

pub fn list_sessions_params(cwd: &str) -> Value {
    json!({ "cwd": cwd })
}

pub fn resume_session_params(session_id: &str, cwd: &str) -> Value {
    json!({ "sessionId": session_id, "cwd": cwd, "mcpServers": [] })
}

pub fn prompt_params(session_id: &str, text: &str) -> Value {
    json!({
        "sessionId": session_id,
        "prompt": [{ "type": "text", "text": text }],
    })
}

pub fn cancel_params(session_id: &str) -> Value {
    json!({ "sessionId": session_id })
}

/// Whether the agent advertised both `session/list` and `session/resume`
pub fn supports_resume(agent_capabilities: &Value) -> bool {
    let caps = &agent_capabilities["sessionCapabilities"];
    !caps["list"].is_null() && !caps["resume"].is_null()
}
