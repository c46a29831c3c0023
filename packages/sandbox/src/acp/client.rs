// ABOUTME: Agent subprocess bridge speaking ACP over stdin/stdout
// ABOUTME: Lazily starts and handshakes the agent, then streams typed events for each prompt

use super::protocol::{
    self, error_codes, methods, AcpEvent, IncomingMessage, JsonRpcErrorResponse,
    JsonRpcNotification, JsonRpcRequest,
};
use crate::config::CommandLine;
use crate::error::{Result, SandboxError};
use async_stream::stream;
use futures::Stream;
use serde::Serialize;
use serde_json::Value;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

/// Lifecycle of one agent subprocess. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentState {
    NotStarted,
    Ready,
    Streaming,
    Stopped,
}

/// What the stdout reader hands to the client
#[derive(Debug)]
enum Frame {
    Message(IncomingMessage),
    Malformed(String),
}

/// How a prompt stream ended
enum PromptEnd {
    /// The agent can take another prompt
    Finished,
    /// Subprocess gone or misbehaving, tear it down
    Teardown,
}

/// One agent subprocess bound to a session directory.
///
/// Cheap to clone; clones share the same subprocess. The child is killed
/// once the last clone is dropped.
#[derive(Clone)]
pub struct AgentClient {
    command: CommandLine,
    cwd: PathBuf,
    handshake_timeout: Duration,
    prompt_timeout: Option<Duration>,
    process: Arc<Mutex<Option<Child>>>,
    stdin: Arc<Mutex<Option<ChildStdin>>>,
    incoming: Arc<Mutex<Option<mpsc::UnboundedReceiver<Frame>>>>,
    state: Arc<Mutex<AgentState>>,
    session_id: Arc<Mutex<Option<String>>>,
    agent_capabilities: Arc<Mutex<Value>>,
    next_id: Arc<AtomicU64>,
}

impl AgentClient {
    pub fn new(command: CommandLine, cwd: impl Into<PathBuf>) -> Self {
        Self {
            command,
            cwd: cwd.into(),
            handshake_timeout: Duration::from_secs(30),
            prompt_timeout: None,
            process: Arc::new(Mutex::new(None)),
            stdin: Arc::new(Mutex::new(None)),
            incoming: Arc::new(Mutex::new(None)),
            state: Arc::new(Mutex::new(AgentState::NotStarted)),
            session_id: Arc::new(Mutex::new(None)),
            agent_capabilities: Arc::new(Mutex::new(Value::Null)),
            next_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_prompt_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.prompt_timeout = timeout;
        self
    }

    pub async fn state(&self) -> AgentState {
        *self.state.lock().await
    }

    /// ACP session id assigned by the agent during the handshake
    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    pub async fn agent_capabilities(&self) -> Value {
        self.agent_capabilities.lock().await.clone()
    }

    /// Whether the next `send_message` can run on this client. A subprocess
    /// that has exited, or a stream abandoned mid-prompt, makes it unusable.
    pub async fn is_usable(&self) -> bool {
        let mut state = self.state.lock().await;
        let exited = match self.process.lock().await.as_mut() {
            Some(child) => !matches!(child.try_wait(), Ok(None)),
            None => false,
        };
        if exited && *state != AgentState::Stopped {
            info!("Agent subprocess in {} has exited", self.cwd.display());
            *state = AgentState::Stopped;
        }
        matches!(*state, AgentState::NotStarted | AgentState::Ready)
    }

    /// Start the subprocess and run the ACP handshake if not done yet
    pub async fn ensure_started(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            AgentState::Ready => return Ok(()),
            AgentState::Streaming => {
                return Err(SandboxError::AgentProtocol(
                    "a prompt is already streaming on this client".to_string(),
                ))
            }
            AgentState::Stopped => {
                return Err(SandboxError::SubprocessExited(
                    "client has been stopped".to_string(),
                ))
            }
            AgentState::NotStarted => {}
        }

        if let Err(e) = self.spawn().await {
            *state = AgentState::Stopped;
            return Err(e);
        }

        let outcome = match tokio::time::timeout(self.handshake_timeout, self.handshake()).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::AgentProtocol(format!(
                "Timed out after {:?} waiting for agent handshake",
                self.handshake_timeout
            ))),
        };

        match outcome {
            Ok(()) => {
                *state = AgentState::Ready;
                Ok(())
            }
            Err(e) => {
                error!("Agent handshake failed in {}: {}", self.cwd.display(), e);
                self.kill_process().await;
                *state = AgentState::Stopped;
                Err(e)
            }
        }
    }

    /// Send `text` as a prompt and stream the resulting events.
    ///
    /// Nothing happens until the stream is polled. The stream always ends with
    /// exactly one terminal event (`PromptResponse` or `Error`).
    pub fn send_message(&self, text: impl Into<String>) -> impl Stream<Item = AcpEvent> + Send + 'static {
        let client = self.clone();
        let text = text.into();

        stream! {
            if let Err(e) = client.ensure_started().await {
                yield AcpEvent::error(error_code(&e), e.to_string());
                return;
            }

            let request_id = match client.begin_prompt(&text).await {
                Ok(id) => id,
                Err(e) => {
                    error!("Failed to send prompt: {}", e);
                    client.stop().await;
                    yield AcpEvent::error(error_code(&e), e.to_string());
                    return;
                }
            };

            // Non-terminal events are yielded as they arrive; the terminal one
            // is held back until the client state reflects how the prompt ended.
            let mut incoming = client.incoming.lock().await;
            let (terminal, end) = match incoming.as_mut() {
                None => (
                    AcpEvent::error(error_codes::SUBPROCESS_EXITED, "Agent subprocess is not running"),
                    PromptEnd::Teardown,
                ),
                Some(rx) => {
                    let deadline = client.prompt_timeout.map(|t| Instant::now() + t);
                    loop {
                        let frame = match deadline {
                            Some(deadline) => match tokio::time::timeout_at(deadline, rx.recv()).await {
                                Ok(frame) => frame,
                                Err(_) => {
                                    warn!("Prompt {} timed out", request_id);
                                    break (
                                        AcpEvent::error(error_codes::TIMEOUT, "Timeout waiting for response"),
                                        PromptEnd::Finished,
                                    );
                                }
                            },
                            None => rx.recv().await,
                        };

                        let message = match frame {
                            Some(Frame::Message(message)) => message,
                            Some(Frame::Malformed(reason)) => {
                                break (AcpEvent::error(error_codes::INTERNAL_ERROR, reason), PromptEnd::Teardown);
                            }
                            None => {
                                warn!("Agent subprocess exited before answering prompt {}", request_id);
                                break (
                                    AcpEvent::error(
                                        error_codes::SUBPROCESS_EXITED,
                                        "Agent subprocess exited before the prompt completed",
                                    ),
                                    PromptEnd::Teardown,
                                );
                            }
                        };

                        match message {
                            IncomingMessage::Response { id, outcome } if protocol::id_matches(&id, request_id) => {
                                break match outcome {
                                    Ok(result) => match protocol::prompt_response_event(&result) {
                                        Ok(event) => (event, PromptEnd::Finished),
                                        Err(e) => (
                                            AcpEvent::error(error_codes::INTERNAL_ERROR, e.to_string()),
                                            PromptEnd::Teardown,
                                        ),
                                    },
                                    Err(rpc_error) => (
                                        AcpEvent::Error { code: rpc_error.code, message: rpc_error.message },
                                        PromptEnd::Finished,
                                    ),
                                };
                            }
                            IncomingMessage::Notification { method, mut params } if method == methods::SESSION_UPDATE => {
                                let update = params.get_mut("update").map(Value::take).unwrap_or(Value::Null);
                                match protocol::event_from_update(update) {
                                    Ok(Some(event)) if event.is_terminal() => break (event, PromptEnd::Finished),
                                    Ok(Some(event)) => {
                                        yield event;
                                    }
                                    Ok(None) => {}
                                    Err(e) => {
                                        break (
                                            AcpEvent::error(error_codes::INTERNAL_ERROR, e.to_string()),
                                            PromptEnd::Teardown,
                                        );
                                    }
                                }
                            }
                            IncomingMessage::Request { id, method, .. } => {
                                info!("Rejecting agent request '{}'", method);
                                if let Err(e) = client.write_frame(&JsonRpcErrorResponse::method_not_supported(id, &method)).await {
                                    warn!("Failed to answer agent request '{}': {}", method, e);
                                }
                            }
                            other => debug!("Ignoring {} during prompt {}", other.describe(), request_id),
                        }
                    }
                }
            };
            drop(incoming);

            match end {
                PromptEnd::Finished => client.finish_prompt().await,
                PromptEnd::Teardown => client.stop().await,
            }
            yield terminal;
        }
    }

    /// Ask the agent to abort the running prompt. The stream still ends with
    /// its own terminal event and must be drained.
    pub async fn cancel(&self) -> Result<()> {
        let Some(session_id) = self.session_id().await else {
            debug!("No ACP session to cancel");
            return Ok(());
        };
        info!("Cancelling ACP session {}", session_id);
        self.write_frame(&JsonRpcNotification::new(
            methods::SESSION_CANCEL,
            protocol::cancel_params(&session_id),
        ))
        .await
    }

    /// Terminate the subprocess. Safe to call repeatedly.
    pub async fn stop(&self) {
        let mut state = self.state.lock().await;
        self.kill_process().await;
        if *state != AgentState::Stopped {
            info!("Stopped agent in {}", self.cwd.display());
        }
        *state = AgentState::Stopped;
    }

    // ========================================================================
    // SUBPROCESS PLUMBING
    // ========================================================================

    async fn spawn(&self) -> Result<()> {
        let mut command = self.command.clone();
        command.args.push("--cwd".to_string());
        command.args.push(self.cwd.to_string_lossy().into_owned());

        let command_str = command.display();
        let mut child = Command::new(&command.program)
            .args(&command.args)
            .current_dir(&self.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SandboxError::StartupFailed {
                command: command_str.clone(),
                reason: e.to_string(),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| SandboxError::StartupFailed {
            command: command_str.clone(),
            reason: "Failed to capture stdin".to_string(),
        })?;
        let stdout = child.stdout.take().ok_or_else(|| SandboxError::StartupFailed {
            command: command_str.clone(),
            reason: "Failed to capture stdout".to_string(),
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[agent stderr] {}", line);
                }
            });
        }

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(read_frames(stdout, tx));

        info!("Started agent '{}' with PID {:?}", command_str, child.id());
        *self.stdin.lock().await = Some(stdin);
        *self.incoming.lock().await = Some(rx);
        *self.process.lock().await = Some(child);
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let cwd = self.cwd.to_string_lossy().into_owned();

        let init = self
            .request(methods::INITIALIZE, protocol::initialize_params())
            .await?;
        let capabilities = init.get("agentCapabilities").cloned().unwrap_or(Value::Null);
        *self.agent_capabilities.lock().await = capabilities.clone();

        let session_id = match self.try_resume_session(&cwd, &capabilities).await {
            Some(id) => id,
            None => {
                let result = self
                    .request(methods::SESSION_NEW, protocol::new_session_params(&cwd))
                    .await?;
                result
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .ok_or_else(|| {
                        SandboxError::AgentProtocol("No session ID returned from session/new".to_string())
                    })?
            }
        };

        info!("ACP session {} ready in {}", session_id, cwd);
        *self.session_id.lock().await = Some(session_id);
        Ok(())
    }

    /// Resume the most recent session for this directory when the agent
    /// supports it. Any failure falls back to a new session.
    async fn try_resume_session(&self, cwd: &str, capabilities: &Value) -> Option<String> {
        if !protocol::supports_resume(capabilities) {
            return None;
        }

        let listed = match self
            .request(methods::SESSION_LIST, protocol::list_sessions_params(cwd))
            .await
        {
            Ok(result) => result,
            Err(e) => {
                debug!("session/list failed, creating a new session: {}", e);
                return None;
            }
        };
        let target = listed["sessions"][0]["sessionId"].as_str()?.to_string();

        match self
            .request(methods::SESSION_RESUME, protocol::resume_session_params(&target, cwd))
            .await
        {
            Ok(result) => {
                let resumed = result
                    .get("sessionId")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or(target);
                info!("Resumed ACP session {}", resumed);
                Some(resumed)
            }
            Err(e) => {
                warn!("session/resume failed for {}, falling back to session/new: {}", target, e);
                None
            }
        }
    }

    /// Send a request and wait for its response, answering agent requests
    /// that arrive in between
    async fn request(&self, method: &str, params: Value) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write_frame(&JsonRpcRequest::new(id, method, params)).await?;

        let mut incoming = self.incoming.lock().await;
        let rx = incoming
            .as_mut()
            .ok_or_else(|| SandboxError::SubprocessExited("agent is not running".to_string()))?;

        loop {
            match rx.recv().await {
                None => {
                    return Err(SandboxError::SubprocessExited(format!(
                        "agent exited while waiting for {}",
                        method
                    )))
                }
                Some(Frame::Malformed(reason)) => return Err(SandboxError::AgentProtocol(reason)),
                Some(Frame::Message(IncomingMessage::Response { id: rid, outcome }))
                    if protocol::id_matches(&rid, id) =>
                {
                    return outcome.map_err(|e| {
                        SandboxError::AgentProtocol(format!(
                            "{} failed with ACP error {}: {}",
                            method, e.code, e.message
                        ))
                    });
                }
                Some(Frame::Message(IncomingMessage::Request { id: rid, method: m, .. })) => {
                    self.write_frame(&JsonRpcErrorResponse::method_not_supported(rid, &m))
                        .await?;
                }
                Some(Frame::Message(other)) => {
                    debug!("Ignoring {} while waiting for {}", other.describe(), method)
                }
            }
        }
    }

    async fn begin_prompt(&self, text: &str) -> Result<u64> {
        *self.state.lock().await = AgentState::Streaming;

        if let Some(rx) = self.incoming.lock().await.as_mut() {
            let mut drained = 0;
            while let Ok(frame) = rx.try_recv() {
                drained += 1;
                debug!("Drained stale frame before prompt: {:?}", frame);
            }
            if drained > 0 {
                info!("Drained {} stale frames before prompt", drained);
            }
        }

        let session_id = self
            .session_id()
            .await
            .ok_or_else(|| SandboxError::AgentProtocol("no active ACP session".to_string()))?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.write_frame(&JsonRpcRequest::new(
            id,
            methods::SESSION_PROMPT,
            protocol::prompt_params(&session_id, text),
        ))
        .await?;
        debug!("Sent prompt request {} on session {}", id, session_id);
        Ok(id)
    }

    async fn finish_prompt(&self) {
        let mut state = self.state.lock().await;
        if *state == AgentState::Streaming {
            *state = AgentState::Ready;
        }
    }

    /// Write one JSON line to the agent's stdin
    async fn write_frame<T: Serialize>(&self, frame: &T) -> Result<()> {
        let mut line = serde_json::to_string(frame)?;
        line.push('\n');

        let mut stdin = self.stdin.lock().await;
        let stdin = stdin
            .as_mut()
            .ok_or_else(|| SandboxError::SubprocessExited("agent stdin is closed".to_string()))?;
        stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| SandboxError::SubprocessExited(e.to_string()))?;
        stdin
            .flush()
            .await
            .map_err(|e| SandboxError::SubprocessExited(e.to_string()))?;
        Ok(())
    }

    async fn kill_process(&self) {
        *self.stdin.lock().await = None;

        let Some(mut child) = self.process.lock().await.take() else {
            return;
        };
        if let Err(e) = child.start_kill() {
            debug!("Agent process already gone: {}", e);
        }
        match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
            Ok(Ok(status)) => debug!("Agent process exited with {}", status),
            Ok(Err(e)) => warn!("Failed to wait for agent process: {}", e),
            Err(_) => warn!("Agent process did not exit within 5s of SIGKILL"),
        }
    }
}

fn error_code(err: &SandboxError) -> i64 {
    match err {
        SandboxError::SubprocessExited(_) | SandboxError::StartupFailed { .. } => {
            error_codes::SUBPROCESS_EXITED
        }
        _ => error_codes::INTERNAL_ERROR,
    }
}

/// Parse stdout lines into frames until the agent closes its end
async fn read_frames(stdout: ChildStdout, tx: mpsc::UnboundedSender<Frame>) {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                let frame = match IncomingMessage::parse(&line) {
                    Ok(message) => Frame::Message(message),
                    Err(e) => {
                        error!("Failed to parse agent frame: {} - Line: {}", e, line);
                        Frame::Malformed(e.to_string())
                    }
                };
                if tx.send(frame).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!("Failed to read from agent stdout: {}", e);
                break;
            }
        }
    }

    debug!("Agent stdout reader ended");
}
