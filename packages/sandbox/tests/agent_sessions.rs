// ABOUTME: Integration tests for agent messaging through the manager
// ABOUTME: Drives the shell mock agent to check ordering, self-healing, serialization and cancel

mod common;

use common::{llm, mock_agent, setup_with, TestEnv};
use futures::StreamExt;
use pretty_assertions::assert_eq;
use sandbox_runtime::{AcpEvent, SandboxError};
use serial_test::serial;

const PROMPT_KINDS: [&str; 5] = [
    "agent_thought_chunk",
    "agent_message_chunk",
    "tool_call_start",
    "tool_call_progress",
    "prompt_response",
];

async fn session_env(agent_args: &[&str]) -> TestEnv {
    let command = mock_agent(agent_args);
    let env = setup_with(move |c| c.with_agent_command(command)).await;
    env.provision("sb1").await;
    env.manager
        .setup_session_workspace("sb1", "s1", &llm(), None, None)
        .await
        .unwrap();
    env
}

async fn send(env: &TestEnv, text: &str) -> Vec<AcpEvent> {
    env.manager
        .send_message("sb1", "s1", text)
        .await
        .unwrap()
        .collect()
        .await
}

fn kinds(events: &[AcpEvent]) -> Vec<&'static str> {
    events.iter().map(AcpEvent::kind).collect()
}

fn message_text(events: &[AcpEvent]) -> Option<String> {
    events.iter().find_map(|e| match e {
        AcpEvent::AgentMessageChunk { update } => {
            update["content"]["text"].as_str().map(str::to_string)
        }
        _ => None,
    })
}

/// Read up to and including the terminal event, then drop the stream
async fn send_until_terminal(env: &TestEnv, text: &str) -> Vec<AcpEvent> {
    let mut stream = Box::pin(env.manager.send_message("sb1", "s1", text).await.unwrap());
    let mut events = Vec::new();
    while let Some(event) = stream.next().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

#[tokio::test]
#[serial]
async fn test_agent_is_reused_when_reading_stops_at_terminal_event() {
    let env = session_env(&["normal"]).await;

    let first = send_until_terminal(&env, "one").await;
    assert_eq!(message_text(&first).as_deref(), Some("echo: one #1"));

    // Same subprocess: its prompt counter keeps going
    let second = send_until_terminal(&env, "two").await;
    assert_eq!(message_text(&second).as_deref(), Some("echo: two #2"));
    assert_eq!(kinds(&second), PROMPT_KINDS.to_vec());
    assert_eq!(env.manager.agent_count().await, 1);

    env.manager.terminate("sb1").await;
}

#[tokio::test]
#[serial]
async fn test_sequential_messages_keep_protocol_order() {
    let env = session_env(&["normal"]).await;
    let before = env.manager.get_sandbox_info("sb1").await.unwrap().unwrap();

    let first = send(&env, "hello").await;
    let second = send(&env, "hello").await;

    assert_eq!(kinds(&first), PROMPT_KINDS);
    assert_eq!(kinds(&second), PROMPT_KINDS);
    assert_eq!(message_text(&first).as_deref(), Some("echo: hello #1"));
    // Same subprocess served both prompts
    assert_eq!(message_text(&second).as_deref(), Some("echo: hello #2"));
    assert_eq!(env.manager.agent_count().await, 1);

    let after = env.manager.get_sandbox_info("sb1").await.unwrap().unwrap();
    assert!(after.last_heartbeat > before.last_heartbeat);

    env.manager.terminate("sb1").await;
    assert_eq!(env.manager.agent_count().await, 0);
}

#[tokio::test]
#[serial]
async fn test_crashed_agent_is_replaced_on_next_message() {
    // crash_once crashes only while the marker file is absent
    let marker_dir = tempfile::TempDir::new().unwrap();
    let marker_path = marker_dir.path().join("crashed").to_string_lossy().into_owned();

    let env = session_env(&["crash_once", marker_path.as_str()]).await;

    let crashed = send(&env, "hello").await;
    assert_eq!(crashed.first().map(AcpEvent::kind), Some("agent_message_chunk"));
    assert!(matches!(
        crashed.last(),
        Some(AcpEvent::Error { code: -32000, .. })
    ));

    let healed = send(&env, "hello again").await;
    assert_eq!(kinds(&healed), PROMPT_KINDS);
    assert_eq!(message_text(&healed).as_deref(), Some("echo: hello again #1"));
    assert_eq!(env.manager.agent_count().await, 1);

    env.manager.terminate("sb1").await;
}

#[tokio::test]
#[serial]
async fn test_concurrent_messages_for_one_session_are_serialized() {
    let env = session_env(&["normal"]).await;

    let tasks: Vec<_> = ["first", "second"]
        .into_iter()
        .map(|text| {
            let manager = env.manager.clone();
            tokio::spawn(async move {
                let events: Vec<AcpEvent> = manager
                    .send_message("sb1", "s1", text)
                    .await
                    .unwrap()
                    .collect()
                    .await;
                events
            })
        })
        .collect();

    let mut counters = Vec::new();
    for task in tasks {
        let events = task.await.unwrap();
        assert_eq!(kinds(&events), PROMPT_KINDS);
        let text = message_text(&events).unwrap();
        counters.push(text.rsplit('#').next().unwrap().to_string());
    }
    counters.sort();
    assert_eq!(counters, vec!["1", "2"]);

    env.manager.terminate("sb1").await;
}

#[tokio::test]
#[serial]
async fn test_cancel_agent_ends_prompt() {
    let env = session_env(&["cancellable"]).await;

    let mut stream = Box::pin(env.manager.send_message("sb1", "s1", "long job").await.unwrap());
    let first = stream.next().await.unwrap();
    assert_eq!(first.kind(), "agent_message_chunk");

    env.manager.cancel_agent("sb1", "s1").await.unwrap();
    let rest: Vec<_> = stream.collect().await;
    assert_eq!(
        rest.last(),
        Some(&AcpEvent::PromptResponse {
            stop_reason: "cancelled".to_string()
        })
    );

    env.manager.terminate("sb1").await;
}

#[tokio::test]
#[serial]
async fn test_cleanup_session_stops_its_agent() {
    let env = session_env(&["normal"]).await;
    send(&env, "hello").await;
    assert_eq!(env.manager.agent_count().await, 1);

    env.manager.cleanup_session_workspace("sb1", "s1").await.unwrap();
    assert_eq!(env.manager.agent_count().await, 0);

    let err = env.manager.send_message("sb1", "s1", "hello").await.err().unwrap();
    assert!(matches!(err, SandboxError::NotFound(_)));

    env.manager.terminate("sb1").await;
}

#[tokio::test]
#[serial]
async fn test_messages_require_running_sandbox() {
    let env = session_env(&["normal"]).await;
    env.manager.terminate("sb1").await;

    let err = env.manager.send_message("sb1", "s1", "hello").await.err().unwrap();
    assert!(matches!(err, SandboxError::SandboxNotRunning { .. }));
}
