// ABOUTME: Agent Client Protocol bridge between the manager and agent subprocesses
// ABOUTME: Wire types and event mapping live in protocol, subprocess lifecycle in client

pub mod client;
pub mod protocol;

pub use client::{AgentClient, AgentState};
pub use protocol::{AcpEvent, SessionUpdateKind};
