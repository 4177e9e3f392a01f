// ABOUTME: Error types for sandboxed command execution and container lifecycle
// ABOUTME: Distinguishes expected operational failures from wrapped runtime and I/O errors

use crate::command::RejectReason;
use crate::providers::ProviderError;
use crate::workspace::WorkspaceError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Command rejected ({reason}): {command}")]
    CommandRejected {
        reason: RejectReason,
        command: String,
    },

    #[error("Command timed out after {timeout_secs}s: {command}")]
    CommandTimeout { command: String, timeout_secs: u64 },

    #[error("Command exited with code {exit_code}: {command}")]
    CommandFailed { command: String, exit_code: i32 },

    #[error("Command cancelled: {0}")]
    CommandCancelled(String),

    #[error("No two free ports left in range {start}-{end}")]
    PortExhausted { start: u16, end: u16 },

    #[error("Circuit breaker is open; container runtime calls are suspended")]
    CircuitOpen,

    #[error("Container failed to start for session {session_id}: {message}")]
    ContainerStartFailed { session_id: String, message: String },

    #[error("Service on port {port} did not become ready after {attempts} attempts")]
    ReadinessTimeout { port: u16, attempts: u32 },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Workspace error: {0}")]
    Workspace(#[from] WorkspaceError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SandboxError>;
