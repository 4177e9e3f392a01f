// ABOUTME: Error types for the generation pipeline
// ABOUTME: Stage failures, run exclusivity and wrapped storage, sandbox and model errors

use sandcastle_ai::AIServiceError;
use sandcastle_sandbox::SandboxError;
use sandcastle_storage::{SessionStatus, StorageError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Stage '{stage}' failed: {message}")]
    CapabilityFailure { stage: String, message: String },

    #[error("Session {0} already has an active run")]
    SessionBusy(String),

    #[error("Session {session_id} already ended as {status}; start a new session instead")]
    SessionTerminal {
        session_id: String,
        status: SessionStatus,
    },

    #[error("Session not found: {0}")]
    SessionNotFound(String),

    #[error("Unknown template: {0}")]
    UnknownTemplate(String),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Model error: {0}")]
    Model(#[from] AIServiceError),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
