// ABOUTME: Persistence collaborator for sessions, timeline messages and generated files
// ABOUTME: Defines the storage trait, its error type and the SQLite implementation

use async_trait::async_trait;
use thiserror::Error;

pub mod sqlite;
pub mod types;

pub use sqlite::SqliteStorage;
pub use types::{MessageRole, Session, SessionFile, SessionStatus, TimelineMessage};

/// SQLite result codes for SQLITE_BUSY and SQLITE_LOCKED, plus their extended variants
const BUSY_CODES: &[&str] = &["5", "6", "261", "262", "517"];

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(String),
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("Sqlx error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Not found: {0}")]
    NotFound(String),
}

impl StorageError {
    /// Whether the failure is transient lock contention that is worth retrying
    pub fn is_busy(&self) -> bool {
        match self {
            StorageError::Sqlx(sqlx::Error::Database(db)) => {
                let code_busy = db
                    .code()
                    .map(|code| BUSY_CODES.contains(&code.as_ref()))
                    .unwrap_or(false);
                code_busy || is_busy_message(db.message())
            }
            StorageError::Sqlx(sqlx::Error::PoolTimedOut) => true,
            StorageError::Database(message) => is_busy_message(message),
            _ => false,
        }
    }
}

fn is_busy_message(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("database is locked") || lower.contains("database is busy")
}

pub type StorageResult<T> = Result<T, StorageError>;

/// At-least-once sink for pipeline state. Every write is an idempotent upsert.
#[async_trait]
pub trait Persistence: Send + Sync {
    async fn upsert_session(&self, session: &Session) -> StorageResult<()>;

    async fn get_session(&self, id: &str) -> StorageResult<Option<Session>>;

    /// All sessions, newest first
    async fn list_sessions(&self) -> StorageResult<Vec<Session>>;

    /// Delete a session together with its messages and files
    async fn delete_session(&self, id: &str) -> StorageResult<()>;

    /// Insert a message or replace the content of an existing one with the same id.
    /// Replacing keeps the message's original position in the timeline.
    async fn upsert_message(&self, message: &TimelineMessage) -> StorageResult<()>;

    /// Messages of a session in timeline order
    async fn list_messages(&self, session_id: &str) -> StorageResult<Vec<TimelineMessage>>;

    async fn save_file(&self, session_id: &str, path: &str, content: &str) -> StorageResult<()>;

    /// Files of a session ordered by path
    async fn list_files(&self, session_id: &str) -> StorageResult<Vec<SessionFile>>;
}
